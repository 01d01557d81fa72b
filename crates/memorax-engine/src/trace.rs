use serde::Serialize;
use std::fmt;

use memorax_machine::{Machine, PTransition};

/// One step of a witness trace: the forward transition taken to get
/// here (`None` for the initial configuration) and a rendering of the
/// symbolic configuration reached.
#[derive(Debug, Clone)]
pub struct TraceStep {
    pub transition: Option<PTransition>,
    pub constraint: String,
}

/// A witness execution from an initial configuration into a forbidden
/// one, in forward order.
#[derive(Debug, Clone, Default)]
pub struct Trace {
    pub steps: Vec<TraceStep>,
}

impl Trace {
    pub fn len(&self) -> usize {
        self.steps.len().saturating_sub(1)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn transitions(&self) -> impl Iterator<Item = &PTransition> {
        self.steps.iter().filter_map(|s| s.transition.as_ref())
    }

    /// Render with the machine's pretty names.
    pub fn pretty(&self, machine: &Machine) -> String {
        use fmt::Write as _;
        let mut out = String::new();
        for (i, step) in self.steps.iter().enumerate() {
            if let Some(t) = &step.transition {
                let _ = writeln!(out, "{:3}: {}", i, machine.pretty_string_transition(t));
            } else {
                let _ = writeln!(out, "{i:3}: (initial)");
            }
        }
        out
    }

    /// Compact machine-readable summary of the transition sequence.
    pub fn summary(&self) -> Vec<TraceSummaryStep> {
        self.steps
            .iter()
            .enumerate()
            .map(|(i, step)| TraceSummaryStep {
                step: i,
                pid: step.transition.as_ref().map(|t| t.pid),
                instr: step
                    .transition
                    .as_ref()
                    .map(|t| t.instr.to_string())
                    .unwrap_or_else(|| "initial".to_owned()),
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TraceSummaryStep {
    pub step: usize,
    pub pid: Option<usize>,
    pub instr: String,
}

impl fmt::Display for Trace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Witness trace:")?;
        for (i, step) in self.steps.iter().enumerate() {
            match &step.transition {
                Some(t) => writeln!(f, "  {i:3}: {t}")?,
                None => writeln!(f, "  {i:3}: (initial)")?,
            }
            writeln!(f, "       {}", step.constraint.replace('\n', "\n       "))?;
        }
        Ok(())
    }
}
