//! The variant-agnostic backward fixpoint.

use serde::Serialize;
use std::fmt;

use tracing::{debug, info};

use crate::constraint::Constraint;
use crate::container::{ConstraintContainer, ContainerStats};
use crate::trace::Trace;

/// Search statistics reported alongside every verdict.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SearchStats {
    /// Constraints popped from the worklist.
    pub popped: usize,
    /// Constraints that survived subsumption and entered `F`.
    pub inserted: usize,
    /// Longest channel encountered.
    pub longest_channel: usize,
    /// Largest comparable bucket scanned on insertion.
    pub longest_comparable_bucket: usize,
    /// Constraints invalidated by subsumption.
    pub invalidated: usize,
}

impl SearchStats {
    fn absorb(&mut self, c: ContainerStats) {
        self.longest_channel = c.longest_channel;
        self.longest_comparable_bucket = c.longest_comparable_bucket;
        self.invalidated = c.invalidate_count;
    }
}

/// Outcome of a backward reachability run.
#[derive(Debug)]
pub enum ReachResult {
    Reachable { trace: Trace, stats: SearchStats },
    Unreachable { stats: SearchStats },
}

impl ReachResult {
    pub fn is_reachable(&self) -> bool {
        matches!(self, ReachResult::Reachable { .. })
    }

    pub fn stats(&self) -> &SearchStats {
        match self {
            ReachResult::Reachable { stats, .. } => stats,
            ReachResult::Unreachable { stats } => stats,
        }
    }

    pub fn verdict(&self) -> &'static str {
        match self {
            ReachResult::Reachable { .. } => "REACHABLE",
            ReachResult::Unreachable { .. } => "UNREACHABLE",
        }
    }
}

impl fmt::Display for ReachResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReachResult::Reachable { trace, stats } => {
                writeln!(f, "RESULT: REACHABLE")?;
                writeln!(
                    f,
                    "Explored {} constraints ({} subsumed).",
                    stats.popped, stats.invalidated
                )?;
                write!(f, "{trace}")
            }
            ReachResult::Unreachable { stats } => {
                writeln!(f, "RESULT: UNREACHABLE")?;
                write!(
                    f,
                    "Fixpoint after {} constraints ({} subsumed, longest channel {}).",
                    stats.popped, stats.invalidated, stats.longest_channel
                )
            }
        }
    }
}

/// Run the backward fixpoint: seed the bad states, repeatedly pop and
/// expand by the inverse transition relation, stop on an initial
/// constraint (REACHABLE) or an empty worklist (UNREACHABLE).
pub fn reachability<C: Constraint>(common: &C::Common, bad_states: Vec<C>) -> ReachResult {
    let mut container: ConstraintContainer<C> = ConstraintContainer::new();
    let mut stats = SearchStats::default();
    for bad in bad_states {
        if container.insert_root(bad) {
            stats.inserted += 1;
        }
    }
    info!(roots = container.f_size(), "backward reachability started");

    while let Some(idx) = container.pop() {
        stats.popped += 1;
        if stats.popped % 10_000 == 0 {
            debug!(
                popped = stats.popped,
                f_size = container.f_size(),
                q_size = container.q_size(),
                "search progress"
            );
        }
        let constraint = container.get(idx);
        if constraint.is_init_state(common) {
            info!(popped = stats.popped, "initial constraint reached");
            stats.absorb(container.stats());
            let trace = container.clear_and_get_trace(idx, |c| c.render(common));
            return ReachResult::Reachable { trace, stats };
        }
        let predecessors = constraint.pre(common);
        for (transition, pred) in predecessors {
            if container.insert(idx, transition, pred) {
                stats.inserted += 1;
            }
        }
    }

    info!(popped = stats.popped, "worklist exhausted");
    stats.absorb(container.stats());
    ReachResult::Unreachable { stats }
}
