use indexmap::IndexMap;
use std::fmt;

use crate::lang::Instr;

/// A unique identifier for a control state within one process.
pub type StateId = usize;
/// A unique identifier for a transition within one process.
pub type TransitionId = usize;

/// One control-flow edge.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub source: StateId,
    pub instr: Instr,
    pub target: StateId,
}

/// A control state; transitions are stored per automaton and indexed here.
#[derive(Debug, Clone, Default)]
pub struct State {
    pub fwd_transitions: Vec<TransitionId>,
}

/// The control-flow automaton of one process. State 0 is initial.
#[derive(Debug, Clone, Default)]
pub struct Automaton {
    pub states: Vec<State>,
    pub transitions: Vec<Transition>,
    /// Label name -> state, in declaration order.
    pub labels: IndexMap<String, StateId>,
}

impl Automaton {
    pub fn add_state(&mut self) -> StateId {
        let id = self.states.len();
        self.states.push(State::default());
        id
    }

    pub fn add_transition(&mut self, source: StateId, instr: Instr, target: StateId) -> TransitionId {
        let id = self.transitions.len();
        self.transitions.push(Transition {
            source,
            instr,
            target,
        });
        self.states[source].fwd_transitions.push(id);
        id
    }

    pub fn find_label(&self, name: &str) -> Option<StateId> {
        self.labels.get(name).copied()
    }

    /// Display name of a state: its first label if any, `q<i>` otherwise.
    pub fn state_name(&self, state: StateId) -> String {
        self.labels
            .iter()
            .find(|(_, s)| **s == state)
            .map(|(name, _)| name.clone())
            .unwrap_or_else(|| format!("q{state}"))
    }

    pub fn get_states(&self) -> &[State] {
        &self.states
    }

    pub fn transitions_from(&self, state: StateId) -> impl Iterator<Item = &Transition> {
        self.states[state]
            .fwd_transitions
            .iter()
            .map(move |t| &self.transitions[*t])
    }

    pub fn transitions_into(&self, state: StateId) -> impl Iterator<Item = &Transition> {
        self.transitions.iter().filter(move |t| t.target == state)
    }
}

impl fmt::Display for Automaton {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, _) in self.states.iter().enumerate() {
            writeln!(f, "  {}:", self.state_name(i))?;
            for t in self.transitions_from(i) {
                writeln!(f, "    {} -> {}", t.instr, self.state_name(t.target))?;
            }
        }
        Ok(())
    }
}
