//! Synchronization placements and their application to a machine.

use std::collections::BTreeSet;
use std::fmt;

use memorax_machine::lang::{Instr, Nml};
use memorax_machine::{Machine, StateId};

/// A memory-ordering synchronization: a fence inserted at a control
/// state, a plain write converted into a locked write, or a plain read
/// converted into a synchronized (`syncrd`) read — cheaper than a full
/// fence, it only forces the one read to observe a fresh copy.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Sync {
    Fence { pid: usize, state: StateId },
    LockWrite {
        pid: usize,
        source: StateId,
        target: StateId,
        nml: Nml,
    },
    Syncrd {
        pid: usize,
        source: StateId,
        target: StateId,
        nml: Nml,
    },
}

impl Sync {
    pub fn pid(&self) -> usize {
        match self {
            Sync::Fence { pid, .. }
            | Sync::LockWrite { pid, .. }
            | Sync::Syncrd { pid, .. } => *pid,
        }
    }

    pub fn is_lock_write(&self) -> bool {
        matches!(self, Sync::LockWrite { .. })
    }

    pub fn is_syncrd(&self) -> bool {
        matches!(self, Sync::Syncrd { .. })
    }

    pub fn pretty(&self, machine: &Machine) -> String {
        match self {
            Sync::Fence { pid, state } => format!(
                "fence at P{pid}:{}",
                machine.automata[*pid].state_name(*state)
            ),
            Sync::LockWrite {
                pid,
                source,
                nml,
                ..
            } => format!(
                "lock write of {} at P{pid}:{}",
                machine.pretty_string_nml(*nml),
                machine.automata[*pid].state_name(*source)
            ),
            Sync::Syncrd {
                pid,
                source,
                nml,
                ..
            } => format!(
                "synchronize read of {} at P{pid}:{}",
                machine.pretty_string_nml(*nml),
                machine.automata[*pid].state_name(*source)
            ),
        }
    }
}

impl fmt::Display for Sync {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sync::Fence { pid, state } => write!(f, "fence(P{pid}, q{state})"),
            Sync::LockWrite {
                pid, source, nml, ..
            } => write!(f, "lock(P{pid}, q{source}, {nml})"),
            Sync::Syncrd {
                pid, source, nml, ..
            } => write!(f, "syncrd(P{pid}, q{source}, {nml})"),
        }
    }
}

/// Maps control states of a rewritten machine back to the states of the
/// machine the syncs were formulated against.
#[derive(Debug, Clone)]
pub struct StateMap {
    per_pid: Vec<Vec<StateId>>,
}

impl StateMap {
    pub fn original(&self, pid: usize, state: StateId) -> StateId {
        self.per_pid[pid][state]
    }

    pub fn map_sync(&self, sync: Sync) -> Sync {
        match sync {
            Sync::Fence { pid, state } => Sync::Fence {
                pid,
                state: self.original(pid, state),
            },
            Sync::LockWrite {
                pid,
                source,
                target,
                nml,
            } => Sync::LockWrite {
                pid,
                source: self.original(pid, source),
                target: self.original(pid, target),
                nml,
            },
            Sync::Syncrd {
                pid,
                source,
                target,
                nml,
            } => Sync::Syncrd {
                pid,
                source: self.original(pid, source),
                target: self.original(pid, target),
                nml,
            },
        }
    }
}

/// Apply a set of synchronizations, producing the rewritten machine and
/// the state map back to the input machine. Transition rewrites (lock
/// and syncrd conversions) are applied before fences so that their
/// transition coordinates stay valid.
pub fn apply_syncs<'a>(
    machine: &Machine,
    syncs: impl IntoIterator<Item = &'a Sync>,
) -> (Machine, StateMap) {
    let mut m = machine.clone();
    let mut map = StateMap {
        per_pid: m
            .automata
            .iter()
            .map(|aut| (0..aut.states.len()).collect())
            .collect(),
    };

    let syncs: BTreeSet<&Sync> = syncs.into_iter().collect();
    for sync in syncs.iter() {
        match sync {
            Sync::LockWrite {
                pid,
                source,
                target,
                nml,
            } => {
                let aut = &mut m.automata[*pid];
                for t in aut.transitions.iter_mut() {
                    let is_write = matches!(&t.instr, Instr::Write { nml: n, .. } if n == nml);
                    if t.source == *source && t.target == *target && is_write {
                        let body = vec![t.instr.clone()];
                        t.instr = Instr::Locked {
                            body,
                            store_only: false,
                        };
                    }
                }
            }
            Sync::Syncrd {
                pid,
                source,
                target,
                nml,
            } => {
                let aut = &mut m.automata[*pid];
                for t in aut.transitions.iter_mut() {
                    let is_read = matches!(
                        &t.instr,
                        Instr::ReadAssert { nml: n, .. } | Instr::ReadAssign { nml: n, .. }
                            if n == nml
                    );
                    if t.source == *source && t.target == *target && is_read {
                        t.instr = Instr::SyncRead {
                            body: Box::new(t.instr.clone()),
                        };
                    }
                }
            }
            Sync::Fence { .. } => {}
        }
    }
    for sync in syncs.iter() {
        if let Sync::Fence { pid, state } = sync {
            let aut = &mut m.automata[*pid];
            let split = aut.add_state();
            let split_val = map.per_pid[*pid][*state];
            map.per_pid[*pid].push(split_val);
            let moved = std::mem::take(&mut aut.states[*state].fwd_transitions);
            for tid in &moved {
                aut.transitions[*tid].source = split;
            }
            aut.states[split].fwd_transitions = moved;
            aut.add_transition(*state, Instr::Fence, split);
        }
    }
    (m, map)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(src: &str) -> Machine {
        let program = memorax_dsl::parse(src, "test.rmm").unwrap();
        Machine::from_ast(&program, src, "test.rmm").unwrap()
    }

    const SRC: &str = "forbidden E A\ndata\n x = 0\nprocess\ntext\n W: write: x := 1;\n E: nop\nprocess\ntext\n A: nop";

    #[test]
    fn fence_splits_the_state() {
        let m = build(SRC);
        let states_before = m.automata[0].states.len();
        let sync = Sync::Fence { pid: 0, state: 2 };
        let (m2, map) = apply_syncs(&m, [&sync]);
        assert_eq!(m2.automata[0].states.len(), states_before + 1);
        // The fence edge leaves the original state; the old outgoing
        // edges moved to the split state.
        let fence = m2.automata[0].transitions_from(2).next().unwrap();
        assert_eq!(fence.instr, Instr::Fence);
        assert_eq!(map.original(0, fence.target), 2);
    }

    #[test]
    fn syncrd_wraps_the_read() {
        let src = "forbidden E A\ndata\n x = 0\nprocess\ntext\n R: read: x = 0;\n E: nop\nprocess\ntext\n A: nop";
        let m = build(src);
        let read = m.automata[0]
            .transitions
            .iter()
            .find(|t| matches!(t.instr, Instr::ReadAssert { .. }))
            .unwrap()
            .clone();
        let Instr::ReadAssert { nml, .. } = read.instr else {
            unreachable!("matched above");
        };
        let sync = Sync::Syncrd {
            pid: 0,
            source: read.source,
            target: read.target,
            nml,
        };
        let (m2, _) = apply_syncs(&m, [&sync]);
        assert!(m2.automata[0].transitions.iter().any(|t| matches!(
            &t.instr,
            Instr::SyncRead { body } if matches!(body.as_ref(), Instr::ReadAssert { .. })
        )));
        assert!(!m2.automata[0]
            .transitions
            .iter()
            .any(|t| matches!(t.instr, Instr::ReadAssert { .. })));
    }

    #[test]
    fn lock_write_wraps_the_instruction() {
        let m = build(SRC);
        let write = m.automata[0]
            .transitions
            .iter()
            .find(|t| matches!(t.instr, Instr::Write { .. }))
            .unwrap()
            .clone();
        let sync = Sync::LockWrite {
            pid: 0,
            source: write.source,
            target: write.target,
            nml: write.instr.buffered_write_nml().unwrap(),
        };
        let (m2, _) = apply_syncs(&m, [&sync]);
        assert!(m2.automata[0]
            .transitions
            .iter()
            .any(|t| matches!(&t.instr, Instr::Locked { body, .. } if body.len() == 1)));
        assert!(!m2.automata[0]
            .transitions
            .iter()
            .any(|t| matches!(t.instr, Instr::Write { .. })));
    }
}
