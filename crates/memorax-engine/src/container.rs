//! The constraint container: the set `F` of live constraints and the
//! worklist `Q`, with subsumption on insertion.
//!
//! Constraints live in an arena of records with stable indices.
//! Invalidation flips a bit; nothing is freed until the container is
//! cleared, so trace-reconstruction walks over parent links stay valid.
//! `F` is bucketed by `(pcs, characterization)`: constraints in
//! different buckets are never comparable and are never compared.

use std::collections::{HashMap, VecDeque};

use memorax_machine::{PTransition, StateId};
use tracing::debug;

use crate::constraint::{Characterization, Constraint};
use crate::trace::{Trace, TraceStep};
use crate::zstar::Comparison;

/// Whether subsumption recursively invalidates the descendants of a
/// subsumed constraint.
const USE_GENEALOGY: bool = true;

#[derive(Debug)]
struct Record<C> {
    constraint: C,
    /// Arena index of the parent; `None` for roots.
    parent: Option<usize>,
    /// Forward transition from this constraint into its parent.
    transition: Option<PTransition>,
    /// Children indices; maintained only when genealogy is on.
    children: Vec<usize>,
    valid: bool,
    in_queue: bool,
}

/// A bank of FIFO ticket queues indexed by channel length; `pop` scans
/// from the shortest non-empty bank. Tickets are arena indices;
/// invalidated tickets are skipped on pop.
#[derive(Debug, Default)]
struct ChannelPrioQueue {
    queues: Vec<VecDeque<usize>>,
}

impl ChannelPrioQueue {
    fn push(&mut self, chan_len: usize, idx: usize) {
        if self.queues.len() <= chan_len {
            self.queues.resize_with(chan_len + 1, VecDeque::new);
        }
        self.queues[chan_len].push_back(idx);
    }
}

/// Search statistics, reported when the fixpoint completes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContainerStats {
    pub longest_channel: usize,
    pub longest_comparable_bucket: usize,
    pub invalidate_count: usize,
}

pub struct ConstraintContainer<C: Constraint> {
    arena: Vec<Record<C>>,
    f: HashMap<(Vec<StateId>, Characterization), Vec<usize>>,
    q: ChannelPrioQueue,
    f_size: usize,
    q_size: usize,
    stats: ContainerStats,
}

impl<C: Constraint> Default for ConstraintContainer<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Constraint> ConstraintContainer<C> {
    pub fn new() -> Self {
        ConstraintContainer {
            arena: Vec::new(),
            f: HashMap::new(),
            q: ChannelPrioQueue::default(),
            f_size: 0,
            q_size: 0,
            stats: ContainerStats::default(),
        }
    }

    pub fn f_size(&self) -> usize {
        self.f_size
    }

    pub fn q_size(&self) -> usize {
        self.q_size
    }

    pub fn stats(&self) -> ContainerStats {
        self.stats
    }

    pub fn get(&self, idx: usize) -> &C {
        &self.arena[idx].constraint
    }

    /// Seed a bad state.
    pub fn insert_root(&mut self, c: C) -> bool {
        self.insert_impl(None, None, c)
    }

    /// Register that `parent --t--> child` under the inverse relation;
    /// the child becomes a candidate for `F` and `Q`. Returns whether
    /// the child survived subsumption.
    pub fn insert(&mut self, parent: usize, t: PTransition, child: C) -> bool {
        self.insert_impl(Some(parent), Some(t), child)
    }

    fn insert_impl(&mut self, parent: Option<usize>, t: Option<PTransition>, c: C) -> bool {
        let key = (c.pcs().to_vec(), c.characterization());
        let bucket = self.f.entry(key).or_default();
        bucket.retain(|i| self.arena[*i].valid);
        self.stats.longest_comparable_bucket =
            self.stats.longest_comparable_bucket.max(bucket.len());

        let mut subsumed = Vec::new();
        for &i in bucket.iter() {
            match self.arena[i].constraint.entailment_compare(&c) {
                Comparison::Less | Comparison::Equal => return false,
                Comparison::Greater => subsumed.push(i),
                Comparison::Incomparable => {}
            }
        }

        // Invalidate before the new record is linked into the genealogy:
        // the newcomer may subsume its own ancestors, and must not be
        // swept away as their descendant.
        for i in subsumed {
            self.invalidate(i);
        }

        let idx = self.arena.len();
        let key = (c.pcs().to_vec(), c.characterization());
        let chan_len = c.channel_length();
        self.arena.push(Record {
            constraint: c,
            parent,
            transition: t,
            children: Vec::new(),
            valid: true,
            in_queue: true,
        });
        if USE_GENEALOGY {
            if let Some(p) = parent {
                self.arena[p].children.push(idx);
            }
        }
        let bucket = self.f.entry(key).or_default();
        bucket.push(idx);
        self.f_size += 1;
        self.q_size += 1;
        self.stats.longest_channel = self.stats.longest_channel.max(chan_len);
        self.q.push(chan_len, idx);
        true
    }

    /// Mark a record invalid and drop it from `Q`; with genealogy on,
    /// recursively do the same for all of its descendants.
    fn invalidate(&mut self, idx: usize) {
        let mut stack = vec![idx];
        while let Some(i) = stack.pop() {
            let record = &mut self.arena[i];
            if !record.valid {
                continue;
            }
            record.valid = false;
            self.f_size -= 1;
            self.stats.invalidate_count += 1;
            if record.in_queue {
                record.in_queue = false;
                self.q_size -= 1;
            }
            if USE_GENEALOGY {
                stack.extend(record.children.iter().copied());
            }
        }
    }

    /// Remove and return (the index of) a constraint from `Q`, giving
    /// priority to shorter channels; FIFO within one length bank.
    pub fn pop(&mut self) -> Option<usize> {
        for queue in self.q.queues.iter_mut() {
            while let Some(idx) = queue.pop_front() {
                let record = &mut self.arena[idx];
                if record.valid && record.in_queue {
                    record.in_queue = false;
                    self.q_size -= 1;
                    return Some(idx);
                }
            }
        }
        None
    }

    /// Reconstruct the witness trace ending in `idx` (an initial-state
    /// constraint) by walking parent links up to a root, then drop all
    /// state.
    pub fn clear_and_get_trace(
        self,
        idx: usize,
        render: impl Fn(&C) -> String,
    ) -> Trace {
        debug!(
            longest_channel = self.stats.longest_channel,
            longest_bucket = self.stats.longest_comparable_bucket,
            invalidated = self.stats.invalidate_count,
            "container cleared"
        );
        // The walk starts at the initial constraint and ends at the bad
        // root, which is already forward execution order; each record's
        // transition enters the next step of the trace.
        let mut steps = Vec::new();
        let mut cur = Some(idx);
        let mut transition: Option<PTransition> = None;
        while let Some(i) = cur {
            let record = &self.arena[i];
            steps.push(TraceStep {
                transition: transition.take(),
                constraint: render(&record.constraint),
            });
            transition = record.transition.clone();
            cur = record.parent;
        }
        Trace { steps }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constraint::Characterization;
    use memorax_machine::lang::Instr;

    /// A miniature constraint for exercising container mechanics:
    /// ordered by a single level (smaller = more general) plus a channel
    /// length that drives the priority banks.
    #[derive(Debug, Clone, PartialEq)]
    struct Toy {
        pcs: Vec<StateId>,
        level: u32,
        chan: usize,
    }

    impl Constraint for Toy {
        type Common = ();

        fn is_init_state(&self, _: &()) -> bool {
            false
        }

        fn entailment_compare(&self, other: &Self) -> Comparison {
            if self.pcs != other.pcs {
                return Comparison::Incomparable;
            }
            match self.level.cmp(&other.level) {
                std::cmp::Ordering::Less => Comparison::Less,
                std::cmp::Ordering::Equal => Comparison::Equal,
                std::cmp::Ordering::Greater => Comparison::Greater,
            }
        }

        fn characterization(&self) -> Characterization {
            Vec::new()
        }

        fn pcs(&self) -> &[StateId] {
            &self.pcs
        }

        fn channel_length(&self) -> usize {
            self.chan
        }

        fn pre(&self, _: &()) -> Vec<(PTransition, Self)> {
            Vec::new()
        }

        fn render(&self, _: &()) -> String {
            format!("{self:?}")
        }
    }

    fn toy(pc: StateId, level: u32, chan: usize) -> Toy {
        Toy {
            pcs: vec![pc],
            level,
            chan,
        }
    }

    fn step() -> PTransition {
        PTransition {
            pid: 0,
            source: 0,
            instr: Instr::Nop,
            target: 0,
        }
    }

    #[test]
    fn more_general_constraint_subsumes() {
        let mut cont: ConstraintContainer<Toy> = ConstraintContainer::new();
        assert!(cont.insert_root(toy(0, 2, 0)));
        // A more specific sibling is dropped outright.
        assert!(!cont.insert_root(toy(0, 3, 0)));
        assert_eq!(cont.f_size(), 1);
        // A more general one replaces the existing constraint.
        assert!(cont.insert_root(toy(0, 1, 0)));
        assert_eq!(cont.f_size(), 1);
        assert_eq!(cont.stats().invalidate_count, 1);
    }

    #[test]
    fn different_pcs_never_interact() {
        let mut cont: ConstraintContainer<Toy> = ConstraintContainer::new();
        assert!(cont.insert_root(toy(0, 1, 0)));
        assert!(cont.insert_root(toy(1, 5, 0)));
        assert_eq!(cont.f_size(), 2);
    }

    #[test]
    fn pop_prefers_shorter_channels_then_fifo() {
        let mut cont: ConstraintContainer<Toy> = ConstraintContainer::new();
        cont.insert_root(toy(0, 1, 2));
        cont.insert_root(toy(1, 1, 0));
        cont.insert_root(toy(2, 1, 0));
        cont.insert_root(toy(3, 1, 1));
        let mut order = Vec::new();
        while let Some(i) = cont.pop() {
            order.push(cont.get(i).pcs[0]);
        }
        assert_eq!(order, vec![1, 2, 3, 0]);
        assert_eq!(cont.q_size(), 0);
    }

    #[test]
    fn invalidated_entries_are_skipped_on_pop() {
        let mut cont: ConstraintContainer<Toy> = ConstraintContainer::new();
        cont.insert_root(toy(0, 2, 0));
        cont.insert_root(toy(0, 1, 0)); // invalidates the first
        let popped = cont.pop().unwrap();
        assert_eq!(cont.get(popped).level, 1);
        assert!(cont.pop().is_none());
    }

    #[test]
    fn genealogy_invalidates_descendants() {
        let mut cont: ConstraintContainer<Toy> = ConstraintContainer::new();
        cont.insert_root(toy(0, 2, 0));
        let root = cont.pop().unwrap();
        cont.insert(root, step(), toy(1, 2, 0));
        let child = cont.pop().unwrap();
        cont.insert(child, step(), toy(2, 2, 0));
        assert_eq!(cont.f_size(), 3);
        // A more general constraint at the root's pcs kills the root and,
        // through genealogy, its whole progeny.
        cont.insert_root(toy(0, 1, 0));
        assert_eq!(cont.f_size(), 1);
        assert_eq!(cont.stats().invalidate_count, 3);
    }

    #[test]
    fn trace_reconstruction_walks_parents() {
        let mut cont: ConstraintContainer<Toy> = ConstraintContainer::new();
        cont.insert_root(toy(5, 1, 0));
        let root = cont.pop().unwrap();
        cont.insert(root, step(), toy(4, 1, 0));
        let mid = cont.pop().unwrap();
        cont.insert(mid, step(), toy(3, 1, 0));
        let last = cont.pop().unwrap();
        let trace = cont.clear_and_get_trace(last, |c| format!("pc{}", c.pcs[0]));
        assert_eq!(trace.steps.len(), 3);
        assert_eq!(trace.steps[0].constraint, "pc3");
        assert!(trace.steps[0].transition.is_none());
        assert!(trace.steps[1].transition.is_some());
        assert_eq!(trace.steps[2].constraint, "pc5");
    }
}
