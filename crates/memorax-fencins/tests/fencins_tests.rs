//! Fence insertion end to end over the store-buffering litmus.

use std::collections::BTreeSet;

use memorax_engine::reachability::{reachability, ReachResult};
use memorax_engine::sb::SbCommon;
use memorax_engine::vips::{reachability_vips, VipsCommon};
use memorax_fencins::{
    apply_syncs, fencins, tso_candidates, vips_candidates, FencinsOutcome, MinAspect, Sync,
};
use memorax_machine::lang::{Instr, Nml};
use memorax_machine::Machine;

fn build(src: &str) -> Machine {
    let program = memorax_dsl::parse(src, "test.rmm").expect("parse failed");
    Machine::from_ast(&program, src, "test.rmm").expect("machine build failed")
}

const LITMUS: &str = r#"
forbidden CS CS

data
  x = 0 : [0:1]
  y = 0 : [0:1]

process
text
  L0: write: x := 1;
  L1: read: y = 0;
  CS: nop

process
text
  M0: write: y := 1;
  M1: read: x = 0;
  CS: nop
"#;

fn sb_reach(machine: &Machine) -> ReachResult {
    let common = SbCommon::new(machine.clone());
    reachability(&common, common.bad_states())
}

fn run(aspect: MinAspect, only_one: bool) -> FencinsOutcome {
    let machine = build(LITMUS);
    fencins(&machine, aspect, only_one, sb_reach, tso_candidates)
}

#[test]
fn subset_minimal_sets_fence_both_branches() {
    let outcome = run(MinAspect::Subset, false);
    assert!(!outcome.unsafe_regardless);
    assert!(!outcome.sync_sets.is_empty(), "the litmus is fencable");
    let machine = build(LITMUS);
    for set in &outcome.sync_sets {
        // One synchronization per process, between its write and its
        // read.
        assert_eq!(set.len(), 2, "unexpected set {set:?}");
        let pids: BTreeSet<usize> = set.iter().map(Sync::pid).collect();
        assert_eq!(pids.len(), 2);
        // Every returned set must actually make the program safe.
        let (rewritten, _) = apply_syncs(&machine, set.iter());
        assert!(
            !sb_reach(&rewritten).is_reachable(),
            "returned set does not protect the program: {set:?}"
        );
    }
    // The pure-fence solution is among the subset-minimal ones.
    assert!(outcome
        .sync_sets
        .iter()
        .any(|set| set.iter().all(|s| matches!(s, Sync::Fence { .. }))));
}

#[test]
fn cost_minimal_sets_have_two_syncs() {
    let outcome = run(MinAspect::Cost, false);
    assert!(!outcome.unsafe_regardless);
    assert!(!outcome.sync_sets.is_empty());
    assert!(outcome.sync_sets.iter().all(|s| s.len() == 2));
}

#[test]
fn only_one_stops_after_first_solution() {
    let outcome = run(MinAspect::Subset, true);
    assert_eq!(outcome.sync_sets.len(), 1);
}

#[test]
fn cheap_finds_a_lock_write_set() {
    let outcome = run(MinAspect::Cheap, false);
    assert!(!outcome.unsafe_regardless);
    assert_eq!(outcome.sync_sets.len(), 1);
    let set = &outcome.sync_sets[0];
    assert!(!set.is_empty());
    assert!(set.iter().all(Sync::is_lock_write));
    let machine = build(LITMUS);
    let (rewritten, _) = apply_syncs(&machine, set.iter());
    assert!(!sb_reach(&rewritten).is_reachable());
}

/// A witness that needs a stale cached copy: the atomic write publishes
/// `x` and `f` together, so once `f = 1` is observed, only a copy of
/// `x` fetched before the write can still read 0.
const STALE: &str = r#"
forbidden E0 E1

data
  x = 0 : [0:1]
  f = 0 : [0:1]

process
text
  A: read: f = 1;
  B: read: x = 0;
  E0: nop

process
text
  W: locked { write: x := 1; write: f := 1 };
  E1: nop
"#;

fn vips_reach(machine: &Machine) -> ReachResult {
    let common = VipsCommon::new(machine.clone()).expect("vips context");
    reachability_vips(&common)
}

#[test]
fn vips_stale_read_is_reachable() {
    let machine = build(STALE);
    assert!(vips_reach(&machine).is_reachable());
}

#[test]
fn syncrd_blocks_the_stale_read() {
    let machine = build(STALE);
    let read = machine.automata[0]
        .transitions
        .iter()
        .find(|t| matches!(&t.instr, Instr::ReadAssert { nml: Nml::Global(0), .. }))
        .expect("the x read")
        .clone();
    let sync = Sync::Syncrd {
        pid: 0,
        source: read.source,
        target: read.target,
        nml: Nml::Global(0),
    };
    let (rewritten, _) = apply_syncs(&machine, [&sync]);
    assert!(
        !vips_reach(&rewritten).is_reachable(),
        "a synchronized read must observe the published value"
    );
}

#[test]
fn vips_fencins_offers_a_syncrd_solution() {
    let machine = build(STALE);
    let outcome = fencins(
        &machine,
        MinAspect::Subset,
        false,
        vips_reach,
        vips_candidates,
    );
    assert!(!outcome.unsafe_regardless);
    assert!(!outcome.sync_sets.is_empty(), "the stale read is fencable");
    for set in &outcome.sync_sets {
        let (rewritten, _) = apply_syncs(&machine, set.iter());
        assert!(
            !vips_reach(&rewritten).is_reachable(),
            "returned set does not protect the program: {set:?}"
        );
    }
    // Synchronizing the one stale read suffices on its own; it must be
    // among the subset-minimal solutions.
    assert!(
        outcome
            .sync_sets
            .iter()
            .any(|set| set.len() == 1 && set.iter().all(Sync::is_syncrd)),
        "solutions: {:?}",
        outcome.sync_sets
    );
}

#[test]
fn sequentially_unsafe_program_is_reported_as_unfencable() {
    // The forbidden tuple is reached without any reordering; no fence
    // placement can help.
    let src = r#"
forbidden BAD0 BAD1

data
  x = 0 : [0:1]

process
text
  BAD0: nop

process
text
  BAD1: nop
"#;
    let machine = build(src);
    let outcome = fencins(&machine, MinAspect::Subset, false, sb_reach, tso_candidates);
    assert!(outcome.unsafe_regardless);
    assert!(outcome.sync_sets.is_empty());
}
