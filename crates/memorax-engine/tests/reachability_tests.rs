//! End-to-end engine scenarios over small .rmm programs.

use memorax_engine::cegar::{pb_cegar, CegarOptions, CegarOutcome};
use memorax_engine::pdual::DualCommon;
use memorax_engine::reachability::{reachability, ReachResult};
use memorax_engine::sb::SbCommon;
use memorax_engine::vips::{reachability_vips, VipsCommon};
use memorax_machine::Machine;

fn build(src: &str) -> Machine {
    let program = memorax_dsl::parse(src, "test.rmm").expect("parse failed");
    Machine::from_ast(&program, src, "test.rmm").expect("machine build failed")
}

/// The store-buffering litmus: both processes buffer their writes and
/// read the other's stale cell.
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

const LITMUS_FENCED: &str = r#"
forbidden CS CS

data
  x = 0 : [0:1]
  y = 0 : [0:1]

process
text
  L0: write: x := 1;
  F0: fence;
  L1: read: y = 0;
  CS: nop

process
text
  M0: write: y := 1;
  F1: fence;
  M1: read: x = 0;
  CS: nop
"#;

#[test]
fn sb_litmus_is_reachable() {
    let machine = build(LITMUS);
    let common = SbCommon::new(machine);
    let result = reachability(&common, common.bad_states());
    match &result {
        ReachResult::Reachable { trace, .. } => {
            // The witness must buffer at least one write.
            assert!(trace
                .transitions()
                .any(|t| matches!(t.instr, memorax_machine::lang::Instr::Write { .. })));
        }
        other => panic!("expected REACHABLE, got {other}"),
    }
}

#[test]
fn sb_fenced_litmus_is_unreachable() {
    let machine = build(LITMUS_FENCED);
    let common = SbCommon::new(machine);
    let result = reachability(&common, common.bad_states());
    assert!(
        !result.is_reachable(),
        "fences must restore sequential behavior: {result}"
    );
}

#[test]
fn sb_flushed_write_before_fence_is_reachable() {
    // The write must propagate before the fence; the other process then
    // observes the new value.
    let src = r#"
forbidden E0 E1

data
  x = 0 : [0:1]

process
text
  W: write: x := 1;
  F: fence;
  E0: nop

process
text
  R: read: x = 1;
  E1: nop
"#;
    let machine = build(src);
    let common = SbCommon::new(machine);
    let result = reachability(&common, common.bad_states());
    assert!(result.is_reachable(), "expected REACHABLE, got {result}");
}

#[test]
fn purely_local_program_has_no_worklist_activity() {
    // The forbidden state sits on no path; there are no shared writes,
    // so the roots have no predecessors at all.
    let src = r#"
forbidden BAD END

process
text
  A: nop;
  goto A;
  BAD: nop

process
text
  END: nop
"#;
    let machine = build(src);
    let common = SbCommon::new(machine);
    let result = reachability(&common, common.bad_states());
    match &result {
        ReachResult::Unreachable { stats } => {
            assert_eq!(stats.popped, 1, "only the root should be explored");
        }
        other => panic!("expected UNREACHABLE, got {other}"),
    }
}

#[test]
fn pdual_litmus_is_reachable() {
    let machine = build(LITMUS);
    let common = DualCommon::new(machine).expect("pdual context");
    let result = reachability(&common, common.bad_states());
    assert!(result.is_reachable(), "expected REACHABLE, got {result}");
}

#[test]
fn pdual_fenced_litmus_is_unreachable() {
    let machine = build(LITMUS_FENCED);
    let common = DualCommon::new(machine).expect("pdual context");
    let result = reachability(&common, common.bad_states());
    assert!(!result.is_reachable(), "expected UNREACHABLE, got {result}");
}

#[test]
fn pdual_rejects_multi_location_locked_writes() {
    let src = r#"
forbidden A B

data
  x = 0 : [0:1]
  y = 0 : [0:1]

process
text
  A: locked { write: x := 1; write: y := 1 }

process
text
  B: nop
"#;
    let machine = build(src);
    let err = DualCommon::new(machine).unwrap_err();
    assert!(err.to_string().contains("Unsupported combination"));
}

#[test]
fn vips_litmus_is_reachable() {
    let machine = build(LITMUS);
    let common = VipsCommon::new(machine).expect("vips context");
    let result = reachability_vips(&common);
    assert!(result.is_reachable(), "expected REACHABLE, got {result}");
}

#[test]
fn vips_fenced_litmus_is_unreachable() {
    let machine = build(LITMUS_FENCED);
    let common = VipsCommon::new(machine).expect("vips context");
    let result = reachability_vips(&common);
    assert!(!result.is_reachable(), "expected UNREACHABLE, got {result}");
}

#[test]
fn vips_needs_finite_domains() {
    let src = "forbidden A B\ndata\n x = 0\nprocess\ntext\n A: write: x := 1\nprocess\ntext\n B: nop";
    let machine = build(src);
    assert!(VipsCommon::new(machine).is_err());
}

/// A program whose pb abstraction produces a spurious witness: the same
/// cell must be observed with two different values although only one
/// write exists.
const SPURIOUS: &str = r#"
forbidden E0 E1

data
  x = 0 : [0:1]

process
text
  A: write: x := 1;
  E0: nop

process
text
  B: read: x = 1;
  C: read: x = 0;
  E1: nop
"#;

#[test]
fn pb_cegar_budget_zero_reports_exhaustion() {
    let machine = build(SPURIOUS);
    let opts = CegarOptions {
        k: 1,
        max_refinements: Some(0),
    };
    match pb_cegar(&machine, Vec::new(), &opts) {
        CegarOutcome::BudgetExhausted {
            refinements_used,
            predicates,
        } => {
            assert_eq!(refinements_used, 0);
            assert!(predicates.is_empty(), "no refinement may happen at budget 0");
        }
        other => panic!("expected REFINEMENT_BUDGET_EXHAUSTED, got {}", other.verdict()),
    }
}

#[test]
fn pb_cegar_refines_and_concludes_unreachable() {
    let machine = build(SPURIOUS);
    let opts = CegarOptions {
        k: 1,
        max_refinements: Some(3),
    };
    match pb_cegar(&machine, Vec::new(), &opts) {
        CegarOutcome::Unreachable {
            refinements_used,
            predicates,
        } => {
            assert!(refinements_used >= 1, "at least one refinement expected");
            assert!(!predicates.is_empty(), "predicates must have been learned");
        }
        other => panic!("expected UNREACHABLE, got {}", other.verdict()),
    }
}

#[test]
fn pb_cegar_accepts_feasible_witness() {
    // Genuinely reachable under TSO; the first feasible witness must be
    // accepted as-is.
    let machine = build(LITMUS);
    let opts = CegarOptions {
        k: 2,
        max_refinements: Some(4),
    };
    match pb_cegar(&machine, Vec::new(), &opts) {
        CegarOutcome::Reachable { trace, .. } => {
            assert!(trace.len() > 0);
        }
        other => panic!("expected REACHABLE, got {}", other.verdict()),
    }
}

#[test]
fn pb_predicates_grow_monotonically() {
    let machine = build(SPURIOUS);
    let initial = memorax_engine::pb::PbCommon::extract_predicates(&machine);
    let opts = CegarOptions {
        k: 1,
        max_refinements: Some(3),
    };
    let outcome = pb_cegar(&machine, initial.clone(), &opts);
    let final_preds = outcome.predicates();
    for pred in &initial {
        assert!(
            final_preds.contains(pred),
            "refinement must never drop a predicate"
        );
    }
}
