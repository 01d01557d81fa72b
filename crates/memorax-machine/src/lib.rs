pub mod automaton;
pub mod dot;
pub mod lang;
pub mod machine;

pub use automaton::{Automaton, StateId, Transition, TransitionId};
pub use machine::{Machine, MachineError, PTransition, VarInfo};

#[cfg(test)]
mod tests {
    use crate::lang::{Instr, Nml, RExpr};
    use crate::machine::Machine;
    use memorax_dsl::ast::InitValue;

    fn build(src: &str) -> Machine {
        let program = memorax_dsl::parse(src, "test.rmm").expect("parse failed");
        Machine::from_ast(&program, src, "test.rmm").expect("machine build failed")
    }

    const DEKKER: &str = r#"
forbidden CS CS

data
  x = 0 : [0:1]
  y = 0 : [0:1]

process
text
  L0: write: x := 1;
  L1: read: y = 0;
  CS: nop;
  goto L0

process
text
  M0: write: y := 1;
  M1: read: x = 0;
  CS: nop;
  goto M0
"#;

    #[test]
    fn dekker_machine_shape() {
        let m = build(DEKKER);
        assert_eq!(m.proc_count(), 2);
        assert_eq!(m.gvars.len(), 2);
        assert_eq!(m.forbidden.len(), 1);
        // Labels bind to the states before their statements.
        let a0 = &m.automata[0];
        assert_eq!(a0.find_label("L0"), Some(0));
        let cs = a0.find_label("CS").unwrap();
        assert_eq!(m.forbidden[0][0], cs);
        // The write edge leaves the initial state.
        let write = a0.transitions_from(0).next().unwrap();
        assert!(matches!(
            write.instr,
            Instr::Write {
                nml: Nml::Global(0),
                ..
            }
        ));
    }

    #[test]
    fn goto_compiles_to_nop_edge() {
        let m = build(DEKKER);
        let a0 = &m.automata[0];
        let cs = a0.find_label("CS").unwrap();
        let back: Vec<_> = a0
            .transitions_from(a0.transitions_from(cs).next().unwrap().target)
            .collect();
        assert_eq!(back.len(), 1);
        assert_eq!(back[0].instr, Instr::Nop);
        assert_eq!(back[0].target, 0);
    }

    #[test]
    fn wildcard_forbidden_expands() {
        let src = "forbidden * BAD\ndata\n x = 0\nprocess\ntext\n A: nop\nprocess\ntext\n BAD: nop";
        let m = build(src);
        // Every state of P0 is paired with P1's BAD state.
        assert_eq!(m.forbidden.len(), m.automata[0].states.len());
        let bad = m.automata[1].find_label("BAD").unwrap();
        assert!(m.forbidden.iter().all(|t| t[1] == bad));
    }

    #[test]
    fn local_shadows_global() {
        let src = "forbidden A\ndata\n x = 0\nprocess\ndata\n x = 1\ntext\n A: write: x := 5";
        let m = build(src);
        let t = m.automata[0].transitions_from(0).next().unwrap();
        assert!(matches!(
            t.instr,
            Instr::Write {
                nml: Nml::Local { owner: 0, var: 0 },
                ..
            }
        ));
        assert_eq!(m.lvars[0][0].init, InitValue::Int(1));
    }

    #[test]
    fn unknown_goto_target_is_rejected() {
        let src = "forbidden A\nprocess\ntext\n A: goto NOWHERE";
        let program = memorax_dsl::parse(src, "t.rmm").unwrap();
        let err = Machine::from_ast(&program, src, "t.rmm").unwrap_err();
        assert!(err.to_string().contains("NOWHERE"));
    }

    #[test]
    fn build_errors_are_collected_across_processes() {
        // An unknown jump target in P0 and a duplicate label plus an
        // unknown location in P1: all reported together.
        let src = "forbidden A B\nprocess\ntext\n A: goto NOWHERE\nprocess\ntext\n B: nop;\n B: write: ghost := 1";
        let program = memorax_dsl::parse(src, "t.rmm").unwrap();
        let err = Machine::from_ast(&program, src, "t.rmm").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("build errors:"), "message: {msg}");
        assert!(msg.contains("NOWHERE"), "message: {msg}");
        assert!(msg.contains("Duplicate label 'B'"), "message: {msg}");
        assert!(msg.contains("ghost"), "message: {msg}");
    }

    #[test]
    fn syncrd_compiles_to_synchronized_read() {
        let src = "forbidden A\ndata\n x = 0 : [0:1]\nprocess\ntext\n A: syncrd: x = 1";
        let m = build(src);
        let t = m.automata[0].transitions_from(0).next().unwrap();
        match &t.instr {
            Instr::SyncRead { body } => {
                assert!(matches!(
                    body.as_ref(),
                    Instr::ReadAssert {
                        nml: Nml::Global(0),
                        ..
                    }
                ));
            }
            other => panic!("expected a synchronized read, got {other:?}"),
        }
        assert!(m.pretty_string_instr(0, &t.instr).starts_with("syncrd: x = "));
    }

    #[test]
    fn rff_concretizes_registers() {
        let src = r#"
forbidden END

data
  x = 0 : [0:1]

process
registers
  $r = 0 : [0:1]
text
  read: $r := x;
  write: x := $r + 1;
  END: nop
"#;
        let m = build(src);
        let rff = m.remove_registers().expect("rff failed");
        assert!(rff.regs[0].is_empty());
        // Register reads became read-asserts over concrete values.
        let has_assert = rff.automata[0]
            .transitions
            .iter()
            .any(|t| matches!(&t.instr, Instr::ReadAssert { expr: RExpr::Int(_), .. }));
        assert!(has_assert);
        assert!(!rff.forbidden.is_empty());
        // No register statements survive.
        assert!(!rff.automata[0].transitions.iter().any(|t| matches!(
            t.instr,
            Instr::RegAssign { .. } | Instr::ReadAssign { .. }
        )));
    }

    #[test]
    fn nop_chains_are_shortcut() {
        let src = "forbidden END\nprocess\ntext\n A: nop;\n nop;\n nop;\n END: nop";
        let m = build(src).remove_superfluous_nops();
        let end = m.automata[0].find_label("END").unwrap();
        // The first edge now jumps straight to the END state.
        let t = m.automata[0].transitions_from(0).next().unwrap();
        assert_eq!(t.target, end);
    }

    #[test]
    fn dot_output_mentions_processes_and_labels() {
        let m = build(DEKKER);
        let dot = m.to_dot();
        assert!(dot.contains("cluster_p0"));
        assert!(dot.contains("cluster_p1"));
        assert!(dot.contains("doublecircle"));
        assert!(dot.contains("write: x := 1"));
    }
}
