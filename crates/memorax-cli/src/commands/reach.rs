use miette::Result;

use memorax_engine::cegar::{pb_cegar, CegarOptions, CegarOutcome};
use memorax_engine::pb::PbCommon;
use memorax_engine::pdual::DualCommon;
use memorax_engine::reachability::{reachability, ReachResult};
use memorax_engine::sb::SbCommon;
use memorax_engine::vips::{reachability_vips, VipsCommon};
use memorax_machine::Machine;

use crate::cli::{Abstraction, Commands};
use crate::commands::helpers::load_machine;

pub(crate) fn run(command: Commands, json: bool) -> Result<()> {
    let Commands::Reach {
        file,
        abstraction,
        k,
        cegar,
        max_refinements,
        rff,
    } = command
    else {
        unreachable!("dispatched on the Reach variant");
    };
    let machine = load_machine(&file, rff)?;

    match abstraction {
        Abstraction::Sb => {
            let common = SbCommon::new(machine.clone());
            let result = reachability(&common, common.bad_states());
            report(&machine, abstraction, &result, json);
        }
        Abstraction::Pdual => {
            let common = DualCommon::new(machine.clone()).map_err(|e| miette::miette!("{e}"))?;
            let result = reachability(&common, common.bad_states());
            report(&machine, abstraction, &result, json);
        }
        Abstraction::Vips => {
            let common = VipsCommon::new(machine.clone()).map_err(|e| miette::miette!("{e}"))?;
            let result = reachability_vips(&common);
            report(&machine, abstraction, &result, json);
        }
        Abstraction::Pb if cegar => {
            let opts = CegarOptions {
                k,
                max_refinements,
            };
            let outcome = pb_cegar(&machine, machine.predicates.clone(), &opts);
            report_cegar(&machine, &outcome, json);
        }
        Abstraction::Pb => {
            let predicates = if machine.predicates.is_empty() {
                println!("Extracting predicates from the program.");
                PbCommon::extract_predicates(&machine)
            } else {
                println!("Using predicates given in the program.");
                machine.predicates.clone()
            };
            let common = PbCommon::new(k, machine.clone(), predicates);
            let result = reachability(&common, common.bad_states());
            report(&machine, abstraction, &result, json);
        }
    }
    Ok(())
}

fn report(machine: &Machine, abstraction: Abstraction, result: &ReachResult, json: bool) {
    if let ReachResult::Reachable { trace, .. } = result {
        println!("\n *** Witness trace ***");
        print!("{}", trace.pretty(machine));
    }
    println!("{result}");
    if json {
        let trace_summary = match result {
            ReachResult::Reachable { trace, .. } => Some(trace.summary()),
            ReachResult::Unreachable { .. } => None,
        };
        let line = serde_json::json!({
            "command": "reach",
            "abstraction": abstraction.name(),
            "verdict": result.verdict(),
            "stats": result.stats(),
            "trace": trace_summary,
        });
        println!("{line}");
    }
}

fn report_cegar(machine: &Machine, outcome: &CegarOutcome, json: bool) {
    match outcome {
        CegarOutcome::Reachable {
            trace,
            refinements_used,
            ..
        } => {
            println!("\n *** Witness trace ***");
            print!("{}", trace.pretty(machine));
            println!("RESULT: REACHABLE (after {refinements_used} refinements)");
        }
        CegarOutcome::Unreachable {
            refinements_used, ..
        } => {
            println!("RESULT: UNREACHABLE (after {refinements_used} refinements)");
        }
        CegarOutcome::BudgetExhausted {
            refinements_used, ..
        } => {
            println!("RESULT: REFINEMENT_BUDGET_EXHAUSTED (after {refinements_used} refinements)");
        }
    }
    if json {
        let line = serde_json::json!({
            "command": "reach",
            "abstraction": "pb",
            "cegar": true,
            "verdict": outcome.verdict(),
            "predicates": outcome.predicates().len(),
        });
        println!("{line}");
    }
}
