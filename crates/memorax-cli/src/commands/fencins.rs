use std::cell::Cell;

use miette::Result;

use memorax_engine::cegar::{pb_cegar, CegarOptions, CegarOutcome};
use memorax_engine::pb::PbCommon;
use memorax_engine::pdual::DualCommon;
use memorax_engine::reachability::{reachability, ReachResult, SearchStats};
use memorax_engine::sb::SbCommon;
use memorax_engine::vips::{reachability_vips, VipsCommon};
use memorax_machine::Machine;

use memorax_fencins::{fencins, tso_candidates, vips_candidates, FencinsOutcome, MinAspect};

use crate::cli::{Abstraction, Commands, FMin};
use crate::commands::helpers::load_machine;

pub(crate) fn run(command: Commands, json: bool) -> Result<()> {
    let Commands::Fencins {
        file,
        abstraction,
        fmin,
        only_one,
        k,
        cegar,
        max_refinements,
        rff,
    } = command
    else {
        unreachable!("dispatched on the Fencins variant");
    };
    let machine = load_machine(&file, rff)?;

    let fmin = fmin.unwrap_or(match abstraction {
        Abstraction::Vips => FMin::Subset,
        _ => FMin::Cheap,
    });
    if abstraction == Abstraction::Vips && fmin == FMin::Cheap {
        return Err(miette::miette!(
            "Unsupported combination: the cheap minimality criterion needs locked \
             writes, which the vips abstraction does not analyze"
        ));
    }
    let aspect = match fmin {
        FMin::Cheap => {
            println!("Searching for cheap synchronization sets.");
            MinAspect::Cheap
        }
        FMin::Subset => {
            println!("Searching for subset minimal synchronization sets.");
            MinAspect::Subset
        }
        FMin::Cost => {
            println!("Searching for cost minimal synchronization sets.");
            MinAspect::Cost
        }
    };

    let budget_exhausted = Cell::new(false);
    let outcome = match abstraction {
        Abstraction::Sb => fencins(
            &machine,
            aspect,
            only_one,
            |m| {
                let common = SbCommon::new(m.clone());
                reachability(&common, common.bad_states())
            },
            tso_candidates,
        ),
        Abstraction::Pdual => {
            // Surface the unsupported-machine case before the loop; the
            // rewritten machines only ever add fences and single-location
            // locked writes.
            DualCommon::new(machine.clone()).map_err(|e| miette::miette!("{e}"))?;
            fencins(
                &machine,
                aspect,
                only_one,
                |m| {
                    let common = DualCommon::new(m.clone())
                        .unwrap_or_else(|_| unreachable!("syncs keep locked writes single-location"));
                    reachability(&common, common.bad_states())
                },
                tso_candidates,
            )
        }
        Abstraction::Pb => {
            let predicates = if machine.predicates.is_empty() {
                PbCommon::extract_predicates(&machine)
            } else {
                machine.predicates.clone()
            };
            fencins(
                &machine,
                aspect,
                only_one,
                |m| {
                    if cegar {
                        match pb_cegar(
                            m,
                            predicates.clone(),
                            &CegarOptions {
                                k,
                                max_refinements,
                            },
                        ) {
                            CegarOutcome::Reachable { trace, .. } => ReachResult::Reachable {
                                trace,
                                stats: SearchStats::default(),
                            },
                            CegarOutcome::Unreachable { .. } => ReachResult::Unreachable {
                                stats: SearchStats::default(),
                            },
                            CegarOutcome::BudgetExhausted { .. } => {
                                budget_exhausted.set(true);
                                ReachResult::Unreachable {
                                    stats: SearchStats::default(),
                                }
                            }
                        }
                    } else {
                        let common = PbCommon::new(k, m.clone(), predicates.clone());
                        reachability(&common, common.bad_states())
                    }
                },
                tso_candidates,
            )
        }
        Abstraction::Vips => {
            VipsCommon::new(machine.clone()).map_err(|e| miette::miette!("{e}"))?;
            fencins(
                &machine,
                aspect,
                only_one,
                |m| {
                    let common = VipsCommon::new(m.clone())
                        .unwrap_or_else(|_| unreachable!("syncs do not remove domains"));
                    reachability_vips(&common)
                },
                vips_candidates,
            )
        }
    };

    if budget_exhausted.get() {
        println!("RESULT: REFINEMENT_BUDGET_EXHAUSTED");
        println!("The refinement budget ran out before fence insertion could conclude.");
        return Ok(());
    }
    print_sync_sets(&machine, &outcome);
    if json {
        let sets: Vec<Vec<String>> = outcome
            .sync_sets
            .iter()
            .map(|set| set.iter().map(|s| s.to_string()).collect())
            .collect();
        let line = serde_json::json!({
            "command": "fencins",
            "abstraction": abstraction.name(),
            "unsafe_regardless": outcome.unsafe_regardless,
            "sync_sets": sets,
        });
        println!("{line}");
    }
    Ok(())
}

fn print_sync_sets(machine: &Machine, outcome: &FencinsOutcome) {
    let n = outcome.sync_sets.len();
    if n == 0 {
        println!("Found 0 synchronization sets.");
        if outcome.unsafe_regardless {
            println!();
            println!("NOTICE: This means that the program is unsafe regardless of fences!");
        }
        return;
    }
    println!("Found {n} synchronization set{}:", if n == 1 { "" } else { "s" });
    for (i, set) in outcome.sync_sets.iter().enumerate() {
        println!("Sync set #{i}:");
        if set.is_empty() {
            println!("  (No synchronizations)");
            println!("  (This means that the program is safe without any additional fences.)");
        } else {
            for sync in set {
                println!("  {}", sync.pretty(machine));
            }
        }
    }
}
