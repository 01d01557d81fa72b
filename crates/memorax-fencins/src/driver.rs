//! The fence-insertion loop: accumulate one candidate family per
//! counterexample, solve minimal coverage between engine runs.

use std::collections::BTreeSet;

use memorax_engine::reachability::ReachResult;
use memorax_engine::trace::Trace;
use memorax_machine::Machine;
use tracing::{info, warn};

use crate::min_coverage::{min_coverage, min_coverage_all};
use crate::sync::{apply_syncs, StateMap, Sync};

/// Minimality criterion for the returned synchronization sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MinAspect {
    /// Lock-write universe only, greedy over engine feedback.
    Cheap,
    /// All subset-minimal solutions.
    Subset,
    /// Cost-minimum solutions under unit cost.
    Cost,
}

#[derive(Debug, Default)]
pub struct FencinsOutcome {
    pub sync_sets: Vec<BTreeSet<Sync>>,
    /// A witness without any reordering was found: no fence placement
    /// can make the program safe.
    pub unsafe_regardless: bool,
}

/// Counterexample-guided rounds are bounded; hitting this cap means the
/// candidate spaces keep shifting and is reported as "no solution".
const MAX_ROUNDS: usize = 128;

/// Find minimal synchronization sets whose insertion makes the
/// forbidden states unreachable. `reach` runs the chosen abstraction on
/// a rewritten machine; `fencer` enumerates trace-breaking candidates.
pub fn fencins(
    machine: &Machine,
    aspect: MinAspect,
    only_one: bool,
    mut reach: impl FnMut(&Machine) -> ReachResult,
    fencer: impl Fn(&Trace) -> BTreeSet<Sync>,
) -> FencinsOutcome {
    match aspect {
        MinAspect::Cheap => fencins_cheap(machine, &mut reach, &fencer),
        MinAspect::Subset | MinAspect::Cost => {
            fencins_covering(machine, aspect, only_one, &mut reach, &fencer)
        }
    }
}

fn map_back(syncs: BTreeSet<Sync>, map: &StateMap) -> BTreeSet<Sync> {
    syncs.into_iter().map(|s| map.map_sync(s)).collect()
}

fn fencins_covering(
    machine: &Machine,
    aspect: MinAspect,
    only_one: bool,
    reach: &mut impl FnMut(&Machine) -> ReachResult,
    fencer: &impl Fn(&Trace) -> BTreeSet<Sync>,
) -> FencinsOutcome {
    let mut families: Vec<BTreeSet<Sync>> = Vec::new();
    let mut solutions: Vec<BTreeSet<Sync>> = Vec::new();
    let mut safe: Vec<BTreeSet<Sync>> = Vec::new();
    // Candidates already witnessed unsafe; state-map conflation can
    // reproduce a known family, so these must never be retried.
    let mut failed: Vec<BTreeSet<Sync>> = Vec::new();

    for round in 0..MAX_ROUNDS {
        // Every sufficient sync set must hit every family (each family
        // is the set of breakers of one witnessed trace), so candidates
        // are hitting sets: the cost-optimal one first for `cost`, plus
        // all subset-minimal ones.
        let optimal = match aspect {
            MinAspect::Cost => min_coverage(&families, &|_| 1),
            _ => None,
        };
        let mut candidates: Vec<BTreeSet<Sync>> = Vec::new();
        candidates.extend(optimal.clone());
        candidates.extend(min_coverage_all(&families));
        if candidates.is_empty() {
            break;
        }
        let mut progressed = false;
        for candidate in candidates {
            if safe.contains(&candidate) || failed.contains(&candidate) {
                continue;
            }
            let (rewritten, map) = apply_syncs(machine, candidate.iter());
            match reach(&rewritten) {
                ReachResult::Unreachable { .. } => {
                    info!(round, syncs = candidate.len(), "sufficient sync set found");
                    safe.push(candidate.clone());
                    let cost_optimal = Some(&candidate) == optimal.as_ref();
                    solutions.push(candidate);
                    if only_one || cost_optimal {
                        // The best-first solver's hitting set, when
                        // safe, is already cost-optimal.
                        return finish(aspect, solutions);
                    }
                }
                ReachResult::Reachable { trace, .. } => {
                    let syncs = map_back(fencer(&trace), &map);
                    if syncs.is_empty() {
                        info!("witness without reordering: fences cannot help");
                        return FencinsOutcome {
                            sync_sets: Vec::new(),
                            unsafe_regardless: true,
                        };
                    }
                    failed.push(candidate);
                    if !families.contains(&syncs) {
                        families.push(syncs);
                    }
                    progressed = true;
                    break;
                }
            }
        }
        if !progressed {
            return finish(aspect, solutions);
        }
    }
    warn!("fence insertion did not converge within {MAX_ROUNDS} rounds");
    finish(aspect, solutions)
}

fn finish(aspect: MinAspect, mut solutions: Vec<BTreeSet<Sync>>) -> FencinsOutcome {
    solutions.sort();
    solutions.dedup();
    let solutions: Vec<BTreeSet<Sync>> = match aspect {
        MinAspect::Subset => solutions
            .iter()
            .filter(|s| {
                !solutions
                    .iter()
                    .any(|other| other != *s && other.is_subset(s))
            })
            .cloned()
            .collect(),
        MinAspect::Cost => {
            let best = solutions.iter().map(|s| s.len()).min();
            solutions
                .into_iter()
                .filter(|s| Some(s.len()) == best)
                .collect()
        }
        MinAspect::Cheap => solutions,
    };
    FencinsOutcome {
        sync_sets: solutions,
        unsafe_regardless: false,
    }
}

/// The cheap criterion: grow one lock-write set greedily from engine
/// feedback. Usually subset-minimal, occasionally larger.
fn fencins_cheap(
    machine: &Machine,
    reach: &mut impl FnMut(&Machine) -> ReachResult,
    fencer: &impl Fn(&Trace) -> BTreeSet<Sync>,
) -> FencinsOutcome {
    let mut chosen: BTreeSet<Sync> = BTreeSet::new();
    for round in 0..MAX_ROUNDS {
        let (rewritten, map) = apply_syncs(machine, chosen.iter());
        match reach(&rewritten) {
            ReachResult::Unreachable { .. } => {
                info!(round, locks = chosen.len(), "lock set is sufficient");
                return FencinsOutcome {
                    sync_sets: vec![chosen],
                    unsafe_regardless: false,
                };
            }
            ReachResult::Reachable { trace, .. } => {
                let locks: BTreeSet<Sync> = map_back(fencer(&trace), &map)
                    .into_iter()
                    .filter(Sync::is_lock_write)
                    .collect();
                if locks.is_empty() || locks.iter().all(|s| chosen.contains(s)) {
                    info!("no further lockable writes; program stays unsafe");
                    return FencinsOutcome {
                        sync_sets: Vec::new(),
                        unsafe_regardless: true,
                    };
                }
                chosen.extend(locks);
            }
        }
    }
    warn!("cheap fence insertion did not converge within {MAX_ROUNDS} rounds");
    FencinsOutcome::default()
}
