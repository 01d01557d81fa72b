//! Candidate enumeration: which synchronizations would each break a
//! given witness trace.

use std::collections::BTreeSet;

use memorax_engine::trace::Trace;
use memorax_machine::lang::{Instr, Nml};
use memorax_machine::StateId;

use crate::sync::Sync;

#[derive(Debug)]
struct PendingWrite {
    step: usize,
    target: StateId,
    source: StateId,
    nml: Nml,
    /// Step of the matching propagation; `usize::MAX` while pending.
    flushed_at: usize,
}

/// Candidates for a TSO-like (sb/pdual/pb) witness: for every write
/// whose propagation is delayed past a later read of the same process,
/// a fence at each control state the process occupies in between, plus
/// locking the write itself. An empty result means the witness uses no
/// reordering at all.
pub fn tso_candidates(trace: &Trace) -> BTreeSet<Sync> {
    let mut writes: Vec<(usize, PendingWrite)> = Vec::new();
    let mut reads: Vec<(usize, usize, StateId)> = Vec::new();
    let mut path: Vec<(usize, usize, StateId, StateId)> = Vec::new();

    for (step, t) in trace
        .steps
        .iter()
        .filter_map(|s| s.transition.as_ref())
        .enumerate()
    {
        match &t.instr {
            Instr::Write { nml, .. } => {
                writes.push((
                    t.pid,
                    PendingWrite {
                        step,
                        target: t.target,
                        source: t.source,
                        nml: *nml,
                        flushed_at: usize::MAX,
                    },
                ));
                path.push((t.pid, step, t.source, t.target));
            }
            Instr::Update { writer, nmls } => {
                if let Some((_, w)) = writes
                    .iter_mut()
                    .find(|(p, w)| p == writer && nmls.contains(&w.nml) && w.flushed_at == usize::MAX)
                {
                    w.flushed_at = step;
                }
            }
            // Synchronized reads count as reads under the channel
            // abstractions.
            Instr::ReadAssert { .. } | Instr::ReadAssign { .. } | Instr::SyncRead { .. } => {
                reads.push((t.pid, step, t.source));
                path.push((t.pid, step, t.source, t.target));
            }
            Instr::Fetch { .. } | Instr::Wrllc { .. } | Instr::Evict { .. } => {}
            _ => path.push((t.pid, step, t.source, t.target)),
        }
    }

    let mut out = BTreeSet::new();
    for (wpid, w) in &writes {
        for (rpid, rstep, rsource) in &reads {
            if rpid != wpid || *rstep <= w.step || *rstep >= w.flushed_at {
                continue;
            }
            // The write is still pending while the read executes.
            out.insert(Sync::LockWrite {
                pid: *wpid,
                source: w.source,
                target: w.target,
                nml: w.nml,
            });
            out.insert(Sync::Fence {
                pid: *wpid,
                state: w.target,
            });
            for (pid, step, source, target) in &path {
                if pid == wpid && *step > w.step && *step < *rstep {
                    out.insert(Sync::Fence {
                        pid: *pid,
                        state: *source,
                    });
                    out.insert(Sync::Fence {
                        pid: *pid,
                        state: *target,
                    });
                }
            }
            out.insert(Sync::Fence {
                pid: *wpid,
                state: *rsource,
            });
        }
    }
    out
}

/// Candidates for a VIPS-M witness, from both ends of the coherence
/// protocol:
///
/// - *writer side*: a write whose write-back is delayed past a later
///   read by the same process yields the fences in between;
/// - *reader side*: a read served from a copy fetched before another
///   process changed the cell yields a `syncrd` conversion of that read
///   (cheaper than a fence) plus the fences between the fetch and the
///   read, each of which forces a fresh copy.
pub fn vips_candidates(trace: &Trace) -> BTreeSet<Sync> {
    let mut writes: Vec<(usize, PendingWrite)> = Vec::new();
    // (pid, step, source, target, nml) of plain reads; synchronized
    // reads already observe fresh copies.
    let mut reads: Vec<(usize, usize, StateId, StateId, Nml)> = Vec::new();
    let mut fetches: Vec<(usize, usize, Nml)> = Vec::new();
    // Shared-level changes: write-backs and atomic writes, per cell.
    let mut mem_changes: Vec<(usize, usize, Nml)> = Vec::new();
    let mut path: Vec<(usize, usize, StateId, StateId)> = Vec::new();

    for (step, t) in trace
        .steps
        .iter()
        .filter_map(|s| s.transition.as_ref())
        .enumerate()
    {
        match &t.instr {
            Instr::Write { nml, .. } => {
                writes.push((
                    t.pid,
                    PendingWrite {
                        step,
                        target: t.target,
                        source: t.source,
                        nml: *nml,
                        flushed_at: usize::MAX,
                    },
                ));
                path.push((t.pid, step, t.source, t.target));
            }
            Instr::Wrllc { nml } => {
                if let Some((_, w)) = writes
                    .iter_mut()
                    .find(|(p, w)| *p == t.pid && w.nml == *nml && w.flushed_at == usize::MAX)
                {
                    w.flushed_at = step;
                }
                mem_changes.push((t.pid, step, *nml));
            }
            Instr::Fetch { nml } => fetches.push((t.pid, step, *nml)),
            Instr::ReadAssert { nml, .. } | Instr::ReadAssign { nml, .. } => {
                reads.push((t.pid, step, t.source, t.target, *nml));
                path.push((t.pid, step, t.source, t.target));
            }
            Instr::SyncRead { .. } => path.push((t.pid, step, t.source, t.target)),
            Instr::Locked { body, .. } => {
                for inner in body {
                    if let Instr::Write { nml, .. } = inner {
                        mem_changes.push((t.pid, step, *nml));
                    }
                }
                path.push((t.pid, step, t.source, t.target));
            }
            Instr::Evict { .. } | Instr::Update { .. } => {}
            _ => path.push((t.pid, step, t.source, t.target)),
        }
    }

    let mut out = BTreeSet::new();
    for (wpid, w) in &writes {
        for (rpid, rstep, rsource, _, _) in &reads {
            if rpid != wpid || *rstep <= w.step || *rstep >= w.flushed_at {
                continue;
            }
            out.insert(Sync::Fence {
                pid: *wpid,
                state: w.target,
            });
            for (pid, step, source, target) in &path {
                if pid == wpid && *step > w.step && *step < *rstep {
                    out.insert(Sync::Fence {
                        pid: *pid,
                        state: *source,
                    });
                    out.insert(Sync::Fence {
                        pid: *pid,
                        state: *target,
                    });
                }
            }
            out.insert(Sync::Fence {
                pid: *wpid,
                state: *rsource,
            });
        }
    }

    for (rpid, rstep, rsource, rtarget, rnml) in &reads {
        let Some(fetch_step) = fetches
            .iter()
            .filter(|(p, s, n)| p == rpid && n == rnml && s < rstep)
            .map(|(_, s, _)| *s)
            .max()
        else {
            continue;
        };
        let stale = mem_changes
            .iter()
            .any(|(p, m, n)| p != rpid && n == rnml && fetch_step < *m && *m < *rstep);
        if !stale {
            continue;
        }
        out.insert(Sync::Syncrd {
            pid: *rpid,
            source: *rsource,
            target: *rtarget,
            nml: *rnml,
        });
        for (pid, step, source, target) in &path {
            if pid == rpid && *step > fetch_step && *step < *rstep {
                out.insert(Sync::Fence {
                    pid: *pid,
                    state: *source,
                });
                out.insert(Sync::Fence {
                    pid: *pid,
                    state: *target,
                });
            }
        }
        out.insert(Sync::Fence {
            pid: *rpid,
            state: *rsource,
        });
    }
    out
}
