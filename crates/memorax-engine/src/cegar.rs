//! Counterexample-guided refinement for the pb abstraction.
//!
//! A plain loop owned by the driver: build the shared context from the
//! current predicate set, run the inner backward engine, concretely
//! simulate any witness, and either accept it, refine and retry, or
//! give up when the refinement budget is exhausted.

use memorax_machine::lang::{CmpOp, Cond, CondOperand, Instr, RExpr};
use memorax_machine::Machine;
use tracing::info;

use crate::constraint::{assume_backward, constrain_expr_to, eval_rexpr, Msg};
use crate::pb::PbCommon;
use crate::reachability::{reachability, ReachResult};
use crate::trace::Trace;
use crate::zstar::{Store, ZStar};

/// Outcome of a CEGAR run. `BudgetExhausted` is an analysis outcome,
/// not a failure: the abstraction kept producing spurious witnesses.
#[derive(Debug)]
pub enum CegarOutcome {
    Reachable {
        trace: Trace,
        refinements_used: usize,
        predicates: Vec<Cond>,
    },
    Unreachable {
        refinements_used: usize,
        predicates: Vec<Cond>,
    },
    BudgetExhausted {
        refinements_used: usize,
        predicates: Vec<Cond>,
    },
}

impl CegarOutcome {
    pub fn verdict(&self) -> &'static str {
        match self {
            CegarOutcome::Reachable { .. } => "REACHABLE",
            CegarOutcome::Unreachable { .. } => "UNREACHABLE",
            CegarOutcome::BudgetExhausted { .. } => "REFINEMENT_BUDGET_EXHAUSTED",
        }
    }

    pub fn predicates(&self) -> &[Cond] {
        match self {
            CegarOutcome::Reachable { predicates, .. }
            | CegarOutcome::Unreachable { predicates, .. }
            | CegarOutcome::BudgetExhausted { predicates, .. } => predicates,
        }
    }
}

pub struct CegarOptions {
    /// Per-process buffer bound of the pb abstraction.
    pub k: usize,
    /// Maximum number of refinement iterations; `None` is unbounded.
    pub max_refinements: Option<usize>,
}

/// Run the refinement loop. Predicates only ever grow; each iteration
/// deep-copies them into the context it hands to the engine.
pub fn pb_cegar(machine: &Machine, initial: Vec<Cond>, opts: &CegarOptions) -> CegarOutcome {
    let mut predicates = initial;
    let mut refinements_used = 0;
    loop {
        info!(
            iteration = refinements_used,
            predicates = predicates.len(),
            "pb analysis"
        );
        let common = PbCommon::new(opts.k, machine.clone(), predicates.clone());
        let bad = common.bad_states();
        match reachability(&common, bad) {
            ReachResult::Unreachable { .. } => {
                return CegarOutcome::Unreachable {
                    refinements_used,
                    predicates,
                };
            }
            ReachResult::Reachable { trace, .. } => match simulate(&common, &trace) {
                Ok(()) => {
                    return CegarOutcome::Reachable {
                        trace,
                        refinements_used,
                        predicates,
                    };
                }
                Err(step) => {
                    info!(step, "witness is spurious");
                    if opts
                        .max_refinements
                        .is_some_and(|max| refinements_used >= max)
                    {
                        return CegarOutcome::BudgetExhausted {
                            refinements_used,
                            predicates,
                        };
                    }
                    let fresh = extract_refinement_predicates(&trace, &predicates);
                    if fresh.is_empty() {
                        // Nothing left to learn from this witness.
                        return CegarOutcome::BudgetExhausted {
                            refinements_used,
                            predicates,
                        };
                    }
                    info!(added = fresh.len(), "refining predicate set");
                    predicates.extend(fresh);
                    refinements_used += 1;
                }
            },
        }
    }
}

/// New predicate atoms from an infeasible witness: the constant
/// comparisons its reads and writes mention, projected onto memory
/// cells.
fn extract_refinement_predicates(trace: &Trace, existing: &[Cond]) -> Vec<Cond> {
    let mut fresh = Vec::new();
    let mut push = |cond: Cond| {
        if !existing.contains(&cond) && !fresh.contains(&cond) {
            fresh.push(cond);
        }
    };
    for t in trace.transitions() {
        match &t.instr {
            Instr::ReadAssert {
                nml,
                expr: RExpr::Int(k),
            }
            | Instr::Write {
                nml,
                expr: RExpr::Int(k),
            } => push(Cond::Cmp {
                lhs: CondOperand::Cell(*nml),
                op: CmpOp::Eq,
                rhs: CondOperand::Int(*k),
            }),
            Instr::SyncRead { body } => {
                if let Instr::ReadAssert {
                    nml,
                    expr: RExpr::Int(k),
                } = body.as_ref()
                {
                    push(Cond::Cmp {
                        lhs: CondOperand::Cell(*nml),
                        op: CmpOp::Eq,
                        rhs: CondOperand::Int(*k),
                    });
                }
            }
            Instr::Locked { body, .. } => {
                for instr in body {
                    if let Instr::Write {
                        nml,
                        expr: RExpr::Int(k),
                    }
                    | Instr::ReadAssert {
                        nml,
                        expr: RExpr::Int(k),
                    } = instr
                    {
                        push(Cond::Cmp {
                            lhs: CondOperand::Cell(*nml),
                            op: CmpOp::Eq,
                            rhs: CondOperand::Int(*k),
                        });
                    }
                }
            }
            _ => {}
        }
    }
    fresh
}

struct SimState {
    channels: Vec<Vec<Msg>>,
    mem: Store,
    regs: Vec<Store>,
}

impl SimState {
    fn visible(&self, pid: usize, idx: usize, nml: memorax_machine::lang::Nml) -> CellRef {
        match self.channels[pid]
            .iter()
            .rposition(|m| m.nmls.contains(&nml))
        {
            Some(mi) => CellRef::Buffered(mi),
            None => CellRef::Memory(idx),
        }
    }

    fn cell_value(&self, pid: usize, cell: &CellRef, idx: usize) -> ZStar {
        match cell {
            CellRef::Buffered(mi) => self.channels[pid][*mi].store.get(idx),
            CellRef::Memory(i) => self.mem.get(*i),
        }
    }

    fn bind_cell(&mut self, pid: usize, cell: &CellRef, idx: usize, v: i64) {
        match cell {
            CellRef::Buffered(mi) => {
                self.channels[pid][*mi].store =
                    self.channels[pid][*mi].store.assign(idx, ZStar::Int(v));
            }
            CellRef::Memory(i) => {
                self.mem = self.mem.assign(*i, ZStar::Int(v));
            }
        }
    }
}

enum CellRef {
    Buffered(usize),
    Memory(usize),
}

/// Concretely replay an abstract witness against the machine. Wildcard
/// initial values stay symbolic until a read commits them. Returns the
/// index of the first infeasible step.
pub fn simulate(common: &PbCommon, trace: &Trace) -> Result<(), usize> {
    let machine = &common.machine;
    let nprocs = machine.proc_count();
    let mut sim = SimState {
        channels: vec![Vec::new(); nprocs],
        mem: common.init_store(),
        regs: (0..nprocs)
            .map(|pid| {
                let decls = &machine.regs[pid];
                let mut store = Store::new(decls.len());
                for (i, d) in decls.iter().enumerate() {
                    if let memorax_dsl::ast::InitValue::Int(v) = d.init {
                        store = store.assign(i, ZStar::Int(v));
                    }
                }
                store
            })
            .collect(),
    };

    for (i, step) in trace.steps.iter().enumerate() {
        let Some(t) = &step.transition else { continue };
        let pid = t.pid;
        // The engine gives synchronized reads plain-read semantics, so
        // the replay does too.
        let instr = match &t.instr {
            Instr::SyncRead { body } => body.as_ref(),
            other => other,
        };
        match instr {
            Instr::Nop => {}
            Instr::Write { nml, expr } => {
                let idx = common.index(*nml);
                let v = eval_rexpr(expr, &sim.regs[pid]);
                let store = Store::new(common.mem_size).assign(idx, v);
                sim.channels[pid].push(Msg::new(
                    Some(pid),
                    [*nml].into_iter().collect(),
                    store,
                ));
            }
            Instr::Update { writer, nmls } => {
                let Some(front) = sim.channels[*writer].first().cloned() else {
                    return Err(i);
                };
                if front.nmls != *nmls {
                    return Err(i);
                }
                sim.channels[*writer].remove(0);
                for nml in nmls {
                    let idx = common.index(*nml);
                    sim.mem = sim.mem.assign(idx, front.store.get(idx));
                }
            }
            Instr::ReadAssert { nml, expr } => {
                let idx = common.index(*nml);
                let cell = sim.visible(pid, idx, *nml);
                let have = sim.cell_value(pid, &cell, idx);
                match (have, eval_rexpr(expr, &sim.regs[pid])) {
                    (ZStar::Int(a), ZStar::Int(b)) => {
                        if a != b {
                            return Err(i);
                        }
                    }
                    (ZStar::Star, ZStar::Int(b)) => sim.bind_cell(pid, &cell, idx, b),
                    (ZStar::Int(a), ZStar::Star) => {
                        match constrain_expr_to(expr, a, &sim.regs[pid]) {
                            Some(regs) => sim.regs[pid] = regs,
                            None => return Err(i),
                        }
                    }
                    (ZStar::Star, ZStar::Star) => {}
                }
            }
            Instr::ReadAssign { reg, nml } => {
                let idx = common.index(*nml);
                let cell = sim.visible(pid, idx, *nml);
                let have = sim.cell_value(pid, &cell, idx);
                sim.regs[pid] = sim.regs[pid].assign(*reg, have);
            }
            Instr::RegAssign { reg, expr } => {
                let v = eval_rexpr(expr, &sim.regs[pid]);
                sim.regs[pid] = sim.regs[pid].assign(*reg, v);
            }
            Instr::Assume { cond } => match assume_backward(cond, &sim.regs[pid]) {
                Some(regs) => sim.regs[pid] = regs,
                None => return Err(i),
            },
            Instr::Fence => {
                if !sim.channels[pid].is_empty() {
                    return Err(i);
                }
            }
            Instr::Locked { body, .. } => {
                if !sim.channels[pid].is_empty() {
                    return Err(i);
                }
                for instr in body {
                    match instr {
                        Instr::Nop => {}
                        Instr::Write { nml, expr } => {
                            let idx = common.index(*nml);
                            sim.mem = sim.mem.assign(idx, eval_rexpr(expr, &sim.regs[pid]));
                        }
                        Instr::ReadAssert { nml, expr } => {
                            let idx = common.index(*nml);
                            match (sim.mem.get(idx), eval_rexpr(expr, &sim.regs[pid])) {
                                (ZStar::Int(a), ZStar::Int(b)) => {
                                    if a != b {
                                        return Err(i);
                                    }
                                }
                                (ZStar::Star, ZStar::Int(b)) => {
                                    sim.mem = sim.mem.assign(idx, ZStar::Int(b));
                                }
                                _ => {}
                            }
                        }
                        Instr::ReadAssign { reg, nml } => {
                            let idx = common.index(*nml);
                            let have = sim.mem.get(idx);
                            sim.regs[pid] = sim.regs[pid].assign(*reg, have);
                        }
                        Instr::RegAssign { reg, expr } => {
                            let v = eval_rexpr(expr, &sim.regs[pid]);
                            sim.regs[pid] = sim.regs[pid].assign(*reg, v);
                        }
                        Instr::Assume { cond } => match assume_backward(cond, &sim.regs[pid]) {
                            Some(regs) => sim.regs[pid] = regs,
                            None => return Err(i),
                        },
                        _ => return Err(i),
                    }
                }
            }
            Instr::SyncRead { .. } | Instr::Fetch { .. } | Instr::Wrllc { .. }
            | Instr::Evict { .. } => {}
        }
    }
    Ok(())
}
