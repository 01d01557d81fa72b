//! The predicate-abstracted, buffer-bounded TSO variant.
//!
//! Structurally a per-process-channel constraint like PDual, with two
//! abstractions layered on top:
//!
//! - real propagation steps are bounded to `k` pending messages per
//!   process; beyond that, propagation is *widened*: the memory cells
//!   become unknown without a message being represented, and the
//!   constraint asserts that the truth of every tracked predicate is
//!   preserved across the forgotten step;
//! - every constraint carries a three-valued valuation of the tracked
//!   predicates; refinements that contradict a recorded valuation are
//!   discarded. More predicates therefore mean a finer abstraction,
//!   which is what the CEGAR loop exploits.

use std::collections::{BTreeMap, BTreeSet};

use memorax_machine::lang::{CmpOp, Cond, CondOperand, Instr, Nml, RExpr};
use memorax_machine::{Machine, PTransition, StateId, Transition};

use crate::constraint::{
    assume_backward, characterize_channel, cmp_holds, constrain_expr_to,
    entailment_compare_channels, eval_rexpr, reg_assign_backward, Characterization, Constraint,
    Msg,
};
use crate::sb::MsgHdr;
use crate::zstar::{comb, Comparison, Store, ZStar};

/// Three-valued truth of a predicate over a symbolic memory image.
pub fn eval_predicate(cond: &Cond, mem: &Store, index: &dyn Fn(Nml) -> usize) -> Option<bool> {
    match cond {
        Cond::True => Some(true),
        Cond::False => Some(false),
        Cond::And(lhs, rhs) => {
            match (
                eval_predicate(lhs, mem, index),
                eval_predicate(rhs, mem, index),
            ) {
                (Some(false), _) | (_, Some(false)) => Some(false),
                (Some(true), Some(true)) => Some(true),
                _ => None,
            }
        }
        Cond::Cmp { lhs, op, rhs } => {
            let value = |operand: &CondOperand| -> Option<i64> {
                match operand {
                    CondOperand::Int(n) => Some(*n),
                    CondOperand::Cell(nml) => mem.get(index(*nml)).as_int(),
                    CondOperand::Reg(_) => None,
                }
            };
            Some(cmp_holds(value(lhs)?, *op, value(rhs)?))
        }
    }
}

fn predicate_mentions(cond: &Cond, nml: Nml) -> bool {
    match cond {
        Cond::True | Cond::False => false,
        Cond::And(lhs, rhs) => predicate_mentions(lhs, nml) || predicate_mentions(rhs, nml),
        Cond::Cmp { lhs, rhs, .. } => {
            matches!(lhs, CondOperand::Cell(n) if *n == nml)
                || matches!(rhs, CondOperand::Cell(n) if *n == nml)
        }
    }
}

/// Shared read-only context for one pb analysis: the buffer bound and
/// the owned predicate set.
#[derive(Debug, Clone)]
pub struct PbCommon {
    pub machine: Machine,
    pub k: usize,
    pub predicates: Vec<Cond>,
    pub mem_size: usize,
    reg_counts: Vec<usize>,
    nml_index: BTreeMap<Nml, usize>,
    all_nmls: BTreeSet<Nml>,
    msg_hdrs: Vec<MsgHdr>,
}

impl PbCommon {
    pub fn new(k: usize, machine: Machine, predicates: Vec<Cond>) -> Self {
        let nmls = machine.all_nmls();
        let nml_index: BTreeMap<Nml, usize> =
            nmls.iter().enumerate().map(|(i, n)| (*n, i)).collect();
        let mut hdrs: BTreeSet<MsgHdr> = BTreeSet::new();
        for (pid, aut) in machine.automata.iter().enumerate() {
            for t in &aut.transitions {
                if let Some(nml) = t.instr.buffered_write_nml() {
                    hdrs.insert(MsgHdr {
                        wpid: pid,
                        nmls: [nml].into_iter().collect(),
                    });
                }
            }
        }
        PbCommon {
            k: k.max(1),
            predicates,
            mem_size: nmls.len(),
            reg_counts: machine.regs.iter().map(|r| r.len()).collect(),
            nml_index,
            all_nmls: nmls.into_iter().collect(),
            msg_hdrs: hdrs.into_iter().collect(),
            machine,
        }
    }

    pub fn index(&self, nml: Nml) -> usize {
        self.nml_index[&nml]
    }

    pub fn bad_states(&self) -> Vec<PbConstraint> {
        self.machine
            .forbidden
            .iter()
            .map(|tuple| PbConstraint::for_pcs(tuple.clone(), self))
            .collect()
    }

    /// Mine candidate predicates from the machine: the equality atoms of
    /// read-asserts with constant expressions, plus any declared
    /// predicates, deduplicated structurally.
    pub fn extract_predicates(machine: &Machine) -> Vec<Cond> {
        let mut out: Vec<Cond> = Vec::new();
        let mut push = |cond: Cond| {
            if !out.contains(&cond) {
                out.push(cond);
            }
        };
        for aut in &machine.automata {
            for t in &aut.transitions {
                if let Instr::ReadAssert {
                    nml,
                    expr: RExpr::Int(k),
                } = &t.instr
                {
                    push(Cond::Cmp {
                        lhs: CondOperand::Cell(*nml),
                        op: CmpOp::Eq,
                        rhs: CondOperand::Int(*k),
                    });
                }
            }
        }
        for pred in &machine.predicates {
            push(pred.clone());
        }
        out
    }

    pub(crate) fn init_store(&self) -> Store {
        let mut store = Store::new(self.mem_size);
        for (nml, idx) in &self.nml_index {
            if let memorax_dsl::ast::InitValue::Int(v) = self.machine.init_value(*nml) {
                store = store.assign(*idx, ZStar::Int(v));
            }
        }
        store
    }

    fn init_value_matches(&self, nml: Nml, cell: ZStar) -> bool {
        match cell {
            ZStar::Star => true,
            ZStar::Int(v) => match self.machine.init_value(nml) {
                memorax_dsl::ast::InitValue::Wild => true,
                memorax_dsl::ast::InitValue::Int(i) => v == i,
            },
        }
    }
}

/// A symbolic pb configuration: per-process bounded channels plus a
/// predicate valuation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PbConstraint {
    pub pcs: Vec<StateId>,
    pub channels: Vec<Vec<Msg>>,
    pub mem: Store,
    pub reg_stores: Vec<Store>,
    pub mem_reads: Vec<BTreeSet<Nml>>,
    /// Recorded truth of each tracked predicate; `None` is unknown.
    pub pvals: Vec<Option<bool>>,
}

impl PbConstraint {
    pub fn for_pcs(pcs: Vec<StateId>, common: &PbCommon) -> Self {
        let nprocs = pcs.len();
        PbConstraint {
            pcs,
            channels: vec![Vec::new(); nprocs],
            mem: Store::new(common.mem_size),
            reg_stores: common.reg_counts.iter().map(|&n| Store::new(n)).collect(),
            mem_reads: vec![BTreeSet::new(); nprocs],
            pvals: vec![None; common.predicates.len()],
        }
    }

    fn visible_msg_idx(&self, pid: usize, nml: Nml) -> Option<usize> {
        self.channels[pid]
            .iter()
            .rposition(|m| m.wpid == Some(pid) && m.nmls.contains(&nml))
    }

    /// Re-evaluate every predicate after a same-time refinement of the
    /// memory image; a contradiction with a recorded truth discards the
    /// predecessor.
    fn refresh_pvals(&mut self, common: &PbCommon) -> Option<()> {
        let index = |nml: Nml| common.index(nml);
        for (i, pred) in common.predicates.iter().enumerate() {
            if let Some(b) = eval_predicate(pred, &self.mem, &index) {
                match self.pvals[i] {
                    Some(prev) if prev != b => return None,
                    _ => self.pvals[i] = Some(b),
                }
            }
        }
        Some(())
    }

    /// Predicate truths become unknown for cells crossed by a real
    /// memory change (a propagation or an atomic write).
    fn reset_pvals_on(&mut self, cells: &BTreeSet<Nml>, common: &PbCommon) {
        for (i, pred) in common.predicates.iter().enumerate() {
            if cells.iter().any(|nml| predicate_mentions(pred, *nml)) {
                self.pvals[i] = None;
            }
        }
    }

    /// A widened propagation asserts predicate preservation: the truth
    /// before the forgotten step must match any recorded truth.
    fn capture_pvals_before_widen(
        &mut self,
        cells: &BTreeSet<Nml>,
        common: &PbCommon,
    ) -> Option<()> {
        let index = |nml: Nml| common.index(nml);
        for (i, pred) in common.predicates.iter().enumerate() {
            if !cells.iter().any(|nml| predicate_mentions(pred, *nml)) {
                continue;
            }
            if let Some(b) = eval_predicate(pred, &self.mem, &index) {
                match self.pvals[i] {
                    Some(prev) if prev != b => return None,
                    _ => self.pvals[i] = Some(b),
                }
            }
        }
        Some(())
    }

    fn read_pre(
        mut self,
        pid: usize,
        nml: Nml,
        expr: Option<&RExpr>,
        bound_reg: Option<usize>,
        common: &PbCommon,
    ) -> Option<Self> {
        let idx = common.index(nml);
        let observed = match bound_reg {
            Some(reg) => {
                let v = self.reg_stores[pid].get(reg);
                self.reg_stores[pid] = self.reg_stores[pid].assign(reg, ZStar::Star);
                v
            }
            None => match expr {
                Some(e) => eval_rexpr(e, &self.reg_stores[pid]),
                None => ZStar::Star,
            },
        };
        match self.visible_msg_idx(pid, nml) {
            Some(mi) => match observed {
                ZStar::Int(k) => {
                    let store = self.channels[pid][mi].store.meet_at(idx, k)?;
                    self.channels[pid][mi].store = store;
                }
                ZStar::Star => {
                    if bound_reg.is_none() {
                        if let (Some(e), ZStar::Int(v)) =
                            (expr, self.channels[pid][mi].store.get(idx))
                        {
                            self.reg_stores[pid] = constrain_expr_to(e, v, &self.reg_stores[pid])?;
                        }
                    }
                }
            },
            None => {
                match observed {
                    ZStar::Int(k) => {
                        self.mem = self.mem.meet_at(idx, k)?;
                        self.refresh_pvals(common)?;
                    }
                    ZStar::Star => {
                        if bound_reg.is_none() {
                            if let (Some(e), ZStar::Int(v)) = (expr, self.mem.get(idx)) {
                                self.reg_stores[pid] =
                                    constrain_expr_to(e, v, &self.reg_stores[pid])?;
                            }
                        }
                    }
                }
                self.mem_reads[pid].insert(nml);
            }
        }
        Some(self)
    }

    fn write_pre(&self, pid: usize, nml: Nml, expr: &RExpr, common: &PbCommon) -> Vec<Self> {
        let mut out = Vec::new();
        let idx = common.index(nml);
        if let Some(last) = self.channels[pid].last() {
            if last.wpid == Some(pid) && last.nmls.len() == 1 && last.nmls.contains(&nml) {
                let refined = match last.store.get(idx) {
                    ZStar::Int(v) => constrain_expr_to(expr, v, &self.reg_stores[pid]),
                    ZStar::Star => Some(self.reg_stores[pid].clone()),
                };
                if let Some(regs) = refined {
                    let mut c = self.clone();
                    c.reg_stores[pid] = regs;
                    c.channels[pid].pop();
                    c.mem_reads[pid].insert(nml);
                    out.push(c);
                }
            }
        }
        let blocked = self.mem_reads[pid].contains(&nml)
            || self.channels[pid]
                .iter()
                .any(|m| m.wpid == Some(pid) && m.nmls.contains(&nml));
        if !blocked {
            out.push(self.clone());
        }
        out
    }

    fn fence_pre(&self, pid: usize, common: &PbCommon) -> Option<Self> {
        if !self.channels[pid].is_empty() {
            return None;
        }
        let mut c = self.clone();
        c.mem_reads[pid] = common.all_nmls.clone();
        Some(c)
    }

    fn locked_pre(&self, pid: usize, body: &[Instr], common: &PbCommon) -> Option<Self> {
        if !self.channels[pid].is_empty() {
            return None;
        }
        let mut c = self.clone();
        for instr in body.iter().rev() {
            match instr {
                Instr::Nop => {}
                Instr::Write { nml, expr } => {
                    let idx = common.index(*nml);
                    if let ZStar::Int(v) = c.mem.get(idx) {
                        c.reg_stores[pid] = constrain_expr_to(expr, v, &c.reg_stores[pid])?;
                    }
                    c.mem = c.mem.assign(idx, ZStar::Star);
                    c.reset_pvals_on(&[*nml].into_iter().collect(), common);
                }
                Instr::ReadAssert { nml, expr } => {
                    let idx = common.index(*nml);
                    match eval_rexpr(expr, &c.reg_stores[pid]) {
                        ZStar::Int(k) => {
                            c.mem = c.mem.meet_at(idx, k)?;
                            c.refresh_pvals(common)?;
                        }
                        ZStar::Star => {
                            if let ZStar::Int(v) = c.mem.get(idx) {
                                c.reg_stores[pid] = constrain_expr_to(expr, v, &c.reg_stores[pid])?;
                            }
                        }
                    }
                }
                Instr::ReadAssign { reg, nml } => {
                    let idx = common.index(*nml);
                    let v = c.reg_stores[pid].get(*reg);
                    c.reg_stores[pid] = c.reg_stores[pid].assign(*reg, ZStar::Star);
                    if let ZStar::Int(k) = v {
                        c.mem = c.mem.meet_at(idx, k)?;
                        c.refresh_pvals(common)?;
                    }
                }
                Instr::RegAssign { reg, expr } => {
                    let mut files = reg_assign_backward(&c.reg_stores[pid], *reg, expr);
                    c.reg_stores[pid] = files.pop()?;
                }
                Instr::Assume { cond } => {
                    c.reg_stores[pid] = assume_backward(cond, &c.reg_stores[pid])?;
                }
                _ => return None,
            }
        }
        c.mem_reads[pid] = common.all_nmls.clone();
        Some(c)
    }

    /// Real propagation inverse, available while the writer's channel is
    /// below the bound.
    fn update_pre(&self, hdr: &MsgHdr, common: &PbCommon) -> Option<Self> {
        if self.channels[hdr.wpid].len() >= common.k {
            return None;
        }
        let mut c = self.clone();
        let mut store = Store::new(common.mem_size);
        for nml in &hdr.nmls {
            let idx = common.index(*nml);
            store = store.assign(idx, c.mem.get(idx));
            c.mem = c.mem.assign(idx, ZStar::Star);
            c.mem_reads[hdr.wpid].remove(nml);
        }
        c.reset_pvals_on(&hdr.nmls, common);
        c.channels[hdr.wpid].insert(0, Msg::new(Some(hdr.wpid), hdr.nmls.clone(), store));
        Some(c)
    }

    /// Widened propagation inverse: the step is forgotten, no message is
    /// represented, and the tracked predicates must be preserved. An
    /// earlier write of the same cells by the writer must then propagate
    /// explicitly, so the obligation is recorded rather than lifted.
    fn widened_update_pre(&self, hdr: &MsgHdr, common: &PbCommon) -> Option<Self> {
        let mut c = self.clone();
        c.capture_pvals_before_widen(&hdr.nmls, common)?;
        for nml in &hdr.nmls {
            let idx = common.index(*nml);
            c.mem = c.mem.assign(idx, ZStar::Star);
            c.mem_reads[hdr.wpid].insert(*nml);
        }
        Some(c)
    }

    fn instr_pre(&self, pid: usize, t: &Transition, common: &PbCommon) -> Vec<Self> {
        let mut base = self.clone();
        base.pcs[pid] = t.source;
        match &t.instr {
            Instr::Nop => vec![base],
            Instr::Fence => base.fence_pre(pid, common).into_iter().collect(),
            Instr::ReadAssert { nml, expr } => base
                .read_pre(pid, *nml, Some(expr), None, common)
                .into_iter()
                .collect(),
            Instr::ReadAssign { reg, nml } => base
                .read_pre(pid, *nml, None, Some(*reg), common)
                .into_iter()
                .collect(),
            Instr::Write { nml, expr } => base.write_pre(pid, *nml, expr, common),
            Instr::RegAssign { reg, expr } => {
                reg_assign_backward(&base.reg_stores[pid], *reg, expr)
                    .into_iter()
                    .map(|regs| {
                        let mut c = base.clone();
                        c.reg_stores[pid] = regs;
                        c
                    })
                    .collect()
            }
            Instr::Assume { cond } => assume_backward(cond, &base.reg_stores[pid])
                .map(|regs| {
                    let mut c = base.clone();
                    c.reg_stores[pid] = regs;
                    c
                })
                .into_iter()
                .collect(),
            Instr::Locked { body, .. } => base.locked_pre(pid, body, common).into_iter().collect(),
            // A synchronized read behaves as the plain one here.
            Instr::SyncRead { body } => match body.as_ref() {
                Instr::ReadAssert { nml, expr } => base
                    .read_pre(pid, *nml, Some(expr), None, common)
                    .into_iter()
                    .collect(),
                Instr::ReadAssign { reg, nml } => base
                    .read_pre(pid, *nml, None, Some(*reg), common)
                    .into_iter()
                    .collect(),
                _ => Vec::new(),
            },
            Instr::Update { .. } | Instr::Fetch { .. } | Instr::Wrllc { .. }
            | Instr::Evict { .. } => Vec::new(),
        }
    }
}

fn set_compare(a: &BTreeSet<Nml>, b: &BTreeSet<Nml>) -> Comparison {
    if a == b {
        Comparison::Equal
    } else if a.is_subset(b) {
        Comparison::Less
    } else if b.is_subset(a) {
        Comparison::Greater
    } else {
        Comparison::Incomparable
    }
}

fn pval_compare(a: Option<bool>, b: Option<bool>) -> Comparison {
    match (a, b) {
        (None, None) => Comparison::Equal,
        (None, Some(_)) => Comparison::Less,
        (Some(_), None) => Comparison::Greater,
        (Some(x), Some(y)) if x == y => Comparison::Equal,
        _ => Comparison::Incomparable,
    }
}

impl Constraint for PbConstraint {
    type Common = PbCommon;

    fn is_init_state(&self, common: &PbCommon) -> bool {
        if self.pcs.iter().any(|&pc| pc != 0) {
            return false;
        }
        if self.channels.iter().any(|ch| !ch.is_empty()) {
            return false;
        }
        for (nml, idx) in &common.nml_index {
            if !common.init_value_matches(*nml, self.mem.get(*idx)) {
                return false;
            }
        }
        for (pid, regs) in self.reg_stores.iter().enumerate() {
            for (r, decl) in common.machine.regs[pid].iter().enumerate() {
                if let ZStar::Int(v) = regs.get(r) {
                    if let memorax_dsl::ast::InitValue::Int(i) = decl.init {
                        if v != i {
                            return false;
                        }
                    }
                }
            }
        }
        // Recorded predicate truths must be achievable by the declared
        // initial values.
        let init = common.init_store();
        let index = |nml: Nml| common.index(nml);
        for (i, pred) in common.predicates.iter().enumerate() {
            if let (Some(req), Some(at_init)) =
                (self.pvals[i], eval_predicate(pred, &init, &index))
            {
                if req != at_init {
                    return false;
                }
            }
        }
        true
    }

    fn entailment_compare(&self, other: &Self) -> Comparison {
        if self.pcs != other.pcs {
            return Comparison::Incomparable;
        }
        if self.characterization() != other.characterization() {
            return Comparison::Incomparable;
        }
        let mut cmp = Comparison::Equal;
        for (a, b) in self.pvals.iter().zip(&other.pvals) {
            cmp = comb(cmp, pval_compare(*a, *b));
            if cmp == Comparison::Incomparable {
                return cmp;
            }
        }
        for (a, b) in self.mem_reads.iter().zip(&other.mem_reads) {
            cmp = comb(cmp, set_compare(a, b));
            if cmp == Comparison::Incomparable {
                return cmp;
            }
        }
        for (a, b) in self.reg_stores.iter().zip(&other.reg_stores) {
            cmp = comb(cmp, a.entailment_compare(b));
            if cmp == Comparison::Incomparable {
                return cmp;
            }
        }
        cmp = comb(cmp, self.mem.entailment_compare(&other.mem));
        if cmp == Comparison::Incomparable {
            return cmp;
        }
        for (ci, (a, b)) in self.channels.iter().zip(&other.channels).enumerate() {
            cmp = entailment_compare_channels(a, b, Some(ci), cmp);
            if cmp == Comparison::Incomparable {
                return cmp;
            }
        }
        cmp
    }

    fn characterization(&self) -> Characterization {
        self.channels
            .iter()
            .enumerate()
            .map(|(ci, ch)| characterize_channel(ch, Some(ci)))
            .collect()
    }

    fn pcs(&self) -> &[StateId] {
        &self.pcs
    }

    fn channel_length(&self) -> usize {
        self.channels.iter().map(|ch| ch.len()).sum()
    }

    fn pre(&self, common: &PbCommon) -> Vec<(PTransition, Self)> {
        let mut out = Vec::new();
        for pid in 0..self.pcs.len() {
            let aut = &common.machine.automata[pid];
            for t in aut.transitions.iter().filter(|t| t.target == self.pcs[pid]) {
                for pred in self.instr_pre(pid, t, common) {
                    out.push((
                        PTransition {
                            pid,
                            source: t.source,
                            instr: t.instr.clone(),
                            target: t.target,
                        },
                        pred,
                    ));
                }
            }
        }
        for hdr in &common.msg_hdrs {
            let transition = PTransition {
                pid: hdr.wpid,
                source: self.pcs[hdr.wpid],
                instr: Instr::Update {
                    writer: hdr.wpid,
                    nmls: hdr.nmls.clone(),
                },
                target: self.pcs[hdr.wpid],
            };
            if let Some(pred) = self.update_pre(hdr, common) {
                out.push((transition.clone(), pred));
            }
            if let Some(pred) = self.widened_update_pre(hdr, common) {
                out.push((transition, pred));
            }
        }
        out
    }

    fn render(&self, common: &PbCommon) -> String {
        let m = &common.machine;
        let mut out = String::new();
        for (pid, &pc) in self.pcs.iter().enumerate() {
            if pid > 0 {
                out.push_str(", ");
            }
            out.push_str(&format!("P{pid}@{}", m.automata[pid].state_name(pc)));
        }
        for (ci, ch) in self.channels.iter().enumerate() {
            out.push_str(&format!("  b[P{ci}]: ["));
            for (i, msg) in ch.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                let names: Vec<String> =
                    msg.nmls.iter().map(|n| m.pretty_string_nml(*n)).collect();
                let values: Vec<String> = msg
                    .nmls
                    .iter()
                    .map(|n| msg.store.get(common.index(*n)).to_string())
                    .collect();
                out.push_str(&format!(
                    "<{{{}}}, {}>",
                    names.join(", "),
                    values.join(", ")
                ));
            }
            out.push(']');
        }
        out.push_str("  mem: {");
        let mut first = true;
        for (nml, idx) in &common.nml_index {
            if !first {
                out.push_str(", ");
            }
            first = false;
            out.push_str(&format!(
                "{}={}",
                m.pretty_string_nml(*nml),
                self.mem.get(*idx)
            ));
        }
        out.push_str("}  preds: [");
        for (i, v) in self.pvals.iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            out.push_str(match v {
                None => "?",
                Some(true) => "T",
                Some(false) => "F",
            });
        }
        out.push(']');
        out
    }
}
