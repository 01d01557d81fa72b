//! The PDual abstraction: one FIFO channel per process instead of the
//! single global buffer. After the initial propagation sentinel, a
//! process's channel only ever carries that process's own writes.

use std::collections::{BTreeMap, BTreeSet};

use memorax_machine::lang::{Instr, Nml, RExpr};
use memorax_machine::{Machine, PTransition, StateId, Transition};

use crate::constraint::{
    assume_backward, characterize_channel, constrain_expr_to, entailment_compare_channels,
    eval_rexpr, reg_assign_backward, Characterization, Constraint, Msg,
};
use crate::errors::EngineError;
use crate::sb::MsgHdr;
use crate::zstar::{comb, Comparison, Store, ZStar};

/// Shared read-only context for one PDual analysis.
#[derive(Debug, Clone)]
pub struct DualCommon {
    pub machine: Machine,
    pub mem_size: usize,
    reg_counts: Vec<usize>,
    nml_index: BTreeMap<Nml, usize>,
    all_nmls: BTreeSet<Nml>,
    msg_hdrs: Vec<MsgHdr>,
}

impl DualCommon {
    /// Builds the context. Multi-location locked writes cannot be
    /// expressed with per-process channels and are rejected.
    pub fn new(machine: Machine) -> Result<Self, EngineError> {
        for aut in &machine.automata {
            for t in &aut.transitions {
                if let Some(nmls) = t.instr.locked_write_nmls() {
                    if nmls.len() > 1 {
                        return Err(EngineError::UnsupportedCombination(
                            "the pdual abstraction does not support locked blocks writing \
                             multiple memory locations"
                                .into(),
                        ));
                    }
                }
            }
        }
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
        Ok(DualCommon {
            mem_size: nmls.len(),
            reg_counts: machine.regs.iter().map(|r| r.len()).collect(),
            nml_index,
            all_nmls: nmls.into_iter().collect(),
            msg_hdrs: hdrs.into_iter().collect(),
            machine,
        })
    }

    pub fn index(&self, nml: Nml) -> usize {
        self.nml_index[&nml]
    }

    pub fn bad_states(&self) -> Vec<DualChannelConstraint> {
        self.machine
            .forbidden
            .iter()
            .map(|tuple| DualChannelConstraint::for_pcs(tuple.clone(), self))
            .collect()
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

/// A symbolic PDual configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DualChannelConstraint {
    pub pcs: Vec<StateId>,
    /// One channel per process, index 0 oldest. Only messages written
    /// by process `p` (or the initial sentinel at position 0) appear in
    /// `channels[p]`.
    pub channels: Vec<Vec<Msg>>,
    pub mem: Store,
    pub reg_stores: Vec<Store>,
    pub mem_reads: Vec<BTreeSet<Nml>>,
}

impl DualChannelConstraint {
    pub fn for_pcs(pcs: Vec<StateId>, common: &DualCommon) -> Self {
        let nprocs = pcs.len();
        DualChannelConstraint {
            pcs,
            channels: vec![Vec::new(); nprocs],
            mem: Store::new(common.mem_size),
            reg_stores: common.reg_counts.iter().map(|&n| Store::new(n)).collect(),
            mem_reads: vec![BTreeSet::new(); nprocs],
        }
    }

    fn visible_msg_idx(&self, pid: usize, nml: Nml) -> Option<usize> {
        self.channels[pid]
            .iter()
            .rposition(|m| m.wpid == Some(pid) && m.nmls.contains(&nml))
    }

    fn read_pre(
        mut self,
        pid: usize,
        nml: Nml,
        expr: Option<&RExpr>,
        bound_reg: Option<usize>,
        common: &DualCommon,
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

    fn write_pre(&self, pid: usize, nml: Nml, expr: &RExpr, common: &DualCommon) -> Vec<Self> {
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

    fn fence_pre(&self, pid: usize, common: &DualCommon) -> Option<Self> {
        if !self.channels[pid].is_empty() {
            return None;
        }
        let mut c = self.clone();
        c.mem_reads[pid] = common.all_nmls.clone();
        Some(c)
    }

    fn locked_pre(&self, pid: usize, body: &[Instr], common: &DualCommon) -> Option<Self> {
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
                }
                Instr::ReadAssert { nml, expr } => {
                    let idx = common.index(*nml);
                    match eval_rexpr(expr, &c.reg_stores[pid]) {
                        ZStar::Int(k) => c.mem = c.mem.meet_at(idx, k)?,
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

    fn update_pre(&self, hdr: &MsgHdr, common: &DualCommon) -> Self {
        let mut c = self.clone();
        let mut store = Store::new(common.mem_size);
        for nml in &hdr.nmls {
            let idx = common.index(*nml);
            store = store.assign(idx, c.mem.get(idx));
            c.mem = c.mem.assign(idx, ZStar::Star);
            c.mem_reads[hdr.wpid].remove(nml);
        }
        c.channels[hdr.wpid].insert(0, Msg::new(Some(hdr.wpid), hdr.nmls.clone(), store));
        c
    }

    fn instr_pre(&self, pid: usize, t: &Transition, common: &DualCommon) -> Vec<Self> {
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

impl Constraint for DualChannelConstraint {
    type Common = DualCommon;

    fn is_init_state(&self, common: &DualCommon) -> bool {
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

    fn pre(&self, common: &DualCommon) -> Vec<(PTransition, Self)> {
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
            let pred = self.update_pre(hdr, common);
            out.push((
                PTransition {
                    pid: hdr.wpid,
                    source: self.pcs[hdr.wpid],
                    instr: Instr::Update {
                        writer: hdr.wpid,
                        nmls: hdr.nmls.clone(),
                    },
                    target: self.pcs[hdr.wpid],
                },
                pred,
            ));
        }
        out
    }

    fn render(&self, common: &DualCommon) -> String {
        let m = &common.machine;
        let mut out = String::new();
        for (pid, &pc) in self.pcs.iter().enumerate() {
            if pid > 0 {
                out.push_str(", ");
            }
            out.push_str(&format!("P{pid}@{}", m.automata[pid].state_name(pc)));
        }
        for (ci, ch) in self.channels.iter().enumerate() {
            out.push_str(&format!("  c[P{ci}]: ["));
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
                match msg.wpid {
                    Some(p) => out.push_str(&format!(
                        "<P{p}, {{{}}}, {}>",
                        names.join(", "),
                        values.join(", ")
                    )),
                    None => out.push_str("<init>"),
                }
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
        out.push('}');
        out
    }
}
