//! VIPS-M: explicit-state forward reachability over bit-packed
//! configurations.
//!
//! Each configuration packs, into a small word vector: per-process
//! control states and registers, main memory, and a per-process,
//! per-location L1 entry (invalid / clean / dirty plus a value).
//! The cache protocol events `fetch`, `wrllc` and `evict` are system
//! transitions; `fence` demands a dirty-free L1 and self-invalidates.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use memorax_machine::lang::{Instr, Nml};
use memorax_machine::{Machine, PTransition, StateId};
use tracing::info;

use crate::errors::EngineError;
use crate::reachability::{ReachResult, SearchStats};
use crate::trace::{Trace, TraceStep};

const L1_INVALID: u64 = 0;
const L1_CLEAN: u64 = 1;
const L1_DIRTY: u64 = 2;

fn mask(width: u32) -> u64 {
    if width >= 64 {
        u64::MAX
    } else {
        (1u64 << width) - 1
    }
}

fn bits_for(range: u64) -> u32 {
    (64 - range.leading_zeros()).max(1)
}

/// One packed field: always contained in a single word.
#[derive(Debug, Clone, Copy)]
struct Field {
    word: usize,
    shift: u32,
    width: u32,
}

impl Field {
    fn get(&self, data: &[u64]) -> u64 {
        (data[self.word] >> self.shift) & mask(self.width)
    }

    fn set(&self, data: &mut [u64], v: u64) {
        debug_assert!(v <= mask(self.width));
        data[self.word] =
            (data[self.word] & !(mask(self.width) << self.shift)) | (v << self.shift);
    }
}

#[derive(Default)]
struct LayoutBuilder {
    bits: usize,
}

impl LayoutBuilder {
    fn alloc(&mut self, width: u32) -> Field {
        debug_assert!(width <= 64);
        if self.bits % 64 + width as usize > 64 {
            self.bits = (self.bits / 64 + 1) * 64;
        }
        let field = Field {
            word: self.bits / 64,
            shift: (self.bits % 64) as u32,
            width,
        };
        self.bits += width as usize;
        field
    }

    fn words(&self) -> usize {
        self.bits.div_ceil(64)
    }
}

/// A bit-packed VIPS-M configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VipsBitConstraint {
    data: Vec<u64>,
}

/// Precomputed bit layout and machine tables for one VIPS analysis.
/// Every variable and register needs a declared finite domain.
pub struct VipsCommon {
    pub machine: Machine,
    words: usize,
    pc_fields: Vec<Field>,
    mem_fields: Vec<Field>,
    l1_state: Vec<Vec<Field>>,
    l1_value: Vec<Vec<Field>>,
    reg_fields: Vec<Vec<Field>>,
    nml_index: BTreeMap<Nml, usize>,
    nmls: Vec<Nml>,
    domains: Vec<(i64, i64)>,
    reg_domains: Vec<Vec<(i64, i64)>>,
}

impl VipsCommon {
    pub fn new(machine: Machine) -> Result<Self, EngineError> {
        let nmls = machine.all_nmls();
        let nml_index: BTreeMap<Nml, usize> =
            nmls.iter().enumerate().map(|(i, n)| (*n, i)).collect();
        let mut domains = Vec::new();
        for nml in &nmls {
            let dom = machine
                .domain(*nml)
                .ok_or_else(|| EngineError::UnboundedDomain(machine.pretty_string_nml(*nml)))?;
            domains.push(dom);
        }
        let mut reg_domains = Vec::new();
        for (pid, regs) in machine.regs.iter().enumerate() {
            let mut doms = Vec::new();
            for r in regs {
                let dom = r.domain.ok_or_else(|| {
                    EngineError::UnboundedDomain(format!("${} (P{pid})", r.name))
                })?;
                doms.push(dom);
            }
            reg_domains.push(doms);
        }

        let mut layout = LayoutBuilder::default();
        let pc_fields: Vec<Field> = machine
            .automata
            .iter()
            .map(|aut| layout.alloc(bits_for(aut.states.len().saturating_sub(1) as u64)))
            .collect();
        let mem_fields: Vec<Field> = domains
            .iter()
            .map(|(lo, hi)| layout.alloc(bits_for((hi - lo) as u64)))
            .collect();
        let nprocs = machine.automata.len();
        let mut l1_state = Vec::new();
        let mut l1_value = Vec::new();
        for _ in 0..nprocs {
            l1_state.push(
                domains
                    .iter()
                    .map(|_| layout.alloc(2))
                    .collect::<Vec<Field>>(),
            );
            l1_value.push(
                domains
                    .iter()
                    .map(|(lo, hi)| layout.alloc(bits_for((hi - lo) as u64)))
                    .collect::<Vec<Field>>(),
            );
        }
        let reg_fields: Vec<Vec<Field>> = reg_domains
            .iter()
            .map(|doms| {
                doms.iter()
                    .map(|(lo, hi)| layout.alloc(bits_for((hi - lo) as u64)))
                    .collect()
            })
            .collect();

        Ok(VipsCommon {
            words: layout.words(),
            pc_fields,
            mem_fields,
            l1_state,
            l1_value,
            reg_fields,
            nml_index,
            nmls,
            domains,
            reg_domains,
            machine,
        })
    }

    fn index(&self, nml: Nml) -> usize {
        self.nml_index[&nml]
    }

    fn pc(&self, c: &VipsBitConstraint, pid: usize) -> StateId {
        self.pc_fields[pid].get(&c.data) as StateId
    }

    fn mem_value(&self, c: &VipsBitConstraint, idx: usize) -> i64 {
        self.mem_fields[idx].get(&c.data) as i64 + self.domains[idx].0
    }

    fn set_mem_value(&self, c: &mut VipsBitConstraint, idx: usize, v: i64) -> bool {
        let (lo, hi) = self.domains[idx];
        if v < lo || v > hi {
            return false;
        }
        self.mem_fields[idx].set(&mut c.data, (v - lo) as u64);
        true
    }

    fn l1(&self, c: &VipsBitConstraint, pid: usize, idx: usize) -> (u64, i64) {
        (
            self.l1_state[pid][idx].get(&c.data),
            self.l1_value[pid][idx].get(&c.data) as i64 + self.domains[idx].0,
        )
    }

    fn set_l1(&self, c: &mut VipsBitConstraint, pid: usize, idx: usize, state: u64, v: i64) -> bool {
        let (lo, hi) = self.domains[idx];
        if v < lo || v > hi {
            return false;
        }
        self.l1_state[pid][idx].set(&mut c.data, state);
        self.l1_value[pid][idx].set(&mut c.data, (v - lo) as u64);
        true
    }

    fn regs_of(&self, c: &VipsBitConstraint, pid: usize) -> Vec<i64> {
        self.reg_fields[pid]
            .iter()
            .zip(&self.reg_domains[pid])
            .map(|(f, (lo, _))| f.get(&c.data) as i64 + lo)
            .collect()
    }

    fn set_reg(&self, c: &mut VipsBitConstraint, pid: usize, reg: usize, v: i64) -> bool {
        let (lo, hi) = self.reg_domains[pid][reg];
        if v < lo || v > hi {
            return false;
        }
        self.reg_fields[pid][reg].set(&mut c.data, (v - lo) as u64);
        true
    }

    fn is_forbidden(&self, c: &VipsBitConstraint) -> bool {
        self.machine.forbidden.iter().any(|tuple| {
            tuple
                .iter()
                .enumerate()
                .all(|(pid, &state)| self.pc(c, pid) == state)
        })
    }

    /// All initial configurations: wildcard declarations fan out over
    /// their domains.
    pub fn init_states(&self) -> Vec<VipsBitConstraint> {
        let blank = VipsBitConstraint {
            data: vec![0; self.words],
        };
        let mut states = vec![blank];
        for (idx, nml) in self.nmls.iter().enumerate() {
            let values: Vec<i64> = match self.machine.init_value(*nml) {
                memorax_dsl::ast::InitValue::Int(v) => vec![v],
                memorax_dsl::ast::InitValue::Wild => {
                    (self.domains[idx].0..=self.domains[idx].1).collect()
                }
            };
            states = states
                .into_iter()
                .flat_map(|s| {
                    values.iter().filter_map(move |v| {
                        let mut s2 = s.clone();
                        self.set_mem_value(&mut s2, idx, *v).then_some(s2)
                    })
                })
                .collect();
        }
        for pid in 0..self.machine.proc_count() {
            for (reg, decl) in self.machine.regs[pid].iter().enumerate() {
                let values: Vec<i64> = match decl.init {
                    memorax_dsl::ast::InitValue::Int(v) => vec![v],
                    memorax_dsl::ast::InitValue::Wild => {
                        let (lo, hi) = self.reg_domains[pid][reg];
                        (lo..=hi).collect()
                    }
                };
                states = states
                    .into_iter()
                    .flat_map(|s| {
                        values.iter().filter_map(move |v| {
                            let mut s2 = s.clone();
                            self.set_reg(&mut s2, pid, reg, *v).then_some(s2)
                        })
                    })
                    .collect();
            }
        }
        // L1 entries start invalid; the packed value bits are zero and
        // meaningless until the entry becomes valid.
        states
    }

    fn successors(&self, c: &VipsBitConstraint) -> Vec<(PTransition, VipsBitConstraint)> {
        let mut out = Vec::new();
        for pid in 0..self.machine.proc_count() {
            let pc = self.pc(c, pid);
            let aut = &self.machine.automata[pid];
            for t in aut.transitions_from(pc) {
                if let Some(succ) = self.step(c, pid, &t.instr, t.target) {
                    out.push((
                        PTransition {
                            pid,
                            source: pc,
                            instr: t.instr.clone(),
                            target: t.target,
                        },
                        succ,
                    ));
                }
            }
            // Cache protocol events.
            for idx in 0..self.nmls.len() {
                let (state, value) = self.l1(c, pid, idx);
                let nml = self.nmls[idx];
                let event = |instr: Instr, succ: VipsBitConstraint| {
                    (
                        PTransition {
                            pid,
                            source: pc,
                            instr,
                            target: pc,
                        },
                        succ,
                    )
                };
                match state {
                    L1_INVALID => {
                        let mut s2 = c.clone();
                        if self.set_l1(&mut s2, pid, idx, L1_CLEAN, self.mem_value(c, idx)) {
                            out.push(event(Instr::Fetch { nml }, s2));
                        }
                    }
                    L1_CLEAN => {
                        let mut s2 = c.clone();
                        self.l1_state[pid][idx].set(&mut s2.data, L1_INVALID);
                        out.push(event(Instr::Evict { nml }, s2));
                    }
                    L1_DIRTY => {
                        let mut s2 = c.clone();
                        if self.set_mem_value(&mut s2, idx, value)
                            && self.set_l1(&mut s2, pid, idx, L1_CLEAN, value)
                        {
                            out.push(event(Instr::Wrllc { nml }, s2));
                        }
                    }
                    _ => unreachable!("two-bit L1 state"),
                }
            }
        }
        out
    }

    fn step(
        &self,
        c: &VipsBitConstraint,
        pid: usize,
        instr: &Instr,
        target: StateId,
    ) -> Option<VipsBitConstraint> {
        let mut s = c.clone();
        match instr {
            Instr::Nop => {}
            Instr::Fence => {
                for idx in 0..self.nmls.len() {
                    let (state, _) = self.l1(c, pid, idx);
                    if state == L1_DIRTY {
                        return None;
                    }
                    self.l1_state[pid][idx].set(&mut s.data, L1_INVALID);
                }
            }
            Instr::ReadAssert { nml, expr } => {
                let idx = self.index(*nml);
                let (state, value) = self.l1(c, pid, idx);
                if state == L1_INVALID {
                    return None;
                }
                let regs = self.regs_of(c, pid);
                if value != expr.eval(&regs) {
                    return None;
                }
            }
            Instr::ReadAssign { reg, nml } => {
                let idx = self.index(*nml);
                let (state, value) = self.l1(c, pid, idx);
                if state == L1_INVALID {
                    return None;
                }
                if !self.set_reg(&mut s, pid, *reg, value) {
                    return None;
                }
            }
            Instr::Write { nml, expr } => {
                let idx = self.index(*nml);
                let regs = self.regs_of(c, pid);
                if !self.set_l1(&mut s, pid, idx, L1_DIRTY, expr.eval(&regs)) {
                    return None;
                }
            }
            Instr::RegAssign { reg, expr } => {
                let regs = self.regs_of(c, pid);
                if !self.set_reg(&mut s, pid, *reg, expr.eval(&regs)) {
                    return None;
                }
            }
            Instr::Assume { cond } => {
                let regs = self.regs_of(c, pid);
                if !cond.eval(&regs, &|_| 0) {
                    return None;
                }
            }
            Instr::Locked { body, .. } => {
                // Atomic against the shared level; touched entries must
                // not be dirty and end invalid.
                let mut touched = Vec::new();
                for instr in body {
                    match instr {
                        Instr::ReadAssert { nml, .. }
                        | Instr::ReadAssign { nml, .. }
                        | Instr::Write { nml, .. } => touched.push(self.index(*nml)),
                        _ => {}
                    }
                }
                for &idx in &touched {
                    if self.l1(c, pid, idx).0 == L1_DIRTY {
                        return None;
                    }
                }
                for instr in body {
                    let regs = self.regs_of(&s, pid);
                    match instr {
                        Instr::Nop => {}
                        Instr::ReadAssert { nml, expr } => {
                            let idx = self.index(*nml);
                            if self.mem_value(&s, idx) != expr.eval(&regs) {
                                return None;
                            }
                        }
                        Instr::ReadAssign { reg, nml } => {
                            let idx = self.index(*nml);
                            let v = self.mem_value(&s, idx);
                            if !self.set_reg(&mut s, pid, *reg, v) {
                                return None;
                            }
                        }
                        Instr::Write { nml, expr } => {
                            let idx = self.index(*nml);
                            if !self.set_mem_value(&mut s, idx, expr.eval(&regs)) {
                                return None;
                            }
                        }
                        Instr::RegAssign { reg, expr } => {
                            if !self.set_reg(&mut s, pid, *reg, expr.eval(&regs)) {
                                return None;
                            }
                        }
                        Instr::Assume { cond } => {
                            if !cond.eval(&regs, &|_| 0) {
                                return None;
                            }
                        }
                        _ => return None,
                    }
                }
                for idx in touched {
                    self.l1_state[pid][idx].set(&mut s.data, L1_INVALID);
                }
            }
            Instr::SyncRead { body } => {
                // A synchronized read observes a fresh copy of the
                // shared level; its own pending write-back must drain
                // first. The fetched copy stays clean in L1.
                match body.as_ref() {
                    Instr::ReadAssert { nml, expr } => {
                        let idx = self.index(*nml);
                        if self.l1(c, pid, idx).0 == L1_DIRTY {
                            return None;
                        }
                        let fresh = self.mem_value(c, idx);
                        let regs = self.regs_of(c, pid);
                        if fresh != expr.eval(&regs) {
                            return None;
                        }
                        if !self.set_l1(&mut s, pid, idx, L1_CLEAN, fresh) {
                            return None;
                        }
                    }
                    Instr::ReadAssign { reg, nml } => {
                        let idx = self.index(*nml);
                        if self.l1(c, pid, idx).0 == L1_DIRTY {
                            return None;
                        }
                        let fresh = self.mem_value(c, idx);
                        if !self.set_l1(&mut s, pid, idx, L1_CLEAN, fresh)
                            || !self.set_reg(&mut s, pid, *reg, fresh)
                        {
                            return None;
                        }
                    }
                    _ => return None,
                }
            }
            Instr::Update { .. } | Instr::Fetch { .. } | Instr::Wrllc { .. }
            | Instr::Evict { .. } => return None,
        }
        self.pc_fields[pid].set(&mut s.data, target as u64);
        Some(s)
    }

    pub fn render(&self, c: &VipsBitConstraint) -> String {
        let m = &self.machine;
        let mut out = String::new();
        for pid in 0..m.proc_count() {
            if pid > 0 {
                out.push_str(", ");
            }
            out.push_str(&format!(
                "P{pid}@{}",
                m.automata[pid].state_name(self.pc(c, pid))
            ));
        }
        out.push_str("  mem: {");
        for (i, nml) in self.nmls.iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            out.push_str(&format!(
                "{}={}",
                m.pretty_string_nml(*nml),
                self.mem_value(c, i)
            ));
        }
        out.push('}');
        for pid in 0..m.proc_count() {
            out.push_str(&format!("  L1[P{pid}]: {{"));
            let mut first = true;
            for (i, nml) in self.nmls.iter().enumerate() {
                let (state, value) = self.l1(c, pid, i);
                if state == L1_INVALID {
                    continue;
                }
                if !first {
                    out.push_str(", ");
                }
                first = false;
                let tag = if state == L1_DIRTY { "d" } else { "c" };
                out.push_str(&format!("{}={value}{tag}", m.pretty_string_nml(*nml)));
            }
            out.push('}');
        }
        out
    }
}

/// Forward breadth-first reachability of the forbidden control tuples.
pub fn reachability_vips(common: &VipsCommon) -> ReachResult {
    let mut stats = SearchStats::default();
    let mut visited: HashSet<VipsBitConstraint> = HashSet::new();
    let mut parent: HashMap<VipsBitConstraint, (VipsBitConstraint, PTransition)> = HashMap::new();
    let mut queue: VecDeque<VipsBitConstraint> = VecDeque::new();

    for init in common.init_states() {
        if visited.insert(init.clone()) {
            queue.push_back(init);
            stats.inserted += 1;
        }
    }
    info!(initial = queue.len(), "vips forward search started");

    let trace_of = |parent: &HashMap<VipsBitConstraint, (VipsBitConstraint, PTransition)>,
                    last: &VipsBitConstraint| {
        let mut chain = vec![(None, last.clone())];
        let mut cur = last.clone();
        while let Some((prev, t)) = parent.get(&cur) {
            chain.push((Some(t.clone()), prev.clone()));
            cur = prev.clone();
        }
        chain.reverse();
        let mut steps = Vec::new();
        let mut carried: Option<PTransition> = None;
        for (t, state) in chain {
            steps.push(TraceStep {
                transition: carried.take(),
                constraint: common.render(&state),
            });
            carried = t;
        }
        Trace { steps }
    };

    while let Some(state) = queue.pop_front() {
        stats.popped += 1;
        if common.is_forbidden(&state) {
            info!(explored = stats.popped, "forbidden configuration reached");
            return ReachResult::Reachable {
                trace: trace_of(&parent, &state),
                stats,
            };
        }
        for (t, succ) in common.successors(&state) {
            if visited.insert(succ.clone()) {
                parent.insert(succ.clone(), (state.clone(), t));
                queue.push_back(succ);
                stats.inserted += 1;
            }
        }
    }
    info!(explored = stats.popped, "state space exhausted");
    ReachResult::Unreachable { stats }
}
