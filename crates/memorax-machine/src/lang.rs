//! Instruction language of compiled machines.
//!
//! The AST from `memorax-dsl` names locations and registers by string;
//! compilation resolves them to [`Nml`]s and register indices so the
//! engine never touches names.

use std::collections::BTreeSet;
use std::fmt;

pub use memorax_dsl::ast::{ArithOp, CmpOp};

/// Normalized memory location: a shared (global) cell or a process-local
/// cell qualified by its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Nml {
    Global(usize),
    Local { owner: usize, var: usize },
}

impl fmt::Display for Nml {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Nml::Global(i) => write!(f, "g{i}"),
            Nml::Local { owner, var } => write!(f, "l{var}[P{owner}]"),
        }
    }
}

/// Expression over a process's registers.
#[derive(Debug, Clone, PartialEq)]
pub enum RExpr {
    Int(i64),
    Reg(usize),
    BinOp(Box<RExpr>, ArithOp, Box<RExpr>),
}

impl RExpr {
    /// Concrete evaluation over a full register valuation.
    pub fn eval(&self, regs: &[i64]) -> i64 {
        match self {
            RExpr::Int(n) => *n,
            RExpr::Reg(r) => regs[*r],
            RExpr::BinOp(lhs, op, rhs) => {
                let l = lhs.eval(regs);
                let r = rhs.eval(regs);
                match op {
                    ArithOp::Add => l.wrapping_add(r),
                    ArithOp::Sub => l.wrapping_sub(r),
                    ArithOp::Mul => l.wrapping_mul(r),
                }
            }
        }
    }

    /// Registers mentioned by this expression.
    pub fn regs(&self) -> BTreeSet<usize> {
        let mut out = BTreeSet::new();
        self.collect_regs(&mut out);
        out
    }

    fn collect_regs(&self, out: &mut BTreeSet<usize>) {
        match self {
            RExpr::Int(_) => {}
            RExpr::Reg(r) => {
                out.insert(*r);
            }
            RExpr::BinOp(lhs, _, rhs) => {
                lhs.collect_regs(out);
                rhs.collect_regs(out);
            }
        }
    }
}

impl fmt::Display for RExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RExpr::Int(n) => write!(f, "{n}"),
            RExpr::Reg(r) => write!(f, "$r{r}"),
            RExpr::BinOp(lhs, op, rhs) => {
                let sym = match op {
                    ArithOp::Add => "+",
                    ArithOp::Sub => "-",
                    ArithOp::Mul => "*",
                };
                write!(f, "({lhs} {sym} {rhs})")
            }
        }
    }
}

/// Boolean condition over registers, constants and memory cells.
#[derive(Debug, Clone, PartialEq)]
pub enum Cond {
    True,
    False,
    Cmp {
        lhs: CondOperand,
        op: CmpOp,
        rhs: CondOperand,
    },
    And(Box<Cond>, Box<Cond>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum CondOperand {
    Int(i64),
    Reg(usize),
    Cell(Nml),
}

impl Cond {
    /// Concrete evaluation given a register valuation and a memory lookup.
    pub fn eval(&self, regs: &[i64], mem: &dyn Fn(Nml) -> i64) -> bool {
        match self {
            Cond::True => true,
            Cond::False => false,
            Cond::And(lhs, rhs) => lhs.eval(regs, mem) && rhs.eval(regs, mem),
            Cond::Cmp { lhs, op, rhs } => {
                let l = lhs.value(regs, mem);
                let r = rhs.value(regs, mem);
                match op {
                    CmpOp::Eq => l == r,
                    CmpOp::Ne => l != r,
                    CmpOp::Lt => l < r,
                    CmpOp::Le => l <= r,
                    CmpOp::Gt => l > r,
                    CmpOp::Ge => l >= r,
                }
            }
        }
    }

    pub fn mentions_register(&self) -> bool {
        match self {
            Cond::True | Cond::False => false,
            Cond::And(lhs, rhs) => lhs.mentions_register() || rhs.mentions_register(),
            Cond::Cmp { lhs, rhs, .. } => {
                matches!(lhs, CondOperand::Reg(_)) || matches!(rhs, CondOperand::Reg(_))
            }
        }
    }

    pub fn atoms(&self) -> Vec<&Cond> {
        match self {
            Cond::And(lhs, rhs) => {
                let mut out = lhs.atoms();
                out.extend(rhs.atoms());
                out
            }
            other => vec![other],
        }
    }
}

impl CondOperand {
    fn value(&self, regs: &[i64], mem: &dyn Fn(Nml) -> i64) -> i64 {
        match self {
            CondOperand::Int(n) => *n,
            CondOperand::Reg(r) => regs[*r],
            CondOperand::Cell(nml) => mem(*nml),
        }
    }
}

/// A compiled instruction.
///
/// `Update` never appears on automaton edges; the engine synthesizes it
/// for the propagation pseudo-transitions that move buffered writes into
/// memory, so that traces can show them.
#[derive(Debug, Clone, PartialEq)]
pub enum Instr {
    Nop,
    ReadAssert { nml: Nml, expr: RExpr },
    ReadAssign { reg: usize, nml: Nml },
    Write { nml: Nml, expr: RExpr },
    RegAssign { reg: usize, expr: RExpr },
    Assume { cond: Cond },
    Fence,
    Locked { body: Vec<Instr>, store_only: bool },
    /// A synchronized but otherwise identical read (`syncrd`):
    /// guaranteed to observe a fresh copy of its location. The body is
    /// a `ReadAssert` or `ReadAssign`.
    SyncRead { body: Box<Instr> },
    Update { writer: usize, nmls: BTreeSet<Nml> },
    /// Cache events of the VIPS-M abstraction; synthesized for traces,
    /// never present on automaton edges.
    Fetch { nml: Nml },
    Wrllc { nml: Nml },
    Evict { nml: Nml },
}

impl Instr {
    /// The set of locations written by a plain buffered write.
    pub fn buffered_write_nml(&self) -> Option<Nml> {
        match self {
            Instr::Write { nml, .. } => Some(*nml),
            _ => None,
        }
    }

    /// The combined location set written atomically by a locked block.
    pub fn locked_write_nmls(&self) -> Option<BTreeSet<Nml>> {
        match self {
            Instr::Locked { body, .. } => {
                let nmls: BTreeSet<Nml> = body
                    .iter()
                    .filter_map(|i| i.buffered_write_nml())
                    .collect();
                if nmls.is_empty() {
                    None
                } else {
                    Some(nmls)
                }
            }
            _ => None,
        }
    }
}

impl fmt::Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instr::Nop => write!(f, "nop"),
            Instr::ReadAssert { nml, expr } => write!(f, "read: {nml} = {expr}"),
            Instr::ReadAssign { reg, nml } => write!(f, "read: $r{reg} := {nml}"),
            Instr::Write { nml, expr } => write!(f, "write: {nml} := {expr}"),
            Instr::RegAssign { reg, expr } => write!(f, "$r{reg} := {expr}"),
            Instr::Assume { .. } => write!(f, "assume"),
            Instr::Fence => write!(f, "fence"),
            Instr::Locked { body, store_only } => {
                if *store_only {
                    write!(f, "slocked ")?;
                } else {
                    write!(f, "locked ")?;
                }
                write!(f, "{{ ")?;
                for (i, instr) in body.iter().enumerate() {
                    if i > 0 {
                        write!(f, "; ")?;
                    }
                    write!(f, "{instr}")?;
                }
                write!(f, " }}")
            }
            Instr::SyncRead { body } => match body.as_ref() {
                Instr::ReadAssert { nml, expr } => write!(f, "syncrd: {nml} = {expr}"),
                Instr::ReadAssign { reg, nml } => write!(f, "syncrd: $r{reg} := {nml}"),
                other => write!(f, "syncrd: {other}"),
            },
            Instr::Update { writer, nmls } => {
                write!(f, "update(P{writer}, {{")?;
                for (i, nml) in nmls.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{nml}")?;
                }
                write!(f, "}})")
            }
            Instr::Fetch { nml } => write!(f, "fetch({nml})"),
            Instr::Wrllc { nml } => write!(f, "wrllc({nml})"),
            Instr::Evict { nml } => write!(f, "evict({nml})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rexpr_eval_and_regs() {
        let e = RExpr::BinOp(
            Box::new(RExpr::Reg(0)),
            ArithOp::Add,
            Box::new(RExpr::BinOp(
                Box::new(RExpr::Int(2)),
                ArithOp::Mul,
                Box::new(RExpr::Reg(1)),
            )),
        );
        assert_eq!(e.eval(&[3, 4]), 11);
        assert_eq!(e.regs().into_iter().collect::<Vec<_>>(), vec![0, 1]);
    }

    #[test]
    fn cond_eval() {
        let c = Cond::And(
            Box::new(Cond::Cmp {
                lhs: CondOperand::Reg(0),
                op: CmpOp::Le,
                rhs: CondOperand::Int(5),
            }),
            Box::new(Cond::Cmp {
                lhs: CondOperand::Cell(Nml::Global(0)),
                op: CmpOp::Eq,
                rhs: CondOperand::Int(1),
            }),
        );
        assert!(c.eval(&[5], &|_| 1));
        assert!(!c.eval(&[6], &|_| 1));
        assert!(!c.eval(&[5], &|_| 0));
        assert_eq!(c.atoms().len(), 2);
    }

    #[test]
    fn locked_write_set_is_combined() {
        let locked = Instr::Locked {
            body: vec![
                Instr::ReadAssert {
                    nml: Nml::Global(0),
                    expr: RExpr::Int(0),
                },
                Instr::Write {
                    nml: Nml::Global(0),
                    expr: RExpr::Int(1),
                },
                Instr::Write {
                    nml: Nml::Global(1),
                    expr: RExpr::Int(2),
                },
            ],
            store_only: false,
        };
        let nmls = locked.locked_write_nmls().unwrap();
        assert_eq!(nmls.len(), 2);
        assert!(nmls.contains(&Nml::Global(0)));
    }
}
