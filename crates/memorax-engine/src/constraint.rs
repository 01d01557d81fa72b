//! The common constraint contract and the symbolic channel model.
//!
//! Channels are ordered sequences of in-flight writes, index 0 oldest.
//! Entailment over channels is the subword relation with own-written
//! bookkeeping; the characterization of a channel is the cheap key the
//! container buckets by.

use std::collections::BTreeSet;
use std::fmt;

use memorax_machine::lang::{ArithOp, CmpOp, Cond, CondOperand, Nml, RExpr};
use memorax_machine::{PTransition, StateId};

use crate::zstar::{comb, Comparison, Store, ZStar};

/// One in-flight write: the writing process (`None` for the initial
/// propagation sentinel), the locations written together, and the store
/// carrying the written values.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Msg {
    pub wpid: Option<usize>,
    pub nmls: BTreeSet<Nml>,
    pub store: Store,
}

impl Msg {
    pub fn new(wpid: Option<usize>, nmls: BTreeSet<Nml>, store: Store) -> Self {
        debug_assert!(!nmls.is_empty() || wpid.is_none());
        Msg { wpid, nmls, store }
    }

    /// Messages compare only against messages with the same writer and
    /// the same location set.
    pub fn entailment_compare(&self, other: &Msg) -> Comparison {
        if self.wpid != other.wpid || self.nmls != other.nmls {
            return Comparison::Incomparable;
        }
        self.store.entailment_compare(&other.store)
    }
}

/// The (writer, locations) skeleton of an own-written message, as
/// emitted into the container's bucket key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MsgCharacterization {
    pub wpid: Option<usize>,
    pub nmls: BTreeSet<Nml>,
}

/// Per-channel characterizations; one inner vector per channel.
pub type Characterization = Vec<Vec<MsgCharacterization>>;

/// Characterize one channel: walk newest-first and emit each own-written
/// message whose location group has not been emitted yet, then restore
/// oldest-first order. A channel without an owner characterizes empty.
pub fn characterize_channel(channel: &[Msg], owner: Option<usize>) -> Vec<MsgCharacterization> {
    let Some(owner) = owner else {
        return Vec::new();
    };
    let mut seen: BTreeSet<BTreeSet<Nml>> = BTreeSet::new();
    let mut chr = Vec::new();
    for msg in channel.iter().rev() {
        if msg.wpid == Some(owner) && seen.insert(msg.nmls.clone()) {
            chr.push(MsgCharacterization {
                wpid: msg.wpid,
                nmls: msg.nmls.clone(),
            });
        }
    }
    chr.reverse();
    chr
}

/// Compare two channels of one owner under an accumulated comparison.
///
/// Equal lengths compare pointwise. Otherwise the shorter channel must
/// be a subword of the longer, matched newest-to-oldest; the shorter
/// side is `Less`. Matching is monotone, own-written messages match only
/// own-written messages with the same location group, and a location
/// group already seen as own-written on the opposite side refuses to
/// match again.
pub fn entailment_compare_channels(
    a: &[Msg],
    b: &[Msg],
    owner: Option<usize>,
    acc: Comparison,
) -> Comparison {
    if a.len() == b.len() {
        let mut cmp = acc;
        for (ma, mb) in a.iter().zip(b) {
            cmp = comb(cmp, ma.entailment_compare(mb));
            if cmp == Comparison::Incomparable {
                return cmp;
            }
        }
        cmp
    } else if a.len() > b.len() {
        if comb(acc, Comparison::Greater) == Comparison::Incomparable {
            return Comparison::Incomparable;
        }
        if subword(b, a, owner) {
            Comparison::Greater
        } else {
            Comparison::Incomparable
        }
    } else {
        if comb(acc, Comparison::Less) == Comparison::Incomparable {
            return Comparison::Incomparable;
        }
        if subword(a, b, owner) {
            Comparison::Less
        } else {
            Comparison::Incomparable
        }
    }
}

/// Monotone newest-first matching of `shorter` inside `longer`. Matched
/// messages on the shorter side must entail (`Less`/`Equal`) their
/// counterparts.
fn subword(shorter: &[Msg], longer: &[Msg], owner: Option<usize>) -> bool {
    let mut seen_short: BTreeSet<BTreeSet<Nml>> = BTreeSet::new();
    let mut seen_long: BTreeSet<BTreeSet<Nml>> = BTreeSet::new();
    let is_own = |msg: &Msg| owner.is_some() && msg.wpid == owner;

    let mut i = longer.len() as isize - 1;
    let mut j = shorter.len() as isize - 1;
    while j >= 0 {
        let sj = &shorter[j as usize];
        let own = is_own(sj) && !seen_short.contains(&sj.nmls);
        if own && seen_long.contains(&sj.nmls) {
            return false;
        }
        let mut found = false;
        while i >= 0 {
            if i < j {
                // Not enough messages remain on the longer side.
                return false;
            }
            let li = &longer[i as usize];
            if is_own(li) {
                seen_long.insert(li.nmls.clone());
            }
            let candidate = if own {
                is_own(li) && li.nmls == sj.nmls
            } else {
                li.nmls == sj.nmls && li.wpid == sj.wpid
            };
            if candidate
                && matches!(
                    sj.entailment_compare(li),
                    Comparison::Less | Comparison::Equal
                )
            {
                found = true;
                i -= 1;
                break;
            }
            i -= 1;
        }
        if !found {
            return false;
        }
        if is_own(sj) {
            seen_short.insert(sj.nmls.clone());
        }
        j -= 1;
    }
    true
}

/// The capability set every constraint variant implements. The engine
/// and the container are generic over this trait; variants are concrete
/// types, so there is no dynamic dispatch and no downcasting.
pub trait Constraint: Clone + fmt::Debug {
    /// Shared read-only context built once per analysis.
    type Common;

    /// Does this constraint admit an initial configuration of the
    /// machine (initial control states, empty channels, declared
    /// initial values)?
    fn is_init_state(&self, common: &Self::Common) -> bool;

    fn entailment_compare(&self, other: &Self) -> Comparison;

    /// Cheap bucket key; comparable constraints have equal keys.
    fn characterization(&self) -> Characterization;

    fn pcs(&self) -> &[StateId];

    /// Total channel content, the worklist priority (shorter first).
    fn channel_length(&self) -> usize;

    /// All predecessors under the inverse transition relation, each with
    /// the forward transition that leads back to this constraint.
    fn pre(&self, common: &Self::Common) -> Vec<(PTransition, Self)>;

    /// Human-readable rendering with pretty names from the machine.
    fn render(&self, common: &Self::Common) -> String;
}

/// Evaluate a register expression over a symbolic register file. Any
/// wildcard operand makes the result a wildcard.
pub fn eval_rexpr(expr: &RExpr, regs: &Store) -> ZStar {
    match expr {
        RExpr::Int(n) => ZStar::Int(*n),
        RExpr::Reg(r) => regs.get(*r),
        RExpr::BinOp(lhs, op, rhs) => {
            match (eval_rexpr(lhs, regs), eval_rexpr(rhs, regs)) {
                (ZStar::Int(l), ZStar::Int(r)) => ZStar::Int(match op {
                    ArithOp::Add => l.wrapping_add(r),
                    ArithOp::Sub => l.wrapping_sub(r),
                    ArithOp::Mul => l.wrapping_mul(r),
                }),
                _ => ZStar::Star,
            }
        }
    }
}

/// Refine a register file so that `expr` can evaluate to `target`.
///
/// Exact for constants and single-register linear forms; other shapes
/// pass unrefined (the caller emits the widened candidate). `None` means
/// the expression cannot evaluate to `target`.
pub fn constrain_expr_to(expr: &RExpr, target: i64, regs: &Store) -> Option<Store> {
    match eval_rexpr(expr, regs) {
        ZStar::Int(n) => {
            if n == target {
                Some(regs.clone())
            } else {
                None
            }
        }
        ZStar::Star => match expr {
            RExpr::Reg(r) => regs.meet_at(*r, target),
            RExpr::BinOp(lhs, op, rhs) => match (lhs.as_ref(), rhs.as_ref()) {
                (RExpr::Reg(r), RExpr::Int(k)) => {
                    let wanted = match op {
                        ArithOp::Add => target.checked_sub(*k)?,
                        ArithOp::Sub => target.checked_add(*k)?,
                        ArithOp::Mul => {
                            if *k == 0 || target % *k != 0 {
                                return None;
                            }
                            target / *k
                        }
                    };
                    regs.meet_at(*r, wanted)
                }
                (RExpr::Int(k), RExpr::Reg(r)) => {
                    let wanted = match op {
                        ArithOp::Add => target.checked_sub(*k)?,
                        ArithOp::Sub => k.checked_sub(target)?,
                        ArithOp::Mul => {
                            if *k == 0 || target % *k != 0 {
                                return None;
                            }
                            target / *k
                        }
                    };
                    regs.meet_at(*r, wanted)
                }
                _ => Some(regs.clone()),
            },
            RExpr::Int(_) => unreachable!("constant evaluates concretely"),
        },
    }
}

/// Backward register assignment: the predecessor register files for
/// `reg := expr`. Usually one result; a widened file when the expression
/// cannot be inverted exactly; empty when the assignment cannot have
/// produced the observed value.
pub fn reg_assign_backward(regs: &Store, reg: usize, expr: &RExpr) -> Vec<Store> {
    let cleared = regs.assign(reg, ZStar::Star);
    match regs.get(reg) {
        ZStar::Star => vec![cleared],
        ZStar::Int(n) => {
            let mentioned = expr.regs();
            if mentioned.contains(&reg) {
                if let Some(v) = solve_linear(expr, reg, n) {
                    vec![regs.assign(reg, ZStar::Int(v))]
                } else {
                    let mut widened = cleared;
                    for r in mentioned {
                        widened = widened.assign(r, ZStar::Star);
                    }
                    vec![widened]
                }
            } else {
                match constrain_expr_to(expr, n, &cleared) {
                    Some(refined) => vec![refined],
                    None => Vec::new(),
                }
            }
        }
    }
}

/// Solve `expr = target` for a single occurrence of `reg` in a linear
/// form; `None` when the form is not invertible.
fn solve_linear(expr: &RExpr, reg: usize, target: i64) -> Option<i64> {
    match expr {
        RExpr::Reg(r) if *r == reg => Some(target),
        RExpr::BinOp(lhs, op, rhs) => match (lhs.as_ref(), rhs.as_ref()) {
            (RExpr::Reg(r), RExpr::Int(k)) if *r == reg => match op {
                ArithOp::Add => target.checked_sub(*k),
                ArithOp::Sub => target.checked_add(*k),
                ArithOp::Mul => {
                    if *k != 0 && target % *k == 0 {
                        Some(target / *k)
                    } else {
                        None
                    }
                }
            },
            (RExpr::Int(k), RExpr::Reg(r)) if *r == reg => match op {
                ArithOp::Add => target.checked_sub(*k),
                ArithOp::Sub => k.checked_sub(target),
                ArithOp::Mul => {
                    if *k != 0 && target % *k == 0 {
                        Some(target / *k)
                    } else {
                        None
                    }
                }
            },
            _ => None,
        },
        _ => None,
    }
}

/// Backward `assume`: refine the register file so the condition can
/// hold; `None` when it definitely cannot.
pub fn assume_backward(cond: &Cond, regs: &Store) -> Option<Store> {
    let mut regs = regs.clone();
    for atom in cond.atoms() {
        match atom {
            Cond::True => {}
            Cond::False => return None,
            Cond::Cmp { lhs, op, rhs } => {
                let l = cond_operand_value(lhs, &regs);
                let r = cond_operand_value(rhs, &regs);
                match (l, r) {
                    (ZStar::Int(a), ZStar::Int(b)) => {
                        if !cmp_holds(a, *op, b) {
                            return None;
                        }
                    }
                    (ZStar::Star, ZStar::Int(b)) if *op == CmpOp::Eq => {
                        if let CondOperand::Reg(r0) = lhs {
                            regs = regs.meet_at(*r0, b)?;
                        }
                    }
                    (ZStar::Int(a), ZStar::Star) if *op == CmpOp::Eq => {
                        if let CondOperand::Reg(r1) = rhs {
                            regs = regs.meet_at(*r1, a)?;
                        }
                    }
                    _ => {}
                }
            }
            Cond::And(..) => unreachable!("atoms() flattens conjunctions"),
        }
    }
    Some(regs)
}

fn cond_operand_value(op: &CondOperand, regs: &Store) -> ZStar {
    match op {
        CondOperand::Int(n) => ZStar::Int(*n),
        CondOperand::Reg(r) => regs.get(*r),
        // Memory operands in assumes are rejected at machine build.
        CondOperand::Cell(_) => ZStar::Star,
    }
}

pub fn cmp_holds(a: i64, op: CmpOp, b: i64) -> bool {
    match op {
        CmpOp::Eq => a == b,
        CmpOp::Ne => a != b,
        CmpOp::Lt => a < b,
        CmpOp::Le => a <= b,
        CmpOp::Gt => a > b,
        CmpOp::Ge => a >= b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(wpid: usize, nml: Nml, val: ZStar) -> Msg {
        let store = Store::new(4).assign(nml_index(nml), val);
        Msg::new(wpid_some(wpid), [nml].into_iter().collect(), store)
    }

    fn wpid_some(p: usize) -> Option<usize> {
        Some(p)
    }

    fn nml_index(nml: Nml) -> usize {
        match nml {
            Nml::Global(i) => i,
            Nml::Local { var, .. } => var,
        }
    }

    const X: Nml = Nml::Global(0);
    const Y: Nml = Nml::Global(1);
    const Z: Nml = Nml::Global(2);

    #[test]
    fn equal_length_channels_compare_pointwise() {
        let a = vec![msg(0, X, ZStar::Star), msg(0, Y, ZStar::Int(1))];
        let b = vec![msg(0, X, ZStar::Int(2)), msg(0, Y, ZStar::Int(1))];
        assert_eq!(
            entailment_compare_channels(&a, &b, None, Comparison::Equal),
            Comparison::Less
        );
        assert_eq!(
            entailment_compare_channels(&b, &a, None, Comparison::Equal),
            Comparison::Greater
        );
    }

    #[test]
    fn strict_subword_is_less() {
        // A = [w_p(x), w_p(y)], B = [w_p(x), w_q(z), w_p(y)]: A is a
        // strict subword of B, so A compares Less; reversed, Greater.
        let a = vec![msg(0, X, ZStar::Int(1)), msg(0, Y, ZStar::Int(1))];
        let b = vec![
            msg(0, X, ZStar::Int(1)),
            msg(1, Z, ZStar::Int(1)),
            msg(0, Y, ZStar::Int(1)),
        ];
        assert_eq!(
            entailment_compare_channels(&a, &b, None, Comparison::Equal),
            Comparison::Less
        );
        assert_eq!(
            entailment_compare_channels(&b, &a, None, Comparison::Equal),
            Comparison::Greater
        );
    }

    #[test]
    fn subword_direction_must_agree_with_accumulator() {
        let a = vec![msg(0, X, ZStar::Int(1))];
        let b = vec![msg(0, X, ZStar::Int(1)), msg(1, Z, ZStar::Int(1))];
        // a is shorter (Less), but the accumulated comparison is Greater.
        assert_eq!(
            entailment_compare_channels(&a, &b, None, Comparison::Greater),
            Comparison::Incomparable
        );
    }

    #[test]
    fn subword_matching_is_monotone() {
        // Matching must not cross: [w_p(x), w_q(z)] inside
        // [w_q(z), w_p(x)] would need a swap.
        let a = vec![msg(0, X, ZStar::Int(1)), msg(1, Z, ZStar::Int(1))];
        let b = vec![
            msg(1, Z, ZStar::Int(1)),
            msg(0, X, ZStar::Int(1)),
            msg(0, Y, ZStar::Int(1)),
        ];
        assert_eq!(
            entailment_compare_channels(&a, &b, None, Comparison::Equal),
            Comparison::Incomparable
        );
    }

    #[test]
    fn own_written_messages_match_only_own_written() {
        // Owner 0's newest write of {x} cannot be matched against a
        // dummy or foreign message for the same location.
        let own = vec![msg(0, X, ZStar::Int(1))];
        let foreign = vec![msg(1, X, ZStar::Int(1)), msg(0, X, ZStar::Int(1))];
        assert_eq!(
            entailment_compare_channels(&own, &foreign, Some(0), Comparison::Equal),
            Comparison::Less
        );
        // Without the own message on the longer side, no match.
        let foreign_only = vec![msg(1, X, ZStar::Int(1))];
        assert_eq!(
            entailment_compare_channels(&own, &foreign_only, Some(0), Comparison::Equal),
            Comparison::Incomparable
        );
    }

    #[test]
    fn characterization_emits_newest_own_groups_in_channel_order() {
        let channel = vec![
            msg(0, X, ZStar::Int(1)),
            msg(1, Z, ZStar::Int(1)),
            msg(0, Y, ZStar::Int(2)),
            msg(0, Y, ZStar::Int(3)),
        ];
        let chr = characterize_channel(&channel, Some(0));
        assert_eq!(chr.len(), 2);
        assert_eq!(chr[0].nmls, [X].into_iter().collect());
        assert_eq!(chr[1].nmls, [Y].into_iter().collect());
        assert!(characterize_channel(&channel, None).is_empty());
        assert!(characterize_channel(&channel, Some(2)).is_empty());
    }

    #[test]
    fn eval_and_constrain_expressions() {
        let regs = Store::new(2);
        let e = RExpr::BinOp(Box::new(RExpr::Reg(0)), ArithOp::Add, Box::new(RExpr::Int(1)));
        assert_eq!(eval_rexpr(&e, &regs), ZStar::Star);
        let refined = constrain_expr_to(&e, 5, &regs).unwrap();
        assert_eq!(refined.get(0), ZStar::Int(4));
        let concrete = regs.assign(0, ZStar::Int(2));
        assert_eq!(eval_rexpr(&e, &concrete), ZStar::Int(3));
        assert!(constrain_expr_to(&e, 5, &concrete).is_none());
        assert!(constrain_expr_to(&RExpr::Int(3), 3, &regs).is_some());
        assert!(constrain_expr_to(&RExpr::Int(3), 4, &regs).is_none());
    }
}
