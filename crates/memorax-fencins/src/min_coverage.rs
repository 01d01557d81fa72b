//! Minimal coverage (hitting sets) over families of candidate
//! synchronization sets.

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashSet};
use std::hash::Hash;

/// A cost-minimum hitting set of `family`, found by best-first
/// branch-and-bound keyed by `(cost, set)` in lexicographic order.
///
/// Expansion picks the first uncovered member and branches on each of
/// its elements; the first fully-covering candidate popped is optimal.
/// `None` when the family contains an empty (uncoverable) member.
pub fn min_coverage<T>(family: &[BTreeSet<T>], cost: &dyn Fn(&T) -> u64) -> Option<BTreeSet<T>>
where
    T: Ord + Clone + Hash,
{
    if family.iter().any(|set| set.is_empty()) {
        return None;
    }
    let mut heap: BinaryHeap<Reverse<(u64, Vec<T>)>> = BinaryHeap::new();
    let mut seen: HashSet<Vec<T>> = HashSet::new();
    heap.push(Reverse((0, Vec::new())));
    while let Some(Reverse((total, elems))) = heap.pop() {
        let chosen: BTreeSet<T> = elems.iter().cloned().collect();
        match family.iter().find(|set| set.is_disjoint(&chosen)) {
            None => return Some(chosen),
            Some(uncovered) => {
                for s in uncovered {
                    let mut next: Vec<T> = elems.clone();
                    next.push(s.clone());
                    next.sort();
                    next.dedup();
                    if seen.insert(next.clone()) {
                        heap.push(Reverse((total + cost(s), next)));
                    }
                }
            }
        }
    }
    None
}

/// All subset-minimal hitting sets of `family`. The empty family is hit
/// by the empty set alone.
pub fn min_coverage_all<T>(family: &[BTreeSet<T>]) -> Vec<BTreeSet<T>>
where
    T: Ord + Clone,
{
    if family.iter().any(|set| set.is_empty()) {
        return Vec::new();
    }
    let mut solutions: Vec<BTreeSet<T>> = Vec::new();
    let mut current: BTreeSet<T> = BTreeSet::new();
    fn rec<T: Ord + Clone>(
        family: &[BTreeSet<T>],
        current: &mut BTreeSet<T>,
        solutions: &mut Vec<BTreeSet<T>>,
    ) {
        // Prune any branch already covering a known solution.
        if solutions.iter().any(|s| s.is_subset(current)) {
            return;
        }
        match family.iter().find(|set| set.is_disjoint(current)) {
            None => solutions.push(current.clone()),
            Some(uncovered) => {
                for s in uncovered.clone() {
                    current.insert(s.clone());
                    rec(family, current, solutions);
                    current.remove(&s);
                }
            }
        }
    }
    rec(family, &mut current, &mut solutions);
    // The pruning is order-sensitive; sweep out any leftover supersets.
    let minimal: Vec<BTreeSet<T>> = solutions
        .iter()
        .filter(|s| {
            !solutions
                .iter()
                .any(|other| other != *s && other.is_subset(s))
        })
        .cloned()
        .collect();
    let mut deduped = Vec::new();
    for s in minimal {
        if !deduped.contains(&s) {
            deduped.push(s);
        }
    }
    deduped
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(sets: &[&[&'static str]]) -> Vec<BTreeSet<&'static str>> {
        sets.iter().map(|s| s.iter().copied().collect()).collect()
    }

    #[test]
    fn unit_cost_triangle() {
        let fam = family(&[&["a", "b"], &["b", "c"], &["a", "c"]]);
        let cover = min_coverage(&fam, &|_| 1).unwrap();
        assert_eq!(cover.len(), 2, "a two-element cover exists: {cover:?}");
        assert!(fam.iter().all(|set| !set.is_disjoint(&cover)));
    }

    #[test]
    fn weighted_triangle_prefers_cheap_elements() {
        let fam = family(&[&["a", "b"], &["b", "c"], &["a", "c"]]);
        let cost = |s: &&str| if *s == "a" { 3 } else { 1 };
        let cover = min_coverage(&fam, &cost).unwrap();
        assert_eq!(cover, ["b", "c"].into_iter().collect());
    }

    #[test]
    fn empty_family_is_covered_by_nothing() {
        let fam: Vec<BTreeSet<&str>> = Vec::new();
        assert_eq!(min_coverage(&fam, &|_| 1).unwrap(), BTreeSet::new());
        assert_eq!(min_coverage_all(&fam), vec![BTreeSet::new()]);
    }

    #[test]
    fn uncoverable_family() {
        let fam = family(&[&["a"], &[]]);
        assert!(min_coverage(&fam, &|_| 1).is_none());
        assert!(min_coverage_all(&fam).is_empty());
    }

    #[test]
    fn all_minimal_covers_of_triangle() {
        let fam = family(&[&["a", "b"], &["b", "c"], &["a", "c"]]);
        let all = min_coverage_all(&fam);
        assert_eq!(all.len(), 3);
        for cover in &all {
            assert_eq!(cover.len(), 2);
            assert!(fam.iter().all(|set| !set.is_disjoint(cover)));
        }
    }

    #[test]
    fn first_cover_popped_is_cost_optimal() {
        // A cheap singleton hits everything; expensive alternatives are
        // never preferred.
        let fam = family(&[&["x", "a"], &["x", "b"], &["x", "c"]]);
        let cost = |s: &&str| if *s == "x" { 2 } else { 1 };
        let cover = min_coverage(&fam, &cost).unwrap();
        assert_eq!(cover, ["x"].into_iter().collect());
    }
}
