//! Fractional sibling ranks
//!
//! Siblings of a common parent are ordered by a fractional rank stored on
//! the `node_children` edge. The rank admits insertion between any two
//! existing keys without renumbering, which keeps reorders cheap and makes
//! concurrent reorders commute under OCC retry.
//!
//! [`RankCalculator`] computes individual insertion keys;
//! [`minimal_rank_updates`] derives the smallest set of rank changes that
//! realizes a target permutation, so a reorder that matches the current
//! order produces no writes at all.

/// Calculates the fractional rank for inserting a node between two siblings
pub struct RankCalculator;

impl RankCalculator {
    /// Smallest gap tolerated between adjacent ranks before renumbering
    pub const MIN_GAP: f64 = 1e-4;

    /// Calculate the rank for inserting between `prev` and `next`
    ///
    /// - first child: `1.0`
    /// - before the first sibling: `next - 1.0`
    /// - after the last sibling: `prev + 1.0`
    /// - between two siblings: midpoint
    pub fn between(prev: Option<f64>, next: Option<f64>) -> f64 {
        match (prev, next) {
            (None, None) => 1.0,
            (None, Some(next)) => next - 1.0,
            (Some(prev), None) => prev + 1.0,
            (Some(prev), Some(next)) => (prev + next) / 2.0,
        }
    }

    /// Check whether any adjacent gap has narrowed below the precision
    /// threshold, requiring a renumbering pass
    pub fn needs_rebalancing(ranks: &[f64]) -> bool {
        ranks
            .windows(2)
            .any(|pair| pair[1] - pair[0] < Self::MIN_GAP)
    }

    /// Evenly spaced ranks `1.0, 2.0, ..` for a full renumbering
    pub fn rebalanced(count: usize) -> Vec<f64> {
        (1..=count).map(|i| i as f64).collect()
    }
}

/// Compute the minimum set of rank updates that realizes `target_order`.
///
/// `current` is the children in their present order as `(id, rank)` pairs;
/// `target_order` is a permutation of the same ids. Nodes whose present
/// ranks already form an increasing sequence in target order keep their
/// ranks; only the displaced nodes receive new keys. Returns `(id, rank)`
/// updates, empty when the target matches the current order.
///
/// When the computed keys would crowd below the precision threshold the
/// whole sibling list is renumbered instead.
pub fn minimal_rank_updates(
    current: &[(String, f64)],
    target_order: &[String],
) -> Vec<(String, f64)> {
    if current.len() != target_order.len() {
        // Caller validates the permutation; a mismatch means stale input,
        // renumber everything to be safe.
        return target_order
            .iter()
            .cloned()
            .zip(RankCalculator::rebalanced(target_order.len()))
            .collect();
    }

    // Present rank of each node, in target order.
    let ranks_in_target: Vec<f64> = target_order
        .iter()
        .map(|id| {
            current
                .iter()
                .find(|(cid, _)| cid == id)
                .map(|(_, rank)| *rank)
                .unwrap_or(f64::NAN)
        })
        .collect();

    if ranks_in_target.iter().any(|r| r.is_nan()) {
        return target_order
            .iter()
            .cloned()
            .zip(RankCalculator::rebalanced(target_order.len()))
            .collect();
    }

    let keep = longest_increasing_run(&ranks_in_target);

    // Assign new ranks to displaced nodes, threading between kept neighbors.
    let mut updates = Vec::new();
    let mut assigned: Vec<f64> = Vec::with_capacity(ranks_in_target.len());
    for (idx, id) in target_order.iter().enumerate() {
        if keep[idx] {
            assigned.push(ranks_in_target[idx]);
            continue;
        }
        let prev = assigned.last().copied();
        let next = (idx + 1..target_order.len())
            .find(|&j| keep[j])
            .map(|j| ranks_in_target[j]);
        let rank = RankCalculator::between(prev, next);
        assigned.push(rank);
        updates.push((id.clone(), rank));
    }

    if RankCalculator::needs_rebalancing(&assigned) {
        return target_order
            .iter()
            .cloned()
            .zip(RankCalculator::rebalanced(target_order.len()))
            .collect();
    }

    updates
}

/// Mark the longest strictly increasing subsequence of `values`.
///
/// Patience-sorting variant, O(n log n); returns a keep-mask over indices.
fn longest_increasing_run(values: &[f64]) -> Vec<bool> {
    let n = values.len();
    let mut tails: Vec<usize> = Vec::new();
    let mut prev: Vec<Option<usize>> = vec![None; n];

    for i in 0..n {
        let pos = tails.partition_point(|&j| values[j] < values[i]);
        if pos > 0 {
            prev[i] = Some(tails[pos - 1]);
        }
        if pos == tails.len() {
            tails.push(i);
        } else {
            tails[pos] = i;
        }
    }

    let mut keep = vec![false; n];
    let mut cursor = tails.last().copied();
    while let Some(i) = cursor {
        keep[i] = true;
        cursor = prev[i];
    }
    keep
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_between_first_child() {
        assert_eq!(RankCalculator::between(None, None), 1.0);
    }

    #[test]
    fn test_between_before_first() {
        assert_eq!(RankCalculator::between(None, Some(2.0)), 1.0);
    }

    #[test]
    fn test_between_after_last() {
        assert_eq!(RankCalculator::between(Some(3.0), None), 4.0);
    }

    #[test]
    fn test_between_midpoint() {
        assert_eq!(RankCalculator::between(Some(1.0), Some(3.0)), 2.0);
    }

    #[test]
    fn test_needs_rebalancing() {
        assert!(!RankCalculator::needs_rebalancing(&[1.0, 2.0, 3.0]));
        assert!(RankCalculator::needs_rebalancing(&[1.0, 1.00001, 1.00002]));
    }

    fn children(pairs: &[(&str, f64)]) -> Vec<(String, f64)> {
        pairs.iter().map(|(id, r)| (id.to_string(), *r)).collect()
    }

    fn order(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_identity_order_produces_no_updates() {
        let current = children(&[("a", 1.0), ("b", 2.0), ("c", 3.0)]);
        let updates = minimal_rank_updates(&current, &order(&["a", "b", "c"]));
        assert!(updates.is_empty());
    }

    #[test]
    fn test_single_move_updates_one_node() {
        let current = children(&[("a", 1.0), ("b", 2.0), ("c", 3.0)]);
        let updates = minimal_rank_updates(&current, &order(&["c", "a", "b"]));
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].0, "c");
        assert!(updates[0].1 < 1.0);
    }

    #[test]
    fn test_swap_updates_one_node() {
        let current = children(&[("a", 1.0), ("b", 2.0)]);
        let updates = minimal_rank_updates(&current, &order(&["b", "a"]));
        assert_eq!(updates.len(), 1);
    }

    #[test]
    fn test_updated_ranks_realize_target_order() {
        let current = children(&[("a", 1.0), ("b", 2.0), ("c", 3.0), ("d", 4.0)]);
        let target = order(&["b", "d", "a", "c"]);
        let updates = minimal_rank_updates(&current, &target);

        let mut final_ranks: Vec<(String, f64)> = current.clone();
        for (id, rank) in &updates {
            final_ranks.iter_mut().find(|(cid, _)| cid == id).unwrap().1 = *rank;
        }
        final_ranks.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap());
        let realized: Vec<String> = final_ranks.into_iter().map(|(id, _)| id).collect();
        assert_eq!(realized, target);
    }

    #[test]
    fn test_crowded_ranks_trigger_full_renumbering() {
        // Moving "c" between two nearly-touching kept ranks would produce a
        // gap below the precision threshold, so the whole list renumbers.
        let current = children(&[("a", 1.0), ("b", 1.00005), ("c", 1.0001)]);
        let updates = minimal_rank_updates(&current, &order(&["a", "c", "b"]));
        assert_eq!(updates.len(), 3);
        let ranks: Vec<f64> = updates.iter().map(|(_, r)| *r).collect();
        assert_eq!(ranks, vec![1.0, 2.0, 3.0]);
    }
}
