//! Property-based test generators using proptest.

use proptest::prelude::*;
use proptest::sample::Index;

/// Number of levels in the level chain model.
pub const LEVELS: usize = 4;

/// One session operation on `Owner` rows, addressed by identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOp {
    /// `find` the row.
    Find(i64),
    /// `get_reference` the row.
    Reference(i64),
    /// Create a new instance with this identifier and persist it.
    Persist(i64),
    /// Evict the managed instance with this identifier, if any.
    Evict(i64),
    /// Clear the session.
    Clear,
}

/// Strategy for operations over identifiers `1..=max_id`.
pub fn session_op_strategy(max_id: i64) -> impl Strategy<Value = SessionOp> {
    prop_oneof![
        4 => (1..=max_id).prop_map(SessionOp::Find),
        3 => (1..=max_id).prop_map(SessionOp::Reference),
        2 => (1..=max_id).prop_map(SessionOp::Persist),
        2 => (1..=max_id).prop_map(SessionOp::Evict),
        1 => Just(SessionOp::Clear),
    ]
}

/// A node of a [`LevelPlan`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedNode {
    /// Level of the node; level `k > 0` references level `k - 1`.
    pub level: usize,
    /// Index of the referenced node; `None` on level 0.
    pub parent: Option<usize>,
}

/// A set of transient instances of the level chain model and the order in
/// which they are persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LevelPlan {
    /// Nodes, level by level.
    pub nodes: Vec<PlannedNode>,
    /// A permutation of node indices.
    pub persist_order: Vec<usize>,
}

/// Strategy for level plans with one to three nodes per level, random
/// parents and a random persist order.
pub fn level_plan_strategy() -> impl Strategy<Value = LevelPlan> {
    prop::collection::vec(1usize..4, LEVELS)
        .prop_flat_map(|counts| {
            let total: usize = counts.iter().sum();
            (
                Just(counts),
                prop::collection::vec(any::<Index>(), total),
                Just((0..total).collect::<Vec<_>>()).prop_shuffle(),
            )
        })
        .prop_map(|(counts, picks, persist_order)| {
            let mut nodes = Vec::with_capacity(picks.len());
            let mut previous: Vec<usize> = Vec::new();
            for (level, count) in counts.into_iter().enumerate() {
                let mut current = Vec::with_capacity(count);
                for _ in 0..count {
                    let parent = (!previous.is_empty())
                        .then(|| previous[picks[nodes.len()].index(previous.len())]);
                    current.push(nodes.len());
                    nodes.push(PlannedNode { level, parent });
                }
                previous = current;
            }
            LevelPlan {
                nodes,
                persist_order,
            }
        })
}

/// Returns the entity name of a level.
pub fn level_name(level: usize) -> String {
    format!("L{level}")
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #[test]
        fn plans_reference_the_previous_level(plan in level_plan_strategy()) {
            for node in &plan.nodes {
                match node.parent {
                    None => prop_assert_eq!(node.level, 0),
                    Some(p) => prop_assert_eq!(plan.nodes[p].level + 1, node.level),
                }
            }
            let mut order = plan.persist_order.clone();
            order.sort_unstable();
            prop_assert_eq!(order, (0..plan.nodes.len()).collect::<Vec<_>>());
        }

        #[test]
        fn ops_stay_in_range(op in session_op_strategy(5)) {
            match op {
                SessionOp::Find(id)
                | SessionOp::Reference(id)
                | SessionOp::Persist(id)
                | SessionOp::Evict(id) => prop_assert!((1..=5).contains(&id)),
                SessionOp::Clear => {}
            }
        }
    }
}
