//! Read-only tree queries derived from node coordinates.
//!
//! A [`NodeQuery`] is plain data: building one touches no storage, and the
//! same value can be executed any number of times.

use super::accessor::{Cmp, Condition, Field, Predicate};
use super::types::{Coordinate, TreeKey};

/// Sort direction over `(tree, left)`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Order {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeQuery {
    pub condition: Condition,
    pub order: Order,
    pub limit: Option<u64>,
    pub offset: u64,
}

impl NodeQuery {
    /// Every node in the collection
    pub fn all() -> Self {
        Self::default()
    }

    // ========================================================================
    // Node-relative derivations
    // ========================================================================

    /// Nodes strictly containing `node`, optionally within `depth` levels up
    pub fn ancestors(node: &Coordinate, depth: Option<i64>) -> Self {
        let mut condition = Condition::scoped(node.tree)
            .compare(Field::Left, Cmp::Lt, node.left)
            .compare(Field::Right, Cmp::Gt, node.right);
        if let Some(depth) = depth {
            condition = condition.compare(Field::Depth, Cmp::Ge, node.depth - depth);
        }
        Self::from_condition(condition)
    }

    pub fn parent(node: &Coordinate) -> Self {
        Self::ancestors(node, Some(1))
    }

    /// Nodes strictly contained by `node`, optionally within `depth` levels down
    pub fn descendants(node: &Coordinate, depth: Option<i64>) -> Self {
        let mut condition = Condition::scoped(node.tree)
            .compare(Field::Left, Cmp::Gt, node.left)
            .compare(Field::Right, Cmp::Lt, node.right);
        if let Some(depth) = depth {
            condition = condition.compare(Field::Depth, Cmp::Le, node.depth + depth);
        }
        Self::from_condition(condition)
    }

    pub fn children(node: &Coordinate) -> Self {
        Self::descendants(node, Some(1))
    }

    /// Leaves below `node`
    pub fn childless_descendants(node: &Coordinate) -> Self {
        Self::descendants(node, None).leaves()
    }

    /// `node` and everything below it
    pub fn subtree(node: &Coordinate) -> Self {
        Self::from_condition(Condition::scoped(node.tree).within(node.left, node.right))
    }

    pub fn prev_sibling(node: &Coordinate) -> Self {
        Self::from_condition(
            Condition::scoped(node.tree).compare(Field::Right, Cmp::Eq, node.left - 1),
        )
        .limit(1)
    }

    pub fn next_sibling(node: &Coordinate) -> Self {
        Self::from_condition(
            Condition::scoped(node.tree).compare(Field::Left, Cmp::Eq, node.right + 1),
        )
        .limit(1)
    }

    // ========================================================================
    // Collection filters
    // ========================================================================

    pub fn roots(self) -> Self {
        self.filter(Condition::new().compare(Field::Left, Cmp::Eq, 1))
    }

    pub fn not_roots(self) -> Self {
        self.filter(Condition::new().compare(Field::Left, Cmp::Ne, 1))
    }

    pub fn leaves(self) -> Self {
        self.filter(Condition::new().and(Predicate::Leaf(true)))
    }

    pub fn not_leaves(self) -> Self {
        self.filter(Condition::new().and(Predicate::Leaf(false)))
    }

    pub fn at_depth(self, depth: i64) -> Self {
        self.depth_range(depth, depth)
    }

    pub fn depth_range(self, min: i64, max: i64) -> Self {
        self.filter(
            Condition::new()
                .compare(Field::Depth, Cmp::Ge, min)
                .compare(Field::Depth, Cmp::Le, max),
        )
    }

    /// Nodes that are ancestors of a node with the given coordinate, in any partition
    pub fn ancestors_of(self, node: &Coordinate) -> Self {
        self.filter(
            Condition::new()
                .compare(Field::Depth, Cmp::Lt, node.depth)
                .compare(Field::Left, Cmp::Lt, node.left)
                .compare(Field::Right, Cmp::Gt, node.right),
        )
    }

    /// Nodes that are descendants of a node with the given coordinate, in any partition
    pub fn descendants_of(self, node: &Coordinate) -> Self {
        self.filter(
            Condition::new()
                .compare(Field::Depth, Cmp::Gt, node.depth)
                .compare(Field::Left, Cmp::Gt, node.left)
                .compare(Field::Right, Cmp::Lt, node.right),
        )
    }

    pub fn in_tree(self, tree: Option<TreeKey>) -> Self {
        self.filter(Condition::scoped(tree))
    }

    pub fn ordered(mut self, order: Order) -> Self {
        self.order = order;
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }

    fn from_condition(condition: Condition) -> Self {
        Self {
            condition,
            ..Self::default()
        }
    }

    fn filter(mut self, extra: Condition) -> Self {
        self.condition.predicates.extend(extra.predicates);
        self
    }
}
