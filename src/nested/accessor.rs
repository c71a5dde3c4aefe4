//! Storage seam for the tree core.
//!
//! The mutator never builds SQL. It describes row selections as a
//! [`Condition`] and column arithmetic as [`FieldChange`]s, and a
//! [`RowAccessor`] implementation resolves both against its backing table.

use async_trait::async_trait;
use serde_json::Value;

use super::query::NodeQuery;
use super::storage::TreeSchema;
use super::types::{Coordinate, NestedSetError, NewRow, Node, NodeId, TreeKey};

/// Coordinate column addressed by a predicate or a change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Left,
    Right,
    Depth,
}

impl Field {
    pub fn of(&self, coordinate: &Coordinate) -> i64 {
        match self {
            Field::Left => coordinate.left,
            Field::Right => coordinate.right,
            Field::Depth => coordinate.depth,
        }
    }

    fn slot<'a>(&self, coordinate: &'a mut Coordinate) -> &'a mut i64 {
        match self {
            Field::Left => &mut coordinate.left,
            Field::Right => &mut coordinate.right,
            Field::Depth => &mut coordinate.depth,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cmp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Cmp {
    pub fn holds(&self, lhs: i64, rhs: i64) -> bool {
        match self {
            Cmp::Eq => lhs == rhs,
            Cmp::Ne => lhs != rhs,
            Cmp::Lt => lhs < rhs,
            Cmp::Le => lhs <= rhs,
            Cmp::Gt => lhs > rhs,
            Cmp::Ge => lhs >= rhs,
        }
    }

    pub fn as_sql(&self) -> &'static str {
        match self {
            Cmp::Eq => "=",
            Cmp::Ne => "<>",
            Cmp::Lt => "<",
            Cmp::Le => "<=",
            Cmp::Gt => ">",
            Cmp::Ge => ">=",
        }
    }
}

/// One term of a [`Condition`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    Compare { field: Field, cmp: Cmp, value: i64 },
    /// `right = left + 1` when true, `right > left + 1` when false
    Leaf(bool),
    Tree(TreeKey),
    Id(NodeId),
}

impl Predicate {
    pub fn matches(&self, node: &Node) -> bool {
        let c = &node.coordinate;
        match self {
            Predicate::Compare { field, cmp, value } => cmp.holds(field.of(c), *value),
            Predicate::Leaf(true) => c.right == c.left + 1,
            Predicate::Leaf(false) => c.right > c.left + 1,
            Predicate::Tree(key) => c.tree == Some(*key),
            Predicate::Id(id) => node.id == *id,
        }
    }
}

/// Conjunction of predicates; an empty condition matches every row
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Condition {
    pub predicates: Vec<Predicate>,
}

impl Condition {
    pub fn new() -> Self {
        Self::default()
    }

    /// Condition scoped to a partition; no-op for unpartitioned trees
    pub fn scoped(tree: Option<TreeKey>) -> Self {
        Self::new().tree(tree)
    }

    pub fn and(mut self, predicate: Predicate) -> Self {
        self.predicates.push(predicate);
        self
    }

    pub fn compare(self, field: Field, cmp: Cmp, value: i64) -> Self {
        self.and(Predicate::Compare { field, cmp, value })
    }

    pub fn tree(self, tree: Option<TreeKey>) -> Self {
        match tree {
            Some(key) => self.and(Predicate::Tree(key)),
            None => self,
        }
    }

    pub fn id(self, id: NodeId) -> Self {
        self.and(Predicate::Id(id))
    }

    /// Rows whose bounds lie within `[left, right]`: a subtree, root included
    pub fn within(self, left: i64, right: i64) -> Self {
        self.compare(Field::Left, Cmp::Ge, left)
            .compare(Field::Right, Cmp::Le, right)
    }

    pub fn matches(&self, node: &Node) -> bool {
        self.predicates.iter().all(|p| p.matches(node))
    }
}

/// Typed column update applied by a bulk statement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldChange {
    /// `field = field + delta`
    Add { field: Field, delta: i64 },
    /// `tree = key`
    SetTree(TreeKey),
}

impl FieldChange {
    pub fn add(field: Field, delta: i64) -> Self {
        FieldChange::Add { field, delta }
    }

    /// Apply to an in-memory coordinate
    pub fn apply(&self, coordinate: &mut Coordinate) {
        match self {
            FieldChange::Add { field, delta } => *field.slot(coordinate) += delta,
            FieldChange::SetTree(key) => coordinate.tree = Some(*key),
        }
    }
}

/// Row-level access to the node collection.
///
/// Every change list is evaluated against the row values as they were before
/// the statement, the way a single SQL `UPDATE` behaves.
#[async_trait]
pub trait RowAccessor: Send {
    /// Fetch the current row for `id`
    async fn read(&mut self, id: NodeId) -> Result<Option<Node>, NestedSetError>;

    /// Insert a row and return its assigned id
    async fn insert(&mut self, row: NewRow) -> Result<NodeId, NestedSetError>;

    /// Replace a row's payload
    async fn update_metadata(
        &mut self,
        id: NodeId,
        metadata: Option<Value>,
    ) -> Result<u64, NestedSetError>;

    async fn bulk_update(
        &mut self,
        condition: &Condition,
        changes: &[FieldChange],
    ) -> Result<u64, NestedSetError>;

    async fn bulk_delete(&mut self, condition: &Condition) -> Result<u64, NestedSetError>;

    async fn count(&mut self, condition: &Condition) -> Result<u64, NestedSetError>;

    async fn select(&mut self, query: &NodeQuery) -> Result<Vec<Node>, NestedSetError>;

    async fn exists(&mut self, condition: &Condition) -> Result<bool, NestedSetError> {
        Ok(self.count(condition).await? > 0)
    }

    /// Number of roots in a partition, or in the whole collection
    async fn count_roots(&mut self, tree: Option<TreeKey>) -> Result<u64, NestedSetError> {
        self.count(&Condition::scoped(tree).compare(Field::Left, Cmp::Eq, 1))
            .await
    }
}

/// A collection that hands out accessors and scopes transactions.
///
/// Dropping a transaction without committing it must discard its writes.
#[async_trait]
pub trait RowStore: Send + Sync {
    type Reader: RowAccessor + 'static;
    type Tx: RowAccessor + 'static;

    fn schema(&self) -> &TreeSchema;

    fn partitioned(&self) -> bool {
        self.schema().partitioned()
    }

    /// Accessor for reads outside any transaction
    async fn reader(&self) -> Result<Self::Reader, NestedSetError>;

    async fn begin(&self) -> Result<Self::Tx, NestedSetError>;

    async fn commit(&self, tx: Self::Tx) -> Result<(), NestedSetError>;

    async fn rollback(&self, tx: Self::Tx) -> Result<(), NestedSetError>;
}
