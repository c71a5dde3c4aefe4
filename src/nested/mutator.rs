//! Structural operations on nested-set trees.
//!
//! Every operation runs in two phases. [`TreeMutator::plan`] re-reads the
//! subject and target, checks every precondition and computes the statements
//! the change needs without writing anything. [`TreeMutator::apply`] executes
//! those statements in order. Callers run both against the same transaction.

use serde_json::Value;

use super::accessor::{Cmp, Condition, Field, FieldChange, RowAccessor};
use super::storage::TreeSchema;
use super::types::{
    Applied, Coordinate, InvalidTargetReason, NestedSetError, NewRow, Node, NodeId, Operation,
    Position, Subject, TreeKey,
};

/// One write issued by an applied change
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    /// Insert the subject row; its id becomes the change's node
    Insert(NewRow),
    /// Key the inserted row's partition by its own id
    BackfillTree,
    Update {
        condition: Condition,
        changes: Vec<FieldChange>,
    },
    Delete(Condition),
    /// Replace the payload of an existing row
    Touch { id: NodeId, metadata: Option<Value> },
}

/// A validated operation, ready to apply
#[derive(Debug, Clone, PartialEq)]
pub struct PendingChange {
    pub operation: &'static str,
    /// Existing node the change acts on; None until a new row is inserted
    pub subject: Option<NodeId>,
    pub statements: Vec<Statement>,
    /// Partitions the statements write to, sorted and deduplicated.
    /// `None` stands for the whole collection of an unpartitioned table.
    pub partitions: Vec<Option<TreeKey>>,
}

impl PendingChange {
    fn new(operation: &Operation, subject: Option<NodeId>) -> Self {
        Self {
            operation: operation.name(),
            subject,
            statements: Vec::new(),
            partitions: Vec::new(),
        }
    }

    fn touches(mut self, partition: Option<TreeKey>) -> Self {
        if let Err(index) = self.partitions.binary_search(&partition) {
            self.partitions.insert(index, partition);
        }
        self
    }

    fn then(mut self, statement: Statement) -> Self {
        self.statements.push(statement);
        self
    }

    /// Add `delta` to every left and every right `>= value` in the partition
    fn shift(self, tree: Option<TreeKey>, value: i64, delta: i64) -> Self {
        self.then(Statement::Update {
            condition: Condition::scoped(tree).compare(Field::Left, Cmp::Ge, value),
            changes: vec![FieldChange::add(Field::Left, delta)],
        })
        .then(Statement::Update {
            condition: Condition::scoped(tree).compare(Field::Right, Cmp::Ge, value),
            changes: vec![FieldChange::add(Field::Right, delta)],
        })
    }
}

/// Plans and applies structural operations
#[derive(Debug, Clone, Copy)]
pub struct TreeMutator {
    partitioned: bool,
}

impl TreeMutator {
    pub fn new(partitioned: bool) -> Self {
        Self { partitioned }
    }

    pub fn for_schema(schema: &TreeSchema) -> Self {
        Self::new(schema.partitioned())
    }

    /// Validate `operation` against fresh coordinates and compute its statements
    pub async fn plan<A: RowAccessor>(
        &self,
        rows: &mut A,
        subject: &Subject,
        operation: &Operation,
    ) -> Result<PendingChange, NestedSetError> {
        let change = match subject {
            Subject::New { metadata } => {
                self.plan_new(rows, metadata.clone(), operation).await?
            }
            Subject::Existing(id) => {
                let node = rows
                    .read(*id)
                    .await?
                    .ok_or(NestedSetError::NodeNotFound(*id))?;
                self.plan_existing(rows, &node, operation).await?
            }
        };

        tracing::debug!(
            operation = change.operation,
            statements = change.statements.len(),
            partitions = ?change.partitions,
            "Planned tree change"
        );
        Ok(change)
    }

    /// Execute a planned change statement by statement
    pub async fn apply<A: RowAccessor>(
        &self,
        rows: &mut A,
        change: PendingChange,
    ) -> Result<Applied, NestedSetError> {
        let mut node = change.subject;
        let mut deleted = 0;
        let mut rows_affected = 0;

        for statement in change.statements {
            match statement {
                Statement::Insert(row) => {
                    node = Some(rows.insert(row).await?);
                    rows_affected += 1;
                }
                Statement::BackfillTree => {
                    let id = node.ok_or_else(|| {
                        NestedSetError::Storage("Tree backfill before insert".into())
                    })?;
                    rows_affected += rows
                        .bulk_update(&Condition::new().id(id), &[FieldChange::SetTree(id)])
                        .await?;
                }
                Statement::Update { condition, changes } => {
                    rows_affected += rows.bulk_update(&condition, &changes).await?;
                }
                Statement::Delete(condition) => {
                    let removed = rows.bulk_delete(&condition).await?;
                    deleted += removed;
                    rows_affected += removed;
                }
                Statement::Touch { id, metadata } => {
                    let updated = rows.update_metadata(id, metadata).await?;
                    if updated == 0 {
                        return Err(NestedSetError::NodeNotFound(id));
                    }
                    rows_affected += updated;
                }
            }
        }

        let node = node.ok_or_else(|| NestedSetError::Storage("Change produced no node".into()))?;
        tracing::debug!(
            operation = change.operation,
            node = %node,
            deleted,
            rows_affected,
            "Applied tree change"
        );
        Ok(Applied {
            node,
            deleted,
            rows_affected,
        })
    }

    // ========================================================================
    // New nodes
    // ========================================================================

    async fn plan_new<A: RowAccessor>(
        &self,
        rows: &mut A,
        metadata: Option<Value>,
        operation: &Operation,
    ) -> Result<PendingChange, NestedSetError> {
        let change = PendingChange::new(operation, None);
        match operation {
            Operation::MakeRoot => {
                let insert = Statement::Insert(NewRow {
                    coordinate: Coordinate::root(None),
                    metadata,
                });
                if self.partitioned {
                    Ok(change.then(insert).then(Statement::BackfillTree))
                } else {
                    if rows.count_roots(None).await? > 0 {
                        return Err(NestedSetError::MultipleRootsForbidden);
                    }
                    Ok(change.touches(None).then(insert))
                }
            }
            Operation::Attach { position, target } => {
                let target = self.read_target(rows, *target).await?;
                let t = &target.coordinate;
                if position.is_sibling() && t.is_root() {
                    return Err(NestedSetError::InvalidTarget(
                        InvalidTargetReason::RootSibling,
                    ));
                }

                let value = position.insertion_value(t);
                Ok(change
                    .touches(t.tree)
                    .shift(t.tree, value, 2)
                    .then(Statement::Insert(NewRow {
                        coordinate: Coordinate {
                            left: value,
                            right: value + 1,
                            depth: t.depth + position.depth_offset(),
                            tree: t.tree,
                        },
                        metadata,
                    })))
            }
            Operation::DeleteWithDescendants | Operation::Delete => Err(
                NestedSetError::UnsupportedOperation(format!(
                    "{} needs a persisted node",
                    operation.name()
                )),
            ),
            Operation::Save { .. } => Err(NestedSetError::UnsupportedOperation(
                "a new node must be created as a root or attached to a target".into(),
            )),
        }
    }

    // ========================================================================
    // Existing nodes
    // ========================================================================

    async fn plan_existing<A: RowAccessor>(
        &self,
        rows: &mut A,
        node: &Node,
        operation: &Operation,
    ) -> Result<PendingChange, NestedSetError> {
        let change = PendingChange::new(operation, Some(node.id));
        let c = &node.coordinate;

        match operation {
            Operation::MakeRoot => {
                if !self.partitioned {
                    return Err(NestedSetError::MultipleRootsForbidden);
                }
                if c.is_root() {
                    return Err(NestedSetError::InvalidRoot(format!(
                        "node {} is already a root",
                        node.id
                    )));
                }

                let offset = 1 - c.left;
                Ok(change
                    .touches(c.tree)
                    .touches(Some(node.id))
                    .then(Statement::Update {
                        condition: Condition::scoped(c.tree).within(c.left, c.right),
                        changes: vec![
                            FieldChange::add(Field::Left, offset),
                            FieldChange::add(Field::Right, offset),
                            FieldChange::add(Field::Depth, -c.depth),
                            FieldChange::SetTree(node.id),
                        ],
                    })
                    .shift(c.tree, c.right + 1, -c.width()))
            }
            Operation::Attach { position, target } => {
                let target = self.read_target(rows, *target).await?;
                self.plan_move(change, node, &target, *position)
            }
            Operation::DeleteWithDescendants => Ok(change
                .touches(c.tree)
                .then(Statement::Delete(
                    Condition::scoped(c.tree).within(c.left, c.right),
                ))
                .shift(c.tree, c.right + 1, -c.width())),
            Operation::Delete => {
                if c.is_root() {
                    return Err(NestedSetError::InvalidRoot(format!(
                        "root {} can only be deleted together with its descendants",
                        node.id
                    )));
                }

                let change = change
                    .touches(c.tree)
                    .then(Statement::Delete(Condition::new().id(node.id)));
                let change = if c.is_leaf() {
                    change
                } else {
                    change.then(Statement::Update {
                        condition: Condition::scoped(c.tree).within(c.left, c.right),
                        changes: vec![
                            FieldChange::add(Field::Left, -1),
                            FieldChange::add(Field::Right, -1),
                            FieldChange::add(Field::Depth, -1),
                        ],
                    })
                };
                Ok(change.shift(c.tree, c.right + 1, -2))
            }
            Operation::Save { metadata } => Ok(change.then(Statement::Touch {
                id: node.id,
                metadata: metadata.clone(),
            })),
        }
    }

    fn plan_move(
        &self,
        change: PendingChange,
        node: &Node,
        target: &Node,
        position: Position,
    ) -> Result<PendingChange, NestedSetError> {
        let c = &node.coordinate;
        let t = &target.coordinate;

        if target.id == node.id {
            return Err(NestedSetError::InvalidTarget(InvalidTargetReason::SameNode));
        }
        if t.is_descendant_of(c) {
            return Err(NestedSetError::InvalidTarget(InvalidTargetReason::Descendant));
        }
        if position.is_sibling() && t.is_root() {
            return Err(NestedSetError::InvalidTarget(InvalidTargetReason::RootSibling));
        }

        let value = position.insertion_value(t);
        let depth_delta = t.depth - c.depth + position.depth_offset();
        let width = c.width();

        if c.same_tree(t) {
            let tree = c.tree;
            let (left, right) = if c.left >= value {
                (c.left + width, c.right + width)
            } else {
                (c.left, c.right)
            };
            let offset = value - left;

            return Ok(change
                .touches(tree)
                .shift(tree, value, width)
                .then(Statement::Update {
                    condition: Condition::scoped(tree).within(left, right),
                    changes: vec![
                        FieldChange::add(Field::Left, offset),
                        FieldChange::add(Field::Right, offset),
                        FieldChange::add(Field::Depth, depth_delta),
                    ],
                })
                .shift(tree, right + 1, -width));
        }

        let destination = t.tree.ok_or_else(|| {
            NestedSetError::Storage(format!("Node {} has no tree key", target.id))
        })?;
        let offset = value - c.left;

        Ok(change
            .touches(c.tree)
            .touches(t.tree)
            .shift(t.tree, value, width)
            .then(Statement::Update {
                condition: Condition::scoped(c.tree).within(c.left, c.right),
                changes: vec![
                    FieldChange::add(Field::Left, offset),
                    FieldChange::add(Field::Right, offset),
                    FieldChange::add(Field::Depth, depth_delta),
                    FieldChange::SetTree(destination),
                ],
            })
            .shift(c.tree, c.right + 1, -width))
    }

    async fn read_target<A: RowAccessor>(
        &self,
        rows: &mut A,
        target: NodeId,
    ) -> Result<Node, NestedSetError> {
        rows.read(target)
            .await?
            .ok_or(NestedSetError::InvalidTarget(InvalidTargetReason::Unpersisted))
    }
}
