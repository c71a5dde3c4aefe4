//! In-memory node collection with snapshot transactions.

use super::accessor::{Condition, FieldChange, RowAccessor, RowStore};
use super::query::{NodeQuery, Order};
use super::storage::{current_timestamp, TreeSchema};
use super::types::{NestedSetError, NewRow, Node, NodeId, RowId};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;

#[derive(Debug, Clone, Default)]
struct MemoryTable {
    rows: BTreeMap<NodeId, Node>,
    last_id: i64,
}

/// Node collection held in process memory.
///
/// Readers work on a copy of the last committed table. A transaction holds
/// the single writer slot and its own copy, which replaces the committed
/// table on commit and is thrown away otherwise.
#[derive(Clone)]
pub struct MemoryRowStore {
    schema: Arc<TreeSchema>,
    table: Arc<Mutex<MemoryTable>>,
    writer: Arc<tokio::sync::Mutex<()>>,
}

impl MemoryRowStore {
    pub fn new(schema: TreeSchema) -> Result<Self, NestedSetError> {
        schema.validate()?;
        Ok(Self {
            schema: Arc::new(schema),
            table: Arc::new(Mutex::new(MemoryTable::default())),
            writer: Arc::new(tokio::sync::Mutex::new(())),
        })
    }

    /// Committed rows ordered by id
    pub fn nodes(&self) -> Result<Vec<Node>, NestedSetError> {
        Ok(self.snapshot()?.rows.into_values().collect())
    }

    fn snapshot(&self) -> Result<MemoryTable, NestedSetError> {
        self.table
            .lock()
            .map(|table| table.clone())
            .map_err(|_| NestedSetError::Storage("Memory table lock poisoned".into()))
    }
}

#[async_trait]
impl RowStore for MemoryRowStore {
    type Reader = MemoryRows;
    type Tx = MemoryRows;

    fn schema(&self) -> &TreeSchema {
        &self.schema
    }

    async fn reader(&self) -> Result<Self::Reader, NestedSetError> {
        Ok(MemoryRows {
            work: self.snapshot()?,
            partitioned: self.schema.partitioned(),
            _writer: None,
        })
    }

    async fn begin(&self) -> Result<Self::Tx, NestedSetError> {
        let guard = self.writer.clone().lock_owned().await;
        Ok(MemoryRows {
            work: self.snapshot()?,
            partitioned: self.schema.partitioned(),
            _writer: Some(guard),
        })
    }

    async fn commit(&self, tx: Self::Tx) -> Result<(), NestedSetError> {
        let mut table = self
            .table
            .lock()
            .map_err(|_| NestedSetError::Storage("Memory table lock poisoned".into()))?;
        *table = tx.work;
        Ok(())
    }

    async fn rollback(&self, tx: Self::Tx) -> Result<(), NestedSetError> {
        drop(tx);
        Ok(())
    }
}

/// Working copy of the table behind a reader or a transaction
pub struct MemoryRows {
    work: MemoryTable,
    partitioned: bool,
    _writer: Option<OwnedMutexGuard<()>>,
}

impl MemoryRows {
    fn check_changes(&self, changes: &[FieldChange]) -> Result<(), NestedSetError> {
        if !self.partitioned && changes.iter().any(|c| matches!(c, FieldChange::SetTree(_))) {
            return Err(NestedSetError::InvalidSchema(
                "tree assignment on an unpartitioned table".into(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl RowAccessor for MemoryRows {
    async fn read(&mut self, id: NodeId) -> Result<Option<Node>, NestedSetError> {
        Ok(self.work.rows.get(&id).cloned())
    }

    async fn insert(&mut self, row: NewRow) -> Result<NodeId, NestedSetError> {
        self.work.last_id += 1;
        let id = RowId::new(self.work.last_id);

        let mut coordinate = row.coordinate;
        if !self.partitioned {
            coordinate.tree = None;
        }
        self.work.rows.insert(
            id,
            Node {
                id,
                coordinate,
                metadata: row.metadata,
                created_at: current_timestamp(),
            },
        );
        Ok(id)
    }

    async fn update_metadata(
        &mut self,
        id: NodeId,
        metadata: Option<Value>,
    ) -> Result<u64, NestedSetError> {
        match self.work.rows.get_mut(&id) {
            Some(node) => {
                node.metadata = metadata;
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn bulk_update(
        &mut self,
        condition: &Condition,
        changes: &[FieldChange],
    ) -> Result<u64, NestedSetError> {
        self.check_changes(changes)?;
        if changes.is_empty() {
            return Ok(0);
        }

        let mut affected = 0;
        for node in self.work.rows.values_mut() {
            if !condition.matches(node) {
                continue;
            }
            for change in changes {
                change.apply(&mut node.coordinate);
            }
            affected += 1;
        }
        Ok(affected)
    }

    async fn bulk_delete(&mut self, condition: &Condition) -> Result<u64, NestedSetError> {
        let before = self.work.rows.len();
        self.work.rows.retain(|_, node| !condition.matches(node));
        Ok((before - self.work.rows.len()) as u64)
    }

    async fn count(&mut self, condition: &Condition) -> Result<u64, NestedSetError> {
        Ok(self
            .work
            .rows
            .values()
            .filter(|node| condition.matches(node))
            .count() as u64)
    }

    async fn select(&mut self, query: &NodeQuery) -> Result<Vec<Node>, NestedSetError> {
        let mut nodes: Vec<Node> = self
            .work
            .rows
            .values()
            .filter(|node| query.condition.matches(node))
            .cloned()
            .collect();

        nodes.sort_by_key(|n| (n.coordinate.tree, n.coordinate.left));
        if query.order == Order::Desc {
            nodes.reverse();
        }

        let skipped = nodes.into_iter().skip(query.offset as usize);
        Ok(match query.limit {
            Some(limit) => skipped.take(limit as usize).collect(),
            None => skipped.collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nested::accessor::{Cmp, Field};
    use crate::nested::types::Coordinate;

    fn row(left: i64, right: i64, depth: i64) -> NewRow {
        NewRow {
            coordinate: Coordinate {
                left,
                right,
                depth,
                tree: None,
            },
            metadata: None,
        }
    }

    #[tokio::test]
    async fn test_uncommitted_writes_are_discarded() {
        let store = MemoryRowStore::new(TreeSchema::default()).unwrap();

        let mut tx = store.begin().await.unwrap();
        tx.insert(row(1, 2, 0)).await.unwrap();
        store.rollback(tx).await.unwrap();
        assert!(store.nodes().unwrap().is_empty());

        let mut tx = store.begin().await.unwrap();
        tx.insert(row(1, 2, 0)).await.unwrap();
        drop(tx);
        assert!(store.nodes().unwrap().is_empty());

        let mut tx = store.begin().await.unwrap();
        let id = tx.insert(row(1, 2, 0)).await.unwrap();
        store.commit(tx).await.unwrap();
        assert_eq!(store.nodes().unwrap()[0].id, id);
    }

    #[tokio::test]
    async fn test_reader_sees_committed_snapshot_only() {
        let store = MemoryRowStore::new(TreeSchema::default()).unwrap();
        let mut tx = store.begin().await.unwrap();
        tx.insert(row(1, 2, 0)).await.unwrap();

        let mut reader = store.reader().await.unwrap();
        assert_eq!(reader.count(&Condition::new()).await.unwrap(), 0);

        store.commit(tx).await.unwrap();
        assert_eq!(reader.count(&Condition::new()).await.unwrap(), 0);
        let mut fresh = store.reader().await.unwrap();
        assert_eq!(fresh.count(&Condition::new()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_ids_are_not_reused() {
        let store = MemoryRowStore::new(TreeSchema::default()).unwrap();
        let mut tx = store.begin().await.unwrap();
        let first = tx.insert(row(1, 2, 0)).await.unwrap();
        tx.bulk_delete(&Condition::new()).await.unwrap();
        let second = tx.insert(row(1, 2, 0)).await.unwrap();
        assert!(second > first);
    }

    #[tokio::test]
    async fn test_bulk_update_uses_pre_statement_values() {
        let store = MemoryRowStore::new(TreeSchema::default()).unwrap();
        let mut tx = store.begin().await.unwrap();
        tx.insert(row(1, 4, 0)).await.unwrap();
        tx.insert(row(2, 3, 1)).await.unwrap();

        let affected = tx
            .bulk_update(
                &Condition::new().compare(Field::Left, Cmp::Ge, 2),
                &[FieldChange::add(Field::Left, 2), FieldChange::add(Field::Right, 2)],
            )
            .await
            .unwrap();
        assert_eq!(affected, 1);

        let nodes = tx.select(&NodeQuery::all()).await.unwrap();
        assert_eq!(
            nodes
                .iter()
                .map(|n| (n.coordinate.left, n.coordinate.right))
                .collect::<Vec<_>>(),
            vec![(1, 4), (4, 5)]
        );
    }

    #[tokio::test]
    async fn test_tree_assignment_needs_partitioned_schema() {
        let store = MemoryRowStore::new(TreeSchema::default()).unwrap();
        let mut tx = store.begin().await.unwrap();
        let result = tx
            .bulk_update(&Condition::new(), &[FieldChange::SetTree(RowId::new(1))])
            .await;
        assert!(matches!(result, Err(NestedSetError::InvalidSchema(_))));
    }
}
