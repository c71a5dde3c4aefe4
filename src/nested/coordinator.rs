//! Atomic execution of tree operations.
//!
//! [`NestedSets`] plans an operation on a plain reader first, so precondition
//! failures never open a transaction. It then takes the in-process locks of the
//! partitions the plan writes to, re-plans inside the transaction and applies.
//! Any failure after `begin` rolls the whole transaction back.

use async_stream::stream;
use futures::Stream;
use serde_json::Value;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;

use super::accessor::{RowAccessor, RowStore};
use super::invariants::{check_collection, group_partitions, TreeReport};
use super::mutator::TreeMutator;
use super::query::NodeQuery;
use super::types::{
    Applied, NestedSetError, Node, NodeId, Operation, Position, Subject, TreeKey, TreeView,
};

/// Default number of rows fetched per page by [`NestedSets::stream`]
pub const DEFAULT_PAGE_SIZE: u64 = 100;

/// One async mutex per partition, `None` covering an unpartitioned table
#[derive(Default)]
struct PartitionLocks {
    slots: Mutex<HashMap<Option<TreeKey>, Arc<tokio::sync::Mutex<()>>>>,
}

impl PartitionLocks {
    /// Lock `partitions` in the given (sorted) order
    async fn acquire(
        &self,
        partitions: &[Option<TreeKey>],
    ) -> Result<Vec<OwnedMutexGuard<()>>, NestedSetError> {
        let mutexes: Vec<_> = {
            let mut slots = self
                .slots
                .lock()
                .map_err(|_| NestedSetError::Storage("Partition lock table poisoned".into()))?;
            partitions
                .iter()
                .map(|p| slots.entry(*p).or_default().clone())
                .collect()
        };

        let mut guards = Vec::with_capacity(mutexes.len());
        for mutex in mutexes {
            guards.push(mutex.lock_owned().await);
        }
        Ok(guards)
    }
}

/// Nested-set trees over a [`RowStore`]
pub struct NestedSets<S: RowStore> {
    store: Arc<S>,
    mutator: TreeMutator,
    locks: Arc<PartitionLocks>,
    page_size: u64,
}

impl<S: RowStore> Clone for NestedSets<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            mutator: self.mutator,
            locks: self.locks.clone(),
            page_size: self.page_size,
        }
    }
}

impl<S: RowStore + 'static> NestedSets<S> {
    pub fn new(store: S) -> Self {
        let mutator = TreeMutator::for_schema(store.schema());
        Self {
            store: Arc::new(store),
            mutator,
            locks: Arc::new(PartitionLocks::default()),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: u64) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Run one structural operation atomically
    pub async fn execute(
        &self,
        subject: Subject,
        operation: Operation,
    ) -> Result<Applied, NestedSetError> {
        let planned = {
            let mut reader = self.store.reader().await?;
            self.mutator.plan(&mut reader, &subject, &operation).await?
        };

        let _guards = self.locks.acquire(&planned.partitions).await?;
        let mut tx = self.store.begin().await?;

        match self
            .apply_in(&mut tx, &subject, &operation, &planned.partitions)
            .await
        {
            Ok(applied) => {
                self.store.commit(tx).await?;
                Ok(applied)
            }
            Err(e) => {
                tracing::warn!(operation = operation.name(), error = %e, "Rolling back tree change");
                if let Err(rollback) = self.store.rollback(tx).await {
                    tracing::warn!(error = %rollback, "Rollback failed");
                }
                Err(e)
            }
        }
    }

    async fn apply_in(
        &self,
        tx: &mut S::Tx,
        subject: &Subject,
        operation: &Operation,
        locked: &[Option<TreeKey>],
    ) -> Result<Applied, NestedSetError> {
        let change = self.mutator.plan(tx, subject, operation).await?;
        if let Some(partition) = change.partitions.iter().find(|p| !locked.contains(p)) {
            return Err(NestedSetError::Conflict(format!(
                "{} now touches partition {:?} that was not locked",
                operation.name(),
                partition
            )));
        }
        self.mutator.apply(tx, change).await
    }

    // ========================================================================
    // Structural operations
    // ========================================================================

    /// Create a new root
    pub async fn make_root(&self, metadata: Option<Value>) -> Result<Node, NestedSetError> {
        let applied = self
            .execute(Subject::new_node(metadata), Operation::MakeRoot)
            .await?;
        self.require(applied.node).await
    }

    /// Create a node as the first child of `target`
    pub async fn prepend_to(
        &self,
        target: NodeId,
        metadata: Option<Value>,
    ) -> Result<Node, NestedSetError> {
        self.create(Position::PrependTo, target, metadata).await
    }

    /// Create a node as the last child of `target`
    pub async fn append_to(
        &self,
        target: NodeId,
        metadata: Option<Value>,
    ) -> Result<Node, NestedSetError> {
        self.create(Position::AppendTo, target, metadata).await
    }

    pub async fn insert_before(
        &self,
        target: NodeId,
        metadata: Option<Value>,
    ) -> Result<Node, NestedSetError> {
        self.create(Position::InsertBefore, target, metadata).await
    }

    pub async fn insert_after(
        &self,
        target: NodeId,
        metadata: Option<Value>,
    ) -> Result<Node, NestedSetError> {
        self.create(Position::InsertAfter, target, metadata).await
    }

    /// Move an existing node, with its subtree, next to or under `target`
    pub async fn move_to(
        &self,
        node: NodeId,
        position: Position,
        target: NodeId,
    ) -> Result<Node, NestedSetError> {
        self.execute(Subject::Existing(node), Operation::Attach { position, target })
            .await?;
        self.require(node).await
    }

    /// Detach a node's subtree into a partition of its own
    pub async fn move_to_root(&self, node: NodeId) -> Result<Node, NestedSetError> {
        self.execute(Subject::Existing(node), Operation::MakeRoot)
            .await?;
        self.require(node).await
    }

    /// Delete a node and its subtree; returns the number of rows removed
    pub async fn delete_with_descendants(&self, node: NodeId) -> Result<u64, NestedSetError> {
        let applied = self
            .execute(Subject::Existing(node), Operation::DeleteWithDescendants)
            .await?;
        Ok(applied.deleted)
    }

    /// Delete one node, promoting its children a level up
    pub async fn delete(&self, node: NodeId) -> Result<u64, NestedSetError> {
        let applied = self
            .execute(Subject::Existing(node), Operation::Delete)
            .await?;
        Ok(applied.deleted)
    }

    /// Replace a node's payload
    pub async fn save(&self, node: NodeId, metadata: Option<Value>) -> Result<Node, NestedSetError> {
        self.execute(Subject::Existing(node), Operation::Save { metadata })
            .await?;
        self.require(node).await
    }

    async fn create(
        &self,
        position: Position,
        target: NodeId,
        metadata: Option<Value>,
    ) -> Result<Node, NestedSetError> {
        let applied = self
            .execute(Subject::new_node(metadata), Operation::Attach { position, target })
            .await?;
        self.require(applied.node).await
    }

    // ========================================================================
    // Reads
    // ========================================================================

    pub async fn node(&self, id: NodeId) -> Result<Option<Node>, NestedSetError> {
        self.store.reader().await?.read(id).await
    }

    pub async fn fetch(&self, query: &NodeQuery) -> Result<Vec<Node>, NestedSetError> {
        self.store.reader().await?.select(query).await
    }

    /// Stream the rows of `query` page by page.
    ///
    /// Each page is read on its own connection, so a stream running alongside
    /// writes may observe more than one committed state.
    pub fn stream(
        &self,
        query: NodeQuery,
    ) -> Pin<Box<dyn Stream<Item = Result<Node, NestedSetError>> + Send + 'static>> {
        let store = self.store.clone();
        let page_size = self.page_size;

        Box::pin(stream! {
            let mut offset = query.offset;
            let mut remaining = query.limit;
            loop {
                let take = remaining.map_or(page_size, |r| r.min(page_size));
                if take == 0 {
                    break;
                }

                let page = query.clone().offset(offset).limit(take);
                let nodes = match store.reader().await {
                    Ok(mut reader) => reader.select(&page).await,
                    Err(e) => Err(e),
                };
                let nodes = match nodes {
                    Ok(nodes) => nodes,
                    Err(e) => {
                        yield Err(e);
                        break;
                    }
                };

                let fetched = nodes.len() as u64;
                for node in nodes {
                    yield Ok(node);
                }
                if fetched < take {
                    break;
                }
                offset += fetched;
                remaining = remaining.map(|r| r - fetched);
            }
        })
    }

    pub async fn ancestors(
        &self,
        id: NodeId,
        depth: Option<i64>,
    ) -> Result<Vec<Node>, NestedSetError> {
        let node = self.require(id).await?;
        self.fetch(&NodeQuery::ancestors(&node.coordinate, depth))
            .await
    }

    pub async fn parent(&self, id: NodeId) -> Result<Option<Node>, NestedSetError> {
        let node = self.require(id).await?;
        Ok(self
            .fetch(&NodeQuery::parent(&node.coordinate))
            .await?
            .into_iter()
            .next())
    }

    pub async fn descendants(
        &self,
        id: NodeId,
        depth: Option<i64>,
    ) -> Result<Vec<Node>, NestedSetError> {
        let node = self.require(id).await?;
        self.fetch(&NodeQuery::descendants(&node.coordinate, depth))
            .await
    }

    pub async fn children(&self, id: NodeId) -> Result<Vec<Node>, NestedSetError> {
        let node = self.require(id).await?;
        self.fetch(&NodeQuery::children(&node.coordinate)).await
    }

    /// Leaves below `id`
    pub async fn leaves(&self, id: NodeId) -> Result<Vec<Node>, NestedSetError> {
        let node = self.require(id).await?;
        self.fetch(&NodeQuery::childless_descendants(&node.coordinate))
            .await
    }

    pub async fn prev_sibling(&self, id: NodeId) -> Result<Option<Node>, NestedSetError> {
        let node = self.require(id).await?;
        Ok(self
            .fetch(&NodeQuery::prev_sibling(&node.coordinate))
            .await?
            .into_iter()
            .next())
    }

    pub async fn next_sibling(&self, id: NodeId) -> Result<Option<Node>, NestedSetError> {
        let node = self.require(id).await?;
        Ok(self
            .fetch(&NodeQuery::next_sibling(&node.coordinate))
            .await?
            .into_iter()
            .next())
    }

    pub async fn roots(&self) -> Result<Vec<Node>, NestedSetError> {
        self.fetch(&NodeQuery::all().roots()).await
    }

    /// Render one partition, or every partition when `tree` is None
    pub async fn render(&self, tree: Option<TreeKey>) -> Result<String, NestedSetError> {
        let query = match tree {
            Some(key) => NodeQuery::all().in_tree(Some(key)),
            None => NodeQuery::all(),
        };
        let nodes = self.fetch(&query).await?;

        Ok(group_partitions(nodes)
            .into_values()
            .filter_map(TreeView::from_nodes)
            .map(|view| view.render())
            .collect())
    }

    /// Check every partition against the nested-set invariants
    pub async fn verify(&self) -> Result<Vec<TreeReport>, NestedSetError> {
        let nodes = self.fetch(&NodeQuery::all()).await?;
        Ok(check_collection(nodes))
    }

    async fn require(&self, id: NodeId) -> Result<Node, NestedSetError> {
        self.node(id).await?.ok_or(NestedSetError::NodeNotFound(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nested::memory::MemoryRowStore;
    use crate::nested::storage::TreeSchema;
    use futures::StreamExt;

    fn trees() -> NestedSets<MemoryRowStore> {
        let schema = TreeSchema::default().with_tree_column("tree");
        NestedSets::new(MemoryRowStore::new(schema).unwrap())
    }

    #[tokio::test]
    async fn test_stream_pages_through_results() {
        let trees = trees().with_page_size(2);
        let root = trees.make_root(None).await.unwrap();
        for _ in 0..4 {
            trees.append_to(root.id, None).await.unwrap();
        }

        let all: Vec<Node> = trees
            .stream(NodeQuery::all())
            .map(|n| n.unwrap())
            .collect()
            .await;
        assert_eq!(all.len(), 5);
        assert!(all.windows(2).all(|w| w[0].coordinate.left < w[1].coordinate.left));

        let limited: Vec<_> = trees
            .stream(NodeQuery::all().offset(1).limit(3))
            .collect()
            .await;
        assert_eq!(limited.len(), 3);
    }

    #[tokio::test]
    async fn test_precondition_failure_leaves_store_untouched() {
        let trees = trees();
        let root = trees.make_root(None).await.unwrap();
        let err = trees.insert_after(root.id, None).await.unwrap_err();
        assert!(matches!(err, NestedSetError::InvalidTarget(_)));
        assert_eq!(trees.store().nodes().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_appends_stay_consistent() {
        let trees = trees();
        let root = trees.make_root(None).await.unwrap();

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let trees = trees.clone();
                tokio::spawn(async move { trees.append_to(root.id, None).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let reports = trees.verify().await.unwrap();
        assert!(reports.iter().all(TreeReport::is_valid), "{:?}", reports);
        assert_eq!(trees.children(root.id).await.unwrap().len(), 8);
    }

    #[tokio::test]
    async fn test_render_every_partition() {
        let trees = trees();
        let first = trees
            .make_root(Some(serde_json::json!({ "name": "first" })))
            .await
            .unwrap();
        trees
            .append_to(first.id, Some(serde_json::json!({ "name": "leaf" })))
            .await
            .unwrap();
        trees
            .make_root(Some(serde_json::json!({ "name": "second" })))
            .await
            .unwrap();

        let rendered = trees.render(None).await.unwrap();
        assert_eq!(
            rendered,
            "└── first [1, 4]\n    └── leaf [2, 3]\n└── second [1, 2]\n"
        );
        assert_eq!(
            trees.render(Some(first.id)).await.unwrap(),
            "└── first [1, 4]\n    └── leaf [2, 3]\n"
        );
    }
}
