mod accessor;
mod coordinator;
mod invariants;
mod memory;
mod mutator;
mod query;
mod storage;
mod types;


pub use accessor::{Cmp, Condition, Field, FieldChange, Predicate, RowAccessor, RowStore};
pub use coordinator::{NestedSets, DEFAULT_PAGE_SIZE};
pub use invariants::{check_collection, check_partition, group_partitions, TreeReport, Violation};
pub use memory::{MemoryRowStore, MemoryRows};
pub use mutator::{PendingChange, Statement, TreeMutator};
pub use query::{NodeQuery, Order};
pub use storage::{SqliteRowStore, SqliteRows, StoreConfig, TreeSchema};
pub use types::{
    Applied, Coordinate, InvalidTargetReason, NestedSetError, NewRow, Node, NodeId, Operation,
    Position, RowId, Subject, TreeEvent, TreeKey, TreeView,
};
