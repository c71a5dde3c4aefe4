pub mod config;
pub mod nested;

// Re-export commonly used items
pub use config::AppConfig;
pub use nested::{
    MemoryRowStore, NestedSetError, NestedSets, Node, NodeId, NodeQuery, Operation, Position,
    SqliteRowStore, StoreConfig, Subject, TreeEvent, TreeSchema,
};
