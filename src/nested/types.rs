use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use super::invariants::TreeReport;

// ============================================================================
// Core Types
// ============================================================================

/// Primary key of a row in the node table
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RowId(i64);

impl RowId {
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    /// Get the inner integer key
    pub fn get(&self) -> i64 {
        self.0
    }

    /// Parse from string
    pub fn parse_str(s: &str) -> Result<Self, String> {
        s.trim()
            .parse::<i64>()
            .map(Self)
            .map_err(|e| format!("Invalid row id '{}': {}", s, e))
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RowId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_str(s)
    }
}

impl From<i64> for RowId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<RowId> for i64 {
    fn from(id: RowId) -> Self {
        id.0
    }
}

impl Serialize for RowId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_i64(self.0)
    }
}

impl<'de> Deserialize<'de> for RowId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        i64::deserialize(deserializer).map(Self)
    }
}

impl JsonSchema for RowId {
    fn schema_name() -> std::borrow::Cow<'static, str> {
        "RowId".into()
    }

    fn json_schema(generator: &mut schemars::SchemaGenerator) -> schemars::Schema {
        generator.subschema_for::<i64>()
    }
}

/// Identifier of a node
pub type NodeId = RowId;

/// Partition key; always the id of the partition's root
pub type TreeKey = RowId;

/// Position of a node in its tree: `{left, right, depth[, tree]}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Coordinate {
    pub left: i64,
    pub right: i64,
    pub depth: i64,
    /// Partition key (None when the collection holds a single tree)
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub tree: Option<TreeKey>,
}

impl Coordinate {
    /// Coordinate of a freshly created root
    pub fn root(tree: Option<TreeKey>) -> Self {
        Self {
            left: 1,
            right: 2,
            depth: 0,
            tree,
        }
    }

    pub fn is_root(&self) -> bool {
        self.left == 1
    }

    pub fn is_leaf(&self) -> bool {
        self.right - self.left == 1
    }

    /// Number of positions the subtree occupies, boundaries included
    pub fn width(&self) -> i64 {
        self.right - self.left + 1
    }

    pub fn descendant_count(&self) -> i64 {
        (self.right - self.left - 1) / 2
    }

    pub fn same_tree(&self, other: &Coordinate) -> bool {
        self.tree == other.tree
    }

    /// True when `value` lies on or inside this node's bounds
    pub fn contains_position(&self, value: i64) -> bool {
        value >= self.left && value <= self.right
    }

    /// Strict containment of `other` within this node
    pub fn is_ancestor_of(&self, other: &Coordinate) -> bool {
        self.same_tree(other) && self.left < other.left && self.right > other.right
    }

    pub fn is_descendant_of(&self, other: &Coordinate) -> bool {
        other.is_ancestor_of(self)
    }

    /// This node starts right after `other` ends, at the same depth
    pub fn is_next_sibling_of(&self, other: &Coordinate) -> bool {
        self.same_tree(other) && self.depth == other.depth && self.left == other.right + 1
    }

    /// This node ends right before `other` starts, at the same depth
    pub fn is_prev_sibling_of(&self, other: &Coordinate) -> bool {
        other.is_next_sibling_of(self)
    }

    pub fn is_sibling_of(&self, other: &Coordinate) -> bool {
        self.is_next_sibling_of(other) || self.is_prev_sibling_of(other)
    }
}

/// A record participating in the tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Node {
    /// Primary key
    pub id: NodeId,

    #[serde(flatten)]
    pub coordinate: Coordinate,

    /// Opaque payload carried with the record
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub metadata: Option<Value>,

    /// Creation timestamp (Unix seconds)
    pub created_at: i64,
}

impl Node {
    /// Human readable label: `metadata.name` when present, otherwise `#id`
    pub fn label(&self) -> String {
        self.metadata
            .as_ref()
            .and_then(|m| m.get("name"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("#{}", self.id))
    }
}

/// Row values for an insert; the store assigns the id
#[derive(Debug, Clone, PartialEq)]
pub struct NewRow {
    pub coordinate: Coordinate,
    pub metadata: Option<Value>,
}

// ============================================================================
// Operations
// ============================================================================

/// Where a node is attached relative to its target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Position {
    /// First child of the target
    PrependTo,
    /// Last child of the target
    AppendTo,
    /// Sibling immediately before the target
    InsertBefore,
    /// Sibling immediately after the target
    InsertAfter,
}

impl Position {
    /// Left value the attached node takes, computed from the target's bounds
    pub fn insertion_value(&self, target: &Coordinate) -> i64 {
        match self {
            Position::PrependTo => target.left + 1,
            Position::AppendTo => target.right,
            Position::InsertBefore => target.left,
            Position::InsertAfter => target.right + 1,
        }
    }

    /// Depth of the attached node relative to the target
    pub fn depth_offset(&self) -> i64 {
        match self {
            Position::PrependTo | Position::AppendTo => 1,
            Position::InsertBefore | Position::InsertAfter => 0,
        }
    }

    pub fn is_sibling(&self) -> bool {
        self.depth_offset() == 0
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Position::PrependTo => "prepend_to",
            Position::AppendTo => "append_to",
            Position::InsertBefore => "insert_before",
            Position::InsertAfter => "insert_after",
        }
    }
}

impl FromStr for Position {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "prepend_to" | "prepend" => Ok(Position::PrependTo),
            "append_to" | "append" => Ok(Position::AppendTo),
            "insert_before" | "before" => Ok(Position::InsertBefore),
            "insert_after" | "after" => Ok(Position::InsertAfter),
            other => Err(format!("Unknown position: {}", other)),
        }
    }
}

/// The node an operation acts on
#[derive(Debug, Clone, PartialEq)]
pub enum Subject {
    /// A record that is not persisted yet
    New { metadata: Option<Value> },
    /// A persisted record, re-read before every operation
    Existing(NodeId),
}

impl Subject {
    pub fn new_node(metadata: Option<Value>) -> Self {
        Subject::New { metadata }
    }
}

/// Structural operation requested on a subject
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    MakeRoot,
    Attach { position: Position, target: NodeId },
    DeleteWithDescendants,
    /// Delete one node; its descendants move up a level
    Delete,
    /// Persist payload changes without touching the structure
    Save { metadata: Option<Value> },
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::MakeRoot => "make_root",
            Operation::Attach { position, .. } => position.as_str(),
            Operation::DeleteWithDescendants => "delete_with_descendants",
            Operation::Delete => "delete",
            Operation::Save { .. } => "save",
        }
    }
}

/// Outcome of an applied operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Applied {
    /// The created, moved, saved or deleted node
    pub node: NodeId,
    /// Rows removed by the operation
    pub deleted: u64,
    /// Rows written by all statements together
    pub rows_affected: u64,
}

// ============================================================================
// Rendering
// ============================================================================

/// One partition's nodes with the parent/child structure recovered from bounds
#[derive(Debug, Clone)]
pub struct TreeView {
    pub root: NodeId,
    pub nodes: HashMap<NodeId, Node>,
    pub children: HashMap<NodeId, Vec<NodeId>>,
}

impl TreeView {
    /// Build a view from one partition's rows. Returns None when no root is present.
    pub fn from_nodes(mut nodes: Vec<Node>) -> Option<Self> {
        nodes.sort_by_key(|n| n.coordinate.left);
        let root = nodes.first().filter(|n| n.coordinate.is_root())?.id;

        let mut children: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
        let mut open: Vec<&Node> = Vec::new();
        for node in &nodes {
            while open
                .last()
                .is_some_and(|top| top.coordinate.right < node.coordinate.left)
            {
                open.pop();
            }
            if let Some(parent) = open.last() {
                children.entry(parent.id).or_default().push(node.id);
            }
            open.push(node);
        }

        Some(Self {
            root,
            nodes: nodes.into_iter().map(|n| (n.id, n)).collect(),
            children,
        })
    }

    /// Render the tree as a text representation
    pub fn render(&self) -> String {
        let mut output = String::new();
        self.render_node(&self.root, &mut output, "", true);
        output
    }

    fn render_node(&self, node_id: &NodeId, output: &mut String, prefix: &str, is_last: bool) {
        let Some(node) = self.nodes.get(node_id) else {
            return;
        };

        let connector = if is_last { "└── " } else { "├── " };
        let c = &node.coordinate;
        output.push_str(&format!(
            "{}{}{} [{}, {}]\n",
            prefix,
            connector,
            node.label(),
            c.left,
            c.right
        ));

        let child_prefix = format!("{}{}", prefix, if is_last { "    " } else { "│   " });

        let Some(children) = self.children.get(node_id) else {
            return;
        };
        for (i, child_id) in children.iter().enumerate() {
            let is_last_child = i == children.len() - 1;
            self.render_node(child_id, output, &child_prefix, is_last_child);
        }
    }
}

// ============================================================================
// Events
// ============================================================================

/// Results printed by the administration CLI
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type")]
pub enum TreeEvent {
    #[serde(rename = "node_created")]
    NodeCreated { node: Node },

    #[serde(rename = "node_moved")]
    NodeMoved { node: Node },

    #[serde(rename = "node_saved")]
    NodeSaved { node: Node },

    #[serde(rename = "nodes_deleted")]
    NodesDeleted { node_id: NodeId, deleted: u64 },

    #[serde(rename = "node_data")]
    NodeData { node: Node },

    #[serde(rename = "node_list")]
    NodeList { nodes: Vec<Node> },

    #[serde(rename = "siblings")]
    Siblings {
        node_id: NodeId,
        prev: Option<Node>,
        next: Option<Node>,
    },

    #[serde(rename = "tree_render")]
    TreeRender {
        #[serde(skip_serializing_if = "Option::is_none")]
        tree: Option<TreeKey>,
        render: String,
    },

    #[serde(rename = "tree_verified")]
    TreeVerified { reports: Vec<TreeReport> },

    #[serde(rename = "error")]
    Error { message: String, retryable: bool },
}

// ============================================================================
// Error Types
// ============================================================================

/// Why a target cannot take part in an attach or move
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum InvalidTargetReason {
    /// The target is not persisted
    Unpersisted,
    /// The node would be attached to itself
    SameNode,
    /// The target lies inside the subtree being moved
    Descendant,
    /// A root has no siblings
    RootSibling,
}

impl fmt::Display for InvalidTargetReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            InvalidTargetReason::Unpersisted => "the target node is not persisted",
            InvalidTargetReason::SameNode => "the target node is the node itself",
            InvalidTargetReason::Descendant => "the target node is a descendant of the node",
            InvalidTargetReason::RootSibling => "the target node is a root and has no siblings",
        };
        f.write_str(text)
    }
}

/// Error type for nested set operations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum NestedSetError {
    #[error("Can not create more than one root when the tree is not partitioned")]
    MultipleRootsForbidden,

    #[error("Invalid target: {0}")]
    InvalidTarget(InvalidTargetReason),

    #[error("Invalid root: {0}")]
    InvalidRoot(String),

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("Node table has no primary key column")]
    MissingPrimaryKey,

    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),

    #[error("Invalid schema: {0}")]
    InvalidSchema(String),

    #[error("Storage conflict: {0}")]
    Conflict(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl NestedSetError {
    /// Errors the caller may retry after re-reading state
    pub fn is_retryable(&self) -> bool {
        matches!(self, NestedSetError::Conflict(_))
    }
}

impl From<String> for NestedSetError {
    fn from(message: String) -> Self {
        NestedSetError::Storage(message)
    }
}

impl From<&str> for NestedSetError {
    fn from(message: &str) -> Self {
        NestedSetError::Storage(message.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coord(left: i64, right: i64, depth: i64) -> Coordinate {
        Coordinate {
            left,
            right,
            depth,
            tree: None,
        }
    }

    #[test]
    fn test_coordinate_predicates() {
        let root = coord(1, 8, 0);
        let a = coord(2, 3, 1);
        let b = coord(4, 7, 1);
        let c = coord(5, 6, 2);

        assert!(root.is_root());
        assert!(!b.is_root());
        assert!(a.is_leaf() && c.is_leaf());
        assert!(!b.is_leaf());
        assert_eq!(root.descendant_count(), 3);
        assert_eq!(b.width(), 4);

        assert!(root.is_ancestor_of(&c));
        assert!(c.is_descendant_of(&b));
        assert!(!a.is_ancestor_of(&c));
        assert!(!b.is_ancestor_of(&b), "containment is strict");

        assert!(b.is_next_sibling_of(&a));
        assert!(a.is_prev_sibling_of(&b));
        assert!(a.is_sibling_of(&b) && b.is_sibling_of(&a));
        assert!(!c.is_sibling_of(&a), "different depth");
    }

    #[test]
    fn test_predicates_respect_partitions() {
        let mut other = coord(2, 3, 1);
        other.tree = Some(RowId::new(9));
        let mut root = coord(1, 4, 0);
        root.tree = Some(RowId::new(1));

        assert!(!root.is_ancestor_of(&other));
        other.tree = Some(RowId::new(1));
        assert!(root.is_ancestor_of(&other));
    }

    #[test]
    fn test_position_table() {
        let target = coord(4, 7, 1);
        assert_eq!(Position::PrependTo.insertion_value(&target), 5);
        assert_eq!(Position::AppendTo.insertion_value(&target), 7);
        assert_eq!(Position::InsertBefore.insertion_value(&target), 4);
        assert_eq!(Position::InsertAfter.insertion_value(&target), 8);
        assert_eq!(Position::PrependTo.depth_offset(), 1);
        assert!(Position::InsertAfter.is_sibling());
        assert_eq!("before".parse::<Position>(), Ok(Position::InsertBefore));
        assert!("sideways".parse::<Position>().is_err());
    }

    #[test]
    fn test_tree_view_render() {
        let node = |id: i64, left, right, depth, name: &str| Node {
            id: RowId::new(id),
            coordinate: coord(left, right, depth),
            metadata: Some(serde_json::json!({ "name": name })),
            created_at: 0,
        };
        let view = TreeView::from_nodes(vec![
            node(3, 4, 7, 1, "b"),
            node(1, 1, 8, 0, "root"),
            node(4, 5, 6, 2, "c"),
            node(2, 2, 3, 1, "a"),
        ])
        .unwrap();

        assert_eq!(view.children[&RowId::new(1)], vec![RowId::new(2), RowId::new(3)]);
        let rendered = view.render();
        assert_eq!(
            rendered,
            "└── root [1, 8]\n    ├── a [2, 3]\n    └── b [4, 7]\n        └── c [5, 6]\n"
        );
    }

    #[test]
    fn test_error_serializes_with_reason() {
        let err = NestedSetError::InvalidTarget(InvalidTargetReason::Descendant);
        assert_eq!(
            err.to_string(),
            "Invalid target: the target node is a descendant of the node"
        );
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json, serde_json::json!({ "InvalidTarget": "descendant" }));
        assert!(NestedSetError::Conflict("busy".into()).is_retryable());
        assert!(!err.is_retryable());
    }
}
