//! Structural checks over one partition's rows.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::types::{Node, NodeId, TreeKey};

/// A broken nested-set invariant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Violation {
    /// A non-empty partition must have exactly one node with `left == 1`
    RootCount { roots: usize },
    InvertedBounds { node: NodeId },
    /// `right - left` must be odd
    EvenWidth { node: NodeId },
    /// The bounds of N nodes must be exactly `1..=2N`
    BoundsNotContiguous { expected: i64, found: Option<i64> },
    PartialOverlap { node: NodeId, other: NodeId },
    DepthMismatch {
        node: NodeId,
        expected: i64,
        actual: i64,
    },
    /// The node's partition key is not the id of its partition's root
    MixedPartition {
        node: NodeId,
        tree: Option<TreeKey>,
    },
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::RootCount { roots } => write!(f, "expected one root, found {}", roots),
            Violation::InvertedBounds { node } => write!(f, "node {} has left >= right", node),
            Violation::EvenWidth { node } => write!(f, "node {} has an odd width", node),
            Violation::BoundsNotContiguous { expected, found } => match found {
                Some(found) => write!(f, "expected bound {}, found {}", expected, found),
                None => write!(f, "expected bound {}, found nothing", expected),
            },
            Violation::PartialOverlap { node, other } => {
                write!(f, "node {} partially overlaps node {}", node, other)
            }
            Violation::DepthMismatch {
                node,
                expected,
                actual,
            } => write!(f, "node {} has depth {}, expected {}", node, actual, expected),
            Violation::MixedPartition { node, tree } => match tree {
                Some(tree) => write!(f, "node {} is keyed to tree {}", node, tree),
                None => write!(f, "node {} has no tree key", node),
            },
        }
    }
}

/// Result of checking one partition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct TreeReport {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub tree: Option<TreeKey>,
    pub nodes: usize,
    pub violations: Vec<Violation>,
}

impl TreeReport {
    pub fn is_valid(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Split rows by partition key
pub fn group_partitions(nodes: Vec<Node>) -> BTreeMap<Option<TreeKey>, Vec<Node>> {
    let mut groups: BTreeMap<Option<TreeKey>, Vec<Node>> = BTreeMap::new();
    for node in nodes {
        groups.entry(node.coordinate.tree).or_default().push(node);
    }
    groups
}

/// Check every partition in a collection
pub fn check_collection(nodes: Vec<Node>) -> Vec<TreeReport> {
    group_partitions(nodes)
        .into_iter()
        .map(|(tree, rows)| check_partition(tree, &rows))
        .collect()
}

/// Check one partition's rows against every nested-set invariant
pub fn check_partition(tree: Option<TreeKey>, nodes: &[Node]) -> TreeReport {
    let mut violations = Vec::new();

    let mut sorted: Vec<&Node> = nodes.iter().collect();
    sorted.sort_by_key(|n| (n.coordinate.left, n.id));

    let roots: Vec<&&Node> = sorted.iter().filter(|n| n.coordinate.is_root()).collect();
    if !nodes.is_empty() && roots.len() != 1 {
        violations.push(Violation::RootCount { roots: roots.len() });
    }

    for node in &sorted {
        let c = &node.coordinate;
        if c.left >= c.right {
            violations.push(Violation::InvertedBounds { node: node.id });
        } else if (c.right - c.left) % 2 == 0 {
            violations.push(Violation::EvenWidth { node: node.id });
        }
        if c.tree != tree {
            violations.push(Violation::MixedPartition {
                node: node.id,
                tree: c.tree,
            });
        }
    }

    if let (Some(key), [root]) = (tree, roots.as_slice()) {
        if root.id != key {
            violations.push(Violation::MixedPartition {
                node: root.id,
                tree: Some(key),
            });
        }
    }

    let mut bounds: Vec<i64> = sorted
        .iter()
        .flat_map(|n| [n.coordinate.left, n.coordinate.right])
        .collect();
    bounds.sort_unstable();
    let expected_len = 2 * nodes.len() as i64;
    let mismatch = (1..=expected_len)
        .zip(bounds.iter().copied().map(Some).chain(std::iter::repeat(None)))
        .find(|(expected, found)| *found != Some(*expected));
    if let Some((expected, found)) = mismatch {
        violations.push(Violation::BoundsNotContiguous { expected, found });
    }

    let mut open: Vec<&Node> = Vec::new();
    for node in &sorted {
        let c = &node.coordinate;
        while open
            .last()
            .is_some_and(|top| top.coordinate.right < c.left)
        {
            open.pop();
        }
        if let Some(top) = open.last() {
            if c.right > top.coordinate.right {
                violations.push(Violation::PartialOverlap {
                    node: node.id,
                    other: top.id,
                });
            }
        }
        let expected = open.len() as i64;
        if c.depth != expected {
            violations.push(Violation::DepthMismatch {
                node: node.id,
                expected,
                actual: c.depth,
            });
        }
        open.push(node);
    }

    TreeReport {
        tree,
        nodes: nodes.len(),
        violations,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nested::types::{Coordinate, RowId};

    fn node(id: i64, left: i64, right: i64, depth: i64, tree: Option<i64>) -> Node {
        Node {
            id: RowId::new(id),
            coordinate: Coordinate {
                left,
                right,
                depth,
                tree: tree.map(RowId::new),
            },
            metadata: None,
            created_at: 0,
        }
    }

    #[test]
    fn test_valid_partition() {
        let rows = vec![
            node(1, 1, 8, 0, Some(1)),
            node(2, 2, 3, 1, Some(1)),
            node(3, 4, 7, 1, Some(1)),
            node(4, 5, 6, 2, Some(1)),
        ];
        let report = check_partition(Some(RowId::new(1)), &rows);
        assert!(report.is_valid(), "{:?}", report.violations);
        assert_eq!(report.nodes, 4);
        assert!(check_partition(None, &[]).is_valid());
    }

    #[test]
    fn test_detects_gap_and_depth() {
        let rows = vec![
            node(1, 1, 8, 0, None),
            node(2, 2, 3, 2, None),
            node(3, 5, 6, 1, None),
        ];
        let report = check_partition(None, &rows);
        assert!(report.violations.contains(&Violation::DepthMismatch {
            node: RowId::new(2),
            expected: 1,
            actual: 2
        }));
        assert!(report.violations.contains(&Violation::BoundsNotContiguous {
            expected: 4,
            found: Some(5)
        }));
    }

    #[test]
    fn test_detects_overlap_and_roots() {
        let rows = vec![
            node(1, 1, 4, 0, None),
            node(2, 3, 6, 1, None),
            node(3, 1, 2, 0, None),
        ];
        let report = check_partition(None, &rows);
        assert!(report.violations.contains(&Violation::RootCount { roots: 2 }));
        assert!(report
            .violations
            .iter()
            .any(|v| matches!(v, Violation::PartialOverlap { .. })));
    }

    #[test]
    fn test_detects_bad_widths_and_partition_keys() {
        let rows = vec![node(5, 1, 4, 0, Some(1)), node(6, 2, 2, 1, Some(2))];
        let report = check_partition(Some(RowId::new(1)), &rows);
        assert!(report
            .violations
            .contains(&Violation::InvertedBounds { node: RowId::new(6) }));
        assert!(report.violations.contains(&Violation::MixedPartition {
            node: RowId::new(6),
            tree: Some(RowId::new(2))
        }));
        assert!(report.violations.contains(&Violation::MixedPartition {
            node: RowId::new(5),
            tree: Some(RowId::new(1))
        }));

        let even = check_partition(None, &[node(1, 1, 3, 0, None)]);
        assert!(even
            .violations
            .contains(&Violation::EvenWidth { node: RowId::new(1) }));
    }

    #[test]
    fn test_groups_by_tree() {
        let reports = check_collection(vec![
            node(1, 1, 2, 0, Some(1)),
            node(2, 1, 4, 0, Some(2)),
            node(3, 2, 3, 1, Some(2)),
        ]);
        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(TreeReport::is_valid));
        assert_eq!(reports[1].nodes, 2);
    }
}
