//! Nested set property tests
//!
//! Drives random operation sequences through the in-memory store and checks:
//!
//! - Every bound, width and depth invariant after each operation
//! - Appending a leaf and deleting it again restores all coordinates
//! - Moving a node under its own subtree always fails
//! - Sibling reordering keeps parent/child relations intact
//! - Failed operations leave the collection exactly as it was

use arbor_sets::nested::{
    InvalidTargetReason, MemoryRowStore, NestedSetError, NestedSets, Node, NodeId, Operation,
    Position, Subject, TreeSchema,
};
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::future::Future;

/// Structural operation for property testing; indices pick existing nodes
#[derive(Debug, Clone)]
enum TreeOp {
    Attach { position: Position, target: usize },
    Move {
        node: usize,
        position: Position,
        target: usize,
    },
    MoveToRoot { node: usize },
    NewRoot,
    Delete { node: usize },
    DeleteTree { node: usize },
}

fn arb_position() -> impl Strategy<Value = Position> {
    prop_oneof![
        Just(Position::PrependTo),
        Just(Position::AppendTo),
        Just(Position::InsertBefore),
        Just(Position::InsertAfter),
    ]
}

/// Generate random tree operations, weighted towards growth
fn arb_tree_op() -> impl Strategy<Value = TreeOp> {
    prop_oneof![
        4 => (arb_position(), 0usize..64)
            .prop_map(|(position, target)| TreeOp::Attach { position, target }),
        3 => (0usize..64, arb_position(), 0usize..64)
            .prop_map(|(node, position, target)| TreeOp::Move { node, position, target }),
        1 => (0usize..64).prop_map(|node| TreeOp::MoveToRoot { node }),
        1 => Just(TreeOp::NewRoot),
        1 => (0usize..64).prop_map(|node| TreeOp::Delete { node }),
        1 => (0usize..64).prop_map(|node| TreeOp::DeleteTree { node }),
    ]
}

/// Tree shape as (position, target index) attach steps
fn arb_shape() -> impl Strategy<Value = Vec<(Position, usize)>> {
    prop::collection::vec((arb_position(), 0usize..64), 1..24)
}

fn block_on<F: Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(future)
}

fn create_trees(partitioned: bool) -> NestedSets<MemoryRowStore> {
    let schema = if partitioned {
        TreeSchema::default().with_tree_column("tree")
    } else {
        TreeSchema::default()
    };
    NestedSets::new(MemoryRowStore::new(schema).unwrap())
}

fn pick(nodes: &[Node], index: usize) -> NodeId {
    nodes[index % nodes.len()].id
}

fn snapshot(trees: &NestedSets<MemoryRowStore>) -> Vec<Node> {
    trees.store().nodes().unwrap()
}

/// Parent of every node, recovered from bounds
fn parents(nodes: &[Node]) -> BTreeMap<NodeId, Option<NodeId>> {
    nodes
        .iter()
        .map(|node| {
            let parent = nodes
                .iter()
                .filter(|other| other.coordinate.is_ancestor_of(&node.coordinate))
                .max_by_key(|other| other.coordinate.depth)
                .map(|other| other.id);
            (node.id, parent)
        })
        .collect()
}

/// Build a single tree by attaching new nodes; invalid attaches are skipped
async fn build(trees: &NestedSets<MemoryRowStore>, shape: &[(Position, usize)]) {
    trees.make_root(None).await.unwrap();
    for (position, target) in shape {
        let target = pick(&snapshot(trees), *target);
        let _ = trees
            .execute(
                Subject::new_node(None),
                Operation::Attach {
                    position: *position,
                    target,
                },
            )
            .await;
    }
}

async fn apply_op(trees: &NestedSets<MemoryRowStore>, op: &TreeOp) -> Result<(), NestedSetError> {
    let nodes = snapshot(trees);
    if nodes.is_empty() {
        return trees.make_root(None).await.map(drop);
    }

    match op {
        TreeOp::Attach { position, target } => trees
            .execute(
                Subject::new_node(None),
                Operation::Attach {
                    position: *position,
                    target: pick(&nodes, *target),
                },
            )
            .await
            .map(drop),
        TreeOp::Move {
            node,
            position,
            target,
        } => trees
            .move_to(pick(&nodes, *node), *position, pick(&nodes, *target))
            .await
            .map(drop),
        TreeOp::MoveToRoot { node } => trees.move_to_root(pick(&nodes, *node)).await.map(drop),
        TreeOp::NewRoot => trees.make_root(None).await.map(drop),
        TreeOp::Delete { node } => trees.delete(pick(&nodes, *node)).await.map(drop),
        TreeOp::DeleteTree { node } => trees
            .delete_with_descendants(pick(&nodes, *node))
            .await
            .map(drop),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: invariants hold after every operation of a random sequence
    #[test]
    fn prop_invariants_hold(
        partitioned in any::<bool>(),
        ops in prop::collection::vec(arb_tree_op(), 1..40),
    ) {
        let trees = create_trees(partitioned);
        let violations = block_on(async {
            trees.make_root(None).await.unwrap();
            let mut violations = Vec::new();
            for op in &ops {
                let _ = apply_op(&trees, op).await;
                for report in trees.verify().await.unwrap() {
                    if !report.is_valid() {
                        violations.push((op.clone(), report));
                    }
                }
            }
            violations
        });

        prop_assert!(violations.is_empty(), "violations: {:?}", violations);
    }

    /// Property: appending a leaf and deleting it restores every coordinate
    #[test]
    fn prop_append_delete_round_trip(shape in arb_shape(), target in 0usize..64) {
        let trees = create_trees(false);
        let (before, after) = block_on(async {
            build(&trees, &shape).await;
            let before = snapshot(&trees);
            let leaf = trees.append_to(pick(&before, target), None).await.unwrap();
            trees.delete(leaf.id).await.unwrap();
            (before, snapshot(&trees))
        });

        prop_assert_eq!(before, after);
    }

    /// Property: attaching a node anywhere in its own subtree fails untouched
    #[test]
    fn prop_cycle_prevention(
        shape in arb_shape(),
        choice in 0usize..256,
        position in arb_position(),
    ) {
        let trees = create_trees(false);
        let outcome = block_on(async {
            build(&trees, &shape).await;
            let nodes = snapshot(&trees);
            let pairs: Vec<(NodeId, NodeId)> = nodes
                .iter()
                .flat_map(|a| {
                    nodes
                        .iter()
                        .filter(|d| d.coordinate.is_descendant_of(&a.coordinate))
                        .map(|d| (a.id, d.id))
                        .collect::<Vec<_>>()
                })
                .collect();
            if pairs.is_empty() {
                return None;
            }

            let (node, descendant) = pairs[choice % pairs.len()];
            let result = trees.move_to(node, position, descendant).await;
            Some((result, nodes, snapshot(&trees)))
        });

        if let Some((result, before, after)) = outcome {
            prop_assert_eq!(
                result.unwrap_err(),
                NestedSetError::InvalidTarget(InvalidTargetReason::Descendant)
            );
            prop_assert_eq!(before, after);
        }
    }

    /// Property: reordering siblings keeps every parent, and moving back restores the tree
    #[test]
    fn prop_sibling_moves(shape in arb_shape(), choice in 0usize..256) {
        let trees = create_trees(false);
        let outcome = block_on(async {
            build(&trees, &shape).await;
            let nodes = snapshot(&trees);
            let pairs: Vec<(NodeId, NodeId)> = nodes
                .iter()
                .filter_map(|x| {
                    nodes
                        .iter()
                        .find(|y| y.coordinate.is_next_sibling_of(&x.coordinate))
                        .map(|y| (x.id, y.id))
                })
                .collect();
            if pairs.is_empty() {
                return None;
            }
            let (x, y) = pairs[choice % pairs.len()];

            // Already directly after its previous sibling: nothing moves
            trees.move_to(y, Position::InsertAfter, x).await.unwrap();
            let in_place = snapshot(&trees);

            trees.move_to(x, Position::InsertAfter, y).await.unwrap();
            let swapped = snapshot(&trees);

            trees.move_to(x, Position::InsertBefore, y).await.unwrap();
            let restored = snapshot(&trees);

            Some((nodes, in_place, swapped, restored))
        });

        if let Some((before, in_place, swapped, restored)) = outcome {
            prop_assert_eq!(&before, &in_place);
            prop_assert_eq!(parents(&before), parents(&swapped));
            prop_assert_eq!(&before, &restored);
        }
    }

    /// Property: an operation that fails changes nothing
    #[test]
    fn prop_failed_operations_are_atomic(
        partitioned in any::<bool>(),
        shape in arb_shape(),
        op in arb_tree_op(),
    ) {
        let trees = create_trees(partitioned);
        let (before, result, after) = block_on(async {
            build(&trees, &shape).await;
            let before = snapshot(&trees);
            let result = apply_op(&trees, &op).await;
            (before, result, snapshot(&trees))
        });

        if result.is_err() {
            prop_assert_eq!(before, after);
        }
    }
}
