use arbor_sets::{
    nested::RowId,
    AppConfig, NestedSetError, NestedSets, NodeQuery, Position, SqliteRowStore, TreeEvent,
};
use clap::{Args as ClapArgs, Parser, Subcommand};
use futures::TryStreamExt;
use serde_json::{Map, Value};
use std::path::PathBuf;

/// CLI arguments for arbor-sets
#[derive(Parser, Debug)]
#[command(name = "arbor-sets")]
#[command(about = "Maintain nested set trees stored in a SQLite table")]
struct Args {
    /// TOML configuration file
    #[arg(long, env = "ARBOR_SETS_CONFIG")]
    config: Option<PathBuf>,

    /// Path to the SQLite database (overrides the configuration file)
    #[arg(long, env = "ARBOR_SETS_DB")]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

/// Payload stored with a node
#[derive(ClapArgs, Debug, Clone)]
struct Payload {
    /// Display name, stored as `metadata.name`
    #[arg(long)]
    name: Option<String>,

    /// JSON object stored as the node's metadata
    #[arg(long)]
    metadata: Option<String>,
}

impl Payload {
    fn into_value(self) -> anyhow::Result<Option<Value>> {
        let mut object = match self.metadata {
            Some(raw) => match serde_json::from_str::<Value>(&raw)? {
                Value::Object(map) => map,
                other => anyhow::bail!("metadata must be a JSON object, got {}", other),
            },
            None => Map::new(),
        };
        if let Some(name) = self.name {
            object.insert("name".into(), Value::String(name));
        }
        Ok((!object.is_empty()).then_some(Value::Object(object)))
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a new root
    Root {
        #[command(flatten)]
        payload: Payload,
    },
    /// Create a node as the last child of TARGET
    Append {
        target: RowId,
        #[command(flatten)]
        payload: Payload,
    },
    /// Create a node as the first child of TARGET
    Prepend {
        target: RowId,
        #[command(flatten)]
        payload: Payload,
    },
    /// Create a node right before TARGET
    Before {
        target: RowId,
        #[command(flatten)]
        payload: Payload,
    },
    /// Create a node right after TARGET
    After {
        target: RowId,
        #[command(flatten)]
        payload: Payload,
    },
    /// Move NODE and its subtree relative to TARGET
    Move {
        node: RowId,
        target: RowId,
        /// prepend_to, append_to, insert_before or insert_after
        #[arg(long, default_value = "append_to")]
        position: Position,
    },
    /// Move NODE and its subtree into a tree of its own
    MoveRoot { node: RowId },
    /// Delete NODE; its children move up a level
    Delete { node: RowId },
    /// Delete NODE with all of its descendants
    DeleteTree { node: RowId },
    /// Replace the payload of NODE
    Save {
        node: RowId,
        #[command(flatten)]
        payload: Payload,
    },
    /// Show one node
    Show { node: RowId },
    /// List the ancestors of NODE
    Ancestors {
        node: RowId,
        /// Only this many levels up
        #[arg(long)]
        depth: Option<i64>,
    },
    /// List the descendants of NODE
    Descendants {
        node: RowId,
        /// Only this many levels down
        #[arg(long)]
        depth: Option<i64>,
    },
    /// List the children of NODE
    Children { node: RowId },
    /// List the leaves below NODE
    Leaves { node: RowId },
    /// Show the siblings next to NODE
    Siblings { node: RowId },
    /// List every root
    Roots,
    /// Print trees as text
    Render {
        /// Only the tree keyed by this root
        #[arg(long)]
        tree: Option<RowId>,
    },
    /// Check every tree for broken bounds or depths
    Verify,
    /// Print the JSON schema of the command output
    Schema,
}

async fn run(trees: &NestedSets<SqliteRowStore>, command: Command) -> anyhow::Result<TreeEvent> {
    let event = match command {
        Command::Root { payload } => TreeEvent::NodeCreated {
            node: trees.make_root(payload.into_value()?).await?,
        },
        Command::Append { target, payload } => TreeEvent::NodeCreated {
            node: trees.append_to(target, payload.into_value()?).await?,
        },
        Command::Prepend { target, payload } => TreeEvent::NodeCreated {
            node: trees.prepend_to(target, payload.into_value()?).await?,
        },
        Command::Before { target, payload } => TreeEvent::NodeCreated {
            node: trees.insert_before(target, payload.into_value()?).await?,
        },
        Command::After { target, payload } => TreeEvent::NodeCreated {
            node: trees.insert_after(target, payload.into_value()?).await?,
        },
        Command::Move {
            node,
            target,
            position,
        } => TreeEvent::NodeMoved {
            node: trees.move_to(node, position, target).await?,
        },
        Command::MoveRoot { node } => TreeEvent::NodeMoved {
            node: trees.move_to_root(node).await?,
        },
        Command::Delete { node } => TreeEvent::NodesDeleted {
            node_id: node,
            deleted: trees.delete(node).await?,
        },
        Command::DeleteTree { node } => TreeEvent::NodesDeleted {
            node_id: node,
            deleted: trees.delete_with_descendants(node).await?,
        },
        Command::Save { node, payload } => TreeEvent::NodeSaved {
            node: trees.save(node, payload.into_value()?).await?,
        },
        Command::Show { node } => TreeEvent::NodeData {
            node: trees
                .node(node)
                .await?
                .ok_or(NestedSetError::NodeNotFound(node))?,
        },
        Command::Ancestors { node, depth } => TreeEvent::NodeList {
            nodes: trees.ancestors(node, depth).await?,
        },
        Command::Descendants { node, depth } => TreeEvent::NodeList {
            nodes: trees.descendants(node, depth).await?,
        },
        Command::Children { node } => TreeEvent::NodeList {
            nodes: trees.children(node).await?,
        },
        Command::Leaves { node } => TreeEvent::NodeList {
            nodes: trees.leaves(node).await?,
        },
        Command::Siblings { node } => TreeEvent::Siblings {
            node_id: node,
            prev: trees.prev_sibling(node).await?,
            next: trees.next_sibling(node).await?,
        },
        Command::Roots => TreeEvent::NodeList {
            nodes: trees.stream(NodeQuery::all().roots()).try_collect().await?,
        },
        Command::Render { tree } => TreeEvent::TreeRender {
            tree,
            render: trees.render(tree).await?,
        },
        Command::Verify => TreeEvent::TreeVerified {
            reports: trees.verify().await?,
        },
        Command::Schema => anyhow::bail!("schema is printed without opening the database"),
    };
    Ok(event)
}

fn error_event(error: &anyhow::Error) -> TreeEvent {
    let retryable = error
        .downcast_ref::<NestedSetError>()
        .is_some_and(NestedSetError::is_retryable);
    TreeEvent::Error {
        message: error.to_string(),
        retryable,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (silently ignore if not found)
    dotenvy::dotenv().ok();

    // Logs go to stderr so stdout stays machine readable
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("arbor_sets=info,sqlx=warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    if let Command::Schema = args.command {
        let schema = schemars::schema_for!(TreeEvent);
        println!("{}", serde_json::to_string_pretty(&schema)?);
        return Ok(());
    }

    let config = AppConfig::resolve(args.config.as_deref(), args.db)?;
    tracing::debug!(db = %config.db_path.display(), "Opening node store");
    let store = SqliteRowStore::new(config.store_config()).await?;
    let trees = NestedSets::new(store).with_page_size(config.page_size);

    let event = match run(&trees, args.command).await {
        Ok(event) => event,
        Err(e) => error_event(&e),
    };

    match &event {
        // Render output is plain text
        TreeEvent::TreeRender { render, .. } => print!("{}", render),
        _ => println!("{}", serde_json::to_string_pretty(&event)?),
    }
    if let TreeEvent::Error { .. } = event {
        std::process::exit(1);
    }
    Ok(())
}
