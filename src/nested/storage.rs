use super::accessor::{Condition, Field, FieldChange, Predicate, RowAccessor, RowStore};
use super::query::{NodeQuery, Order};
use super::types::{Coordinate, NestedSetError, NewRow, Node, NodeId, RowId};
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{ConnectOptions, Row, Sqlite, Transaction};
use std::collections::HashSet;
use std::ops::DerefMut;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

/// Columns the store manages next to the coordinate columns
const PAYLOAD_COLUMNS: [&str; 2] = ["metadata", "created_at"];

/// Table and column names the tree lives in.
///
/// A schema without `tree_column` holds exactly one tree; with it, every
/// root starts its own partition keyed by the root's id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TreeSchema {
    pub table: String,
    pub id_column: String,
    pub left_column: String,
    pub right_column: String,
    pub depth_column: String,
    pub tree_column: Option<String>,
}

impl Default for TreeSchema {
    fn default() -> Self {
        Self {
            table: "nodes".to_string(),
            id_column: "id".to_string(),
            left_column: "lft".to_string(),
            right_column: "rgt".to_string(),
            depth_column: "depth".to_string(),
            tree_column: None,
        }
    }
}

fn identifier_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier pattern is a valid regex")
    })
}

impl TreeSchema {
    /// Partition trees by the given column
    pub fn with_tree_column(mut self, column: impl Into<String>) -> Self {
        self.tree_column = Some(column.into());
        self
    }

    pub fn partitioned(&self) -> bool {
        self.tree_column.is_some()
    }

    /// Check the schema before any SQL is built from it
    pub fn validate(&self) -> Result<(), NestedSetError> {
        if self.id_column.trim().is_empty() {
            return Err(NestedSetError::MissingPrimaryKey);
        }

        let mut columns = vec![
            &self.id_column,
            &self.left_column,
            &self.right_column,
            &self.depth_column,
        ];
        if let Some(tree) = &self.tree_column {
            columns.push(tree);
        }

        for name in std::iter::once(&self.table).chain(columns.iter().copied()) {
            if !identifier_pattern().is_match(name) {
                return Err(NestedSetError::InvalidSchema(format!(
                    "'{}' is not a plain SQL identifier",
                    name
                )));
            }
        }

        let mut seen = HashSet::new();
        for name in columns.iter().map(|c| c.as_str()).chain(PAYLOAD_COLUMNS) {
            if !seen.insert(name.to_ascii_lowercase()) {
                return Err(NestedSetError::InvalidSchema(format!(
                    "column '{}' is used twice",
                    name
                )));
            }
        }

        Ok(())
    }

    pub(crate) fn column(&self, field: Field) -> &str {
        match field {
            Field::Left => &self.left_column,
            Field::Right => &self.right_column,
            Field::Depth => &self.depth_column,
        }
    }

    fn tree_column(&self) -> Result<&str, NestedSetError> {
        self.tree_column.as_deref().ok_or_else(|| {
            NestedSetError::InvalidSchema("tree filter used on an unpartitioned table".into())
        })
    }

    fn migrations(&self) -> Vec<String> {
        let table = &self.table;
        let tree_def = self
            .tree_column
            .as_ref()
            .map(|c| format!("{} INTEGER,\n", c))
            .unwrap_or_default();
        let tree_prefix = self
            .tree_column
            .as_ref()
            .map(|c| format!("{}, ", c))
            .unwrap_or_default();

        vec![
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS {table} (
                    {id} INTEGER PRIMARY KEY AUTOINCREMENT,
                    {tree_def}{lft} INTEGER NOT NULL,
                    {rgt} INTEGER NOT NULL,
                    {depth} INTEGER NOT NULL,
                    metadata TEXT,
                    created_at INTEGER NOT NULL
                )
                "#,
                id = self.id_column,
                lft = self.left_column,
                rgt = self.right_column,
                depth = self.depth_column,
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS idx_{table}_{col} ON {table}({tree_prefix}{col})",
                col = self.left_column,
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS idx_{table}_{col} ON {table}({tree_prefix}{col})",
                col = self.right_column,
            ),
        ]
    }

    fn select_list(&self) -> String {
        let tree = match &self.tree_column {
            Some(column) => format!("{} AS tree_key", column),
            None => "NULL AS tree_key".to_string(),
        };
        format!(
            "{} AS id, {} AS lft, {} AS rgt, {} AS depth, {}, metadata, created_at",
            self.id_column, self.left_column, self.right_column, self.depth_column, tree
        )
    }

    /// Render a condition as a WHERE clause body, pushing its bind values
    pub(crate) fn render_condition(
        &self,
        condition: &Condition,
        binds: &mut Vec<i64>,
    ) -> Result<String, NestedSetError> {
        if condition.predicates.is_empty() {
            return Ok("1 = 1".to_string());
        }

        let mut terms = Vec::with_capacity(condition.predicates.len());
        for predicate in &condition.predicates {
            let term = match predicate {
                Predicate::Compare { field, cmp, value } => {
                    binds.push(*value);
                    format!("{} {} ?", self.column(*field), cmp.as_sql())
                }
                Predicate::Leaf(true) => {
                    format!("{} = {} + 1", self.right_column, self.left_column)
                }
                Predicate::Leaf(false) => {
                    format!("{} > {} + 1", self.right_column, self.left_column)
                }
                Predicate::Tree(key) => {
                    binds.push(key.get());
                    format!("{} = ?", self.tree_column()?)
                }
                Predicate::Id(id) => {
                    binds.push(id.get());
                    format!("{} = ?", self.id_column)
                }
            };
            terms.push(term);
        }

        Ok(terms.join(" AND "))
    }

    /// Render a change list as a SET clause body, pushing its bind values
    pub(crate) fn render_changes(
        &self,
        changes: &[FieldChange],
        binds: &mut Vec<i64>,
    ) -> Result<String, NestedSetError> {
        let mut sets = Vec::with_capacity(changes.len());
        for change in changes {
            let set = match change {
                FieldChange::Add { field, delta } => {
                    binds.push(*delta);
                    let column = self.column(*field);
                    format!("{} = {} + ?", column, column)
                }
                FieldChange::SetTree(key) => {
                    binds.push(key.get());
                    format!("{} = ?", self.tree_column()?)
                }
            };
            sets.push(set);
        }
        Ok(sets.join(", "))
    }

    fn render_order(&self, order: Order) -> String {
        let direction = match order {
            Order::Asc => "ASC",
            Order::Desc => "DESC",
        };
        match &self.tree_column {
            Some(tree) => format!(
                "{} {dir}, {} {dir}",
                tree,
                self.left_column,
                dir = direction
            ),
            None => format!("{} {}", self.left_column, direction),
        }
    }
}

/// Configuration for the SQLite node store
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Path to SQLite database
    pub db_path: PathBuf,

    /// Upper bound on pooled connections
    pub max_connections: u32,

    /// Where the tree lives
    pub schema: TreeSchema,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("arbor-sets.db"),
            max_connections: 4,
            schema: TreeSchema::default(),
        }
    }
}

/// SQLite-backed node collection.
///
/// Hands out [`SqliteRows`] accessors: pooled connections for reads and
/// transactions for structural writes. An uncommitted transaction rolls back
/// when dropped.
pub struct SqliteRowStore {
    pool: SqlitePool,
    schema: Arc<TreeSchema>,
}

impl SqliteRowStore {
    /// Create a new storage instance and run migrations
    pub async fn new(config: StoreConfig) -> Result<Self, NestedSetError> {
        config.schema.validate()?;

        let mut connect_options = SqliteConnectOptions::new()
            .filename(&config.db_path)
            .create_if_missing(true);
        connect_options.disable_statement_logging();
        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .connect_with(connect_options)
            .await
            .map_err(|e| db_error("Failed to connect to database", e))?;

        let storage = Self {
            pool,
            schema: Arc::new(config.schema),
        };
        storage.run_migrations().await?;

        tracing::info!(
            db = %config.db_path.display(),
            table = %storage.schema.table,
            partitioned = storage.schema.partitioned(),
            "Node store ready"
        );
        Ok(storage)
    }

    /// Run database migrations
    async fn run_migrations(&self) -> Result<(), NestedSetError> {
        for statement in self.schema.migrations() {
            sqlx::query(&statement)
                .execute(&self.pool)
                .await
                .map_err(|e| db_error("Failed to run migrations", e))?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl RowStore for SqliteRowStore {
    type Reader = SqliteRows<PoolConnection<Sqlite>>;
    type Tx = SqliteRows<Transaction<'static, Sqlite>>;

    fn schema(&self) -> &TreeSchema {
        &self.schema
    }

    async fn reader(&self) -> Result<Self::Reader, NestedSetError> {
        let conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| db_error("Failed to acquire connection", e))?;
        Ok(SqliteRows::new(conn, self.schema.clone()))
    }

    async fn begin(&self) -> Result<Self::Tx, NestedSetError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("Failed to begin transaction", e))?;
        Ok(SqliteRows::new(tx, self.schema.clone()))
    }

    async fn commit(&self, tx: Self::Tx) -> Result<(), NestedSetError> {
        tx.conn
            .commit()
            .await
            .map_err(|e| db_error("Failed to commit transaction", e))
    }

    async fn rollback(&self, tx: Self::Tx) -> Result<(), NestedSetError> {
        tx.conn
            .rollback()
            .await
            .map_err(|e| db_error("Failed to roll back transaction", e))
    }
}

/// Row accessor over a SQLite connection or transaction
pub struct SqliteRows<C> {
    conn: C,
    schema: Arc<TreeSchema>,
}

impl<C> SqliteRows<C>
where
    C: DerefMut<Target = SqliteConnection> + Send,
{
    pub fn new(conn: C, schema: Arc<TreeSchema>) -> Self {
        Self { conn, schema }
    }

    async fn execute(&mut self, sql: &str, binds: &[i64], context: &str) -> Result<u64, NestedSetError> {
        let mut query = sqlx::query(sql);
        for value in binds {
            query = query.bind(*value);
        }
        let result = query
            .execute(&mut *self.conn)
            .await
            .map_err(|e| db_error(context, e))?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl<C> RowAccessor for SqliteRows<C>
where
    C: DerefMut<Target = SqliteConnection> + Send,
{
    async fn read(&mut self, id: NodeId) -> Result<Option<Node>, NestedSetError> {
        let sql = format!(
            "SELECT {} FROM {} WHERE {} = ?",
            self.schema.select_list(),
            self.schema.table,
            self.schema.id_column
        );
        let row = sqlx::query(&sql)
            .bind(id.get())
            .fetch_optional(&mut *self.conn)
            .await
            .map_err(|e| db_error("Failed to fetch node", e))?;

        row.as_ref().map(row_to_node).transpose()
    }

    async fn insert(&mut self, row: NewRow) -> Result<NodeId, NestedSetError> {
        let schema = &self.schema;
        let (tree_col, tree_slot) = match &schema.tree_column {
            Some(column) => (format!(", {}", column), ", ?"),
            None => (String::new(), ""),
        };
        let sql = format!(
            "INSERT INTO {} ({}, {}, {}{}, metadata, created_at) VALUES (?, ?, ?{}, ?, ?)",
            schema.table,
            schema.left_column,
            schema.right_column,
            schema.depth_column,
            tree_col,
            tree_slot
        );

        let metadata_json = row
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| format!("Failed to serialize metadata: {}", e))?;

        let c = row.coordinate;
        let mut query = sqlx::query(&sql).bind(c.left).bind(c.right).bind(c.depth);
        if schema.partitioned() {
            query = query.bind(c.tree.map(|t| t.get()));
        }
        let result = query
            .bind(metadata_json)
            .bind(current_timestamp())
            .execute(&mut *self.conn)
            .await
            .map_err(|e| db_error("Failed to insert node", e))?;

        Ok(RowId::new(result.last_insert_rowid()))
    }

    async fn update_metadata(
        &mut self,
        id: NodeId,
        metadata: Option<Value>,
    ) -> Result<u64, NestedSetError> {
        let sql = format!(
            "UPDATE {} SET metadata = ? WHERE {} = ?",
            self.schema.table, self.schema.id_column
        );
        let metadata_json = metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| format!("Failed to serialize metadata: {}", e))?;

        let result = sqlx::query(&sql)
            .bind(metadata_json)
            .bind(id.get())
            .execute(&mut *self.conn)
            .await
            .map_err(|e| db_error("Failed to update node metadata", e))?;
        Ok(result.rows_affected())
    }

    async fn bulk_update(
        &mut self,
        condition: &Condition,
        changes: &[FieldChange],
    ) -> Result<u64, NestedSetError> {
        if changes.is_empty() {
            return Ok(0);
        }
        let mut binds = Vec::new();
        let sets = self.schema.render_changes(changes, &mut binds)?;
        let filter = self.schema.render_condition(condition, &mut binds)?;
        let sql = format!("UPDATE {} SET {} WHERE {}", self.schema.table, sets, filter);
        self.execute(&sql, &binds, "Failed to update coordinates").await
    }

    async fn bulk_delete(&mut self, condition: &Condition) -> Result<u64, NestedSetError> {
        let mut binds = Vec::new();
        let filter = self.schema.render_condition(condition, &mut binds)?;
        let sql = format!("DELETE FROM {} WHERE {}", self.schema.table, filter);
        self.execute(&sql, &binds, "Failed to delete nodes").await
    }

    async fn count(&mut self, condition: &Condition) -> Result<u64, NestedSetError> {
        let mut binds = Vec::new();
        let filter = self.schema.render_condition(condition, &mut binds)?;
        let sql = format!(
            "SELECT COUNT(*) AS total FROM {} WHERE {}",
            self.schema.table, filter
        );
        let mut query = sqlx::query(&sql);
        for value in &binds {
            query = query.bind(*value);
        }
        let row = query
            .fetch_one(&mut *self.conn)
            .await
            .map_err(|e| db_error("Failed to count nodes", e))?;
        let total: i64 = row
            .try_get("total")
            .map_err(|e| db_error("Failed to read node count", e))?;
        Ok(total.max(0) as u64)
    }

    async fn select(&mut self, query: &NodeQuery) -> Result<Vec<Node>, NestedSetError> {
        let mut binds = Vec::new();
        let filter = self.schema.render_condition(&query.condition, &mut binds)?;
        binds.push(query.limit.map(|l| l as i64).unwrap_or(-1));
        binds.push(query.offset as i64);
        let sql = format!(
            "SELECT {} FROM {} WHERE {} ORDER BY {} LIMIT ? OFFSET ?",
            self.schema.select_list(),
            self.schema.table,
            filter,
            self.schema.render_order(query.order)
        );

        let mut statement = sqlx::query(&sql);
        for value in &binds {
            statement = statement.bind(*value);
        }
        let rows = statement
            .fetch_all(&mut *self.conn)
            .await
            .map_err(|e| db_error("Failed to select nodes", e))?;

        rows.iter().map(row_to_node).collect()
    }
}

fn row_to_node(row: &SqliteRow) -> Result<Node, NestedSetError> {
    let decode = |e| db_error("Failed to decode node row", e);

    let tree: Option<i64> = row.try_get("tree_key").map_err(decode)?;
    let metadata_json: Option<String> = row.try_get("metadata").map_err(decode)?;
    let metadata = metadata_json.and_then(|s| serde_json::from_str(&s).ok());

    Ok(Node {
        id: RowId::new(row.try_get("id").map_err(decode)?),
        coordinate: Coordinate {
            left: row.try_get("lft").map_err(decode)?,
            right: row.try_get("rgt").map_err(decode)?,
            depth: row.try_get("depth").map_err(decode)?,
            tree: tree.map(RowId::new),
        },
        metadata,
        created_at: row.try_get("created_at").map_err(decode)?,
    })
}

/// Map a sqlx error, classifying SQLite busy/locked codes as retryable conflicts
fn db_error(context: &str, e: sqlx::Error) -> NestedSetError {
    if let sqlx::Error::Database(db) = &e {
        if matches!(
            db.code().as_deref(),
            Some("5" | "6" | "261" | "262" | "517")
        ) {
            return NestedSetError::Conflict(format!("{}: {}", context, e));
        }
    }
    NestedSetError::Storage(format!("{}: {}", context, e))
}

/// Get current Unix timestamp in seconds
pub(crate) fn current_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}
