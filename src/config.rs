//! Configuration for the `arbor-sets` binary.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::nested::{StoreConfig, TreeSchema, DEFAULT_PAGE_SIZE};

/// Settings read from a TOML file; every field has a default
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Path to SQLite database
    pub db_path: PathBuf,

    /// Upper bound on pooled connections
    pub max_connections: u32,

    /// Rows fetched per page when streaming query results
    pub page_size: u64,

    /// Table and column names of the tree
    pub schema: TreeSchema,
}

impl Default for AppConfig {
    fn default() -> Self {
        let store = StoreConfig::default();
        Self {
            db_path: store.db_path,
            max_connections: store.max_connections,
            page_size: DEFAULT_PAGE_SIZE,
            schema: store.schema,
        }
    }
}

impl AppConfig {
    pub fn from_toml_str(source: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(source)
    }

    /// Load a configuration file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let source = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml_str(&source)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Load `path` when given, then apply the database override
    pub fn resolve(path: Option<&Path>, db_override: Option<PathBuf>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        if let Some(db_path) = db_override {
            config.db_path = db_path;
        }
        Ok(config)
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            db_path: self.db_path.clone(),
            max_connections: self.max_connections,
            schema: self.schema.clone(),
        }
    }
}
