//! SurrealDB Handle - Connection and Operations
//!
//! Manages the connection and provides the raw operations behind the
//! SurrealDB-backed `ParameterStore` and `RunLedger`:
//! - parameter get / put (record id = rendered parameter key)
//! - run record upsert / fetch
//! - run event append / ordered fetch
//!
//! Supports in-memory, local file (`surrealkv://`) and cloud (WebSocket)
//! connections. Run records and event payloads are stored as JSON text so the
//! storage layout stays independent of SurrealDB's value model.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use surrealdb::engine::any::Any;
use surrealdb::opt::auth::{Database, Root};
use surrealdb::Surreal;
use tracing::{debug, info, instrument};

use crate::error::StorageError;
use crate::storage_traits::{ParameterKey, RunEvent, RunId, RunRecord, StorageResult};

const PARAMETERS: &str = "parameters";
const RUNS: &str = "runs";
const RUN_EVENTS: &str = "run_events";

/// Configuration for a remote SurrealDB connection
#[derive(Debug, Clone)]
pub struct CloudConfig {
    /// WebSocket endpoint URL (e.g., "wss://xxx.aws-use1.surrealdb.cloud")
    pub endpoint: String,
    /// Database username
    pub username: String,
    /// Database password
    pub password: String,
    /// Namespace (default: "shipyard")
    pub namespace: String,
    /// Database name (default: "main")
    pub database: String,
    /// Whether this is a root user (true) or database user (false)
    pub is_root: bool,
}

impl CloudConfig {
    /// Load from environment variables:
    /// - SURREALDB_ENDPOINT, SURREALDB_USERNAME, SURREALDB_PASSWORD (required)
    /// - SURREALDB_NAMESPACE (optional, default: "shipyard")
    /// - SURREALDB_DATABASE (optional, default: "main")
    /// - SURREALDB_ROOT (optional, default: "false")
    pub fn from_env() -> std::result::Result<Self, String> {
        let endpoint =
            std::env::var("SURREALDB_ENDPOINT").map_err(|_| "SURREALDB_ENDPOINT not set")?;
        let username =
            std::env::var("SURREALDB_USERNAME").map_err(|_| "SURREALDB_USERNAME not set")?;
        let password =
            std::env::var("SURREALDB_PASSWORD").map_err(|_| "SURREALDB_PASSWORD not set")?;
        let namespace =
            std::env::var("SURREALDB_NAMESPACE").unwrap_or_else(|_| "shipyard".to_string());
        let database = std::env::var("SURREALDB_DATABASE").unwrap_or_else(|_| "main".to_string());
        let is_root = std::env::var("SURREALDB_ROOT")
            .map(|v| v.to_lowercase() == "true")
            .unwrap_or(false);

        Ok(Self {
            endpoint,
            username,
            password,
            namespace,
            database,
            is_root,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DbParameter {
    #[serde(default, skip_serializing)]
    id: Option<surrealdb::sql::Thing>,
    key: String,
    value: String,
    updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DbRun {
    #[serde(default, skip_serializing)]
    id: Option<surrealdb::sql::Thing>,
    run_id: String,
    record_json: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DbRunEvent {
    #[serde(default, skip_serializing)]
    id: Option<surrealdb::sql::Thing>,
    run_id: String,
    seq: u64,
    event_json: String,
}

/// `mem://` and `memory` URLs keep data only for the life of the process.
pub fn is_in_memory(url: &str) -> bool {
    let url = url.trim();
    url == "memory" || url.starts_with("mem://")
}

/// SurrealDB connection handle for Shipyard state
#[derive(Clone)]
pub struct SurrealHandle {
    db: Surreal<Any>,
}

impl SurrealHandle {
    /// Connect to an in-memory SurrealDB instance.
    #[instrument]
    pub async fn setup_db() -> StorageResult<Self> {
        Self::connect_url("mem://").await
    }

    /// Connect to any SurrealDB URL (`mem://`, `surrealkv://path`, `ws://...`)
    /// using the default `shipyard/main` namespace and database.
    #[instrument]
    pub async fn connect_url(url: &str) -> StorageResult<Self> {
        info!("Connecting to SurrealDB at {}", url);

        let db = surrealdb::engine::any::connect(url)
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        db.use_ns("shipyard")
            .use_db("main")
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        let handle = SurrealHandle { db };
        handle.init_schema().await?;
        Ok(handle)
    }

    /// Connect to a remote SurrealDB with credentials.
    #[instrument(skip(config), fields(endpoint = %config.endpoint, namespace = %config.namespace))]
    pub async fn setup_cloud(config: CloudConfig) -> StorageResult<Self> {
        info!("Connecting to SurrealDB Cloud (root={})", config.is_root);

        let db = surrealdb::engine::any::connect(&config.endpoint)
            .await
            .map_err(|e| {
                StorageError::Connection(format!("Failed to connect to {}: {}", config.endpoint, e))
            })?;

        if config.is_root {
            db.signin(Root {
                username: &config.username,
                password: &config.password,
            })
            .await
            .map_err(|e| StorageError::Connection(format!("Root authentication failed: {}", e)))?;
        } else {
            db.signin(Database {
                namespace: &config.namespace,
                database: &config.database,
                username: &config.username,
                password: &config.password,
            })
            .await
            .map_err(|e| {
                StorageError::Connection(format!("Database authentication failed: {}", e))
            })?;
        }

        db.use_ns(&config.namespace)
            .use_db(&config.database)
            .await
            .map_err(|e| {
                StorageError::Connection(format!("Failed to select namespace/database: {}", e))
            })?;

        let handle = SurrealHandle { db };
        handle.init_schema().await?;
        Ok(handle)
    }

    /// Connect using environment variables
    ///
    /// If SURREALDB_ENDPOINT is set, connects to cloud.
    /// If SURREALDB_URL is set, connects to that URL.
    /// Otherwise connects to `default_url`.
    ///
    /// The resolved URL must be persistent; see [`Self::connect_persistent`].
    #[instrument]
    pub async fn setup_from_env(default_url: &str) -> StorageResult<Self> {
        if let Ok(config) = CloudConfig::from_env() {
            return Self::setup_cloud(config).await;
        }

        let url = std::env::var("SURREALDB_URL")
            .ok()
            .filter(|url| !url.trim().is_empty())
            .unwrap_or_else(|| default_url.to_string());
        Self::connect_persistent(&url).await
    }

    /// Connect to a URL whose data outlives this process. In-memory URLs are
    /// refused; a local `surrealkv://` directory is created when missing.
    pub async fn connect_persistent(url: &str) -> StorageResult<Self> {
        if is_in_memory(url) {
            return Err(StorageError::Connection(format!(
                "{url} is in-memory and would not be shared between shipyard invocations; \
                 set SURREALDB_URL or [state] url to a persistent database"
            )));
        }
        if let Some(path) = url.strip_prefix("surrealkv://") {
            std::fs::create_dir_all(path).map_err(|e| {
                StorageError::Connection(format!("cannot create state directory {path}: {e}"))
            })?;
        }
        Self::connect_url(url).await
    }

    async fn init_schema(&self) -> StorageResult<()> {
        debug!("Initializing Shipyard schema");

        let schema = r#"
            DEFINE TABLE IF NOT EXISTS parameters SCHEMALESS;
            DEFINE INDEX IF NOT EXISTS idx_parameter_key ON TABLE parameters COLUMNS key UNIQUE;

            DEFINE TABLE IF NOT EXISTS runs SCHEMALESS;
            DEFINE INDEX IF NOT EXISTS idx_run_id ON TABLE runs COLUMNS run_id UNIQUE;

            DEFINE TABLE IF NOT EXISTS run_events SCHEMALESS;
            DEFINE INDEX IF NOT EXISTS idx_run_id_seq ON TABLE run_events COLUMNS run_id, seq UNIQUE;
        "#;

        self.db
            .query(schema)
            .await
            .map_err(|e| StorageError::Backend(format!("schema setup failed: {e}")))?;
        Ok(())
    }

    // ========== Parameter Operations ==========

    #[instrument(skip(self), fields(key = %key))]
    pub async fn parameter_get(&self, key: &ParameterKey) -> StorageResult<Option<String>> {
        let row: Option<DbParameter> = self.db.select((PARAMETERS, key.to_string())).await?;
        Ok(row.map(|r| r.value))
    }

    #[instrument(skip(self, value), fields(key = %key))]
    pub async fn parameter_put(&self, key: &ParameterKey, value: &str) -> StorageResult<()> {
        let row = DbParameter {
            id: None,
            key: key.to_string(),
            value: value.to_string(),
            updated_at: Utc::now().to_rfc3339(),
        };
        let _written: Option<DbParameter> = self
            .db
            .upsert((PARAMETERS, key.to_string()))
            .content(row)
            .await?;
        Ok(())
    }

    // ========== Run Operations ==========

    pub async fn run_put(&self, record: &RunRecord) -> StorageResult<()> {
        let row = DbRun {
            id: None,
            run_id: record.run_id.0.clone(),
            record_json: serde_json::to_string(record)?,
        };
        let _written: Option<DbRun> = self
            .db
            .upsert((RUNS, record.run_id.0.clone()))
            .content(row)
            .await?;
        Ok(())
    }

    pub async fn run_get(&self, run_id: &RunId) -> StorageResult<RunRecord> {
        let row: Option<DbRun> = self.db.select((RUNS, run_id.0.clone())).await?;
        let row = row.ok_or_else(|| StorageError::RunNotFound {
            run_id: run_id.0.clone(),
        })?;
        Ok(serde_json::from_str(&row.record_json)?)
    }

    pub async fn run_event_append(&self, run_id: &RunId, event: &RunEvent) -> StorageResult<()> {
        let row = DbRunEvent {
            id: None,
            run_id: run_id.0.clone(),
            seq: event.seq,
            event_json: serde_json::to_string(event)?,
        };
        let _created: Option<DbRunEvent> = self.db.create(RUN_EVENTS).content(row).await?;
        Ok(())
    }

    pub async fn run_events(&self, run_id: &RunId) -> StorageResult<Vec<RunEvent>> {
        let mut res = self
            .db
            .query("SELECT * FROM run_events WHERE run_id = $rid ORDER BY seq ASC")
            .bind(("rid", run_id.0.clone()))
            .await?;
        let rows: Vec<DbRunEvent> = res.take(0)?;
        rows.iter()
            .map(|row| serde_json::from_str(&row.event_json).map_err(StorageError::from))
            .collect()
    }
}
