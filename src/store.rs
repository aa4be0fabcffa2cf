//! SQLite persisted store for deployment records
//!
//! Durable source of record for the subdomain→container mapping. The
//! `status` column is a hint for observability and the reaper's candidate
//! scan; liveness decisions always go to the container runtime instead.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Current schema version for migrations
const SCHEMA_VERSION: i32 = 1;

/// Lifecycle hint persisted alongside a deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    Running,
    Stopped,
    Paused,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::Running => "running",
            DeploymentStatus::Stopped => "stopped",
            DeploymentStatus::Paused => "paused",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(DeploymentStatus::Running),
            "stopped" => Some(DeploymentStatus::Stopped),
            "paused" => Some(DeploymentStatus::Paused),
            _ => None,
        }
    }
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One externally reachable application
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub id: String,
    pub subdomain: String,
    pub host_port: u16,
    pub container_id: String,
    pub container_name: String,
    pub image: String,
    pub status: DeploymentStatus,
    pub env: Option<HashMap<String, String>>,
    pub last_active_at: String,
    pub created_at: String,
    pub updated_at: String,
}

/// Fields for a deployment being persisted for the first time
#[derive(Debug, Clone)]
pub struct NewDeployment {
    pub id: String,
    pub subdomain: String,
    pub host_port: u16,
    pub container_id: String,
    pub container_name: String,
    pub image: String,
    pub env: Option<HashMap<String, String>>,
}

/// Database connection wrapper with thread-safe access
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path).context("Failed to open database")?;

        // WAL keeps readers off the writers' backs
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.run_migrations()?;

        info!("Database opened at {}", path.display());
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;

        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.run_migrations()?;
        Ok(db)
    }

    /// Run database migrations
    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )?;

        let current_version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if current_version < SCHEMA_VERSION {
            info!(
                "Running migrations from v{} to v{}",
                current_version, SCHEMA_VERSION
            );

            if current_version < 1 {
                self.migrate_v1(&conn)?;
            }
        }

        Ok(())
    }

    /// Migration v1: deployments table
    fn migrate_v1(&self, conn: &Connection) -> Result<()> {
        debug!("Applying migration v1: deployments");

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS deployments (
                id TEXT PRIMARY KEY,
                subdomain TEXT NOT NULL UNIQUE,
                host_port INTEGER NOT NULL,
                container_id TEXT NOT NULL,
                container_name TEXT NOT NULL,
                image TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'running',
                env TEXT,
                last_active_at TEXT NOT NULL DEFAULT (datetime('now')),
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE INDEX IF NOT EXISTS idx_deployments_subdomain ON deployments(subdomain);
            CREATE INDEX IF NOT EXISTS idx_deployments_status ON deployments(status);
            CREATE INDEX IF NOT EXISTS idx_deployments_port ON deployments(host_port, status);

            INSERT INTO schema_migrations (version) VALUES (1);
        "#,
        )?;

        Ok(())
    }

    const RECORD_COLUMNS: &'static str = "id, subdomain, host_port, container_id, \
         container_name, image, status, env, last_active_at, created_at, updated_at";

    fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<DeploymentRecord> {
        let status: String = row.get(6)?;
        let status = DeploymentStatus::parse(&status).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                6,
                rusqlite::types::Type::Text,
                format!("unknown deployment status '{}'", status).into(),
            )
        })?;
        let env: Option<String> = row.get(7)?;

        Ok(DeploymentRecord {
            id: row.get(0)?,
            subdomain: row.get(1)?,
            host_port: row.get::<_, i64>(2)? as u16,
            container_id: row.get(3)?,
            container_name: row.get(4)?,
            image: row.get(5)?,
            status,
            env: env.and_then(|e| serde_json::from_str(&e).ok()),
            last_active_at: row.get(8)?,
            created_at: row.get(9)?,
            updated_at: row.get(10)?,
        })
    }

    /// Persist a fresh deployment with status=running and a fresh activity
    /// timestamp, returning the stored record
    pub fn create(&self, new: &NewDeployment) -> Result<DeploymentRecord> {
        let env_json = new
            .env
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("Failed to serialize environment")?;

        {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO deployments
                     (id, subdomain, host_port, container_id, container_name, image, status, env)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'running', ?7)",
                params![
                    new.id,
                    new.subdomain,
                    new.host_port as i64,
                    new.container_id,
                    new.container_name,
                    new.image,
                    env_json,
                ],
            )
            .context("Failed to insert deployment")?;
        }

        self.get(&new.id)?
            .context("Deployment missing immediately after insert")
    }

    /// Get a deployment by id
    pub fn get(&self, id: &str) -> Result<Option<DeploymentRecord>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            &format!(
                "SELECT {} FROM deployments WHERE id = ?1",
                Self::RECORD_COLUMNS
            ),
            params![id],
            Self::row_to_record,
        )
        .optional()
        .context("Failed to get deployment")
    }

    /// Get a deployment by subdomain
    pub fn get_by_subdomain(&self, subdomain: &str) -> Result<Option<DeploymentRecord>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            &format!(
                "SELECT {} FROM deployments WHERE subdomain = ?1",
                Self::RECORD_COLUMNS
            ),
            params![subdomain],
            Self::row_to_record,
        )
        .optional()
        .context("Failed to get deployment by subdomain")
    }

    /// Whether any running deployment currently claims the given host port
    pub fn port_in_use(&self, port: u16) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let exists: bool = conn.query_row(
            "SELECT EXISTS(
                 SELECT 1 FROM deployments WHERE host_port = ?1 AND status = 'running'
             )",
            params![port as i64],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    /// Point a deployment at a new revision (container, image, port, env)
    /// after a successful swap
    pub fn update_revision(
        &self,
        id: &str,
        container_id: &str,
        container_name: &str,
        image: &str,
        host_port: u16,
        env: Option<&HashMap<String, String>>,
    ) -> Result<()> {
        let env_json = env
            .map(serde_json::to_string)
            .transpose()
            .context("Failed to serialize environment")?;

        let conn = self.conn.lock().unwrap();
        let rows = conn.execute(
            "UPDATE deployments
             SET container_id = ?1, container_name = ?2, image = ?3, host_port = ?4,
                 env = ?5, status = 'running', last_active_at = datetime('now'),
                 updated_at = datetime('now')
             WHERE id = ?6",
            params![container_id, container_name, image, host_port as i64, env_json, id],
        )?;
        if rows == 0 {
            anyhow::bail!("No deployment with id {}", id);
        }
        Ok(())
    }

    /// Update the status hint
    pub fn set_status(&self, id: &str, status: DeploymentStatus) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE deployments
             SET status = ?1, updated_at = datetime('now')
             WHERE id = ?2",
            params![status.as_str(), id],
        )?;
        Ok(())
    }

    /// Reset the idle clock for a deployment
    pub fn touch(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE deployments
             SET last_active_at = datetime('now'), updated_at = datetime('now')
             WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    /// All deployments whose status hint says running (reaper candidates)
    pub fn list_running(&self) -> Result<Vec<DeploymentRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM deployments WHERE status = 'running' ORDER BY created_at",
            Self::RECORD_COLUMNS
        ))?;

        let records = stmt
            .query_map([], Self::row_to_record)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(records)
    }
}
