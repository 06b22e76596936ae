//! State Tracker
//!
//! Persistent per-node state kept in the node's data directory: the member
//! id the store assigned at first join and a count of starts.

use std::path::PathBuf;
use rusqlite::{Connection, params};
use tokio::sync::Mutex;

use crate::store::MemberId;
use crate::error::{Error, Result};

/// Persistent state tracker backed by SQLite
pub struct StateTracker {
    /// Database connection
    conn: Mutex<Connection>,
    /// Member name
    name: String,
}

impl StateTracker {
    /// Create or open the state tracker database
    pub fn new(data_dir: PathBuf, name: String) -> Result<Self> {
        std::fs::create_dir_all(&data_dir)?;

        let db_path = data_dir.join("state.db");
        let conn = Connection::open(&db_path)?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS node_state (
                key TEXT PRIMARY KEY,
                value_int INTEGER,
                value_text TEXT,
                updated_at TEXT DEFAULT CURRENT_TIMESTAMP
            );
            "#,
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
            name,
        })
    }

    /// Member id recorded at a previous join
    pub async fn member_id(&self) -> Result<Option<MemberId>> {
        let conn = self.conn.lock().await;
        let result: std::result::Result<i64, _> = conn.query_row(
            "SELECT value_int FROM node_state WHERE key = 'member_id'",
            [],
            |row| row.get(0),
        );

        match result {
            // Stored bit-for-bit; ids use the full u64 range
            Ok(id) => Ok(Some(id as u64)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(Error::State(format!("Failed to get member id: {}", e))),
        }
    }

    /// Record the member id assigned at join
    pub async fn set_member_id(&self, id: MemberId) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO node_state (key, value_int, value_text) VALUES ('member_id', ?1, ?2)
            ON CONFLICT(key) DO UPDATE SET value_int = ?1, value_text = ?2, updated_at = CURRENT_TIMESTAMP
            "#,
            params![id as i64, self.name],
        )?;
        Ok(())
    }

    /// Number of recorded starts
    pub async fn start_count(&self) -> Result<u64> {
        let conn = self.conn.lock().await;
        let result: std::result::Result<i64, _> = conn.query_row(
            "SELECT value_int FROM node_state WHERE key = 'start_count'",
            [],
            |row| row.get(0),
        );

        match result {
            Ok(count) => Ok(count as u64),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(0),
            Err(e) => Err(Error::State(format!("Failed to get start count: {}", e))),
        }
    }

    /// Record a start, returning the new count
    pub async fn record_start(&self) -> Result<u64> {
        {
            let conn = self.conn.lock().await;
            conn.execute(
                r#"
                INSERT INTO node_state (key, value_int) VALUES ('start_count', 1)
                ON CONFLICT(key) DO UPDATE SET value_int = value_int + 1, updated_at = CURRENT_TIMESTAMP
                "#,
                [],
            )?;
        }
        self.start_count().await
    }

    /// Get member name
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::State(format!("SQLite error: {}", e))
    }
}
