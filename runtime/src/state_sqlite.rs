use std::path::Path;

use async_trait::async_trait;
use nanobot_mcp_core::state::{SessionState, StateStore, StateStoreError};
use sqlx::{Row, SqliteConnection};
use tokio::sync::Mutex;

use crate::logging_sqlite::{ensure_schema, open_connection};

const MIGRATION_SQL: &str = include_str!("sql/migrations/0002_session_state.sql");

/// Session states kept in one SQLite table as JSON blobs.
pub struct SqliteStateStore {
    conn: Mutex<SqliteConnection>,
}

impl SqliteStateStore {
    pub async fn open(path: &Path) -> Result<Self, StateStoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(store_error)?;
        }
        let mut conn = open_connection(path).await.map_err(store_error)?;
        ensure_schema(&mut conn, MIGRATION_SQL)
            .await
            .map_err(store_error)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn store_error(e: impl std::fmt::Display) -> StateStoreError {
    StateStoreError(e.to_string())
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn get(&self, id: &str) -> Result<Option<SessionState>, StateStoreError> {
        let mut conn = self.conn.lock().await;
        let row = sqlx::query("SELECT state_json FROM session_state WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(store_error)?;
        let Some(row) = row else {
            return Ok(None);
        };
        let json: String = row.try_get("state_json").map_err(store_error)?;
        serde_json::from_str(&json).map(Some).map_err(store_error)
    }

    async fn put(&self, state: &SessionState) -> Result<(), StateStoreError> {
        let json = serde_json::to_string(state).map_err(store_error)?;
        let mut conn = self.conn.lock().await;
        sqlx::query(
            "INSERT INTO session_state (id, state_json, updated_at_ms) VALUES (?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET state_json = excluded.state_json, updated_at_ms = excluded.updated_at_ms",
        )
        .bind(&state.id)
        .bind(json)
        .bind(now_ms())
        .execute(&mut *conn)
        .await
        .map_err(store_error)?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), StateStoreError> {
        let mut conn = self.conn.lock().await;
        sqlx::query("DELETE FROM session_state WHERE id = ?")
            .bind(id)
            .execute(&mut *conn)
            .await
            .map_err(store_error)?;
        Ok(())
    }
}
