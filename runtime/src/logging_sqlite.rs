use std::path::{Path, PathBuf};
use std::sync::Arc;

use nanobot_mcp_core::logging::{Event, RpcEventPublisher};
use serde_json::Value as JsonValue;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteSynchronous};
use sqlx::{ConnectOptions, Connection, Row, SqliteConnection};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Duration, Instant, timeout};

const FLUSH_BATCH_SIZE: usize = 256;
const FLUSH_INTERVAL: Duration = Duration::from_millis(250);
const CHECKPOINT_INTERVAL: Duration = Duration::from_secs(1);
const QUEUE_DEPTH: usize = 8_192;

const MIGRATION_SQL: &str = include_str!("sql/migrations/0001_rpc_events.sql");

#[derive(Clone)]
pub struct LoggerCfg {
    pub db_path: PathBuf,
    pub redact_keys: Vec<String>, // lowercased
}

impl LoggerCfg {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            redact_keys: default_redact_list(),
        }
    }
}

enum Msg {
    Event(Box<Event>),
    Flush(oneshot::Sender<()>),
}

/// Persists session events to SQLite from a background writer task.
///
/// `log` never blocks: events are redacted, queued and written in batches. When the queue
/// is full events are dropped.
#[derive(Clone)]
pub struct SqlitePublisher {
    tx: mpsc::Sender<Msg>,
    cfg: Arc<LoggerCfg>,
}

impl SqlitePublisher {
    /// Spawns the writer task; must be called inside a tokio runtime.
    pub fn start(cfg: LoggerCfg) -> Self {
        let (tx, rx) = mpsc::channel::<Msg>(QUEUE_DEPTH);
        let cfg = Arc::new(cfg);
        let task_cfg = cfg.clone();
        tokio::spawn(async move {
            writer_task(task_cfg, rx).await;
        });
        Self { tx, cfg }
    }

    pub fn db_path(&self) -> &Path {
        &self.cfg.db_path
    }

    /// Writes everything queued so far and checkpoints the WAL.
    pub async fn flush(&self) {
        let (tx_done, rx_done) = oneshot::channel();
        if self.tx.send(Msg::Flush(tx_done)).await.is_ok() {
            let _ = timeout(Duration::from_secs(2), rx_done).await;
        }
    }
}

impl RpcEventPublisher for SqlitePublisher {
    fn log(&self, mut event: Event) {
        event.payload_json = event
            .payload_json
            .map(|v| redact_json(v, &self.cfg.redact_keys));
        if self.tx.try_send(Msg::Event(Box::new(event))).is_err() {
            tracing::debug!(target = "logging", "event_dropped");
        }
    }
}

async fn writer_task(cfg: Arc<LoggerCfg>, mut rx: mpsc::Receiver<Msg>) {
    if let Some(parent) = cfg.db_path.parent()
        && let Err(e) = std::fs::create_dir_all(parent)
    {
        tracing::error!(
            target = "logging",
            path = %cfg.db_path.display(),
            error = %e,
            "create_dir_failed"
        );
        return;
    }

    let mut conn = match open_connection(&cfg.db_path).await {
        Ok(conn) => conn,
        Err(e) => {
            tracing::error!(target = "logging", path=%cfg.db_path.display(), error=%e, "open_failed");
            return;
        }
    };

    if let Err(e) = ensure_schema(&mut conn, MIGRATION_SQL).await {
        tracing::error!(target = "logging", path=%cfg.db_path.display(), error=%e, "schema_failed");
        return;
    }

    let mut buf: Vec<Event> = Vec::with_capacity(FLUSH_BATCH_SIZE);
    let mut last_flush = Instant::now();
    let mut last_checkpoint = Instant::now();

    loop {
        match timeout(FLUSH_INTERVAL, rx.recv()).await {
            Ok(Some(Msg::Event(evt))) => {
                buf.push(*evt);
                if buf.len() >= FLUSH_BATCH_SIZE || last_flush.elapsed() >= FLUSH_INTERVAL {
                    drain(&mut conn, &mut buf).await;
                    last_flush = Instant::now();
                    if last_checkpoint.elapsed() >= CHECKPOINT_INTERVAL {
                        if let Err(e) = checkpoint(&mut conn).await {
                            tracing::debug!(target = "logging", error=%e, "checkpoint_failed");
                        }
                        last_checkpoint = Instant::now();
                    }
                }
            }
            Ok(Some(Msg::Flush(done))) => {
                drain(&mut conn, &mut buf).await;
                if let Err(e) = checkpoint(&mut conn).await {
                    tracing::debug!(target = "logging", error=%e, "checkpoint_failed");
                }
                let _ = done.send(());
                last_flush = Instant::now();
                last_checkpoint = Instant::now();
            }
            Ok(None) => {
                drain(&mut conn, &mut buf).await;
                let _ = checkpoint(&mut conn).await;
                break;
            }
            Err(_) => {
                drain(&mut conn, &mut buf).await;
                last_flush = Instant::now();
                if last_checkpoint.elapsed() >= CHECKPOINT_INTERVAL {
                    if let Err(e) = checkpoint(&mut conn).await {
                        tracing::debug!(target = "logging", error=%e, "checkpoint_failed");
                    }
                    last_checkpoint = Instant::now();
                }
            }
        }
    }
}

async fn drain(conn: &mut SqliteConnection, buf: &mut Vec<Event>) {
    if buf.is_empty() {
        return;
    }
    if let Err(e) = flush_events(conn, buf).await {
        tracing::warn!(target = "logging", count=buf.len(), error=%e, "flush_failed");
    }
    buf.clear();
}

pub(crate) async fn open_connection(path: &Path) -> Result<SqliteConnection, sqlx::Error> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_secs(1));
    options.connect().await
}

pub(crate) async fn ensure_schema(conn: &mut SqliteConnection, sql: &'static str) -> Result<(), sqlx::Error> {
    for stmt in sql.split(';').map(str::trim).filter(|s| !s.is_empty()) {
        sqlx::query(stmt).execute(&mut *conn).await?;
    }
    Ok(())
}

async fn flush_events(conn: &mut SqliteConnection, events: &[Event]) -> Result<(), sqlx::Error> {
    let mut tx = conn.begin().await?;
    for event in events {
        let payload_json = event
            .payload_json
            .as_ref()
            .and_then(|v| serde_json::to_string(v).ok());
        sqlx::query(
            "INSERT INTO rpc_events (id, ts_ms, session_id, server_name, direction, method, request_id, ok, error, payload_json)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(event.id.to_string())
        .bind(event.ts_ms)
        .bind(&event.session_id)
        .bind(event.server_name.as_deref())
        .bind(event.direction.as_str())
        .bind(&event.method)
        .bind(event.request_id.as_deref())
        .bind(event.ok)
        .bind(event.error.as_deref())
        .bind(payload_json.as_deref())
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await
}

async fn checkpoint(conn: &mut SqliteConnection) -> Result<(), sqlx::Error> {
    sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
        .execute(&mut *conn)
        .await?;
    Ok(())
}

fn default_redact_list() -> Vec<String> {
    vec![
        "authorization".into(),
        "token".into(),
        "password".into(),
        "secret".into(),
        "api_key".into(),
        "access_token".into(),
    ]
}

pub fn redact_json(mut v: JsonValue, keys_lc: &[String]) -> JsonValue {
    fn rec(v: &mut JsonValue, keys_lc: &[String]) {
        match v {
            JsonValue::Object(map) => {
                for (k, val) in map.iter_mut() {
                    if keys_lc.iter().any(|x| x == &k.to_lowercase()) {
                        *val = JsonValue::String("***".to_string());
                    } else {
                        rec(val, keys_lc);
                    }
                }
            }
            JsonValue::Array(arr) => {
                for item in arr.iter_mut() {
                    rec(item, keys_lc);
                }
            }
            _ => {}
        }
    }
    rec(&mut v, keys_lc);
    v
}

/// A stored event as read back for diagnostics.
#[derive(Debug, Clone, serde::Serialize)]
pub struct EventRow {
    pub id: String,
    pub ts_ms: i64,
    pub session_id: String,
    pub server_name: Option<String>,
    pub direction: String,
    pub method: String,
    pub request_id: Option<String>,
    pub ok: bool,
    pub error: Option<String>,
    pub payload_json: Option<JsonValue>,
}

/// Most recent events first, optionally for one session.
pub async fn query_events(
    path: &Path,
    session_id: Option<&str>,
    limit: usize,
) -> Result<Vec<EventRow>, sqlx::Error> {
    let mut conn = open_connection(path).await?;
    let mut builder = sqlx::QueryBuilder::<sqlx::Sqlite>::new(
        "SELECT id, ts_ms, session_id, server_name, direction, method, request_id, ok, error, payload_json FROM rpc_events",
    );
    if let Some(session_id) = session_id {
        builder.push(" WHERE session_id = ");
        builder.push_bind(session_id.to_string());
    }
    builder.push(" ORDER BY ts_ms DESC, id DESC LIMIT ");
    let limit = if limit == 0 { 50 } else { limit.min(1_000) };
    builder.push_bind(limit as i64);
    let rows = builder.build().fetch_all(&mut conn).await?;
    rows.into_iter().map(map_event_row).collect()
}

fn map_event_row(row: sqlx::sqlite::SqliteRow) -> Result<EventRow, sqlx::Error> {
    let payload: Option<String> = row.try_get("payload_json")?;
    Ok(EventRow {
        id: row.try_get("id")?,
        ts_ms: row.try_get("ts_ms")?,
        session_id: row.try_get("session_id")?,
        server_name: row.try_get("server_name")?,
        direction: row.try_get("direction")?,
        method: row.try_get("method")?,
        request_id: row.try_get("request_id")?,
        ok: row.try_get("ok")?,
        error: row.try_get("error")?,
        payload_json: payload.and_then(|s| serde_json::from_str(&s).ok()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use nanobot_mcp_core::{Direction, Message};
    use serde_json::json;

    #[test]
    fn redact_masks_keys_recursively() {
        let v = json!({
            "Authorization": "Bearer x",
            "nested": { "password": "p", "keep": 1 },
            "arr": [ {"token": "a"}, {"ok": true} ]
        });
        let out = redact_json(v, &default_redact_list());
        let s = out.to_string();
        assert!(s.contains("***"));
        assert!(!s.contains("Bearer x"));
        assert!(!s.contains("\"p\""));
        assert!(!s.contains("\"a\""));
        assert!(s.contains("\"keep\":1"));
    }

    #[tokio::test]
    async fn flush_persists_redacted_events() {
        let path = std::env::temp_dir()
            .join(format!("nanobot-logs-{}", uuid::Uuid::new_v4()))
            .join("logs.sqlite");
        let publisher = SqlitePublisher::start(LoggerCfg::new(&path));
        let msg = Message::request(
            1,
            "tools/call",
            Some(json!({"name": "login", "arguments": {"password": "hunter2"}})),
        );
        publisher.log(Event::from_message(Direction::Out, "s1", &msg).with_server_name("auth"));
        publisher.flush().await;

        let rows = query_events(&path, Some("s1"), 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].method, "tools/call");
        assert_eq!(rows[0].direction, "out");
        assert_eq!(rows[0].server_name.as_deref(), Some("auth"));
        let payload = rows[0].payload_json.as_ref().unwrap();
        assert_eq!(payload["params"]["arguments"]["password"], json!("***"));
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }
}
