use std::sync::atomic::{AtomicI64, Ordering};

use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::hooks::Direction;
use crate::message::Message;

/// One message observed on a session, in either direction.
#[derive(Debug, Clone)]
pub struct Event {
    pub id: Uuid,
    pub ts_ms: i64,
    pub session_id: String,
    pub server_name: Option<String>,
    pub direction: Direction,
    pub method: String,
    pub request_id: Option<String>,
    pub ok: bool,
    pub error: Option<String>,
    pub payload_json: Option<JsonValue>,
}

impl Event {
    pub fn new(direction: Direction, method: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            ts_ms: now_millis(),
            session_id: session_id.into(),
            server_name: None,
            direction,
            method: method.into(),
            request_id: None,
            ok: true,
            error: None,
            payload_json: None,
        }
    }

    pub fn from_message(direction: Direction, session_id: &str, msg: &Message) -> Self {
        let mut evt = Event::new(direction, msg.method.clone(), session_id);
        evt.request_id = msg.id.as_ref().map(|id| id.to_string());
        if let Some(err) = &msg.error {
            evt.ok = false;
            evt.error = Some(err.message.clone());
        }
        evt.payload_json = serde_json::to_value(msg).ok();
        evt
    }

    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        if !name.is_empty() {
            self.server_name = Some(name);
        }
        self
    }
}

// Monotonic-ish millisecond clock to ensure strictly increasing timestamps per-process
static LAST_MS: AtomicI64 = AtomicI64::new(0);
fn now_millis() -> i64 {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64;
    loop {
        let prev = LAST_MS.load(Ordering::Relaxed);
        let next = if now > prev { now } else { prev + 1 };
        if LAST_MS
            .compare_exchange(prev, next, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            return next;
        }
    }
}

/// Sink for message events so heavyweight persistence can live outside the session code.
pub trait RpcEventPublisher: Send + Sync + 'static {
    fn log(&self, event: Event);
}

/// Emits each event as a debug-level tracing record.
#[derive(Clone, Default)]
pub struct TracingPublisher;

impl RpcEventPublisher for TracingPublisher {
    fn log(&self, event: Event) {
        tracing::debug!(
            target = "rpc",
            session_id = %event.session_id,
            server = event.server_name.as_deref().unwrap_or(""),
            direction = %event.direction,
            method = %event.method,
            request_id = event.request_id.as_deref().unwrap_or(""),
            ok = event.ok,
            "message"
        );
    }
}

#[derive(Clone, Default)]
pub struct NoopPublisher;

impl RpcEventPublisher for NoopPublisher {
    fn log(&self, _event: Event) {}
}
