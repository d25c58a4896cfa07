pub mod client;
pub mod config;
pub mod error;
pub mod hooks;
pub mod http_server;
mod logging_sqlite;
pub mod proxy;
pub mod server_session;
pub mod session;
pub mod session_store;
mod state_sqlite;
pub mod stdio_server;
pub mod wire;

pub mod logging {
    pub use crate::logging_sqlite::{EventRow, LoggerCfg, SqlitePublisher, query_events, redact_json};
    pub use nanobot_mcp_core::logging::{Event, NoopPublisher, RpcEventPublisher, TracingPublisher};
}

pub use client::{CallOptions, Client, ClientOptions};
pub use error::{Error, Result};
pub use http_server::{HttpServer, HttpServerOptions, start_http_server};
pub use nanobot_mcp_core::logging::RpcEventPublisher;
pub use nanobot_mcp_core::state::MemoryStateStore;
pub use nanobot_mcp_core::{Direction, HookDefinition, Message, RequestId, RpcError, SessionState, StateStore};
pub use proxy::{Proxy, ProxyHandler};
pub use server_session::ServerSession;
pub use session::{ExchangeOptions, MessageHandler, Session, SessionOptions, handler_fn};
pub use session_store::{InMemorySessionStore, PersistentSessionStore, RequestContext, SessionStore};
pub use state_sqlite::SqliteStateStore;
pub use stdio_server::StdioServer;
pub use wire::Wire;
