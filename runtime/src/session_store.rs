use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::http::HeaderMap;
use nanobot_mcp_core::StateStore;

use crate::error::Result;
use crate::server_session::ServerSession;
use crate::session::{MessageHandler, SessionOptions};
use crate::wire::HEADER_SESSION_ID;

/// What the HTTP layer knows about the caller when it looks a session up.
#[derive(Clone, Debug, Default)]
pub struct RequestContext {
    /// Environment derived from request headers, merged into the session on acquire.
    pub env: HashMap<String, String>,
}

/// Registry of live server sessions keyed by session id.
#[async_trait]
pub trait SessionStore: Send + Sync {
    fn extract_id(&self, headers: &HeaderMap) -> Option<String> {
        headers
            .get(HEADER_SESSION_ID)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    }

    async fn store(&self, session: &ServerSession) -> Result<()>;

    async fn acquire(
        &self,
        ctx: &RequestContext,
        handler: Arc<dyn MessageHandler>,
        id: &str,
    ) -> Result<Option<ServerSession>>;

    /// Called once a request is done with a session obtained from `acquire`.
    async fn release(&self, session: &ServerSession) -> Result<()>;

    async fn load_and_delete(
        &self,
        ctx: &RequestContext,
        handler: Arc<dyn MessageHandler>,
        id: &str,
    ) -> Result<Option<ServerSession>>;
}

#[derive(Clone, Default)]
pub struct InMemorySessionStore {
    sessions: Arc<Mutex<HashMap<String, ServerSession>>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn get(&self, id: &str) -> Option<ServerSession> {
        self.sessions.lock().ok()?.get(id).cloned()
    }

    fn insert(&self, session: &ServerSession) {
        if let Ok(mut sessions) = self.sessions.lock() {
            sessions.insert(session.id(), session.clone());
        }
    }

    /// Inserts `session` unless its id is already live; returns whichever session is live.
    fn insert_if_absent(&self, session: &ServerSession) -> ServerSession {
        match self.sessions.lock() {
            Ok(mut sessions) => sessions
                .entry(session.id())
                .or_insert_with(|| session.clone())
                .clone(),
            Err(_) => session.clone(),
        }
    }

    fn remove(&self, id: &str) -> Option<ServerSession> {
        self.sessions.lock().ok()?.remove(id)
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().map(|s| s.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn store(&self, session: &ServerSession) -> Result<()> {
        self.insert(session);
        Ok(())
    }

    async fn acquire(
        &self,
        ctx: &RequestContext,
        _handler: Arc<dyn MessageHandler>,
        id: &str,
    ) -> Result<Option<ServerSession>> {
        let session = self.get(id);
        if let Some(session) = &session
            && !ctx.env.is_empty()
        {
            session.session().merge_env(ctx.env.clone());
        }
        Ok(session)
    }

    async fn release(&self, _session: &ServerSession) -> Result<()> {
        Ok(())
    }

    async fn load_and_delete(
        &self,
        _ctx: &RequestContext,
        _handler: Arc<dyn MessageHandler>,
        id: &str,
    ) -> Result<Option<ServerSession>> {
        Ok(self.remove(id))
    }
}

/// Live sessions in memory, backed by a [`StateStore`] so they survive a restart.
///
/// Snapshots never carry runtime attributes (`env`, `accountID`, `config`); the env is
/// re-seeded from the request whenever a session is acquired.
pub struct PersistentSessionStore<S> {
    live: InMemorySessionStore,
    states: S,
    opts: SessionOptions,
}

impl<S: StateStore> PersistentSessionStore<S> {
    /// `opts` is the template for sessions rebuilt from stored state.
    pub fn new(states: S, opts: SessionOptions) -> Self {
        Self {
            live: InMemorySessionStore::new(),
            states,
            opts,
        }
    }

    async fn persist(&self, session: &ServerSession) -> Result<()> {
        let state = session.session().state().without_runtime_attributes();
        self.states.put(&state).await?;
        Ok(())
    }

    async fn restore(
        &self,
        handler: Arc<dyn MessageHandler>,
        id: &str,
    ) -> Result<Option<ServerSession>> {
        let Some(state) = self.states.get(id).await? else {
            return Ok(None);
        };
        let session =
            ServerSession::from_state(state.without_runtime_attributes(), handler, self.opts.clone())
                .await?;
        tracing::info!(target = "session_store", session_id = %id, "session_restored");
        Ok(Some(session))
    }
}

#[async_trait]
impl<S: StateStore> SessionStore for PersistentSessionStore<S> {
    async fn store(&self, session: &ServerSession) -> Result<()> {
        self.live.insert(session);
        self.persist(session).await
    }

    async fn acquire(
        &self,
        ctx: &RequestContext,
        handler: Arc<dyn MessageHandler>,
        id: &str,
    ) -> Result<Option<ServerSession>> {
        let session = match self.live.get(id) {
            Some(session) => session,
            None => match self.restore(handler, id).await? {
                Some(restored) => {
                    let live = self.live.insert_if_absent(&restored);
                    // a concurrent acquire restored the same id first
                    if !Arc::ptr_eq(live.session(), restored.session()) {
                        tracing::debug!(target = "session_store", session_id = %id, "duplicate_restore_dropped");
                        restored.close();
                    }
                    live
                }
                None => return Ok(None),
            },
        };
        session.session().merge_env(ctx.env.clone());
        Ok(Some(session))
    }

    async fn release(&self, session: &ServerSession) -> Result<()> {
        self.persist(session).await
    }

    async fn load_and_delete(
        &self,
        ctx: &RequestContext,
        handler: Arc<dyn MessageHandler>,
        id: &str,
    ) -> Result<Option<ServerSession>> {
        let session = match self.live.remove(id) {
            Some(session) => Some(session),
            None => self.restore(handler, id).await?,
        };
        if let Some(session) = &session {
            session.session().merge_env(ctx.env.clone());
        }
        self.states.delete(id).await?;
        Ok(session)
    }
}
