use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::types::{InitializeRequest, InitializeResult};

pub const ENV_ATTRIBUTE: &str = "env";
pub const ACCOUNT_ATTRIBUTE: &str = "accountID";
pub const CONFIG_ATTRIBUTE: &str = "config";

/// Attributes rebuilt from the request context on every load; never persisted.
pub const RUNTIME_ATTRIBUTES: [&str; 3] = [ENV_ATTRIBUTE, ACCOUNT_ATTRIBUTE, CONFIG_ATTRIBUTE];

/// Serializable projection of a session, enough to resume it without a live wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initialize_request: Option<InitializeRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initialize_result: Option<InitializeResult>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub attributes: Map<String, JsonValue>,
}

impl SessionState {
    pub fn without_runtime_attributes(mut self) -> Self {
        for key in RUNTIME_ATTRIBUTES {
            self.attributes.remove(key);
        }
        self
    }
}

#[derive(Debug, thiserror::Error)]
#[error("state store: {0}")]
pub struct StateStoreError(pub String);

/// Pluggable persistence for [`SessionState`].
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<SessionState>, StateStoreError>;
    async fn put(&self, state: &SessionState) -> Result<(), StateStoreError>;
    async fn delete(&self, id: &str) -> Result<(), StateStoreError>;
}

#[derive(Clone, Default)]
pub struct MemoryStateStore {
    states: Arc<Mutex<HashMap<String, SessionState>>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.states.lock().map(|m| m.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, id: &str) -> Result<Option<SessionState>, StateStoreError> {
        let states = self
            .states
            .lock()
            .map_err(|e| StateStoreError(e.to_string()))?;
        Ok(states.get(id).cloned())
    }

    async fn put(&self, state: &SessionState) -> Result<(), StateStoreError> {
        let mut states = self
            .states
            .lock()
            .map_err(|e| StateStoreError(e.to_string()))?;
        states.insert(state.id.clone(), state.clone());
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), StateStoreError> {
        let mut states = self
            .states
            .lock()
            .map_err(|e| StateStoreError(e.to_string()))?;
        states.remove(id);
        Ok(())
    }
}
