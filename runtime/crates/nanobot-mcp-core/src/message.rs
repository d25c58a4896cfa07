use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::error::RpcError;

pub const JSONRPC_VERSION: &str = "2.0";
pub const NOTIFICATION_PREFIX: &str = "notifications/";

/// JSON-RPC request identifier. Peers may use strings or integers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl RequestId {
    pub fn new_uuid() -> Self {
        RequestId::String(uuid::Uuid::new_v4().to_string())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::String(s) => f.write_str(s),
        }
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        RequestId::String(value.to_string())
    }
}

impl From<String> for RequestId {
    fn from(value: String) -> Self {
        RequestId::String(value)
    }
}

impl From<i64> for RequestId {
    fn from(value: i64) -> Self {
        RequestId::Number(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Request,
    Notification,
    Response,
}

/// A JSON-RPC 2.0 envelope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl Message {
    pub fn request(id: impl Into<RequestId>, method: impl Into<String>, params: Option<JsonValue>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id.into()),
            method: method.into(),
            params,
            ..Default::default()
        }
    }

    pub fn notification(method: impl Into<String>, params: Option<JsonValue>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
            ..Default::default()
        }
    }

    pub fn response(id: Option<RequestId>, result: JsonValue) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            ..Default::default()
        }
    }

    pub fn error_response(id: Option<RequestId>, error: RpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            error: Some(error),
            ..Default::default()
        }
    }

    pub fn kind(&self) -> MessageKind {
        // Transports may stamp a synthetic id on inbound notifications.
        if self.method.starts_with(NOTIFICATION_PREFIX) {
            return MessageKind::Notification;
        }
        match (&self.id, self.method.is_empty()) {
            (_, true) => MessageKind::Response,
            (Some(_), false) => MessageKind::Request,
            (None, false) => MessageKind::Notification,
        }
    }

    pub fn is_request(&self) -> bool {
        self.kind() == MessageKind::Request
    }

    pub fn is_notification(&self) -> bool {
        self.kind() == MessageKind::Notification
    }

    pub fn is_response(&self) -> bool {
        self.kind() == MessageKind::Response
    }

    /// Decodes `params` into `T`, treating missing params as `null`.
    pub fn params_as<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_value(self.params.clone().unwrap_or(JsonValue::Null))
    }

    pub fn progress_token(&self) -> Option<&JsonValue> {
        self.params
            .as_ref()?
            .get("_meta")?
            .get("progressToken")
            .filter(|v| !v.is_null())
    }

    /// Stores `token` under `params._meta.progressToken`, creating objects as needed.
    /// Non-object params are left untouched.
    pub fn set_progress_token(&mut self, token: JsonValue) {
        let params = self
            .params
            .get_or_insert_with(|| JsonValue::Object(Map::new()));
        if params.is_null() {
            *params = JsonValue::Object(Map::new());
        }
        let Some(obj) = params.as_object_mut() else {
            return;
        };
        let meta = obj
            .entry("_meta")
            .or_insert_with(|| JsonValue::Object(Map::new()));
        if let Some(meta) = meta.as_object_mut() {
            meta.insert("progressToken".to_string(), token);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn classifies_envelopes() {
        let req: Message =
            serde_json::from_value(json!({"jsonrpc":"2.0","id":"1","method":"initialize"})).unwrap();
        assert_eq!(req.kind(), MessageKind::Request);
        assert_eq!(req.id, Some(RequestId::from("1")));

        let note: Message =
            serde_json::from_value(json!({"jsonrpc":"2.0","method":"notifications/initialized"}))
                .unwrap();
        assert!(note.is_notification());

        let stamped: Message = serde_json::from_value(
            json!({"jsonrpc":"2.0","id":"synthetic","method":"notifications/progress"}),
        )
        .unwrap();
        assert!(stamped.is_notification());

        let resp: Message =
            serde_json::from_value(json!({"jsonrpc":"2.0","id":7,"result":{}})).unwrap();
        assert!(resp.is_response());
        assert_eq!(resp.id, Some(RequestId::Number(7)));
    }

    #[test]
    fn serializes_without_empty_fields() {
        let msg = Message::notification("ping", None);
        let text = serde_json::to_string(&msg).unwrap();
        assert_eq!(text, r#"{"jsonrpc":"2.0","method":"ping"}"#);
    }

    #[test]
    fn progress_token_lands_in_meta() {
        let mut msg = Message::request("a", "tools/call", Some(json!({"name":"echo"})));
        assert!(msg.progress_token().is_none());
        msg.set_progress_token(json!("tok-1"));
        assert_eq!(msg.progress_token(), Some(&json!("tok-1")));
        assert_eq!(msg.params.as_ref().unwrap()["name"], json!("echo"));

        let mut bare = Message::request(1, "tools/list", None);
        bare.set_progress_token(json!(5));
        assert_eq!(bare.params, Some(json!({"_meta":{"progressToken":5}})));
    }
}
