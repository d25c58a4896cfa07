//! Hook selectors of the form `message:<method>?name=<name>&direction=<in|out>&onError=<bool>`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub const MESSAGE_HOOK: &str = "message";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::In => "in",
            Direction::Out => "out",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HookParseError {
    #[error("hook selector {0:?} must start with \"message:\"")]
    MissingPrefix(String),
    #[error("hook selector {0:?} contains more than one '?'")]
    MultipleQueries(String),
    #[error("invalid hook direction {0:?}, expected \"in\" or \"out\"")]
    InvalidDirection(String),
}

/// A hook filter, or a fully populated event when describing a message in flight.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HookDefinition {
    pub kind: String,
    pub method: String,
    pub name: String,
    pub direction: Option<Direction>,
    pub call_on_error: bool,
}

impl HookDefinition {
    /// Builds the concrete event for a message travelling in `direction`.
    pub fn event(
        method: impl Into<String>,
        name: impl Into<String>,
        direction: Direction,
        is_error: bool,
    ) -> Self {
        Self {
            kind: MESSAGE_HOOK.to_string(),
            method: method.into(),
            name: name.into(),
            direction: Some(direction),
            call_on_error: is_error,
        }
    }

    pub fn matches(&self, event: &HookDefinition) -> bool {
        if !self.kind.is_empty() && self.kind != event.kind {
            return false;
        }
        if !self.method.is_empty() && self.method != "*" && self.method != event.method {
            return false;
        }
        if !self.name.is_empty() && self.name != event.name {
            return false;
        }
        if self.direction.is_some() && self.direction != event.direction {
            return false;
        }
        !event.call_on_error || self.call_on_error
    }
}

impl FromStr for HookDefinition {
    type Err = HookParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some(rest) = s.strip_prefix("message:") else {
            return Err(HookParseError::MissingPrefix(s.to_string()));
        };
        if rest.matches('?').count() > 1 {
            return Err(HookParseError::MultipleQueries(s.to_string()));
        }

        let (method, query) = rest.split_once('?').unwrap_or((rest, ""));
        let mut def = HookDefinition {
            kind: MESSAGE_HOOK.to_string(),
            method: method.to_string(),
            ..Default::default()
        };

        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            match key {
                "name" => def.name = value.to_string(),
                "direction" => {
                    def.direction = match value {
                        "" => None,
                        "in" => Some(Direction::In),
                        "out" => Some(Direction::Out),
                        other => return Err(HookParseError::InvalidDirection(other.to_string())),
                    }
                }
                "onError" => def.call_on_error = !matches!(value, "false" | "no"),
                _ => {}
            }
        }
        Ok(def)
    }
}

impl fmt::Display for HookDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.kind.is_empty() {
            MESSAGE_HOOK
        } else {
            &self.kind
        };
        write!(f, "{kind}:{}", self.method)?;
        let mut params = Vec::new();
        if !self.name.is_empty() {
            params.push(format!("name={}", self.name));
        }
        if let Some(direction) = self.direction {
            params.push(format!("direction={direction}"));
        }
        if self.call_on_error {
            params.push("onError=true".to_string());
        }
        if !params.is_empty() {
            write!(f, "?{}", params.join("&"))?;
        }
        Ok(())
    }
}

impl Serialize for HookDefinition {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for HookDefinition {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
