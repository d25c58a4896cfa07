use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Rename, redescribe or reshape a single upstream tool.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Replaces the upstream schema verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<JsonValue>,
}

/// How to reach one MCP server: a `url` for HTTP, otherwise a `command` to spawn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub command: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    /// When non-empty, tools missing from this map are hidden.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tool_overrides: BTreeMap<String, ToolOverride>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub listen_addr: String,
    #[serde(default = "default_base_path")]
    pub base_path: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// SQLite file for persistent HTTP sessions; in-memory when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_db: Option<PathBuf>,
    #[serde(default)]
    pub mcp_servers: BTreeMap<String, ServerConfig>,
}

fn default_base_path() -> String {
    "/mcp".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8099".to_string(),
            base_path: default_base_path(),
            env: HashMap::new(),
            session_db: None,
            mcp_servers: BTreeMap::new(),
        }
    }
}

// Config paths abstraction to make IO testable
pub trait ConfigProvider: Send + Sync {
    fn base_dir(&self) -> PathBuf;
}

#[derive(Default, Clone)]
pub struct OsConfigProvider;

impl ConfigProvider for OsConfigProvider {
    fn base_dir(&self) -> PathBuf {
        let base = dirs::config_dir().unwrap_or_else(|| dirs::home_dir().unwrap_or_default());
        base.join("nanobot")
    }
}

pub fn settings_path(cp: &dyn ConfigProvider) -> PathBuf {
    cp.base_dir().join("settings.json")
}

/// Missing file means defaults; a file that exists but does not parse is an error.
pub fn load_settings_with(cp: &dyn ConfigProvider) -> anyhow::Result<Settings> {
    let path = settings_path(cp);
    let content = match fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Settings::default()),
        Err(e) => return Err(e).with_context(|| format!("read {}", path.display())),
    };
    serde_json::from_str(&content).with_context(|| format!("parse {}", path.display()))
}

pub fn save_settings_with(cp: &dyn ConfigProvider, settings: &Settings) -> anyhow::Result<()> {
    fs::create_dir_all(cp.base_dir()).context("create config dir")?;
    let path = settings_path(cp);
    let content = serde_json::to_string_pretty(settings).context("to json")?;
    fs::write(&path, content).with_context(|| format!("write {}", path.display()))
}

pub fn load_settings() -> anyhow::Result<Settings> {
    load_settings_with(&OsConfigProvider)
}

/// Replaces `${NAME}` with `env[NAME]`. Unknown names are left as written.
pub fn expand_env(input: &str, env: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                match env.get(name) {
                    Some(value) => out.push_str(value),
                    None => out.push_str(&rest[start..start + 2 + end + 1]),
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

pub fn expand_env_map(
    input: &HashMap<String, String>,
    env: &HashMap<String, String>,
) -> HashMap<String, String> {
    input
        .iter()
        .map(|(k, v)| (k.clone(), expand_env(v, env)))
        .collect()
}
