use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{env, fs, path::Path, path::PathBuf, time::Duration};
use tracing::debug;

use crate::db::DatabaseConfig;
use crate::source::ResolverOptions;

/// Node configuration, read from `registry.json`.
///
/// Every section and field is optional. String values may reference
/// environment variables as `${NAME}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub admin: AdminConfig,
    #[serde(default)]
    pub resolver: ResolverConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Key of the persisted administration record this node owns.
    pub instance_key: String,
    pub notification_timeout_ms: u64,
    pub command_buffer: usize,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            instance_key: "cluster".to_string(),
            notification_timeout_ms: 2_000,
            command_buffer: 64,
        }
    }
}

impl AdminConfig {
    pub fn notification_timeout(&self) -> Duration {
        Duration::from_millis(self.notification_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Per-source call budget for bulk lookups. Unset waits indefinitely.
    pub source_timeout_ms: Option<u64>,
    /// How often cached definitions are reconciled with the store. Zero
    /// disables the background refresh.
    pub refresh_interval_secs: u64,
    /// JSON file of definitions served from memory ahead of the store.
    pub bootstrap_path: Option<PathBuf>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            source_timeout_ms: Some(5_000),
            refresh_interval_secs: 30,
            bootstrap_path: None,
        }
    }
}

impl ResolverConfig {
    pub fn options(&self) -> ResolverOptions {
        ResolverOptions {
            source_timeout: self.source_timeout_ms.map(Duration::from_millis),
        }
    }

    pub fn refresh_interval(&self) -> Option<Duration> {
        (self.refresh_interval_secs > 0).then(|| Duration::from_secs(self.refresh_interval_secs))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub bind: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
        }
    }
}

impl NodeConfig {
    /// Load from `explicit` if given, otherwise from the first standard
    /// location that exists. Falls back to defaults when there is no file.
    pub fn load(explicit: Option<&Path>) -> anyhow::Result<Self> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }

        match resolve_config_path() {
            Some(path) => Self::from_file(&path),
            None => {
                debug!("No registry.json found, using defaults");
                Ok(Self::default())
            }
        }
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_json_str(&raw).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn from_json_str(raw: &str) -> anyhow::Result<Self> {
        let mut value: Value = serde_json::from_str(raw)?;
        expand_value(&mut value, &|name: &str| env::var(name).ok());
        Ok(serde_json::from_value(value)?)
    }
}

/// `$REGISTRY_CONFIG`, then `$XDG_CONFIG_HOME/unicity/registry.json`, then
/// `./registry.json`.
pub fn resolve_config_path() -> Option<PathBuf> {
    if let Ok(p) = env::var("REGISTRY_CONFIG") {
        return Some(PathBuf::from(p));
    }

    if let Ok(xdg) = env::var("XDG_CONFIG_HOME") {
        let candidate = PathBuf::from(xdg).join("unicity").join("registry.json");
        if candidate.exists() {
            return Some(candidate);
        }
    }

    let candidate = PathBuf::from("registry.json");
    candidate.exists().then_some(candidate)
}

fn expand_value(value: &mut Value, lookup: &dyn Fn(&str) -> Option<String>) {
    match value {
        Value::String(s) => *s = expand_env_vars(s, lookup),
        Value::Array(items) => {
            for item in items {
                expand_value(item, lookup);
            }
        }
        Value::Object(map) => {
            for item in map.values_mut() {
                expand_value(item, lookup);
            }
        }
        _ => {}
    }
}

/// Replace `${NAME}` with the looked-up value. Unknown names are left as
/// written.
fn expand_env_vars(input: &str, lookup: &dyn Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next(); // consume '{'
            let mut name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                name.push(c);
            }
            match lookup(&name) {
                Some(val) => out.push_str(&val),
                None => {
                    out.push_str("${");
                    out.push_str(&name);
                    out.push('}');
                }
            }
        } else {
            out.push(ch);
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn lookup(name: &str) -> Option<String> {
        match name {
            "DB_HOST" => Some("db.internal".to_string()),
            _ => None,
        }
    }

    #[test]
    fn test_expand_env_vars() {
        assert_eq!(expand_env_vars("ws://${DB_HOST}:8000", &lookup), "ws://db.internal:8000");
        assert_eq!(expand_env_vars("${MISSING}/x", &lookup), "${MISSING}/x");
        assert_eq!(expand_env_vars("$plain", &lookup), "$plain");
    }

    #[test]
    fn test_expand_nested_values() {
        let mut value = serde_json::json!({
            "database": {"url": "ws://${DB_HOST}"},
            "list": ["${DB_HOST}", 3]
        });
        expand_value(&mut value, &lookup);

        assert_eq!(value["database"]["url"], "ws://db.internal");
        assert_eq!(value["list"][0], "db.internal");
        assert_eq!(value["list"][1], 3);
    }

    #[test]
    fn test_defaults_fill_missing_sections() {
        let config = NodeConfig::from_json_str(r#"{"admin": {"instance_key": "eu"}}"#).unwrap();

        assert_eq!(config.admin.instance_key, "eu");
        assert_eq!(config.admin.notification_timeout(), Duration::from_secs(2));
        assert_eq!(config.admin.command_buffer, 64);
        assert_eq!(config.api.bind, "127.0.0.1:8080");
        assert_eq!(config.resolver.refresh_interval(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "database": {{"url": "memory", "namespace": "test"}},
                "resolver": {{"source_timeout_ms": null, "refresh_interval_secs": 0}},
                "api": {{"bind": "0.0.0.0:9000"}}
            }}"#
        )
        .unwrap();

        let config = NodeConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.database.url, "memory");
        assert_eq!(config.database.namespace, "test");
        assert_eq!(config.api.bind, "0.0.0.0:9000");
        assert!(config.resolver.options().source_timeout.is_none());
        assert!(config.resolver.refresh_interval().is_none());
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(NodeConfig::load(Some(&dir.path().join("absent.json"))).is_err());
    }
}
