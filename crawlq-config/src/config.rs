use std::{
    fs,
    io::{self, BufRead},
    path,
};

use serde_yaml::{Mapping, Value};

use crate::settings::Settings;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parsing error: {0}")]
    YamlParse(#[from] serde_yaml::Error),
    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("JSON parsing error: {0}")]
    JsonParse(#[from] serde_json::Error),
    #[error("Line parsing error: {0}")]
    LineParse(String),
    #[error("Unsupported config file format: {0}")]
    UnsupportedFormat(String),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Environment variables that override values from the configuration file.
pub const ENV_OVERRIDES: &[(&str, &str)] = &[
    ("CRAWLQ_REDIS_URI", "redis.uri"),
    ("CRAWLQ_LOG_LEVEL", "logging.level"),
    ("CRAWLQ_LOG_FORMAT", "logging.format"),
    ("CRAWLQ_PROXY_STRATEGY", "proxy.rotation_strategy"),
    ("CRAWLQ_PROXY_FILE", "proxy.endpoints_file"),
    ("CRAWLQ_MAX_RETRIES", "queue.max_retries"),
    ("CRAWLQ_CONCURRENCY", "worker.concurrency"),
    ("CRAWLQ_USER_AGENT", "http.user_agent"),
];

pub trait Configurable {
    fn config(&self) -> &Value;

    /// Extract Value from config using dot notation i.e. "queue.max_retries"
    fn get_config_value(&self, key: &str) -> Option<&Value> {
        let keys: Vec<&str> = key.split('.').collect();
        get_value_recursive(self.config(), &keys)
    }
}

/// Read a configuration file into a YAML value tree. TOML and JSON files are
/// converted so callers only deal with one representation.
pub fn load_config(
    config_file_path: impl AsRef<path::Path>,
) -> Result<Value, ConfigError> {
    let path = config_file_path.as_ref();
    let content: String = fs::read_to_string(path)?;
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "yaml" | "yml" => Ok(serde_yaml::from_str(&content)?),
        "toml" => {
            let parsed: toml::Value = toml::from_str(&content)?;
            Ok(serde_yaml::to_value(parsed)?)
        }
        "json" => {
            let parsed: serde_json::Value = serde_json::from_str(&content)?;
            Ok(serde_yaml::to_value(parsed)?)
        }
        other => Err(ConfigError::UnsupportedFormat(other.to_string())),
    }
}

/// Load Vec<String> from file with path `file path`, skipping blank lines
/// and `#` comments.
pub fn load_text_file_lines(
    file_path: impl AsRef<path::Path>,
) -> Result<Vec<String>, ConfigError> {
    let file = fs::File::open(file_path)?;
    let lines = io::BufReader::new(file)
        .lines()
        .map(|l| l.map_err(|e| ConfigError::LineParse(e.to_string())))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(lines
        .into_iter()
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .collect())
}

fn get_value_recursive<'a>(config: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    if keys.is_empty() {
        return None;
    };

    match config {
        Value::Mapping(map) => {
            let key = keys[0];
            let remaining_keys = &keys[1..];

            if let Some(value) = map.get(Value::String(key.to_string())) {
                if remaining_keys.is_empty() {
                    Some(value)
                } else {
                    get_value_recursive(value, remaining_keys)
                }
            } else {
                None
            }
        }
        _ => None,
    }
}

/// Set a dotted key, creating intermediate mappings on the way.
pub fn set_config_value(config: &mut Value, key: &str, value: Value) {
    let mut current = config;
    let mut parts = key.split('.').peekable();

    while let Some(part) = parts.next() {
        if !current.is_mapping() {
            *current = Value::Mapping(Mapping::new());
        }
        let Value::Mapping(map) = current else {
            return;
        };
        let map_key = Value::String(part.to_string());

        if parts.peek().is_none() {
            map.insert(map_key, value);
            return;
        }
        current = map
            .entry(map_key)
            .or_insert_with(|| Value::Mapping(Mapping::new()));
    }
}

/// Apply [`ENV_OVERRIDES`] using `lookup` to resolve variables. Values are
/// read as YAML scalars so "5" becomes a number and "true" a bool.
pub fn apply_env_overrides<F>(config: &mut Value, lookup: F) -> usize
where
    F: Fn(&str) -> Option<String>,
{
    let mut applied = 0;
    for (var, key) in ENV_OVERRIDES {
        if let Some(raw) = lookup(var) {
            let value = match serde_yaml::from_str::<Value>(&raw) {
                Ok(v @ (Value::Bool(_) | Value::Number(_) | Value::String(_))) => v,
                _ => Value::String(raw.clone()),
            };
            tracing::debug!("config override {} from {}", key, var);
            set_config_value(config, key, value);
            applied += 1;
        }
    }
    applied
}

/// Raw configuration tree together with the typed settings parsed from it.
/// The raw tree stays reachable so collaborators can read their own keys.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    raw: Value,
    pub settings: Settings,
}

impl LoadedConfig {
    /// Load a config file. A relative `proxy.endpoints_file` resolves against
    /// the directory holding the config file.
    pub fn from_file(path: impl AsRef<path::Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = load_config(path)?;
        Self::build(raw, |var| std::env::var(var).ok(), path.parent())
    }

    /// Build from an in-memory tree without consulting the environment.
    pub fn from_value(raw: Value) -> Result<Self, ConfigError> {
        Self::from_value_with_env(raw, |_| None)
    }

    pub fn from_value_with_env<F>(raw: Value, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        Self::build(raw, lookup, None)
    }

    fn build<F>(
        mut raw: Value,
        lookup: F,
        base_dir: Option<&path::Path>,
    ) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if raw.is_null() {
            raw = Value::Mapping(Mapping::new());
        }
        apply_env_overrides(&mut raw, lookup);
        let mut settings: Settings = serde_yaml::from_value(raw.clone())?;
        settings.proxy.load_endpoints_file(base_dir)?;
        settings.validate()?;
        Ok(Self { raw, settings })
    }
}

impl LoadedConfig {
    /// Wrap already typed settings. The raw tree mirrors them.
    pub fn from_settings(settings: Settings) -> Self {
        let raw = serde_yaml::to_value(&settings)
            .unwrap_or_else(|_| Value::Mapping(Mapping::new()));
        Self { raw, settings }
    }
}

impl Default for LoadedConfig {
    fn default() -> Self {
        Self {
            raw: Value::Mapping(Mapping::new()),
            settings: Settings::default(),
        }
    }
}

impl Configurable for LoadedConfig {
    fn config(&self) -> &Value {
        &self.raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::RotationStrategy;
    use std::fs::File;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn test_load_config_valid_yaml() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("config.yml");
        let mut file = File::create(&config_path).unwrap();
        writeln!(file, "key: value\napp:\n  setting: 42").unwrap();

        let config = load_config(&config_path).unwrap();
        assert_eq!(config["key"].as_str(), Some("value"));
        assert_eq!(config["app"]["setting"].as_i64(), Some(42));
    }

    #[test]
    fn test_load_config_invalid_yaml() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("config.yml");
        let mut file = File::create(&config_path).unwrap();
        writeln!(file, "invalid: : yaml: content").unwrap();

        let config = load_config(&config_path);
        assert!(matches!(config, Err(ConfigError::YamlParse(_))));
    }

    #[test]
    fn test_load_config_toml_and_json() {
        let dir = tempdir().unwrap();
        let toml_path = dir.path().join("config.toml");
        std::fs::write(&toml_path, "[queue]\nmax_retries = 7\n").unwrap();
        let json_path = dir.path().join("config.json");
        std::fs::write(&json_path, r#"{"queue": {"max_retries": 9}}"#).unwrap();

        let from_toml = load_config(&toml_path).unwrap();
        let from_json = load_config(&json_path).unwrap();
        assert_eq!(from_toml["queue"]["max_retries"].as_u64(), Some(7));
        assert_eq!(from_json["queue"]["max_retries"].as_u64(), Some(9));
    }

    #[test]
    fn test_unsupported_extension() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.ini");
        std::fs::write(&path, "a=b").unwrap();
        assert!(matches!(
            load_config(&path),
            Err(ConfigError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_load_text_file_lines() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("proxies.txt");
        let mut file = File::create(&file_path).unwrap();
        writeln!(file, "line1\n\n# comment\nline2\n  line3  ").unwrap();

        let lines = load_text_file_lines(&file_path).unwrap();
        assert_eq!(lines, vec!["line1", "line2", "line3"]);
    }

    #[test]
    fn test_get_config_value() {
        let yaml = r#"
        app:
          nested:
            value: 42
        "#;
        let raw: Value = serde_yaml::from_str(yaml).unwrap();
        let loaded = LoadedConfig::from_value(raw).unwrap();

        assert_eq!(
            loaded
                .get_config_value("app.nested.value")
                .and_then(|v| v.as_i64()),
            Some(42)
        );
        assert_eq!(loaded.get_config_value("app.missing.value"), None);
        assert_eq!(loaded.get_config_value(""), None);
    }

    #[test]
    fn test_set_config_value_creates_path() {
        let mut raw = Value::Null;
        set_config_value(&mut raw, "a.b.c", Value::from(3));
        assert_eq!(raw["a"]["b"]["c"].as_i64(), Some(3));
    }

    #[test]
    fn test_env_overrides_win_over_file() {
        let raw: Value = serde_yaml::from_str(
            "queue:\n  max_retries: 1\nproxy:\n  rotation_strategy: random\n",
        )
        .unwrap();
        let loaded = LoadedConfig::from_value_with_env(raw, |var| match var {
            "CRAWLQ_MAX_RETRIES" => Some("6".to_string()),
            "CRAWLQ_PROXY_STRATEGY" => Some("least_used".to_string()),
            "CRAWLQ_REDIS_URI" => Some("redis://localhost:6379/2".to_string()),
            _ => None,
        })
        .unwrap();

        assert_eq!(loaded.settings.queue.max_retries, 6);
        assert_eq!(
            loaded.settings.proxy.rotation_strategy,
            RotationStrategy::LeastUsed
        );
        assert_eq!(
            loaded.settings.redis.uri.as_deref(),
            Some("redis://localhost:6379/2")
        );
    }

    #[test]
    fn test_proxy_list_file_next_to_config() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("proxies.txt"),
            "http://a.example.com:8080\nhttp://b.example.com:8080\n",
        )
        .unwrap();
        let config_path = dir.path().join("crawlq.yaml");
        std::fs::write(
            &config_path,
            "proxy:\n  enabled: true\n  endpoints_file: proxies.txt\n",
        )
        .unwrap();

        let loaded = LoadedConfig::from_file(&config_path).unwrap();
        let endpoints = loaded.settings.proxy.expanded_endpoints();
        assert_eq!(endpoints.len(), 2);
        assert_eq!(endpoints[1].url, "http://b.example.com:8080");
    }

    #[test]
    fn test_missing_proxy_list_file_fails_load() {
        let raw: Value = serde_yaml::from_str(
            "proxy:\n  enabled: true\n  endpoints_file: /nonexistent/proxies.txt\n",
        )
        .unwrap();
        assert!(matches!(LoadedConfig::from_value(raw), Err(ConfigError::Io(_))));
    }

    #[test]
    fn test_unknown_strategy_rejected_at_load() {
        let raw: Value =
            serde_yaml::from_str("proxy:\n  rotation_strategy: fastest\n").unwrap();
        assert!(matches!(
            LoadedConfig::from_value(raw),
            Err(ConfigError::YamlParse(_))
        ));
    }
}
