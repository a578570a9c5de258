use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
    sync::LazyLock,
    time::Duration,
};

use crate::config::{load_text_file_lines, ConfigError};

static PORT_RANGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{(\d+)-(\d+)\}").expect("Failed to compile port range regex")
});

/// How the pool picks the next endpoint among the active ones.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationStrategy {
    #[default]
    RoundRobin,
    Random,
    #[serde(alias = "health_based")]
    HealthWeighted,
    LeastUsed,
}

impl RotationStrategy {
    pub const ALL: [RotationStrategy; 4] = [
        RotationStrategy::RoundRobin,
        RotationStrategy::Random,
        RotationStrategy::HealthWeighted,
        RotationStrategy::LeastUsed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoundRobin => "round_robin",
            Self::Random => "random",
            Self::HealthWeighted => "health_weighted",
            Self::LeastUsed => "least_used",
        }
    }
}

impl fmt::Display for RotationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown rotation strategy: {0}")]
pub struct UnknownStrategy(pub String);

impl FromStr for RotationStrategy {
    type Err = UnknownStrategy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "round_robin" => Ok(Self::RoundRobin),
            "random" => Ok(Self::Random),
            "health_weighted" | "health_based" => Ok(Self::HealthWeighted),
            "least_used" => Ok(Self::LeastUsed),
            other => Err(UnknownStrategy(other.to_string())),
        }
    }
}

/// One configured egress endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
}

impl EndpointConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }
}

/// Endpoint entries may be plain uris or maps with credentials and tags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EndpointSpec {
    Uri(String),
    Detailed(EndpointConfig),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxySettings {
    pub enabled: bool,
    pub rotation_strategy: RotationStrategy,
    pub max_failures: u32,
    pub min_success_rate: f64,
    pub health_check_interval_s: u64,
    pub health_check_timeout_s: u64,
    pub probe_url: String,
    pub endpoints: Vec<EndpointSpec>,
    /// Text file with one endpoint uri per line, appended to `endpoints`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoints_file: Option<PathBuf>,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            rotation_strategy: RotationStrategy::default(),
            max_failures: 5,
            min_success_rate: 0.5,
            health_check_interval_s: 300,
            health_check_timeout_s: 10,
            probe_url: "http://httpbin.org/ip".to_string(),
            endpoints: Vec::new(),
            endpoints_file: None,
        }
    }
}

impl ProxySettings {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_s)
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_secs(self.health_check_timeout_s)
    }

    /// Append the uris listed in `endpoints_file`. A relative path resolves
    /// against `base_dir` when given. Nothing is read while proxies are
    /// disabled.
    pub fn load_endpoints_file(&mut self, base_dir: Option<&Path>) -> Result<usize, ConfigError> {
        let Some(file) = self.endpoints_file.as_ref().filter(|_| self.enabled) else {
            return Ok(0);
        };
        let path = match base_dir {
            Some(base) if file.is_relative() => base.join(file),
            _ => file.clone(),
        };
        let uris = load_text_file_lines(&path)?;
        tracing::debug!(path = %path.display(), count = uris.len(), "Loaded proxy list");
        let count = uris.len();
        self.endpoints.extend(uris.into_iter().map(EndpointSpec::Uri));
        Ok(count)
    }

    /// Flatten configured entries into endpoints, expanding `{start-end}`
    /// port ranges. Returns nothing when proxies are disabled.
    pub fn expanded_endpoints(&self) -> Vec<EndpointConfig> {
        if !self.enabled {
            return Vec::new();
        }
        self.endpoints
            .iter()
            .flat_map(|spec| match spec {
                EndpointSpec::Uri(uri) => expand_uri(uri)
                    .into_iter()
                    .map(EndpointConfig::new)
                    .collect::<Vec<_>>(),
                EndpointSpec::Detailed(cfg) => expand_uri(&cfg.url)
                    .into_iter()
                    .map(|url| EndpointConfig {
                        url,
                        ..cfg.clone()
                    })
                    .collect(),
            })
            .collect()
    }
}

/// `http://host:{8080-8082}` expands to three uris. Invalid ranges are kept
/// as literal strings.
pub fn expand_uri(uri: &str) -> Vec<String> {
    if let Some(captures) = PORT_RANGE_RE.captures(uri) {
        if let (Some(start), Some(end)) = (
            captures.get(1).and_then(|m| m.as_str().parse::<u16>().ok()),
            captures.get(2).and_then(|m| m.as_str().parse::<u16>().ok()),
        ) {
            if start <= end {
                return (start..=end)
                    .map(|port| uri.replace(&captures[0], &port.to_string()))
                    .collect();
            }
        }
    }
    vec![uri.to_string()]
}
