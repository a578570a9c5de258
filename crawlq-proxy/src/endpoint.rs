use chrono::{DateTime, Utc};
use crawlq_config::EndpointConfig;
use serde::Serialize;
use std::time::Duration;

const SUCCESS_WEIGHT: f64 = 0.7;
const SPEED_WEIGHT: f64 = 0.3;
/// Latency at which the speed component of the health score reaches zero.
const SLOW_LATENCY_SECS: f64 = 10.0;

/// Snapshot of one egress endpoint. The pool owns the live state; callers
/// only ever see clones.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProxyEndpoint {
    pub address: String,
    pub username: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub country: Option<String>,
    pub provider: Option<String>,
    pub success_count: u64,
    pub failure_count: u64,
    pub avg_latency: Option<Duration>,
    pub last_used: Option<DateTime<Utc>>,
    pub last_health_check: Option<DateTime<Utc>>,
    pub active: bool,
}

impl ProxyEndpoint {
    pub fn new(address: impl Into<String>) -> Self {
        Self::from_config(&EndpointConfig::new(address))
    }

    pub fn from_config(config: &EndpointConfig) -> Self {
        Self {
            address: config.url.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
            country: config.country.clone(),
            provider: config.provider.clone(),
            success_count: 0,
            failure_count: 0,
            avg_latency: None,
            last_used: None,
            last_health_check: None,
            active: true,
        }
    }

    /// Share of successful uses, 0 when never used.
    pub fn success_rate(&self) -> f64 {
        let total = self.success_count + self.failure_count;
        if total == 0 {
            0.0
        } else {
            self.success_count as f64 / total as f64
        }
    }

    pub fn health_score(&self) -> f64 {
        if !self.active {
            return 0.0;
        }
        let latency = self.avg_latency.map(|d| d.as_secs_f64()).unwrap_or(0.0);
        let speed = (1.0 - latency / SLOW_LATENCY_SECS).max(0.0);
        SUCCESS_WEIGHT * self.success_rate() + SPEED_WEIGHT * speed
    }

    /// Exponential smoothing with factor 0.5; the first sample seeds it.
    pub(crate) fn record_latency(&mut self, sample: Duration) {
        self.avg_latency = Some(match self.avg_latency {
            Some(old) => (old + sample) / 2,
            None => sample,
        });
    }

    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => Some((user.as_str(), pass.as_str())),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_rate() {
        let mut endpoint = ProxyEndpoint::new("http://p1:8080");
        assert_eq!(endpoint.success_rate(), 0.0);
        endpoint.success_count = 3;
        endpoint.failure_count = 1;
        assert!((endpoint.success_rate() - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_health_score() {
        let mut endpoint = ProxyEndpoint::new("http://p1:8080");
        endpoint.success_count = 1;
        endpoint.avg_latency = Some(Duration::from_secs(5));
        assert!((endpoint.health_score() - (0.7 + 0.15)).abs() < 1e-9);

        endpoint.avg_latency = Some(Duration::from_secs(20));
        assert!((endpoint.health_score() - 0.7).abs() < 1e-9);

        endpoint.active = false;
        assert_eq!(endpoint.health_score(), 0.0);
    }

    #[test]
    fn test_latency_smoothing() {
        let mut endpoint = ProxyEndpoint::new("http://p1:8080");
        endpoint.record_latency(Duration::from_millis(400));
        assert_eq!(endpoint.avg_latency, Some(Duration::from_millis(400)));
        endpoint.record_latency(Duration::from_millis(200));
        assert_eq!(endpoint.avg_latency, Some(Duration::from_millis(300)));
    }

    #[test]
    fn test_credentials_from_config() {
        let config = EndpointConfig {
            url: "http://p1:8080".into(),
            username: Some("bro".into()),
            password: Some("admin".into()),
            country: Some("se".into()),
            provider: None,
        };
        let endpoint = ProxyEndpoint::from_config(&config);
        assert_eq!(endpoint.credentials(), Some(("bro", "admin")));
        assert_eq!(endpoint.country.as_deref(), Some("se"));
        assert!(endpoint.active);
    }
}
