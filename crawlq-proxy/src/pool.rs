use chrono::Utc;
use crawlq_config::{ProxySettings, RotationStrategy};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::strategy::selector;
use crate::{HealthProbe, ProxyEndpoint, ProxyError};

#[derive(Debug, Clone, PartialEq)]
pub struct PoolOptions {
    pub strategy: RotationStrategy,
    pub max_failures: u32,
    pub min_success_rate: f64,
    pub health_check_interval: Duration,
    pub health_check_timeout: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self::from(&ProxySettings::default())
    }
}

impl From<&ProxySettings> for PoolOptions {
    fn from(settings: &ProxySettings) -> Self {
        Self {
            strategy: settings.rotation_strategy,
            max_failures: settings.max_failures,
            min_success_rate: settings.min_success_rate,
            health_check_interval: settings.health_check_interval(),
            health_check_timeout: settings.health_check_timeout(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub active: usize,
    pub success_rate: f64,
    pub avg_latency: Option<Duration>,
    pub strategy: RotationStrategy,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthReport {
    pub checked: usize,
    pub healthy: usize,
}

#[derive(Default)]
struct PoolState {
    endpoints: Vec<ProxyEndpoint>,
    cursor: usize,
}

impl PoolState {
    fn find_mut(&mut self, address: &str) -> Result<&mut ProxyEndpoint, ProxyError> {
        self.endpoints
            .iter_mut()
            .find(|e| e.address == address)
            .ok_or_else(|| ProxyError::UnknownEndpoint(address.to_string()))
    }
}

/// Owns endpoint state behind a mutex. Probes run outside the lock.
pub struct ProxyPool {
    state: Mutex<PoolState>,
    options: PoolOptions,
    probe: Option<Arc<dyn HealthProbe>>,
}

impl std::fmt::Debug for ProxyPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyPool")
            .field("options", &self.options)
            .field("endpoints", &self.lock().endpoints.len())
            .finish()
    }
}

impl ProxyPool {
    pub fn new(endpoints: Vec<ProxyEndpoint>, options: PoolOptions) -> Self {
        Self {
            state: Mutex::new(PoolState {
                endpoints,
                cursor: 0,
            }),
            options,
            probe: None,
        }
    }

    /// Pool with every configured endpoint, ports expanded. Empty when
    /// proxies are disabled.
    pub fn from_settings(settings: &ProxySettings) -> Self {
        let endpoints = settings
            .expanded_endpoints()
            .iter()
            .map(ProxyEndpoint::from_config)
            .collect();
        Self::new(endpoints, PoolOptions::from(settings))
    }

    pub fn with_probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn options(&self) -> &PoolOptions {
        &self.options
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// `true` when at least one endpoint is registered, active or not.
    pub fn is_configured(&self) -> bool {
        !self.lock().endpoints.is_empty()
    }

    pub fn get_endpoint(&self) -> Option<ProxyEndpoint> {
        let mut guard = self.lock();
        let state = &mut *guard;
        let active: Vec<usize> = state
            .endpoints
            .iter()
            .enumerate()
            .filter(|(_, e)| e.active)
            .map(|(idx, _)| idx)
            .collect();
        if active.is_empty() {
            if !state.endpoints.is_empty() {
                tracing::warn!("No active proxies available");
            }
            return None;
        }

        let select = selector(self.options.strategy);
        let idx = select(&state.endpoints, &active, &mut state.cursor)?;
        let endpoint = &mut state.endpoints[idx];
        endpoint.last_used = Some(Utc::now());
        Some(endpoint.clone())
    }

    pub fn report_success(&self, address: &str, latency: Duration) -> Result<(), ProxyError> {
        let mut state = self.lock();
        let endpoint = state.find_mut(address)?;
        endpoint.success_count += 1;
        endpoint.record_latency(latency);
        endpoint.last_health_check = Some(Utc::now());
        Ok(())
    }

    pub fn report_failure(&self, address: &str, error: &str) -> Result<(), ProxyError> {
        let mut state = self.lock();
        let endpoint = state.find_mut(address)?;
        endpoint.failure_count += 1;
        endpoint.last_health_check = Some(Utc::now());

        if endpoint.active
            && (endpoint.failure_count >= self.options.max_failures as u64
                || endpoint.success_rate() < self.options.min_success_rate)
        {
            endpoint.active = false;
            tracing::warn!(
                proxy = %address,
                failures = endpoint.failure_count,
                success_rate = endpoint.success_rate(),
                %error,
                "Deactivated proxy due to poor performance"
            );
        }
        Ok(())
    }

    /// Probe every endpoint whose last check is older than the configured
    /// interval. No-op without a probe.
    pub async fn health_check(&self) -> HealthReport {
        let Some(probe) = self.probe.clone() else {
            return HealthReport::default();
        };

        let now = Utc::now();
        let due: Vec<ProxyEndpoint> = self
            .lock()
            .endpoints
            .iter()
            .filter(|e| match e.last_health_check {
                Some(checked) => {
                    (now - checked).to_std().unwrap_or(Duration::ZERO)
                        > self.options.health_check_interval
                }
                None => true,
            })
            .cloned()
            .collect();
        if due.is_empty() {
            return HealthReport::default();
        }

        tracing::info!(count = due.len(), "Starting proxy health checks");
        let timeout = self.options.health_check_timeout;
        let probes = due.iter().map(|endpoint| {
            let probe = probe.clone();
            async move {
                match tokio::time::timeout(timeout, probe.probe(endpoint, timeout)).await {
                    Ok(result) => result,
                    Err(_) => Err(ProxyError::ProbeFailed {
                        address: endpoint.address.clone(),
                        reason: "timed out".to_string(),
                    }),
                }
            }
        });
        let results = futures::future::join_all(probes).await;

        let mut report = HealthReport {
            checked: due.len(),
            healthy: 0,
        };
        let mut state = self.lock();
        let checked_at = Utc::now();
        for (endpoint, result) in due.iter().zip(results) {
            // Removed while the probe was in flight.
            let Ok(live) = state.find_mut(&endpoint.address) else {
                continue;
            };
            live.last_health_check = Some(checked_at);
            match result {
                Ok(latency) => {
                    report.healthy += 1;
                    live.failure_count = 0;
                    live.avg_latency = Some(latency);
                    if !live.active {
                        live.active = true;
                        tracing::info!(proxy = %live.address, "Activated proxy");
                    }
                }
                Err(err) => {
                    live.failure_count += 1;
                    tracing::debug!(proxy = %live.address, error = %err, "Proxy probe failed");
                    if live.active && live.failure_count >= self.options.max_failures as u64 {
                        live.active = false;
                        tracing::warn!(proxy = %live.address, "Deactivated proxy after failed probes");
                    }
                }
            }
        }
        tracing::info!(
            checked = report.checked,
            healthy = report.healthy,
            active = state.endpoints.iter().filter(|e| e.active).count(),
            "Proxy health checks completed"
        );
        report
    }

    pub fn add_endpoint(&self, endpoint: ProxyEndpoint) -> Result<(), ProxyError> {
        let mut state = self.lock();
        if state.endpoints.iter().any(|e| e.address == endpoint.address) {
            return Err(ProxyError::DuplicateEndpoint(endpoint.address));
        }
        tracing::info!(proxy = %endpoint.address, "Added proxy");
        state.endpoints.push(endpoint);
        Ok(())
    }

    pub fn remove_endpoint(&self, address: &str) -> Option<ProxyEndpoint> {
        let mut state = self.lock();
        let idx = state.endpoints.iter().position(|e| e.address == address)?;
        tracing::info!(proxy = %address, "Removed proxy");
        Some(state.endpoints.remove(idx))
    }

    pub fn endpoints(&self) -> Vec<ProxyEndpoint> {
        self.lock().endpoints.clone()
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.lock();
        let successes: u64 = state.endpoints.iter().map(|e| e.success_count).sum();
        let failures: u64 = state.endpoints.iter().map(|e| e.failure_count).sum();
        let latencies: Vec<Duration> = state
            .endpoints
            .iter()
            .filter(|e| e.active)
            .filter_map(|e| e.avg_latency)
            .collect();

        PoolStats {
            total: state.endpoints.len(),
            active: state.endpoints.iter().filter(|e| e.active).count(),
            success_rate: if successes + failures == 0 {
                0.0
            } else {
                successes as f64 / (successes + failures) as f64
            },
            avg_latency: (!latencies.is_empty())
                .then(|| latencies.iter().sum::<Duration>() / latencies.len() as u32),
            strategy: self.options.strategy,
        }
    }
}
