use async_trait::async_trait;
use std::time::Duration;

use crate::{ProxyEndpoint, ProxyError};

/// Checks that an endpoint can carry traffic. Returns the observed latency.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(
        &self,
        endpoint: &ProxyEndpoint,
        timeout: Duration,
    ) -> Result<Duration, ProxyError>;
}

/// Issues a GET for `probe_url` through the endpoint and expects HTTP 200.
#[cfg(feature = "http")]
#[derive(Debug, Clone)]
pub struct HttpProbe {
    pub probe_url: String,
    pub params: crawlq_config::http::HttpClientParams,
}

#[cfg(feature = "http")]
impl HttpProbe {
    pub fn new(probe_url: impl Into<String>, settings: &crawlq_config::HttpSettings) -> Self {
        Self {
            probe_url: probe_url.into(),
            params: crawlq_config::http::HttpClientParams::from_settings(settings),
        }
    }
}

#[cfg(feature = "http")]
#[async_trait]
impl HealthProbe for HttpProbe {
    async fn probe(
        &self,
        endpoint: &ProxyEndpoint,
        timeout: Duration,
    ) -> Result<Duration, ProxyError> {
        use crawlq_config::http::{build_http_client, ProxyAuth};

        let auth = endpoint.credentials().map(|(username, password)| ProxyAuth {
            username: username.to_string(),
            password: password.to_string(),
        });
        let params = self
            .params
            .clone()
            .with_timeout(timeout)
            .with_proxy(endpoint.address.clone(), auth);
        let client = build_http_client(&params)?;

        let started = tokio::time::Instant::now();
        let response = client.get(&self.probe_url).send().await?;
        let latency = started.elapsed();

        if response.status() == reqwest::StatusCode::OK {
            Ok(latency)
        } else {
            Err(ProxyError::ProbeFailed {
                address: endpoint.address.clone(),
                reason: format!("status {}", response.status()),
            })
        }
    }
}
