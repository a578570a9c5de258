use async_trait::async_trait;

use crate::RobotsError;

/// Result of retrieving a policy file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyFetch {
    Found(String),
    /// The host answered but has no usable policy (404 and friends).
    Missing(u16),
}

/// Retrieves robots.txt bodies. Errors make the engine fail open.
#[async_trait]
pub trait PolicySource: Send + Sync {
    async fn fetch(&self, policy_url: &str) -> Result<PolicyFetch, RobotsError>;
}

/// Fetches policies over HTTP, retrying transport errors with backoff.
#[cfg(feature = "http")]
#[derive(Debug, Clone)]
pub struct HttpPolicySource {
    client: reqwest::Client,
    max_elapsed: std::time::Duration,
}

#[cfg(feature = "http")]
impl HttpPolicySource {
    pub fn new(settings: &crawlq_config::HttpSettings) -> Result<Self, RobotsError> {
        use crawlq_config::http::{build_http_client, HttpClientParams};

        let params = HttpClientParams::from_settings(settings);
        let max_elapsed = params.timeout;
        Ok(Self {
            client: build_http_client(&params)?,
            max_elapsed,
        })
    }

    pub fn with_client(client: reqwest::Client, max_elapsed: std::time::Duration) -> Self {
        Self {
            client,
            max_elapsed,
        }
    }
}

#[cfg(feature = "http")]
#[async_trait]
impl PolicySource for HttpPolicySource {
    async fn fetch(&self, policy_url: &str) -> Result<PolicyFetch, RobotsError> {
        let (status, body) =
            crawlq_config::http::fetch_url_content(&self.client, policy_url, self.max_elapsed)
                .await?;
        if status.is_success() {
            Ok(PolicyFetch::Found(body))
        } else if status.is_client_error() {
            Ok(PolicyFetch::Missing(status.as_u16()))
        } else {
            Err(RobotsError::Unavailable {
                url: policy_url.to_string(),
                status: status.as_u16(),
            })
        }
    }
}
