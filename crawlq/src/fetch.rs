//! The network boundary. Workers only talk to the web through a `Fetcher`,
//! which keeps the pipeline testable with an in-process double.
use async_trait::async_trait;
use crawlq_proxy::ProxyEndpoint;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

/// Task payload: one page to fetch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FetchRequest {
    pub url: String,
    /// Extraction settings for downstream parsers, carried untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_json::Value>,
    /// Query parameters. Part of the cache key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<BTreeMap<String, serde_json::Value>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

impl FetchRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.params
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Query string values as sent on the wire.
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        self.params
            .iter()
            .flatten()
            .map(|(key, value)| {
                let value = match value {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (key.clone(), value)
            })
            .collect()
    }

    /// The url as requested on the wire: `url` with `params` appended to its
    /// query. An unparsable url is returned unchanged.
    pub fn effective_url(&self) -> String {
        let pairs = self.query_pairs();
        if pairs.is_empty() {
            return self.url.clone();
        }
        match url::Url::parse(&self.url) {
            Ok(mut parsed) => {
                parsed.query_pairs_mut().extend_pairs(pairs);
                parsed.into()
            }
            Err(_) => self.url.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchResponse {
    pub status: u16,
    pub body: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub latency: Duration,
}

impl FetchResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Statuses worth retrying: timeouts, throttling and server errors.
    pub fn is_transient(&self) -> bool {
        matches!(self.status, 408 | 429) || (500..600).contains(&self.status)
    }
}

/// Stored as the result of a completed task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrawlResult {
    pub url: String,
    pub cache_key: String,
    pub from_cache: bool,
    pub response: FetchResponse,
}

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Fetch timed out after {0:?}")]
    Timeout(Duration),
    #[error("Transport error: {0}")]
    Transport(String),
    #[cfg(feature = "http")]
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(
        &self,
        request: &FetchRequest,
        proxy: Option<&ProxyEndpoint>,
    ) -> Result<FetchResponse, FetchError>;
}

/// Fetches with reqwest, keeping one client per proxy address.
#[cfg(feature = "http")]
pub struct ReqwestFetcher {
    params: crawlq_config::http::HttpClientParams,
    clients: std::sync::Mutex<std::collections::HashMap<Option<String>, reqwest::Client>>,
}

#[cfg(feature = "http")]
impl std::fmt::Debug for ReqwestFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReqwestFetcher")
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

#[cfg(feature = "http")]
impl ReqwestFetcher {
    pub fn new(settings: &crawlq_config::HttpSettings) -> Self {
        Self {
            params: crawlq_config::http::HttpClientParams::from_settings(settings),
            clients: Default::default(),
        }
    }

    fn client_for(&self, proxy: Option<&ProxyEndpoint>) -> Result<reqwest::Client, FetchError> {
        use crawlq_config::http::{build_http_client, ProxyAuth};

        let address = proxy.map(|p| p.address.clone());
        let mut clients = self
            .clients
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(client) = clients.get(&address) {
            return Ok(client.clone());
        }

        let mut params = self.params.clone();
        if let Some(proxy) = proxy {
            let auth = proxy.credentials().map(|(username, password)| ProxyAuth {
                username: username.to_string(),
                password: password.to_string(),
            });
            params = params.with_proxy(proxy.address.clone(), auth);
        }
        let client = build_http_client(&params)?;
        clients.insert(address, client.clone());
        Ok(client)
    }
}

#[cfg(feature = "http")]
#[async_trait]
impl Fetcher for ReqwestFetcher {
    async fn fetch(
        &self,
        request: &FetchRequest,
        proxy: Option<&ProxyEndpoint>,
    ) -> Result<FetchResponse, FetchError> {
        let client = self.client_for(proxy)?;
        let mut builder = client.get(&request.url).query(&request.query_pairs());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let started = tokio::time::Instant::now();
        let response = builder.send().await?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.to_string(), value.to_string()))
            })
            .collect();
        let body = response.text().await?;

        Ok(FetchResponse {
            status,
            body,
            headers,
            latency: started.elapsed(),
        })
    }
}
