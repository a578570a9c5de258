//! HTTP client construction shared by fetchers, robots fetching and proxy
//! probes.
//!
//! # Example
//! ```no_run
//! use crawlq_config::http::{HttpClientParams, build_http_client};
//! use crawlq_config::settings::HttpSettings;
//!
//! let params = HttpClientParams::from_settings(&HttpSettings::default())
//!     .with_proxy("http://proxy.example.com:8080", None);
//! let client = build_http_client(&params).unwrap();
//! ```
use backoff::ExponentialBackoffBuilder;
use std::time::Duration;

use crate::settings::HttpSettings;

/// Basic-auth credentials for a proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyAuth {
    pub username: String,
    pub password: String,
}

/// Parameters for configuring an HTTP client.
#[derive(Debug, Clone)]
pub struct HttpClientParams {
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub user_agent: String,
    pub accept_invalid_certs: bool,
    pub proxy: Option<(String, Option<ProxyAuth>)>,
}

impl HttpClientParams {
    pub fn from_settings(settings: &HttpSettings) -> Self {
        Self {
            timeout: Duration::from_secs(settings.timeout_s),
            connect_timeout: Duration::from_secs(settings.connect_timeout_s),
            user_agent: settings.user_agent.clone(),
            accept_invalid_certs: settings.accept_invalid_certs,
            proxy: None,
        }
    }

    pub fn with_proxy(mut self, uri: impl Into<String>, auth: Option<ProxyAuth>) -> Self {
        self.proxy = Some((uri.into(), auth));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Builds a reqwest client with rustls, timeouts, user agent and an
/// optional proxy applied to every scheme.
pub fn build_http_client(
    params: &HttpClientParams,
) -> Result<reqwest::Client, reqwest::Error> {
    let mut client_builder = reqwest::ClientBuilder::new()
        .use_rustls_tls()
        .danger_accept_invalid_certs(params.accept_invalid_certs)
        .timeout(params.timeout)
        .connect_timeout(params.connect_timeout)
        .user_agent(params.user_agent.as_str());

    if let Some((uri, auth)) = &params.proxy {
        let mut proxy = reqwest::Proxy::all(uri.as_str())?;
        if let Some(auth) = auth {
            proxy = proxy.basic_auth(&auth.username, &auth.password);
        }
        client_builder = client_builder.proxy(proxy);
    }

    client_builder.build()
}

/// Fetches status and body of `url`, retrying transport errors with
/// exponential backoff until `max_elapsed` passes.
pub async fn fetch_url_content(
    client: &reqwest::Client,
    url: &str,
    max_elapsed: Duration,
) -> Result<(reqwest::StatusCode, String), reqwest::Error> {
    let backoff = ExponentialBackoffBuilder::new()
        .with_max_interval(Duration::from_secs(5))
        .with_max_elapsed_time(Some(max_elapsed))
        .build();

    let fetch_content = || async {
        let response = client
            .get(url)
            .send()
            .await
            .map_err(backoff::Error::transient)?;
        let status = response.status();
        let text = response.text().await.map_err(backoff::Error::transient)?;
        Ok((status, text))
    };

    backoff::future::retry(backoff, fetch_content).await
}
