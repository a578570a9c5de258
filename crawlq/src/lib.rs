//! # crawlq
//!
//! Polite, resilient request orchestration for web crawlers. Given a large set
//! of target URLs, `crawlq` fetches them without breaking robots.txt rules,
//! survives proxy and network failures, avoids redundant fetches and spreads
//! the work over many worker processes sharing one external queue.
//!
//! ## Crates
//!
//! - `config`: typed `Settings`, file + environment loading, HTTP client setup.
//! - `queue`: task queue with leases, bounded retries and write-once outcomes.
//! - `proxy`: proxy pool with rotation strategies and health scoring.
//! - `cache`: memory / disk / hybrid response cache.
//! - `robots`: robots.txt parser and caching engine that fails open.
//!
//! ## Modules
//!
//! - `client`: producer API (enqueue, cancel, status, wait).
//! - `context`: wiring of every subsystem shared by the workers.
//! - `fetch`: the `Fetcher` capability and its reqwest implementation.
//! - `manager`: workers, background maintenance loops and their manager.
//! - `logging`: tracing subscriber setup.
pub mod client;
pub mod context;
pub mod fetch;
pub mod logging;
pub mod manager;
pub mod throttle;

#[cfg(test)]
mod testing;

pub use client::{ClientError, CrawlClient};
pub use context::CrawlContext;
pub use fetch::{CrawlResult, FetchError, FetchRequest, FetchResponse, Fetcher};
#[cfg(feature = "http")]
pub use fetch::ReqwestFetcher;

pub use crawlq_cache as cache;
pub use crawlq_config as config;
#[cfg(feature = "http")]
pub use crawlq_config::backoff;
#[cfg(feature = "http")]
pub use crawlq_config::http;
pub use crawlq_proxy as proxy;
pub use crawlq_queue as queue;
pub use crawlq_robots as robots;
#[cfg(feature = "http")]
pub use reqwest;
#[cfg(feature = "redis")]
pub use rustis;
// re-export
pub use async_trait;
pub use serde;
pub use serde_json;
pub use thiserror;
pub use tracing;
pub use tracing_subscriber;
