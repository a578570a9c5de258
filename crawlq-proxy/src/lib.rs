//! Pool of egress proxies with rotation, health scoring and periodic probes.
pub mod endpoint;
pub mod pool;
pub mod probe;
mod strategy;

pub use crate::endpoint::ProxyEndpoint;
pub use crate::pool::{HealthReport, PoolOptions, PoolStats, ProxyPool};
#[cfg(feature = "http")]
pub use crate::probe::HttpProbe;
pub use crate::probe::HealthProbe;
pub use crawlq_config::RotationStrategy;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Unknown proxy endpoint: {0}")]
    UnknownEndpoint(String),
    #[error("Proxy endpoint already registered: {0}")]
    DuplicateEndpoint(String),
    #[error("Probe through {address} failed: {reason}")]
    ProbeFailed { address: String, reason: String },
    #[cfg(feature = "http")]
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}
