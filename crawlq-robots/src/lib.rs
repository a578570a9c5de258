//! robots.txt parsing, matching and per-host policy caching.
//!
//! `RobotsEngine::can_fetch` answers whether an agent may request a URL and
//! which crawl delay the host asks for. Policies are fetched through a
//! `PolicySource` and cached per policy URL. Failures to fetch fail open.
mod engine;
mod rules;
mod source;

pub use crate::engine::{policy_url, FetchDecision, RobotsCacheStats, RobotsEngine};
pub use crate::rules::{PathPattern, RobotsRules, Rule, RuleGroup};
#[cfg(feature = "http")]
pub use crate::source::HttpPolicySource;
pub use crate::source::{PolicyFetch, PolicySource};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RobotsError {
    #[error("Invalid url: {0}")]
    InvalidUrl(String),
    #[error("Policy {url} unavailable: status {status}")]
    Unavailable { url: String, status: u16 },
    #[error("Policy fetch failed: {0}")]
    Fetch(String),
    #[cfg(feature = "http")]
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}
