use crawlq_config::RobotsSettings;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use url::Url;

use crate::{PolicyFetch, PolicySource, RobotsError, RobotsRules};

/// Whether a URL may be fetched and how long to wait between requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FetchDecision {
    pub allowed: bool,
    pub crawl_delay: Option<Duration>,
}

impl FetchDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            crawl_delay: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RobotsCacheStats {
    pub cached_policies: usize,
    pub ttl: Duration,
}

#[derive(Debug)]
struct CachedPolicy {
    rules: Arc<RobotsRules>,
    fetched_at: Instant,
}

/// `{scheme}://{host[:port]}/robots.txt` for the given page url.
pub fn policy_url(url: &str) -> Result<String, RobotsError> {
    let parsed = Url::parse(url).map_err(|e| RobotsError::InvalidUrl(format!("{url}: {e}")))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| RobotsError::InvalidUrl(format!("{url}: no host")))?;
    Ok(match parsed.port() {
        Some(port) => format!("{}://{}:{}/robots.txt", parsed.scheme(), host, port),
        None => format!("{}://{}/robots.txt", parsed.scheme(), host),
    })
}

/// Caches parsed policies per policy url. No lock is held while fetching.
pub struct RobotsEngine {
    source: Arc<dyn PolicySource>,
    cache: Mutex<HashMap<String, CachedPolicy>>,
    ttl: Duration,
}

impl std::fmt::Debug for RobotsEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RobotsEngine")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl RobotsEngine {
    pub fn new(source: Arc<dyn PolicySource>, ttl: Duration) -> Self {
        Self {
            source,
            cache: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    pub fn from_settings(source: Arc<dyn PolicySource>, settings: &RobotsSettings) -> Self {
        Self::new(source, settings.cache_ttl())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, CachedPolicy>> {
        // Plain data, safe to use after a poisoning panic.
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn cached(&self, policy_url: &str) -> Option<Arc<RobotsRules>> {
        let mut cache = self.lock();
        let entry = cache
            .get(policy_url)
            .map(|entry| (entry.fetched_at.elapsed() < self.ttl, entry.rules.clone()));
        match entry {
            Some((true, rules)) => Some(rules),
            Some((false, _)) => {
                cache.remove(policy_url);
                None
            }
            None => None,
        }
    }

    /// Cached rules, or fetch and cache them. Fetch errors are not cached.
    async fn rules_for(&self, policy_url: &str) -> Result<Arc<RobotsRules>, RobotsError> {
        if let Some(rules) = self.cached(policy_url) {
            return Ok(rules);
        }

        let rules = match self.source.fetch(policy_url).await? {
            PolicyFetch::Found(body) => RobotsRules::parse(&body),
            PolicyFetch::Missing(status) => {
                tracing::debug!(policy_url, status, "No robots policy, allowing all");
                RobotsRules::allow_all()
            }
        };
        let rules = Arc::new(rules);
        self.lock().insert(
            policy_url.to_string(),
            CachedPolicy {
                rules: rules.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(rules)
    }

    /// Decide whether `agent` may fetch `url`. Any failure allows the fetch.
    pub async fn can_fetch(&self, url: &str, agent: &str) -> FetchDecision {
        let parsed = match Url::parse(url) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!(url, error = %e, "Unparsable url, robots check skipped");
                return FetchDecision::allow();
            }
        };
        let rules = match policy_url(url) {
            Ok(policy) => match self.rules_for(&policy).await {
                Ok(rules) => rules,
                Err(e) => {
                    tracing::warn!(policy_url = %policy, error = %e, "Robots fetch failed, allowing");
                    return FetchDecision::allow();
                }
            },
            Err(e) => {
                tracing::warn!(url, error = %e, "Robots check skipped");
                return FetchDecision::allow();
            }
        };

        let path = match parsed.query() {
            Some(query) => format!("{}?{}", parsed.path(), query),
            None => parsed.path().to_string(),
        };
        FetchDecision {
            allowed: rules.is_allowed(&path, agent),
            crawl_delay: rules.crawl_delay(agent),
        }
    }

    /// Sitemap urls declared by the host serving `url`.
    pub async fn sitemaps(&self, url: &str) -> Vec<String> {
        let Ok(policy) = policy_url(url) else {
            return Vec::new();
        };
        match self.rules_for(&policy).await {
            Ok(rules) => rules.sitemaps.clone(),
            Err(e) => {
                tracing::warn!(policy_url = %policy, error = %e, "Robots fetch failed");
                Vec::new()
            }
        }
    }

    pub fn clear_cache(&self) {
        self.lock().clear();
        tracing::info!("Robots cache cleared");
    }

    pub fn cache_stats(&self) -> RobotsCacheStats {
        RobotsCacheStats {
            cached_policies: self.lock().len(),
            ttl: self.ttl,
        }
    }
}
