use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How long a write should live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ttl {
    /// Use the tier's configured default.
    Default,
    After(Duration),
    Never,
}

impl From<Option<Duration>> for Ttl {
    fn from(value: Option<Duration>) -> Self {
        value.map(Ttl::After).unwrap_or(Ttl::Default)
    }
}

impl Ttl {
    pub(crate) fn expires_at(
        self,
        now: DateTime<Utc>,
        tier_default: Option<Duration>,
    ) -> Option<DateTime<Utc>> {
        let ttl = match self {
            Ttl::Default => tier_default?,
            Ttl::After(ttl) => ttl,
            Ttl::Never => return None,
        };
        chrono::Duration::from_std(ttl).ok().map(|ttl| now + ttl)
    }
}

/// A cached payload with its bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub payload: Vec<u8>,
    pub size: u64,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub access_count: u64,
    pub last_access: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(key: &str, payload: Vec<u8>, expires_at: Option<DateTime<Utc>>) -> Self {
        let now = Utc::now();
        Self {
            key: key.to_string(),
            size: payload.len() as u64,
            payload,
            created_at: now,
            expires_at,
            access_count: 0,
            last_access: now,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now > at)
    }

    /// Time left before expiry. `Ttl::Never` for entries without expiry.
    pub fn remaining_ttl(&self, now: DateTime<Utc>) -> Ttl {
        match self.expires_at {
            None => Ttl::Never,
            Some(at) => Ttl::After((at - now).to_std().unwrap_or(Duration::ZERO)),
        }
    }

    pub(crate) fn touch(&mut self, now: DateTime<Utc>) {
        self.access_count += 1;
        self.last_access = now;
    }
}

/// Number of entries one eviction round removes.
pub(crate) fn eviction_batch(len: usize, fraction: f64) -> usize {
    ((len as f64 * fraction) as usize).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiry() {
        let now = Utc::now();
        let entry = CacheEntry::new("k", b"v".to_vec(), Some(now + chrono::Duration::seconds(5)));
        assert!(!entry.is_expired(now));
        assert!(entry.is_expired(now + chrono::Duration::seconds(6)));
        assert_eq!(entry.remaining_ttl(now), Ttl::After(Duration::from_secs(5)));

        let forever = CacheEntry::new("k", vec![], None);
        assert!(!forever.is_expired(now + chrono::Duration::days(365)));
        assert_eq!(forever.remaining_ttl(now), Ttl::Never);
    }

    #[test]
    fn test_ttl_resolution() {
        let now = Utc::now();
        let default = Some(Duration::from_secs(60));
        assert_eq!(
            Ttl::Default.expires_at(now, default),
            Some(now + chrono::Duration::seconds(60))
        );
        assert_eq!(Ttl::Default.expires_at(now, None), None);
        assert_eq!(Ttl::Never.expires_at(now, default), None);
        assert_eq!(
            Ttl::from(Some(Duration::from_secs(1))).expires_at(now, default),
            Some(now + chrono::Duration::seconds(1))
        );
    }

    #[test]
    fn test_eviction_batch() {
        assert_eq!(eviction_batch(3, 0.1), 1);
        assert_eq!(eviction_batch(100, 0.1), 10);
        assert_eq!(eviction_batch(10, 0.2), 2);
    }
}
