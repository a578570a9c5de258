use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Spaces requests to the same host by the host's crawl delay. Each caller
/// reserves the next free slot under the lock and sleeps outside it.
#[derive(Debug, Default)]
pub struct HostThrottle {
    next_slot: Mutex<HashMap<String, Instant>>,
}

impl HostThrottle {
    pub fn new() -> Self {
        Self::default()
    }

    /// How long the caller must wait before fetching from `host`. `None` when
    /// that wait would exceed `max_wait`; no slot is taken in that case.
    pub fn reserve(&self, host: &str, delay: Duration, max_wait: Duration) -> Option<Duration> {
        let now = Instant::now();
        let mut slots = self
            .next_slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // slots in the past carry no information
        slots.retain(|_, at| *at > now);
        let slot = slots.get(host).copied().unwrap_or(now);
        let wait = slot - now;
        if wait > max_wait {
            return None;
        }
        slots.insert(host.to_string(), slot + delay);
        Some(wait)
    }

    /// Sleeps until the reserved slot. Returns `false` without waiting when
    /// the host is booked further ahead than `max_wait`.
    pub async fn wait_turn(&self, host: &str, delay: Duration, max_wait: Duration) -> bool {
        let Some(wait) = self.reserve(host, delay, max_wait) else {
            tracing::debug!(
                host,
                max_wait_ms = max_wait.as_millis() as u64,
                "Crawl delay backlog too long"
            );
            return false;
        };
        if !wait.is_zero() {
            tracing::debug!(host, wait_ms = wait.as_millis() as u64, "Honoring crawl delay");
            tokio::time::sleep(wait).await;
        }
        true
    }

    pub fn tracked_hosts(&self) -> usize {
        self.next_slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const NO_LIMIT: Duration = Duration::from_secs(3600);

    #[tokio::test(start_paused = true)]
    async fn test_reservations_are_spaced() {
        let throttle = HostThrottle::new();
        let delay = Duration::from_secs(2);
        assert_eq!(throttle.reserve("a.com", delay, NO_LIMIT), Some(Duration::ZERO));
        assert_eq!(throttle.reserve("a.com", delay, NO_LIMIT), Some(Duration::from_secs(2)));
        assert_eq!(throttle.reserve("a.com", delay, NO_LIMIT), Some(Duration::from_secs(4)));
        assert_eq!(throttle.reserve("b.com", delay, NO_LIMIT), Some(Duration::ZERO));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slot_frees_up_after_delay() {
        let throttle = HostThrottle::new();
        assert!(throttle.wait_turn("a.com", Duration::from_secs(1), NO_LIMIT).await);
        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(
            throttle.reserve("a.com", Duration::from_secs(1), NO_LIMIT),
            Some(Duration::ZERO)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_past_slots_are_pruned() {
        let throttle = HostThrottle::new();
        for i in 0..50 {
            throttle.reserve(&format!("host-{i}.com"), Duration::from_secs(1), NO_LIMIT);
        }
        assert_eq!(throttle.tracked_hosts(), 50);

        tokio::time::advance(Duration::from_secs(2)).await;
        throttle.reserve("fresh.com", Duration::from_secs(1), NO_LIMIT);
        assert_eq!(throttle.tracked_hosts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backlog_beyond_max_wait_is_refused() {
        let throttle = HostThrottle::new();
        let delay = Duration::from_secs(60);
        let max_wait = Duration::from_secs(90);
        assert_eq!(throttle.reserve("slow.com", delay, max_wait), Some(Duration::ZERO));
        assert_eq!(throttle.reserve("slow.com", delay, max_wait), Some(delay));
        // third caller would wait 120s
        assert_eq!(throttle.reserve("slow.com", delay, max_wait), None);
        assert!(!throttle.wait_turn("slow.com", delay, max_wait).await);

        // the refusals took no slot
        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(throttle.reserve("slow.com", delay, max_wait), Some(delay));
    }
}
