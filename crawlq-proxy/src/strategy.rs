//! Selection functions, one per rotation strategy. Each receives the indices
//! of active endpoints (never empty) and returns the chosen index.
use crawlq_config::RotationStrategy;
use rand::seq::IndexedRandom;

use crate::endpoint::ProxyEndpoint;

pub(crate) type SelectFn = fn(&[ProxyEndpoint], &[usize], &mut usize) -> Option<usize>;

pub(crate) fn selector(strategy: RotationStrategy) -> SelectFn {
    match strategy {
        RotationStrategy::RoundRobin => round_robin,
        RotationStrategy::Random => random,
        RotationStrategy::HealthWeighted => health_weighted,
        RotationStrategy::LeastUsed => least_used,
    }
}

fn round_robin(_: &[ProxyEndpoint], active: &[usize], cursor: &mut usize) -> Option<usize> {
    let picked = active.get(*cursor % active.len()).copied();
    *cursor = (*cursor + 1) % active.len();
    picked
}

fn random(_: &[ProxyEndpoint], active: &[usize], _: &mut usize) -> Option<usize> {
    active.choose(&mut rand::rng()).copied()
}

/// Highest health score; the first one wins ties.
fn health_weighted(
    endpoints: &[ProxyEndpoint],
    active: &[usize],
    _: &mut usize,
) -> Option<usize> {
    active.iter().copied().reduce(|best, idx| {
        if endpoints[idx].health_score() > endpoints[best].health_score() {
            idx
        } else {
            best
        }
    })
}

/// Oldest `last_used`; never used endpoints come first.
fn least_used(endpoints: &[ProxyEndpoint], active: &[usize], _: &mut usize) -> Option<usize> {
    active
        .iter()
        .copied()
        .min_by_key(|&idx| endpoints[idx].last_used)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use std::collections::HashSet;

    fn endpoints(n: usize) -> Vec<ProxyEndpoint> {
        (0..n)
            .map(|i| ProxyEndpoint::new(format!("http://p{i}:8080")))
            .collect()
    }

    #[test]
    fn test_round_robin_cycles() {
        let eps = endpoints(3);
        let active = [0, 1, 2];
        let mut cursor = 0;
        let select = selector(RotationStrategy::RoundRobin);
        let picks: Vec<_> = (0..6)
            .filter_map(|_| select(&eps, &active, &mut cursor))
            .collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn test_random_stays_in_active_set() {
        let eps = endpoints(4);
        let active = [1, 3];
        let mut cursor = 0;
        let select = selector(RotationStrategy::Random);
        let picks: HashSet<_> = (0..50)
            .filter_map(|_| select(&eps, &active, &mut cursor))
            .collect();
        assert!(picks.is_subset(&HashSet::from([1, 3])));
    }

    #[test]
    fn test_health_weighted_picks_best() {
        let mut eps = endpoints(3);
        eps[1].success_count = 10;
        eps[2].success_count = 5;
        eps[2].failure_count = 5;
        let mut cursor = 0;
        let pick = selector(RotationStrategy::HealthWeighted)(&eps, &[0, 1, 2], &mut cursor);
        assert_eq!(pick, Some(1));
    }

    #[test]
    fn test_least_used_prefers_never_used() {
        let mut eps = endpoints(3);
        let now = Utc::now();
        eps[0].last_used = Some(now);
        eps[1].last_used = Some(now - Duration::seconds(30));
        let mut cursor = 0;
        let select = selector(RotationStrategy::LeastUsed);
        assert_eq!(select(&eps, &[0, 1, 2], &mut cursor), Some(2));
        assert_eq!(select(&eps, &[0, 1], &mut cursor), Some(1));
    }
}
