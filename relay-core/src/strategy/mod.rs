//! Routing strategies.
//!
//! A strategy is a closed set of policies evaluated by a pure function over
//! endpoint snapshots. Randomness and cursor state are supplied by the
//! caller so selection stays deterministic under test.

use crate::balancer::EndpointSnapshot;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Policy choosing among eligible endpoints
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoutingStrategy {
    /// Cyclic pointer over the candidates
    #[default]
    RoundRobin,
    /// Probability proportional to endpoint weight
    WeightedRandom,
    /// Fewest in-flight calls
    LeastLoaded,
    /// Lowest moving-average latency, ties broken by load
    LatencyAware,
}

impl RoutingStrategy {
    /// Strategy name
    pub fn as_str(&self) -> &'static str {
        match self {
            RoutingStrategy::RoundRobin => "round-robin",
            RoutingStrategy::WeightedRandom => "weighted-random",
            RoutingStrategy::LeastLoaded => "least-loaded",
            RoutingStrategy::LatencyAware => "latency-aware",
        }
    }

    /// Pick an index into `candidates`.
    ///
    /// `tick` is the round-robin cursor value and `roll` a uniform sample
    /// in `[0, 1)`. Returns `None` only when `candidates` is empty.
    pub fn select(&self, candidates: &[EndpointSnapshot], tick: usize, roll: f64) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }

        match self {
            RoutingStrategy::RoundRobin => Some(tick % candidates.len()),
            RoutingStrategy::WeightedRandom => Some(weighted(candidates, roll)),
            RoutingStrategy::LeastLoaded => candidates
                .iter()
                .enumerate()
                .min_by_key(|(_, c)| c.in_flight)
                .map(|(i, _)| i),
            RoutingStrategy::LatencyAware => candidates
                .iter()
                .enumerate()
                .min_by(|(_, a), (_, b)| {
                    let la = a.latency_ms.unwrap_or(0.0);
                    let lb = b.latency_ms.unwrap_or(0.0);
                    la.partial_cmp(&lb)
                        .unwrap_or(Ordering::Equal)
                        .then(a.in_flight.cmp(&b.in_flight))
                })
                .map(|(i, _)| i),
        }
    }
}

impl std::fmt::Display for RoutingStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn weighted(candidates: &[EndpointSnapshot], roll: f64) -> usize {
    let total: u64 = candidates.iter().map(|c| u64::from(c.weight)).sum();
    if total == 0 {
        // All weights zero: uniform
        let index = (roll * candidates.len() as f64) as usize;
        return index.min(candidates.len() - 1);
    }

    let mut target = roll.clamp(0.0, 1.0) * total as f64;
    for (i, candidate) in candidates.iter().enumerate() {
        let weight = f64::from(candidate.weight);
        if target < weight {
            return i;
        }
        target -= weight;
    }
    // Rounding at roll close to 1.0; last positive weight wins
    candidates
        .iter()
        .rposition(|c| c.weight > 0)
        .unwrap_or(candidates.len() - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balancer::HealthState;
    use crate::breaker::CircuitState;

    fn snapshot(id: &str, weight: u32, in_flight: usize, latency_ms: Option<f64>) -> EndpointSnapshot {
        EndpointSnapshot {
            id: id.into(),
            weight,
            in_flight,
            latency_ms,
            error_rate: 0.0,
            health: HealthState::Healthy,
            circuit: CircuitState::Closed,
        }
    }

    #[test]
    fn test_round_robin_cycles() {
        let candidates = vec![
            snapshot("a", 1, 0, None),
            snapshot("b", 1, 0, None),
            snapshot("c", 1, 0, None),
        ];
        let picks: Vec<usize> = (0..6)
            .filter_map(|tick| RoutingStrategy::RoundRobin.select(&candidates, tick, 0.0))
            .collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn test_weighted_random_follows_weights() {
        let candidates = vec![snapshot("a", 1, 0, None), snapshot("b", 3, 0, None)];
        let strategy = RoutingStrategy::WeightedRandom;
        assert_eq!(strategy.select(&candidates, 0, 0.0), Some(0));
        assert_eq!(strategy.select(&candidates, 0, 0.24), Some(0));
        assert_eq!(strategy.select(&candidates, 0, 0.25), Some(1));
        assert_eq!(strategy.select(&candidates, 0, 0.999), Some(1));
    }

    #[test]
    fn test_weighted_random_skips_zero_weight() {
        let candidates = vec![snapshot("a", 0, 0, None), snapshot("b", 2, 0, None)];
        assert_eq!(
            RoutingStrategy::WeightedRandom.select(&candidates, 0, 0.0),
            Some(1)
        );
    }

    #[test]
    fn test_least_loaded() {
        let candidates = vec![
            snapshot("a", 1, 3, None),
            snapshot("b", 1, 1, None),
            snapshot("c", 1, 2, None),
        ];
        assert_eq!(RoutingStrategy::LeastLoaded.select(&candidates, 0, 0.0), Some(1));
    }

    #[test]
    fn test_latency_aware_prefers_unsampled_then_load() {
        let candidates = vec![
            snapshot("a", 1, 0, Some(40.0)),
            snapshot("b", 1, 2, None),
            snapshot("c", 1, 1, None),
        ];
        assert_eq!(RoutingStrategy::LatencyAware.select(&candidates, 0, 0.0), Some(2));

        let sampled = vec![snapshot("a", 1, 0, Some(40.0)), snapshot("b", 1, 5, Some(12.5))];
        assert_eq!(RoutingStrategy::LatencyAware.select(&sampled, 0, 0.0), Some(1));
    }

    #[test]
    fn test_empty_candidates() {
        assert_eq!(RoutingStrategy::LeastLoaded.select(&[], 0, 0.5), None);
    }

    #[test]
    fn test_serde_names() {
        let strategy: RoutingStrategy = serde_json::from_str("\"latency-aware\"").unwrap();
        assert_eq!(strategy, RoutingStrategy::LatencyAware);
        assert_eq!(serde_json::to_string(&RoutingStrategy::RoundRobin).unwrap(), "\"round-robin\"");
    }
}
