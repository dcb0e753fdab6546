//! Worker selection strategies.

use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};

use weft_types::{Fingerprint, WorkerId};

use crate::registry::WorkerView;

/// One strategy is active per cluster.
#[derive(Debug, Clone)]
pub enum RoutingStrategy {
    RoundRobin,
    LeastLoaded,
    /// Minimizes `avg_latency_ms + k * load_ratio`.
    LatencyAware { k: f64 },
    /// Same request hash lands on the same worker while the ring is stable.
    ConsistentHash,
}

impl RoutingStrategy {
    /// Pick one of the (already eligibility-filtered, id-sorted)
    /// candidates. Returns `None` on an empty slate.
    pub fn select(
        &self,
        candidates: &[WorkerView],
        request_hash: &Fingerprint,
        round_robin: &AtomicUsize,
    ) -> Option<WorkerId> {
        if candidates.is_empty() {
            return None;
        }
        let chosen = match self {
            Self::RoundRobin => {
                let n = round_robin.fetch_add(1, Ordering::Relaxed);
                &candidates[n % candidates.len()]
            }
            Self::LeastLoaded => candidates
                .iter()
                .min_by(|a, b| {
                    a.load_ratio()
                        .partial_cmp(&b.load_ratio())
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .expect("non-empty"),
            Self::LatencyAware { k } => candidates
                .iter()
                .min_by(|a, b| {
                    let ea = a.avg_latency_ms + k * a.load_ratio();
                    let eb = b.avg_latency_ms + k * b.load_ratio();
                    ea.partial_cmp(&eb).unwrap_or(std::cmp::Ordering::Equal)
                })
                .expect("non-empty"),
            // Highest-random-weight hashing: stable per (hash, worker) pair,
            // minimal reshuffling when the ring changes.
            Self::ConsistentHash => candidates
                .iter()
                .max_by_key(|w| rendezvous_weight(request_hash, &w.worker_id))
                .expect("non-empty"),
        };
        Some(chosen.worker_id.clone())
    }
}

fn rendezvous_weight(request_hash: &Fingerprint, worker_id: &WorkerId) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    request_hash.as_str().hash(&mut hasher);
    worker_id.as_str().hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use weft_bridge::resilience::circuit::{CircuitBreaker, CircuitBreakerConfig};
    use weft_proto::bus::{WorkerSkills, WorkerStatus};
    use weft_types::{GenerateParams, StreamId};

    fn view(id: &str, load: u32, latency: f64) -> WorkerView {
        WorkerView {
            worker_id: WorkerId::new(id),
            hostname: id.to_owned(),
            ip: "127.0.0.1".into(),
            port: 7000,
            skills: WorkerSkills {
                available_models: vec!["m".into()],
                ..WorkerSkills::default()
            },
            status: WorkerStatus::Online,
            current_load: load,
            capacity: 8,
            avg_latency_ms: latency,
            total_handled: 0,
            circuit: Arc::new(CircuitBreaker::new(CircuitBreakerConfig::default())),
        }
    }

    fn fp(prompt: &str) -> Fingerprint {
        Fingerprint::of(&GenerateParams::new("m", prompt, StreamId::new("s")))
    }

    #[test]
    fn round_robin_cycles_through_candidates() {
        let candidates = vec![view("w-a", 0, 0.0), view("w-b", 0, 0.0)];
        let counter = AtomicUsize::new(0);
        let strategy = RoutingStrategy::RoundRobin;

        let first = strategy.select(&candidates, &fp("p"), &counter).unwrap();
        let second = strategy.select(&candidates, &fp("p"), &counter).unwrap();
        let third = strategy.select(&candidates, &fp("p"), &counter).unwrap();
        assert_ne!(first, second);
        assert_eq!(first, third);
    }

    #[test]
    fn least_loaded_picks_the_smallest_ratio() {
        let candidates = vec![view("w-a", 6, 0.0), view("w-b", 1, 0.0)];
        let counter = AtomicUsize::new(0);
        let chosen = RoutingStrategy::LeastLoaded
            .select(&candidates, &fp("p"), &counter)
            .unwrap();
        assert_eq!(chosen, WorkerId::new("w-b"));
    }

    #[test]
    fn latency_aware_penalizes_load() {
        // w-a is faster but saturated; with a large k the idle worker wins.
        let candidates = vec![view("w-a", 8, 10.0), view("w-b", 0, 30.0)];
        let counter = AtomicUsize::new(0);
        let chosen = RoutingStrategy::LatencyAware { k: 100.0 }
            .select(&candidates, &fp("p"), &counter)
            .unwrap();
        assert_eq!(chosen, WorkerId::new("w-b"));
    }

    #[test]
    fn consistent_hash_is_sticky_per_request_hash() {
        let candidates = vec![view("w-a", 0, 0.0), view("w-b", 0, 0.0), view("w-c", 0, 0.0)];
        let counter = AtomicUsize::new(0);
        let strategy = RoutingStrategy::ConsistentHash;

        let hash = fp("the same prompt");
        let first = strategy.select(&candidates, &hash, &counter).unwrap();
        for _ in 0..8 {
            assert_eq!(
                strategy.select(&candidates, &hash, &counter).unwrap(),
                first
            );
        }
    }

    #[test]
    fn consistent_hash_survives_unrelated_ring_changes() {
        let full = vec![view("w-a", 0, 0.0), view("w-b", 0, 0.0), view("w-c", 0, 0.0)];
        let counter = AtomicUsize::new(0);
        let strategy = RoutingStrategy::ConsistentHash;
        let hash = fp("sticky");

        let chosen = strategy.select(&full, &hash, &counter).unwrap();
        // Removing a worker the hash did not choose leaves the choice alone.
        let reduced: Vec<WorkerView> = full
            .iter()
            .filter(|w| w.worker_id != chosen)
            .cloned()
            .collect();
        let rechosen = strategy.select(&reduced, &hash, &counter).unwrap();
        assert_ne!(rechosen, chosen);

        let without_other: Vec<WorkerView> = full
            .iter()
            .filter(|w| w.worker_id == chosen || w.worker_id == rechosen)
            .cloned()
            .collect();
        assert_eq!(
            strategy.select(&without_other, &hash, &counter).unwrap(),
            chosen
        );
    }
}
