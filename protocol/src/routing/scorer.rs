//! # RouteScorer
//!
//! A running quality estimate per peer, updated after every exchange and
//! used to rank forwarding candidates.
//!
//! ## Update rule
//!
//! ```text
//! score_new = α · sample + (1 − α) · score_old        α ∈ (0, 1]
//! ```
//!
//! Untried peers start at the neutral midpoint so a stranger is not ranked
//! below a peer that has already failed a few times.
//!
//! ## Samples
//!
//! How an [`Outcome`] becomes a sample is pluggable through
//! [`SampleMapper`]. The default [`LatencyMapper`] gives:
//!
//! | Outcome                            | Sample                 |
//! |------------------------------------|------------------------|
//! | success, latency ≤ expected        | `1.0`                  |
//! | success, latency > expected        | `expected / latency`   |
//! | replied with an error              | `unanswered_sample`    |
//! | failure or timeout                 | `0.0`                  |
//!
//! ## Ordering
//!
//! Updates for one peer happen under that peer's `DashMap` entry lock, so
//! they apply atomically and in the order they were recorded. The directory
//! mirror and cache write happen under the same lock.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

use crate::cache::{self, Cache};
use crate::config::{
    ScoringConfig, DEFAULT_UNANSWERED_SAMPLE, NEUTRAL_SCORE, SCORE_MAX, SCORE_MIN,
};
use crate::model::{PeerKey, PeerRecord};
use crate::registry::PeerDirectory;

/// What happened on the most recent exchange with a peer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Outcome {
    Success { latency: Duration },
    /// The peer replied, but with an error rather than an answer.
    Unanswered { latency: Duration },
    Failure,
    Timeout,
}

/// Turns an [`Outcome`] into a sample in `[SCORE_MIN, SCORE_MAX]`.
pub trait SampleMapper: Send + Sync {
    fn sample(&self, outcome: &Outcome) -> f64;
}

/// Default latency-based mapping.
#[derive(Debug, Clone)]
pub struct LatencyMapper {
    expected: Duration,
    unanswered: f64,
}

impl LatencyMapper {
    pub fn new(expected: Duration) -> Self {
        Self {
            expected,
            unanswered: DEFAULT_UNANSWERED_SAMPLE,
        }
    }

    pub fn with_unanswered_sample(mut self, sample: f64) -> Self {
        self.unanswered = sample.clamp(SCORE_MIN, SCORE_MAX);
        self
    }
}

impl SampleMapper for LatencyMapper {
    fn sample(&self, outcome: &Outcome) -> f64 {
        match outcome {
            Outcome::Success { latency } if *latency <= self.expected => SCORE_MAX,
            Outcome::Success { latency } => {
                let ratio = self.expected.as_secs_f64() / latency.as_secs_f64();
                (ratio * SCORE_MAX).clamp(SCORE_MIN, SCORE_MAX)
            }
            Outcome::Unanswered { .. } => self.unanswered,
            Outcome::Failure | Outcome::Timeout => SCORE_MIN,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct RouteStats {
    score: f64,
    last_success: Option<DateTime<Utc>>,
}

impl Default for RouteStats {
    fn default() -> Self {
        Self {
            score: NEUTRAL_SCORE,
            last_success: None,
        }
    }
}

/// A candidate with the ranking inputs it was sorted by.
#[derive(Debug, Clone)]
pub struct RankedPeer {
    pub record: PeerRecord,
    pub score: f64,
    pub last_success: Option<DateTime<Utc>>,
}

pub struct RouteScorer {
    alpha: f64,
    mapper: Arc<dyn SampleMapper>,
    cache: Arc<dyn Cache>,
    directory: Arc<PeerDirectory>,
    stats: DashMap<PeerKey, RouteStats>,
}

fn cache_key(key: &PeerKey) -> String {
    format!("route-score:{}:{}", key.network_id, key.peer_id)
}

impl RouteScorer {
    pub fn new(
        config: &ScoringConfig,
        cache: Arc<dyn Cache>,
        directory: Arc<PeerDirectory>,
    ) -> Self {
        Self {
            alpha: config.ema_factor.clamp(f64::MIN_POSITIVE, 1.0),
            mapper: Arc::new(
                LatencyMapper::new(config.expected_latency())
                    .with_unanswered_sample(config.unanswered_sample),
            ),
            cache,
            directory,
            stats: DashMap::new(),
        }
    }

    /// Replace the outcome-to-sample mapping.
    pub fn with_mapper(mut self, mapper: Arc<dyn SampleMapper>) -> Self {
        self.mapper = mapper;
        self
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    /// Map an outcome to a sample and fold it in. Returns the new score.
    pub fn record_outcome(&self, key: &PeerKey, outcome: Outcome) -> f64 {
        let sample = self.mapper.sample(&outcome);
        self.record_sample(key, sample)
    }

    /// Fold a raw sample into the peer's score. Any positive sample counts
    /// as a successful contact for tie-breaking.
    pub fn record_sample(&self, key: &PeerKey, sample: f64) -> f64 {
        let sample = sample.clamp(SCORE_MIN, SCORE_MAX);
        let mut stats = self
            .stats
            .entry(key.clone())
            .or_insert_with(|| self.warm(key));

        let updated = (self.alpha * sample + (1.0 - self.alpha) * stats.score)
            .clamp(SCORE_MIN, SCORE_MAX);
        stats.score = updated;
        if sample > SCORE_MIN {
            let now = Utc::now();
            stats.last_success = Some(now);
            self.directory.mark_seen(key, now);
        }

        cache::set_json(self.cache.as_ref(), &cache_key(key), &*stats, None);
        self.directory.update_score(key, updated);
        trace!(peer = %key, sample, score = updated, "route score updated");
        updated
    }

    /// Current score; neutral for peers never scored.
    pub fn score(&self, key: &PeerKey) -> f64 {
        match self.stats.get(key) {
            Some(stats) => stats.score,
            None => self.warm(key).score,
        }
    }

    fn last_success(&self, key: &PeerKey) -> Option<DateTime<Utc>> {
        match self.stats.get(key) {
            Some(stats) => stats.last_success,
            None => self.warm(key).last_success,
        }
    }

    /// Whatever survived in the cache, else neutral.
    fn warm(&self, key: &PeerKey) -> RouteStats {
        cache::get_json::<RouteStats>(self.cache.as_ref(), &cache_key(key))
            .filter(|s| s.score.is_finite())
            .map(|mut s| {
                s.score = s.score.clamp(SCORE_MIN, SCORE_MAX);
                s
            })
            .unwrap_or_default()
    }

    /// Sort by score descending; ties go to the most recent successful
    /// contact, then to peer id so the order is deterministic.
    pub fn ranked_candidates(&self, peers: Vec<PeerRecord>) -> Vec<RankedPeer> {
        let mut ranked: Vec<_> = peers
            .into_iter()
            .map(|record| {
                let key = record.key();
                RankedPeer {
                    score: self.score(&key),
                    last_success: self.last_success(&key),
                    record,
                }
            })
            .collect();

        ranked.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| b.last_success.cmp(&a.last_success))
                .then_with(|| a.record.peer_id.cmp(&b.record.peer_id))
        });
        ranked
    }

    /// Drop everything known about a peer, e.g. after revocation.
    pub fn forget(&self, key: &PeerKey) {
        self.stats.remove(key);
        self.cache.expire(&cache_key(key));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::crypto::keys::NodeKeypair;
    use crate::registry::{NetworkRegistry, NewNetwork};
    use crate::storage::{MemoryStore, Store};

    struct Fixture {
        scorer: RouteScorer,
        directory: Arc<PeerDirectory>,
        cache: Arc<dyn Cache>,
        network_id: String,
    }

    fn fixture(alpha: f64) -> Fixture {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let networks = Arc::new(NetworkRegistry::load(store.clone(), 8).unwrap());
        let network_id = networks.create_network(NewNetwork::default()).unwrap().id;
        let directory = Arc::new(PeerDirectory::load(store, networks).unwrap());
        let cache: Arc<dyn Cache> = Arc::new(MemoryCache::default());
        let config = ScoringConfig {
            ema_factor: alpha,
            expected_latency_ms: 100,
            ..Default::default()
        };
        Fixture {
            scorer: RouteScorer::new(&config, cache.clone(), directory.clone()),
            directory,
            cache,
            network_id,
        }
    }

    fn peer(f: &Fixture) -> PeerRecord {
        let record = PeerRecord::new(
            f.network_id.as_str(),
            NodeKeypair::generate().public_key(),
            "http://p",
        );
        f.directory.enroll(record).unwrap()
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-12
    }

    #[test]
    fn single_sample_follows_the_formula() {
        let f = fixture(0.3);
        let key = peer(&f).key();
        for sample in [0.0, 0.2, 0.5, 1.0] {
            f.scorer.forget(&key);
            let score = f.scorer.record_sample(&key, sample);
            assert!(close(score, 0.3 * sample + 0.7 * NEUTRAL_SCORE));
        }
    }

    #[test]
    fn identical_samples_converge_monotonically() {
        let f = fixture(0.3);
        let key = peer(&f).key();
        let target = 0.9;
        let mut previous = f.scorer.score(&key);
        for _ in 0..60 {
            let next = f.scorer.record_sample(&key, target);
            assert!(next >= previous);
            assert!(next <= target + 1e-12);
            previous = next;
        }
        assert!((previous - target).abs() < 1e-6);

        let mut previous = previous;
        for _ in 0..60 {
            let next = f.scorer.record_sample(&key, 0.0);
            assert!(next <= previous);
            previous = next;
        }
        assert!(previous < 1e-6);
    }

    #[test]
    fn alpha_one_replaces_the_score() {
        let f = fixture(1.0);
        let key = peer(&f).key();
        assert!(close(f.scorer.record_sample(&key, 0.25), 0.25));
        assert!(close(f.scorer.record_sample(&key, 0.75), 0.75));
    }

    #[test]
    fn out_of_range_samples_are_clamped() {
        let f = fixture(1.0);
        let key = peer(&f).key();
        assert!(close(f.scorer.record_sample(&key, 7.0), SCORE_MAX));
        assert!(close(f.scorer.record_sample(&key, -3.0), SCORE_MIN));
    }

    #[test]
    fn latency_mapping() {
        let mapper = LatencyMapper::new(Duration::from_millis(100));
        let fast = Outcome::Success {
            latency: Duration::from_millis(40),
        };
        let slow = Outcome::Success {
            latency: Duration::from_millis(400),
        };
        assert!(close(mapper.sample(&fast), 1.0));
        assert!(close(mapper.sample(&slow), 0.25));
        assert!(close(mapper.sample(&Outcome::Failure), 0.0));
        assert!(close(mapper.sample(&Outcome::Timeout), 0.0));

        let unanswered = Outcome::Unanswered {
            latency: Duration::from_millis(5),
        };
        assert!(close(mapper.sample(&unanswered), DEFAULT_UNANSWERED_SAMPLE));
        let strict = mapper.with_unanswered_sample(0.0);
        assert!(close(strict.sample(&unanswered), 0.0));
    }

    #[test]
    fn outcome_updates_directory_and_cache() {
        let f = fixture(0.5);
        let key = peer(&f).key();
        let score = f.scorer.record_outcome(&key, Outcome::Failure);
        assert!(close(score, 0.25));
        assert!(close(f.directory.get_peer(&key).unwrap().score, 0.25));
        assert!(f.cache.get(&cache_key(&key)).is_some());
    }

    #[test]
    fn cached_scores_warm_a_fresh_scorer() {
        let f = fixture(0.5);
        let key = peer(&f).key();
        f.scorer.record_sample(&key, 1.0);

        let config = ScoringConfig {
            ema_factor: 0.5,
            expected_latency_ms: 100,
            ..Default::default()
        };
        let fresh = RouteScorer::new(&config, f.cache.clone(), f.directory.clone());
        assert!(close(fresh.score(&key), 0.75));

        f.cache.expire(&cache_key(&key));
        let cold = RouteScorer::new(&config, f.cache.clone(), f.directory.clone());
        assert!(close(cold.score(&key), NEUTRAL_SCORE));
    }

    #[test]
    fn ranking_orders_by_score_then_recency() {
        let f = fixture(1.0);
        let high = peer(&f);
        let mid_old = peer(&f);
        let mid_new = peer(&f);
        let low = peer(&f);

        f.scorer.record_sample(&high.key(), 0.9);
        f.scorer.record_sample(&mid_old.key(), 0.5);
        std::thread::sleep(Duration::from_millis(5));
        f.scorer.record_sample(&mid_new.key(), 0.5);
        f.scorer.record_sample(&low.key(), 0.2);

        let ranked = f.scorer.ranked_candidates(vec![
            low.clone(),
            mid_old.clone(),
            high.clone(),
            mid_new.clone(),
        ]);
        let order: Vec<_> = ranked.iter().map(|r| r.record.peer_id.clone()).collect();
        assert_eq!(
            order,
            vec![high.peer_id, mid_new.peer_id, mid_old.peer_id, low.peer_id]
        );
    }

    #[test]
    fn unscored_peers_rank_at_neutral() {
        let f = fixture(1.0);
        let good = peer(&f);
        let bad = peer(&f);
        let unknown = peer(&f);
        f.scorer.record_sample(&good.key(), 0.8);
        f.scorer.record_sample(&bad.key(), 0.1);

        let ranked = f
            .scorer
            .ranked_candidates(vec![bad.clone(), unknown.clone(), good.clone()]);
        assert_eq!(ranked[1].record.peer_id, unknown.peer_id);
        assert!(close(ranked[1].score, NEUTRAL_SCORE));
    }

    #[test]
    fn concurrent_updates_for_one_peer_all_land() {
        let f = Arc::new(fixture(1.0));
        let key = peer(&f).key();
        std::thread::scope(|scope| {
            for _ in 0..8 {
                let f = f.clone();
                let key = key.clone();
                scope.spawn(move || {
                    for _ in 0..100 {
                        f.scorer.record_sample(&key, 0.6);
                    }
                });
            }
        });
        assert!(close(f.scorer.score(&key), 0.6));
    }
}
