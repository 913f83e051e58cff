//! Multi-factor scoring optimizer.
//!
//! Scores providers from p90 latency, availability (successes over attempts) and
//! block lag relative to the highest block any provider reported. Providers with no
//! data score as perfect so that new pairings get explored.

use super::{latency_tracker::LatencyTracker, OptimizerStrategy, ProviderOptimizer};
use crate::types::QualityOfServiceReport;
use arc_swap::ArcSwap;
use dashmap::DashMap;
use rand::{seq::IndexedRandom, Rng};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tracing::{debug, trace};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default)]
    pub strategy: OptimizerStrategy,

    /// Latency samples kept per provider (default: 200)
    #[serde(default = "default_latency_window")]
    pub latency_window: usize,

    /// Samples needed before an excellence report is produced (default: 5)
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,

    /// Block lag at which the sync factor drops to zero (default: 5)
    #[serde(default = "default_max_block_lag")]
    pub max_block_lag: u64,

    #[serde(default)]
    pub weights: OptimizerWeights,
}

fn default_latency_window() -> usize {
    200
}
fn default_min_samples() -> usize {
    5
}
fn default_max_block_lag() -> u64 {
    5
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            strategy: OptimizerStrategy::default(),
            latency_window: 200,
            min_samples: 5,
            max_block_lag: 5,
            weights: OptimizerWeights::default(),
        }
    }
}

/// Exponents applied to each factor of the composite score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerWeights {
    /// Latency factor weight (default: 8.0)
    #[serde(default = "default_latency_weight")]
    pub latency: f64,

    /// Availability factor weight (default: 4.0)
    #[serde(default = "default_availability_weight")]
    pub availability: f64,

    /// Sync factor weight (default: 2.0)
    #[serde(default = "default_sync_weight")]
    pub sync: f64,
}

fn default_latency_weight() -> f64 {
    8.0
}
fn default_availability_weight() -> f64 {
    4.0
}
fn default_sync_weight() -> f64 {
    2.0
}

impl Default for OptimizerWeights {
    fn default() -> Self {
        Self { latency: 8.0, availability: 4.0, sync: 2.0 }
    }
}

impl OptimizerWeights {
    /// Weights with the factor the strategy favours doubled.
    fn for_strategy(&self, strategy: OptimizerStrategy) -> Self {
        let mut weights = self.clone();
        match strategy {
            OptimizerStrategy::Latency => weights.latency *= 2.0,
            OptimizerStrategy::SyncFreshness => weights.sync *= 2.0,
            OptimizerStrategy::Accuracy => weights.availability *= 2.0,
            _ => {}
        }
        weights
    }
}

struct ProviderStats {
    latency: LatencyTracker,
    successes: AtomicU64,
    failures: AtomicU64,
    latest_synced_block: AtomicU64,
    compute_units: AtomicU64,
}

impl ProviderStats {
    fn new(latency_window: usize) -> Self {
        Self {
            latency: LatencyTracker::new(latency_window),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            latest_synced_block: AtomicU64::new(0),
            compute_units: AtomicU64::new(0),
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn availability(&self) -> f64 {
        let successes = self.successes.load(Ordering::Relaxed);
        let total = successes + self.failures.load(Ordering::Relaxed);
        if total == 0 {
            return 1.0;
        }
        successes as f64 / total as f64
    }
}

/// Computed score of a provider.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderScore {
    pub provider: Arc<str>,
    pub composite_score: f64,
    pub latency_factor: f64,
    pub availability_factor: f64,
    pub sync_factor: f64,
    pub latency_p90: Option<Duration>,
    pub block_lag: u64,
    pub samples: usize,
}

/// Default [`ProviderOptimizer`].
///
/// Stats are kept per provider address in a `DashMap` and survive epoch changes, so
/// a provider paired again keeps its history.
pub struct ScoringOptimizer {
    config: ArcSwap<OptimizerConfig>,
    stats: DashMap<String, Arc<ProviderStats>>,
    highest_block: AtomicU64,
}

impl ScoringOptimizer {
    #[must_use]
    pub fn new(config: OptimizerConfig) -> Self {
        Self {
            config: ArcSwap::from_pointee(config),
            stats: DashMap::new(),
            highest_block: AtomicU64::new(0),
        }
    }

    pub fn update_config(&self, config: OptimizerConfig) {
        self.config.store(Arc::new(config));
    }

    #[must_use]
    pub fn config(&self) -> OptimizerConfig {
        (**self.config.load()).clone()
    }

    fn get_or_create_stats(&self, provider: &str) -> Arc<ProviderStats> {
        if let Some(entry) = self.stats.get(provider) {
            return Arc::clone(entry.value());
        }
        let window = self.config.load().latency_window;
        Arc::clone(
            self.stats
                .entry(provider.to_string())
                .or_insert_with(|| Arc::new(ProviderStats::new(window)))
                .value(),
        )
    }

    /// Returns the score of `provider`; unknown providers score as perfect.
    #[must_use]
    pub fn score(&self, provider: &str) -> ProviderScore {
        let config = self.config.load();
        let weights = config.weights.for_strategy(config.strategy);
        let Some(stats) = self.stats.get(provider).map(|e| Arc::clone(e.value())) else {
            return ProviderScore {
                provider: Arc::from(provider),
                composite_score: 1.0,
                latency_factor: 1.0,
                availability_factor: 1.0,
                sync_factor: 1.0,
                latency_p90: None,
                block_lag: 0,
                samples: 0,
            };
        };

        let latency_p90 = stats.latency.percentile(0.9);
        let latency_factor = Self::latency_factor(latency_p90);
        let availability_factor = stats.availability();
        let block_lag = self
            .highest_block
            .load(Ordering::Relaxed)
            .saturating_sub(stats.latest_synced_block.load(Ordering::Relaxed));
        let sync_factor = Self::sync_factor(block_lag, config.max_block_lag);

        let composite_score = latency_factor.powf(weights.latency) *
            availability_factor.powf(weights.availability) *
            sync_factor.powf(weights.sync);

        ProviderScore {
            provider: Arc::from(provider),
            composite_score,
            latency_factor,
            availability_factor,
            sync_factor,
            latency_p90,
            block_lag,
            samples: stats.latency.sample_count(),
        }
    }

    /// Log2 scaling over ~16s, clamped to a minimum of 0.1.
    #[allow(clippy::cast_precision_loss)]
    fn latency_factor(p90: Option<Duration>) -> f64 {
        let Some(p90) = p90 else {
            return 1.0;
        };
        let millis = p90.as_millis() as f64;
        if millis < 1.0 {
            return 1.0;
        }
        (1.0 - millis.log2() / 14.0).clamp(0.1, 1.0)
    }

    #[allow(clippy::cast_precision_loss)]
    fn sync_factor(block_lag: u64, max_block_lag: u64) -> f64 {
        if block_lag == 0 {
            return 1.0;
        }
        if max_block_lag == 0 {
            return 0.0;
        }
        let penalty = (block_lag as f64 / max_block_lag as f64).min(1.0);
        1.0 - penalty
    }

    /// Every tracked provider with its composite score, best first.
    #[must_use]
    pub fn ranked_providers(&self) -> Vec<(String, f64)> {
        let providers: Vec<String> = self.stats.iter().map(|entry| entry.key().clone()).collect();
        let mut scores: Vec<_> = providers
            .into_iter()
            .map(|provider| {
                let score = self.score(&provider).composite_score;
                (provider, score)
            })
            .collect();
        scores.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scores
    }

    /// Compute units observed per provider.
    #[must_use]
    pub fn compute_units_served(&self, provider: &str) -> u64 {
        self.stats.get(provider).map_or(0, |s| s.compute_units.load(Ordering::Relaxed))
    }

    pub fn clear(&self) {
        self.stats.clear();
        self.highest_block.store(0, Ordering::Relaxed);
    }
}

impl Default for ScoringOptimizer {
    fn default() -> Self {
        Self::new(OptimizerConfig::default())
    }
}

impl ProviderOptimizer for ScoringOptimizer {
    fn strategy(&self) -> OptimizerStrategy {
        self.config.load().strategy
    }

    fn choose_provider(
        &self,
        candidates: &[Arc<str>],
        ignored: &HashSet<Arc<str>>,
        _compute_units: u64,
        _requested_block: i64,
        perturbation: f64,
    ) -> Vec<Arc<str>> {
        let eligible: Vec<&Arc<str>> =
            candidates.iter().filter(|c| !ignored.contains(*c)).collect();
        if eligible.is_empty() {
            return Vec::new();
        }

        let mut rng = rand::rng();
        if matches!(self.strategy(), OptimizerStrategy::Privacy | OptimizerStrategy::Distributed) {
            return eligible.choose(&mut rng).map(|c| vec![Arc::clone(c)]).unwrap_or_default();
        }

        let mut best: Option<(&Arc<str>, f64)> = None;
        for candidate in eligible {
            let mut score = self.score(candidate).composite_score;
            if perturbation > 0.0 {
                score *= 1.0 + rng.random_range(-perturbation..=perturbation);
            }
            trace!(provider = %candidate, score, "scored provider candidate");
            if best.map_or(true, |(_, top)| score > top) {
                best = Some((candidate, score));
            }
        }

        best.map(|(provider, score)| {
            debug!(provider = %provider, score, "optimizer chose provider");
            vec![Arc::clone(provider)]
        })
        .unwrap_or_default()
    }

    fn append_probe_relay_data(&self, provider: &str, latency: Duration, success: bool) {
        let stats = self.get_or_create_stats(provider);
        if success {
            stats.successes.fetch_add(1, Ordering::Relaxed);
            stats.latency.record(latency);
        } else {
            stats.failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn append_relay_data(
        &self,
        provider: &str,
        latency: Duration,
        is_hanging_api: bool,
        compute_units: u64,
        synced_block: u64,
    ) {
        let stats = self.get_or_create_stats(provider);
        stats.successes.fetch_add(1, Ordering::Relaxed);
        stats.compute_units.fetch_add(compute_units, Ordering::Relaxed);
        // Hanging APIs wait for new blocks; their latency says nothing about the provider.
        if !is_hanging_api {
            stats.latency.record(latency);
        }
        if synced_block > 0 {
            stats.latest_synced_block.fetch_max(synced_block, Ordering::Relaxed);
            self.highest_block.fetch_max(synced_block, Ordering::Relaxed);
        }
    }

    fn append_relay_failure(&self, provider: &str) {
        self.get_or_create_stats(provider).failures.fetch_add(1, Ordering::Relaxed);
    }

    fn excellence_qos_report(&self, provider: &str) -> Option<QualityOfServiceReport> {
        let samples = self.stats.get(provider)?.latency.sample_count();
        if samples < self.config.load().min_samples {
            return None;
        }
        let score = self.score(provider);
        Some(QualityOfServiceReport {
            latency: score.latency_factor,
            availability: score.availability_factor,
            sync: score.sync_factor,
        })
    }
}
