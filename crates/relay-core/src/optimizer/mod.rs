//! Provider selection capability.
//!
//! The session manager asks a [`ProviderOptimizer`] which provider should serve a
//! request and feeds it every probe, relay success and relay failure it observes. The
//! default implementation, [`ScoringOptimizer`], ranks providers by latency
//! percentiles, availability and block sync.

pub mod latency_tracker;
pub mod scoring;

pub use latency_tracker::LatencyTracker;
pub use scoring::{OptimizerConfig, OptimizerWeights, ProviderScore, ScoringOptimizer};

use crate::types::QualityOfServiceReport;
use serde::{Deserialize, Serialize};
use std::{collections::HashSet, sync::Arc, time::Duration};

/// Selection policy of an optimizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerStrategy {
    #[default]
    Balanced,
    Latency,
    SyncFreshness,
    /// Spend as few compute units as possible. Never fans out to every provider.
    Cost,
    /// Spread requests randomly so no single provider sees the consumer's traffic.
    Privacy,
    Accuracy,
    Distributed,
}

impl OptimizerStrategy {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Balanced => "balanced",
            Self::Latency => "latency",
            Self::SyncFreshness => "sync_freshness",
            Self::Cost => "cost",
            Self::Privacy => "privacy",
            Self::Accuracy => "accuracy",
            Self::Distributed => "distributed",
        }
    }
}

/// Chooses providers and learns from relay outcomes.
///
/// Implementations must be cheap and must not call back into the session manager:
/// `choose_provider` runs under the pairing read lock and every completion callback
/// feeds the optimizer synchronously.
pub trait ProviderOptimizer: Send + Sync {
    fn strategy(&self) -> OptimizerStrategy;

    /// Picks providers from `candidates`, skipping any in `ignored`. Returns an empty
    /// list when nothing is eligible.
    ///
    /// `perturbation` is the relative noise added to scores so that near-equal
    /// providers share load.
    fn choose_provider(
        &self,
        candidates: &[Arc<str>],
        ignored: &HashSet<Arc<str>>,
        compute_units: u64,
        requested_block: i64,
        perturbation: f64,
    ) -> Vec<Arc<str>>;

    fn append_probe_relay_data(&self, provider: &str, latency: Duration, success: bool);

    fn append_relay_data(
        &self,
        provider: &str,
        latency: Duration,
        is_hanging_api: bool,
        compute_units: u64,
        synced_block: u64,
    );

    fn append_relay_failure(&self, provider: &str);

    /// Returns the optimizer's current opinion of `provider`, attached to relays
    /// after the first one on a session.
    fn excellence_qos_report(&self, provider: &str) -> Option<QualityOfServiceReport>;
}
