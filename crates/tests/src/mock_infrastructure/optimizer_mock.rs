//! Recording Provider Optimizer
//!
//! Picks providers in a fixed preference order so tests know which provider a
//! request lands on, and records everything the session manager feeds it.

use parking_lot::Mutex;
use relay_core::{
    optimizer::{OptimizerStrategy, ProviderOptimizer},
    types::QualityOfServiceReport,
};
use std::{collections::HashSet, sync::Arc, time::Duration};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedProbe {
    pub provider: String,
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRelay {
    pub provider: String,
    pub compute_units: u64,
    pub synced_block: u64,
    pub hanging_api: bool,
}

pub struct MockOptimizer {
    strategy: OptimizerStrategy,
    preferred: Mutex<Vec<String>>,
    excellence: Mutex<Option<QualityOfServiceReport>>,
    probes: Mutex<Vec<RecordedProbe>>,
    relays: Mutex<Vec<RecordedRelay>>,
    failures: Mutex<Vec<String>>,
}

impl Default for MockOptimizer {
    fn default() -> Self {
        Self::new(OptimizerStrategy::Balanced)
    }
}

impl MockOptimizer {
    #[must_use]
    pub fn new(strategy: OptimizerStrategy) -> Self {
        Self {
            strategy,
            preferred: Mutex::new(Vec::new()),
            excellence: Mutex::new(None),
            probes: Mutex::new(Vec::new()),
            relays: Mutex::new(Vec::new()),
            failures: Mutex::new(Vec::new()),
        }
    }

    /// Providers to choose first, in order. Candidates not listed come after, in
    /// the order the manager passed them.
    pub fn prefer(&self, providers: &[&str]) {
        *self.preferred.lock() = providers.iter().map(ToString::to_string).collect();
    }

    pub fn set_excellence_report(&self, report: QualityOfServiceReport) {
        *self.excellence.lock() = Some(report);
    }

    #[must_use]
    pub fn probes(&self) -> Vec<RecordedProbe> {
        self.probes.lock().clone()
    }

    #[must_use]
    pub fn relays(&self) -> Vec<RecordedRelay> {
        self.relays.lock().clone()
    }

    #[must_use]
    pub fn failures(&self) -> Vec<String> {
        self.failures.lock().clone()
    }
}

impl ProviderOptimizer for MockOptimizer {
    fn strategy(&self) -> OptimizerStrategy {
        self.strategy
    }

    fn choose_provider(
        &self,
        candidates: &[Arc<str>],
        ignored: &HashSet<Arc<str>>,
        _compute_units: u64,
        _requested_block: i64,
        _perturbation: f64,
    ) -> Vec<Arc<str>> {
        let eligible: Vec<&Arc<str>> =
            candidates.iter().filter(|c| !ignored.contains(*c)).collect();

        let preferred = self.preferred.lock();
        let chosen = preferred
            .iter()
            .find_map(|p| eligible.iter().copied().find(|c| &***c == p.as_str()))
            .or_else(|| eligible.first().copied());
        chosen.map(|c| vec![Arc::clone(c)]).unwrap_or_default()
    }

    fn append_probe_relay_data(&self, provider: &str, _latency: Duration, success: bool) {
        self.probes.lock().push(RecordedProbe { provider: provider.to_string(), success });
    }

    fn append_relay_data(
        &self,
        provider: &str,
        _latency: Duration,
        is_hanging_api: bool,
        compute_units: u64,
        synced_block: u64,
    ) {
        self.relays.lock().push(RecordedRelay {
            provider: provider.to_string(),
            compute_units,
            synced_block,
            hanging_api: is_hanging_api,
        });
    }

    fn append_relay_failure(&self, provider: &str) {
        self.failures.lock().push(provider.to_string());
    }

    fn excellence_qos_report(&self, _provider: &str) -> Option<QualityOfServiceReport> {
        *self.excellence.lock()
    }
}
