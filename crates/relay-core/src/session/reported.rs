use super::errors::SessionError;
use crate::types::ReportedProvider;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use std::{collections::HashMap, fmt, sync::Arc, time::Duration};
use tokio::time::Instant;
use tracing::{debug, info};

/// Re-establishes contact with a reported provider. Resolves to `Ok` once the
/// provider answers again.
pub type ReconnectCallback = Arc<dyn Fn() -> BoxFuture<'static, Result<(), SessionError>> + Send + Sync>;

struct ReportEntry {
    disconnections: u64,
    errors: u64,
    added_at: Instant,
    reported_at_s: i64,
    reconnect: Option<ReconnectCallback>,
}

/// Providers flagged during the current epoch, with their accumulated complaints.
///
/// The list is cleared on every epoch update. Each entry may carry a reconnect
/// callback; providers reported for long enough are retried through it and dropped
/// from the list once they answer.
pub struct ReportedProviders {
    entries: RwLock<HashMap<String, ReportEntry>>,
    reconnect_after: Duration,
}

impl ReportedProviders {
    #[must_use]
    pub fn new(reconnect_after: Duration) -> Self {
        Self { entries: RwLock::new(HashMap::new()), reconnect_after }
    }

    pub fn reset(&self) {
        self.entries.write().clear();
    }

    /// Adds a report, merging counts with any earlier report for the same address.
    /// `reconnect` replaces the stored callback when given.
    pub fn report_provider(
        &self,
        address: &str,
        errors: u64,
        disconnections: u64,
        reconnect: Option<ReconnectCallback>,
    ) {
        let mut entries = self.entries.write();
        let entry = entries.entry(address.to_string()).or_insert_with(|| ReportEntry {
            disconnections: 0,
            errors: 0,
            added_at: Instant::now(),
            reported_at_s: chrono::Utc::now().timestamp(),
            reconnect: None,
        });
        entry.errors += errors;
        entry.disconnections += disconnections;
        if reconnect.is_some() {
            entry.reconnect = reconnect;
        }
        info!(
            provider = %address,
            errors = entry.errors,
            disconnections = entry.disconnections,
            "reported provider"
        );
    }

    /// Returns the current reports, ordered by address.
    #[must_use]
    pub fn reported_providers(&self) -> Vec<ReportedProvider> {
        let entries = self.entries.read();
        let mut reports: Vec<_> = entries
            .iter()
            .map(|(address, entry)| ReportedProvider {
                address: address.clone(),
                disconnections: entry.disconnections,
                errors: entry.errors,
                timestamp_s: entry.reported_at_s,
            })
            .collect();
        reports.sort_by(|a, b| a.address.cmp(&b.address));
        reports
    }

    #[must_use]
    pub fn is_reported(&self, address: &str) -> bool {
        self.entries.read().contains_key(address)
    }

    pub fn remove_report(&self, address: &str) -> bool {
        self.entries.write().remove(address).is_some()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Reports older than the reconnect threshold that carry a callback.
    #[must_use]
    pub fn reconnect_candidates(&self) -> Vec<(String, ReconnectCallback)> {
        let entries = self.entries.read();
        entries
            .iter()
            .filter(|(_, entry)| entry.added_at.elapsed() >= self.reconnect_after)
            .filter_map(|(address, entry)| {
                entry.reconnect.as_ref().map(|cb| (address.clone(), Arc::clone(cb)))
            })
            .collect()
    }

    /// Retries each reconnect candidate and removes the ones that answered.
    /// Returns the number of providers removed.
    pub async fn reconnect_providers(&self) -> usize {
        let candidates = self.reconnect_candidates();
        let attempts = candidates.into_iter().map(|(address, reconnect)| async move {
            let result = reconnect().await;
            (address, result)
        });

        let mut recovered = 0;
        for (address, result) in futures::future::join_all(attempts).await {
            match result {
                Ok(()) => {
                    if self.remove_report(&address) {
                        recovered += 1;
                        info!(provider = %address, "reported provider reconnected");
                    }
                }
                Err(err) => {
                    debug!(provider = %address, error = %err, "reported provider still unreachable");
                }
            }
        }
        recovered
    }
}

impl fmt::Debug for ReportedProviders {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReportedProviders")
            .field("len", &self.len())
            .field("reconnect_after", &self.reconnect_after)
            .finish()
    }
}
