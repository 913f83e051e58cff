//! Consumer-side QoS metrics.
//!
//! The session manager reports per-session QoS through an optional
//! [`QosMetricsSink`]. [`MetricsQosSink`] forwards those reports to the `metrics`
//! facade, so any installed recorder (Prometheus or otherwise) picks them up. Session
//! lifecycle events are recorded as counters through the free functions below
//! whether or not a sink is installed.

use crate::types::QualityOfServiceReport;
use dashmap::DashSet;
use metrics::{counter, gauge};

/// QoS state of a session right after a relay outcome was recorded.
#[derive(Debug, Clone, PartialEq)]
pub struct QosSample<'a> {
    pub chain_id: &'a str,
    pub api_interface: &'a str,
    pub provider: &'a str,
    pub qos: Option<QualityOfServiceReport>,
    pub excellence_qos: Option<QualityOfServiceReport>,
    pub latest_block: i64,
    pub relay_num: u64,
}

/// Receives per-session QoS updates.
pub trait QosMetricsSink: Send + Sync {
    fn set_qos_metrics(&self, sample: &QosSample<'_>);

    /// Called on every epoch update; values of the previous pairing are stale.
    fn reset_qos_metrics(&self, chain_id: &str);
}

/// [`QosMetricsSink`] backed by `metrics` gauges.
#[derive(Debug, Default)]
pub struct MetricsQosSink {
    /// (chain, api interface, provider) label sets with a published value.
    published: DashSet<(String, String, String)>,
}

impl MetricsQosSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn set_report(
        chain_id: &str,
        api_interface: &str,
        provider: &str,
        prefix: &str,
        report: &QualityOfServiceReport,
    ) {
        for (name, value) in [
            ("latency", report.latency),
            ("availability", report.availability),
            ("sync", report.sync),
        ] {
            gauge!(
                format!("relay_consumer_{prefix}_{name}"),
                "chain_id" => chain_id.to_string(),
                "api_interface" => api_interface.to_string(),
                "provider" => provider.to_string()
            )
            .set(value);
        }
    }
}

impl QosMetricsSink for MetricsQosSink {
    #[allow(clippy::cast_precision_loss)]
    fn set_qos_metrics(&self, sample: &QosSample<'_>) {
        if let Some(qos) = &sample.qos {
            Self::set_report(sample.chain_id, sample.api_interface, sample.provider, "qos", qos);
        }
        if let Some(excellence) = &sample.excellence_qos {
            Self::set_report(
                sample.chain_id,
                sample.api_interface,
                sample.provider,
                "qos_excellence",
                excellence,
            );
        }
        gauge!(
            "relay_consumer_latest_provider_block",
            "chain_id" => sample.chain_id.to_string(),
            "api_interface" => sample.api_interface.to_string(),
            "provider" => sample.provider.to_string()
        )
        .set(sample.latest_block as f64);
        gauge!(
            "relay_consumer_session_relay_num",
            "chain_id" => sample.chain_id.to_string(),
            "api_interface" => sample.api_interface.to_string(),
            "provider" => sample.provider.to_string()
        )
        .set(sample.relay_num as f64);

        self.published.insert((
            sample.chain_id.to_string(),
            sample.api_interface.to_string(),
            sample.provider.to_string(),
        ));
    }

    fn reset_qos_metrics(&self, chain_id: &str) {
        let stale: Vec<_> = self
            .published
            .iter()
            .filter(|key| key.0 == chain_id)
            .map(|key| key.key().clone())
            .collect();
        let zero = QualityOfServiceReport::default();
        for key in stale {
            let (chain, api_interface, provider) = &key;
            Self::set_report(chain, api_interface, provider, "qos", &zero);
            Self::set_report(chain, api_interface, provider, "qos_excellence", &zero);
            self.published.remove(&key);
        }
    }
}

pub fn record_provider_blocked(chain_id: &str, reported: bool) {
    counter!(
        "relay_consumer_providers_blocked_total",
        "chain_id" => chain_id.to_string(),
        "reported" => if reported { "true" } else { "false" }
    )
    .increment(1);
}

pub fn record_session_block_listed(chain_id: &str, reason: &'static str) {
    counter!(
        "relay_consumer_sessions_block_listed_total",
        "chain_id" => chain_id.to_string(),
        "reason" => reason
    )
    .increment(1);
}

pub fn record_pairing_reset(chain_id: &str) {
    counter!("relay_consumer_pairing_resets_total", "chain_id" => chain_id.to_string()).increment(1);
}

pub fn record_epoch_update(chain_id: &str, providers: usize) {
    counter!("relay_consumer_epoch_updates_total", "chain_id" => chain_id.to_string()).increment(1);
    #[allow(clippy::cast_precision_loss)]
    gauge!("relay_consumer_pairing_size", "chain_id" => chain_id.to_string()).set(providers as f64);
}

pub fn record_relay_failure(chain_id: &str, failure: &'static str) {
    counter!(
        "relay_consumer_relay_failures_total",
        "chain_id" => chain_id.to_string(),
        "failure" => failure
    )
    .increment(1);
}

pub fn record_probe(chain_id: &str, success: bool) {
    counter!(
        "relay_consumer_probes_total",
        "chain_id" => chain_id.to_string(),
        "success" => if success { "true" } else { "false" }
    )
    .increment(1);
}
