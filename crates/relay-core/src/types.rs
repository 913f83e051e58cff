//! Plain data shared by the session layer, the optimizer and the transport capability.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeSet, fmt};

/// The chain and API interface a session manager serves.
///
/// One `ConsumerSessionManager` exists per `RpcEndpoint`; this value never changes
/// for the lifetime of the manager.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RpcEndpoint {
    /// Local listen address of the RPC endpoint being served.
    #[serde(default)]
    pub network_address: String,
    /// Chain (spec) identifier, e.g. `"ETH1"`.
    pub chain_id: String,
    /// API interface, e.g. `"jsonrpc"`, `"rest"`, `"grpc"`.
    pub api_interface: String,
    #[serde(default)]
    pub geolocation: u64,
}

impl RpcEndpoint {
    #[must_use]
    pub fn new(chain_id: impl Into<String>, api_interface: impl Into<String>) -> Self {
        Self {
            network_address: String::new(),
            chain_id: chain_id.into(),
            api_interface: api_interface.into(),
            geolocation: 0,
        }
    }

    /// Returns the key used to tell endpoints apart in logs and metrics.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}{}", self.chain_id, self.api_interface)
    }
}

/// Latency, availability and sync scores in the `[0, 1]` range.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct QualityOfServiceReport {
    pub latency: f64,
    pub availability: f64,
    pub sync: f64,
}

impl QualityOfServiceReport {
    #[must_use]
    pub fn perfect() -> Self {
        Self { latency: 1.0, availability: 1.0, sync: 1.0 }
    }
}

/// Complaint about a provider, embedded in payment/report messages sent to the chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportedProvider {
    pub address: String,
    pub disconnections: u64,
    pub errors: u64,
    /// Unix timestamp (seconds) of the first report this epoch.
    pub timestamp_s: i64,
}

/// Static description of one provider endpoint, as published in the pairing.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EndpointInfo {
    /// Host and port to dial.
    pub network_address: String,
    #[serde(default)]
    pub addons: BTreeSet<String>,
    #[serde(default)]
    pub extensions: BTreeSet<String>,
}

impl EndpointInfo {
    #[must_use]
    pub fn new(network_address: impl Into<String>) -> Self {
        Self { network_address: network_address.into(), ..Self::default() }
    }

    #[must_use]
    pub fn with_addon(mut self, addon: impl Into<String>) -> Self {
        self.addons.insert(addon.into());
        self
    }

    #[must_use]
    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extensions.insert(extension.into());
        self
    }
}

/// One provider of the epoch pairing handed to `update_all_providers`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingEntry {
    pub public_address: String,
    pub endpoints: Vec<EndpointInfo>,
    /// Per-epoch compute unit ceiling computed chain-side for this consumer/provider pair.
    pub max_compute_units: u64,
}

impl PairingEntry {
    #[must_use]
    pub fn new(
        public_address: impl Into<String>,
        endpoints: Vec<EndpointInfo>,
        max_compute_units: u64,
    ) -> Self {
        Self { public_address: public_address.into(), endpoints, max_compute_units }
    }
}

/// Lightweight versioned health request sent to a provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeRequest {
    pub guid: u64,
    pub spec_id: String,
    pub api_interface: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResponse {
    /// Must echo the request guid.
    pub guid: u64,
    pub latest_block: i64,
    /// Provider software version, reported for diagnostics only.
    pub version: Option<String>,
}

/// A relay addressed to a locked session.
#[derive(Debug, Clone)]
pub struct RelayRequest {
    pub session_id: i64,
    pub relay_num: u64,
    pub compute_units: u64,
    pub epoch: u64,
    pub data: Bytes,
}

#[derive(Debug, Clone)]
pub struct RelayReply {
    pub data: Bytes,
    pub latest_block: i64,
}

/// How many distinct providers a single request needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsistencyMode {
    /// One provider chosen by the optimizer.
    #[default]
    Default,
    /// Every valid provider, used for stateful requests that must reach the whole pairing.
    SelectAllProviders,
}

/// Cache key for an (addon, extensions) combination.
///
/// Extensions are sorted and de-duplicated so that the same combination always maps
/// to the same key regardless of the order the caller supplied them in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RouterKey(String);

impl RouterKey {
    pub const SEPARATOR: char = '|';

    #[must_use]
    pub fn new(addon: &str, extensions: &[String]) -> Self {
        let mut parts: BTreeSet<&str> =
            extensions.iter().map(String::as_str).filter(|e| !e.is_empty()).collect();
        if !addon.is_empty() {
            parts.insert(addon);
        }

        let mut key = String::from(Self::SEPARATOR);
        for part in parts {
            key.push_str(part);
            key.push(Self::SEPARATOR);
        }
        Self(key)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns `true` for the key of the plain (no addon, no extension) combination.
    #[must_use]
    pub fn is_base(&self) -> bool {
        self.0.len() == 1
    }
}

impl fmt::Display for RouterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
