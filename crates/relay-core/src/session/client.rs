//! Transport capability the session layer dials providers through.
//!
//! The session manager never speaks a wire protocol itself. It asks a
//! [`ProviderConnector`] for a connection to an endpoint address and uses the
//! returned [`ProviderClient`] to probe the provider. Relays are sent by the caller
//! through [`SessionGuard::client`](super::SessionGuard::client).

use super::errors::ClientError;
use crate::types::{ProbeRequest, ProbeResponse, RelayReply, RelayRequest};
use async_trait::async_trait;
use std::sync::Arc;

/// Opens connections to provider endpoints.
#[async_trait]
pub trait ProviderConnector: Send + Sync {
    /// Dials `network_address`. The caller bounds this with the configured connect timeout.
    async fn connect(&self, network_address: &str) -> Result<Arc<dyn ProviderClient>, ClientError>;
}

/// A live connection to one provider endpoint.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    async fn probe(&self, request: ProbeRequest) -> Result<ProbeResponse, ClientError>;

    async fn relay(&self, request: RelayRequest) -> Result<RelayReply, ClientError>;

    /// Closes the connection. Called once when the connection's epoch is purged.
    async fn close(&self);
}
