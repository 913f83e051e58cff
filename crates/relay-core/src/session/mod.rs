//! Consumer session management.
//!
//! A [`ConsumerSessionManager`] owns the provider pairing of one RPC endpoint for
//! the current epoch. Callers lock sessions with
//! [`get_sessions`](ConsumerSessionManager::get_sessions), send relays through the
//! returned [`SessionGuard`]s, and hand every guard back to one of the completion
//! callbacks.

pub mod builder;
pub mod client;
pub mod consumer_session;
pub mod data_reliability;
pub mod errors;
pub mod manager;
pub mod probe;
pub mod provider;
pub mod reported;

pub use builder::{BuilderError, ConsumerSessionManagerBuilder};
pub use client::{ProviderClient, ProviderConnector};
pub use consumer_session::{
    ConsumerSession, QoSInfo, QosParameters, RelayCompletion, SessionGuard, SessionState,
    DATA_RELIABILITY_SESSION_ID,
};
pub use data_reliability::DataReliabilitySession;
pub use errors::{ClientError, RelayFailure, SessionError};
pub use manager::{ConsumerSessionManager, ConsumerSessionsMap, SessionInfo, SessionRequest};
pub use provider::{ConnectedEndpoint, ConsumerSessionsWithProvider, EndpointStatus};
pub use reported::{ReconnectCallback, ReportedProviders};
