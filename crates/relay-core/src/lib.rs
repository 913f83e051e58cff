//! Consumer-side session core of a decentralized RPC relay network.
//!
//! Each epoch the consumer is paired with a set of providers. This crate keeps
//! per-provider sessions, reserves compute units within each provider's allowance,
//! selects providers through a pluggable optimizer, scores their quality of
//! service, and blocks or reports providers that misbehave.

pub mod config;
pub mod metrics;
pub mod optimizer;
pub mod session;
pub mod types;

pub use config::{ConsumerConfig, SessionsConfig};
pub use session::{
    ConsumerSessionManager, ConsumerSessionManagerBuilder, RelayCompletion, RelayFailure,
    SessionError, SessionGuard, SessionRequest,
};
