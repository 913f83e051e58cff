use super::{client::ProviderConnector, manager::ConsumerSessionManager};
use crate::{
    config::SessionsConfig,
    metrics::QosMetricsSink,
    optimizer::{ProviderOptimizer, ScoringOptimizer},
    types::RpcEndpoint,
};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum BuilderError {
    #[error("rpc endpoint is required")]
    MissingRpcEndpoint,

    #[error("provider connector is required")]
    MissingConnector,

    #[error("invalid sessions config: {0}")]
    InvalidConfig(String),
}

/// Builds a [`ConsumerSessionManager`].
///
/// The RPC endpoint and connector are required. Without an optimizer a
/// [`ScoringOptimizer`] with default settings is used; without a metrics sink QoS
/// reports are not published.
#[derive(Default)]
pub struct ConsumerSessionManagerBuilder {
    rpc_endpoint: Option<RpcEndpoint>,
    config: SessionsConfig,
    connector: Option<Arc<dyn ProviderConnector>>,
    optimizer: Option<Arc<dyn ProviderOptimizer>>,
    metrics: Option<Arc<dyn QosMetricsSink>>,
}

impl ConsumerSessionManagerBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_rpc_endpoint(mut self, rpc_endpoint: RpcEndpoint) -> Self {
        self.rpc_endpoint = Some(rpc_endpoint);
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: SessionsConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn with_connector(mut self, connector: Arc<dyn ProviderConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    #[must_use]
    pub fn with_optimizer(mut self, optimizer: Arc<dyn ProviderOptimizer>) -> Self {
        self.optimizer = Some(optimizer);
        self
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<dyn QosMetricsSink>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// # Errors
    ///
    /// Returns [`BuilderError`] if a required part is missing or the config does not
    /// validate.
    pub fn build(self) -> Result<Arc<ConsumerSessionManager>, BuilderError> {
        let rpc_endpoint = self.rpc_endpoint.ok_or(BuilderError::MissingRpcEndpoint)?;
        let connector = self.connector.ok_or(BuilderError::MissingConnector)?;
        self.config.validate().map_err(BuilderError::InvalidConfig)?;

        let optimizer =
            self.optimizer.unwrap_or_else(|| Arc::new(ScoringOptimizer::default()));

        Ok(ConsumerSessionManager::new(
            rpc_endpoint,
            self.config,
            connector,
            optimizer,
            self.metrics,
        ))
    }
}
