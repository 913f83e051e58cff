//! Provider probing and the reconnect loop of a session manager.

use super::{
    errors::SessionError, manager::ConsumerSessionManager, provider::ConsumerSessionsWithProvider,
};
use crate::{metrics, types::ProbeRequest};
use futures::future::join_all;
use rand::Rng;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{
    sync::broadcast,
    task::JoinHandle,
    time::{interval, sleep, timeout},
};
use tracing::{debug, info, warn};

impl ConsumerSessionManager {
    /// Probes one provider and returns the round-trip latency.
    ///
    /// A provider whose endpoints are all disabled is blocked and reported with a
    /// reconnect callback before the error is returned.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider is unreachable, does not answer within the
    /// probe timeout, or answers with a wrong guid or no latest block.
    pub async fn probe_provider(
        &self,
        provider: &Arc<ConsumerSessionsWithProvider>,
    ) -> Result<Duration, SessionError> {
        let address = provider.public_address();
        let endpoint = match provider.fetch_endpoint_connection().await {
            Ok(Some(endpoint)) => endpoint,
            Ok(None) => return Err(SessionError::EndpointNotConnected(address.to_string())),
            Err(err @ SessionError::AllProviderEndpointsDisabled(_)) => {
                self.block_provider_for_epoch(
                    address,
                    true,
                    provider.pairing_epoch(),
                    self.config().max_consecutive_connection_attempts,
                    0,
                    Some(self.reconnect_callback(provider)),
                )?;
                return Err(err);
            }
            Err(err) => return Err(err),
        };

        let request = ProbeRequest {
            guid: rand::rng().random::<u64>(),
            spec_id: self.rpc_endpoint().chain_id.clone(),
            api_interface: self.rpc_endpoint().api_interface.clone(),
        };
        let sent = request.guid;
        let started = Instant::now();
        let response = timeout(self.config().probe_timeout(), endpoint.client.probe(request))
            .await
            .map_err(|_| SessionError::ProbeTimeout(address.to_string()))?
            .map_err(|err| SessionError::ProbeFailed {
                address: address.to_string(),
                reason: err.to_string(),
            })?;
        let latency = started.elapsed();

        if response.guid != sent {
            return Err(SessionError::ProbeGuidMismatch { sent, received: response.guid });
        }
        if response.latest_block == 0 {
            return Err(SessionError::ProbeZeroLatestBlock(address.to_string()));
        }

        debug!(
            provider = %address,
            endpoint = %endpoint.network_address,
            latency_ms = latency.as_millis(),
            latest_block = response.latest_block,
            version = response.version.as_deref().unwrap_or("unknown"),
            "probed provider"
        );
        Ok(latency)
    }

    /// Probes `providers` concurrently and feeds the results to the optimizer.
    /// A failed probe is recorded with the probe timeout as its latency.
    ///
    /// Returns the number of providers that answered.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::ProbeBatchTimeout`] when the batch does not finish
    /// within the configured batch timeout.
    pub(crate) async fn probe_providers(
        &self,
        providers: Vec<Arc<ConsumerSessionsWithProvider>>,
        epoch: u64,
    ) -> Result<usize, SessionError> {
        let probe_timeout = self.config().probe_timeout();
        let chain_id = &self.rpc_endpoint().chain_id;

        let probes = providers.iter().map(|provider| async move {
            let address = provider.public_address();
            match self.probe_provider(provider).await {
                Ok(latency) => {
                    self.optimizer.append_probe_relay_data(address, latency, true);
                    metrics::record_probe(chain_id, true);
                    true
                }
                Err(
                    err @ (SessionError::ProbeGuidMismatch { .. } |
                    SessionError::ProbeZeroLatestBlock(_)),
                ) => {
                    warn!(provider = %address, error = %err, "provider answered probe incorrectly");
                    self.optimizer.append_probe_relay_data(address, probe_timeout, false);
                    metrics::record_probe(chain_id, false);
                    false
                }
                Err(err) => {
                    debug!(provider = %address, error = %err, "provider probe failed");
                    self.optimizer.append_probe_relay_data(address, probe_timeout, false);
                    metrics::record_probe(chain_id, false);
                    false
                }
            }
        });

        let batch_timeout = self.config().probe_batch_timeout();
        let Ok(results) = timeout(batch_timeout, join_all(probes)).await else {
            warn!(epoch, providers = providers.len(), "timed out probing providers");
            #[allow(clippy::cast_possible_truncation)]
            return Err(SessionError::ProbeBatchTimeout(batch_timeout.as_millis() as u64));
        };

        let answered = results.into_iter().filter(|ok| *ok).count();
        info!(epoch, providers = providers.len(), answered, "probed provider pairing");
        Ok(answered)
    }

    /// Probes every provider of the current pairing.
    ///
    /// # Errors
    ///
    /// See [`probe_providers`](Self::probe_providers).
    pub async fn probe_current_pairing(&self) -> Result<usize, SessionError> {
        let epoch = self.current_epoch();
        self.probe_providers(self.current_providers(), epoch).await
    }

    /// Probes the pairing of `epoch` after a random delay, unless a newer epoch
    /// arrived in the meantime.
    pub(super) fn spawn_epoch_probe(&self, epoch: u64) {
        let Some(manager) = self.weak_self.upgrade() else {
            return;
        };
        let max_jitter = self.config().probe_jitter_max_ms;
        let jitter = if max_jitter == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::rng().random_range(0..=max_jitter))
        };

        tokio::spawn(async move {
            sleep(jitter).await;
            if manager.current_epoch() != epoch {
                debug!(epoch, "skipping probe of a superseded pairing");
                return;
            }
            let providers = manager.current_providers();
            if let Err(err) = manager.probe_providers(providers, epoch).await {
                warn!(epoch, error = %err, "epoch probe failed");
            }
        });
    }

    /// Starts the background loop that retries reported providers.
    ///
    /// Every reconnect interval, providers reported long enough ago are re-enabled
    /// and probed; those that answer leave the reported list. The loop holds only a
    /// weak reference and ends when the manager is dropped or a shutdown signal
    /// arrives.
    pub fn start_reconnect_loop(
        &self,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let manager = self.weak_self.clone();
        let reconnect_interval = self.config().reconnect_interval();

        tokio::spawn(async move {
            let mut interval = interval(reconnect_interval);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let Some(manager) = manager.upgrade() else {
                            debug!("session manager dropped, stopping reconnect loop");
                            break;
                        };
                        let recovered = manager.reported.reconnect_providers().await;
                        if recovered > 0 {
                            info!(recovered, "reconnected reported providers");
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("provider reconnect loop shutting down");
                        break;
                    }
                }
            }
        })
    }
}
