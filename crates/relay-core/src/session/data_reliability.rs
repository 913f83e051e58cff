//! Data reliability sessions: a second opinion from another paired provider.
//!
//! A data reliability relay re-sends a request that another provider already
//! answered, so the consumer can compare the two replies. Each provider has at most
//! one such session per epoch, with the reserved session id `0`. These relays are
//! not billed: the callbacks below never touch compute unit accounting.

use super::{
    consumer_session::{RelayCompletion, SessionGuard},
    errors::{RelayFailure, SessionError},
    manager::ConsumerSessionManager,
};
use std::sync::Arc;
use tracing::{debug, warn};

/// A locked data reliability session.
#[derive(Debug)]
pub struct DataReliabilitySession {
    pub session: SessionGuard,
    pub provider_address: Arc<str>,
    /// Epoch the relay must be signed for.
    pub epoch: u64,
}

impl ConsumerSessionManager {
    /// Locks the data reliability session of the provider at pairing `index`.
    ///
    /// # Errors
    ///
    /// Fails when `session_epoch` is not current, `index` is outside the pairing or
    /// names `original_provider`, the provider was already reported for a conflict,
    /// no endpoint could be connected, or its data reliability session is
    /// block-listed. A provider whose endpoints all end up disabled is blocked and
    /// reported with a reconnect callback.
    pub async fn get_data_reliability_session(
        &self,
        original_provider: &str,
        index: u64,
        session_epoch: u64,
    ) -> Result<DataReliabilitySession, SessionError> {
        let current_epoch = self.current_epoch();
        if session_epoch != current_epoch {
            return Err(SessionError::EpochMismatch { session_epoch, current_epoch });
        }

        let (address, provider) = self.pairing_entry_at(index)?;
        if address.as_ref() == original_provider {
            return Err(SessionError::DataReliabilityIndexRequestedIsOriginalProvider(
                original_provider.to_string(),
            ));
        }
        if provider.conflict_already_reported() {
            return Err(SessionError::DataReliabilityAlreadyReported(address.to_string()));
        }

        let session = match provider.data_reliability_session().await {
            Some(session) => session,
            None => {
                let max_attempts = self.config().max_consecutive_connection_attempts.max(1);
                let mut endpoint = None;
                for attempt in 1..=max_attempts {
                    match provider.fetch_endpoint_connection().await {
                        Ok(Some(connected)) => {
                            endpoint = Some(connected);
                            break;
                        }
                        Ok(None) => {
                            debug!(provider = %address, attempt, "data reliability endpoint not connected");
                        }
                        Err(SessionError::AllProviderEndpointsDisabled(_)) => {
                            warn!(provider = %address, "all provider endpoints disabled, blocking provider");
                            self.block_provider_for_epoch(
                                &address,
                                true,
                                current_epoch,
                                self.config().max_consecutive_connection_attempts,
                                0,
                                Some(self.reconnect_callback(&provider)),
                            )?;
                            break;
                        }
                        Err(err) => return Err(err),
                    }
                }
                let endpoint =
                    endpoint.ok_or_else(|| SessionError::EndpointNotConnected(address.to_string()))?;
                provider.get_or_create_data_reliability_session(&endpoint).await
            }
        };

        let mut guard = session.acquire().await;
        if guard.is_block_listed() {
            return Err(SessionError::DataReliabilitySessionBlockListed(address.to_string()));
        }

        let pairing_epoch = provider.pairing_epoch();
        let epoch = if pairing_epoch == session_epoch {
            session_epoch
        } else {
            warn!(
                provider = %address,
                pairing_epoch,
                session_epoch,
                "provider pairing epoch differs from data reliability epoch"
            );
            pairing_epoch
        };
        guard.state_mut().relay_num += 1;

        Ok(DataReliabilitySession { session: guard, provider_address: address, epoch })
    }

    /// Records a successful data reliability relay.
    ///
    /// # Errors
    ///
    /// Currently infallible; the `Result` keeps the callback signatures uniform.
    pub fn on_data_reliability_session_done(
        &self,
        mut session: SessionGuard,
        completion: &RelayCompletion,
    ) -> Result<(), SessionError> {
        let address = Arc::clone(session.provider_address());
        let params = self.config().qos_parameters();

        let state = session.state_mut();
        state.consecutive_failures = 0;
        state.latest_block = completion.latest_served_block;
        let qos = state.calculate_qos(
            completion.latency,
            completion.expected_latency,
            completion.block_height_diff(),
            completion.providers_agreeing,
            completion.pairing_size,
            &params,
        );
        let excellence = state.qos.last_excellence_qos_report;
        let relay_num = state.relay_num;
        drop(session);

        self.warn_on_block_gap(&address, completion);
        self.publish_qos(&address, Some(qos), excellence, completion.latest_served_block, relay_num);
        Ok(())
    }

    /// Records a failed data reliability relay. The relay number is rolled back
    /// since the provider never counted it.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::SessionIsAlreadyBlockListed`] for a session that was
    /// block-listed earlier.
    pub fn on_data_reliability_session_failure(
        &self,
        mut session: SessionGuard,
        failure: &RelayFailure,
    ) -> Result<(), SessionError> {
        if session.is_block_listed() {
            return Err(SessionError::SessionIsAlreadyBlockListed(session.session_id()));
        }
        let address = Arc::clone(session.provider_address());
        let max_failures = self.config().max_failures_per_session;

        let state = session.state_mut();
        state.qos.total_relays += 1;
        state.consecutive_failures += 1;
        state.errors_count += 1;
        state.relay_num = state.relay_num.saturating_sub(1);
        let block_listed = state.consecutive_failures > max_failures || failure.is_session_sync_loss();
        state.block_listed = block_listed;
        let consecutive_failures = state.consecutive_failures;
        let parent = session.session().parent();
        drop(session);

        if block_listed {
            warn!(
                provider = %address,
                consecutive_failures,
                failure = failure.as_str(),
                "block-listed data reliability session"
            );
        }
        if failure.should_block_provider() {
            let epoch = parent.map_or_else(|| self.current_epoch(), |p| p.pairing_epoch());
            self.block_provider_for_epoch(
                &address,
                failure.should_report_provider(),
                epoch,
                0,
                consecutive_failures,
                None,
            )?;
        }
        Ok(())
    }
}
