use super::{
    client::ProviderConnector,
    consumer_session::{RelayCompletion, SessionGuard},
    errors::{RelayFailure, SessionError},
    provider::ConsumerSessionsWithProvider,
    reported::{ReconnectCallback, ReportedProviders},
};
use crate::{
    config::SessionsConfig,
    metrics::{self, QosMetricsSink, QosSample},
    optimizer::{OptimizerStrategy, ProviderOptimizer},
    types::{
        ConsistencyMode, PairingEntry, QualityOfServiceReport, ReportedProvider, RouterKey,
        RpcEndpoint,
    },
};
use futures::{future::join_all, FutureExt};
use parking_lot::RwLock;
use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
};
use tracing::{debug, error, info, warn};

/// A locked session handed out by [`ConsumerSessionManager::get_sessions`].
#[derive(Debug)]
pub struct SessionInfo {
    pub session: SessionGuard,
    /// Epoch the relay must be signed for.
    pub epoch: u64,
    /// Providers reported this epoch, to embed in the relay.
    pub reported_providers: Vec<ReportedProvider>,
}

/// Sessions keyed by provider address.
pub type ConsumerSessionsMap = HashMap<Arc<str>, SessionInfo>;

/// What a caller needs sessions for.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionRequest {
    pub compute_units: u64,
    /// Providers the caller does not want, e.g. ones that already failed this request.
    pub unwanted_providers: HashSet<Arc<str>>,
    pub requested_block: i64,
    pub addon: String,
    pub extensions: Vec<String>,
    pub consistency: ConsistencyMode,
    pub virtual_epoch: u64,
}

impl SessionRequest {
    #[must_use]
    pub fn new(compute_units: u64) -> Self {
        Self { compute_units, ..Self::default() }
    }

    #[must_use]
    pub fn with_unwanted<I, S>(mut self, providers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Arc<str>>,
    {
        self.unwanted_providers.extend(providers.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn with_requested_block(mut self, requested_block: i64) -> Self {
        self.requested_block = requested_block;
        self
    }

    #[must_use]
    pub fn with_addon(mut self, addon: impl Into<String>) -> Self {
        self.addon = addon.into();
        self
    }

    #[must_use]
    pub fn with_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extensions = extensions.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_consistency(mut self, consistency: ConsistencyMode) -> Self {
        self.consistency = consistency;
        self
    }

    #[must_use]
    pub fn with_virtual_epoch(mut self, virtual_epoch: u64) -> Self {
        self.virtual_epoch = virtual_epoch;
        self
    }
}

/// Providers already tried during one `get_sessions` call. Only valid for the epoch
/// it was built in.
struct IgnoredProviders {
    providers: HashSet<Arc<str>>,
    epoch: u64,
}

struct Candidate {
    address: Arc<str>,
    provider: Arc<ConsumerSessionsWithProvider>,
    epoch: u64,
}

#[derive(Default)]
struct PairingState {
    pairing: HashMap<Arc<str>, Arc<ConsumerSessionsWithProvider>>,
    /// Previous epoch's pairing, kept so in-flight sessions can finish.
    pairing_purge: HashMap<Arc<str>, Arc<ConsumerSessionsWithProvider>>,
    /// Pairing order, used by data reliability to pick a provider by index.
    pairing_addresses: Vec<Arc<str>>,
    valid_addresses: Vec<Arc<str>>,
    addon_addresses: HashMap<RouterKey, Vec<Arc<str>>>,
    number_of_resets: u64,
}

impl PairingState {
    fn supports(&self, address: &str, addon: &str, extensions: &[String]) -> bool {
        self.pairing.get(address).is_some_and(|provider| {
            provider.is_supporting_addon(addon) && provider.is_supporting_extensions(extensions)
        })
    }

    /// Valid addresses serving the combination, ignoring the cache.
    fn supporting_addresses(&self, addon: &str, extensions: &[String]) -> Vec<Arc<str>> {
        self.valid_addresses
            .iter()
            .filter(|address| self.supports(address, addon, extensions))
            .cloned()
            .collect()
    }

    fn valid_addresses_for(
        &self,
        key: &RouterKey,
        addon: &str,
        extensions: &[String],
    ) -> Vec<Arc<str>> {
        if key.is_base() {
            return self.valid_addresses.clone();
        }
        self.addon_addresses
            .get(key)
            .cloned()
            .unwrap_or_else(|| self.supporting_addresses(addon, extensions))
    }

    /// Removes `address` from the valid list. Every cached combination is derived
    /// from that list, so the whole cache is dropped.
    fn remove_valid_address(&mut self, address: &str) -> bool {
        let Some(index) = self.valid_addresses.iter().position(|a| a.as_ref() == address) else {
            return false;
        };
        self.valid_addresses.remove(index);
        self.addon_addresses.clear();
        true
    }

    fn set_valid_addresses_to_default(&mut self, addon: &str, extensions: &[String]) {
        if addon.is_empty() && extensions.iter().all(String::is_empty) {
            self.valid_addresses = self.pairing_addresses.clone();
        } else {
            let missing: Vec<_> = self
                .pairing_addresses
                .iter()
                .filter(|address| !self.valid_addresses.contains(address))
                .filter(|address| self.supports(address, addon, extensions))
                .cloned()
                .collect();
            self.valid_addresses.extend(missing);
        }
        self.addon_addresses.clear();
    }
}

/// Per-endpoint session manager of a relay consumer.
///
/// Holds the current epoch's provider pairing and hands out locked sessions to
/// callers. Callers report every session back through exactly one of the
/// completion callbacks, which drive compute unit accounting, QoS, block-listing
/// and provider blocking.
///
/// The pairing state sits behind a synchronous lock that is never held across an
/// await point. Provider records and sessions carry their own locks; the pairing
/// lock is always taken first when more than one is needed.
pub struct ConsumerSessionManager {
    rpc_endpoint: RpcEndpoint,
    config: Arc<SessionsConfig>,
    connector: Arc<dyn ProviderConnector>,
    pub(super) optimizer: Arc<dyn ProviderOptimizer>,
    metrics: Option<Arc<dyn QosMetricsSink>>,
    current_epoch: AtomicU64,
    state: RwLock<PairingState>,
    pub(super) reported: ReportedProviders,
    pub(super) weak_self: Weak<Self>,
}

impl ConsumerSessionManager {
    pub(crate) fn new(
        rpc_endpoint: RpcEndpoint,
        config: SessionsConfig,
        connector: Arc<dyn ProviderConnector>,
        optimizer: Arc<dyn ProviderOptimizer>,
        metrics: Option<Arc<dyn QosMetricsSink>>,
    ) -> Arc<Self> {
        let reported = ReportedProviders::new(config.reconnect_candidate_after());
        Arc::new_cyclic(|weak_self| Self {
            rpc_endpoint,
            config: Arc::new(config),
            connector,
            optimizer,
            metrics,
            current_epoch: AtomicU64::new(0),
            state: RwLock::new(PairingState::default()),
            reported,
            weak_self: weak_self.clone(),
        })
    }

    #[must_use]
    pub fn rpc_endpoint(&self) -> &RpcEndpoint {
        &self.rpc_endpoint
    }

    #[must_use]
    pub fn config(&self) -> &SessionsConfig {
        &self.config
    }

    #[must_use]
    pub fn current_epoch(&self) -> u64 {
        self.current_epoch.load(Ordering::Acquire)
    }

    /// Returns `true` once a non-empty pairing has been installed.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        !self.state.read().pairing_addresses.is_empty()
    }

    #[must_use]
    pub fn number_of_resets(&self) -> u64 {
        self.state.read().number_of_resets
    }

    #[must_use]
    pub fn pairing_addresses_len(&self) -> usize {
        self.state.read().pairing_addresses.len()
    }

    /// Valid providers serving the (addon, extensions) combination.
    #[must_use]
    pub fn valid_addresses(&self, addon: &str, extensions: &[String]) -> Vec<Arc<str>> {
        let key = RouterKey::new(addon, extensions);
        self.state.read().valid_addresses_for(&key, addon, extensions)
    }

    /// Provider record of the current epoch.
    #[must_use]
    pub fn provider(&self, address: &str) -> Option<Arc<ConsumerSessionsWithProvider>> {
        self.state.read().pairing.get(address).cloned()
    }

    #[must_use]
    pub fn purged_provider_addresses(&self) -> Vec<Arc<str>> {
        let mut addresses: Vec<_> = self.state.read().pairing_purge.keys().cloned().collect();
        addresses.sort();
        addresses
    }

    /// Reports to embed in relays of `epoch`. Empty when `epoch` is not current.
    #[must_use]
    pub fn reported_providers(&self, epoch: u64) -> Vec<ReportedProvider> {
        if epoch != self.current_epoch() {
            return Vec::new();
        }
        self.reported.reported_providers()
    }

    #[must_use]
    pub fn is_provider_reported(&self, address: &str) -> bool {
        self.reported.is_reported(address)
    }

    pub(super) fn current_providers(&self) -> Vec<Arc<ConsumerSessionsWithProvider>> {
        let state = self.state.read();
        state.pairing_addresses.iter().filter_map(|a| state.pairing.get(a).cloned()).collect()
    }

    /// Pairing address at `index` with its provider record.
    pub(super) fn pairing_entry_at(
        &self,
        index: u64,
    ) -> Result<(Arc<str>, Arc<ConsumerSessionsWithProvider>), SessionError> {
        let state = self.state.read();
        let len = state.pairing_addresses.len() as u64;
        let address = usize::try_from(index)
            .ok()
            .and_then(|i| state.pairing_addresses.get(i))
            .ok_or(SessionError::DataReliabilityIndexOutOfRange { index, len })?;
        let provider = state.pairing.get(address).cloned().ok_or_else(|| {
            SessionError::InvariantViolation(format!("pairing address {address} has no record"))
        })?;
        Ok((Arc::clone(address), provider))
    }

    fn build_pairing(
        &self,
        epoch: u64,
        pairing: Vec<PairingEntry>,
    ) -> (Vec<Arc<str>>, HashMap<Arc<str>, Arc<ConsumerSessionsWithProvider>>) {
        let mut addresses = Vec::with_capacity(pairing.len());
        let mut providers = HashMap::with_capacity(pairing.len());
        for entry in pairing {
            let address: Arc<str> = Arc::from(entry.public_address);
            if providers.contains_key(&address) {
                warn!(provider = %address, epoch, "duplicate provider in pairing, keeping first");
                continue;
            }
            let provider = ConsumerSessionsWithProvider::new(
                Arc::clone(&address),
                entry.endpoints,
                entry.max_compute_units,
                epoch,
                Arc::clone(&self.connector),
                Arc::clone(&self.config),
            );
            addresses.push(Arc::clone(&address));
            providers.insert(address, provider);
        }
        (addresses, providers)
    }

    /// Installs the pairing of a new epoch.
    ///
    /// Rejects epochs that are not newer than the current one. On success the
    /// reported providers, reset count and addon cache start over, the previous
    /// epoch's records move to the purge set, and the connections of the records
    /// that were already in the purge set are closed. Probing of the new pairing
    /// starts in the background after a random delay.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::StaleEpochUpdate`] for an epoch that is not newer.
    pub async fn update_all_providers(
        &self,
        epoch: u64,
        pairing: Vec<PairingEntry>,
    ) -> Result<(), SessionError> {
        let current = self.current_epoch();
        if epoch <= current {
            error!(epoch, current, "rejecting provider update for an old epoch");
            return Err(SessionError::StaleEpochUpdate { received: epoch, current });
        }

        let (addresses, providers) = self.build_pairing(epoch, pairing);
        let provider_count = addresses.len();

        let to_close = {
            let mut state = self.state.write();
            let current = self.current_epoch();
            if epoch <= current {
                error!(epoch, current, "rejecting provider update for an old epoch");
                return Err(SessionError::StaleEpochUpdate { received: epoch, current });
            }
            self.current_epoch.store(epoch, Ordering::Release);

            let previous = std::mem::replace(&mut state.pairing, providers);
            let to_close = std::mem::replace(&mut state.pairing_purge, previous);
            state.valid_addresses.clone_from(&addresses);
            state.pairing_addresses = addresses;
            state.addon_addresses.clear();
            state.number_of_resets = 0;
            self.reported.reset();
            to_close
        };

        if let Some(sink) = &self.metrics {
            sink.reset_qos_metrics(&self.rpc_endpoint.chain_id);
        }
        metrics::record_epoch_update(&self.rpc_endpoint.chain_id, provider_count);
        info!(
            epoch,
            providers = provider_count,
            chain = %self.rpc_endpoint.chain_id,
            api_interface = %self.rpc_endpoint.api_interface,
            "updated provider pairing"
        );

        join_all(to_close.values().map(|provider| provider.close_connections())).await;

        if self.config.probe_on_epoch_update {
            self.spawn_epoch_probe(epoch);
        }
        Ok(())
    }

    /// Returns the valid addresses for the combination, caching addon-specific lists.
    fn cache_addon_addresses(&self, addon: &str, extensions: &[String]) -> Vec<Arc<str>> {
        let key = RouterKey::new(addon, extensions);
        {
            let state = self.state.read();
            if key.is_base() {
                return state.valid_addresses.clone();
            }
            if let Some(cached) = state.addon_addresses.get(&key) {
                return cached.clone();
            }
        }

        let mut state = self.state.write();
        let addresses = state.supporting_addresses(addon, extensions);
        state.addon_addresses.insert(key, addresses.clone());
        addresses
    }

    /// Makes sure there is a provider to choose from, resetting the valid list when
    /// it ran empty. Returns the number of resets this epoch.
    fn validate_pairing_list_not_empty(&self, addon: &str, extensions: &[String]) -> u64 {
        if self.cache_addon_addresses(addon, extensions).is_empty() {
            return self.reset_valid_addresses(addon, extensions);
        }
        self.number_of_resets()
    }

    fn reset_valid_addresses(&self, addon: &str, extensions: &[String]) -> u64 {
        let mut state = self.state.write();
        // Another caller may have reset it while the lock was released.
        if !state.supporting_addresses(addon, extensions).is_empty() ||
            state.pairing_addresses.is_empty()
        {
            return state.number_of_resets;
        }

        state.set_valid_addresses_to_default(addon, extensions);
        state.number_of_resets += 1;
        let key = RouterKey::new(addon, extensions);
        if !key.is_base() {
            let addresses = state.supporting_addresses(addon, extensions);
            state.addon_addresses.insert(key, addresses);
        }

        warn!(
            number_of_resets = state.number_of_resets,
            valid = state.valid_addresses.len(),
            addon = %addon,
            chain = %self.rpc_endpoint.chain_id,
            "provider pairing exhausted, resetting valid addresses"
        );
        metrics::record_pairing_reset(&self.rpc_endpoint.chain_id);
        state.number_of_resets
    }

    fn get_valid_provider_addresses(
        &self,
        state: &PairingState,
        ignored: &HashSet<Arc<str>>,
        request: &SessionRequest,
    ) -> Result<Vec<Arc<str>>, SessionError> {
        let key = RouterKey::new(&request.addon, &request.extensions);
        let valid = state.valid_addresses_for(&key, &request.addon, &request.extensions);
        let ignored_count = valid.iter().filter(|address| ignored.contains(*address)).count();
        if valid.len() <= ignored_count {
            debug!(valid = valid.len(), ignored = ignored_count, "no provider left to choose");
            return Err(SessionError::PairingListEmpty);
        }

        let chosen = if request.consistency == ConsistencyMode::SelectAllProviders &&
            self.optimizer.strategy() != OptimizerStrategy::Cost
        {
            valid.iter().filter(|address| !ignored.contains(*address)).cloned().collect()
        } else {
            self.optimizer.choose_provider(
                &valid,
                ignored,
                request.compute_units,
                request.requested_block,
                self.config.optimizer_perturbation,
            )
        };

        let chosen: Vec<_> = chosen
            .into_iter()
            .filter(|address| !address.is_empty() && !ignored.contains(address))
            .collect();
        if chosen.is_empty() {
            return Err(SessionError::PairingListEmpty);
        }
        Ok(chosen)
    }

    fn get_valid_consumer_sessions_with_provider(
        &self,
        ignored: &mut IgnoredProviders,
        request: &SessionRequest,
    ) -> Result<Vec<Candidate>, SessionError> {
        let state = self.state.read();
        let current = self.current_epoch();
        if ignored.epoch < current {
            ignored.providers.clear();
            ignored.epoch = current;
        }

        let mut candidates = self.get_valid_provider_addresses(&state, &ignored.providers, request)?;
        let wanted = candidates.len();
        let mut result = Vec::with_capacity(wanted);

        loop {
            for address in candidates {
                let Some(provider) = state.pairing.get(&address) else {
                    return Err(SessionError::InvariantViolation(format!(
                        "chosen provider {address} is not in the pairing"
                    )));
                };
                if let Err(err) =
                    provider.validate_compute_units(request.compute_units, request.virtual_epoch)
                {
                    debug!(provider = %address, error = %err, "provider out of compute units");
                    ignored.providers.insert(address);
                    continue;
                }

                ignored.providers.insert(Arc::clone(&address));
                result.push(Candidate { address, provider: Arc::clone(provider), epoch: current });
                if result.len() == wanted {
                    return Ok(result);
                }
            }

            candidates = match self.get_valid_provider_addresses(&state, &ignored.providers, request)
            {
                Ok(next) => next,
                Err(err) if result.is_empty() => return Err(err),
                Err(_) => return Ok(result),
            };
        }
    }

    /// Returns locked sessions for a request.
    ///
    /// Normally one provider is chosen by the optimizer; with
    /// [`ConsistencyMode::SelectAllProviders`] every valid provider is used. The
    /// request's compute units are reserved on each returned session's provider.
    /// Providers that cannot serve (not connected, out of compute units, too many
    /// sessions) are skipped and replaced while candidates remain. The result may
    /// hold fewer sessions than wanted but never none.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::PairingListEmpty`] when no provider could be locked,
    /// and [`SessionError::InvariantViolation`] on inconsistent internal state.
    pub async fn get_sessions(
        &self,
        request: &SessionRequest,
    ) -> Result<ConsumerSessionsMap, SessionError> {
        let number_of_resets =
            self.validate_pairing_list_not_empty(&request.addon, &request.extensions);

        let mut ignored = IgnoredProviders {
            providers: request.unwanted_providers.clone(),
            epoch: self.current_epoch(),
        };
        let mut candidates = self.get_valid_consumer_sessions_with_provider(&mut ignored, request)?;
        let wanted = candidates.len();
        let mut sessions = ConsumerSessionsMap::with_capacity(wanted);

        loop {
            for candidate in candidates {
                // An epoch change clears the ignored set; keep the session already held.
                if sessions.contains_key(&candidate.address) {
                    ignored.providers.insert(candidate.address);
                    continue;
                }
                // Dropping `sessions` on an early return releases their reservations.
                let locked = self
                    .lock_candidate_session(&candidate, number_of_resets, request)
                    .await
                    .inspect_err(|err| {
                        error!(provider = %candidate.address, error = %err, "failed to lock session");
                    })?;
                if let Some(info) = locked {
                    sessions.insert(Arc::clone(&candidate.address), info);
                    if sessions.len() == wanted {
                        return Ok(sessions);
                    }
                }
                ignored.providers.insert(candidate.address);
            }

            candidates = match self.get_valid_consumer_sessions_with_provider(&mut ignored, request)
            {
                Ok(next) => next,
                Err(err) if err.is_invariant_violation() => {
                    error!(error = %err, "inconsistent pairing state");
                    return Err(err);
                }
                Err(err) if sessions.is_empty() => return Err(err),
                Err(err) => {
                    debug!(
                        sessions = sessions.len(),
                        wanted,
                        error = %err,
                        "returning fewer sessions than wanted"
                    );
                    return Ok(sessions);
                }
            };
        }
    }

    /// Locks a session on `candidate` and reserves the request's compute units.
    /// `Ok(None)` skips the provider.
    async fn lock_candidate_session(
        &self,
        candidate: &Candidate,
        number_of_resets: u64,
        request: &SessionRequest,
    ) -> Result<Option<SessionInfo>, SessionError> {
        let Candidate { address, provider, epoch } = candidate;

        let endpoint = match provider.fetch_endpoint_connection().await {
            Ok(Some(endpoint)) => endpoint,
            Ok(None) => {
                debug!(provider = %address, "provider has no connected endpoint");
                return Ok(None);
            }
            Err(SessionError::AllProviderEndpointsDisabled(_)) => {
                warn!(provider = %address, "all provider endpoints disabled, blocking provider");
                self.block_provider_for_epoch(
                    address,
                    true,
                    *epoch,
                    self.config.max_consecutive_connection_attempts,
                    0,
                    Some(self.reconnect_callback(provider)),
                )?;
                return Ok(None);
            }
            Err(err) => return Err(SessionError::unexpected("fetching endpoint connection", &err)),
        };

        let reported_providers = self.reported_providers(*epoch);
        let mut session = match provider.get_consumer_session_instance(&endpoint, number_of_resets).await
        {
            Ok(session) => session,
            Err(SessionError::MaximumNumberOfSessionsExceeded(_)) => {
                debug!(provider = %address, "provider session limit reached");
                return Ok(None);
            }
            Err(SessionError::MaximumNumberOfBlockListedSessions(_)) => {
                warn!(provider = %address, "too many block-listed sessions, blocking provider");
                self.block_provider_for_epoch(address, false, *epoch, 0, 0, None)?;
                return Ok(None);
            }
            Err(err) => return Err(SessionError::unexpected("locking consumer session", &err)),
        };

        let pairing_epoch = provider.pairing_epoch();
        let epoch = if pairing_epoch == *epoch {
            *epoch
        } else {
            warn!(
                provider = %address,
                pairing_epoch,
                session_epoch = *epoch,
                "provider pairing epoch differs from session epoch"
            );
            pairing_epoch
        };

        match provider.add_used_compute_units(request.compute_units, request.virtual_epoch) {
            Ok(()) => {}
            Err(SessionError::MaximumComputeUnitsExceeded { used, max, .. }) => {
                debug!(provider = %address, used, max, "provider out of compute units");
                return Ok(None);
            }
            Err(err) => return Err(SessionError::unexpected("reserving compute units", &err)),
        }

        let state = session.state_mut();
        state.latest_relay_cu = request.compute_units;
        state.relay_num += 1;
        if state.relay_num > 1 {
            state.qos.last_excellence_qos_report = self.optimizer.excellence_qos_report(address);
        }

        Ok(Some(SessionInfo { session, epoch, reported_providers }))
    }

    /// Removes a provider from the valid list for `session_epoch`, reporting it
    /// when `report` is set. A provider already missing from the list is logged,
    /// not an error.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::EpochMismatch`] when `session_epoch` is not current.
    pub fn block_provider(
        &self,
        address: &str,
        report: bool,
        session_epoch: u64,
        disconnections: u64,
        errors: u64,
        reconnect: Option<ReconnectCallback>,
    ) -> Result<(), SessionError> {
        let current_epoch = self.current_epoch();
        if session_epoch != current_epoch {
            return Err(SessionError::EpochMismatch { session_epoch, current_epoch });
        }

        let mut state = self.state.write();
        let current_epoch = self.current_epoch();
        if session_epoch != current_epoch {
            return Err(SessionError::EpochMismatch { session_epoch, current_epoch });
        }

        if !state.remove_valid_address(address) {
            let err = SessionError::AddressIndexWasNotFound(address.to_string());
            error!(provider = %address, error = %err, "provider to block is not in the valid list");
        }
        if report {
            self.reported.report_provider(address, errors, disconnections, reconnect);
        }
        drop(state);

        info!(provider = %address, report, epoch = session_epoch, "blocked provider");
        metrics::record_provider_blocked(&self.rpc_endpoint.chain_id, report);
        Ok(())
    }

    /// Blocks a provider, treating an epoch that already moved on as done.
    pub(super) fn block_provider_for_epoch(
        &self,
        address: &str,
        report: bool,
        session_epoch: u64,
        disconnections: u64,
        errors: u64,
        reconnect: Option<ReconnectCallback>,
    ) -> Result<(), SessionError> {
        match self.block_provider(address, report, session_epoch, disconnections, errors, reconnect)
        {
            Err(err) if err.is_epoch_mismatch() => {
                debug!(provider = %address, error = %err, "epoch changed before blocking provider");
                Ok(())
            }
            result => result,
        }
    }

    /// Callback stored with a report; re-enables the provider's endpoints and probes it.
    pub(super) fn reconnect_callback(
        &self,
        provider: &Arc<ConsumerSessionsWithProvider>,
    ) -> ReconnectCallback {
        let manager = self.weak_self.clone();
        let provider = Arc::clone(provider);
        Arc::new(move || {
            let manager = manager.clone();
            let provider = Arc::clone(&provider);
            async move {
                let manager = manager.upgrade().ok_or_else(|| {
                    SessionError::InvariantViolation("session manager dropped".to_string())
                })?;
                provider.reenable_endpoints().await;
                manager.probe_provider(&provider).await.map(|_| ())
            }
            .boxed()
        })
    }

    /// Releases a session that was never used for a relay.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NegativeComputeUnits`] if the provider's usage would
    /// drop below zero.
    pub fn on_session_unused(&self, mut session: SessionGuard) -> Result<(), SessionError> {
        let reserved = std::mem::take(&mut session.state_mut().latest_relay_cu);
        let parent = session.session().parent();
        drop(session);
        match parent {
            Some(provider) => provider.decrease_used_compute_units(reserved),
            None => Ok(()),
        }
    }

    /// Records a failed relay.
    ///
    /// The session's reservation is released. The session is block-listed once its
    /// consecutive failures exceed the limit or the provider reported it out of
    /// sync. The provider is blocked (and reported) when the failure says so, or
    /// when the session got block-listed before the provider served anything this
    /// epoch.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::SessionIsAlreadyBlockListed`] for a session that was
    /// block-listed earlier.
    pub fn on_session_failure(
        &self,
        mut session: SessionGuard,
        failure: &RelayFailure,
    ) -> Result<(), SessionError> {
        if session.is_block_listed() {
            return Err(SessionError::SessionIsAlreadyBlockListed(session.session_id()));
        }
        let address = Arc::clone(session.provider_address());
        let session_id = session.session_id();
        let max_failures = self.config.max_failures_per_session;

        let state = session.state_mut();
        state.qos.total_relays += 1;
        state.consecutive_failures += 1;
        state.errors_count += 1;
        let block_listed = state.consecutive_failures > max_failures || failure.is_session_sync_loss();
        state.block_listed = block_listed;
        let consecutive_failures = state.consecutive_failures;
        let reserved = std::mem::take(&mut state.latest_relay_cu);
        let parent = session.session().parent();
        drop(session);

        if block_listed {
            warn!(
                provider = %address,
                session_id,
                consecutive_failures,
                failure = failure.as_str(),
                "block-listed consumer session"
            );
            metrics::record_session_block_listed(
                &self.rpc_endpoint.chain_id,
                if failure.is_session_sync_loss() { "out_of_sync" } else { "consecutive_failures" },
            );
        } else {
            debug!(provider = %address, session_id, error = %failure, "relay failed");
        }
        metrics::record_relay_failure(&self.rpc_endpoint.chain_id, failure.as_str());
        self.optimizer.append_relay_failure(&address);

        let Some(provider) = parent else {
            return Ok(());
        };
        provider.decrease_used_compute_units(reserved)?;

        let mut block = failure.should_block_provider();
        let mut report = failure.should_report_provider();
        if block_listed &&
            self.config.block_provider_without_successful_cu &&
            provider.successful_compute_units() == 0
        {
            block = true;
            report = true;
        }
        if block {
            self.block_provider_for_epoch(
                &address,
                report,
                provider.pairing_epoch(),
                0,
                consecutive_failures,
                None,
            )?;
        }
        Ok(())
    }

    /// Records a successful relay: commits the reservation, clears the failure
    /// streak, updates QoS and feeds the optimizer.
    ///
    /// # Errors
    ///
    /// Currently infallible; the `Result` keeps the callback signatures uniform.
    pub fn on_session_done(
        &self,
        mut session: SessionGuard,
        completion: &RelayCompletion,
    ) -> Result<(), SessionError> {
        let address = Arc::clone(session.provider_address());
        let params = self.config.qos_parameters();

        let state = session.state_mut();
        let committed = std::mem::take(&mut state.latest_relay_cu);
        state.cu_sum += committed;
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
        let parent = session.session().parent();
        drop(session);

        self.warn_on_block_gap(&address, completion);
        if let Some(provider) = parent {
            provider.record_successful_compute_units(committed);
        }
        self.optimizer.append_relay_data(
            &address,
            completion.latency,
            completion.hanging_api,
            completion.spec_compute_units,
            u64::try_from(completion.latest_served_block).unwrap_or(0),
        );
        self.publish_qos(&address, Some(qos), excellence, completion.latest_served_block, relay_num);
        Ok(())
    }

    /// Commits the reservation and clears the failure streak without touching QoS.
    ///
    /// # Errors
    ///
    /// Currently infallible; the `Result` keeps the callback signatures uniform.
    pub fn on_session_done_increase_cu_only(
        &self,
        mut session: SessionGuard,
    ) -> Result<(), SessionError> {
        let state = session.state_mut();
        let committed = std::mem::take(&mut state.latest_relay_cu);
        state.cu_sum += committed;
        state.consecutive_failures = 0;
        let parent = session.session().parent();
        drop(session);

        if let Some(provider) = parent {
            provider.record_successful_compute_units(committed);
        }
        Ok(())
    }

    pub(super) fn warn_on_block_gap(&self, address: &str, completion: &RelayCompletion) {
        let gap = completion.block_height_diff();
        if completion.expected_block_height > 0 && gap > self.config.block_gap_warning_threshold {
            warn!(
                provider = %address,
                expected = completion.expected_block_height,
                latest = completion.latest_served_block,
                gap,
                "provider is far behind the expected block height"
            );
        }
    }

    pub(super) fn publish_qos(
        &self,
        address: &str,
        qos: Option<QualityOfServiceReport>,
        excellence_qos: Option<QualityOfServiceReport>,
        latest_block: i64,
        relay_num: u64,
    ) {
        let Some(sink) = &self.metrics else {
            return;
        };
        sink.set_qos_metrics(&QosSample {
            chain_id: &self.rpc_endpoint.chain_id,
            api_interface: &self.rpc_endpoint.api_interface,
            provider: address,
            qos,
            excellence_qos,
            latest_block,
            relay_num,
        });
    }
}

impl fmt::Debug for ConsumerSessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerSessionManager")
            .field("rpc_endpoint", &self.rpc_endpoint)
            .field("current_epoch", &self.current_epoch())
            .field("pairing", &self.pairing_addresses_len())
            .field("reported", &self.reported)
            .finish_non_exhaustive()
    }
}
