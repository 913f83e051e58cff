use super::{
    client::{ProviderClient, ProviderConnector},
    consumer_session::{ConsumerSession, SessionGuard, DATA_RELIABILITY_SESSION_ID},
    errors::SessionError,
};
use crate::{config::SessionsConfig, types::EndpointInfo};
use rand::Rng;
use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};
use tokio::{sync::Mutex, time::timeout};
use tracing::{debug, info, warn};

/// Connection bookkeeping for one endpoint of a provider.
struct EndpointState {
    enabled: bool,
    client: Option<Arc<dyn ProviderClient>>,
    connection_refusals: u64,
}

struct ProviderInner {
    endpoints: Vec<EndpointState>,
    sessions: HashMap<i64, Arc<ConsumerSession>>,
}

/// An endpoint with a live connection, as returned by
/// [`ConsumerSessionsWithProvider::fetch_endpoint_connection`].
#[derive(Clone)]
pub struct ConnectedEndpoint {
    pub index: usize,
    pub network_address: String,
    pub client: Arc<dyn ProviderClient>,
}

impl fmt::Debug for ConnectedEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectedEndpoint")
            .field("index", &self.index)
            .field("network_address", &self.network_address)
            .finish_non_exhaustive()
    }
}

/// Snapshot of an endpoint's connection state, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointStatus {
    pub network_address: String,
    pub enabled: bool,
    pub connected: bool,
    pub connection_refusals: u64,
}

/// Everything the consumer knows about one paired provider for one epoch.
///
/// Compute unit accounting is lock-free; the endpoint connections and the session
/// table sit behind a single async lock. A record is immutable apart from those and
/// is replaced wholesale on the next epoch.
pub struct ConsumerSessionsWithProvider {
    public_address: Arc<str>,
    pairing_epoch: u64,
    max_compute_units: u64,
    endpoint_infos: Vec<EndpointInfo>,
    used_compute_units: AtomicU64,
    successful_compute_units: AtomicU64,
    conflict_reported: AtomicBool,
    connector: Arc<dyn ProviderConnector>,
    config: Arc<SessionsConfig>,
    inner: Mutex<ProviderInner>,
}

impl ConsumerSessionsWithProvider {
    pub fn new(
        public_address: impl Into<Arc<str>>,
        endpoints: Vec<EndpointInfo>,
        max_compute_units: u64,
        pairing_epoch: u64,
        connector: Arc<dyn ProviderConnector>,
        config: Arc<SessionsConfig>,
    ) -> Arc<Self> {
        let states = endpoints
            .iter()
            .map(|_| EndpointState { enabled: true, client: None, connection_refusals: 0 })
            .collect();

        Arc::new(Self {
            public_address: public_address.into(),
            pairing_epoch,
            max_compute_units,
            endpoint_infos: endpoints,
            used_compute_units: AtomicU64::new(0),
            successful_compute_units: AtomicU64::new(0),
            conflict_reported: AtomicBool::new(false),
            connector,
            config,
            inner: Mutex::new(ProviderInner { endpoints: states, sessions: HashMap::new() }),
        })
    }

    #[must_use]
    pub fn public_address(&self) -> &Arc<str> {
        &self.public_address
    }

    /// Epoch this record was created for.
    #[must_use]
    pub fn pairing_epoch(&self) -> u64 {
        self.pairing_epoch
    }

    #[must_use]
    pub fn endpoints(&self) -> &[EndpointInfo] {
        &self.endpoint_infos
    }

    #[must_use]
    pub fn max_compute_units(&self) -> u64 {
        self.max_compute_units
    }

    /// Ceiling for a virtual epoch. Virtual epochs extend the allowance within a
    /// chain epoch, so the ceiling scales with the number of virtual epochs elapsed.
    #[must_use]
    pub fn max_compute_units_for(&self, virtual_epoch: u64) -> u64 {
        self.max_compute_units.saturating_mul(virtual_epoch.saturating_add(1))
    }

    #[must_use]
    pub fn used_compute_units(&self) -> u64 {
        self.used_compute_units.load(Ordering::Acquire)
    }

    /// Compute units committed by successful relays this epoch.
    #[must_use]
    pub fn successful_compute_units(&self) -> u64 {
        self.successful_compute_units.load(Ordering::Acquire)
    }

    /// Checks whether `compute_units` more would still fit under the ceiling.
    pub fn validate_compute_units(
        &self,
        compute_units: u64,
        virtual_epoch: u64,
    ) -> Result<(), SessionError> {
        let used = self.used_compute_units();
        let max = self.max_compute_units_for(virtual_epoch);
        if used.saturating_add(compute_units) > max {
            return Err(SessionError::MaximumComputeUnitsExceeded {
                used,
                requested: compute_units,
                max,
            });
        }
        Ok(())
    }

    /// Reserves `compute_units` atomically. Either the whole amount fits under the
    /// ceiling or nothing is reserved.
    pub fn add_used_compute_units(
        &self,
        compute_units: u64,
        virtual_epoch: u64,
    ) -> Result<(), SessionError> {
        let max = self.max_compute_units_for(virtual_epoch);
        self.used_compute_units
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(compute_units).filter(|total| *total <= max)
            })
            .map(|_| ())
            .map_err(|used| SessionError::MaximumComputeUnitsExceeded {
                used,
                requested: compute_units,
                max,
            })
    }

    pub fn decrease_used_compute_units(&self, compute_units: u64) -> Result<(), SessionError> {
        self.used_compute_units
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_sub(compute_units)
            })
            .map(|_| ())
            .map_err(|used| SessionError::NegativeComputeUnits { used, released: compute_units })
    }

    pub(crate) fn record_successful_compute_units(&self, compute_units: u64) {
        self.successful_compute_units.fetch_add(compute_units, Ordering::AcqRel);
    }

    /// Returns `true` if some endpoint serves `addon`. The empty addon is always supported.
    #[must_use]
    pub fn is_supporting_addon(&self, addon: &str) -> bool {
        addon.is_empty() || self.endpoint_infos.iter().any(|e| e.addons.contains(addon))
    }

    /// Returns `true` if a single endpoint serves every extension in `extensions`.
    #[must_use]
    pub fn is_supporting_extensions(&self, extensions: &[String]) -> bool {
        if extensions.iter().all(String::is_empty) {
            return true;
        }
        self.endpoint_infos.iter().any(|endpoint| {
            extensions.iter().filter(|x| !x.is_empty()).all(|x| endpoint.extensions.contains(x))
        })
    }

    /// Marks the provider as reported for a conflict. Returns `false` if it already was.
    pub fn mark_conflict_reported(&self) -> bool {
        !self.conflict_reported.swap(true, Ordering::AcqRel)
    }

    #[must_use]
    pub fn conflict_already_reported(&self) -> bool {
        self.conflict_reported.load(Ordering::Acquire)
    }

    /// Returns a connected endpoint, dialing lazily.
    ///
    /// Enabled endpoints are tried in order. A failed dial counts as a refusal and
    /// an endpoint is disabled for the rest of the epoch once its refusals reach the
    /// configured attempt limit; a successful dial clears the count. Returns
    /// `Ok(None)` when an endpoint is still enabled but none could be reached, and
    /// [`SessionError::AllProviderEndpointsDisabled`] when none is left.
    pub async fn fetch_endpoint_connection(
        &self,
    ) -> Result<Option<ConnectedEndpoint>, SessionError> {
        let connect_timeout = self.config.connect_timeout();
        let max_attempts = self.config.max_consecutive_connection_attempts;

        let mut inner = self.inner.lock().await;
        for (index, endpoint) in inner.endpoints.iter_mut().enumerate() {
            if !endpoint.enabled {
                continue;
            }
            let network_address = &self.endpoint_infos[index].network_address;

            if let Some(client) = &endpoint.client {
                return Ok(Some(ConnectedEndpoint {
                    index,
                    network_address: network_address.clone(),
                    client: Arc::clone(client),
                }));
            }

            let reason = match timeout(connect_timeout, self.connector.connect(network_address))
                .await
            {
                Ok(Ok(client)) => {
                    endpoint.connection_refusals = 0;
                    endpoint.client = Some(Arc::clone(&client));
                    debug!(
                        provider = %self.public_address,
                        endpoint = %network_address,
                        "connected to provider endpoint"
                    );
                    return Ok(Some(ConnectedEndpoint {
                        index,
                        network_address: network_address.clone(),
                        client,
                    }));
                }
                Ok(Err(err)) => err.to_string(),
                Err(_) => format!("connect timed out after {}ms", connect_timeout.as_millis()),
            };

            endpoint.connection_refusals += 1;
            warn!(
                provider = %self.public_address,
                endpoint = %network_address,
                refusals = endpoint.connection_refusals,
                reason = %reason,
                "failed connecting to provider endpoint"
            );
            if endpoint.connection_refusals >= max_attempts {
                endpoint.enabled = false;
                info!(
                    provider = %self.public_address,
                    endpoint = %network_address,
                    "disabling provider endpoint for the rest of the epoch"
                );
            }
        }

        if inner.endpoints.iter().all(|e| !e.enabled) {
            return Err(SessionError::AllProviderEndpointsDisabled(self.public_address.to_string()));
        }
        Ok(None)
    }

    /// Re-enables disabled endpoints and clears their refusal counts, so the next
    /// fetch dials them again.
    pub(crate) async fn reenable_endpoints(&self) {
        let mut inner = self.inner.lock().await;
        for endpoint in inner.endpoints.iter_mut().filter(|e| !e.enabled) {
            endpoint.enabled = true;
            endpoint.connection_refusals = 0;
        }
    }

    /// Locks a reusable session on `endpoint`, or creates a new one.
    ///
    /// Block-listed sessions are skipped; once `max_block_listed_sessions_per_provider`
    /// of them are seen the provider is considered unusable. The allowance grows with
    /// each pairing reset so that a pairing rebuilt after exhaustion gets a new chance.
    pub(crate) async fn get_consumer_session_instance(
        self: &Arc<Self>,
        endpoint: &ConnectedEndpoint,
        number_of_resets: u64,
    ) -> Result<SessionGuard, SessionError> {
        let max_blocked = self
            .config
            .max_block_listed_sessions_per_provider
            .saturating_mul(number_of_resets.saturating_add(1));

        let mut inner = self.inner.lock().await;
        let mut blocked = 0;
        for session in inner.sessions.values() {
            if session.is_data_reliability() || session.endpoint_index() != endpoint.index {
                continue;
            }
            let Some(guard) = session.try_acquire() else {
                continue;
            };
            if guard.is_block_listed() {
                blocked += 1;
                if blocked >= max_blocked {
                    return Err(SessionError::MaximumNumberOfBlockListedSessions(
                        self.public_address.to_string(),
                    ));
                }
                continue;
            }
            return Ok(guard);
        }

        if inner.sessions.len() >= self.config.max_sessions_per_provider {
            return Err(SessionError::MaximumNumberOfSessionsExceeded(
                self.public_address.to_string(),
            ));
        }

        let session_id = loop {
            let candidate = rand::rng().random_range(1..i64::MAX);
            if !inner.sessions.contains_key(&candidate) {
                break candidate;
            }
        };
        let session =
            ConsumerSession::new(session_id, endpoint.index, Arc::clone(&endpoint.client), self);
        let guard = session.try_acquire().ok_or_else(|| {
            SessionError::InvariantViolation(format!("new session {session_id} already locked"))
        })?;
        inner.sessions.insert(session_id, session);
        debug!(provider = %self.public_address, session_id, "created consumer session");
        Ok(guard)
    }

    /// Returns the data reliability session if one was created this epoch.
    pub async fn data_reliability_session(&self) -> Option<Arc<ConsumerSession>> {
        self.inner.lock().await.sessions.get(&DATA_RELIABILITY_SESSION_ID).cloned()
    }

    pub(crate) async fn get_or_create_data_reliability_session(
        self: &Arc<Self>,
        endpoint: &ConnectedEndpoint,
    ) -> Arc<ConsumerSession> {
        let mut inner = self.inner.lock().await;
        let session = inner.sessions.entry(DATA_RELIABILITY_SESSION_ID).or_insert_with(|| {
            ConsumerSession::new(
                DATA_RELIABILITY_SESSION_ID,
                endpoint.index,
                Arc::clone(&endpoint.client),
                self,
            )
        });
        Arc::clone(session)
    }

    pub async fn sessions(&self) -> Vec<Arc<ConsumerSession>> {
        self.inner.lock().await.sessions.values().cloned().collect()
    }

    pub async fn endpoint_statuses(&self) -> Vec<EndpointStatus> {
        let inner = self.inner.lock().await;
        inner
            .endpoints
            .iter()
            .zip(&self.endpoint_infos)
            .map(|(state, info)| EndpointStatus {
                network_address: info.network_address.clone(),
                enabled: state.enabled,
                connected: state.client.is_some(),
                connection_refusals: state.connection_refusals,
            })
            .collect()
    }

    /// Closes every open endpoint connection. Used when the record's epoch is purged.
    pub async fn close_connections(&self) {
        let clients: Vec<_> = {
            let mut inner = self.inner.lock().await;
            inner.endpoints.iter_mut().filter_map(|e| e.client.take()).collect()
        };
        for client in clients {
            client.close().await;
        }
    }
}

impl fmt::Debug for ConsumerSessionsWithProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerSessionsWithProvider")
            .field("public_address", &self.public_address)
            .field("pairing_epoch", &self.pairing_epoch)
            .field("max_compute_units", &self.max_compute_units)
            .field("used_compute_units", &self.used_compute_units())
            .finish_non_exhaustive()
    }
}
