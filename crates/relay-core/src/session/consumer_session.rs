use super::{client::ProviderClient, provider::ConsumerSessionsWithProvider};
use crate::types::{QualityOfServiceReport, RelayRequest};
use bytes::Bytes;
use std::{
    collections::VecDeque,
    fmt,
    ops::Deref,
    sync::{Arc, Weak},
    time::Duration,
};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::warn;

/// Session id reserved for the single data reliability session of a provider.
pub const DATA_RELIABILITY_SESSION_ID: i64 = 0;

/// Most recent latency scores a session keeps for its percentile.
pub const LATENCY_SCORE_WINDOW: usize = 256;

/// Tunables of the per-session QoS computation, taken from
/// [`SessionsConfig::qos_parameters`](crate::config::SessionsConfig::qos_parameters).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QosParameters {
    /// Percentile of the sorted latency scores reported as the latency score.
    pub percentile: f64,
    /// Fraction of the pairing that must agree on a block before sync is scored.
    pub min_providers_for_sync: f64,
    /// Downtime fraction at which availability drops to zero.
    pub availability_percentage: f64,
}

impl Default for QosParameters {
    fn default() -> Self {
        Self { percentile: 0.9, min_providers_for_sync: 0.6, availability_percentage: 0.1 }
    }
}

/// Running QoS counters of one session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QoSInfo {
    pub last_qos_report: Option<QualityOfServiceReport>,
    pub last_excellence_qos_report: Option<QualityOfServiceReport>,
    /// The last [`LATENCY_SCORE_WINDOW`] latency scores in ascending order.
    pub latency_scores: Vec<f64>,
    /// The same scores in arrival order, oldest first.
    latency_history: VecDeque<f64>,
    pub sync_score_sum: u64,
    pub total_sync_score: u64,
    pub total_relays: u64,
    pub answered_relays: u64,
}

/// What the caller observed about a successful relay.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayCompletion {
    /// Latest block the provider reported serving.
    pub latest_served_block: i64,
    /// Compute units the chain charges for the API, fed to the optimizer.
    pub spec_compute_units: u64,
    pub latency: Duration,
    pub expected_latency: Duration,
    /// Block height the caller expected the provider to be at.
    pub expected_block_height: i64,
    /// Number of providers that agreed on the expected block height.
    pub providers_agreeing: usize,
    pub pairing_size: u64,
    pub hanging_api: bool,
}

impl RelayCompletion {
    #[must_use]
    pub fn new(latency: Duration, expected_latency: Duration) -> Self {
        Self {
            latest_served_block: 0,
            spec_compute_units: 0,
            latency,
            expected_latency,
            expected_block_height: 0,
            providers_agreeing: 0,
            pairing_size: 0,
            hanging_api: false,
        }
    }

    #[must_use]
    pub fn with_blocks(mut self, latest_served_block: i64, expected_block_height: i64) -> Self {
        self.latest_served_block = latest_served_block;
        self.expected_block_height = expected_block_height;
        self
    }

    #[must_use]
    pub fn with_sync_quorum(mut self, providers_agreeing: usize, pairing_size: u64) -> Self {
        self.providers_agreeing = providers_agreeing;
        self.pairing_size = pairing_size;
        self
    }

    #[must_use]
    pub fn with_spec_compute_units(mut self, spec_compute_units: u64) -> Self {
        self.spec_compute_units = spec_compute_units;
        self
    }

    #[must_use]
    pub fn hanging(mut self) -> Self {
        self.hanging_api = true;
        self
    }

    /// Blocks the provider is behind the expected height; negative when ahead.
    #[must_use]
    pub fn block_height_diff(&self) -> i64 {
        self.expected_block_height - self.latest_served_block
    }
}

/// Mutable state of a session, only reachable through a [`SessionGuard`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionState {
    pub(crate) cu_sum: u64,
    pub(crate) latest_relay_cu: u64,
    pub(crate) relay_num: u64,
    pub(crate) consecutive_failures: u64,
    pub(crate) errors_count: u64,
    pub(crate) block_listed: bool,
    pub(crate) qos: QoSInfo,
    pub(crate) latest_block: i64,
}

impl SessionState {
    /// Compute units committed on this session.
    #[must_use]
    pub fn cu_sum(&self) -> u64 {
        self.cu_sum
    }

    /// Compute units reserved for the in-flight relay.
    #[must_use]
    pub fn latest_relay_cu(&self) -> u64 {
        self.latest_relay_cu
    }

    #[must_use]
    pub fn relay_num(&self) -> u64 {
        self.relay_num
    }

    #[must_use]
    pub fn consecutive_failures(&self) -> u64 {
        self.consecutive_failures
    }

    #[must_use]
    pub fn errors_count(&self) -> u64 {
        self.errors_count
    }

    #[must_use]
    pub fn is_block_listed(&self) -> bool {
        self.block_listed
    }

    #[must_use]
    pub fn qos(&self) -> &QoSInfo {
        &self.qos
    }

    #[must_use]
    pub fn latest_block(&self) -> i64 {
        self.latest_block
    }

    /// Folds one answered relay into the session QoS and stores the resulting report.
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub(crate) fn calculate_qos(
        &mut self,
        latency: Duration,
        expected_latency: Duration,
        block_height_diff: i64,
        providers_agreeing: usize,
        pairing_size: u64,
        params: &QosParameters,
    ) -> QualityOfServiceReport {
        let qos = &mut self.qos;
        qos.total_relays += 1;
        qos.answered_relays += 1;

        let downtime = (qos.total_relays - qos.answered_relays) as f64 / qos.total_relays as f64;
        let availability = ((params.availability_percentage - downtime) /
            params.availability_percentage)
            .clamp(0.0, 1.0);

        let latency_score = if latency.is_zero() {
            1.0
        } else {
            (expected_latency.as_secs_f64() / latency.as_secs_f64()).min(1.0)
        };
        if qos.latency_history.len() == LATENCY_SCORE_WINDOW {
            if let Some(oldest) = qos.latency_history.pop_front() {
                let position = qos.latency_scores.partition_point(|score| *score < oldest);
                qos.latency_scores.remove(position);
            }
        }
        qos.latency_history.push_back(latency_score);
        let position = qos.latency_scores.partition_point(|score| *score < latency_score);
        qos.latency_scores.insert(position, latency_score);
        let index = ((qos.latency_scores.len() as f64 * params.percentile) as usize)
            .min(qos.latency_scores.len() - 1);
        let latency = qos.latency_scores[index];

        let quorum = (pairing_size as f64 * params.min_providers_for_sync).ceil();
        if providers_agreeing as f64 > quorum {
            if block_height_diff <= 0 {
                qos.sync_score_sum += 1;
            }
            qos.total_sync_score += 1;
        }
        let sync = if qos.total_sync_score == 0 {
            1.0
        } else {
            qos.sync_score_sum as f64 / qos.total_sync_score as f64
        };

        let report = QualityOfServiceReport { latency, availability, sync };
        qos.last_qos_report = Some(report);
        report
    }
}

/// One session to a provider endpoint.
///
/// The record is shared between the provider's session table and whoever holds its
/// lock. All mutable state sits behind the lock; the fields here never change.
pub struct ConsumerSession {
    session_id: i64,
    endpoint_index: usize,
    provider_address: Arc<str>,
    client: Arc<dyn ProviderClient>,
    parent: Weak<ConsumerSessionsWithProvider>,
    state: Arc<Mutex<SessionState>>,
}

impl ConsumerSession {
    pub(crate) fn new(
        session_id: i64,
        endpoint_index: usize,
        client: Arc<dyn ProviderClient>,
        parent: &Arc<ConsumerSessionsWithProvider>,
    ) -> Arc<Self> {
        Arc::new(Self {
            session_id,
            endpoint_index,
            provider_address: Arc::clone(parent.public_address()),
            client,
            parent: Arc::downgrade(parent),
            state: Arc::new(Mutex::new(SessionState::default())),
        })
    }

    #[must_use]
    pub fn session_id(&self) -> i64 {
        self.session_id
    }

    /// Index of the provider endpoint this session was opened on.
    #[must_use]
    pub fn endpoint_index(&self) -> usize {
        self.endpoint_index
    }

    #[must_use]
    pub fn provider_address(&self) -> &Arc<str> {
        &self.provider_address
    }

    #[must_use]
    pub fn is_data_reliability(&self) -> bool {
        self.session_id == DATA_RELIABILITY_SESSION_ID
    }

    /// Returns the owning provider record, or `None` once its epoch has been dropped.
    pub(crate) fn parent(&self) -> Option<Arc<ConsumerSessionsWithProvider>> {
        self.parent.upgrade()
    }

    /// Locks the session if nobody else holds it.
    pub(crate) fn try_acquire(self: &Arc<Self>) -> Option<SessionGuard> {
        let state = Arc::clone(&self.state).try_lock_owned().ok()?;
        Some(SessionGuard { session: Arc::clone(self), state })
    }

    pub(crate) async fn acquire(self: &Arc<Self>) -> SessionGuard {
        let state = Arc::clone(&self.state).lock_owned().await;
        SessionGuard { session: Arc::clone(self), state }
    }
}

impl fmt::Debug for ConsumerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerSession")
            .field("session_id", &self.session_id)
            .field("endpoint_index", &self.endpoint_index)
            .field("provider_address", &self.provider_address)
            .finish_non_exhaustive()
    }
}

/// Exclusive hold on a [`ConsumerSession`].
///
/// Handed out by `get_sessions` and `get_data_reliability_session` and consumed by
/// exactly one completion callback. Dropping a guard without reporting releases
/// whatever compute units it still has reserved.
pub struct SessionGuard {
    session: Arc<ConsumerSession>,
    state: OwnedMutexGuard<SessionState>,
}

impl SessionGuard {
    #[must_use]
    pub fn session(&self) -> &Arc<ConsumerSession> {
        &self.session
    }

    #[must_use]
    pub fn session_id(&self) -> i64 {
        self.session.session_id
    }

    #[must_use]
    pub fn provider_address(&self) -> &Arc<str> {
        &self.session.provider_address
    }

    /// Connection to send the relay on.
    #[must_use]
    pub fn client(&self) -> Arc<dyn ProviderClient> {
        Arc::clone(&self.session.client)
    }

    /// Builds the relay for this session. `compute_units` is cumulative and includes
    /// the reservation of the current relay.
    #[must_use]
    pub fn relay_request(&self, epoch: u64, data: Bytes) -> RelayRequest {
        RelayRequest {
            session_id: self.session.session_id,
            relay_num: self.state.relay_num,
            compute_units: self.state.cu_sum + self.state.latest_relay_cu,
            epoch,
            data,
        }
    }

    pub(crate) fn state_mut(&mut self) -> &mut SessionState {
        &mut self.state
    }
}

impl Deref for SessionGuard {
    type Target = SessionState;

    fn deref(&self) -> &SessionState {
        &self.state
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let reserved = std::mem::take(&mut self.state.latest_relay_cu);
        if reserved == 0 {
            return;
        }
        if let Some(parent) = self.session.parent() {
            if let Err(err) = parent.decrease_used_compute_units(reserved) {
                warn!(
                    provider = %self.session.provider_address,
                    session_id = self.session.session_id,
                    error = %err,
                    "failed to release compute units of dropped session"
                );
            }
        }
    }
}

impl fmt::Debug for SessionGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionGuard")
            .field("session", &self.session)
            .field("state", &*self.state)
            .finish()
    }
}
