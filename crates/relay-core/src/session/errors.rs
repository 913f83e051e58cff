use thiserror::Error;

/// Errors returned by the consumer session manager and its per-provider records.
///
/// Most variants are recoverable conditions the manager handles internally while
/// assembling sessions (a provider is skipped or blocked). Only a handful reach the
/// caller: [`SessionError::PairingListEmpty`], [`SessionError::EpochMismatch`], the
/// data reliability variants and [`SessionError::InvariantViolation`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum SessionError {
    /// An epoch update arrived that is not newer than the current epoch.
    #[error("stale epoch update: received {received}, current {current}")]
    StaleEpochUpdate { received: u64, current: u64 },

    /// No provider is left to serve the request.
    #[error("no pairings available")]
    PairingListEmpty,

    /// The operation targeted an epoch that is no longer current.
    #[error("epoch mismatch: session epoch {session_epoch}, current epoch {current_epoch}")]
    EpochMismatch { session_epoch: u64, current_epoch: u64 },

    /// Every endpoint of the provider hit its connection attempt limit.
    #[error("all endpoints of provider {0} are disabled")]
    AllProviderEndpointsDisabled(String),

    /// No endpoint of the provider currently has a live connection.
    #[error("provider {0} has no connected endpoint")]
    EndpointNotConnected(String),

    /// Granting the compute units would exceed the provider's epoch ceiling.
    #[error("compute units exceeded: used {used} + requested {requested} > max {max}")]
    MaximumComputeUnitsExceeded { used: u64, requested: u64, max: u64 },

    /// Releasing more compute units than are currently reserved.
    #[error("negative compute units: used {used}, releasing {released}")]
    NegativeComputeUnits { used: u64, released: u64 },

    /// The provider already holds the maximum number of sessions.
    #[error("maximum number of sessions exceeded for provider {0}")]
    MaximumNumberOfSessionsExceeded(String),

    /// Too many of the provider's sessions on this endpoint are block-listed.
    #[error("maximum number of block-listed sessions reached for provider {0}")]
    MaximumNumberOfBlockListedSessions(String),

    /// A failure was reported on a session that was already block-listed.
    #[error("session {0} is already block-listed")]
    SessionIsAlreadyBlockListed(i64),

    /// The address was expected in the valid-address list but was not there.
    #[error("provider {0} is not in the valid address list")]
    AddressIndexWasNotFound(String),

    /// Data reliability was asked for a pairing index past the pairing length.
    #[error("data reliability index {index} out of range for pairing of {len}")]
    DataReliabilityIndexOutOfRange { index: u64, len: u64 },

    /// Data reliability picked the same provider that served the original relay.
    #[error("data reliability index points at the original provider {0}")]
    DataReliabilityIndexRequestedIsOriginalProvider(String),

    /// The provider's data reliability session was block-listed earlier this epoch.
    #[error("data reliability session of provider {0} is block-listed")]
    DataReliabilitySessionBlockListed(String),

    /// The data reliability provider was already reported for a conflict.
    #[error("provider {0} was already reported for a conflict")]
    DataReliabilityAlreadyReported(String),

    /// The probe did not complete within the probe timeout.
    #[error("probe to provider {0} timed out")]
    ProbeTimeout(String),

    /// The provider answered the probe with a different guid.
    #[error("probe guid mismatch: sent {sent}, received {received}")]
    ProbeGuidMismatch { sent: u64, received: u64 },

    /// The provider answered the probe but reported no latest block.
    #[error("probe to provider {0} returned latest block 0")]
    ProbeZeroLatestBlock(String),

    /// The probe request itself failed at the transport layer.
    #[error("probe to provider {address} failed: {reason}")]
    ProbeFailed { address: String, reason: String },

    /// The batch of epoch probes did not finish in time.
    #[error("probing providers timed out after {0}ms")]
    ProbeBatchTimeout(u64),

    /// An internal consistency check failed; this is not a recoverable condition.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

impl SessionError {
    #[must_use]
    pub fn is_epoch_mismatch(&self) -> bool {
        matches!(self, Self::EpochMismatch { .. })
    }

    /// Returns `true` for errors that indicate a bug or corrupted state.
    #[must_use]
    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, Self::InvariantViolation(_))
    }

    /// Returns `true` if asking for sessions again may succeed.
    ///
    /// An empty pairing recovers through a reset or the next epoch update, and an
    /// epoch mismatch recovers by retrying against the new epoch.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::PairingListEmpty |
                Self::EpochMismatch { .. } |
                Self::MaximumComputeUnitsExceeded { .. } |
                Self::MaximumNumberOfSessionsExceeded(_) |
                Self::ProbeTimeout(_)
        )
    }

    /// Wraps an unexpected error in an [`SessionError::InvariantViolation`].
    pub(crate) fn unexpected(context: &str, err: &Self) -> Self {
        Self::InvariantViolation(format!("{context}: {err}"))
    }
}

/// Failure class of a relay, determined by the caller from the provider's reply.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum RelayFailure {
    /// Transport or provider error with no extra consequence beyond the session.
    #[error("relay failed: {0}")]
    Transient(String),

    /// The provider rejected the session because its relay number or CU state diverged.
    /// Block-lists the session immediately.
    #[error("session out of sync: {0}")]
    SessionOutOfSync(String),

    /// The provider must be removed from the valid-address list for this epoch.
    #[error("provider must be blocked: {0}")]
    BlockProvider(String),

    /// The provider must be removed and reported to the chain.
    #[error("provider must be blocked and reported: {0}")]
    ReportAndBlockProvider(String),
}

impl RelayFailure {
    #[must_use]
    pub fn is_session_sync_loss(&self) -> bool {
        matches!(self, Self::SessionOutOfSync(_))
    }

    #[must_use]
    pub fn should_block_provider(&self) -> bool {
        matches!(self, Self::BlockProvider(_) | Self::ReportAndBlockProvider(_))
    }

    #[must_use]
    pub fn should_report_provider(&self) -> bool {
        matches!(self, Self::ReportAndBlockProvider(_))
    }

    /// Returns a static string representation for metrics labels.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient(_) => "transient",
            Self::SessionOutOfSync(_) => "session_out_of_sync",
            Self::BlockProvider(_) => "block_provider",
            Self::ReportAndBlockProvider(_) => "report_and_block_provider",
        }
    }
}

/// Errors surfaced by a [`ProviderConnector`](super::client::ProviderConnector) or
/// [`ProviderClient`](super::client::ProviderClient).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ClientError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("request timeout")]
    Timeout,

    #[error("connection closed")]
    Closed,

    /// The remote side answered with an error.
    #[error("remote error: {0}")]
    Remote(String),
}
