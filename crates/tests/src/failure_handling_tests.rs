//! Tests for relay failure handling
//!
//! Covers session block-listing, provider blocking and reporting, the rule that
//! blocks providers which never served a relay, recovery through pairing resets,
//! and disabling unreachable endpoints.

use crate::mock_infrastructure::{
    create_test_harness, create_test_pairing, endpoint_address, test_sessions_config,
    EndpointBehavior,
};
use relay_core::{
    config::SessionsConfig,
    session::{ConsumerSessionManager, RelayCompletion, RelayFailure, SessionError, SessionRequest},
};
use std::{sync::Arc, time::Duration};

fn transient() -> RelayFailure {
    RelayFailure::Transient("connection reset".to_string())
}

fn completion() -> RelayCompletion {
    RelayCompletion::new(Duration::from_millis(10), Duration::from_millis(10)).with_blocks(50, 50)
}

async fn fail_once(manager: &ConsumerSessionManager, failure: &RelayFailure) -> Arc<str> {
    let sessions = manager.get_sessions(&SessionRequest::new(10)).await.unwrap();
    let (address, info) = sessions.into_iter().next().unwrap();
    manager.on_session_failure(info.session, failure).unwrap();
    address
}

#[tokio::test]
async fn test_failure_releases_reservation_and_counts() {
    let harness = create_test_harness(test_sessions_config(), create_test_pairing(1, 1000)).await;
    let manager = &harness.manager;

    fail_once(manager, &transient()).await;

    let provider = manager.provider("provider-1").unwrap();
    assert_eq!(provider.used_compute_units(), 0, "failed relay must release its reservation");

    let sessions = provider.sessions().await;
    assert_eq!(sessions.len(), 1);
    let info = manager.get_sessions(&SessionRequest::new(10)).await.unwrap();
    let session = &info["provider-1"].session;
    assert_eq!(session.consecutive_failures(), 1);
    assert_eq!(session.errors_count(), 1);
    assert!(!session.is_block_listed());
    assert_eq!(harness.optimizer.failures(), vec!["provider-1".to_string()]);
}

#[tokio::test]
async fn test_success_resets_consecutive_failures() {
    let harness = create_test_harness(test_sessions_config(), create_test_pairing(1, 1000)).await;
    let manager = &harness.manager;

    fail_once(manager, &transient()).await;
    fail_once(manager, &transient()).await;

    let info = manager.get_sessions(&SessionRequest::new(10)).await.unwrap();
    let info = info.into_values().next().unwrap();
    assert_eq!(info.session.consecutive_failures(), 2);
    manager.on_session_done(info.session, &completion()).unwrap();

    let info = manager.get_sessions(&SessionRequest::new(10)).await.unwrap();
    let session = &info["provider-1"].session;
    assert_eq!(session.consecutive_failures(), 0);
    assert_eq!(session.errors_count(), 2, "total errors are kept");
}

#[tokio::test]
async fn test_session_block_listed_after_exceeding_failures() {
    let harness = create_test_harness(test_sessions_config(), create_test_pairing(2, 1000)).await;
    let manager = &harness.manager;

    // A successful relay first, so the provider is not blocked for serving nothing.
    let info = manager.get_sessions(&SessionRequest::new(10)).await.unwrap();
    let info = info.into_values().next().unwrap();
    let session_id = info.session.session_id();
    manager.on_session_done(info.session, &completion()).unwrap();

    let max_failures = test_sessions_config().max_failures_per_session;
    for _ in 0..=max_failures {
        let address = fail_once(manager, &transient()).await;
        assert_eq!(address.as_ref(), "provider-1");
    }

    let provider = manager.provider("provider-1").unwrap();
    let blocked = provider.sessions().await.into_iter().find(|s| s.session_id() == session_id);
    assert!(blocked.is_some());
    assert_eq!(manager.valid_addresses("", &[]).len(), 2, "provider with served CU stays valid");

    let info = manager.get_sessions(&SessionRequest::new(10)).await.unwrap();
    let session = &info["provider-1"].session;
    assert_ne!(session.session_id(), session_id, "block-listed session must not be reused");
}

#[tokio::test]
async fn test_provider_without_successful_cu_is_blocked_and_reported() {
    let harness = create_test_harness(test_sessions_config(), create_test_pairing(2, 1000)).await;
    let manager = &harness.manager;

    let max_failures = test_sessions_config().max_failures_per_session;
    for _ in 0..=max_failures {
        fail_once(manager, &transient()).await;
    }

    assert!(manager.is_provider_reported("provider-1"));
    let valid: Vec<String> =
        manager.valid_addresses("", &[]).iter().map(ToString::to_string).collect();
    assert_eq!(valid, vec!["provider-2".to_string()]);

    let reported = manager.reported_providers(1);
    assert_eq!(reported[0].errors, max_failures + 1);

    let info = manager.get_sessions(&SessionRequest::new(10)).await.unwrap();
    assert!(info.contains_key("provider-2"));
}

#[tokio::test]
async fn test_zero_cu_blocking_can_be_disabled() {
    let config = SessionsConfig {
        block_provider_without_successful_cu: false,
        ..test_sessions_config()
    };
    let harness = create_test_harness(config, create_test_pairing(2, 1000)).await;
    let manager = &harness.manager;

    for _ in 0..=test_sessions_config().max_failures_per_session {
        fail_once(manager, &transient()).await;
    }

    assert!(!manager.is_provider_reported("provider-1"));
    assert_eq!(manager.valid_addresses("", &[]).len(), 2);
}

#[tokio::test]
async fn test_out_of_sync_block_lists_immediately() {
    let harness = create_test_harness(test_sessions_config(), create_test_pairing(1, 1000)).await;
    let manager = &harness.manager;

    let info = manager.get_sessions(&SessionRequest::new(10)).await.unwrap();
    let info = info.into_values().next().unwrap();
    let session_id = info.session.session_id();
    manager.on_session_done(info.session, &completion()).unwrap();

    fail_once(manager, &RelayFailure::SessionOutOfSync("relay number mismatch".into())).await;

    let info = manager.get_sessions(&SessionRequest::new(10)).await.unwrap();
    assert_ne!(info["provider-1"].session.session_id(), session_id);
}

#[tokio::test]
async fn test_failure_tags_block_and_report() {
    let harness = create_test_harness(test_sessions_config(), create_test_pairing(3, 1000)).await;
    let manager = &harness.manager;
    harness.optimizer.prefer(&["provider-1", "provider-2"]);

    fail_once(manager, &RelayFailure::BlockProvider("unsupported api".into())).await;
    assert!(!manager.valid_addresses("", &[]).iter().any(|a| &**a == "provider-1"));
    assert!(!manager.is_provider_reported("provider-1"), "plain block does not report");

    let address =
        fail_once(manager, &RelayFailure::ReportAndBlockProvider("bad signature".into())).await;
    assert_eq!(address.as_ref(), "provider-2");
    assert!(manager.is_provider_reported("provider-2"));
    assert_eq!(manager.valid_addresses("", &[]).len(), 1);
}

#[tokio::test]
async fn test_exhausted_pairing_resets() {
    let harness = create_test_harness(test_sessions_config(), create_test_pairing(2, 1000)).await;
    let manager = &harness.manager;

    manager.block_provider("provider-1", false, 1, 0, 0, None).unwrap();
    manager.block_provider("provider-2", false, 1, 0, 0, None).unwrap();
    assert!(manager.valid_addresses("", &[]).is_empty());

    let sessions = manager.get_sessions(&SessionRequest::new(10)).await.unwrap();
    assert_eq!(sessions.len(), 1, "reset should restore the pairing");
    assert_eq!(manager.number_of_resets(), 1);
    assert_eq!(manager.valid_addresses("", &[]).len(), 2);
}

#[tokio::test]
async fn test_block_provider_rejects_stale_epoch() {
    let harness = create_test_harness(test_sessions_config(), create_test_pairing(2, 1000)).await;
    let manager = &harness.manager;

    let err = manager.block_provider("provider-1", true, 0, 0, 0, None).unwrap_err();
    assert_eq!(err, SessionError::EpochMismatch { session_epoch: 0, current_epoch: 1 });
    assert_eq!(manager.valid_addresses("", &[]).len(), 2);
    assert!(manager.reported_providers(1).is_empty());

    // Blocking an address that is already gone is not an error.
    manager.block_provider("provider-1", false, 1, 0, 0, None).unwrap();
    manager.block_provider("provider-1", false, 1, 0, 0, None).unwrap();
    assert_eq!(manager.valid_addresses("", &[]).len(), 1);
}

#[tokio::test]
async fn test_unreachable_provider_is_blocked_and_replaced() {
    let config = SessionsConfig { max_consecutive_connection_attempts: 1, ..test_sessions_config() };
    let harness = create_test_harness(config, create_test_pairing(2, 1000)).await;
    harness.connector.set_behavior(&endpoint_address("provider-1"), EndpointBehavior::Refuse);
    let manager = &harness.manager;

    let sessions = manager.get_sessions(&SessionRequest::new(10)).await.unwrap();
    assert!(sessions.contains_key("provider-2"), "request should fall through to provider-2");

    assert!(manager.is_provider_reported("provider-1"));
    let reported = manager.reported_providers(1);
    assert_eq!(reported[0].address, "provider-1");
    assert_eq!(reported[0].disconnections, 1);
    assert_eq!(manager.valid_addresses("", &[]).len(), 1);

    let statuses = manager.provider("provider-1").unwrap().endpoint_statuses().await;
    assert!(!statuses[0].enabled);
}

#[tokio::test]
async fn test_refused_dial_is_retried_before_disabling() {
    let harness = create_test_harness(test_sessions_config(), create_test_pairing(2, 1000)).await;
    harness.connector.set_behavior(&endpoint_address("provider-1"), EndpointBehavior::Refuse);
    let manager = &harness.manager;

    let sessions = manager.get_sessions(&SessionRequest::new(10)).await.unwrap();
    assert!(sessions.contains_key("provider-2"));
    assert!(!manager.is_provider_reported("provider-1"), "one refusal only skips the provider");
    assert_eq!(manager.valid_addresses("", &[]).len(), 2);
}
