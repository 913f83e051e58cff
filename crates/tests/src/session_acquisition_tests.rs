//! Tests for session acquisition and compute unit accounting
//!
//! Covers provider selection through the optimizer, reservation against each
//! provider's compute unit ceiling, session reuse, and routing by addon.

use crate::mock_infrastructure::{
    create_test_harness, create_test_pairing, pairing_entry, pairing_entry_with_addon,
    provider_name, test_sessions_config, MockOptimizer, TestHarness,
};
use bytes::Bytes;
use relay_core::{
    optimizer::OptimizerStrategy,
    session::{
        ConsumerSessionManager, RelayCompletion, SessionError, SessionInfo, SessionRequest,
        DATA_RELIABILITY_SESSION_ID,
    },
    types::{ConsistencyMode, QualityOfServiceReport},
};
use std::time::Duration;

async fn single_session(manager: &ConsumerSessionManager, compute_units: u64) -> SessionInfo {
    let sessions = manager.get_sessions(&SessionRequest::new(compute_units)).await.unwrap();
    assert_eq!(sessions.len(), 1);
    sessions.into_values().next().unwrap()
}

fn completion() -> RelayCompletion {
    RelayCompletion::new(Duration::from_millis(20), Duration::from_millis(50))
        .with_blocks(1000, 1000)
        .with_spec_compute_units(10)
}

#[tokio::test]
async fn test_get_sessions_reserves_compute_units() {
    let harness = create_test_harness(test_sessions_config(), create_test_pairing(3, 1000)).await;
    let manager = &harness.manager;

    let sessions = manager.get_sessions(&SessionRequest::new(10)).await.unwrap();
    assert_eq!(sessions.len(), 1, "default consistency should lock one provider");

    let (address, info) = sessions.into_iter().next().unwrap();
    assert_eq!(address.as_ref(), "provider-1", "mock optimizer picks the first candidate");
    assert_eq!(info.epoch, 1);
    assert_eq!(info.session.latest_relay_cu(), 10);
    assert_eq!(info.session.relay_num(), 1);
    assert_ne!(info.session.session_id(), DATA_RELIABILITY_SESSION_ID);

    let provider = manager.provider("provider-1").unwrap();
    assert_eq!(provider.used_compute_units(), 10);

    let request = info.session.relay_request(info.epoch, Bytes::from_static(b"{}"));
    assert_eq!(request.compute_units, 10);
    assert_eq!(request.relay_num, 1);

    manager.on_session_done(info.session, &completion()).unwrap();
    assert_eq!(provider.used_compute_units(), 10, "committed units stay used");
    assert_eq!(provider.successful_compute_units(), 10);
}

#[tokio::test]
async fn test_session_reused_across_relays() {
    let harness = create_test_harness(test_sessions_config(), create_test_pairing(1, 1000)).await;
    let manager = &harness.manager;

    let first = manager.get_sessions(&SessionRequest::new(10)).await.unwrap();
    let info = first.into_values().next().unwrap();
    let session_id = info.session.session_id();
    manager.on_session_done(info.session, &completion()).unwrap();

    let second = manager.get_sessions(&SessionRequest::new(5)).await.unwrap();
    let info = second.into_values().next().unwrap();
    assert_eq!(info.session.session_id(), session_id, "an unlocked session should be reused");
    assert_eq!(info.session.relay_num(), 2);
    assert_eq!(info.session.cu_sum(), 10);

    let request = info.session.relay_request(info.epoch, Bytes::new());
    assert_eq!(request.compute_units, 15, "relay carries cumulative compute units");
}

#[tokio::test]
async fn test_compute_units_ceiling_excludes_provider() {
    let pairing = vec![pairing_entry("provider-1", 15), pairing_entry("provider-2", 1000)];
    let harness = create_test_harness(test_sessions_config(), pairing).await;
    let manager = &harness.manager;

    let info = manager.get_sessions(&SessionRequest::new(10)).await.unwrap();
    assert!(info.contains_key("provider-1"));
    drop(info);

    // Dropping the guards released the reservation.
    assert_eq!(manager.provider("provider-1").unwrap().used_compute_units(), 0);

    let held = manager.get_sessions(&SessionRequest::new(10)).await.unwrap();
    assert!(held.contains_key("provider-1"));

    // 10 more would exceed provider-1's ceiling of 15.
    let next = manager.get_sessions(&SessionRequest::new(10)).await.unwrap();
    assert!(next.contains_key("provider-2"), "provider over its ceiling should be skipped");
    assert_eq!(manager.provider("provider-1").unwrap().used_compute_units(), 10);
}

#[tokio::test]
async fn test_request_over_every_ceiling_fails() {
    let harness = create_test_harness(test_sessions_config(), create_test_pairing(2, 100)).await;

    let err = harness.manager.get_sessions(&SessionRequest::new(150)).await.unwrap_err();
    assert_eq!(err, SessionError::PairingListEmpty);
    for i in 1..=2 {
        let provider = harness.manager.provider(&provider_name(i)).unwrap();
        assert_eq!(provider.used_compute_units(), 0, "nothing should stay reserved");
    }
}

#[tokio::test]
async fn test_virtual_epoch_extends_ceiling() {
    let harness = create_test_harness(test_sessions_config(), create_test_pairing(1, 100)).await;

    let request = SessionRequest::new(150).with_virtual_epoch(1);
    let sessions = harness.manager.get_sessions(&request).await.unwrap();
    assert_eq!(sessions.len(), 1, "virtual epoch 1 doubles the ceiling");
}

#[tokio::test]
async fn test_unwanted_providers_are_skipped() {
    let harness = create_test_harness(test_sessions_config(), create_test_pairing(3, 1000)).await;

    let request = SessionRequest::new(10).with_unwanted(["provider-1", "provider-2"]);
    let sessions = harness.manager.get_sessions(&request).await.unwrap();
    assert_eq!(sessions.keys().map(|k| &**k).collect::<Vec<&str>>(), vec!["provider-3"]);

    let request = SessionRequest::new(10).with_unwanted(["provider-1", "provider-2", "provider-3"]);
    let err = harness.manager.get_sessions(&request).await.unwrap_err();
    assert_eq!(err, SessionError::PairingListEmpty);
}

#[tokio::test]
async fn test_optimizer_preference_is_followed() {
    let harness = create_test_harness(test_sessions_config(), create_test_pairing(3, 1000)).await;
    harness.optimizer.prefer(&["provider-2"]);

    let sessions = harness.manager.get_sessions(&SessionRequest::new(10)).await.unwrap();
    assert!(sessions.contains_key("provider-2"));
}

#[tokio::test]
async fn test_select_all_providers_fans_out() {
    let harness = create_test_harness(test_sessions_config(), create_test_pairing(3, 1000)).await;

    let request = SessionRequest::new(10).with_consistency(ConsistencyMode::SelectAllProviders);
    let sessions = harness.manager.get_sessions(&request).await.unwrap();
    assert_eq!(sessions.len(), 3, "every valid provider should get a session");
    for i in 1..=3 {
        let provider = harness.manager.provider(&provider_name(i)).unwrap();
        assert_eq!(provider.used_compute_units(), 10);
    }
}

#[tokio::test]
async fn test_cost_strategy_never_fans_out() {
    let harness = TestHarness::with_optimizer(
        test_sessions_config(),
        MockOptimizer::new(OptimizerStrategy::Cost),
    );
    harness.manager.update_all_providers(1, create_test_pairing(3, 1000)).await.unwrap();

    let request = SessionRequest::new(10).with_consistency(ConsistencyMode::SelectAllProviders);
    let sessions = harness.manager.get_sessions(&request).await.unwrap();
    assert_eq!(sessions.len(), 1);
}

#[tokio::test]
async fn test_addon_routes_to_supporting_providers() {
    let pairing = vec![
        pairing_entry("provider-1", 1000),
        pairing_entry_with_addon("provider-2", 1000, "archive"),
    ];
    let harness = create_test_harness(test_sessions_config(), pairing).await;
    let manager = &harness.manager;

    let request = SessionRequest::new(10).with_addon("archive");
    let sessions = manager.get_sessions(&request).await.unwrap();
    assert!(sessions.contains_key("provider-2"), "only provider-2 serves the addon");
    assert_eq!(manager.valid_addresses("archive", &[]).len(), 1);
    assert_eq!(manager.valid_addresses("", &[]).len(), 2);

    let err = manager.get_sessions(&SessionRequest::new(10).with_addon("trace")).await.unwrap_err();
    assert_eq!(err, SessionError::PairingListEmpty, "no provider serves the addon");
}

#[tokio::test]
async fn test_reported_providers_travel_with_sessions() {
    let harness = create_test_harness(test_sessions_config(), create_test_pairing(2, 1000)).await;
    let manager = &harness.manager;

    manager.block_provider("provider-1", true, 1, 0, 2, None).unwrap();

    let sessions = manager.get_sessions(&SessionRequest::new(10)).await.unwrap();
    let info = sessions.get("provider-2").expect("blocked provider should not be chosen");
    assert_eq!(info.reported_providers.len(), 1);
    assert_eq!(info.reported_providers[0].address, "provider-1");
    assert_eq!(info.reported_providers[0].errors, 2);
}

#[tokio::test]
async fn test_excellence_report_attached_after_first_relay() {
    let harness = create_test_harness(test_sessions_config(), create_test_pairing(1, 1000)).await;
    let manager = &harness.manager;
    let report = QualityOfServiceReport { latency: 0.5, availability: 1.0, sync: 0.75 };
    harness.optimizer.set_excellence_report(report);

    let info = single_session(manager, 1).await;
    assert!(info.session.qos().last_excellence_qos_report.is_none());
    manager.on_session_done(info.session, &completion()).unwrap();

    let info = single_session(manager, 1).await;
    assert_eq!(info.session.qos().last_excellence_qos_report, Some(report));
    manager.on_session_done(info.session, &completion()).unwrap();

    let samples = harness.sink.samples();
    assert_eq!(samples.len(), 2);
    assert_eq!(samples[1].excellence_qos, Some(report));
    assert_eq!(samples[1].relay_num, 2);
}

#[tokio::test]
async fn test_session_done_feeds_optimizer_and_sink() {
    let harness = create_test_harness(test_sessions_config(), create_test_pairing(1, 1000)).await;
    let manager = &harness.manager;

    let info = single_session(manager, 10).await;
    manager.on_session_done(info.session, &completion().hanging()).unwrap();

    let relays = harness.optimizer.relays();
    assert_eq!(relays.len(), 1);
    assert_eq!(relays[0].provider, "provider-1");
    assert_eq!(relays[0].compute_units, 10);
    assert_eq!(relays[0].synced_block, 1000);
    assert!(relays[0].hanging_api);

    let samples = harness.sink.samples();
    assert_eq!(samples.len(), 1);
    assert_eq!(samples[0].latest_block, 1000);
    let qos = samples[0].qos.expect("qos should be published");
    assert!((qos.latency - 1.0).abs() < f64::EPSILON, "faster than expected scores 1");
}

#[tokio::test]
async fn test_unused_session_releases_reservation() {
    let harness = create_test_harness(test_sessions_config(), create_test_pairing(1, 1000)).await;
    let manager = &harness.manager;

    let info = single_session(manager, 40).await;
    manager.on_session_unused(info.session).unwrap();

    let provider = manager.provider("provider-1").unwrap();
    assert_eq!(provider.used_compute_units(), 0);
    assert_eq!(provider.successful_compute_units(), 0);
}

#[tokio::test]
async fn test_increase_cu_only_skips_qos() {
    let harness = create_test_harness(test_sessions_config(), create_test_pairing(1, 1000)).await;
    let manager = &harness.manager;

    let info = single_session(manager, 7).await;
    manager.on_session_done_increase_cu_only(info.session).unwrap();

    let provider = manager.provider("provider-1").unwrap();
    assert_eq!(provider.used_compute_units(), 7);
    assert_eq!(provider.successful_compute_units(), 7);
    assert!(harness.sink.samples().is_empty(), "no QoS should be published");
    assert!(harness.optimizer.relays().is_empty());
}

#[tokio::test]
async fn test_uninitialized_manager_has_no_sessions() {
    let harness = TestHarness::new(test_sessions_config());
    assert!(!harness.manager.is_initialized());

    let err = harness.manager.get_sessions(&SessionRequest::new(1)).await.unwrap_err();
    assert_eq!(err, SessionError::PairingListEmpty);
    assert_eq!(harness.manager.number_of_resets(), 0, "an empty pairing is not reset");
}
