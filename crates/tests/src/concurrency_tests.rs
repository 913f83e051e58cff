//! Concurrency and accounting invariants
//!
//! Many tasks share one manager: no session may be held by two callers at once,
//! and a provider's used compute units always equal what completed relays
//! committed plus what in-flight relays reserved.

use crate::mock_infrastructure::{
    create_test_harness, create_test_pairing, provider_name, test_sessions_config,
};
use futures::future::join_all;
use parking_lot::Mutex;
use proptest::prelude::*;
use relay_core::session::{ConsumerSessionManager, RelayCompletion, RelayFailure, SessionRequest};
use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

fn completion() -> RelayCompletion {
    RelayCompletion::new(Duration::from_millis(1), Duration::from_millis(5))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sessions_are_never_shared() {
    let harness =
        create_test_harness(test_sessions_config(), create_test_pairing(2, u64::MAX / 4)).await;
    let manager = harness.manager.clone();
    let held: Arc<Mutex<HashSet<(Arc<str>, i64)>>> = Arc::new(Mutex::new(HashSet::new()));
    let committed = Arc::new(AtomicU64::new(0));

    let tasks = (0..8).map(|task| {
        let manager = manager.clone();
        let held = held.clone();
        let committed = committed.clone();
        tokio::spawn(async move {
            for round in 0..50_u64 {
                let compute_units = 1 + (round % 5);
                let sessions = manager.get_sessions(&SessionRequest::new(compute_units)).await;
                let Ok(sessions) = sessions else {
                    continue;
                };
                for (address, info) in sessions {
                    let key = (address.clone(), info.session.session_id());
                    assert!(held.lock().insert(key.clone()), "session {key:?} handed out twice");
                    tokio::task::yield_now().await;
                    held.lock().remove(&key);

                    if (task + round) % 4 == 0 {
                        let failure = RelayFailure::Transient("flaky".into());
                        manager.on_session_failure(info.session, &failure).unwrap();
                    } else {
                        manager.on_session_done(info.session, &completion()).unwrap();
                        committed.fetch_add(compute_units, Ordering::SeqCst);
                    }
                }
            }
        })
    });
    for result in join_all(tasks).await {
        result.expect("task should not panic");
    }

    let mut used = 0;
    let mut successful = 0;
    for i in 1..=2 {
        let provider = manager.provider(&provider_name(i)).unwrap();
        used += provider.used_compute_units();
        successful += provider.successful_compute_units();
    }
    assert_eq!(used, successful, "nothing should stay reserved once every relay finished");
    assert_eq!(successful, committed.load(Ordering::SeqCst));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_epoch_updates_keep_order() {
    let harness = create_test_harness(test_sessions_config(), create_test_pairing(1, 1000)).await;
    let manager = harness.manager.clone();

    let updates = (2..=20_u64).map(|epoch| {
        let manager = manager.clone();
        tokio::spawn(async move { manager.update_all_providers(epoch, create_test_pairing(2, 1000)).await })
    });
    let results = join_all(updates).await;
    let accepted = results.into_iter().filter(|r| matches!(r, Ok(Ok(())))).count();

    assert!(accepted >= 1);
    assert_eq!(manager.current_epoch(), 20, "the highest epoch always wins");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sessions_keep_working_during_epoch_updates() {
    let harness = create_test_harness(test_sessions_config(), create_test_pairing(3, 1_000_000)).await;
    let manager = harness.manager.clone();

    let updater = {
        let manager = manager.clone();
        tokio::spawn(async move {
            for epoch in 2..=10 {
                manager.update_all_providers(epoch, create_test_pairing(3, 1_000_000)).await.unwrap();
                tokio::task::yield_now().await;
            }
        })
    };

    let workers = (0..4).map(|_| {
        let manager = manager.clone();
        tokio::spawn(async move {
            for _ in 0..40 {
                if let Ok(sessions) = manager.get_sessions(&SessionRequest::new(2)).await {
                    for info in sessions.into_values() {
                        manager.on_session_done(info.session, &completion()).unwrap();
                    }
                }
            }
        })
    });

    updater.await.expect("updater should not panic");
    for result in join_all(workers).await {
        result.expect("worker should not panic");
    }
    assert_eq!(manager.current_epoch(), 10);
}

#[derive(Debug, Clone)]
enum Outcome {
    Done,
    Failed,
    Unused,
    Dropped,
}

fn outcome() -> impl Strategy<Value = Outcome> {
    prop_oneof![
        Just(Outcome::Done),
        Just(Outcome::Failed),
        Just(Outcome::Unused),
        Just(Outcome::Dropped),
    ]
}

async fn run_outcomes(manager: &ConsumerSessionManager, steps: &[(u64, Outcome)]) -> u64 {
    let mut committed = 0;
    for (compute_units, outcome) in steps {
        let Ok(sessions) = manager.get_sessions(&SessionRequest::new(*compute_units)).await else {
            continue;
        };
        for info in sessions.into_values() {
            match outcome {
                Outcome::Done => {
                    manager.on_session_done(info.session, &completion()).unwrap();
                    committed += compute_units;
                }
                Outcome::Failed => {
                    let failure = RelayFailure::Transient("flaky".into());
                    manager.on_session_failure(info.session, &failure).unwrap();
                }
                Outcome::Unused => manager.on_session_unused(info.session).unwrap(),
                Outcome::Dropped => drop(info),
            }
        }
    }
    committed
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_compute_units_are_conserved(
        steps in proptest::collection::vec((1_u64..50, outcome()), 1..40),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("runtime should build");

        let (used, successful, committed) = runtime.block_on(async {
            let harness = create_test_harness(test_sessions_config(), create_test_pairing(2, 500)).await;
            let committed = run_outcomes(&harness.manager, &steps).await;

            let mut used = 0;
            let mut successful = 0;
            for i in 1..=2 {
                let provider = harness.manager.provider(&provider_name(i)).unwrap();
                prop_assert!(provider.used_compute_units() <= provider.max_compute_units());
                used += provider.used_compute_units();
                successful += provider.successful_compute_units();
            }
            Ok((used, successful, committed))
        })?;

        prop_assert_eq!(used, successful);
        prop_assert_eq!(successful, committed);
    }
}
