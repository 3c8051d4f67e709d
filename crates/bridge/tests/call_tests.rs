//! Call Orchestration Tests
//!
//! Full request/response exchanges through the bridge against a scripted
//! device.
//!
//! # Test Scenarios
//! - Encode, chunk, send, reassemble and decode round trip
//! - Release of the session while a call is in flight
//! - Steal during a call on the loopback transport
//! - Configuration replacement keeps the working descriptor on failure
//! - Driver problem reclassification of `Initialize` failures
//! - Reload of the persisted configuration
//!
//! Run with: `cargo test -p bridge --test call_tests`

use bridge::config::ListenSettings;
use bridge::storage::{MemoryStateStore, PersistedState};
use bridge::test_utils::{Fault, MockTransport, Operation};
use bridge::transport::{TransportSet, UdpTransport};
use bridge::{Bridge, UdevStatus};
use common::Error;
use protocol::test_utils::{sample_descriptor, signed_configuration, signing_key, trusted_keys_for};
use protocol::{DevicePath, Framing, Session};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;

const DEVICE: DevicePath = DevicePath::Hid(1);

struct Harness {
    bridge: Arc<Bridge>,
    mock: Arc<MockTransport>,
    store: Arc<MemoryStateStore>,
}

fn harness_with(mock: MockTransport, state: PersistedState) -> Harness {
    let mock = Arc::new(mock);
    let store = Arc::new(MemoryStateStore::new(state));
    let bridge = Bridge::new(
        TransportSet::new().with(mock.clone()),
        trusted_keys_for(&[&signing_key(1)]),
        store.clone(),
        &ListenSettings::default(),
    );
    Harness {
        bridge: Arc::new(bridge),
        mock,
        store,
    }
}

async fn configured() -> Harness {
    let harness = harness_with(MockTransport::hid(&[DEVICE]), PersistedState::default());
    harness
        .bridge
        .configure(&signed_configuration(&signing_key(1), None))
        .await
        .unwrap();
    harness
}

// ============================================================================
// Round Trip
// ============================================================================

mod round_trip {
    use super::*;

    #[tokio::test]
    async fn test_ping_success() {
        let h = configured().await;
        let session = h.bridge.acquire(DEVICE, None, false).await.unwrap();

        let response = h
            .bridge
            .call(&session.to_string(), "Ping", &json!({"message": "hello"}))
            .await
            .unwrap();

        assert_eq!(response.message_type, "Success");
        assert_eq!(response.message, json!({"message": null}));

        let sent = h.mock.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, session);
        assert_eq!(sent[0].1.type_id, 1);
    }

    #[tokio::test]
    async fn test_multi_chunk_exchange() {
        let h = configured().await;
        let features = sample_descriptor()
            .encode(
                "Features",
                &json!({
                    "vendor": "example.com",
                    "major_version": 2,
                    "session_id": "ab".repeat(64),
                    "languages": vec!["english"; 20],
                }),
            )
            .unwrap();
        h.mock.set_responder(move |_| Some(features.clone()));

        let session = h.bridge.acquire(DEVICE, None, false).await.unwrap();
        let long_text = "x".repeat(300);
        let response = h
            .bridge
            .call(&session.to_string(), "Ping", &json!({"message": long_text}))
            .await
            .unwrap();

        assert!(h.mock.sent()[0].1.payload.len() > 63);
        assert_eq!(response.message_type, "Features");
        assert_eq!(response.message["vendor"], "example.com");
        assert_eq!(response.message["session_id"], json!("ab".repeat(64)));
        assert_eq!(response.message["languages"].as_array().unwrap().len(), 20);
        assert!(h.mock.receive_count() > 1);
    }

    #[tokio::test]
    async fn test_report_id_devices() {
        let mock = MockTransport::hid(&[DEVICE]).with_framing(Framing::ReportId);
        let h = harness_with(mock, PersistedState::default());
        h.bridge
            .configure(&signed_configuration(&signing_key(1), None))
            .await
            .unwrap();

        let session = h.bridge.acquire(DEVICE, None, false).await.unwrap();
        let response = h
            .bridge
            .call(&session.to_string(), "Initialize", &json!({}))
            .await
            .unwrap();
        assert_eq!(response.message_type, "Success");
    }

    #[tokio::test]
    async fn test_unknown_reply_type_is_error() {
        let h = configured().await;
        h.mock.set_responder(|_| {
            Some(protocol::RawMessage {
                type_id: 500,
                payload: Vec::new(),
            })
        });

        let session = h.bridge.acquire(DEVICE, None, false).await.unwrap();
        let result = h.bridge.call(&session.to_string(), "Ping", &json!({})).await;
        assert!(matches!(result, Err(Error::Protocol(_))));
    }

    #[tokio::test]
    async fn test_repeated_calls_on_one_session() {
        let h = configured().await;
        let session = h.bridge.acquire(DEVICE, None, false).await.unwrap();

        for _ in 0..3 {
            h.bridge
                .call(&session.to_string(), "Ping", &json!({}))
                .await
                .unwrap();
        }
        h.bridge.release(session).await.unwrap();
        assert!(h.mock.open_sessions().is_empty());
    }
}

// ============================================================================
// Input Validation
// ============================================================================

mod validation {
    use super::*;

    #[tokio::test]
    async fn test_malformed_session() {
        let h = configured().await;
        let result = h.bridge.call("not-a-session", "Ping", &json!({})).await;
        assert!(matches!(result, Err(Error::InvalidSession(_))));
    }

    #[tokio::test]
    async fn test_unknown_message_type() {
        let h = configured().await;
        let session = h.bridge.acquire(DEVICE, None, false).await.unwrap();
        let result = h
            .bridge
            .call(&session.to_string(), "Teleport", &json!({}))
            .await;
        assert!(matches!(result, Err(Error::Protocol(_))));
        assert!(h.mock.sent().is_empty());
    }

    #[tokio::test]
    async fn test_unconfigured_call() {
        let h = harness_with(MockTransport::hid(&[DEVICE]), PersistedState::default());
        let session = h.bridge.acquire(DEVICE, None, false).await.unwrap();
        let result = h.bridge.call(&session.to_string(), "Ping", &json!({})).await;
        assert!(matches!(result, Err(Error::NotConfigured)));
    }

    #[tokio::test]
    async fn test_dead_session_is_released() {
        let h = configured().await;
        let result = h.bridge.call("77", "Ping", &json!({})).await;
        assert!(matches!(result, Err(Error::SessionReleased)));
    }
}

// ============================================================================
// Cancellation
// ============================================================================

mod cancellation {
    use super::*;

    #[tokio::test]
    async fn test_release_cancels_pending_call() {
        let h = configured().await;
        h.mock.set_responder(|_| None);
        let session = h.bridge.acquire(DEVICE, None, false).await.unwrap();

        let call = {
            let bridge = h.bridge.clone();
            tokio::spawn(async move {
                bridge
                    .call(&session.to_string(), "Ping", &json!({}))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        h.bridge.release(session).await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), call)
            .await
            .expect("call did not finish after release")
            .unwrap();
        assert!(matches!(result, Err(Error::SessionReleased)));
    }

    #[tokio::test]
    async fn test_steal_cancels_pending_call() {
        let h = configured().await;
        h.mock.hold_replies();
        let first = h.bridge.acquire(DEVICE, None, false).await.unwrap();

        let call = {
            let bridge = h.bridge.clone();
            tokio::spawn(async move { bridge.call(&first.to_string(), "Ping", &json!({})).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        let second = h.bridge.acquire(DEVICE, None, false).await.unwrap();
        assert_ne!(first, second);

        let result = call.await.unwrap();
        assert!(matches!(result, Err(Error::SessionReleased)));

        h.mock.release_replies();
        let response = h
            .bridge
            .call(&second.to_string(), "Ping", &json!({}))
            .await
            .unwrap();
        assert_eq!(response.message_type, "Success");
    }

    #[tokio::test]
    async fn test_steal_during_call_over_loopback() {
        // Emulator socket that never answers
        let emulator = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = emulator.local_addr().unwrap().port();
        if port > u16::MAX - 3 {
            return;
        }
        let path = DevicePath::Udp(port);

        let bridge = Arc::new(Bridge::new(
            TransportSet::new().with(Arc::new(UdpTransport::new(vec![port]))),
            trusted_keys_for(&[&signing_key(1)]),
            Arc::new(MemoryStateStore::default()),
            &ListenSettings::default(),
        ));
        bridge
            .configure(&signed_configuration(&signing_key(1), None))
            .await
            .unwrap();

        let first = bridge.acquire(path, None, false).await.unwrap();
        let call = {
            let bridge = bridge.clone();
            tokio::spawn(async move { bridge.call(&first.to_string(), "Ping", &json!({})).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let second = bridge.acquire(path, None, false).await.unwrap();
        assert_ne!(first, second);
        assert_eq!(bridge.session(path).await.unwrap(), Some(second));

        let result = tokio::time::timeout(Duration::from_secs(5), call)
            .await
            .expect("call did not finish after steal")
            .unwrap();
        assert!(matches!(result, Err(Error::SessionReleased)));

        bridge.shutdown().await;
    }
}

// ============================================================================
// Configuration
// ============================================================================

mod configuration {
    use super::*;

    #[tokio::test]
    async fn test_failed_reconfigure_keeps_working_descriptor() {
        let h = configured().await;
        let expired = signed_configuration(&signing_key(1), Some(1_000));
        assert!(matches!(
            h.bridge.configure(&expired).await,
            Err(Error::ConfigExpired { .. })
        ));

        let session = h.bridge.acquire(DEVICE, None, false).await.unwrap();
        let response = h
            .bridge
            .call(&session.to_string(), "Ping", &json!({}))
            .await
            .unwrap();
        assert_eq!(response.message_type, "Success");
    }

    #[tokio::test]
    async fn test_persisted_configuration_reapplied() {
        let state = PersistedState {
            saved_configuration: Some(signed_configuration(&signing_key(1), None)),
            ..Default::default()
        };
        let h = harness_with(MockTransport::hid(&[DEVICE]), state);

        assert!(h.bridge.info().await.configured);
        let session = h.bridge.acquire(DEVICE, None, false).await.unwrap();
        assert!(
            h.bridge
                .call(&session.to_string(), "Ping", &json!({}))
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_info_reports_configuration() {
        let h = harness_with(MockTransport::hid(&[DEVICE]), PersistedState::default());
        let info = h.bridge.info().await;
        assert!(!info.configured);
        assert_eq!(info.version, env!("CARGO_PKG_VERSION"));

        h.bridge
            .configure(&signed_configuration(&signing_key(1), None))
            .await
            .unwrap();
        assert!(h.bridge.info().await.configured);
        assert!(h.store.snapshot().saved_configuration.is_some());
    }
}

// ============================================================================
// Driver Health
// ============================================================================

mod driver_health {
    use super::*;

    #[tokio::test]
    async fn test_initialize_failure_is_driver_problem() {
        let h = configured().await;
        let session = h.bridge.acquire(DEVICE, None, false).await.unwrap();

        h.mock.fail(Operation::Send, Fault::Transfer);
        let result = h
            .bridge
            .call(&session.to_string(), "Initialize", &json!({}))
            .await;

        match result {
            Err(Error::DriverProblem(inner)) => {
                assert!(matches!(*inner, Error::TransferFailed(_)))
            }
            other => panic!("expected driver problem, got {:?}", other),
        }
        assert!(h.store.snapshot().driver_problem_suspected);
        if cfg!(target_os = "linux") {
            assert_eq!(h.bridge.udev_status().await, UdevStatus::Display);
        }
    }

    #[tokio::test]
    async fn test_other_failures_not_reclassified() {
        let h = configured().await;
        let session = h.bridge.acquire(DEVICE, None, false).await.unwrap();

        h.mock.fail(Operation::Send, Fault::Transfer);
        let result = h.bridge.call(&session.to_string(), "Ping", &json!({})).await;
        assert!(matches!(result, Err(Error::TransferFailed(_))));
        assert!(!h.store.snapshot().driver_problem_suspected);
    }

    #[tokio::test]
    async fn test_success_clears_flags() {
        let state = PersistedState {
            after_install: true,
            driver_problem_suspected: true,
            ..Default::default()
        };
        let h = harness_with(MockTransport::hid(&[DEVICE]), state);
        h.bridge
            .configure(&signed_configuration(&signing_key(1), None))
            .await
            .unwrap();

        let session = h.bridge.acquire(DEVICE, None, false).await.unwrap();
        h.bridge
            .call(&session.to_string(), "Initialize", &json!({}))
            .await
            .unwrap();

        let state = h.store.snapshot();
        assert!(!state.after_install);
        assert!(!state.driver_problem_suspected);
        assert_eq!(h.bridge.udev_status().await, UdevStatus::Hide);
    }

    #[tokio::test]
    async fn test_acquire_failure_sets_flag() {
        let h = configured().await;
        h.mock.fail(Operation::Connect, Fault::Unavailable);

        let result = h.bridge.acquire(DEVICE, None, false).await;
        assert!(matches!(result, Err(Error::DeviceUnavailable)));
        assert!(h.store.snapshot().driver_problem_suspected);
    }

    #[tokio::test]
    async fn test_wrong_previous_does_not_set_flag() {
        let h = configured().await;
        let result = h.bridge.acquire(DEVICE, Some(Session::Hid(3)), true).await;
        assert!(matches!(result, Err(Error::WrongPreviousSession)));
        assert!(!h.store.snapshot().driver_problem_suspected);
    }
}
