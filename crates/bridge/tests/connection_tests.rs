//! Connection Service Tests
//!
//! Session bookkeeping against a scripted transport.
//!
//! # Test Scenarios
//! - Session stealing releases the old session before the new one exists
//! - Optimistic previous-session checks
//! - Idempotent release and callback firing
//! - Cleanup of sessions whose device disappeared
//! - Map consistency under arbitrary operation sequences
//!
//! Run with: `cargo test -p bridge --test connection_tests`

use bridge::connections::{ConnectionManager, ConnectionService};
use bridge::test_utils::{Fault, MockTransport, Operation};
use bridge::transport::TransportSet;
use common::{Error, ReleaseCallback};
use proptest::prelude::*;
use protocol::{DevicePath, Session};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

const DEVICE: DevicePath = DevicePath::Hid(1);

fn service(paths: &[DevicePath]) -> (ConnectionService, Arc<MockTransport>) {
    let mock = Arc::new(MockTransport::hid(paths));
    let transports = TransportSet::new().with(mock.clone());
    (ConnectionService::new(transports), mock)
}

fn counter(fired: &Arc<AtomicUsize>) -> ReleaseCallback {
    let fired = fired.clone();
    Box::new(move || {
        fired.fetch_add(1, Ordering::SeqCst);
    })
}

// ============================================================================
// Session Stealing
// ============================================================================

mod stealing {
    use super::*;

    #[tokio::test]
    async fn test_second_acquire_steals() {
        let (mut service, mock) = service(&[DEVICE]);
        let fired = Arc::new(AtomicUsize::new(0));

        let first = service.acquire(DEVICE, None, false).await.unwrap();
        service.on_release(first, counter(&fired));

        let second = service.acquire(DEVICE, None, false).await.unwrap();
        assert_ne!(first, second);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(service.registry().session(&DEVICE), Some(second));
        assert_eq!(service.registry().path(&first), None);
        assert_eq!(mock.open_sessions(), vec![second]);
        assert_eq!(mock.count(Operation::Disconnect), 1);
    }

    #[tokio::test]
    async fn test_failed_disconnect_still_steals() {
        let (mut service, mock) = service(&[DEVICE]);
        let first = service.acquire(DEVICE, None, false).await.unwrap();

        mock.fail(Operation::Disconnect, Fault::Transfer);
        let second = service.acquire(DEVICE, None, false).await.unwrap();

        assert_eq!(service.registry().session(&DEVICE), Some(second));
        assert_eq!(service.registry().path(&first), None);
        assert!(service.registry().is_consistent());
    }

    #[tokio::test]
    async fn test_failed_connect_leaves_device_free() {
        let (mut service, mock) = service(&[DEVICE]);
        let first = service.acquire(DEVICE, None, false).await.unwrap();

        mock.fail(Operation::Connect, Fault::Unavailable);
        let result = service.acquire(DEVICE, None, false).await;
        assert!(matches!(result, Err(Error::DeviceUnavailable)));

        // The old session was stolen before connect failed
        assert_eq!(service.registry().path(&first), None);
        assert!(service.registry().is_empty());
    }
}

// ============================================================================
// Previous Session Checks
// ============================================================================

mod previous_check {
    use super::*;

    #[tokio::test]
    async fn test_expected_none_but_session_exists() {
        let (mut service, _) = service(&[DEVICE]);
        let current = service.acquire(DEVICE, None, false).await.unwrap();

        let result = service.acquire(DEVICE, None, true).await;
        assert!(matches!(result, Err(Error::WrongPreviousSession)));
        assert_eq!(service.registry().session(&DEVICE), Some(current));
    }

    #[tokio::test]
    async fn test_expected_session_but_none_exists() {
        let (mut service, _) = service(&[DEVICE]);
        let result = service.acquire(DEVICE, Some(Session::Hid(5)), true).await;
        assert!(matches!(result, Err(Error::WrongPreviousSession)));
        assert!(service.registry().is_empty());
    }

    #[tokio::test]
    async fn test_stale_session_rejected() {
        let (mut service, _) = service(&[DEVICE]);
        let current = service.acquire(DEVICE, None, false).await.unwrap();
        let stale = match current {
            Session::Hid(id) => Session::Hid(id + 100),
            other => other,
        };

        let result = service.acquire(DEVICE, Some(stale), true).await;
        assert!(matches!(result, Err(Error::WrongPreviousSession)));
        assert_eq!(service.registry().session(&DEVICE), Some(current));
    }

    #[tokio::test]
    async fn test_matching_previous_succeeds() {
        let (mut service, _) = service(&[DEVICE]);
        let current = service.acquire(DEVICE, None, true).await.unwrap();
        let next = service.acquire(DEVICE, Some(current), true).await.unwrap();
        assert_eq!(service.registry().session(&DEVICE), Some(next));
    }
}

// ============================================================================
// Release
// ============================================================================

mod release {
    use super::*;

    #[tokio::test]
    async fn test_double_release_fires_once() {
        let (mut service, mock) = service(&[DEVICE]);
        let fired = Arc::new(AtomicUsize::new(0));
        let session = service.acquire(DEVICE, None, false).await.unwrap();
        service.on_release(session, counter(&fired));

        service.release(session).await;
        service.release(session).await;

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(mock.count(Operation::Disconnect), 1);
        assert!(service.registry().is_empty());
    }

    #[tokio::test]
    async fn test_callback_on_dead_session_fires_immediately() {
        let (mut service, _) = service(&[DEVICE]);
        let fired = Arc::new(AtomicUsize::new(0));
        service.on_release(Session::Hid(42), counter(&fired));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_forgotten_callback_not_fired() {
        let (mut service, _) = service(&[DEVICE]);
        let fired = Arc::new(AtomicUsize::new(0));
        let session = service.acquire(DEVICE, None, false).await.unwrap();

        let id = service.on_release(session, counter(&fired));
        service.forget_on_release(&session, id);
        service.release(session).await;

        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unplugged_device_released_on_enumerate() {
        let other = DevicePath::Hid(2);
        let (mut service, mock) = service(&[DEVICE, other]);
        let fired = Arc::new(AtomicUsize::new(0));

        let gone = service.acquire(DEVICE, None, false).await.unwrap();
        let kept = service.acquire(other, None, false).await.unwrap();
        service.on_release(gone, counter(&fired));

        mock.set_endpoints(&[other]);
        let devices = service.enumerate().await.unwrap();

        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].session, Some(kept));
        assert_eq!(service.registry().path(&gone), None);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_enumeration_failure_keeps_sessions() {
        let (mut service, mock) = service(&[DEVICE]);
        let session = service.acquire(DEVICE, None, false).await.unwrap();

        mock.fail(Operation::Enumerate, Fault::Transfer);
        assert!(service.enumerate().await.is_err());
        assert_eq!(service.registry().session(&DEVICE), Some(session));
    }
}

// ============================================================================
// Snapshot Shape
// ============================================================================

mod snapshot {
    use super::*;

    #[tokio::test]
    async fn test_snapshot_sorted_across_transports() {
        let hid = Arc::new(MockTransport::hid(&[DevicePath::Hid(9), DevicePath::Hid(2)]));
        let udp = Arc::new(MockTransport::udp(&[DevicePath::Udp(21324)]));
        let mut service =
            ConnectionService::new(TransportSet::new().with(udp).with(hid));

        let paths: Vec<DevicePath> = service
            .enumerate()
            .await
            .unwrap()
            .into_iter()
            .map(|device| device.path)
            .collect();
        assert_eq!(
            paths,
            vec![DevicePath::Hid(2), DevicePath::Hid(9), DevicePath::Udp(21324)]
        );
    }

    #[tokio::test]
    async fn test_snapshot_carries_sessions() {
        let (mut service, _) = service(&[DEVICE]);
        let session = service.acquire(DEVICE, None, false).await.unwrap();

        let devices = service.enumerate().await.unwrap();
        assert_eq!(devices[0].session, Some(session));
        assert_eq!(devices[0].serial_number, 0);
    }
}

// ============================================================================
// Worker Ordering
// ============================================================================

mod worker {
    use super::*;

    #[tokio::test]
    async fn test_concurrent_acquires_leave_one_winner() {
        let mock = Arc::new(MockTransport::hid(&[DEVICE]));
        let (manager, handle) = ConnectionManager::spawn(TransportSet::new().with(mock.clone()));

        let attempts: Vec<_> = (0..8)
            .map(|_| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.acquire(DEVICE, None, false).await })
            })
            .collect();
        let mut sessions = Vec::new();
        for attempt in attempts {
            sessions.push(attempt.await.unwrap().unwrap());
        }

        let current = manager.session(DEVICE).await.unwrap();
        assert!(current.is_some());
        assert_eq!(mock.open_sessions(), vec![current.unwrap()]);
        assert_eq!(mock.count(Operation::Disconnect), sessions.len() - 1);

        manager.shutdown().await.unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_releases_sessions() {
        let mock = Arc::new(MockTransport::hid(&[DEVICE]));
        let (manager, handle) = ConnectionManager::spawn(TransportSet::new().with(mock.clone()));
        let fired = Arc::new(AtomicUsize::new(0));

        let session = manager.acquire(DEVICE, None, false).await.unwrap();
        manager.on_release(session, counter(&fired)).await.unwrap();

        manager.shutdown().await.unwrap();
        handle.await.unwrap();

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(mock.open_sessions().is_empty());
        assert!(manager.session(DEVICE).await.is_err());
    }
}

// ============================================================================
// Map Invariant
// ============================================================================

#[derive(Debug, Clone)]
enum Step {
    Acquire(u32),
    AcquireChecked(u32, Option<u32>),
    Release(u32),
    Unplug(u32),
    Replug,
    Enumerate,
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        (0..3u32).prop_map(Step::Acquire),
        (0..3u32, proptest::option::of(1..12u32)).prop_map(|(d, p)| Step::AcquireChecked(d, p)),
        (1..12u32).prop_map(Step::Release),
        (0..3u32).prop_map(Step::Unplug),
        Just(Step::Replug),
        Just(Step::Enumerate),
    ]
}

proptest! {
    #[test]
    fn prop_maps_stay_inverse(steps in proptest::collection::vec(step(), 1..40)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        runtime.block_on(async {
            let all: Vec<DevicePath> = (0..3).map(DevicePath::Hid).collect();
            let (mut service, mock) = service(&all);
            let mut present = all.clone();

            for step in steps {
                match step {
                    Step::Acquire(d) => {
                        let _ = service.acquire(DevicePath::Hid(d), None, false).await;
                    }
                    Step::AcquireChecked(d, previous) => {
                        let _ = service
                            .acquire(DevicePath::Hid(d), previous.map(Session::Hid), true)
                            .await;
                    }
                    Step::Release(s) => service.release(Session::Hid(s)).await,
                    Step::Unplug(d) => {
                        present.retain(|path| *path != DevicePath::Hid(d));
                        mock.set_endpoints(&present);
                    }
                    Step::Replug => {
                        present = all.clone();
                        mock.set_endpoints(&present);
                    }
                    Step::Enumerate => {
                        let _ = service.enumerate().await;
                    }
                }

                let registry = service.registry();
                assert!(registry.is_consistent());
                for (path, session) in registry.entries() {
                    assert_eq!(registry.session(&path), Some(session));
                    assert_eq!(registry.path(&session), Some(path));
                }
            }
        });
    }
}
