//! Transport drivers
//!
//! Each driver serves one [`TransportKind`] and moves whole packets; framing
//! and message assembly happen above this layer. Drivers never track which
//! caller owns a session, the connection worker does.

pub mod hid;
pub mod udp;

pub use hid::HidTransport;
pub use udp::UdpTransport;

use async_trait::async_trait;
use common::{Error, Result};
use protocol::{DevicePath, Framing, Packet, Session, TransportKind};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::warn;

/// One endpoint visible to a driver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub path: DevicePath,
    pub vendor: u16,
    pub product: u16,
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Endpoints currently present; empty rather than an error when none are
    async fn enumerate(&self) -> Result<Vec<Endpoint>>;

    async fn connect(&self, path: &DevicePath) -> Result<Session>;

    async fn disconnect(&self, session: &Session) -> Result<()>;

    /// Send exactly one packet
    async fn send(&self, session: &Session, packet: Packet) -> Result<()>;

    /// Receive exactly one packet
    async fn receive(&self, session: &Session) -> Result<Packet>;

    /// Framing convention of the device behind `session`
    fn framing(&self, session: &Session) -> Result<Framing>;
}

/// Close flag of one open connection
///
/// Every operation on the connection holds a [`CloseSignal`] for as long as
/// it uses the underlying resource. [`close`](Self::close) raises the flag
/// and waits until those signals are dropped, so a new connection to the
/// same device never races the old one for the socket or interface.
pub struct CloseHandle {
    tx: watch::Sender<bool>,
}

impl CloseHandle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    pub fn signal(&self) -> CloseSignal {
        CloseSignal(self.tx.subscribe())
    }

    /// Operations still holding a signal
    pub fn in_flight(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Raise the flag and wait up to `timeout` for in-flight operations;
    /// false if some were still running
    pub async fn close(&self, session: &Session, timeout: Duration) -> bool {
        self.tx.send_replace(true);
        if tokio::time::timeout(timeout, self.tx.closed()).await.is_err() {
            warn!(
                "Session {} still has {} operations in flight after {:?}",
                session,
                self.in_flight(),
                timeout
            );
            return false;
        }
        true
    }
}

impl Default for CloseHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Held by an operation while it uses a connection
pub struct CloseSignal(watch::Receiver<bool>);

impl CloseSignal {
    pub fn is_closed(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once the connection is closing
    pub async fn closed(&mut self) {
        // A dropped handle counts as closed
        let _ = self.0.wait_for(|closed| *closed).await;
    }
}

/// Drivers by transport kind
#[derive(Clone, Default)]
pub struct TransportSet {
    transports: BTreeMap<TransportKind, Arc<dyn Transport>>,
}

impl TransportSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, transport: Arc<dyn Transport>) -> Self {
        self.insert(transport);
        self
    }

    pub fn insert(&mut self, transport: Arc<dyn Transport>) {
        self.transports.insert(transport.kind(), transport);
    }

    /// Driver for `kind`; a missing driver means nothing of that kind exists
    pub fn get(&self, kind: TransportKind) -> Result<&Arc<dyn Transport>> {
        self.transports.get(&kind).ok_or(Error::DeviceUnavailable)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Transport>> {
        self.transports.values()
    }

    pub fn is_empty(&self) -> bool {
        self.transports.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_driver_is_unavailable() {
        let set = TransportSet::new().with(Arc::new(UdpTransport::new(vec![21324])));
        assert!(set.get(TransportKind::Udp).is_ok());
        assert!(matches!(
            set.get(TransportKind::Hid),
            Err(Error::DeviceUnavailable)
        ));
        assert_eq!(set.iter().count(), 1);
    }

    #[tokio::test]
    async fn test_close_waits_for_operations() {
        let handle = Arc::new(CloseHandle::new());
        let mut signal = handle.signal();
        assert!(!signal.is_closed());
        assert_eq!(handle.in_flight(), 1);

        let operation = tokio::spawn(async move {
            signal.closed().await;
            assert!(signal.is_closed());
        });

        assert!(handle.close(&Session::Udp(1), Duration::from_secs(5)).await);
        assert_eq!(handle.in_flight(), 0);
        operation.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_gives_up_on_stuck_operation() {
        let handle = CloseHandle::new();
        let stuck = handle.signal();

        assert!(!handle.close(&Session::Hid(1), Duration::from_secs(1)).await);
        assert!(stuck.is_closed());
        assert_eq!(handle.in_flight(), 1);
    }
}
