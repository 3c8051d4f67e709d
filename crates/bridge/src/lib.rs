//! Hardware wallet bridge
//!
//! Connects local callers to hardware wallets reachable over USB HID or a
//! loopback UDP emulator. A [`Bridge`] owns the connection worker, the active
//! wire protocol and the persisted state; [`dispatch`] maps JSON requests onto
//! it.
//!
//! ```no_run
//! # async fn example() -> common::Result<()> {
//! use bridge::{Bridge, config::ListenSettings, storage::MemoryStateStore};
//! use bridge::transport::{TransportSet, UdpTransport};
//! use std::sync::Arc;
//!
//! let transports = TransportSet::new().with(Arc::new(UdpTransport::new(vec![21324])));
//! let store = Arc::new(MemoryStateStore::default());
//! let bridge = Bridge::new(transports, Default::default(), store, &ListenSettings::default());
//!
//! for device in bridge.enumerate().await? {
//!     println!("{} {:04x}:{:04x}", device.path, device.vendor, device.product);
//! }
//! bridge.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod call;
pub mod config;
pub mod configure;
pub mod connections;
pub mod dispatch;
pub mod listen;
pub mod service;
pub mod storage;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod transport;
pub mod udev;

pub use call::CallResponse;
pub use dispatch::{Reply, Request, dispatch, handle_line};
pub use udev::UdevStatus;

use crate::config::ListenSettings;
use crate::configure::Configurator;
use crate::connections::ConnectionManager;
use crate::listen::Listener;
use crate::storage::{SharedState, StateStore};
use crate::transport::TransportSet;
use common::Result;
use protocol::{DeviceDescriptor, DevicePath, Session, TrustedKeys};
use serde::Serialize;
use serde_json::Value as Json;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, warn};

/// Result of `info`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Info {
    pub version: String,
    pub configured: bool,
}

pub struct Bridge {
    connections: ConnectionManager,
    worker: Mutex<Option<JoinHandle<()>>>,
    transports: TransportSet,
    configuration: Configurator,
    listener: Listener,
    state: Arc<SharedState>,
}

impl Bridge {
    /// Build a bridge and start its connection worker
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        transports: TransportSet,
        keys: TrustedKeys,
        store: Arc<dyn StateStore>,
        listen: &ListenSettings,
    ) -> Self {
        let state = Arc::new(SharedState::load(store));
        let (connections, worker) = ConnectionManager::spawn(transports.clone());

        Self {
            connections,
            worker: Mutex::new(Some(worker)),
            transports,
            configuration: Configurator::new(keys, state.clone()),
            listener: Listener::new(listen.iterations, listen.delay()),
            state,
        }
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    pub fn configuration(&self) -> &Configurator {
        &self.configuration
    }

    pub async fn enumerate(&self) -> Result<Vec<DeviceDescriptor>> {
        self.connections.enumerate().await
    }

    /// Block until the device set differs from `previous` or the poll budget
    /// runs out
    pub async fn listen(&self, previous: Option<&Json>) -> Result<Vec<DeviceDescriptor>> {
        self.listener
            .listen(previous, || self.connections.enumerate())
            .await
    }

    /// Open a session on `path`
    ///
    /// With `check_previous`, fails unless `previous` is the device's current
    /// session.
    pub async fn acquire(
        &self,
        path: DevicePath,
        previous: Option<Session>,
        check_previous: bool,
    ) -> Result<Session> {
        match self
            .connections
            .acquire(path, previous, check_previous)
            .await
        {
            Err(e) if e.is_device_failure() => {
                warn!("Acquire of {} failed: {}", path, e);
                self.record_device_failure().await;
                Err(e)
            }
            result => result,
        }
    }

    pub async fn release(&self, session: Session) -> Result<()> {
        self.connections.release(session).await
    }

    pub async fn session(&self, path: DevicePath) -> Result<Option<Session>> {
        self.connections.session(path).await
    }

    pub async fn configure(&self, blob: &str) -> Result<()> {
        self.configuration.configure(blob).await
    }

    pub async fn info(&self) -> Info {
        Info {
            version: env!("CARGO_PKG_VERSION").to_string(),
            configured: self.configuration.is_configured().await,
        }
    }

    /// Stop the connection worker, releasing every open session
    pub async fn shutdown(&self) {
        if let Err(e) = self.connections.shutdown().await {
            warn!("Connection worker already gone: {}", e);
        }

        let worker = self.worker.lock().ok().and_then(|mut worker| worker.take());
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                error!("Connection worker panicked: {}", e);
            }
        }
    }
}
