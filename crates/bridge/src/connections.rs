//! Connection and session management
//!
//! All bookkeeping lives in one [`ConnectionService`] owned by a single tokio
//! task. Callers talk to it through [`ConnectionManager`], which queues
//! commands on a channel; the task handles them one at a time, so
//! enumeration, acquire and release are totally ordered and never observe a
//! half-updated registry.

use crate::transport::{Transport, TransportSet};
use common::{
    CallbackId, ConnectionBridge, ConnectionCommand, ConnectionWorker, Error, ReleaseCallback,
    Result, create_connection_bridge,
};
use protocol::{DeviceDescriptor, DevicePath, Session};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Bidirectional path/session map plus per-session release callbacks
#[derive(Default)]
pub struct ConnectionRegistry {
    sessions: HashMap<DevicePath, Session>,
    reverse: HashMap<Session, DevicePath>,
    on_release: HashMap<Session, Vec<(CallbackId, ReleaseCallback)>>,
    next_callback_id: u64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session(&self, path: &DevicePath) -> Option<Session> {
        self.sessions.get(path).copied()
    }

    pub fn path(&self, session: &Session) -> Option<DevicePath> {
        self.reverse.get(session).copied()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Live (path, session) pairs
    pub fn entries(&self) -> impl Iterator<Item = (DevicePath, Session)> + '_ {
        self.sessions.iter().map(|(path, session)| (*path, *session))
    }

    /// Record a new session; the path must not already have one
    pub fn insert(&mut self, path: DevicePath, session: Session) {
        debug_assert!(!self.sessions.contains_key(&path));
        self.sessions.insert(path, session);
        self.reverse.insert(session, path);
    }

    /// Forget a session, returning its path and pending callbacks
    pub fn remove(&mut self, session: &Session) -> Option<(DevicePath, Vec<ReleaseCallback>)> {
        let path = self.reverse.remove(session)?;
        self.sessions.remove(&path);
        let callbacks = self
            .on_release
            .remove(session)
            .unwrap_or_default()
            .into_iter()
            .map(|(_, callback)| callback)
            .collect();
        Some((path, callbacks))
    }

    /// Register a release callback
    ///
    /// Hands the callback back when the session is not live.
    pub fn register(
        &mut self,
        session: Session,
        callback: ReleaseCallback,
    ) -> std::result::Result<CallbackId, ReleaseCallback> {
        if !self.reverse.contains_key(&session) {
            return Err(callback);
        }
        self.next_callback_id += 1;
        let id = CallbackId(self.next_callback_id);
        self.on_release
            .entry(session)
            .or_default()
            .push((id, callback));
        Ok(id)
    }

    /// Drop a callback without firing it
    pub fn forget(&mut self, session: &Session, id: CallbackId) {
        if let Some(callbacks) = self.on_release.get_mut(session) {
            callbacks.retain(|(registered, _)| *registered != id);
            if callbacks.is_empty() {
                self.on_release.remove(session);
            }
        }
    }

    /// Number of callbacks waiting on `session`
    pub fn pending_callbacks(&self, session: &Session) -> usize {
        self.on_release.get(session).map_or(0, Vec::len)
    }

    /// Forward and reverse maps are exact inverses and callbacks only exist
    /// for live sessions
    pub fn is_consistent(&self) -> bool {
        self.sessions.len() == self.reverse.len()
            && self
                .sessions
                .iter()
                .all(|(path, session)| self.reverse.get(session) == Some(path))
            && self
                .on_release
                .keys()
                .all(|session| self.reverse.contains_key(session))
    }
}

/// Registry plus the drivers it opens sessions on
pub struct ConnectionService {
    registry: ConnectionRegistry,
    transports: TransportSet,
}

impl ConnectionService {
    pub fn new(transports: TransportSet) -> Self {
        Self {
            registry: ConnectionRegistry::new(),
            transports,
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    fn transport(&self, kind: protocol::TransportKind) -> Result<Arc<dyn Transport>> {
        self.transports.get(kind).cloned()
    }

    /// Snapshot of all endpoints, sorted by path, with current sessions
    pub async fn enumerate(&mut self) -> Result<Vec<DeviceDescriptor>> {
        let mut devices = Vec::new();
        for transport in self.transports.iter() {
            for endpoint in transport.enumerate().await? {
                devices.push(DeviceDescriptor {
                    path: endpoint.path,
                    vendor: endpoint.vendor,
                    product: endpoint.product,
                    serial_number: 0,
                    session: self.registry.session(&endpoint.path),
                });
            }
        }

        devices.sort_by_key(|device| device.path);
        devices.dedup_by_key(|device| device.path);
        debug!("Enumerated {} devices", devices.len());

        self.release_disconnected(&devices).await;
        Ok(devices)
    }

    /// Open a session on `path`, stealing any existing one
    pub async fn acquire(
        &mut self,
        path: DevicePath,
        previous: Option<Session>,
        check_previous: bool,
    ) -> Result<Session> {
        let current = self.registry.session(&path);
        if check_previous && current != previous {
            debug!(
                "Acquire of {} expected session {:?}, found {:?}",
                path, previous, current
            );
            return Err(Error::WrongPreviousSession);
        }

        if let Some(current) = current {
            info!("Stealing session {} of device {}", current, path);
            self.release(current).await;
        }

        let session = self.transport(path.kind())?.connect(&path).await?;
        self.registry.insert(path, session);

        info!("Acquired device {} as session {}", path, session);
        Ok(session)
    }

    /// Close a session and fire its callbacks; unknown sessions are a no-op
    pub async fn release(&mut self, session: Session) {
        if self.registry.path(&session).is_none() {
            debug!("Release of unknown session {}", session);
            return;
        }

        match self.transport(session.kind()) {
            Ok(transport) => {
                if let Err(e) = transport.disconnect(&session).await {
                    warn!("Failed to disconnect session {}: {}", session, e);
                }
            }
            Err(e) => warn!("No transport for session {}: {}", session, e),
        }

        if let Some((path, callbacks)) = self.registry.remove(&session) {
            info!("Released session {} of device {}", session, path);
            for callback in callbacks {
                callback();
            }
        }
    }

    /// Release every session whose device is missing from `devices`
    pub async fn release_disconnected(&mut self, devices: &[DeviceDescriptor]) {
        let vanished: Vec<Session> = self
            .registry
            .entries()
            .filter(|(path, _)| !devices.iter().any(|d| d.path == *path))
            .map(|(_, session)| session)
            .collect();

        for session in vanished {
            info!("Device of session {} disconnected", session);
            self.release(session).await;
        }
    }

    /// Register a release callback; fires it at once for dead sessions
    pub fn on_release(&mut self, session: Session, callback: ReleaseCallback) -> CallbackId {
        match self.registry.register(session, callback) {
            Ok(id) => id,
            Err(callback) => {
                debug!("Session {} is not live, firing release callback", session);
                callback();
                CallbackId(0)
            }
        }
    }

    pub fn forget_on_release(&mut self, session: &Session, id: CallbackId) {
        self.registry.forget(session, id);
    }

    /// Process commands until shutdown or until every sender is gone
    pub async fn run(mut self, worker: ConnectionWorker) {
        info!("Connection worker started");

        while let Ok(cmd) = worker.recv_command().await {
            if !self.handle_command(cmd).await {
                break;
            }
        }

        // Pending calls must not wait on sessions nobody can release anymore
        let sessions: Vec<Session> = self.registry.entries().map(|(_, s)| s).collect();
        for session in sessions {
            self.release(session).await;
        }

        info!("Connection worker stopped");
    }

    /// Returns false on shutdown
    async fn handle_command(&mut self, cmd: ConnectionCommand) -> bool {
        match cmd {
            ConnectionCommand::Enumerate { response } => {
                let _ = response.send(self.enumerate().await);
            }
            ConnectionCommand::Acquire {
                path,
                previous,
                check_previous,
                response,
            } => {
                let _ = response.send(self.acquire(path, previous, check_previous).await);
            }
            ConnectionCommand::Release { session, response } => {
                self.release(session).await;
                let _ = response.send(Ok(()));
            }
            ConnectionCommand::OnRelease {
                session,
                callback,
                response,
            } => {
                let _ = response.send(self.on_release(session, callback));
            }
            ConnectionCommand::ForgetOnRelease { session, id } => {
                self.forget_on_release(&session, id);
            }
            ConnectionCommand::GetSession { path, response } => {
                let _ = response.send(self.registry.session(&path));
            }
            ConnectionCommand::Shutdown => {
                info!("Connection worker shutting down");
                return false;
            }
        }
        true
    }
}

/// Caller-side handle to the connection worker
#[derive(Clone)]
pub struct ConnectionManager {
    bridge: ConnectionBridge,
}

impl ConnectionManager {
    /// Start the worker task on the current runtime
    pub fn spawn(transports: TransportSet) -> (Self, JoinHandle<()>) {
        let (bridge, worker) = create_connection_bridge();
        let handle = tokio::spawn(ConnectionService::new(transports).run(worker));
        (Self { bridge }, handle)
    }

    pub async fn enumerate(&self) -> Result<Vec<DeviceDescriptor>> {
        self.bridge
            .request(|response| ConnectionCommand::Enumerate { response })
            .await?
    }

    pub async fn acquire(
        &self,
        path: DevicePath,
        previous: Option<Session>,
        check_previous: bool,
    ) -> Result<Session> {
        self.bridge
            .request(|response| ConnectionCommand::Acquire {
                path,
                previous,
                check_previous,
                response,
            })
            .await?
    }

    pub async fn release(&self, session: Session) -> Result<()> {
        self.bridge
            .request(|response| ConnectionCommand::Release { session, response })
            .await?
    }

    pub async fn on_release(&self, session: Session, callback: ReleaseCallback) -> Result<CallbackId> {
        self.bridge
            .request(|response| ConnectionCommand::OnRelease {
                session,
                callback,
                response,
            })
            .await
    }

    pub async fn forget_on_release(&self, session: Session, id: CallbackId) -> Result<()> {
        self.bridge
            .send_command(ConnectionCommand::ForgetOnRelease { session, id })
            .await
    }

    pub async fn session(&self, path: DevicePath) -> Result<Option<Session>> {
        self.bridge
            .request(|response| ConnectionCommand::GetSession { path, response })
            .await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.bridge.send_command(ConnectionCommand::Shutdown).await
    }
}
