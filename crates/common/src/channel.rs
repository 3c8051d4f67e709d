//! Async command channel in front of the connection worker
//!
//! Every operation touching the path/session maps travels through one
//! channel to a single consumer, which gives enumeration, acquire and
//! release a total order without locking the maps themselves.

use async_channel::{Receiver, Sender, bounded};
use protocol::{DeviceDescriptor, DevicePath, Session};
use std::fmt;
use tokio::sync::oneshot;

/// One-shot callback fired when a session is released
pub type ReleaseCallback = Box<dyn FnOnce() + Send + 'static>;

/// Registration handle for a release callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(pub u64);

/// Commands for the connection worker
pub enum ConnectionCommand {
    /// Enumerate all endpoints and drop sessions of vanished devices
    Enumerate {
        response: oneshot::Sender<crate::Result<Vec<DeviceDescriptor>>>,
    },

    /// Open a session, stealing the current one if present
    Acquire {
        path: DevicePath,
        /// Session the caller believes is current
        previous: Option<Session>,
        /// Fail unless `previous` matches the recorded session
        check_previous: bool,
        response: oneshot::Sender<crate::Result<Session>>,
    },

    /// Close a session (unknown sessions succeed)
    Release {
        session: Session,
        response: oneshot::Sender<crate::Result<()>>,
    },

    /// Register a callback for the release of `session`
    OnRelease {
        session: Session,
        callback: ReleaseCallback,
        response: oneshot::Sender<CallbackId>,
    },

    /// Drop a callback registered with `OnRelease`
    ForgetOnRelease { session: Session, id: CallbackId },

    /// Current session of a device, if any
    GetSession {
        path: DevicePath,
        response: oneshot::Sender<Option<Session>>,
    },

    /// Stop the worker
    Shutdown,
}

impl fmt::Debug for ConnectionCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionCommand::Enumerate { .. } => f.write_str("Enumerate"),
            ConnectionCommand::Acquire {
                path,
                previous,
                check_previous,
                ..
            } => f
                .debug_struct("Acquire")
                .field("path", path)
                .field("previous", previous)
                .field("check_previous", check_previous)
                .finish(),
            ConnectionCommand::Release { session, .. } => {
                f.debug_struct("Release").field("session", session).finish()
            }
            ConnectionCommand::OnRelease { session, .. } => {
                f.debug_struct("OnRelease").field("session", session).finish()
            }
            ConnectionCommand::ForgetOnRelease { session, id } => f
                .debug_struct("ForgetOnRelease")
                .field("session", session)
                .field("id", id)
                .finish(),
            ConnectionCommand::GetSession { path, .. } => {
                f.debug_struct("GetSession").field("path", path).finish()
            }
            ConnectionCommand::Shutdown => f.write_str("Shutdown"),
        }
    }
}

/// Sending side, cloned by every caller
#[derive(Clone)]
pub struct ConnectionBridge {
    cmd_tx: Sender<ConnectionCommand>,
}

impl ConnectionBridge {
    /// Queue a command behind all previously sent ones
    pub async fn send_command(&self, cmd: ConnectionCommand) -> crate::Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Send a command and wait for its response
    pub async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> ConnectionCommand,
    ) -> crate::Result<T> {
        let (tx, rx) = oneshot::channel();
        self.send_command(build(tx)).await?;
        rx.await
            .map_err(|_| crate::Error::Channel("connection worker dropped the request".into()))
    }

    pub fn is_closed(&self) -> bool {
        self.cmd_tx.is_closed()
    }
}

/// Receiving side, owned by the single connection worker
pub struct ConnectionWorker {
    cmd_rx: Receiver<ConnectionCommand>,
}

impl ConnectionWorker {
    /// Wait for the next command
    pub async fn recv_command(&self) -> crate::Result<ConnectionCommand> {
        self.cmd_rx
            .recv()
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Try to receive a command without waiting
    pub fn try_recv_command(&self) -> Option<ConnectionCommand> {
        self.cmd_rx.try_recv().ok()
    }
}

/// Create the command channel
///
/// Returns (ConnectionBridge for callers, ConnectionWorker for the worker)
pub fn create_connection_bridge() -> (ConnectionBridge, ConnectionWorker) {
    let (cmd_tx, cmd_rx) = bounded(256);
    (ConnectionBridge { cmd_tx }, ConnectionWorker { cmd_rx })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_bridge() {
        let (bridge, worker) = create_connection_bridge();

        let handle = tokio::spawn(async move {
            let cmd = worker.recv_command().await.unwrap();
            matches!(cmd, ConnectionCommand::Enumerate { .. })
        });

        let (tx, _rx) = oneshot::channel();
        bridge
            .send_command(ConnectionCommand::Enumerate { response: tx })
            .await
            .unwrap();

        assert!(handle.await.unwrap());
    }

    #[test]
    fn test_debug_hides_callbacks() {
        let (tx, _rx) = oneshot::channel();
        let cmd = ConnectionCommand::OnRelease {
            session: Session::Hid(4),
            callback: Box::new(|| {}),
            response: tx,
        };
        assert_eq!(format!("{:?}", cmd), "OnRelease { session: Hid(4) }");
    }
}
