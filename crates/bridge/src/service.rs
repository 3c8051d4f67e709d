//! systemd sd-notify integration
//!
//! Every notification is a no-op when `NOTIFY_SOCKET` is unset, so the bridge
//! behaves the same when started by hand or by a browser extension host.

use anyhow::{Context, Result};
use std::env;
use std::os::unix::net::UnixDatagram;
use tracing::debug;

const NOTIFY_SOCKET: &str = "NOTIFY_SOCKET";

fn notify(state: &str) -> Result<()> {
    let Ok(socket_path) = env::var(NOTIFY_SOCKET) else {
        debug!("{} not set, skipping {}", NOTIFY_SOCKET, state);
        return Ok(());
    };

    let socket = UnixDatagram::unbound().context("Failed to create Unix socket")?;
    socket
        .send_to(state.as_bytes(), &socket_path)
        .with_context(|| format!("Failed to send {} to systemd", state))?;
    debug!("Notified systemd: {}", state);
    Ok(())
}

/// Bridge is serving requests
pub fn notify_ready() -> Result<()> {
    notify("READY=1")
}

pub fn notify_stopping() -> Result<()> {
    notify("STOPPING=1")
}

/// Free-form status shown by `systemctl status`
pub fn notify_status(status: &str) -> Result<()> {
    notify(&format!("STATUS={}", status))
}

pub fn is_systemd() -> bool {
    env::var(NOTIFY_SOCKET).is_ok()
}
