//! Loopback UDP transport
//!
//! Talks to device emulators on localhost. Every configured port is listed as
//! a virtual device whether or not an emulator is running; a session binds
//! `port + 3` locally and exchanges 64-byte datagrams with `port`.

use super::{CloseHandle, CloseSignal, Endpoint, Transport};
use async_trait::async_trait;
use common::{Error, Result};
use protocol::{
    DEVICE_PRODUCT_ID, DEVICE_VENDOR_ID, DevicePath, Framing, PACKET_SIZE, Packet, Session,
    TransportKind,
};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tracing::debug;

/// Offset between the emulator port and the local port of a session
const LOCAL_PORT_OFFSET: u16 = 3;

/// How long `disconnect` waits for pending sends and receives to stop
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

struct UdpConnection {
    socket: Arc<UdpSocket>,
    close: CloseHandle,
}

/// A socket borrowed by one send or receive
struct InFlight {
    socket: Arc<UdpSocket>,
    // Declared after the socket so it is dropped last
    signal: CloseSignal,
}

pub struct UdpTransport {
    ports: Vec<u16>,
    connections: Mutex<HashMap<u32, UdpConnection>>,
    next_id: AtomicU32,
}

impl UdpTransport {
    pub fn new(ports: Vec<u16>) -> Self {
        Self {
            ports,
            connections: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(1),
        }
    }

    async fn in_flight(&self, session: &Session) -> Result<InFlight> {
        let Session::Udp(id) = session else {
            return Err(Error::InvalidSession(session.to_string()));
        };
        self.connections
            .lock()
            .await
            .get(id)
            .map(|connection| InFlight {
                socket: connection.socket.clone(),
                signal: connection.close.signal(),
            })
            .ok_or_else(|| Error::InvalidSession(session.to_string()))
    }
}

fn transfer_failed(e: std::io::Error) -> Error {
    Error::TransferFailed(e.to_string())
}

#[async_trait]
impl Transport for UdpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Udp
    }

    async fn enumerate(&self) -> Result<Vec<Endpoint>> {
        Ok(self
            .ports
            .iter()
            .map(|port| Endpoint {
                path: DevicePath::Udp(*port),
                vendor: DEVICE_VENDOR_ID,
                product: DEVICE_PRODUCT_ID,
            })
            .collect())
    }

    async fn connect(&self, path: &DevicePath) -> Result<Session> {
        let DevicePath::Udp(port) = *path else {
            return Err(Error::DeviceUnavailable);
        };
        if !self.ports.contains(&port) {
            return Err(Error::DeviceUnavailable);
        }
        let local_port = port
            .checked_add(LOCAL_PORT_OFFSET)
            .ok_or(Error::DeviceUnavailable)?;

        let socket = UdpSocket::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, local_port)))
            .await
            .map_err(transfer_failed)?;
        socket
            .connect(SocketAddr::from((Ipv4Addr::LOCALHOST, port)))
            .await
            .map_err(transfer_failed)?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.connections.lock().await.insert(
            id,
            UdpConnection {
                socket: Arc::new(socket),
                close: CloseHandle::new(),
            },
        );

        debug!("Opened loopback socket {} for port {}", id, port);
        Ok(Session::Udp(id))
    }

    async fn disconnect(&self, session: &Session) -> Result<()> {
        let Session::Udp(id) = session else {
            return Err(Error::InvalidSession(session.to_string()));
        };
        let connection = self
            .connections
            .lock()
            .await
            .remove(id)
            .ok_or_else(|| Error::InvalidSession(session.to_string()))?;

        // The local port is free again once the last socket reference goes
        connection.close.close(session, CLOSE_TIMEOUT).await;
        debug!("Closed loopback socket {}", id);
        Ok(())
    }

    async fn send(&self, session: &Session, packet: Packet) -> Result<()> {
        let mut op = self.in_flight(session).await?;
        tokio::select! {
            biased;
            _ = op.signal.closed() => Err(Error::SessionReleased),
            result = op.socket.send(&packet.data) => result.map(|_| ()).map_err(transfer_failed),
        }
    }

    async fn receive(&self, session: &Session) -> Result<Packet> {
        let mut op = self.in_flight(session).await?;
        let mut buf = [0u8; PACKET_SIZE];
        let len = tokio::select! {
            biased;
            _ = op.signal.closed() => return Err(Error::SessionReleased),
            result = op.socket.recv(&mut buf) => result.map_err(transfer_failed)?,
        };
        Ok(Packet::raw(buf[..len].to_vec()))
    }

    fn framing(&self, _session: &Session) -> Result<Framing> {
        Ok(Framing::Marker)
    }
}
