//! Scriptable in-memory transport
//!
//! [`MockTransport`] serves a fixed list of endpoints, answers each complete
//! request message through a responder closure, and can be told to fail or to
//! hold replies back. Endpoints are exclusive like real devices: connecting
//! fails while a pending receive of an older session still holds the
//! endpoint. Shared by unit tests and the integration suites.

use crate::transport::{CloseHandle, Endpoint, Transport};
use async_trait::async_trait;
use common::{Error, Result};
use protocol::{
    DEVICE_PRODUCT_ID, DEVICE_VENDOR_ID, DevicePath, Framing, MessageAssembler, Packet,
    RawMessage, Session, TransportKind, encode_chunks,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// How long `disconnect` waits for pending receives
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Message id of `Success` in the sample protocol
pub const SUCCESS_TYPE_ID: u16 = 2;

/// Builds the reply to a request; `None` leaves the caller waiting
pub type Responder = Arc<dyn Fn(&RawMessage) -> Option<RawMessage> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Enumerate,
    Connect,
    Disconnect,
    Send,
}

/// Injected failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Unavailable,
    Transfer,
}

impl Fault {
    fn error(self, operation: Operation) -> Error {
        match self {
            Fault::Unavailable => Error::DeviceUnavailable,
            Fault::Transfer => Error::TransferFailed(format!("injected {:?} failure", operation)),
        }
    }
}

struct OpenSession {
    path: DevicePath,
    replies: mpsc::UnboundedSender<Packet>,
    inbox: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Packet>>>,
    assembler: MessageAssembler,
    close: Arc<CloseHandle>,
}

#[derive(Default)]
struct MockState {
    endpoints: Vec<Endpoint>,
    sessions: HashMap<Session, OpenSession>,
    /// Closed sessions whose receives outlived `disconnect`
    lingering: Vec<(DevicePath, Arc<CloseHandle>)>,
    faults: HashMap<Operation, Fault>,
    sent: Vec<(Session, RawMessage)>,
}

pub struct MockTransport {
    kind: TransportKind,
    framing: Framing,
    state: Mutex<MockState>,
    responder: Mutex<Responder>,
    held: watch::Sender<bool>,
    next_session: AtomicU32,
    counts: Mutex<HashMap<Operation, usize>>,
    receives: AtomicUsize,
}

impl MockTransport {
    /// Transport of `kind` listing `paths`
    pub fn new(kind: TransportKind, paths: &[DevicePath]) -> Self {
        let (held, _) = watch::channel(false);
        let transport = Self {
            kind,
            framing: Framing::Marker,
            state: Mutex::new(MockState::default()),
            responder: Mutex::new(Arc::new(|_: &RawMessage| {
                Some(RawMessage {
                    type_id: SUCCESS_TYPE_ID,
                    payload: Vec::new(),
                })
            })),
            held,
            next_session: AtomicU32::new(1),
            counts: Mutex::new(HashMap::new()),
            receives: AtomicUsize::new(0),
        };
        transport.set_endpoints(paths);
        transport
    }

    pub fn hid(paths: &[DevicePath]) -> Self {
        Self::new(TransportKind::Hid, paths)
    }

    pub fn udp(paths: &[DevicePath]) -> Self {
        Self::new(TransportKind::Udp, paths)
    }

    pub fn with_framing(mut self, framing: Framing) -> Self {
        self.framing = framing;
        self
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Replace the visible endpoints, as if devices were plugged or unplugged
    pub fn set_endpoints(&self, paths: &[DevicePath]) {
        self.state().endpoints = paths
            .iter()
            .map(|path| Endpoint {
                path: *path,
                vendor: DEVICE_VENDOR_ID,
                product: DEVICE_PRODUCT_ID,
            })
            .collect();
    }

    pub fn set_responder(
        &self,
        responder: impl Fn(&RawMessage) -> Option<RawMessage> + Send + Sync + 'static,
    ) {
        *self.responder.lock().unwrap_or_else(|e| e.into_inner()) = Arc::new(responder);
    }

    /// Make `operation` fail until [`heal`](Self::heal) is called
    pub fn fail(&self, operation: Operation, fault: Fault) {
        self.state().faults.insert(operation, fault);
    }

    pub fn heal(&self, operation: Operation) {
        self.state().faults.remove(&operation);
    }

    /// Keep replies queued until [`release_replies`](Self::release_replies)
    pub fn hold_replies(&self) {
        self.held.send_replace(true);
    }

    pub fn release_replies(&self) {
        self.held.send_replace(false);
    }

    /// Times `operation` was attempted
    pub fn count(&self, operation: Operation) -> usize {
        self.counts
            .lock()
            .map(|counts| counts.get(&operation).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn receive_count(&self) -> usize {
        self.receives.load(Ordering::SeqCst)
    }

    /// Complete requests seen so far
    pub fn sent(&self) -> Vec<(Session, RawMessage)> {
        self.state().sent.clone()
    }

    pub fn open_sessions(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self.state().sessions.keys().copied().collect();
        sessions.sort();
        sessions
    }

    fn attempt(&self, operation: Operation) -> Result<()> {
        if let Ok(mut counts) = self.counts.lock() {
            *counts.entry(operation).or_insert(0) += 1;
        }
        match self.state().faults.get(&operation) {
            Some(fault) => Err(fault.error(operation)),
            None => Ok(()),
        }
    }

    fn new_session(&self) -> Session {
        let id = self.next_session.fetch_add(1, Ordering::SeqCst);
        match self.kind {
            TransportKind::Hid => Session::Hid(id),
            TransportKind::Udp => Session::Udp(id),
        }
    }

    fn frame_reply(&self, reply: &RawMessage) -> Result<Vec<Packet>> {
        encode_chunks(reply.type_id, &reply.payload)?
            .iter()
            .map(|chunk| self.framing.frame(chunk).map_err(Error::from))
            .collect()
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn enumerate(&self) -> Result<Vec<Endpoint>> {
        self.attempt(Operation::Enumerate)?;
        Ok(self.state().endpoints.clone())
    }

    async fn connect(&self, path: &DevicePath) -> Result<Session> {
        self.attempt(Operation::Connect)?;
        let mut state = self.state();
        if !state.endpoints.iter().any(|endpoint| endpoint.path == *path) {
            return Err(Error::DeviceUnavailable);
        }

        state.lingering.retain(|(_, close)| close.in_flight() > 0);
        let busy = state.sessions.values().any(|open| open.path == *path)
            || state.lingering.iter().any(|(lingering, _)| lingering == path);
        if busy {
            return Err(Error::TransferFailed(format!("{} is busy", path)));
        }

        let session = self.new_session();
        let (replies, inbox) = mpsc::unbounded_channel();
        state.sessions.insert(
            session,
            OpenSession {
                path: *path,
                replies,
                inbox: Arc::new(tokio::sync::Mutex::new(inbox)),
                assembler: MessageAssembler::new(),
                close: Arc::new(CloseHandle::new()),
            },
        );
        Ok(session)
    }

    async fn disconnect(&self, session: &Session) -> Result<()> {
        let result = self.attempt(Operation::Disconnect);
        // The session is gone either way, as with a yanked cable
        let removed = self.state().sessions.remove(session);
        if let Some(open) = removed {
            if !open.close.close(session, CLOSE_TIMEOUT).await {
                self.state().lingering.push((open.path, open.close.clone()));
            }
        }
        result
    }

    async fn send(&self, session: &Session, packet: Packet) -> Result<()> {
        self.attempt(Operation::Send)?;
        let chunk = self.framing.unframe(packet)?;

        let request = {
            let mut state = self.state();
            let open = state
                .sessions
                .get_mut(session)
                .ok_or_else(|| Error::InvalidSession(session.to_string()))?;
            let Some(request) = open.assembler.push(&chunk)? else {
                return Ok(());
            };
            state.sent.push((*session, request.clone()));
            request
        };

        let responder = self
            .responder
            .lock()
            .map(|responder| responder.clone())
            .map_err(|_| Error::TransferFailed("responder lock poisoned".into()))?;
        let Some(reply) = responder(&request) else {
            return Ok(());
        };

        let packets = self.frame_reply(&reply)?;
        let state = self.state();
        if let Some(open) = state.sessions.get(session) {
            for packet in packets {
                let _ = open.replies.send(packet);
            }
        }
        Ok(())
    }

    async fn receive(&self, session: &Session) -> Result<Packet> {
        self.receives.fetch_add(1, Ordering::SeqCst);
        let (inbox, mut signal) = self
            .state()
            .sessions
            .get(session)
            .map(|open| (open.inbox.clone(), open.close.signal()))
            .ok_or_else(|| Error::InvalidSession(session.to_string()))?;

        let mut held = self.held.subscribe();
        let reply = async {
            if held.wait_for(|held| !*held).await.is_err() {
                return Err(Error::TransferFailed("mock dropped".into()));
            }
            let mut inbox = inbox.lock().await;
            inbox.recv().await.ok_or(Error::SessionReleased)
        };

        tokio::select! {
            biased;
            _ = signal.closed() => Err(Error::SessionReleased),
            result = reply => result,
        }
    }

    fn framing(&self, session: &Session) -> Result<Framing> {
        if self.state().sessions.contains_key(session) {
            Ok(self.framing)
        } else {
            Err(Error::InvalidSession(session.to_string()))
        }
    }
}

impl MockTransport {
    /// Device behind an open session
    pub fn path_of(&self, session: &Session) -> Option<DevicePath> {
        self.state().sessions.get(session).map(|open| open.path)
    }
}
