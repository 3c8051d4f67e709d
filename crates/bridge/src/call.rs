//! One request/response exchange with a device
//!
//! The exchange races against the release of its session: a release fires
//! the callback registered here and the call fails with
//! [`Error::SessionReleased`] instead of waiting on a device that is gone.
//! The pending transport I/O is dropped with the losing branch.

use crate::Bridge;
use crate::transport::Transport;
use common::{Error, Result};
use protocol::{
    Framing, INITIALIZE_MESSAGE, MessageAssembler, RawMessage, Session, encode_chunks,
};
use serde::Serialize;
use serde_json::Value as Json;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Decoded device reply
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallResponse {
    #[serde(rename = "type")]
    pub message_type: String,
    pub message: Json,
}

impl Bridge {
    /// Send `body` as `message_type` on `session` and wait for the reply
    ///
    /// A device failure while sending `Initialize` is reported as
    /// [`Error::DriverProblem`] and feeds the udev advisory.
    pub async fn call(&self, session: &str, message_type: &str, body: &Json) -> Result<CallResponse> {
        let session: Session = session
            .parse()
            .map_err(|_| Error::InvalidSession(session.to_string()))?;

        match self.call_session(session, message_type, body).await {
            Ok(response) => {
                self.record_device_success().await;
                Ok(response)
            }
            Err(e) if message_type == INITIALIZE_MESSAGE && e.is_device_failure() => {
                warn!("Initialize on session {} failed: {}", session, e);
                self.record_device_failure().await;
                Err(Error::DriverProblem(Box::new(e)))
            }
            Err(e) => Err(e),
        }
    }

    async fn call_session(
        &self,
        session: Session,
        message_type: &str,
        body: &Json,
    ) -> Result<CallResponse> {
        let descriptor = self.configuration.descriptor().await?;
        let request = descriptor.encode(message_type, body)?;
        let transport = self.transports.get(session.kind())?.clone();

        let (released_tx, released_rx) = oneshot::channel::<()>();
        let callback = self
            .connections
            .on_release(
                session,
                Box::new(move || {
                    let _ = released_tx.send(());
                }),
            )
            .await?;

        let outcome = tokio::select! {
            biased;
            _ = released_rx => Err(Error::SessionReleased),
            result = async {
                let framing = transport.framing(&session)?;
                exchange(transport.as_ref(), &session, framing, &request).await
            } => result,
        };

        if let Err(e) = self.connections.forget_on_release(session, callback).await {
            debug!("Could not deregister release callback: {}", e);
        }

        let response = outcome?;
        let (message_type, message) = descriptor.decode(&response)?;
        debug!("Session {} answered with {}", session, message_type);
        Ok(CallResponse {
            message_type,
            message,
        })
    }
}

/// Write every chunk of `request`, then read chunks until one message is
/// complete
pub async fn exchange(
    transport: &dyn Transport,
    session: &Session,
    framing: Framing,
    request: &RawMessage,
) -> Result<RawMessage> {
    for chunk in encode_chunks(request.type_id, &request.payload)? {
        transport.send(session, framing.frame(&chunk)?).await?;
    }

    let mut assembler = MessageAssembler::new();
    loop {
        let packet = transport.receive(session).await?;
        let chunk = framing.unframe(packet)?;
        if let Some(message) = assembler.push(&chunk)? {
            return Ok(message);
        }
    }
}
