//! JSON request routing
//!
//! Requests look like `{"id"?, "type", "body"?}`. Replies echo the id and are
//! either `{"type": "response", "body"}` or `{"type": "error", "message"}`.

use crate::Bridge;
use common::{Error, Result};
use protocol::{DevicePath, Session};
use serde::{Deserialize, Serialize};
use serde_json::{Value as Json, json};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub id: Option<Json>,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub body: Json,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Reply {
    Response {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<Json>,
        body: Json,
    },
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<Json>,
        message: String,
    },
}

impl Reply {
    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error { .. })
    }
}

/// Request types the bridge answers
pub const HANDLERS: &[&str] = &[
    "ping",
    "info",
    "enumerate",
    "listen",
    "acquire",
    "release",
    "configure",
    "call",
    "udevStatus",
];

/// Run one request against the bridge
pub async fn dispatch(bridge: &Bridge, request: Request) -> Reply {
    let id = request.id;
    if !HANDLERS.contains(&request.kind.as_str()) {
        return Reply::Error {
            id,
            message: format!("No function defined for {}", request.kind),
        };
    }
    debug!("Handling {} request", request.kind);

    match route(bridge, &request.kind, &request.body).await {
        Ok(body) => Reply::Response { id, body },
        Err(e) => Reply::Error {
            id,
            message: e.to_string(),
        },
    }
}

/// Handle one line of JSON input, producing one line of JSON output
pub async fn handle_line(bridge: &Bridge, line: &str) -> String {
    let reply = match serde_json::from_str::<Request>(line) {
        Ok(request) => dispatch(bridge, request).await,
        Err(e) => Reply::Error {
            id: None,
            message: format!("Invalid request: {}", e),
        },
    };
    serde_json::to_string(&reply)
        .unwrap_or_else(|e| json!({"type": "error", "message": e.to_string()}).to_string())
}

async fn route(bridge: &Bridge, kind: &str, body: &Json) -> Result<Json> {
    match kind {
        "ping" => Ok(json!("pong")),
        "info" => to_json(&bridge.info().await),
        "enumerate" => to_json(&bridge.enumerate().await?),
        "listen" => {
            let previous = (!body.is_null()).then_some(body);
            to_json(&bridge.listen(previous).await?)
        }
        "acquire" => {
            let (path, previous, check_previous) = acquire_args(body)?;
            let session = bridge.acquire(path, previous, check_previous).await?;
            Ok(json!({ "session": session }))
        }
        "release" => {
            let session: Session = parse_identifier(body, "session")?;
            bridge.release(session).await?;
            Ok(json!("Success"))
        }
        "configure" => {
            let blob = body
                .as_str()
                .ok_or_else(|| Error::InvalidInput("configure expects a string".into()))?;
            bridge.configure(blob).await?;
            Ok(json!("Success"))
        }
        "call" => {
            let (session, message_type, message) = call_args(body)?;
            to_json(&bridge.call(&session, message_type, message).await?)
        }
        "udevStatus" => to_json(&bridge.udev_status().await),
        other => Err(Error::InvalidInput(format!("unhandled request {}", other))),
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<Json> {
    serde_json::to_value(value).map_err(|e| Error::InvalidInput(e.to_string()))
}

/// Identifier given as a string or a non-negative integer
fn identifier_text(value: &Json) -> Option<String> {
    match value {
        Json::String(text) => Some(text.clone()),
        Json::Number(number) => number.as_u64().map(|n| n.to_string()),
        _ => None,
    }
}

fn parse_identifier<T: std::str::FromStr>(value: &Json, what: &str) -> Result<T> {
    let text = identifier_text(value)
        .ok_or_else(|| Error::InvalidInput(format!("{} must be a string or number", what)))?;
    text.parse()
        .map_err(|_| Error::InvalidInput(format!("invalid {} {}", what, text)))
}

/// A bare path skips the previous-session check; `{path, previous}` applies it
fn acquire_args(body: &Json) -> Result<(DevicePath, Option<Session>, bool)> {
    if let Some(object) = body.as_object() {
        let path = object
            .get("path")
            .ok_or_else(|| Error::InvalidInput("acquire expects a path".into()))?;
        let previous = match object.get("previous") {
            None | Some(Json::Null) => None,
            Some(previous) => Some(parse_identifier(previous, "previous session")?),
        };
        return Ok((parse_identifier(path, "path")?, previous, true));
    }
    Ok((parse_identifier(body, "path")?, None, false))
}

fn call_args(body: &Json) -> Result<(String, &str, &Json)> {
    let object = body
        .as_object()
        .ok_or_else(|| Error::InvalidInput("call expects an object".into()))?;

    let session = object
        .get("id")
        .and_then(identifier_text)
        .ok_or_else(|| Error::InvalidInput("call expects a session id".into()))?;
    let message_type = object
        .get("type")
        .and_then(Json::as_str)
        .ok_or_else(|| Error::InvalidInput("call expects a message type".into()))?;
    let message = object
        .get("message")
        .filter(|message| message.is_object())
        .ok_or_else(|| Error::InvalidInput("call expects a message object".into()))?;

    Ok((session, message_type, message))
}
