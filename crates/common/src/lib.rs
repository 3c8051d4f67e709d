//! Common utilities for hw-bridge
//!
//! This crate provides shared functionality for the bridge: the error
//! taxonomy surfaced to callers, logging setup, and the async command channel
//! that serializes all connection bookkeeping through one worker.

pub mod channel;
pub mod error;
pub mod logging;

pub use channel::{
    CallbackId, ConnectionBridge, ConnectionCommand, ConnectionWorker, ReleaseCallback,
    create_connection_bridge,
};
pub use error::{Error, Result};
pub use logging::setup_logging;
