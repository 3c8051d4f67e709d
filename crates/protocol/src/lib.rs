//! Protocol library for hw-bridge
//!
//! This crate covers everything between a caller's JSON message and the
//! 64-byte packets a hardware wallet exchanges with the host: device and
//! session identifiers, packet framing, the `##` message chunk codec, signed
//! configuration verification, and the dynamic protobuf descriptor used to
//! encode and decode typed messages.
//!
//! # Example
//!
//! ```
//! use protocol::codec::{MessageAssembler, encode_chunks};
//! use protocol::Framing;
//!
//! let framing = Framing::for_report_ids(false);
//! let mut assembler = MessageAssembler::new();
//!
//! let mut received = None;
//! for chunk in encode_chunks(1, b"ping").unwrap() {
//!     let packet = framing.frame(&chunk).unwrap();
//!     let chunk = framing.unframe(packet).unwrap();
//!     received = assembler.push(&chunk).unwrap();
//! }
//! assert_eq!(received.unwrap().payload, b"ping");
//! ```

pub mod codec;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod framing;
pub mod json;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod types;
pub mod verify;

pub use codec::{MessageAssembler, RawMessage, encode_chunks};
pub use config::{Configuration, KnownDevice, parse_configuration, parse_configuration_at, unix_now};
pub use descriptor::{INITIALIZE_MESSAGE, MessageEntry, ProtocolDescriptor};
pub use error::{ProtocolError, Result};
pub use framing::{CHUNK_SIZE, Framing, PACKET_SIZE, Packet, REPORT_MARKER};
pub use types::{
    DEVICE_PRODUCT_ID, DEVICE_VENDOR_ID, DeviceDescriptor, DevicePath, InvalidIdentifier, Session,
    TransportKind, U2F_USAGE_PAGE,
};
pub use verify::{TrustedKeys, verify_blob};
