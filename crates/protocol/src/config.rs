//! Configuration record carried inside a signed blob
//!
//! The record wraps the device's wire protocol as a protobuf
//! `FileDescriptorSet` together with a validity deadline.

use crate::descriptor::ProtocolDescriptor;
use crate::error::{ProtocolError, Result};
use prost::Message;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Device known to a configuration (informational)
#[derive(Clone, PartialEq, prost::Message)]
pub struct KnownDevice {
    #[prost(uint32, optional, tag = "1")]
    pub vendor_id: Option<u32>,
    #[prost(uint32, optional, tag = "2")]
    pub product_id: Option<u32>,
    #[prost(string, optional, tag = "3")]
    pub serial_number: Option<String>,
    #[prost(string, optional, tag = "4")]
    pub path: Option<String>,
}

/// Outer configuration schema
#[derive(Clone, PartialEq, prost::Message)]
pub struct Configuration {
    #[prost(string, repeated, tag = "1")]
    pub whitelist_urls: Vec<String>,
    #[prost(string, repeated, tag = "2")]
    pub blacklist_urls: Vec<String>,
    #[prost(message, optional, tag = "3")]
    pub wire_protocol: Option<prost_types::FileDescriptorSet>,
    #[prost(message, repeated, tag = "4")]
    pub known_devices: Vec<KnownDevice>,
    /// Seconds since the epoch; absent means no deadline
    #[prost(uint32, optional, tag = "5")]
    pub valid_until: Option<u32>,
}

/// Current time in seconds since the epoch
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Decode verified configuration bytes into a protocol descriptor
pub fn parse_configuration(raw: &[u8]) -> Result<ProtocolDescriptor> {
    parse_configuration_at(raw, unix_now())
}

/// Same as [`parse_configuration`], with an explicit notion of "now"
pub fn parse_configuration_at(raw: &[u8], now: u64) -> Result<ProtocolDescriptor> {
    let config = Configuration::decode(raw)?;

    if let Some(valid_until) = config.valid_until {
        let valid_until = u64::from(valid_until);
        if now >= valid_until {
            return Err(ProtocolError::ConfigExpired { now, valid_until });
        }
    }

    let wire_protocol = config
        .wire_protocol
        .ok_or(ProtocolError::MissingWireProtocol)?;

    debug!(
        "Configuration carries {} descriptor files, valid until {:?}",
        wire_protocol.file.len(),
        config.valid_until
    );

    ProtocolDescriptor::from_file_descriptor_set(wire_protocol)
}
