//! Packet framing
//!
//! HID stacks disagree on whether the leading byte of a 64-byte report is
//! part of the payload. Devices that declare report ids carry the marker in
//! the report id (63); devices without them need the marker byte prepended
//! to the data itself. [`Framing`] hides that difference so the layers above
//! always deal in 63-byte chunks.
//!
//! ```text
//! Marker:   report_id = 0   data = [63][chunk, zero padded to 63]
//! ReportId: report_id = 63  data = [chunk, zero padded to 63]
//! ```

use crate::error::{ProtocolError, Result};

/// Size of one HID report on the wire
pub const PACKET_SIZE: usize = 64;

/// Logical payload carried by one packet
pub const CHUNK_SIZE: usize = PACKET_SIZE - 1;

/// Marker byte / report id identifying wire protocol packets
pub const REPORT_MARKER: u8 = 63;

/// One packet as exchanged with a transport driver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// HID report id (0 when the device does not use report ids)
    pub report_id: u8,
    /// Report data, excluding the report id
    pub data: Vec<u8>,
}

impl Packet {
    /// Packet without a report id
    pub fn raw(data: Vec<u8>) -> Self {
        Self { report_id: 0, data }
    }
}

/// Framing convention of one connected device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// No report-id capability: marker byte travels inside the data
    Marker,
    /// Report-id capable: marker travels as the report id
    ReportId,
}

impl Framing {
    /// Pick the framing for a device from its report-id capability
    pub fn for_report_ids(has_report_id: bool) -> Self {
        if has_report_id {
            Framing::ReportId
        } else {
            Framing::Marker
        }
    }

    /// Wrap one chunk into a packet
    pub fn frame(&self, chunk: &[u8]) -> Result<Packet> {
        if chunk.len() > CHUNK_SIZE {
            return Err(ProtocolError::ChunkTooLarge {
                size: chunk.len(),
                max: CHUNK_SIZE,
            });
        }

        match self {
            Framing::Marker => {
                let mut data = vec![0u8; PACKET_SIZE];
                data[0] = REPORT_MARKER;
                data[1..1 + chunk.len()].copy_from_slice(chunk);
                Ok(Packet { report_id: 0, data })
            }
            Framing::ReportId => {
                let mut data = vec![0u8; CHUNK_SIZE];
                data[..chunk.len()].copy_from_slice(chunk);
                Ok(Packet {
                    report_id: REPORT_MARKER,
                    data,
                })
            }
        }
    }

    /// Strip framing from a received packet, returning the chunk
    pub fn unframe(&self, packet: Packet) -> Result<Vec<u8>> {
        match (self, packet.report_id) {
            (_, 0) => strip_marker(packet.data),
            (Framing::ReportId, REPORT_MARKER) => Ok(packet.data),
            (_, other) => Err(ProtocolError::InvalidFraming(format!(
                "unexpected report id {}",
                other
            ))),
        }
    }
}

fn strip_marker(mut data: Vec<u8>) -> Result<Vec<u8>> {
    match data.first() {
        Some(&REPORT_MARKER) => {
            data.remove(0);
            Ok(data)
        }
        Some(other) => Err(ProtocolError::InvalidFraming(format!(
            "unexpected marker byte {}",
            other
        ))),
        None => Err(ProtocolError::InvalidFraming("empty packet".to_string())),
    }
}
