//! Message chunk codec
//!
//! A typed message travels as a byte stream split into 63-byte chunks; the
//! framing layer then turns each chunk into one packet.
//!
//! # Stream Format
//!
//! ```text
//! ["##"][type id: u16 (big-endian)][length: u32 (big-endian)][payload]
//! ```
//!
//! The last chunk is zero padded. Reassembly reads the header from the first
//! chunk and keeps accepting chunks until `length` payload bytes are present.

use crate::error::{ProtocolError, Result};
use crate::framing::CHUNK_SIZE;
use byteorder::{BigEndian, ByteOrder};

/// Magic bytes opening every message
pub const MESSAGE_MAGIC: &[u8; 2] = b"##";

/// Magic plus type id plus length
pub const HEADER_SIZE: usize = 8;

/// Maximum accepted payload size (32 MiB)
pub const MAX_MESSAGE_SIZE: usize = 32 * 1024 * 1024;

/// Split one message into zero-padded chunks
///
/// # Example
/// ```
/// use protocol::codec::encode_chunks;
///
/// let chunks = encode_chunks(17, &[1, 2, 3]).unwrap();
/// assert_eq!(chunks.len(), 1);
/// assert_eq!(&chunks[0][..8], &[b'#', b'#', 0, 17, 0, 0, 0, 3]);
/// ```
pub fn encode_chunks(type_id: u16, payload: &[u8]) -> Result<Vec<Vec<u8>>> {
    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: payload.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }

    let mut stream = Vec::with_capacity(HEADER_SIZE + payload.len());
    stream.extend_from_slice(MESSAGE_MAGIC);
    let mut header = [0u8; 6];
    BigEndian::write_u16(&mut header[..2], type_id);
    BigEndian::write_u32(&mut header[2..], payload.len() as u32);
    stream.extend_from_slice(&header);
    stream.extend_from_slice(payload);

    Ok(stream
        .chunks(CHUNK_SIZE)
        .map(|chunk| {
            let mut padded = vec![0u8; CHUNK_SIZE];
            padded[..chunk.len()].copy_from_slice(chunk);
            padded
        })
        .collect())
}

/// Fully reassembled message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    /// Numeric message type
    pub type_id: u16,
    /// Protobuf-encoded body
    pub payload: Vec<u8>,
}

/// Incremental reassembly of received chunks
#[derive(Debug, Default)]
pub struct MessageAssembler {
    header: Option<(u16, usize)>,
    payload: Vec<u8>,
}

impl MessageAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk
    ///
    /// Returns the message once its declared length has been collected.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Option<RawMessage>> {
        let (type_id, length, data) = match self.header {
            Some((type_id, length)) => (type_id, length, chunk),
            None => {
                if chunk.len() < HEADER_SIZE || &chunk[..2] != MESSAGE_MAGIC {
                    return Err(ProtocolError::InvalidFraming(
                        "message does not start with ##".to_string(),
                    ));
                }
                let type_id = BigEndian::read_u16(&chunk[2..4]);
                let length = BigEndian::read_u32(&chunk[4..8]) as usize;
                if length > MAX_MESSAGE_SIZE {
                    return Err(ProtocolError::MessageTooLarge {
                        size: length,
                        max: MAX_MESSAGE_SIZE,
                    });
                }
                self.header = Some((type_id, length));
                self.payload.reserve(length);
                (type_id, length, &chunk[HEADER_SIZE..])
            }
        };

        let wanted = length - self.payload.len();
        self.payload
            .extend_from_slice(&data[..data.len().min(wanted)]);

        if self.payload.len() == length {
            self.header = None;
            Ok(Some(RawMessage {
                type_id,
                payload: std::mem::take(&mut self.payload),
            }))
        } else {
            Ok(None)
        }
    }
}
