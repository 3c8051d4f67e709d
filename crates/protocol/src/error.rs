//! Protocol error types

use thiserror::Error;

/// Protocol-level errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Packet marker or report id does not match the device's framing
    #[error("Invalid framing: {0}")]
    InvalidFraming(String),

    /// Chunk does not fit into a single packet
    #[error("Chunk too large: {size} bytes (max: {max})")]
    ChunkTooLarge { size: usize, max: usize },

    /// Declared message length exceeds the allowed maximum
    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// Signature did not verify against any trusted key
    #[error("Configuration is not correctly signed")]
    BadSignature,

    /// Configuration validity window has passed
    #[error("Configuration expired: {now} >= {valid_until}")]
    ConfigExpired { now: u64, valid_until: u64 },

    /// Trusted key could not be parsed
    #[error("Invalid trusted key: {0}")]
    InvalidKey(String),

    /// Configuration record lacks its embedded descriptor set
    #[error("Configuration has no wire protocol")]
    MissingWireProtocol,

    /// Descriptor set declares no message type enum
    #[error("Wire protocol has no {0} enum")]
    MissingMessageTypeEnum(&'static str),

    /// Message type name not present in the descriptor
    #[error("Unknown message type: {0}")]
    UnknownMessageType(String),

    /// Numeric type id not present in the descriptor
    #[error("Unknown message type id: {0}")]
    UnknownTypeId(u16),

    /// Field name not declared by the message
    #[error("Unknown field {field} in message {message}")]
    UnknownField { message: String, field: String },

    /// JSON value does not fit the declared field type
    #[error("Invalid value for field {field}: expected {expected}")]
    InvalidFieldValue { field: String, expected: &'static str },

    /// Hex decoding failure
    #[error("Invalid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),

    /// Protobuf decoding failure
    #[error("Decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    /// Descriptor set could not be turned into a schema
    #[error("Descriptor error: {0}")]
    Descriptor(#[from] prost_reflect::DescriptorError),
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ProtocolError::ConfigExpired {
            now: 2000,
            valid_until: 1000,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("expired"));
        assert!(msg.contains("2000 >= 1000"));
    }

    #[test]
    fn test_chunk_too_large_error() {
        let err = ProtocolError::ChunkTooLarge { size: 80, max: 63 };
        assert!(format!("{}", err).contains("Chunk too large"));
    }
}
