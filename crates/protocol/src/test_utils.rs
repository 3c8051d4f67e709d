//! Test fixtures shared across crates
//!
//! Provides a small wire protocol descriptor set and signing helpers that
//! produce configuration blobs accepted by [`crate::verify_blob`].
//!
//! # Example
//!
//! ```
//! use protocol::test_utils::{signing_key, signed_configuration, trusted_keys_for};
//! use protocol::{parse_configuration, verify_blob};
//!
//! let key = signing_key(1);
//! let blob = signed_configuration(&key, None);
//! let raw = verify_blob(&blob, &trusted_keys_for(&[&key])).unwrap();
//! let descriptor = parse_configuration(&raw).unwrap();
//! assert_eq!(descriptor.type_id("Ping"), Some(1));
//! ```

use crate::config::Configuration;
use crate::descriptor::ProtocolDescriptor;
use crate::verify::TrustedKeys;
use k256::ecdsa::signature::Signer;
use k256::ecdsa::{Signature, SigningKey, VerifyingKey};
use prost::Message;
use prost_reflect::DescriptorPool;
use prost_types::field_descriptor_proto::{Label, Type};
use prost_types::{
    DescriptorProto, EnumDescriptorProto, EnumValueDescriptorProto, FieldDescriptorProto,
    FileDescriptorProto, FileDescriptorSet,
};

/// Package of the fixture wire protocol
pub const SAMPLE_PACKAGE: &str = "hw";

fn field(name: &str, number: i32, ty: Type, label: Label, type_name: Option<&str>) -> FieldDescriptorProto {
    FieldDescriptorProto {
        name: Some(name.to_string()),
        number: Some(number),
        label: Some(label as i32),
        r#type: Some(ty as i32),
        type_name: type_name.map(str::to_string),
        ..Default::default()
    }
}

fn optional(name: &str, number: i32, ty: Type) -> FieldDescriptorProto {
    field(name, number, ty, Label::Optional, None)
}

fn message(name: &str, fields: Vec<FieldDescriptorProto>) -> DescriptorProto {
    DescriptorProto {
        name: Some(name.to_string()),
        field: fields,
        ..Default::default()
    }
}

fn enumeration(name: &str, values: &[(&str, i32)]) -> EnumDescriptorProto {
    EnumDescriptorProto {
        name: Some(name.to_string()),
        value: values
            .iter()
            .map(|(name, number)| EnumValueDescriptorProto {
                name: Some(name.to_string()),
                number: Some(*number),
                ..Default::default()
            })
            .collect(),
        ..Default::default()
    }
}

/// Fixture wire protocol: Initialize, Ping, Success, Failure, Features
///
/// The `MessageType` enum also carries one value without a matching message
/// (99) and one without the expected prefix (100).
pub fn sample_descriptor_set() -> FileDescriptorSet {
    let file = FileDescriptorProto {
        name: Some("messages.proto".to_string()),
        package: Some(SAMPLE_PACKAGE.to_string()),
        message_type: vec![
            message("Initialize", vec![]),
            message(
                "Ping",
                vec![
                    optional("message", 1, Type::String),
                    optional("button_protection", 2, Type::Bool),
                ],
            ),
            message("Success", vec![optional("message", 1, Type::String)]),
            message(
                "Failure",
                vec![
                    field("code", 1, Type::Enum, Label::Optional, Some(".hw.FailureType")),
                    optional("message", 2, Type::String),
                ],
            ),
            message(
                "CoinType",
                vec![
                    optional("coin_name", 1, Type::String),
                    optional("address_type", 2, Type::Uint32),
                ],
            ),
            message(
                "Features",
                vec![
                    optional("vendor", 1, Type::String),
                    optional("major_version", 2, Type::Uint32),
                    optional("session_id", 3, Type::Bytes),
                    field("languages", 4, Type::String, Label::Repeated, None),
                    optional("counter", 5, Type::Uint64),
                    field("coins", 6, Type::Message, Label::Repeated, Some(".hw.CoinType")),
                ],
            ),
        ],
        enum_type: vec![
            enumeration(
                "FailureType",
                &[("Failure_UnexpectedMessage", 1), ("Failure_ActionCancelled", 4)],
            ),
            enumeration(
                "MessageType",
                &[
                    ("MessageType_Initialize", 0),
                    ("MessageType_Ping", 1),
                    ("MessageType_Success", 2),
                    ("MessageType_Failure", 3),
                    ("MessageType_Features", 17),
                    ("MessageType_Unlisted", 99),
                    ("Unprefixed", 100),
                ],
            ),
        ],
        ..Default::default()
    };

    FileDescriptorSet { file: vec![file] }
}

pub fn sample_pool() -> DescriptorPool {
    DescriptorPool::from_file_descriptor_set(sample_descriptor_set())
        .expect("fixture descriptor set is valid")
}

pub fn sample_descriptor() -> ProtocolDescriptor {
    ProtocolDescriptor::from_file_descriptor_set(sample_descriptor_set())
        .expect("fixture descriptor set is valid")
}

/// Configuration record around the fixture wire protocol
pub fn sample_configuration(valid_until: Option<u32>) -> Configuration {
    Configuration {
        wire_protocol: Some(sample_descriptor_set()),
        valid_until,
        ..Default::default()
    }
}

/// Deterministic signing key (`seed` must be non-zero)
pub fn signing_key(seed: u8) -> SigningKey {
    SigningKey::from_slice(&[seed; 32]).expect("non-zero seed is a valid scalar")
}

pub fn trusted_keys_for(keys: &[&SigningKey]) -> TrustedKeys {
    TrustedKeys::new(keys.iter().map(|key| VerifyingKey::from(*key)).collect())
}

/// Hex SEC1 public key, as written in the bridge configuration file
pub fn trusted_key_hex(key: &SigningKey) -> String {
    hex::encode(VerifyingKey::from(key).to_sec1_bytes())
}

/// `hex(signature) ++ hex(payload)`
pub fn signed_blob_for(key: &SigningKey, payload: &[u8]) -> String {
    let signature: Signature = key.sign(payload);
    format!("{}{}", hex::encode(signature.to_bytes()), hex::encode(payload))
}

/// Signed fixture configuration
pub fn signed_configuration(key: &SigningKey, valid_until: Option<u32>) -> String {
    signed_blob_for(key, &sample_configuration(valid_until).encode_to_vec())
}
