//! Protocol descriptor built from a configuration's wire protocol
//!
//! The descriptor set is loaded into a [`DescriptorPool`]; the enum named
//! `MessageType` then provides the numeric type id of every message the
//! device understands. A value `MessageType_Ping = 1` maps id 1 to the
//! message `<package>.Ping`.

use crate::codec::RawMessage;
use crate::error::{ProtocolError, Result};
use crate::json::{message_from_json, message_to_json};
use prost::Message;
use prost_reflect::{DescriptorPool, DynamicMessage, MessageDescriptor};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Name of the enum holding the type id of every message
pub const MESSAGE_TYPE_ENUM: &str = "MessageType";

/// Prefix stripped from enum value names to get the message name
pub const MESSAGE_TYPE_PREFIX: &str = "MessageType_";

/// Name of the device initialization message
pub const INITIALIZE_MESSAGE: &str = "Initialize";

/// One entry of the type id index
#[derive(Debug, Clone)]
pub struct MessageEntry {
    /// Short display name (e.g. `Features`)
    pub name: String,
    pub descriptor: MessageDescriptor,
}

/// Immutable schema plus type id index
#[derive(Debug, Clone)]
pub struct ProtocolDescriptor {
    by_id: BTreeMap<u16, MessageEntry>,
    by_name: HashMap<String, u16>,
}

impl ProtocolDescriptor {
    pub fn from_file_descriptor_set(set: prost_types::FileDescriptorSet) -> Result<Self> {
        let pool = DescriptorPool::from_file_descriptor_set(set)?;

        let message_type = pool
            .all_enums()
            .find(|e| e.name() == MESSAGE_TYPE_ENUM)
            .ok_or(ProtocolError::MissingMessageTypeEnum(MESSAGE_TYPE_ENUM))?;
        let package = message_type.package_name().to_string();

        let mut by_id = BTreeMap::new();
        let mut by_name = HashMap::new();
        for value in message_type.values() {
            let Some(short) = value.name().strip_prefix(MESSAGE_TYPE_PREFIX) else {
                debug!("Skipping {}: missing {} prefix", value.name(), MESSAGE_TYPE_PREFIX);
                continue;
            };
            let Ok(type_id) = u16::try_from(value.number()) else {
                debug!("Skipping {}: type id {} out of range", value.name(), value.number());
                continue;
            };
            let full_name = if package.is_empty() {
                short.to_string()
            } else {
                format!("{}.{}", package, short)
            };
            let Some(descriptor) = pool.get_message_by_name(&full_name) else {
                debug!("Skipping {}: no message {}", value.name(), full_name);
                continue;
            };

            by_name.insert(short.to_string(), type_id);
            by_id.insert(
                type_id,
                MessageEntry {
                    name: short.to_string(),
                    descriptor,
                },
            );
        }

        debug!("Loaded wire protocol with {} message types", by_id.len());

        Ok(Self { by_id, by_name })
    }

    /// Number of indexed message types
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn type_id(&self, name: &str) -> Option<u16> {
        self.by_name.get(name).copied()
    }

    pub fn entry(&self, type_id: u16) -> Option<&MessageEntry> {
        self.by_id.get(&type_id)
    }

    /// Short message names ordered by type id
    pub fn message_names(&self) -> impl Iterator<Item = &str> {
        self.by_id.values().map(|entry| entry.name.as_str())
    }

    /// Encode a JSON body as message `name`
    pub fn encode(&self, name: &str, body: &serde_json::Value) -> Result<RawMessage> {
        let type_id = self
            .type_id(name)
            .ok_or_else(|| ProtocolError::UnknownMessageType(name.to_string()))?;
        let entry = &self.by_id[&type_id];

        let message = message_from_json(&entry.descriptor, body)?;
        Ok(RawMessage {
            type_id,
            payload: message.encode_to_vec(),
        })
    }

    /// Decode a received message into its name and JSON body
    pub fn decode(&self, message: &RawMessage) -> Result<(String, serde_json::Value)> {
        let entry = self
            .entry(message.type_id)
            .ok_or(ProtocolError::UnknownTypeId(message.type_id))?;

        let decoded = DynamicMessage::decode(entry.descriptor.clone(), message.payload.as_slice())?;
        Ok((entry.name.clone(), message_to_json(&decoded)))
    }
}
