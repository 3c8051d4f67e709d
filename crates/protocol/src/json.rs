//! JSON mapping for dynamic protobuf messages
//!
//! Callers speak JSON; the device speaks protobuf. Bytes fields travel as
//! lower-case hex strings, enums as value names, unset singular fields as
//! `null`.

use crate::error::{ProtocolError, Result};
use bytes::Bytes;
use prost_reflect::{
    DynamicMessage, EnumDescriptor, FieldDescriptor, Kind, MapKey, MessageDescriptor,
    ReflectMessage, Value,
};
use serde_json::{Map, Number, Value as Json};

/// Build a message of type `descriptor` from a JSON object
pub fn message_from_json(descriptor: &MessageDescriptor, json: &Json) -> Result<DynamicMessage> {
    let object = json.as_object().ok_or_else(|| ProtocolError::InvalidFieldValue {
        field: descriptor.name().to_string(),
        expected: "object",
    })?;

    let mut message = DynamicMessage::new(descriptor.clone());
    for (name, value) in object {
        let field = descriptor
            .get_field_by_name(name)
            .ok_or_else(|| ProtocolError::UnknownField {
                message: descriptor.full_name().to_string(),
                field: name.clone(),
            })?;

        if value.is_null() {
            continue;
        }

        let value = field_from_json(&field, value)?;
        message
            .try_set_field(&field, value)
            .map_err(|_| ProtocolError::InvalidFieldValue {
                field: field.full_name().to_string(),
                expected: "value matching the field type",
            })?;
    }

    Ok(message)
}

fn field_from_json(field: &FieldDescriptor, json: &Json) -> Result<Value> {
    if field.is_map() {
        return Err(invalid(field, "non-map field"));
    }

    if field.is_list() {
        let items = json.as_array().ok_or_else(|| invalid(field, "array"))?;
        let values = items
            .iter()
            .map(|item| scalar_from_json(field, item))
            .collect::<Result<Vec<_>>>()?;
        return Ok(Value::List(values));
    }

    scalar_from_json(field, json)
}

fn scalar_from_json(field: &FieldDescriptor, json: &Json) -> Result<Value> {
    let value = match field.kind() {
        Kind::Bool => Value::Bool(json.as_bool().ok_or_else(|| invalid(field, "boolean"))?),
        Kind::String => Value::String(
            json.as_str()
                .ok_or_else(|| invalid(field, "string"))?
                .to_string(),
        ),
        Kind::Bytes => Value::Bytes(Bytes::from(bytes_from_json(field, json)?)),
        Kind::Int32 | Kind::Sint32 | Kind::Sfixed32 => {
            let n = integer_from_json::<i64>(field, json)?;
            Value::I32(i32::try_from(n).map_err(|_| invalid(field, "32-bit integer"))?)
        }
        Kind::Uint32 | Kind::Fixed32 => {
            let n = integer_from_json::<u64>(field, json)?;
            Value::U32(u32::try_from(n).map_err(|_| invalid(field, "unsigned 32-bit integer"))?)
        }
        Kind::Int64 | Kind::Sint64 | Kind::Sfixed64 => {
            Value::I64(integer_from_json::<i64>(field, json)?)
        }
        Kind::Uint64 | Kind::Fixed64 => Value::U64(integer_from_json::<u64>(field, json)?),
        Kind::Float => Value::F32(json.as_f64().ok_or_else(|| invalid(field, "number"))? as f32),
        Kind::Double => Value::F64(json.as_f64().ok_or_else(|| invalid(field, "number"))?),
        Kind::Enum(descriptor) => Value::EnumNumber(enum_from_json(field, &descriptor, json)?),
        Kind::Message(descriptor) => Value::Message(message_from_json(&descriptor, json)?),
    };
    Ok(value)
}

/// Hex string or array of byte values
fn bytes_from_json(field: &FieldDescriptor, json: &Json) -> Result<Vec<u8>> {
    match json {
        Json::String(text) => Ok(hex::decode(text)?),
        Json::Array(items) => items
            .iter()
            .map(|item| {
                item.as_u64()
                    .and_then(|b| u8::try_from(b).ok())
                    .ok_or_else(|| invalid(field, "hex string or byte array"))
            })
            .collect(),
        _ => Err(invalid(field, "hex string or byte array")),
    }
}

/// JSON number, or a decimal string for values beyond the f64-safe range
fn integer_from_json<T>(field: &FieldDescriptor, json: &Json) -> Result<T>
where
    T: TryFrom<i64> + TryFrom<u64> + std::str::FromStr,
{
    let parsed = match json {
        Json::Number(n) => n
            .as_u64()
            .and_then(|n| T::try_from(n).ok())
            .or_else(|| n.as_i64().and_then(|n| T::try_from(n).ok())),
        Json::String(text) => text.trim().parse::<T>().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| invalid(field, "integer"))
}

fn enum_from_json(field: &FieldDescriptor, descriptor: &EnumDescriptor, json: &Json) -> Result<i32> {
    match json {
        Json::String(name) => descriptor
            .get_value_by_name(name)
            .map(|value| value.number())
            .ok_or_else(|| invalid(field, "enum value name")),
        Json::Number(n) => n
            .as_i64()
            .and_then(|n| i32::try_from(n).ok())
            .ok_or_else(|| invalid(field, "enum value number")),
        _ => Err(invalid(field, "enum value name or number")),
    }
}

fn invalid(field: &FieldDescriptor, expected: &'static str) -> ProtocolError {
    ProtocolError::InvalidFieldValue {
        field: field.full_name().to_string(),
        expected,
    }
}

/// Render a message as a JSON object holding every declared field
pub fn message_to_json(message: &DynamicMessage) -> Json {
    let mut object = Map::new();
    for field in message.descriptor().fields() {
        let value = if field.is_list() || field.is_map() || message.has_field(&field) {
            value_to_json(&field.kind(), &message.get_field(&field))
        } else {
            Json::Null
        };
        object.insert(field.name().to_string(), value);
    }
    Json::Object(object)
}

fn value_to_json(kind: &Kind, value: &Value) -> Json {
    match value {
        Value::Bool(b) => Json::Bool(*b),
        Value::I32(n) => Json::from(*n),
        Value::I64(n) => Json::from(*n),
        Value::U32(n) => Json::from(*n),
        Value::U64(n) => Json::from(*n),
        Value::F32(n) => Number::from_f64(f64::from(*n)).map_or(Json::Null, Json::Number),
        Value::F64(n) => Number::from_f64(*n).map_or(Json::Null, Json::Number),
        Value::String(s) => Json::String(s.clone()),
        Value::Bytes(b) => Json::String(hex::encode(b)),
        Value::EnumNumber(number) => match kind {
            Kind::Enum(descriptor) => descriptor
                .get_value(*number)
                .map(|value| Json::String(value.name().to_string()))
                .unwrap_or_else(|| Json::from(*number)),
            _ => Json::from(*number),
        },
        Value::Message(message) => message_to_json(message),
        Value::List(items) => Json::Array(items.iter().map(|item| value_to_json(kind, item)).collect()),
        Value::Map(entries) => {
            let value_kind = match kind {
                Kind::Message(entry) => entry.map_entry_value_field().kind(),
                other => other.clone(),
            };
            Json::Object(
                entries
                    .iter()
                    .map(|(key, value)| (map_key_text(key), value_to_json(&value_kind, value)))
                    .collect(),
            )
        }
    }
}

fn map_key_text(key: &MapKey) -> String {
    match key {
        MapKey::Bool(b) => b.to_string(),
        MapKey::I32(n) => n.to_string(),
        MapKey::I64(n) => n.to_string(),
        MapKey::U32(n) => n.to_string(),
        MapKey::U64(n) => n.to_string(),
        MapKey::String(s) => s.clone(),
    }
}
