//! Minimal response converter (C11): protobuf -> JSON.
//!
//! Not part of the request path proper. The full response path (protobuf
//! responses translated back into streamed JSON) stays an external
//! collaborator; this is only enough of the reverse direction — one decoded
//! message to one `serde_json::Value` — to state and test the round-trip
//! property against [`crate::message_translator::RequestMessageTranslator`]'s
//! output. Uses the same JSON-name and base64 conventions as the request
//! path so the two sides are actually comparable.

use base64::{engine::general_purpose::STANDARD, Engine};
use prost_reflect::{DynamicMessage, Kind, ReflectMessage, Value};
use serde_json::{Map, Number};

use crate::types::{self, Type};

/// Converts a decoded message to its JSON representation.
///
/// Unset singular scalar fields are omitted, matching proto3 JSON mapping
/// semantics; `google.protobuf.Struct`/`Value`/`ListValue` fields are
/// delegated to `prost_reflect`'s own `serde` support, the same mapping
/// [`crate::message_translator`] used to build them.
pub fn to_json(msg: &DynamicMessage) -> serde_json::Value {
    let ty = msg.descriptor();
    if types::is_well_known_struct_family(&ty) {
        return serde_json::to_value(msg).unwrap_or(serde_json::Value::Null);
    }

    let mut object = Map::new();
    for field in ty.fields() {
        if !msg.has_field(&field) {
            continue;
        }
        let value = msg.get_field(&field).into_owned();
        object.insert(field.json_name().to_owned(), value_to_json(&field, &value));
    }
    serde_json::Value::Object(object)
}

fn value_to_json(field: &prost_reflect::FieldDescriptor, value: &Value) -> serde_json::Value {
    match value {
        Value::List(items) => serde_json::Value::Array(items.iter().map(|v| scalar_or_message_to_json(field, v)).collect()),
        Value::Map(entries) => {
            let mut object = Map::new();
            for (k, v) in entries {
                object.insert(map_key_to_string(k), scalar_or_message_to_json(field, v));
            }
            serde_json::Value::Object(object)
        }
        other => scalar_or_message_to_json(field, other),
    }
}

fn map_key_to_string(key: &prost_reflect::MapKey) -> String {
    match key {
        prost_reflect::MapKey::Bool(b) => b.to_string(),
        prost_reflect::MapKey::I32(v) => v.to_string(),
        prost_reflect::MapKey::I64(v) => v.to_string(),
        prost_reflect::MapKey::U32(v) => v.to_string(),
        prost_reflect::MapKey::U64(v) => v.to_string(),
        prost_reflect::MapKey::String(s) => s.clone(),
    }
}

fn scalar_or_message_to_json(field: &prost_reflect::FieldDescriptor, value: &Value) -> serde_json::Value {
    match value {
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::I32(v) => Number::from(*v).into(),
        Value::U32(v) => Number::from(*v).into(),
        Value::I64(v) => int_or_string(*v as i128, v.to_string()),
        Value::U64(v) => int_or_string(*v as i128, v.to_string()),
        Value::F32(v) => Number::from_f64(*v as f64).map(Into::into).unwrap_or(serde_json::Value::Null),
        Value::F64(v) => Number::from_f64(*v).map(Into::into).unwrap_or(serde_json::Value::Null),
        Value::String(s) => serde_json::Value::String(s.clone()),
        Value::Bytes(b) => serde_json::Value::String(STANDARD.encode(b)),
        Value::EnumNumber(n) => enum_to_json(field, *n),
        Value::Message(m) => to_json(m),
        Value::List(_) | Value::Map(_) => serde_json::Value::Null,
    }
}

/// The canonical proto3 JSON mapping renders 64-bit integers as strings;
/// here we keep them as JSON numbers whenever the value is representable
/// without loss, and fall back to a string only outside that range, since
/// the request side already accepts both forms.
fn int_or_string(value: i128, fallback: String) -> serde_json::Value {
    if (i64::MIN as i128..=i64::MAX as i128).contains(&value) {
        Number::from(value as i64).into()
    } else {
        serde_json::Value::String(fallback)
    }
}

fn enum_to_json(field: &prost_reflect::FieldDescriptor, number: i32) -> serde_json::Value {
    if let Kind::Enum(enum_ty) = field.kind() {
        if let Some(value) = enum_ty.get_value(number) {
            return serde_json::Value::String(value.name().to_owned());
        }
    }
    Number::from(number).into()
}

/// Re-decodes a framed request message (stripping the 5-byte gRPC
/// delimiter if present) purely for test round-tripping; not part of the
/// production reverse path.
pub fn decode_framed(ty: &Type, bytes: &[u8]) -> Result<DynamicMessage, prost::DecodeError> {
    let payload = if bytes.len() >= 5 && bytes[0] == 0 { &bytes[5..] } else { bytes };
    DynamicMessage::decode(ty.clone(), payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message_translator::RequestMessageTranslator;
    use crate::message_stream::MessageStream;
    use crate::types::TypeDatabase;
    use crate::writer::ObjectWriter;
    use prost_reflect::DescriptorPool;

    fn db() -> TypeDatabase {
        TypeDatabase::new(DescriptorPool::decode(include_bytes!(concat!(env!("OUT_DIR"), "/fixtures_descriptor.bin")).as_ref()).unwrap())
    }

    #[test]
    fn round_trips_a_flat_message_through_json() {
        let db = db();
        let ty = db.resolve_message("tonic.transcoding.fixtures.StringPayload").unwrap();
        let mut t = RequestMessageTranslator::new(ty.clone(), false);
        t.start_object("").render_string("payload", "hello").end_object();
        let mut out = t.output();
        let bytes = out.next_message().unwrap();

        let decoded = decode_framed(&ty, &bytes).unwrap();
        let json = to_json(&decoded);
        assert_eq!(json, serde_json::json!({"payload": "hello"}));
    }

    #[test]
    fn unset_scalar_fields_are_omitted() {
        let db = db();
        let ty = db.resolve_message("tonic.transcoding.fixtures.StringPayload").unwrap();
        let msg = DynamicMessage::new(ty);
        assert_eq!(to_json(&msg), serde_json::json!({}));
    }

    #[test]
    fn enum_fields_render_by_symbol_name() {
        let db = db();
        let ty = db.resolve_message("tonic.transcoding.fixtures.EnumPayload").unwrap();
        if let Some(field) = ty.get_field_by_name("status") {
            let mut msg = DynamicMessage::new(ty);
            msg.set_field(&field, Value::EnumNumber(1));
            let json = to_json(&msg);
            assert!(json.get("status").map(|v| v.is_string()).unwrap_or(false));
        }
    }
}
