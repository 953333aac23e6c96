//! RequestMessageTranslator (C6): the terminal sink that turns a typed
//! event stream into one serialized protobuf message.
//!
//! Built directly on `prost_reflect::DynamicMessage`, the way
//! `other_examples/.../grpcurl-rs format.rs` constructs messages from a
//! descriptor at runtime rather than from generated Rust types — the
//! translator has no compile-time knowledge of any message it builds.
//! `google.protobuf.Struct`/`Value`/`ListValue` subtrees are instead built
//! as a plain `serde_json::Value` tree and handed to
//! `DynamicMessage::deserialize`, which already knows the well-known
//! JSON<->Struct mapping (enabled by this crate's `prost-reflect` `serde`
//! feature) — no separate hand-rolled Struct builder is needed.

use bytes::{BufMut, Bytes, BytesMut};
use prost::Message;
use prost_reflect::{Cardinality, DynamicMessage, Kind, Value};
use tonic::{Code, Status};

use crate::json::events::decode_base64;
use crate::message_stream::FifoMessageStream;
use crate::types::{self, Field, Type};
use crate::writer::ObjectWriter;

enum IncomingScalar {
    Null,
    Bool(bool),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    Str(String),
    Bytes(Vec<u8>),
}

/// Where a frame's finished value is deposited once its closing event
/// arrives.
enum OpenedAs {
    /// The pre-existing top-level message; finishing it finalizes output.
    Root,
    /// A singular message/struct-family field on the frame below.
    Field(Field),
    /// One element of the `List` frame below.
    ListElement,
}

enum FrameBody {
    Message { ty: Type, msg: DynamicMessage },
    List { field: Field, items: Vec<Value> },
    Dynamic { target_type: Type, builder: JsonBuilder },
    /// An unresolvable field name or shape mismatch already recorded an
    /// error; further nested events are swallowed so depth bookkeeping
    /// stays balanced without ever touching a descriptor again.
    Poisoned,
}

struct StackFrame {
    opened_as: Option<OpenedAs>,
    body: FrameBody,
}

impl StackFrame {
    fn root(ty: Type, msg: DynamicMessage) -> Self {
        Self { opened_as: Some(OpenedAs::Root), body: FrameBody::Message { ty, msg } }
    }

    fn poisoned() -> Self {
        Self { opened_as: None, body: FrameBody::Poisoned }
    }
}

/// Accumulates a `serde_json::Value` tree for a dynamically-typed
/// `Struct`/`Value`/`ListValue` subtree. Each frame remembers the name it
/// was opened under so closing it can merge the finished value into its
/// parent frame without any side-channel bookkeeping.
struct JsonBuilder {
    stack: Vec<(String, JsonAccum)>,
}

enum JsonAccum {
    Obj(serde_json::Map<String, serde_json::Value>),
    Arr(Vec<serde_json::Value>),
}

impl JsonBuilder {
    fn new(name: &str, as_list: bool) -> Self {
        let accum = if as_list { JsonAccum::Arr(Vec::new()) } else { JsonAccum::Obj(serde_json::Map::new()) };
        Self { stack: vec![(name.to_owned(), accum)] }
    }

    fn start_object(&mut self, name: &str) {
        self.stack.push((name.to_owned(), JsonAccum::Obj(serde_json::Map::new())));
    }

    fn start_list(&mut self, name: &str) {
        self.stack.push((name.to_owned(), JsonAccum::Arr(Vec::new())));
    }

    fn push_value(&mut self, name: &str, value: serde_json::Value) {
        match self.stack.last_mut() {
            Some((_, JsonAccum::Obj(m))) => {
                m.insert(name.to_owned(), value);
            }
            Some((_, JsonAccum::Arr(a))) => a.push(value),
            None => {}
        }
    }

    /// Pops the top frame. Returns its own name, its finished value, and
    /// whether the builder is now empty (meaning the whole subtree is done).
    fn end(&mut self) -> (String, serde_json::Value, bool) {
        let (name, accum) = self.stack.pop().expect("end() called on an empty JsonBuilder");
        let value = match accum {
            JsonAccum::Obj(m) => serde_json::Value::Object(m),
            JsonAccum::Arr(a) => serde_json::Value::Array(a),
        };
        (name, value, self.stack.is_empty())
    }
}

pub struct RequestMessageTranslator {
    stack: Vec<StackFrame>,
    output_delimiters: bool,
    stream: FifoMessageStream,
}

impl RequestMessageTranslator {
    pub fn new(root_type: Type, output_delimiters: bool) -> Self {
        let msg = DynamicMessage::new(root_type.clone());
        Self { stack: vec![StackFrame::root(root_type, msg)], output_delimiters, stream: FifoMessageStream::new() }
    }

    /// The produced `MessageStream`; yields the single serialized message
    /// once translation completes, or nothing if a fatal error was set.
    pub fn output(self) -> FifoMessageStream {
        self.stream
    }

    fn fail(&mut self, status: Status) {
        self.stream.set_status(status);
    }

    fn enter_object_or_list(&mut self, name: &str, as_list: bool) {
        if name.is_empty() && self.stack.len() == 1 {
            // The body's own unprefixed root open (or a freshly allocated
            // per-element translator's first event): the `Root` frame
            // already represents this container, so there is nothing to
            // push. A list element's own `start_object("")` is handled
            // below instead, since by then the stack holds the
            // surrounding `List` frame on top.
            return;
        }

        let Some(top) = self.stack.last_mut() else { return };
        match &mut top.body {
            FrameBody::Poisoned => self.stack.push(StackFrame::poisoned()),
            FrameBody::Dynamic { builder, .. } => {
                if as_list {
                    builder.start_list(name);
                } else {
                    builder.start_object(name);
                }
            }
            FrameBody::List { field, .. } => {
                let field = field.clone();
                self.open_child(OpenedAs::ListElement, &field, as_list);
            }
            FrameBody::Message { ty, .. } => match types::resolve_field(ty, name) {
                Some(field) => self.open_child(OpenedAs::Field(field.clone()), &field, as_list),
                None => {
                    self.fail(Status::new(Code::InvalidArgument, format!("field {name} not present in the current type")));
                    self.stack.push(StackFrame::poisoned());
                }
            },
        }
    }

    fn open_child(&mut self, opened_as: OpenedAs, field: &Field, as_list: bool) {
        if is_struct_family(field) {
            let target_type = message_type_of(field);
            let builder = JsonBuilder::new(field.name(), as_list);
            self.stack.push(StackFrame { opened_as: Some(opened_as), body: FrameBody::Dynamic { target_type, builder } });
            return;
        }

        if as_list {
            self.stack.push(StackFrame { opened_as: Some(opened_as), body: FrameBody::List { field: field.clone(), items: Vec::new() } });
            return;
        }

        match field.kind() {
            Kind::Message(nested) => {
                let msg = DynamicMessage::new(nested.clone());
                self.stack.push(StackFrame { opened_as: Some(opened_as), body: FrameBody::Message { ty: nested, msg } });
            }
            _ => {
                self.fail(Status::new(Code::InvalidArgument, format!("field {} is not a message field", field.name())));
                self.stack.push(StackFrame::poisoned());
            }
        }
    }

    fn close_current(&mut self) {
        let Some(frame) = self.stack.pop() else { return };
        match frame.body {
            FrameBody::Poisoned => {}
            FrameBody::Dynamic { target_type, mut builder } => {
                let (name, value, done) = builder.end();
                if !done {
                    if let Some(StackFrame { body: FrameBody::Dynamic { builder: parent_builder, .. }, .. }) = self.stack.last_mut() {
                        parent_builder.push_value(&name, value);
                    }
                    self.stack.push(StackFrame { opened_as: frame.opened_as, body: FrameBody::Dynamic { target_type, builder } });
                    return;
                }
                match DynamicMessage::deserialize(target_type, value) {
                    Ok(msg) => self.deposit(frame.opened_as, Value::Message(msg)),
                    Err(err) => self.fail(Status::new(Code::InvalidArgument, format!("invalid Struct payload: {err}"))),
                }
            }
            FrameBody::List { items, .. } => self.deposit(frame.opened_as, Value::List(items)),
            FrameBody::Message { ty, msg } => {
                check_required_fields(&ty, &msg, &mut self.stream);
                match frame.opened_as {
                    Some(OpenedAs::Root) => self.finalize(msg),
                    other => self.deposit(other, Value::Message(msg)),
                }
            }
        }
    }

    fn deposit(&mut self, opened_as: Option<OpenedAs>, value: Value) {
        match opened_as {
            Some(OpenedAs::Field(field)) => {
                if let Some(StackFrame { body: FrameBody::Message { msg, .. }, .. }) = self.stack.last_mut() {
                    msg.set_field(&field, value);
                }
            }
            Some(OpenedAs::ListElement) => {
                if let Some(StackFrame { body: FrameBody::List { items, .. }, .. }) = self.stack.last_mut() {
                    items.push(value);
                }
            }
            Some(OpenedAs::Root) | None => {}
        }
    }

    fn finalize(&mut self, msg: DynamicMessage) {
        let payload = msg.encode_to_vec();
        let framed = if self.output_delimiters { frame_message(&payload) } else { Bytes::from(payload) };
        self.stream.push(framed);
        self.stream.mark_producer_finished();
    }

    fn render_scalar(&mut self, name: &str, value: IncomingScalar) {
        if name.is_empty() && self.stack.len() == 1 {
            self.fail(Status::new(Code::InvalidArgument, "cannot render a scalar at the message root"));
            return;
        }

        let Some(top) = self.stack.last_mut() else { return };
        match &mut top.body {
            FrameBody::Poisoned => {}
            FrameBody::Dynamic { builder, .. } => builder.push_value(name, scalar_to_json(&value)),
            FrameBody::List { field, .. } => {
                let field = field.clone();
                match coerce_scalar(&field, value) {
                    Ok(v) => {
                        if let Some(StackFrame { body: FrameBody::List { items, .. }, .. }) = self.stack.last_mut() {
                            items.push(v);
                        }
                    }
                    Err(status) => self.fail(status),
                }
            }
            FrameBody::Message { ty, .. } => match types::resolve_field(ty, name) {
                Some(field) => match coerce_scalar(&field, value) {
                    Ok(v) => {
                        if let Some(StackFrame { body: FrameBody::Message { msg, .. }, .. }) = self.stack.last_mut() {
                            msg.set_field(&field, v);
                        }
                    }
                    Err(status) => self.fail(status),
                },
                None => self.fail(Status::new(Code::InvalidArgument, format!("field {name} not present in the current type"))),
            },
        }
    }
}

fn is_struct_family(field: &Field) -> bool {
    matches!(field.kind(), Kind::Message(ty) if types::is_well_known_struct_family(&ty))
}

fn message_type_of(field: &Field) -> Type {
    match field.kind() {
        Kind::Message(ty) => ty,
        _ => unreachable!("is_struct_family already checked this is a message field"),
    }
}

fn scalar_to_json(value: &IncomingScalar) -> serde_json::Value {
    use serde_json::Value as J;
    match value {
        IncomingScalar::Null => J::Null,
        IncomingScalar::Bool(b) => J::Bool(*b),
        IncomingScalar::I32(v) => J::Number((*v).into()),
        IncomingScalar::U32(v) => J::Number((*v).into()),
        IncomingScalar::I64(v) => J::Number((*v).into()),
        IncomingScalar::U64(v) => J::Number((*v).into()),
        IncomingScalar::F32(v) => serde_json::Number::from_f64(*v as f64).map(J::Number).unwrap_or(J::Null),
        IncomingScalar::F64(v) => serde_json::Number::from_f64(*v).map(J::Number).unwrap_or(J::Null),
        IncomingScalar::Str(s) => J::String(s.clone()),
        IncomingScalar::Bytes(b) => J::String(base64::Engine::encode(&base64::engine::general_purpose::STANDARD, b)),
    }
}

fn coerce_scalar(field: &Field, value: IncomingScalar) -> Result<Value, Status> {
    let name = field.name();
    match (field.kind(), value) {
        (Kind::Bool, IncomingScalar::Bool(b)) => Ok(Value::Bool(b)),
        (Kind::Bool, IncomingScalar::Str(s)) => s.parse().map(Value::Bool).map_err(|_| invalid_value(name, "bool")),

        (Kind::Int32 | Kind::Sint32 | Kind::Sfixed32, s) => as_i64(s, name)?.try_into().map(Value::I32).map_err(|_| out_of_range(name, "int32")),
        (Kind::Uint32 | Kind::Fixed32, s) => as_u64(s, name)?.try_into().map(Value::U32).map_err(|_| out_of_range(name, "uint32")),
        (Kind::Int64 | Kind::Sint64 | Kind::Sfixed64, s) => Ok(Value::I64(as_i64(s, name)?)),
        (Kind::Uint64 | Kind::Fixed64, s) => Ok(Value::U64(as_u64(s, name)?)),
        (Kind::Float, s) => Ok(Value::F32(as_f64(s, name)? as f32)),
        (Kind::Double, s) => Ok(Value::F64(as_f64(s, name)?)),

        (Kind::String, IncomingScalar::Str(s)) => Ok(Value::String(s)),
        (Kind::Bytes, IncomingScalar::Bytes(b)) => Ok(Value::Bytes(b.into())),
        (Kind::Bytes, IncomingScalar::Str(s)) => decode_base64(&s).map(|b| Value::Bytes(b.into())),

        (Kind::Enum(enum_ty), IncomingScalar::Str(s)) => enum_ty
            .get_value_by_name(&s)
            .map(|v| Value::EnumNumber(v.number()))
            .ok_or_else(|| Status::new(Code::InvalidArgument, format!("unresolvable enum symbol {s} for field {name}"))),
        (Kind::Enum(_), s) => Ok(Value::EnumNumber(as_i64(s, name)?.try_into().map_err(|_| out_of_range(name, "enum"))?)),

        (Kind::Message(_), _) => Err(invalid_value(name, "message")),
        (_, IncomingScalar::Null) => Err(invalid_value(name, "non-null scalar")),
        _ => Err(invalid_value(name, "its declared kind")),
    }
}

fn as_i64(value: IncomingScalar, name: &str) -> Result<i64, Status> {
    match value {
        IncomingScalar::I32(v) => Ok(v as i64),
        IncomingScalar::U32(v) => Ok(v as i64),
        IncomingScalar::I64(v) => Ok(v),
        IncomingScalar::U64(v) => v.try_into().map_err(|_| out_of_range(name, "int64")),
        IncomingScalar::F32(v) if v.fract() == 0.0 => Ok(v as i64),
        IncomingScalar::F64(v) if v.fract() == 0.0 => Ok(v as i64),
        IncomingScalar::Str(s) => s.trim_end_matches(".0").parse().map_err(|_| invalid_value(name, "integer")),
        _ => Err(invalid_value(name, "integer")),
    }
}

fn as_u64(value: IncomingScalar, name: &str) -> Result<u64, Status> {
    match value {
        IncomingScalar::I32(v) => v.try_into().map_err(|_| out_of_range(name, "uint64")),
        IncomingScalar::U32(v) => Ok(v as u64),
        IncomingScalar::I64(v) => v.try_into().map_err(|_| out_of_range(name, "uint64")),
        IncomingScalar::U64(v) => Ok(v),
        IncomingScalar::F64(v) if v.fract() == 0.0 && v >= 0.0 => Ok(v as u64),
        IncomingScalar::Str(s) => s.trim_end_matches(".0").parse().map_err(|_| invalid_value(name, "unsigned integer")),
        _ => Err(invalid_value(name, "unsigned integer")),
    }
}

fn as_f64(value: IncomingScalar, name: &str) -> Result<f64, Status> {
    match value {
        IncomingScalar::I32(v) => Ok(v as f64),
        IncomingScalar::U32(v) => Ok(v as f64),
        IncomingScalar::I64(v) => Ok(v as f64),
        IncomingScalar::U64(v) => Ok(v as f64),
        IncomingScalar::F32(v) => Ok(v as f64),
        IncomingScalar::F64(v) => Ok(v),
        IncomingScalar::Str(s) => s.parse().map_err(|_| invalid_value(name, "float")),
        _ => Err(invalid_value(name, "float")),
    }
}

fn invalid_value(field_name: &str, type_name: &str) -> Status {
    Status::new(Code::InvalidArgument, format!("value for field {field_name} is not a valid {type_name}"))
}

fn out_of_range(field_name: &str, type_name: &str) -> Status {
    Status::new(Code::OutOfRange, format!("value for field {field_name} does not fit in {type_name}"))
}

fn check_required_fields(ty: &Type, msg: &DynamicMessage, stream: &mut FifoMessageStream) {
    for field in ty.fields() {
        if field.cardinality() == Cardinality::Required && !msg.has_field(&field) {
            stream.set_status(Status::new(Code::InvalidArgument, format!("required field {} was not set", field.name())));
        }
    }
}

/// Five-byte gRPC length-prefix: a compression flag byte then big-endian
/// `u32` length.
fn frame_message(payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(5 + payload.len());
    buf.put_u8(0);
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(payload);
    buf.freeze()
}

impl ObjectWriter for RequestMessageTranslator {
    fn start_object(&mut self, field_name: &str) -> &mut Self {
        self.enter_object_or_list(field_name, false);
        self
    }

    fn end_object(&mut self) -> &mut Self {
        self.close_current();
        self
    }

    fn start_list(&mut self, field_name: &str) -> &mut Self {
        self.enter_object_or_list(field_name, true);
        self
    }

    fn end_list(&mut self) -> &mut Self {
        self.close_current();
        self
    }

    fn render_null(&mut self, field_name: &str) -> &mut Self {
        self.render_scalar(field_name, IncomingScalar::Null);
        self
    }

    fn render_bool(&mut self, field_name: &str, value: bool) -> &mut Self {
        self.render_scalar(field_name, IncomingScalar::Bool(value));
        self
    }

    fn render_int32(&mut self, field_name: &str, value: i32) -> &mut Self {
        self.render_scalar(field_name, IncomingScalar::I32(value));
        self
    }

    fn render_uint32(&mut self, field_name: &str, value: u32) -> &mut Self {
        self.render_scalar(field_name, IncomingScalar::U32(value));
        self
    }

    fn render_int64(&mut self, field_name: &str, value: i64) -> &mut Self {
        self.render_scalar(field_name, IncomingScalar::I64(value));
        self
    }

    fn render_uint64(&mut self, field_name: &str, value: u64) -> &mut Self {
        self.render_scalar(field_name, IncomingScalar::U64(value));
        self
    }

    fn render_float(&mut self, field_name: &str, value: f32) -> &mut Self {
        self.render_scalar(field_name, IncomingScalar::F32(value));
        self
    }

    fn render_double(&mut self, field_name: &str, value: f64) -> &mut Self {
        self.render_scalar(field_name, IncomingScalar::F64(value));
        self
    }

    fn render_string(&mut self, field_name: &str, value: &str) -> &mut Self {
        self.render_scalar(field_name, IncomingScalar::Str(value.to_owned()));
        self
    }

    fn render_bytes(&mut self, field_name: &str, value: &[u8]) -> &mut Self {
        self.render_scalar(field_name, IncomingScalar::Bytes(value.to_vec()));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost_reflect::DescriptorPool;

    fn pool() -> DescriptorPool {
        DescriptorPool::decode(include_bytes!(concat!(env!("OUT_DIR"), "/fixtures_descriptor.bin")).as_ref()).unwrap()
    }

    fn ty(pool: &DescriptorPool, name: &str) -> Type {
        pool.get_message_by_name(name).unwrap_or_else(|| panic!("missing {name}"))
    }

    #[test]
    fn builds_a_flat_message_from_scalar_events() {
        let pool = pool();
        let root = ty(&pool, "tonic.transcoding.fixtures.StringPayload");
        let mut t = RequestMessageTranslator::new(root, false);
        t.start_object("").render_string("payload", "hello").end_object();
        let mut out = t.output();
        let bytes = out.next_message().expect("one message");
        let msg = DynamicMessage::decode(ty(&pool, "tonic.transcoding.fixtures.StringPayload"), bytes.as_ref()).unwrap();
        assert_eq!(msg.get_field_by_name("payload").unwrap().as_str(), Some("hello"));
    }

    #[test]
    fn nested_message_fields_round_trip() {
        let pool = pool();
        let root = ty(&pool, "tonic.transcoding.fixtures.NestedPayload");
        let mut t = RequestMessageTranslator::new(root, false);
        t.start_object("")
            .start_object("nested")
            .render_string("payload", "inner")
            .end_object()
            .render_string("payload", "outer")
            .end_object();
        let mut out = t.output();
        let bytes = out.next_message().expect("one message");
        let msg = DynamicMessage::decode(ty(&pool, "tonic.transcoding.fixtures.NestedPayload"), bytes.as_ref()).unwrap();
        assert_eq!(msg.get_field_by_name("payload").unwrap().as_str(), Some("outer"));
        let nested = msg.get_field_by_name("nested").unwrap();
        let nested = nested.as_message().unwrap();
        assert_eq!(nested.get_field_by_name("payload").unwrap().as_str(), Some("inner"));
    }

    #[test]
    fn five_byte_delimiter_is_prepended_when_requested() {
        let pool = pool();
        let root = ty(&pool, "tonic.transcoding.fixtures.StringPayload");
        let mut t = RequestMessageTranslator::new(root, true);
        t.start_object("").render_string("payload", "x").end_object();
        let mut out = t.output();
        let bytes = out.next_message().unwrap();
        assert_eq!(bytes[0], 0);
        let len = u32::from_be_bytes(bytes[1..5].try_into().unwrap());
        assert_eq!(len as usize, bytes.len() - 5);
    }

    #[test]
    fn unresolvable_field_name_sets_invalid_argument_status() {
        let pool = pool();
        let root = ty(&pool, "tonic.transcoding.fixtures.StringPayload");
        let mut t = RequestMessageTranslator::new(root, false);
        t.start_object("").render_string("nope", "x").end_object();
        let out = t.output();
        assert_eq!(out.status().code(), Code::InvalidArgument);
    }

    #[test]
    fn struct_field_round_trips_through_serde() {
        let pool = pool();
        let root = ty(&pool, "tonic.transcoding.fixtures.StructPayload");
        let mut t = RequestMessageTranslator::new(root, false);
        t.start_object("")
            .start_object("payload")
            .render_string("key", "value")
            .render_double("n", 2.0)
            .end_object()
            .end_object();
        let mut out = t.output();
        let bytes = out.next_message().expect("one message");
        let msg = DynamicMessage::decode(ty(&pool, "tonic.transcoding.fixtures.StructPayload"), bytes.as_ref()).unwrap();
        let payload = msg.get_field_by_name("payload").unwrap();
        let payload = payload.as_message().unwrap();
        assert!(payload.has_field_by_name("fields"));
    }

    #[test]
    fn repeated_scalar_field_collects_all_elements() {
        let pool = pool();
        let root = ty(&pool, "tonic.transcoding.fixtures.Int32ArrayPayload");
        let mut t = RequestMessageTranslator::new(root, false);
        t.start_object("").start_list("payload").render_int32("", 1).render_int32("", 2).render_int32("", 3).end_list().end_object();
        let mut out = t.output();
        let bytes = out.next_message().expect("one message");
        let msg = DynamicMessage::decode(ty(&pool, "tonic.transcoding.fixtures.Int32ArrayPayload"), bytes.as_ref()).unwrap();
        let list = msg.get_field_by_name("payload").unwrap();
        assert_eq!(list.as_list().unwrap().len(), 3);
    }
}
