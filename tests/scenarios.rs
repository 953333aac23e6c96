//! End-to-end scenarios wiring the full pipeline:
//! `ChunkStream -> json::events -> PrefixWriter -> RequestWeaver ->
//! RequestMessageTranslator -> MessageStream`, the way an embedding proxy
//! would assemble it. Covers the literal scenario table and the universal
//! invariants/boundary behaviors.

use bytes::Bytes;
use prost_reflect::{DescriptorPool, DynamicMessage, Value};
use tonic::{Code, Status};

use tonic_transcoding::chunk_stream::UnaryChunkStream;
use tonic_transcoding::json::JsonLexer;
use tonic_transcoding::request_info::{BindingInfo, CollisionPolicy};
use tonic_transcoding::types::Type;
use tonic_transcoding::weave::WeaveInfo;
use tonic_transcoding::{
    parse_field_path, response, MessageStream, PrefixWriter, RequestMessageTranslator,
    RequestStreamTranslator, RequestWeaver, StatusListener, TypeDatabase,
};

fn db() -> TypeDatabase {
    TypeDatabase::new(DescriptorPool::decode(include_bytes!(concat!(env!("OUT_DIR"), "/fixtures_descriptor.bin")).as_ref()).unwrap())
}

fn ty(db: &TypeDatabase, name: &str) -> Type {
    db.resolve_message(&format!("tonic.transcoding.fixtures.{name}")).unwrap_or_else(|| panic!("missing {name}"))
}

/// Runs one unary request through the full filter chain and returns every
/// produced message plus the first recorded status (`Code::Ok` if none).
fn translate_unary(
    body_json: &[u8],
    chunk_size: usize,
    target: &Type,
    prefix: Vec<String>,
    bindings: Vec<BindingInfo>,
    collision_policy: CollisionPolicy,
    output_delimiters: bool,
) -> (Vec<Bytes>, Status) {
    let weave_info = WeaveInfo::build(&bindings);
    let translator = RequestMessageTranslator::new(target.clone(), output_delimiters);
    let weaver = RequestWeaver::new(&weave_info, translator, collision_policy);
    let mut sink = PrefixWriter::new(prefix, weaver);

    let mut lexer = JsonLexer::new(UnaryChunkStream::new(Bytes::copy_from_slice(body_json), chunk_size));
    let mut listener = StatusListener::new();
    let drive_result = tonic_transcoding::json::drive(&mut lexer, &mut sink, target.clone(), &mut listener);

    let weaver = sink.into_inner();
    let weave_status = weaver.status();
    let mut stream = weaver.into_inner().output();

    let mut messages = Vec::new();
    while let Some(m) = stream.next_message() {
        messages.push(m);
    }

    let status = match drive_result {
        Err(e) => e,
        Ok(()) if listener.status().code() != Code::Ok => listener.status(),
        Ok(()) if weave_status.code() != Code::Ok => weave_status,
        Ok(()) => stream.status(),
    };

    (messages, status)
}

fn decode(target: &Type, bytes: &[u8]) -> DynamicMessage {
    response::decode_framed(target, bytes).expect("valid protobuf wire bytes")
}

#[test]
fn s1_base64_bytes_field() {
    let db = db();
    let target = ty(&db, "BytesPayload");
    let (messages, status) = translate_unary(
        br#"{"payload":"SGVsbG8gV29ybGQh"}"#,
        1024,
        &target,
        vec![],
        vec![],
        CollisionPolicy::Ignore,
        false,
    );
    assert_eq!(status.code(), Code::Ok);
    assert_eq!(messages.len(), 1);
    let decoded = decode(&target, &messages[0]);
    assert_eq!(
        decoded.get_field_by_name("payload").unwrap().as_ref(),
        &Value::Bytes(b"Hello World!".to_vec().into())
    );
}

#[test]
fn s2_repeated_int32_from_numeric_strings() {
    let db = db();
    let target = ty(&db, "Int32ArrayPayload");
    let (messages, status) = translate_unary(
        br#"{"payload":["0","0","0"]}"#,
        1024,
        &target,
        vec![],
        vec![],
        CollisionPolicy::Ignore,
        false,
    );
    assert_eq!(status.code(), Code::Ok);
    let decoded = decode(&target, &messages[0]);
    match decoded.get_field_by_name("payload").unwrap().as_ref() {
        Value::List(items) => assert_eq!(items, &vec![Value::I32(0), Value::I32(0), Value::I32(0)]),
        other => panic!("expected a list, got {other:?}"),
    }
}

#[test]
fn s3_two_level_nested_body() {
    let db = db();
    let target = ty(&db, "NestedPayload");
    let (messages, status) = translate_unary(
        br#"{"nested":{"nested":{"payload":"x"}}}"#,
        1024,
        &target,
        vec![],
        vec![],
        CollisionPolicy::Ignore,
        false,
    );
    assert_eq!(status.code(), Code::Ok);
    let decoded = decode(&target, &messages[0]);
    let inner = decoded.get_field_by_name("nested").unwrap().as_message().unwrap().clone();
    let inner2 = inner.get_field_by_name("nested").unwrap().as_message().unwrap().clone();
    assert_eq!(inner2.get_field_by_name("payload").unwrap().as_str(), Some("x"));
}

#[test]
fn s4_empty_body_with_nested_binding_matches_s3() {
    let db = db();
    let target = ty(&db, "NestedPayload");
    let path = parse_field_path(&target, "nested.nested.payload").unwrap();
    let (messages_s4, status) = translate_unary(
        b"{}",
        1024,
        &target,
        vec![],
        vec![BindingInfo::new(path, "x")],
        CollisionPolicy::Ignore,
        false,
    );
    assert_eq!(status.code(), Code::Ok);

    let (messages_s3, _) = translate_unary(
        br#"{"nested":{"nested":{"payload":"x"}}}"#,
        1024,
        &target,
        vec![],
        vec![],
        CollisionPolicy::Ignore,
        false,
    );
    assert_eq!(messages_s4, messages_s3);
}

#[test]
fn s5_streaming_array_produces_two_delimited_messages() {
    let db = db();
    let target = ty(&db, "StringPayload");
    let info = WeaveInfo::build(&[]);
    let mut stream_translator = RequestStreamTranslator::new(&info, target.clone(), true, CollisionPolicy::Ignore);

    let mut lexer = JsonLexer::new(UnaryChunkStream::new(Bytes::from_static(br#"[{"payload":"a"},{"payload":"b"}]"#), 1024));
    let mut listener = StatusListener::new();
    tonic_transcoding::json::drive(&mut lexer, &mut stream_translator, target.clone(), &mut listener).unwrap();

    let mut out = stream_translator.output();
    let first = out.next_message().unwrap();
    let second = out.next_message().unwrap();
    assert!(out.next_message().is_none());
    assert!(out.finished());

    assert_eq!(&first[..5], &[0, 0, 0, 0, 3]);
    assert_eq!(&second[..5], &[0, 0, 0, 0, 3]);

    assert_eq!(decode(&target, &first).get_field_by_name("payload").unwrap().as_str(), Some("a"));
    assert_eq!(decode(&target, &second).get_field_by_name("payload").unwrap().as_str(), Some("b"));
}

#[test]
fn s6_reported_collision_is_invalid_argument_mentioning_both_values() {
    let db = db();
    let target = ty(&db, "StringPayload");
    let path = parse_field_path(&target, "payload").unwrap();
    let (_, status) = translate_unary(
        br#"{"payload":"a"}"#,
        1024,
        &target,
        vec![],
        vec![BindingInfo::new(path, "b")],
        CollisionPolicy::Report,
        false,
    );
    assert_eq!(status.code(), Code::InvalidArgument);
    assert!(status.message().contains('a') && status.message().contains('b'));
}

#[test]
fn chunking_is_invariant_to_chunk_size() {
    let db = db();
    let target = ty(&db, "NestedPayload");
    let body = br#"{"nested":{"nested":{"payload":"x"}},"payload":"y"}"#;

    let (baseline, baseline_status) = translate_unary(body, 1024, &target, vec![], vec![], CollisionPolicy::Ignore, true);
    assert_eq!(baseline_status.code(), Code::Ok);

    for chunk_size in 1..=body.len() {
        let (messages, status) = translate_unary(body, chunk_size, &target, vec![], vec![], CollisionPolicy::Ignore, true);
        assert_eq!(status.code(), Code::Ok, "chunk_size={chunk_size}");
        assert_eq!(messages, baseline, "chunk_size={chunk_size}");
    }
}

#[test]
fn round_trip_through_the_response_converter() {
    let db = db();
    let target = ty(&db, "StringPayload");
    let (messages, status) = translate_unary(br#"{"payload":"hello"}"#, 1024, &target, vec![], vec![], CollisionPolicy::Ignore, false);
    assert_eq!(status.code(), Code::Ok);

    let decoded = decode(&target, &messages[0]);
    let json = response::to_json(&decoded);
    assert_eq!(json, serde_json::json!({"payload": "hello"}));
}

#[test]
fn binding_idempotence_matching_value_leaves_output_unchanged() {
    let db = db();
    let target = ty(&db, "StringPayload");
    let path = parse_field_path(&target, "payload").unwrap();

    let (with_binding, status_a) = translate_unary(
        br#"{"payload":"a"}"#,
        1024,
        &target,
        vec![],
        vec![BindingInfo::new(path, "a")],
        CollisionPolicy::Ignore,
        false,
    );
    let (without_binding, status_b) =
        translate_unary(br#"{"payload":"a"}"#, 1024, &target, vec![], vec![], CollisionPolicy::Ignore, false);

    assert_eq!(status_a.code(), Code::Ok);
    assert_eq!(status_b.code(), Code::Ok);
    assert_eq!(with_binding, without_binding);
}

#[test]
fn prefix_equivalence_matches_body_path_grafting() {
    let db = db();
    let target = ty(&db, "NestedPayload");

    let (direct, status_direct) = translate_unary(
        br#"{"payload":"x"}"#,
        1024,
        &target,
        vec!["nested".to_string(), "nested".to_string()],
        vec![],
        CollisionPolicy::Ignore,
        false,
    );
    let (already_nested, status_nested) = translate_unary(
        br#"{"nested":{"nested":{"payload":"x"}}}"#,
        1024,
        &target,
        vec![],
        vec![],
        CollisionPolicy::Ignore,
        false,
    );

    assert_eq!(status_direct.code(), Code::Ok);
    assert_eq!(status_nested.code(), Code::Ok);
    assert_eq!(direct, already_nested);
}

#[test]
fn framing_header_matches_payload_length() {
    let db = db();
    let target = ty(&db, "StringPayload");
    let (messages, status) = translate_unary(br#"{"payload":"abcdef"}"#, 1024, &target, vec![], vec![], CollisionPolicy::Ignore, true);
    assert_eq!(status.code(), Code::Ok);

    let message = &messages[0];
    let declared_len = u32::from_be_bytes([message[1], message[2], message[3], message[4]]) as usize;
    assert_eq!(message[0], 0);
    assert_eq!(declared_len, message.len() - 5);
}

#[test]
fn empty_object_with_required_style_binding_sets_only_that_field() {
    let db = db();
    let target = ty(&db, "StringPayload");
    let path = parse_field_path(&target, "payload").unwrap();
    let (messages, status) = translate_unary(
        b"{}",
        1024,
        &target,
        vec![],
        vec![BindingInfo::new(path, "from-binding")],
        CollisionPolicy::Ignore,
        false,
    );
    assert_eq!(status.code(), Code::Ok);
    let decoded = decode(&target, &messages[0]);
    assert_eq!(decoded.get_field_by_name("payload").unwrap().as_str(), Some("from-binding"));
}

#[test]
fn repeated_field_binding_concatenates_uri_then_body() {
    let db = db();
    let target = ty(&db, "BindingTarget");
    let path = parse_field_path(&target, "tags").unwrap();
    let (messages, status) = translate_unary(
        br#"{"tags":["body-1","body-2"]}"#,
        1024,
        &target,
        vec![],
        vec![BindingInfo::new(path.clone(), "uri-1"), BindingInfo::new(path, "uri-2")],
        CollisionPolicy::Ignore,
        false,
    );
    assert_eq!(status.code(), Code::Ok);
    let decoded = decode(&target, &messages[0]);
    match decoded.get_field_by_name("tags").unwrap().as_ref() {
        Value::List(items) => {
            let strs: Vec<&str> = items.iter().map(|v| v.as_str().unwrap()).collect();
            assert_eq!(strs, vec!["uri-1", "uri-2", "body-1", "body-2"]);
        }
        other => panic!("expected a list, got {other:?}"),
    }
}

fn struct_value(depth: usize) -> String {
    assert!(depth >= 1);
    if depth == 1 {
        r#"{"a":1}"#.to_string()
    } else {
        format!(r#"{{"a":{}}}"#, struct_value(depth - 1))
    }
}

#[test]
fn struct_nesting_of_32_layers_succeeds() {
    let db = db();
    let target = ty(&db, "StructPayload");
    let body = format!(r#"{{"payload":{}}}"#, struct_value(32));
    let (messages, status) = translate_unary(body.as_bytes(), 1024, &target, vec![], vec![], CollisionPolicy::Ignore, false);
    assert_eq!(status.code(), Code::Ok);
    assert_eq!(messages.len(), 1);
}

#[test]
fn struct_nesting_of_33_layers_is_rejected() {
    let db = db();
    let target = ty(&db, "StructPayload");
    let body = format!(r#"{{"payload":{}}}"#, struct_value(33));
    let (_, status) = translate_unary(body.as_bytes(), 1024, &target, vec![], vec![], CollisionPolicy::Ignore, false);
    assert_eq!(status.code(), Code::InvalidArgument);
}
