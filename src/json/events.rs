//! JSON -> events adapter (C3).
//!
//! Drives a [`JsonLexer`] to completion over one top-level JSON value
//! (an object for a single request, or the `[` ... `]` envelope for a
//! streaming request) and replays it as [`ObjectWriter`] events on a
//! generic sink. Field names on every emitted event are the raw JSON key
//! as written by the client — downstream stages (the weaver, the message
//! translator) independently resolve that name against their own current
//! `Type` (JSON-name first, falling back to a snake_case-insensitive
//! proto-name match). This adapter only resolves field names itself to
//! decide *how* to narrow a numeric literal or whether to base64-decode a
//! string; an unresolved field name is not an error here; it becomes
//! `Code::InvalidArgument` downstream once the translator fails to place
//! it.

use base64::Engine;
use prost_reflect::Kind;
use tonic::{Code, Status};

use crate::chunk_stream::ChunkStream;
use crate::json::lexer::{JsonLexer, Token};
use crate::status_listener::StatusListener;
use crate::types::{self, Type};
use crate::writer::ObjectWriter;

/// Dynamically-typed `Struct`/`Value`/`ListValue` nesting is capped at 32
/// accepted layers; the 33rd rejects with `Code::InvalidArgument`.
const MAX_STRUCT_DEPTH: usize = 32;

#[derive(Clone)]
enum Ctx {
    /// Object whose members resolve against a known message `Type`.
    Typed(Type),
    /// List whose elements are rendered using `Kind` (message types push
    /// `Typed` for each `StartObject` element; scalar kinds coerce every
    /// element directly).
    ListOf(Kind),
    /// No descriptor to consult: either inside a well-known
    /// `Struct`/`Value`/`ListValue` subtree (`counts_toward_limit = true`,
    /// the 32-layer cap applies) or past an unresolved field name
    /// (`counts_toward_limit = false` — best-effort traversal only, the
    /// translator reports the real error).
    Dynamic { counts_toward_limit: bool },
}

fn take_name(pending: &mut Option<String>) -> String {
    pending.take().unwrap_or_default()
}

fn pop(stack: &mut Vec<Ctx>, dynamic_depth: &mut usize) {
    if let Some(Ctx::Dynamic { counts_toward_limit: true }) = stack.pop() {
        *dynamic_depth = dynamic_depth.saturating_sub(1);
    }
}

fn current_field(ctx: &Ctx, name: &str) -> Option<prost_reflect::FieldDescriptor> {
    match ctx {
        Ctx::Typed(ty) => types::resolve_field(ty, name),
        _ => None,
    }
}

fn enter_object(
    stack: &[Ctx],
    name: &str,
    dynamic_depth: &mut usize,
    listener: &mut StatusListener,
) -> Result<Ctx, Status> {
    match stack.last() {
        None => {
            // Root object: caller seeds the first frame via `root_type`
            // passed to `drive`; handled by the special-cased bootstrap
            // below (see note in `drive`).
            unreachable!("root frame is seeded before the first StartObject")
        }
        Some(Ctx::ListOf(kind)) => enter_via_kind(kind, dynamic_depth, listener),
        Some(Ctx::Dynamic { counts_toward_limit }) => {
            bump_dynamic_depth(*counts_toward_limit, dynamic_depth, listener)?;
            Ok(Ctx::Dynamic { counts_toward_limit: *counts_toward_limit })
        }
        Some(ctx @ Ctx::Typed(_)) => match current_field(ctx, name) {
            Some(field) => enter_via_field(&field, dynamic_depth, listener),
            None => Ok(Ctx::Dynamic { counts_toward_limit: false }),
        },
    }
}

fn enter_array(
    stack: &[Ctx],
    name: &str,
    dynamic_depth: &mut usize,
    listener: &mut StatusListener,
) -> Result<Ctx, Status> {
    match stack.last() {
        None => unreachable!("root frame is seeded before the first StartArray"),
        Some(Ctx::ListOf(_)) => {
            // A list directly inside a list has no protobuf counterpart
            // outside well-known types; treat as dynamic best-effort.
            Ok(Ctx::Dynamic { counts_toward_limit: false })
        }
        Some(Ctx::Dynamic { counts_toward_limit }) => {
            bump_dynamic_depth(*counts_toward_limit, dynamic_depth, listener)?;
            Ok(Ctx::Dynamic { counts_toward_limit: *counts_toward_limit })
        }
        Some(ctx @ Ctx::Typed(_)) => match current_field(ctx, name) {
            Some(field) if field.is_list() => Ok(Ctx::ListOf(field.kind())),
            Some(field) if is_struct_family_message(&field) => {
                bump_dynamic_depth(true, dynamic_depth, listener)?;
                Ok(Ctx::Dynamic { counts_toward_limit: true })
            }
            Some(_) => Ok(Ctx::Dynamic { counts_toward_limit: false }),
            None => Ok(Ctx::Dynamic { counts_toward_limit: false }),
        },
    }
}

fn enter_via_kind(kind: &Kind, dynamic_depth: &mut usize, listener: &mut StatusListener) -> Result<Ctx, Status> {
    match kind {
        Kind::Message(nested) if types::is_well_known_struct_family(nested) => {
            bump_dynamic_depth(true, dynamic_depth, listener)?;
            Ok(Ctx::Dynamic { counts_toward_limit: true })
        }
        Kind::Message(nested) => Ok(Ctx::Typed(nested.clone())),
        _ => Ok(Ctx::Dynamic { counts_toward_limit: false }),
    }
}

fn enter_via_field(
    field: &prost_reflect::FieldDescriptor,
    dynamic_depth: &mut usize,
    listener: &mut StatusListener,
) -> Result<Ctx, Status> {
    if is_struct_family_message(field) {
        bump_dynamic_depth(true, dynamic_depth, listener)?;
        return Ok(Ctx::Dynamic { counts_toward_limit: true });
    }
    match field.kind() {
        Kind::Message(nested) => Ok(Ctx::Typed(nested)),
        _ => Ok(Ctx::Dynamic { counts_toward_limit: false }),
    }
}

fn is_struct_family_message(field: &prost_reflect::FieldDescriptor) -> bool {
    matches!(field.kind(), Kind::Message(nested) if types::is_well_known_struct_family(&nested))
}

fn bump_dynamic_depth(counts: bool, dynamic_depth: &mut usize, listener: &mut StatusListener) -> Result<(), Status> {
    if !counts {
        return Ok(());
    }
    *dynamic_depth += 1;
    if *dynamic_depth > MAX_STRUCT_DEPTH {
        let status = Status::new(
            Code::InvalidArgument,
            format!("Struct nesting exceeds the maximum depth of {MAX_STRUCT_DEPTH}"),
        );
        listener.set(status.clone());
        return Err(status);
    }
    Ok(())
}

enum ScalarToken {
    Bool(bool),
    Str(String),
    Num(String),
}

fn render_scalar<W: ObjectWriter>(
    stack: &[Ctx],
    name: &str,
    token: ScalarToken,
    sink: &mut W,
    listener: &mut StatusListener,
) -> Result<(), Status> {
    let kind = match stack.last() {
        Some(Ctx::ListOf(kind)) => Some(kind.clone()),
        Some(ctx @ Ctx::Typed(_)) => current_field(ctx, name).map(|f| f.kind()),
        _ => None,
    };

    match kind {
        Some(kind) => render_typed_scalar(name, &kind, token, sink, listener),
        None => render_dynamic_scalar(name, token, sink),
    }
}

/// No schema in scope: numbers become doubles (matches
/// `google.protobuf.Value.number_value`), everything else passes through
/// as its natural JSON type.
fn render_dynamic_scalar<W: ObjectWriter>(name: &str, token: ScalarToken, sink: &mut W) -> Result<(), Status> {
    match token {
        ScalarToken::Bool(b) => {
            sink.render_bool(name, b);
        }
        ScalarToken::Str(s) => {
            sink.render_string(name, &s);
        }
        ScalarToken::Num(raw) => {
            let value: f64 = raw
                .parse()
                .map_err(|_| Status::new(Code::InvalidArgument, format!("invalid numeric literal {raw}")))?;
            sink.render_double(name, value);
        }
    }
    Ok(())
}

fn render_typed_scalar<W: ObjectWriter>(
    name: &str,
    kind: &Kind,
    token: ScalarToken,
    sink: &mut W,
    listener: &mut StatusListener,
) -> Result<(), Status> {
    let result = render_typed_scalar_inner(name, kind, &token, sink);
    if let Err(status) = &result {
        listener.set(status.clone());
    }
    result
}

fn render_typed_scalar_inner<W: ObjectWriter>(
    name: &str,
    kind: &Kind,
    token: &ScalarToken,
    sink: &mut W,
) -> Result<(), Status> {
    let as_text = || -> Option<&str> {
        match token {
            ScalarToken::Str(s) => Some(s.as_str()),
            ScalarToken::Num(n) => Some(n.as_str()),
            ScalarToken::Bool(_) => None,
        }
    };

    match kind {
        Kind::Bool => match token {
            ScalarToken::Bool(b) => {
                sink.render_bool(name, *b);
            }
            ScalarToken::Str(s) if s == "true" => {
                sink.render_bool(name, true);
            }
            ScalarToken::Str(s) if s == "false" => {
                sink.render_bool(name, false);
            }
            _ => return Err(invalid_value(name, "bool")),
        },
        Kind::Int32 | Kind::Sint32 | Kind::Sfixed32 => {
            let text = as_text().ok_or_else(|| invalid_value(name, "int32"))?;
            let v: i32 = parse_int(text, name, "int32")?;
            sink.render_int32(name, v);
        }
        Kind::Uint32 | Kind::Fixed32 => {
            let text = as_text().ok_or_else(|| invalid_value(name, "uint32"))?;
            let v: u32 = parse_int(text, name, "uint32")?;
            sink.render_uint32(name, v);
        }
        Kind::Int64 | Kind::Sint64 | Kind::Sfixed64 => {
            let text = as_text().ok_or_else(|| invalid_value(name, "int64"))?;
            let v: i64 = parse_int(text, name, "int64")?;
            sink.render_int64(name, v);
        }
        Kind::Uint64 | Kind::Fixed64 => {
            let text = as_text().ok_or_else(|| invalid_value(name, "uint64"))?;
            let v: u64 = parse_int(text, name, "uint64")?;
            sink.render_uint64(name, v);
        }
        Kind::Float => {
            let text = as_text().ok_or_else(|| invalid_value(name, "float"))?;
            let v: f32 = text.parse().map_err(|_| invalid_value(name, "float"))?;
            sink.render_float(name, v);
        }
        Kind::Double => {
            let text = as_text().ok_or_else(|| invalid_value(name, "double"))?;
            let v: f64 = text.parse().map_err(|_| invalid_value(name, "double"))?;
            sink.render_double(name, v);
        }
        Kind::String => match token {
            ScalarToken::Str(s) => {
                sink.render_string(name, s);
            }
            _ => return Err(invalid_value(name, "string")),
        },
        Kind::Bytes => match token {
            ScalarToken::Str(s) => {
                let bytes = decode_base64(s).map_err(|_| invalid_value(name, "bytes (base64)"))?;
                sink.render_bytes(name, &bytes);
            }
            _ => return Err(invalid_value(name, "bytes")),
        },
        Kind::Enum(_) => match token {
            // The translator resolves the symbol or number against the
            // enum descriptor; C3 only narrows representation.
            ScalarToken::Str(s) => {
                sink.render_string(name, s);
            }
            ScalarToken::Num(raw) => {
                let v: i32 = parse_int(raw, name, "enum")?;
                sink.render_int32(name, v);
            }
            ScalarToken::Bool(_) => return Err(invalid_value(name, "enum")),
        },
        Kind::Message(_) => return Err(invalid_value(name, "message")),
    }
    Ok(())
}

fn parse_int<T: std::str::FromStr>(text: &str, field_name: &str, type_name: &str) -> Result<T, Status> {
    // Accept "1.0"-shaped textual forms for integer fields by trimming a
    // trailing ".0", matching the JSON mapping's tolerance for quoted
    // numeric/bool values.
    let trimmed = text.strip_suffix(".0").unwrap_or(text);
    trimmed.parse::<T>().map_err(|_| {
        Status::new(
            Code::OutOfRange,
            format!("value {text} for field {field_name} does not fit in {type_name}"),
        )
    })
}

fn invalid_value(field_name: &str, type_name: &str) -> Status {
    Status::new(
        Code::InvalidArgument,
        format!("value for field {field_name} is not a valid {type_name}"),
    )
}

/// Base64-decodes `s`, accepting both the standard and URL-safe alphabets
/// with optional padding.
pub fn decode_base64(s: &str) -> Result<Vec<u8>, Status> {
    let err = || Status::new(Code::InvalidArgument, "invalid base64 payload".to_string());

    base64::engine::general_purpose::STANDARD
        .decode(s)
        .or_else(|_| base64::engine::general_purpose::STANDARD_NO_PAD.decode(s))
        .or_else(|_| base64::engine::general_purpose::URL_SAFE.decode(s))
        .or_else(|_| base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(s))
        .map_err(|_| err())
}

/// Runs the adapter over `lexer`, emitting one top-level JSON value into
/// `sink`. `root_type` is the message type the body itself will be
/// interpreted against (the target message type, or the message at the
/// end of `body_field_path` when the body is grafted under a prefix) —
/// seeds the stack so the very first `StartObject`/`StartArray` resolves
/// correctly, whether the top-level value is a single object or the `[`
/// ... `]` envelope of a streaming request.
pub fn drive<S: ChunkStream, W: ObjectWriter>(
    lexer: &mut JsonLexer<S>,
    sink: &mut W,
    root_type: Type,
    listener: &mut StatusListener,
) -> Result<(), Status> {
    let Some(first) = lexer.next_token()? else {
        return Err(Status::new(Code::InvalidArgument, "empty JSON input"));
    };

    match first {
        Token::StartObject => {
            sink.start_object("");
            drive_with_seed(lexer, sink, Ctx::Typed(root_type), listener)
        }
        Token::StartArray => {
            sink.start_list("");
            drive_with_seed(lexer, sink, Ctx::ListOf(Kind::Message(root_type)), listener)
        }
        _ => Err(Status::new(
            Code::InvalidArgument,
            "expected a JSON object or array at the root",
        )),
    }
}

fn drive_with_seed<S: ChunkStream, W: ObjectWriter>(
    lexer: &mut JsonLexer<S>,
    sink: &mut W,
    seed: Ctx,
    listener: &mut StatusListener,
) -> Result<(), Status> {
    let mut stack: Vec<Ctx> = vec![seed];
    let mut dynamic_depth: usize = 0;
    let mut pending_name: Option<String> = None;

    loop {
        let Some(token) = lexer.next_token()? else { break };

        match token {
            Token::Key(name) => {
                pending_name = Some(name);
                continue;
            }
            Token::StartObject => {
                let name = take_name(&mut pending_name);
                sink.start_object(&name);
                let child_ctx = enter_object(&stack, &name, &mut dynamic_depth, listener)?;
                stack.push(child_ctx);
            }
            Token::EndObject => {
                sink.end_object();
                pop(&mut stack, &mut dynamic_depth);
            }
            Token::StartArray => {
                let name = take_name(&mut pending_name);
                sink.start_list(&name);
                let child_ctx = enter_array(&stack, &name, &mut dynamic_depth, listener)?;
                stack.push(child_ctx);
            }
            Token::EndArray => {
                sink.end_list();
                pop(&mut stack, &mut dynamic_depth);
            }
            Token::Null => {
                let name = take_name(&mut pending_name);
                sink.render_null(&name);
            }
            Token::Bool(b) => {
                let name = take_name(&mut pending_name);
                render_scalar(&stack, &name, ScalarToken::Bool(b), sink, listener)?;
            }
            Token::Str(s) => {
                let name = take_name(&mut pending_name);
                render_scalar(&stack, &name, ScalarToken::Str(s), sink, listener)?;
            }
            Token::Num(raw) => {
                let name = take_name(&mut pending_name);
                render_scalar(&stack, &name, ScalarToken::Num(raw), sink, listener)?;
            }
        }

        if stack.is_empty() {
            break;
        }
    }

    Ok(())
}
