//! FieldPath resolver (C10): resolves a dotted path against a [`Type`] into
//! an ordered list of field descriptors.

use prost_reflect::Kind;
use tonic::{Code, Status};

use crate::types::{resolve_field, Field, Type};

/// Non-empty ordered sequence of fields; every field but the last must be
/// a singular message field.
#[derive(Clone, Debug)]
pub struct FieldPath {
    segments: Vec<Field>,
}

impl FieldPath {
    /// The empty path: `body_field_path = ""` or `"*"` (whole message).
    pub fn root() -> Self {
        Self { segments: Vec::new() }
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn segments(&self) -> &[Field] {
        &self.segments
    }

    pub fn last(&self) -> Option<&Field> {
        self.segments.last()
    }
}

/// `path := segment ("." segment)*`, `segment := [A-Za-z_][A-Za-z0-9_]*`.
/// The literal `*` is special-cased by callers as "entire body = whole
/// message" (empty `FieldPath`) before this function is ever called.
pub fn parse_field_path(ty: &Type, dotted: &str) -> Result<FieldPath, Status> {
    if dotted.is_empty() {
        return Ok(FieldPath::root());
    }

    let mut segments = Vec::new();
    let mut current = ty.clone();

    let parts: Vec<&str> = dotted.split('.').filter(|s| !s.is_empty()).collect();
    let last_index = parts.len().saturating_sub(1);

    for (i, part) in parts.iter().enumerate() {
        let field = resolve_field(&current, part).ok_or_else(|| {
            Status::new(
                Code::InvalidArgument,
                format!("field {part} not found in type {}", current.full_name()),
            )
        })?;

        if i != last_index {
            match field.kind() {
                Kind::Message(nested) => {
                    current = nested;
                }
                _ => {
                    return Err(Status::new(
                        Code::InvalidArgument,
                        format!("segment {part} is not a message field"),
                    ));
                }
            }
        }

        segments.push(field);
    }

    Ok(FieldPath { segments })
}
