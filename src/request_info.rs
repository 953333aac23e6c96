//! Per-call configuration consumed by the core (`RequestInfo`).
//!
//! Built once by the embedding proxy per incoming HTTP request and handed
//! to [`crate::message_translator::RequestMessageTranslator`] or
//! [`crate::stream_translator::RequestStreamTranslator`]. Construction is a
//! plain builder, the way `original_source/src/request_weaver.cc`'s
//! `RequestInfo` is assembled once per call by its proxy caller — there is
//! no persisted configuration format.

use crate::field_path::FieldPath;
use crate::types::Type;

/// `(field_path, value_string)`: a URI template variable or query
/// parameter to inject into the translated message.
///
/// The value is always a raw, unparsed string; coercion to the binding
/// field's wire type happens at weave time.
#[derive(Clone, Debug)]
pub struct BindingInfo {
    pub field_path: FieldPath,
    pub value: String,
}

impl BindingInfo {
    pub fn new(field_path: FieldPath, value: impl Into<String>) -> Self {
        Self { field_path, value: value.into() }
    }
}

/// Whether a binding/body collision is reported as an error or silently
/// resolved in favor of the body value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CollisionPolicy {
    /// Collisions are reported as `InvalidArgument`.
    Report,
    /// Collisions are silently accepted; the body value wins.
    Ignore,
}

/// Per-call routing information supplied by the surrounding proxy.
#[derive(Clone, Debug)]
pub struct RequestInfo {
    message_type: Type,
    body_field_path: FieldPath,
    variable_bindings: Vec<BindingInfo>,
    collision_policy: CollisionPolicy,
    output_delimiters: bool,
}

impl RequestInfo {
    pub fn new(message_type: Type, body_field_path: FieldPath) -> Self {
        Self {
            message_type,
            body_field_path,
            variable_bindings: Vec::new(),
            collision_policy: CollisionPolicy::Ignore,
            output_delimiters: false,
        }
    }

    pub fn with_bindings(mut self, bindings: Vec<BindingInfo>) -> Self {
        self.variable_bindings = bindings;
        self
    }

    pub fn with_collision_policy(mut self, policy: CollisionPolicy) -> Self {
        self.collision_policy = policy;
        self
    }

    pub fn with_output_delimiters(mut self, enabled: bool) -> Self {
        self.output_delimiters = enabled;
        self
    }

    pub fn message_type(&self) -> &Type {
        &self.message_type
    }

    pub fn body_field_path(&self) -> &FieldPath {
        &self.body_field_path
    }

    pub fn variable_bindings(&self) -> &[BindingInfo] {
        &self.variable_bindings
    }

    pub fn collision_policy(&self) -> CollisionPolicy {
        self.collision_policy
    }

    pub fn output_delimiters(&self) -> bool {
        self.output_delimiters
    }
}
