//! The read-only type database the translator resolves field paths and
//! message shapes against.
//!
//! Grounded in `tonic-reflection`'s `server::parser::DescriptorParser`,
//! which builds its symbol index out of a `FileDescriptorSet`. Here the
//! index itself is `prost_reflect::DescriptorPool`, which already does the
//! name -> descriptor resolution this crate needs, so there is no separate
//! hand-rolled `Type`/`Field` struct graph: `Type` and `Field` are thin
//! aliases over the pool's own descriptor types.

use prost_reflect::{DescriptorPool, MessageDescriptor};
use tonic::{Code, Status};

/// A message type in the database. Fields, cardinality, kind and
/// nested/enum references all come from the underlying descriptor.
pub type Type = MessageDescriptor;

/// A field of a [`Type`]. Its identity is its owning message's full name
/// plus its field number (see [`field_identity`]).
pub type Field = prost_reflect::FieldDescriptor;

/// Identity of a `Field`: owning type plus field number.
pub type FieldId = (String, u32);

pub fn field_identity(field: &Field) -> FieldId {
    (field.containing_message().full_name().to_owned(), field.number())
}

/// Well-known type full names the message translator special-cases.
pub mod well_known {
    pub const STRUCT: &str = "google.protobuf.Struct";
    pub const VALUE: &str = "google.protobuf.Value";
    pub const LIST_VALUE: &str = "google.protobuf.ListValue";
}

/// Read-only dictionary from fully qualified type URL to [`Type`].
///
/// Constructed once from a service configuration's `FileDescriptorSet` and
/// shared (via internal `Arc`s inside `DescriptorPool`) across every
/// pipeline; cloning is cheap and never mutates the pool.
#[derive(Clone)]
pub struct TypeDatabase {
    pool: DescriptorPool,
}

impl TypeDatabase {
    pub fn new(pool: DescriptorPool) -> Self {
        Self { pool }
    }

    pub fn from_file_descriptor_set_bytes(bytes: &[u8]) -> Result<Self, Status> {
        let pool = DescriptorPool::decode(bytes)
            .map_err(|e| Status::new(Code::Internal, format!("invalid descriptor set: {e}")))?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &DescriptorPool {
        &self.pool
    }

    /// Resolves `type.googleapis.com/<Name>`-style URLs as well as bare
    /// fully-qualified names, mirroring a `TypeResolver` collaborator.
    pub fn resolve_message(&self, type_url: &str) -> Option<Type> {
        let name = type_url.rsplit('/').next().unwrap_or(type_url);
        self.pool.get_message_by_name(name)
    }
}

pub fn is_well_known_struct_family(ty: &Type) -> bool {
    matches!(
        ty.full_name(),
        well_known::STRUCT | well_known::VALUE | well_known::LIST_VALUE
    )
}

/// Resolves a field on `ty` by JSON name first (case-sensitive), falling
/// back to a snake_case-insensitive match on the proto name.
pub fn resolve_field(ty: &Type, name: &str) -> Option<Field> {
    if let Some(f) = ty.get_field_by_json_name(name) {
        return Some(f);
    }
    ty.fields().find(|f| f.name().eq_ignore_ascii_case(name))
}
