//! Streaming JSON -> protobuf request transcoding.
//!
//! This crate implements the translator half of a REST-facade-over-gRPC
//! proxy: it turns an incrementally-arriving JSON request body into one or
//! more serialized protobuf messages, using a compiled descriptor pool and
//! per-call routing information (target message type, body field path, URI
//! variable bindings) supplied by the embedding proxy.
//!
//! The pipeline, leaves-first:
//!
//! ```text
//! ChunkStream -> json::events -> PrefixWriter -> RequestWeaver
//!             -> RequestMessageTranslator -> MessageStream
//! ```
//!
//! For an outer JSON array (`RequestInfo` describing a streaming call) the
//! terminal stage is [`stream_translator::RequestStreamTranslator`], which
//! owns one [`message_translator::RequestMessageTranslator`] per element.
//!
//! Errors are reported through [`tonic::Status`] via the
//! [`status_listener::StatusListener`] channel rather than short-circuiting
//! each call: every stage keeps accepting events after its first failure so
//! the stream can be drained cleanly (see `status_listener`).

pub mod chunk_stream;
pub mod field_path;
pub mod json;
pub mod message_stream;
pub mod message_translator;
pub mod prefix_writer;
pub mod request_info;
pub mod response;
pub mod status_listener;
pub mod stream_translator;
pub mod types;
pub mod weave;
pub mod writer;

pub use chunk_stream::{ChunkStream, StreamingChunkStream, UnaryChunkStream};
pub use field_path::{parse_field_path, FieldPath};
pub use message_stream::MessageStream;
pub use message_translator::RequestMessageTranslator;
pub use prefix_writer::PrefixWriter;
pub use request_info::{BindingInfo, RequestInfo};
pub use status_listener::StatusListener;
pub use stream_translator::RequestStreamTranslator;
pub use types::TypeDatabase;
pub use weave::RequestWeaver;
pub use writer::ObjectWriter;
