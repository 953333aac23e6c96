//! RequestWeaver (C5): injects URI/query variable bindings into the
//! outgoing event stream at the correct nested position while the body is
//! being streamed.
//!
//! `WeaveInfo` is an arena of nodes (`Vec<WeaveNode>`, root at index 0)
//! rather than a pointer-linked tree — per the design notes, nodes never
//! need to refer back to their parent, the runtime traversal stack
//! carries that, so index references avoid any cyclic ownership. The
//! arena is built once and reused across every element of a streaming
//! request (`RequestStreamTranslator` re-weaves it per element), so a
//! weaver never mutates it directly: per-node "has this binding/child
//! already been handled" state lives in a parallel runtime mask owned by
//! each `RequestWeaver` instance.

use prost_reflect::Kind;
use tonic::{Code, Status};
use tracing::trace;

use crate::request_info::{BindingInfo, CollisionPolicy};
use crate::status_listener::StatusListener;
use crate::types::{self, Field};
use crate::writer::ObjectWriter;

struct WeaveNode {
    bindings: Vec<(Field, String)>,
    messages: Vec<(Field, usize)>,
}

impl WeaveNode {
    fn new() -> Self {
        Self { bindings: Vec::new(), messages: Vec::new() }
    }
}

/// Per-request tree of pending bindings, built once from the binding set
/// and shared (read-only) across every weaver built from it.
pub struct WeaveInfo {
    nodes: Vec<WeaveNode>,
}

impl WeaveInfo {
    pub fn build(bindings: &[BindingInfo]) -> Self {
        let mut nodes = vec![WeaveNode::new()];

        for binding in bindings {
            let segments = binding.field_path.segments();
            let Some((leaf, ancestors)) = segments.split_last() else { continue };

            let mut current = 0usize;
            for field in ancestors {
                let existing = nodes[current]
                    .messages
                    .iter()
                    .find(|(f, _)| types::field_identity(f) == types::field_identity(field))
                    .map(|(_, idx)| *idx);
                current = match existing {
                    Some(idx) => idx,
                    None => {
                        let idx = nodes.len();
                        nodes.push(WeaveNode::new());
                        nodes[current].messages.push((field.clone(), idx));
                        idx
                    }
                };
            }

            nodes[current].bindings.push((leaf.clone(), binding.value.clone()));
        }

        Self { nodes }
    }
}

fn field_matches_name(field: &Field, name: &str) -> bool {
    field.json_name() == name || field.name().eq_ignore_ascii_case(name)
}

/// Per-node "already handled" mask, parallel to a `WeaveNode`.
#[derive(Clone)]
struct NodeRuntime {
    bindings_done: Vec<bool>,
    messages_done: Vec<bool>,
}

/// Filter sitting between the JSON adapter (or `PrefixWriter`) and the
/// message translator.
pub struct RequestWeaver<'a, W> {
    info: &'a WeaveInfo,
    inner: W,
    runtime: Vec<NodeRuntime>,
    stack: Vec<usize>,
    non_actionable_depth: u32,
    collision_policy: CollisionPolicy,
    listener: StatusListener,
}

impl<'a, W: ObjectWriter> RequestWeaver<'a, W> {
    pub fn new(info: &'a WeaveInfo, inner: W, collision_policy: CollisionPolicy) -> Self {
        let runtime = info
            .nodes
            .iter()
            .map(|n| NodeRuntime { bindings_done: vec![false; n.bindings.len()], messages_done: vec![false; n.messages.len()] })
            .collect();
        Self { info, inner, runtime, stack: Vec::new(), non_actionable_depth: 0, collision_policy, listener: StatusListener::new() }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    pub fn status(&self) -> Status {
        self.listener.status()
    }

    fn current(&self) -> Option<usize> {
        self.stack.last().copied()
    }

    fn take_message_child(&mut self, name: &str) -> Option<usize> {
        let current = self.current()?;
        let pos = self.info.nodes[current]
            .messages
            .iter()
            .enumerate()
            .find(|(i, (f, _))| !self.runtime[current].messages_done[*i] && field_matches_name(f, name))
            .map(|(i, _)| i)?;
        self.runtime[current].messages_done[pos] = true;
        Some(self.info.nodes[current].messages[pos].1)
    }

    fn has_remaining(&self, idx: usize) -> bool {
        let node = &self.info.nodes[idx];
        let runtime = &self.runtime[idx];
        runtime.bindings_done.iter().any(|done| !done)
            || node.messages.iter().enumerate().any(|(i, (_, child))| !runtime.messages_done[i] && self.has_remaining(*child))
    }

    fn flush_node(&mut self, idx: usize) {
        let bindings: Vec<(usize, Field, String)> = self.info.nodes[idx]
            .bindings
            .iter()
            .enumerate()
            .filter(|(i, _)| !self.runtime[idx].bindings_done[*i])
            .map(|(i, (f, v))| (i, f.clone(), v.clone()))
            .collect();
        for (i, field, raw) in bindings {
            trace!(field = field.json_name(), "weaver: flushing unclaimed binding");
            render_coerced(&mut self.inner, &field, &raw, &mut self.listener);
            self.runtime[idx].bindings_done[i] = true;
        }

        let messages: Vec<(usize, Field, usize)> = self.info.nodes[idx]
            .messages
            .iter()
            .enumerate()
            .filter(|(i, _)| !self.runtime[idx].messages_done[*i])
            .map(|(i, (f, c))| (i, f.clone(), *c))
            .collect();
        for (i, field, child_idx) in messages {
            if self.has_remaining(child_idx) {
                self.inner.start_object(field.json_name());
                self.flush_node(child_idx);
                self.inner.end_object();
            }
            self.runtime[idx].messages_done[i] = true;
        }
    }

    /// Renders every remaining URI binding targeting `name` (repeated
    /// fields may have more than one) ahead of the body's own value, and
    /// marks them handled. A singular mismatch records a status on the
    /// shared listener rather than returning one; every stage here stays
    /// infallible at the call site.
    fn weave_scalar_collision(&mut self, name: &str, mut compare: impl FnMut(&Field, &str) -> Result<bool, Status>) {
        let Some(current) = self.current() else { return };
        let matches: Vec<usize> = self.info.nodes[current]
            .bindings
            .iter()
            .enumerate()
            .filter(|(i, (f, _))| !self.runtime[current].bindings_done[*i] && field_matches_name(f, name))
            .map(|(i, _)| i)
            .collect();
        if matches.is_empty() {
            return;
        }

        let repeated = self.info.nodes[current].bindings[matches[0]].0.is_list();

        if repeated {
            for &i in &matches {
                let (field, raw) = self.info.nodes[current].bindings[i].clone();
                render_coerced(&mut self.inner, &field, &raw, &mut self.listener);
                self.runtime[current].bindings_done[i] = true;
            }
            return;
        }

        // Singular: exactly one entry is expected; handle the first and
        // mark the rest (should there be duplicates) handled too so they
        // don't linger into the flush.
        for &i in &matches {
            let (field, raw) = self.info.nodes[current].bindings[i].clone();
            match self.collision_policy {
                CollisionPolicy::Report => match compare(&field, &raw) {
                    Ok(true) => {}
                    Ok(false) => {
                        trace!(field = name, "weaver: binding collides with body value");
                        self.listener.set(Status::new(
                            Code::InvalidArgument,
                            format!("conflicting binding value {raw} vs body value for field {name}"),
                        ));
                    }
                    Err(status) => self.listener.set(status),
                },
                CollisionPolicy::Ignore => {}
            }
            self.runtime[current].bindings_done[i] = true;
        }
    }
}

impl<W: ObjectWriter> ObjectWriter for RequestWeaver<'_, W> {
    fn start_object(&mut self, field_name: &str) -> &mut Self {
        if self.stack.is_empty() {
            self.stack.push(0);
        } else if self.non_actionable_depth > 0 {
            self.non_actionable_depth += 1;
        } else if let Some(child) = self.take_message_child(field_name) {
            self.stack.push(child);
        } else {
            self.non_actionable_depth += 1;
        }
        self.inner.start_object(field_name);
        self
    }

    fn end_object(&mut self) -> &mut Self {
        if self.non_actionable_depth > 0 {
            self.non_actionable_depth -= 1;
        } else if let Some(idx) = self.stack.pop() {
            self.flush_node(idx);
        }
        self.inner.end_object();
        self
    }

    fn start_list(&mut self, field_name: &str) -> &mut Self {
        self.non_actionable_depth += 1;
        self.inner.start_list(field_name);
        self
    }

    fn end_list(&mut self) -> &mut Self {
        self.non_actionable_depth = self.non_actionable_depth.saturating_sub(1);
        self.inner.end_list();
        self
    }

    fn render_null(&mut self, field_name: &str) -> &mut Self {
        self.inner.render_null(field_name);
        self
    }

    fn render_bool(&mut self, field_name: &str, value: bool) -> &mut Self {
        if self.non_actionable_depth == 0 {
            self.weave_scalar_collision(field_name, |_, raw| {
                raw.parse::<bool>().map(|v| v == value).map_err(|_| convert_failure(raw, "bool"))
            });
        }
        self.inner.render_bool(field_name, value);
        self
    }

    fn render_int32(&mut self, field_name: &str, value: i32) -> &mut Self {
        if self.non_actionable_depth == 0 {
            self.weave_scalar_collision(field_name, |_, raw| {
                raw.parse::<i64>().map(|v| v == value as i64).map_err(|_| convert_failure(raw, "integer"))
            });
        }
        self.inner.render_int32(field_name, value);
        self
    }

    fn render_uint32(&mut self, field_name: &str, value: u32) -> &mut Self {
        if self.non_actionable_depth == 0 {
            self.weave_scalar_collision(field_name, |_, raw| {
                raw.parse::<u64>().map(|v| v == value as u64).map_err(|_| convert_failure(raw, "unsigned integer"))
            });
        }
        self.inner.render_uint32(field_name, value);
        self
    }

    fn render_int64(&mut self, field_name: &str, value: i64) -> &mut Self {
        if self.non_actionable_depth == 0 {
            self.weave_scalar_collision(field_name, |_, raw| {
                raw.parse::<i64>().map(|v| v == value).map_err(|_| convert_failure(raw, "integer"))
            });
        }
        self.inner.render_int64(field_name, value);
        self
    }

    fn render_uint64(&mut self, field_name: &str, value: u64) -> &mut Self {
        if self.non_actionable_depth == 0 {
            self.weave_scalar_collision(field_name, |_, raw| {
                raw.parse::<u64>().map(|v| v == value).map_err(|_| convert_failure(raw, "unsigned integer"))
            });
        }
        self.inner.render_uint64(field_name, value);
        self
    }

    fn render_float(&mut self, field_name: &str, value: f32) -> &mut Self {
        if self.non_actionable_depth == 0 {
            self.weave_scalar_collision(field_name, |_, raw| {
                raw.parse::<f64>().map(|v| almost_equal(v, value as f64)).map_err(|_| convert_failure(raw, "float"))
            });
        }
        self.inner.render_float(field_name, value);
        self
    }

    fn render_double(&mut self, field_name: &str, value: f64) -> &mut Self {
        if self.non_actionable_depth == 0 {
            self.weave_scalar_collision(field_name, |_, raw| {
                raw.parse::<f64>().map(|v| almost_equal(v, value)).map_err(|_| convert_failure(raw, "double"))
            });
        }
        self.inner.render_double(field_name, value);
        self
    }

    fn render_string(&mut self, field_name: &str, value: &str) -> &mut Self {
        if self.non_actionable_depth == 0 {
            self.weave_scalar_collision(field_name, |_, raw| Ok(raw == value));
        }
        self.inner.render_string(field_name, value);
        self
    }

    fn render_bytes(&mut self, field_name: &str, value: &[u8]) -> &mut Self {
        if self.non_actionable_depth == 0 {
            self.weave_scalar_collision(field_name, |_, raw| {
                crate::json::events::decode_base64(raw).map(|b| b == value)
            });
        }
        self.inner.render_bytes(field_name, value);
        self
    }
}

fn almost_equal(a: f64, b: f64) -> bool {
    (a - b).abs() <= f64::EPSILON * a.abs().max(b.abs()).max(1.0) * 4.0
}

fn convert_failure(raw: &str, type_name: &str) -> Status {
    Status::new(Code::InvalidArgument, format!("failed to convert binding value {raw} to {type_name}"))
}

fn render_coerced(sink: &mut impl ObjectWriter, field: &Field, raw: &str, listener: &mut StatusListener) {
    let name = field.json_name();
    let result: Result<(), Status> = (|| {
        match field.kind() {
            Kind::Bool => {
                sink.render_bool(name, raw.parse().map_err(|_| convert_failure(raw, "bool"))?);
            }
            Kind::Int32 | Kind::Sint32 | Kind::Sfixed32 => {
                sink.render_int32(name, raw.parse().map_err(|_| convert_failure(raw, "int32"))?);
            }
            Kind::Uint32 | Kind::Fixed32 => {
                sink.render_uint32(name, raw.parse().map_err(|_| convert_failure(raw, "uint32"))?);
            }
            Kind::Int64 | Kind::Sint64 | Kind::Sfixed64 => {
                sink.render_int64(name, raw.parse().map_err(|_| convert_failure(raw, "int64"))?);
            }
            Kind::Uint64 | Kind::Fixed64 => {
                sink.render_uint64(name, raw.parse().map_err(|_| convert_failure(raw, "uint64"))?);
            }
            Kind::Float => {
                sink.render_float(name, raw.parse().map_err(|_| convert_failure(raw, "float"))?);
            }
            Kind::Double => {
                sink.render_double(name, raw.parse().map_err(|_| convert_failure(raw, "double"))?);
            }
            Kind::String | Kind::Enum(_) => {
                sink.render_string(name, raw);
            }
            Kind::Bytes => {
                let bytes = crate::json::events::decode_base64(raw)?;
                sink.render_bytes(name, &bytes);
            }
            Kind::Message(_) => {
                return Err(Status::new(
                    Code::InvalidArgument,
                    format!("binding for field {name} targets a message-typed field"),
                ));
            }
        }
        Ok(())
    })();

    if let Err(status) = result {
        listener.set(status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field_path::FieldPath;
    use crate::types::TypeDatabase;
    use prost_reflect::DescriptorPool;

    fn test_pool() -> DescriptorPool {
        let bytes = include_bytes!(concat!(env!("OUT_DIR"), "/fixtures_descriptor.bin"));
        DescriptorPool::decode(bytes.as_ref()).unwrap()
    }

    fn db() -> TypeDatabase {
        TypeDatabase::new(test_pool())
    }

    #[derive(Default)]
    struct Recorder(Vec<crate::writer::Event>);

    impl ObjectWriter for Recorder {
        fn start_object(&mut self, n: &str) -> &mut Self {
            self.0.push(crate::writer::Event::StartObject(n.into()));
            self
        }
        fn end_object(&mut self) -> &mut Self {
            self.0.push(crate::writer::Event::EndObject);
            self
        }
        fn start_list(&mut self, n: &str) -> &mut Self {
            self.0.push(crate::writer::Event::StartList(n.into()));
            self
        }
        fn end_list(&mut self) -> &mut Self {
            self.0.push(crate::writer::Event::EndList);
            self
        }
        fn render_null(&mut self, n: &str) -> &mut Self {
            self.0.push(crate::writer::Event::Null(n.into()));
            self
        }
        fn render_bool(&mut self, n: &str, v: bool) -> &mut Self {
            self.0.push(crate::writer::Event::Bool(n.into(), v));
            self
        }
        fn render_int32(&mut self, n: &str, v: i32) -> &mut Self {
            self.0.push(crate::writer::Event::Int32(n.into(), v));
            self
        }
        fn render_uint32(&mut self, n: &str, v: u32) -> &mut Self {
            self.0.push(crate::writer::Event::Uint32(n.into(), v));
            self
        }
        fn render_int64(&mut self, n: &str, v: i64) -> &mut Self {
            self.0.push(crate::writer::Event::Int64(n.into(), v));
            self
        }
        fn render_uint64(&mut self, n: &str, v: u64) -> &mut Self {
            self.0.push(crate::writer::Event::Uint64(n.into(), v));
            self
        }
        fn render_float(&mut self, n: &str, v: f32) -> &mut Self {
            self.0.push(crate::writer::Event::Float(n.into(), v));
            self
        }
        fn render_double(&mut self, n: &str, v: f64) -> &mut Self {
            self.0.push(crate::writer::Event::Double(n.into(), v));
            self
        }
        fn render_string(&mut self, n: &str, v: &str) -> &mut Self {
            self.0.push(crate::writer::Event::String(n.into(), v.into()));
            self
        }
        fn render_bytes(&mut self, n: &str, v: &[u8]) -> &mut Self {
            self.0.push(crate::writer::Event::Bytes(n.into(), v.to_vec()));
            self
        }
    }

    #[test]
    fn binding_on_empty_body_synthesizes_the_path() {
        let db = db();
        let nested = db.resolve_message("tonic.transcoding.fixtures.NestedPayload").unwrap();
        let path = crate::field_path::parse_field_path(&nested, "nested.nested.payload").unwrap();
        let bindings = vec![BindingInfo::new(path, "x")];
        let info = WeaveInfo::build(&bindings);

        let mut weaver = RequestWeaver::new(&info, Recorder::default(), CollisionPolicy::Ignore);
        weaver.start_object("");
        weaver.end_object();

        assert_eq!(
            weaver.into_inner().0,
            vec![
                crate::writer::Event::StartObject("".into()),
                crate::writer::Event::StartObject("nested".into()),
                crate::writer::Event::StartObject("nested".into()),
                crate::writer::Event::String("payload".into(), "x".into()),
                crate::writer::Event::EndObject,
                crate::writer::Event::EndObject,
                crate::writer::Event::EndObject,
            ]
        );
    }

    #[test]
    fn matching_binding_is_absorbed_without_duplication() {
        let db = db();
        let ty = db.resolve_message("tonic.transcoding.fixtures.StringPayload").unwrap();
        let path = crate::field_path::parse_field_path(&ty, "payload").unwrap();
        let bindings = vec![BindingInfo::new(path, "a")];
        let info = WeaveInfo::build(&bindings);

        let mut weaver = RequestWeaver::new(&info, Recorder::default(), CollisionPolicy::Ignore);
        weaver.start_object("");
        weaver.render_string("payload", "a");
        weaver.end_object();

        assert_eq!(
            weaver.into_inner().0,
            vec![
                crate::writer::Event::StartObject("".into()),
                crate::writer::Event::String("payload".into(), "a".into()),
                crate::writer::Event::EndObject,
            ]
        );
    }

    #[test]
    fn reported_collision_sets_status() {
        let db = db();
        let ty = db.resolve_message("tonic.transcoding.fixtures.StringPayload").unwrap();
        let path = crate::field_path::parse_field_path(&ty, "payload").unwrap();
        let bindings = vec![BindingInfo::new(path, "b")];
        let info = WeaveInfo::build(&bindings);

        let mut weaver = RequestWeaver::new(&info, Recorder::default(), CollisionPolicy::Report);
        weaver.start_object("");
        weaver.render_string("payload", "a");
        weaver.end_object();

        assert_eq!(weaver.status().code(), tonic::Code::InvalidArgument);
    }
}
