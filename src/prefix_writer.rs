//! PrefixWriter (C4): grafts a request body under a dotted field path.
//!
//! When `body_field_path = "a.b.c"`, a body of `{"x": 1}` must reach the
//! translator as `{"a":{"b":{"c":{"x":1}}}}`. Every downstream stage keys
//! off stack emptiness rather than the literal field name `""`, so the
//! very first event this writer forwards can be renamed from `""` to the
//! last path segment without breaking the weaver's or translator's notion
//! of "this is the root" — see `RequestWeaver::start_object`, which treats
//! an empty internal stack as the root regardless of the name it's given.

use crate::writer::ObjectWriter;

pub struct PrefixWriter<W> {
    /// `p1..pk`; empty means passthrough.
    segments: Vec<String>,
    inner: W,
    /// Whether the one-shot prefix opening has already run.
    opened: bool,
    /// Nesting depth of the *incoming* (unprefixed) stream; used to detect
    /// the matching close of the root value this writer grafted.
    incoming_depth: i64,
}

impl<W: ObjectWriter> PrefixWriter<W> {
    pub fn new(segments: Vec<String>, inner: W) -> Self {
        Self { segments, inner, opened: false, incoming_depth: 0 }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    pub fn inner(&self) -> &W {
        &self.inner
    }

    fn is_root_position(&self) -> bool {
        !self.segments.is_empty() && !self.opened && self.incoming_depth == 0
    }

    /// Opens `p1..p_{k-1}` and returns the name the current (k-th) event
    /// should be forwarded under. Call exactly once, at the first event.
    fn open_prefix(&mut self) -> &str {
        self.opened = true;
        let (head, last) = self.segments.split_at(self.segments.len() - 1);
        for seg in head {
            self.inner.start_object(seg);
        }
        &last[0]
    }

    fn close_prefix_chain(&mut self) {
        for _ in 0..self.segments.len() - 1 {
            self.inner.end_object();
        }
    }
}

impl<W: ObjectWriter> ObjectWriter for PrefixWriter<W> {
    fn start_object(&mut self, field_name: &str) -> &mut Self {
        if self.is_root_position() {
            let name = self.open_prefix().to_owned();
            self.inner.start_object(&name);
        } else {
            self.inner.start_object(field_name);
        }
        self.incoming_depth += 1;
        self
    }

    fn end_object(&mut self) -> &mut Self {
        self.inner.end_object();
        self.incoming_depth -= 1;
        if self.opened && self.incoming_depth == 0 {
            self.close_prefix_chain();
        }
        self
    }

    fn start_list(&mut self, field_name: &str) -> &mut Self {
        if self.is_root_position() {
            let name = self.open_prefix().to_owned();
            self.inner.start_list(&name);
        } else {
            self.inner.start_list(field_name);
        }
        self.incoming_depth += 1;
        self
    }

    fn end_list(&mut self) -> &mut Self {
        self.inner.end_list();
        self.incoming_depth -= 1;
        if self.opened && self.incoming_depth == 0 {
            self.close_prefix_chain();
        }
        self
    }

    fn render_null(&mut self, field_name: &str) -> &mut Self {
        if self.is_root_position() {
            let name = self.open_prefix().to_owned();
            self.inner.render_null(&name);
            self.close_prefix_chain();
        } else {
            self.inner.render_null(field_name);
        }
        self
    }

    fn render_bool(&mut self, field_name: &str, value: bool) -> &mut Self {
        if self.is_root_position() {
            let name = self.open_prefix().to_owned();
            self.inner.render_bool(&name, value);
            self.close_prefix_chain();
        } else {
            self.inner.render_bool(field_name, value);
        }
        self
    }

    fn render_int32(&mut self, field_name: &str, value: i32) -> &mut Self {
        if self.is_root_position() {
            let name = self.open_prefix().to_owned();
            self.inner.render_int32(&name, value);
            self.close_prefix_chain();
        } else {
            self.inner.render_int32(field_name, value);
        }
        self
    }

    fn render_uint32(&mut self, field_name: &str, value: u32) -> &mut Self {
        if self.is_root_position() {
            let name = self.open_prefix().to_owned();
            self.inner.render_uint32(&name, value);
            self.close_prefix_chain();
        } else {
            self.inner.render_uint32(field_name, value);
        }
        self
    }

    fn render_int64(&mut self, field_name: &str, value: i64) -> &mut Self {
        if self.is_root_position() {
            let name = self.open_prefix().to_owned();
            self.inner.render_int64(&name, value);
            self.close_prefix_chain();
        } else {
            self.inner.render_int64(field_name, value);
        }
        self
    }

    fn render_uint64(&mut self, field_name: &str, value: u64) -> &mut Self {
        if self.is_root_position() {
            let name = self.open_prefix().to_owned();
            self.inner.render_uint64(&name, value);
            self.close_prefix_chain();
        } else {
            self.inner.render_uint64(field_name, value);
        }
        self
    }

    fn render_float(&mut self, field_name: &str, value: f32) -> &mut Self {
        if self.is_root_position() {
            let name = self.open_prefix().to_owned();
            self.inner.render_float(&name, value);
            self.close_prefix_chain();
        } else {
            self.inner.render_float(field_name, value);
        }
        self
    }

    fn render_double(&mut self, field_name: &str, value: f64) -> &mut Self {
        if self.is_root_position() {
            let name = self.open_prefix().to_owned();
            self.inner.render_double(&name, value);
            self.close_prefix_chain();
        } else {
            self.inner.render_double(field_name, value);
        }
        self
    }

    fn render_string(&mut self, field_name: &str, value: &str) -> &mut Self {
        if self.is_root_position() {
            let name = self.open_prefix().to_owned();
            self.inner.render_string(&name, value);
            self.close_prefix_chain();
        } else {
            self.inner.render_string(field_name, value);
        }
        self
    }

    fn render_bytes(&mut self, field_name: &str, value: &[u8]) -> &mut Self {
        if self.is_root_position() {
            let name = self.open_prefix().to_owned();
            self.inner.render_bytes(&name, value);
            self.close_prefix_chain();
        } else {
            self.inner.render_bytes(field_name, value);
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::Event;

    #[derive(Default)]
    struct Recorder(Vec<Event>);

    impl ObjectWriter for Recorder {
        fn start_object(&mut self, field_name: &str) -> &mut Self {
            self.0.push(Event::StartObject(field_name.to_owned()));
            self
        }
        fn end_object(&mut self) -> &mut Self {
            self.0.push(Event::EndObject);
            self
        }
        fn start_list(&mut self, field_name: &str) -> &mut Self {
            self.0.push(Event::StartList(field_name.to_owned()));
            self
        }
        fn end_list(&mut self) -> &mut Self {
            self.0.push(Event::EndList);
            self
        }
        fn render_null(&mut self, field_name: &str) -> &mut Self {
            self.0.push(Event::Null(field_name.to_owned()));
            self
        }
        fn render_bool(&mut self, field_name: &str, value: bool) -> &mut Self {
            self.0.push(Event::Bool(field_name.to_owned(), value));
            self
        }
        fn render_int32(&mut self, field_name: &str, value: i32) -> &mut Self {
            self.0.push(Event::Int32(field_name.to_owned(), value));
            self
        }
        fn render_uint32(&mut self, field_name: &str, value: u32) -> &mut Self {
            self.0.push(Event::Uint32(field_name.to_owned(), value));
            self
        }
        fn render_int64(&mut self, field_name: &str, value: i64) -> &mut Self {
            self.0.push(Event::Int64(field_name.to_owned(), value));
            self
        }
        fn render_uint64(&mut self, field_name: &str, value: u64) -> &mut Self {
            self.0.push(Event::Uint64(field_name.to_owned(), value));
            self
        }
        fn render_float(&mut self, field_name: &str, value: f32) -> &mut Self {
            self.0.push(Event::Float(field_name.to_owned(), value));
            self
        }
        fn render_double(&mut self, field_name: &str, value: f64) -> &mut Self {
            self.0.push(Event::Double(field_name.to_owned(), value));
            self
        }
        fn render_string(&mut self, field_name: &str, value: &str) -> &mut Self {
            self.0.push(Event::String(field_name.to_owned(), value.to_owned()));
            self
        }
        fn render_bytes(&mut self, field_name: &str, value: &[u8]) -> &mut Self {
            self.0.push(Event::Bytes(field_name.to_owned(), value.to_vec()));
            self
        }
    }

    #[test]
    fn empty_prefix_is_passthrough() {
        let mut pw = PrefixWriter::new(vec![], Recorder::default());
        pw.start_object("").render_int32("x", 1).end_object();
        assert_eq!(
            pw.into_inner().0,
            vec![Event::StartObject("".into()), Event::Int32("x".into(), 1), Event::EndObject]
        );
    }

    #[test]
    fn grafts_object_body_under_dotted_path() {
        let mut pw = PrefixWriter::new(vec!["a".into(), "b".into(), "c".into()], Recorder::default());
        pw.start_object("").render_int32("x", 1).end_object();
        assert_eq!(
            pw.into_inner().0,
            vec![
                Event::StartObject("a".into()),
                Event::StartObject("b".into()),
                Event::StartObject("c".into()),
                Event::Int32("x".into(), 1),
                Event::EndObject,
                Event::EndObject,
                Event::EndObject,
            ]
        );
    }

    #[test]
    fn scalar_root_enters_and_leaves_atomically() {
        let mut pw = PrefixWriter::new(vec!["a".into(), "b".into()], Recorder::default());
        pw.render_string("", "v");
        assert_eq!(
            pw.into_inner().0,
            vec![Event::StartObject("a".into()), Event::String("b".into(), "v".into()), Event::EndObject]
        );
    }

    #[test]
    fn single_segment_prefix_only_renames_root() {
        let mut pw = PrefixWriter::new(vec!["a".into()], Recorder::default());
        pw.start_object("").render_int32("x", 1).end_object();
        assert_eq!(
            pw.into_inner().0,
            vec![Event::StartObject("a".into()), Event::Int32("x".into(), 1), Event::EndObject]
        );
    }
}
