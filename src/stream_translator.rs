//! RequestStreamTranslator (C7): wraps the message translator to handle an
//! outer JSON array, one element at a time.
//!
//! Sits where a single [`crate::message_translator::RequestMessageTranslator`]
//! would for a unary call, but fans out: the `[` ... `]` envelope owns no
//! protobuf message of its own, so every `start_object("")` at the top
//! allocates a fresh translator (wrapped in its own [`RequestWeaver`] so
//! each element gets the same URI/query bindings rewoven into it), and the
//! matching `end_object` finalizes that element into a shared FIFO.

use tonic::{Code, Status};
use tracing::trace;

use crate::message_stream::{FifoMessageStream, MessageStream};
use crate::message_translator::RequestMessageTranslator;
use crate::request_info::CollisionPolicy;
use crate::types::Type;
use crate::weave::{RequestWeaver, WeaveInfo};
use crate::writer::ObjectWriter;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum State {
    Initial,
    BetweenElements,
    InElement,
    Done,
}

pub struct RequestStreamTranslator<'a> {
    info: &'a WeaveInfo,
    element_type: Type,
    output_delimiters: bool,
    collision_policy: CollisionPolicy,
    state: State,
    /// Nesting depth within the current element; 0 means "between
    /// elements", 1 means directly inside the element's own root object.
    depth: u32,
    current: Option<RequestWeaver<'a, RequestMessageTranslator>>,
    stream: FifoMessageStream,
}

impl<'a> RequestStreamTranslator<'a> {
    pub fn new(info: &'a WeaveInfo, element_type: Type, output_delimiters: bool, collision_policy: CollisionPolicy) -> Self {
        Self {
            info,
            element_type,
            output_delimiters,
            collision_policy,
            state: State::Initial,
            depth: 0,
            current: None,
            stream: FifoMessageStream::new(),
        }
    }

    pub fn output(self) -> FifoMessageStream {
        self.stream
    }

    fn fail(&mut self, message: impl Into<String>) {
        self.stream.set_status(Status::new(Code::Internal, message.into()));
        self.state = State::Done;
    }

    fn finalize_current(&mut self) {
        let Some(weaver) = self.current.take() else { return };
        let weave_status = weaver.status();
        let mut child_stream = weaver.into_inner().output();
        while let Some(msg) = child_stream.next_message() {
            self.stream.push(msg);
        }
        if weave_status.code() != Code::Ok {
            self.stream.set_status(weave_status);
        }
        let child_status = child_stream.status();
        if child_status.code() != Code::Ok {
            self.stream.set_status(child_status);
        }
    }
}

impl ObjectWriter for RequestStreamTranslator<'_> {
    fn start_object(&mut self, field_name: &str) -> &mut Self {
        match self.state {
            State::BetweenElements => {
                trace!("stream translator: new element, BetweenElements -> InElement");
                let translator = RequestMessageTranslator::new(self.element_type.clone(), self.output_delimiters);
                let mut weaver = RequestWeaver::new(self.info, translator, self.collision_policy);
                weaver.start_object(field_name);
                self.current = Some(weaver);
                self.state = State::InElement;
                self.depth = 1;
            }
            State::InElement => {
                if let Some(w) = &mut self.current {
                    w.start_object(field_name);
                }
                self.depth += 1;
            }
            State::Initial => self.fail("expected the outer JSON array, found an object"),
            State::Done => self.fail("event received after the stream finished"),
        }
        self
    }

    fn end_object(&mut self) -> &mut Self {
        match self.state {
            State::InElement => {
                if let Some(w) = &mut self.current {
                    w.end_object();
                }
                self.depth -= 1;
                if self.depth == 0 {
                    self.finalize_current();
                    self.state = State::BetweenElements;
                    trace!("stream translator: element finalized, InElement -> BetweenElements");
                }
            }
            State::Done => self.fail("event received after the stream finished"),
            _ => self.fail("unexpected end_object outside an element"),
        }
        self
    }

    fn start_list(&mut self, field_name: &str) -> &mut Self {
        match self.state {
            State::Initial if field_name.is_empty() => self.state = State::BetweenElements,
            State::Initial => self.fail("expected the outer JSON array"),
            State::InElement => {
                if let Some(w) = &mut self.current {
                    w.start_list(field_name);
                }
                self.depth += 1;
            }
            State::BetweenElements => self.fail("expected an object or the end of the array"),
            State::Done => self.fail("event received after the stream finished"),
        }
        self
    }

    fn end_list(&mut self) -> &mut Self {
        match self.state {
            State::InElement => {
                if let Some(w) = &mut self.current {
                    w.end_list();
                }
                self.depth -= 1;
            }
            State::BetweenElements => {
                trace!("stream translator: array closed, BetweenElements -> Done");
                self.state = State::Done;
                self.stream.mark_producer_finished();
            }
            State::Done => self.fail("event received after the stream finished"),
            State::Initial => self.fail("unexpected end of array before it started"),
        }
        self
    }

    fn render_null(&mut self, field_name: &str) -> &mut Self {
        if self.state == State::InElement {
            if let Some(w) = &mut self.current {
                w.render_null(field_name);
            }
        } else {
            self.fail("scalar event outside an element");
        }
        self
    }

    fn render_bool(&mut self, field_name: &str, value: bool) -> &mut Self {
        if self.state == State::InElement {
            if let Some(w) = &mut self.current {
                w.render_bool(field_name, value);
            }
        } else {
            self.fail("scalar event outside an element");
        }
        self
    }

    fn render_int32(&mut self, field_name: &str, value: i32) -> &mut Self {
        if self.state == State::InElement {
            if let Some(w) = &mut self.current {
                w.render_int32(field_name, value);
            }
        } else {
            self.fail("scalar event outside an element");
        }
        self
    }

    fn render_uint32(&mut self, field_name: &str, value: u32) -> &mut Self {
        if self.state == State::InElement {
            if let Some(w) = &mut self.current {
                w.render_uint32(field_name, value);
            }
        } else {
            self.fail("scalar event outside an element");
        }
        self
    }

    fn render_int64(&mut self, field_name: &str, value: i64) -> &mut Self {
        if self.state == State::InElement {
            if let Some(w) = &mut self.current {
                w.render_int64(field_name, value);
            }
        } else {
            self.fail("scalar event outside an element");
        }
        self
    }

    fn render_uint64(&mut self, field_name: &str, value: u64) -> &mut Self {
        if self.state == State::InElement {
            if let Some(w) = &mut self.current {
                w.render_uint64(field_name, value);
            }
        } else {
            self.fail("scalar event outside an element");
        }
        self
    }

    fn render_float(&mut self, field_name: &str, value: f32) -> &mut Self {
        if self.state == State::InElement {
            if let Some(w) = &mut self.current {
                w.render_float(field_name, value);
            }
        } else {
            self.fail("scalar event outside an element");
        }
        self
    }

    fn render_double(&mut self, field_name: &str, value: f64) -> &mut Self {
        if self.state == State::InElement {
            if let Some(w) = &mut self.current {
                w.render_double(field_name, value);
            }
        } else {
            self.fail("scalar event outside an element");
        }
        self
    }

    fn render_string(&mut self, field_name: &str, value: &str) -> &mut Self {
        if self.state == State::InElement {
            if let Some(w) = &mut self.current {
                w.render_string(field_name, value);
            }
        } else {
            self.fail("scalar event outside an element");
        }
        self
    }

    fn render_bytes(&mut self, field_name: &str, value: &[u8]) -> &mut Self {
        if self.state == State::InElement {
            if let Some(w) = &mut self.current {
                w.render_bytes(field_name, value);
            }
        } else {
            self.fail("scalar event outside an element");
        }
        self
    }
}
