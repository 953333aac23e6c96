//! MessageStream (C8): the pull interface the surrounding proxy drains.

use std::collections::VecDeque;

use bytes::Bytes;
use tonic::Status;

use crate::status_listener::StatusListener;

/// Pull interface: `next_message`, `finished`, `status`.
///
/// `finished()` implies no further messages will ever be produced.
/// `status()` may report an error even while `next_message` has already
/// yielded some messages — the terminal status is only meaningful once
/// the stream is drained, matching a "deliver what we can, then fail"
/// policy.
pub trait MessageStream {
    fn next_message(&mut self) -> Option<Bytes>;
    fn finished(&self) -> bool;
    fn status(&self) -> Status;
}

/// A simple FIFO-backed `MessageStream`, shared by
/// `RequestMessageTranslator` (at most one message) and
/// `RequestStreamTranslator` (zero or more, in JSON element order).
pub struct FifoMessageStream {
    queue: VecDeque<Bytes>,
    producer_finished: bool,
    listener: StatusListener,
}

impl FifoMessageStream {
    pub fn new() -> Self {
        Self { queue: VecDeque::new(), producer_finished: false, listener: StatusListener::new() }
    }

    pub fn push(&mut self, message: Bytes) {
        self.queue.push_back(message);
    }

    pub fn set_status(&mut self, status: Status) {
        self.listener.set(status);
    }

    pub fn mark_producer_finished(&mut self) {
        self.producer_finished = true;
    }

    pub fn is_ok(&self) -> bool {
        self.listener.is_ok()
    }
}

impl Default for FifoMessageStream {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageStream for FifoMessageStream {
    fn next_message(&mut self) -> Option<Bytes> {
        self.queue.pop_front()
    }

    fn finished(&self) -> bool {
        self.producer_finished && self.queue.is_empty()
    }

    fn status(&self) -> Status {
        self.listener.status()
    }
}
