//! Incremental byte-level JSON tokenizer.
//!
//! No off-the-shelf crate specializes in arbitrary-chunk-boundary pull
//! lexing the way this pipeline needs (resuming mid-escape-sequence,
//! mid-number, ... across an arbitrary `ChunkStream` refill), so it is
//! implemented here directly rather than wedged in behind an unfamiliar
//! crate's buffering model — see DESIGN.md.
//!
//! The state machine is deliberately modeled on
//! `tonic::codec::decode::Streaming`'s `State` enum (`ReadHeader` /
//! `ReadBody` / `Error`): a small set of named states, one byte-buffer,
//! and a loop that refills from the upstream pull source only when the
//! buffer runs dry mid-token.

use bytes::{Bytes, BytesMut};
use tonic::{Code, Status};

use crate::chunk_stream::ChunkStream;

/// One structural or scalar JSON token. Object member names are reported
/// as `Key` immediately before the token for their value; arrays have no
/// per-element naming (callers attach the enclosing field name to every
/// element), matching protobuf's repeated-field semantics.
#[derive(Clone, Debug, PartialEq)]
pub enum Token {
    StartObject,
    EndObject,
    StartArray,
    EndArray,
    Key(String),
    Str(String),
    /// Raw numeric lexeme (e.g. `"-12.5e3"`), narrowed to a target type by
    /// the caller once it knows the expected field kind.
    Num(String),
    Bool(bool),
    Null,
}

#[derive(Clone, Copy, PartialEq)]
enum Container {
    Object { expect_key: bool },
    Array,
}

pub struct JsonLexer<S> {
    source: S,
    buf: BytesMut,
    /// Read cursor into `buf`; bytes before it have been consumed.
    pos: usize,
    eof: bool,
    stack: Vec<Container>,
    pending: std::collections::VecDeque<Token>,
}

impl<S: ChunkStream> JsonLexer<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            buf: BytesMut::new(),
            pos: 0,
            eof: false,
            stack: Vec::new(),
            pending: std::collections::VecDeque::new(),
        }
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Returns the next token, or `None` at clean end of input (document
    /// fully closed). Never panics on truncated input — a premature EOF
    /// surfaces as `Status::invalid_argument` rather than a malformed
    /// partial parse.
    pub fn next_token(&mut self) -> Result<Option<Token>, Status> {
        if let Some(tok) = self.pending.pop_front() {
            return Ok(Some(tok));
        }

        self.skip_whitespace_and_structural()?;

        if self.stack.is_empty() && self.pos >= self.buf.len() && self.eof {
            return Ok(None);
        }

        let Some(byte) = self.peek_byte()? else {
            return if self.stack.is_empty() {
                Ok(None)
            } else {
                Err(truncated())
            };
        };

        let expecting_key = matches!(self.stack.last(), Some(Container::Object { expect_key: true }));

        let token = match byte {
            b'{' => {
                self.advance(1);
                self.stack.push(Container::Object { expect_key: true });
                Token::StartObject
            }
            b'}' => {
                self.advance(1);
                self.pop_container(Container::Object { expect_key: true })?;
                Token::EndObject
            }
            b'[' => {
                self.advance(1);
                self.stack.push(Container::Array);
                Token::StartArray
            }
            b']' => {
                self.advance(1);
                self.pop_container(Container::Array)?;
                Token::EndArray
            }
            b'"' => {
                let s = self.read_string()?;
                if expecting_key {
                    self.set_expect_key(false);
                    Token::Key(s)
                } else {
                    Token::Str(s)
                }
            }
            b't' => {
                self.expect_literal(b"true")?;
                Token::Bool(true)
            }
            b'f' => {
                self.expect_literal(b"false")?;
                Token::Bool(false)
            }
            b'n' => {
                self.expect_literal(b"null")?;
                Token::Null
            }
            b'-' | b'0'..=b'9' => {
                let raw = self.read_number()?;
                Token::Num(raw)
            }
            other => {
                return Err(invalid(format!("unexpected byte 0x{other:02x} in JSON input")));
            }
        };

        if matches!(
            token,
            Token::Str(_) | Token::Num(_) | Token::Bool(_) | Token::Null | Token::EndObject | Token::EndArray
        ) {
            self.after_value();
        }

        Ok(Some(token))
    }

    fn pop_container(&mut self, expected: Container) -> Result<(), Status> {
        match self.stack.pop() {
            Some(c) if std::mem::discriminant(&c) == std::mem::discriminant(&expected) => Ok(()),
            _ => Err(invalid("mismatched JSON container close".to_string())),
        }
    }

    fn set_expect_key(&mut self, expect: bool) {
        if let Some(Container::Object { expect_key }) = self.stack.last_mut() {
            *expect_key = expect;
        }
    }

    fn after_value(&mut self) {
        if let Some(Container::Object { expect_key }) = self.stack.last_mut() {
            *expect_key = true;
        }
    }

    /// Consumes whitespace and the structural `,`/`:` separators, which
    /// the token stream itself never reports (they carry no information
    /// beyond what the surrounding `Start*`/`Key`/value tokens already
    /// convey).
    fn skip_whitespace_and_structural(&mut self) -> Result<(), Status> {
        loop {
            let Some(b) = self.peek_byte()? else { return Ok(()) };
            match b {
                b' ' | b'\t' | b'\n' | b'\r' => self.advance(1),
                b',' | b':' => self.advance(1),
                _ => return Ok(()),
            }
        }
    }

    /// Ensures at least one more byte is buffered, pulling a fresh chunk
    /// from the `ChunkStream` if the current buffer is exhausted.
    /// Returns `Ok(None)` only once the upstream is truly finished.
    fn peek_byte(&mut self) -> Result<Option<u8>, Status> {
        loop {
            if self.pos < self.buf.len() {
                return Ok(Some(self.buf[self.pos]));
            }
            if self.eof {
                return Ok(None);
            }
            self.refill();
        }
    }

    fn refill(&mut self) {
        // Compact the buffer so it does not grow unboundedly across many
        // small chunks once tokens have been fully consumed.
        if self.pos > 0 {
            self.buf.split_to(self.pos.min(self.buf.len()));
            self.pos = 0;
        }
        match self.source.next() {
            Some(chunk) => self.buf.extend_from_slice(&chunk),
            None => self.eof = true,
        }
    }

    fn advance(&mut self, n: usize) {
        self.pos += n;
    }

    fn expect_literal(&mut self, literal: &'static [u8]) -> Result<(), Status> {
        for &expected in literal {
            let Some(b) = self.peek_byte()? else { return Err(truncated()) };
            if b != expected {
                return Err(invalid("invalid JSON literal".to_string()));
            }
            self.advance(1);
        }
        Ok(())
    }

    fn read_number(&mut self) -> Result<String, Status> {
        let mut out = String::new();
        loop {
            let Some(b) = self.peek_byte()? else { break };
            match b {
                b'0'..=b'9' | b'-' | b'+' | b'.' | b'e' | b'E' => {
                    out.push(b as char);
                    self.advance(1);
                }
                _ => break,
            }
        }
        if out.is_empty() {
            return Err(invalid("empty numeric literal".to_string()));
        }
        Ok(out)
    }

    fn read_string(&mut self) -> Result<String, Status> {
        // Opening quote.
        self.advance(1);
        let mut out = String::new();
        loop {
            let Some(b) = self.peek_byte()? else { return Err(truncated()) };
            match b {
                b'"' => {
                    self.advance(1);
                    return Ok(out);
                }
                b'\\' => {
                    self.advance(1);
                    let Some(escape) = self.peek_byte()? else { return Err(truncated()) };
                    self.advance(1);
                    match escape {
                        b'"' => out.push('"'),
                        b'\\' => out.push('\\'),
                        b'/' => out.push('/'),
                        b'b' => out.push('\u{0008}'),
                        b'f' => out.push('\u{000C}'),
                        b'n' => out.push('\n'),
                        b'r' => out.push('\r'),
                        b't' => out.push('\t'),
                        b'u' => {
                            let hi = self.read_hex4()?;
                            if (0xD800..=0xDBFF).contains(&hi) {
                                // High surrogate: a low surrogate must follow.
                                let Some(b'\\') = self.peek_byte()? else {
                                    return Err(invalid("unpaired UTF-16 surrogate".to_string()));
                                };
                                self.advance(1);
                                let Some(b'u') = self.peek_byte()? else {
                                    return Err(invalid("unpaired UTF-16 surrogate".to_string()));
                                };
                                self.advance(1);
                                let lo = self.read_hex4()?;
                                if !(0xDC00..=0xDFFF).contains(&lo) {
                                    return Err(invalid("invalid UTF-16 low surrogate".to_string()));
                                }
                                let c = 0x10000
                                    + ((hi as u32 - 0xD800) << 10)
                                    + (lo as u32 - 0xDC00);
                                out.push(char::from_u32(c).ok_or_else(|| {
                                    invalid("invalid surrogate pair".to_string())
                                })?);
                            } else {
                                out.push(char::from_u32(hi as u32).ok_or_else(|| {
                                    invalid("invalid \\u escape".to_string())
                                })?);
                            }
                        }
                        other => {
                            return Err(invalid(format!("invalid escape \\{}", other as char)));
                        }
                    }
                }
                _ => {
                    // Copy one raw UTF-8 byte; JSON strings are already
                    // UTF-8 and we never split a multi-byte sequence
                    // because refill() only extends the buffer, never
                    // truncates mid-codepoint.
                    let start = self.pos;
                    self.advance(1);
                    out.push_str(
                        std::str::from_utf8(&self.buf[start..self.pos])
                            .map_err(|_| invalid("invalid UTF-8 in JSON string".to_string()))?,
                    );
                }
            }
        }
    }

    fn read_hex4(&mut self) -> Result<u16, Status> {
        let mut value: u16 = 0;
        for _ in 0..4 {
            let Some(b) = self.peek_byte()? else { return Err(truncated()) };
            let digit = (b as char).to_digit(16).ok_or_else(|| invalid("invalid \\u escape".to_string()))?;
            value = value * 16 + digit as u16;
            self.advance(1);
        }
        Ok(value)
    }
}

fn invalid(message: String) -> Status {
    Status::new(Code::InvalidArgument, message)
}

fn truncated() -> Status {
    Status::new(Code::InvalidArgument, "unexpected end of JSON input")
}

/// Bridges an in-memory buffer straight into the lexer, for tests that do
/// not need chunk-boundary coverage of their own.
pub fn lex_all(source: impl Into<Bytes>, chunk_size: usize) -> Result<Vec<Token>, Status> {
    let mut lexer = JsonLexer::new(crate::chunk_stream::UnaryChunkStream::new(source.into(), chunk_size));
    let mut tokens = Vec::new();
    while let Some(tok) = lexer.next_token()? {
        tokens.push(tok);
    }
    Ok(tokens)
}
