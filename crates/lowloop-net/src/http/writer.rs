//! Outgoing message framing.
//!
//! Chunked bodies are framed as `\r\n<hex>\r\n<data>` per chunk and
//! `\r\n0\r\n\r\n` at the end; the header block's final CRLF is dropped
//! because every chunk line starts with one. When the chain is full the
//! terminator waits and joins it as soon as a fragment drains.

use lowloop_core::{LoopError, LoopResult};

use crate::socket::WriteChain;

const LAST_CHUNK: &[u8] = b"\r\n0\r\n\r\n";

#[derive(Default)]
pub struct HttpWriter {
    chain: WriteChain,
    chunked: bool,
    /// -1 when no length was declared.
    declared: i64,
    written: i64,
    head_sent: bool,
    ended: bool,
    /// Chunked terminator not yet in the chain.
    tail_pending: bool,
}

impl HttpWriter {
    pub fn new() -> Self {
        HttpWriter {
            declared: -1,
            ..Default::default()
        }
    }

    pub fn reset(&mut self) {
        self.chain.clear();
        self.chunked = false;
        self.declared = -1;
        self.written = 0;
        self.head_sent = false;
        self.ended = false;
        self.tail_pending = false;
    }

    /// Queue the header block. `chunked` frames the body; otherwise
    /// `content_length` is what [`HttpWriter::length_matches`] checks.
    pub fn write_head(&mut self, mut block: Vec<u8>, chunked: bool, content_length: Option<u64>) -> LoopResult<()> {
        if self.head_sent {
            return Err(LoopError::os(libc::EALREADY, "write"));
        }
        if chunked && block.ends_with(b"\r\n\r\n") {
            block.truncate(block.len() - 2);
        }
        self.chunked = chunked;
        self.declared = match (chunked, content_length) {
            (false, Some(n)) => n as i64,
            _ => -1,
        };
        self.head_sent = true;
        self.chain.push(block);
        Ok(())
    }

    /// Queue body bytes. `EAGAIN`, with nothing queued, when the chain has
    /// no room for the fragments this needs.
    pub fn write_body(&mut self, data: Vec<u8>) -> LoopResult<()> {
        if !self.head_sent || self.ended {
            return Err(LoopError::os(libc::EPIPE, "write"));
        }
        if data.is_empty() {
            return Ok(());
        }
        let needed = if self.chunked { 2 } else { 1 };
        if self.chain.len() + needed > WriteChain::MAX_FRAGMENTS {
            return Err(LoopError::os(libc::EAGAIN, "write"));
        }
        self.written += data.len() as i64;
        if self.chunked {
            self.chain.push(format!("\r\n{:x}\r\n", data.len()).into_bytes());
        }
        self.chain.push(data);
        Ok(())
    }

    /// End the message. Never blocks on chain room.
    pub fn end_body(&mut self) -> LoopResult<()> {
        if !self.head_sent || self.ended {
            return Err(LoopError::os(libc::EPIPE, "write"));
        }
        self.ended = true;
        self.tail_pending = self.chunked;
        self.refill();
        Ok(())
    }

    fn refill(&mut self) {
        if self.tail_pending && self.chain.push(LAST_CHUNK.to_vec()) {
            self.tail_pending = false;
        }
    }

    #[inline]
    pub fn chain(&self) -> &WriteChain {
        &self.chain
    }

    /// Account for `n` bytes on the wire.
    pub fn advance(&mut self, n: usize) {
        self.chain.advance(n);
        self.refill();
    }

    /// Drop everything queued; the connection is going away.
    pub fn discard(&mut self) {
        self.chain.clear();
        self.tail_pending = false;
    }

    #[inline]
    pub fn is_flushed(&self) -> bool {
        self.chain.is_empty() && !self.tail_pending
    }

    #[inline]
    pub fn is_ended(&self) -> bool {
        self.ended
    }

    #[inline]
    pub fn is_chunked(&self) -> bool {
        self.chunked
    }

    #[inline]
    pub fn head_sent(&self) -> bool {
        self.head_sent
    }

    /// No length declared, or exactly that many body bytes written.
    pub fn length_matches(&self) -> bool {
        self.declared < 0 || self.declared == self.written
    }
}
