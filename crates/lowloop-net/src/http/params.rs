//! Header token storage.
//!
//! Tokens (request line parts, header keys and values) are written into
//! fixed-size blocks as `[len][bytes..]` records. A token that does not fit
//! the rest of a block moves to a fresh block; a token that does not fit an
//! empty block is an error. Tokens longer than 255 bytes are truncated.

use std::collections::VecDeque;

use lowloop_core::{LoopError, LoopResult};

pub const MAX_TOKEN: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Header,
    Trailer,
}

struct Block {
    kind: BlockKind,
    data: Vec<u8>,
    /// End of the last complete record.
    used: usize,
}

pub struct ParamList {
    block_size: usize,
    blocks: VecDeque<Block>,
    /// First byte of the token being built; its length byte is at `start - 1`.
    start: usize,
    pos: usize,
    /// One past the last non-blank byte of the current token.
    non_space: usize,
}

impl ParamList {
    pub fn new(block_size: usize) -> Self {
        ParamList {
            block_size: block_size.max(4),
            blocks: VecDeque::new(),
            start: 0,
            pos: 0,
            non_space: 0,
        }
    }

    pub fn clear(&mut self) {
        self.blocks.clear();
        self.start = 0;
        self.pos = 0;
        self.non_space = 0;
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Make room for one more byte of a `kind` token, starting a new block
    /// when the current one is full or holds the other kind.
    pub fn reserve(&mut self, kind: BlockKind) -> LoopResult<()> {
        let fresh_needed = match self.blocks.back() {
            None => true,
            Some(b) => (b.kind != kind && self.token_is_empty()) || self.pos + 1 >= self.block_size,
        };
        if !fresh_needed {
            return Ok(());
        }
        let mut fresh = Block {
            kind,
            data: vec![0u8; self.block_size],
            used: 0,
        };
        let partial = match self.blocks.back() {
            Some(last) => {
                if self.start == 1 && !self.token_is_empty() {
                    return Err(LoopError::http_parser());
                }
                let partial = self.pos - self.start;
                fresh.data[1..1 + partial].copy_from_slice(&last.data[self.start..self.pos]);
                partial
            }
            None => 0,
        };
        self.non_space = 1 + (self.non_space - self.start);
        self.pos = 1 + partial;
        self.start = 1;
        self.blocks.push_back(fresh);
        Ok(())
    }

    /// Nothing written since the last finished token.
    #[inline]
    pub fn token_is_empty(&self) -> bool {
        self.pos == self.start
    }

    /// The current token, trailing blanks excluded.
    pub fn current(&self) -> &[u8] {
        match self.blocks.back() {
            Some(b) => &b.data[self.start..self.non_space],
            None => &[],
        }
    }

    /// Append one byte; call [`ParamList::reserve`] first.
    pub fn push(&mut self, c: u8, blank: bool) {
        if let Some(b) = self.blocks.back_mut() {
            b.data[self.pos] = c;
            self.pos += 1;
            if !blank {
                self.non_space = self.pos;
            }
        }
    }

    /// Close the current token, dropping trailing blanks. Call
    /// [`ParamList::reserve`] first when the token may be empty.
    pub fn finish(&mut self) {
        let Some(b) = self.blocks.back_mut() else {
            return;
        };
        let len = (self.non_space - self.start).min(MAX_TOKEN);
        b.data[self.start - 1] = len as u8;
        b.used = self.start + len;
        self.start = b.used + 1;
        self.pos = self.start;
        self.non_space = self.start;
    }

    /// Replace the current token's bytes with `bytes` (no longer than the
    /// token) and close it.
    pub fn finish_as(&mut self, bytes: &[u8]) {
        let Some(b) = self.blocks.back_mut() else {
            return;
        };
        let n = bytes.len().min(self.non_space - self.start);
        b.data[self.start..self.start + n].copy_from_slice(&bytes[..n]);
        self.non_space = self.start + n;
        self.pos = self.non_space;
        self.finish();
    }

    /// Remove the leading blocks of `kind` and return their tokens.
    pub fn drain(&mut self, kind: BlockKind) -> Vec<String> {
        let mut out = Vec::new();
        while self.blocks.front().is_some_and(|b| b.kind == kind) {
            let last = self.blocks.len() == 1;
            if let Some(b) = self.blocks.pop_front() {
                read_block(&b.data[..b.used], &mut out);
            }
            if last {
                self.clear();
            }
        }
        out
    }

    /// Every remaining token.
    pub fn drain_all(&mut self) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(b) = self.blocks.pop_front() {
            read_block(&b.data[..b.used], &mut out);
        }
        self.clear();
        out
    }
}

fn read_block(data: &[u8], out: &mut Vec<String>) {
    let mut pos = 0;
    while pos < data.len() {
        let len = data[pos] as usize;
        let end = (pos + 1 + len).min(data.len());
        out.push(String::from_utf8_lossy(&data[pos + 1..end]).into_owned());
        pos = end;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put(p: &mut ParamList, kind: BlockKind, token: &[u8]) -> LoopResult<()> {
        for &c in token {
            p.reserve(kind)?;
            p.push(c, c == b' ');
        }
        p.reserve(kind)?;
        p.finish();
        Ok(())
    }

    #[test]
    fn test_tokens_in_order() {
        let mut p = ParamList::new(64);
        put(&mut p, BlockKind::Header, b"GET").unwrap();
        put(&mut p, BlockKind::Header, b"/index.html").unwrap();
        put(&mut p, BlockKind::Header, b"host  ").unwrap();
        put(&mut p, BlockKind::Header, b"").unwrap();
        assert_eq!(p.drain(BlockKind::Header), vec!["GET", "/index.html", "host", ""]);
        assert_eq!(p.block_count(), 0);
    }

    #[test]
    fn test_token_moves_to_fresh_block() {
        let mut p = ParamList::new(16);
        put(&mut p, BlockKind::Header, b"abcdefgh").unwrap();
        put(&mut p, BlockKind::Header, b"ijklmnop").unwrap();
        assert_eq!(p.block_count(), 2);
        assert_eq!(p.drain_all(), vec!["abcdefgh", "ijklmnop"]);
    }

    #[test]
    fn test_token_longer_than_block() {
        let mut p = ParamList::new(16);
        let err = put(&mut p, BlockKind::Header, &[b'x'; 20]).unwrap_err();
        assert_eq!(err.code(), "ERR_HTTP_PARSER");
    }

    #[test]
    fn test_token_capped_at_255() {
        let mut p = ParamList::new(1024);
        put(&mut p, BlockKind::Header, &[b'a'; 300]).unwrap();
        put(&mut p, BlockKind::Header, b"next").unwrap();
        let tokens = p.drain_all();
        assert_eq!(tokens[0].len(), MAX_TOKEN);
        assert_eq!(tokens[1], "next");
    }

    #[test]
    fn test_trailers_get_their_own_block() {
        let mut p = ParamList::new(64);
        put(&mut p, BlockKind::Header, b"a").unwrap();
        put(&mut p, BlockKind::Trailer, b"b").unwrap();
        assert_eq!(p.drain(BlockKind::Header), vec!["a"]);
        assert_eq!(p.drain(BlockKind::Trailer), vec!["b"]);
    }

    #[test]
    fn test_finish_as_rewrites() {
        let mut p = ParamList::new(64);
        for &c in b"HTTP/1.1" {
            p.reserve(BlockKind::Header).unwrap();
            p.push(c, false);
        }
        p.finish_as(b"1.1");
        assert_eq!(p.drain_all(), vec!["1.1"]);
    }
}
