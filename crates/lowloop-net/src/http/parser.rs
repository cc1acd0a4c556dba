//! HTTP/1.1 message framing as a byte-at-a-time state machine.
//!
//! ```text
//!   Line1 ─► Line2 ─► Line3 ─► HeaderKey ◄─► HeaderValue
//!                                  │
//!                 ┌────────────────┼──────────────┐
//!                 ▼                ▼              ▼
//!            ChunkHeader ◄──► Body ─────────► Done
//!                 │ (size 0)                    ▲
//!                 └──► HeaderKey (trailers) ────┘
//! ```
//!
//! The parser never blocks and never copies more than it can place: body
//! bytes go into the caller's read buffer, and when there is none (or it is
//! full) `feed` stops and reports how much it consumed so the caller can
//! keep the rest.

use lowloop_core::{LoopError, LoopResult};

use super::params::{BlockKind, ParamList};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Method (request) or version (response).
    Line1,
    /// Target or status code.
    Line2,
    /// Version (request) or reason phrase (response).
    Line3,
    HeaderKey,
    HeaderValue,
    ChunkHeader,
    Body,
    /// Message complete; the response is being written.
    Done,
    Error,
}

/// Methods whose requests carry no body unless framed explicitly.
const BODYLESS: &[&[u8]] = &[
    b"OPTIONS", b"GET", b"HEAD", b"UNLOCK", b"MKCOL", b"COPY", b"MOVE", b"DELETE", b"CONNECT",
];

const CHUNK_LINE_MAX: usize = 10;

/// Destination for body bytes.
pub struct BodyBuf {
    pub data: Vec<u8>,
    pub limit: usize,
}

impl BodyBuf {
    pub fn new(limit: usize) -> Self {
        BodyBuf {
            data: Vec::with_capacity(limit.min(64 * 1024)),
            limit,
        }
    }

    #[inline]
    pub fn room(&self) -> usize {
        self.limit.saturating_sub(self.data.len())
    }
}

/// Result of one [`HttpParser::feed`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Progress {
    pub consumed: usize,
    /// The header section completed or body bytes arrived.
    pub notify: bool,
    /// Body bytes are waiting for a read buffer.
    pub stalled: bool,
}

pub struct HttpParser {
    server: bool,
    phase: Phase,
    erase_lf: bool,
    at_trailer: bool,
    /// -1 until known.
    content_len: i64,
    data_len: i64,
    chunked: bool,
    bodyless: bool,
    key_is_length: bool,
    key_is_encoding: bool,
    chunk_line: [u8; CHUNK_LINE_MAX],
    chunk_pos: usize,
    headers_done: bool,
    params: ParamList,
}

fn upper(c: u8) -> u8 {
    c.to_ascii_uppercase()
}

fn lower(c: u8) -> u8 {
    c.to_ascii_lowercase()
}

/// `HTTP/1.1` → `1.1`.
fn short_version(token: &[u8]) -> Option<[u8; 3]> {
    let n = token.len();
    if n < 5 || token[n - 4] != b'/' || token[n - 2] != b'.' {
        return None;
    }
    Some([token[n - 3], b'.', token[n - 1]])
}

/// Leading hex digits after optional blanks; extensions are ignored.
fn parse_hex(line: &[u8]) -> Option<i64> {
    let digits: Vec<u8> = line
        .iter()
        .copied()
        .skip_while(|c| *c == b' ' || *c == b'\t')
        .take_while(|c| c.is_ascii_hexdigit())
        .collect();
    if digits.is_empty() {
        return None;
    }
    let s = std::str::from_utf8(&digits).ok()?;
    i64::from_str_radix(s, 16).ok()
}

/// Leading decimal digits after optional blanks.
fn parse_decimal(token: &[u8]) -> Option<i64> {
    let digits: Vec<u8> = token
        .iter()
        .copied()
        .skip_while(|c| *c == b' ' || *c == b'\t')
        .take_while(|c| c.is_ascii_digit())
        .collect();
    if digits.is_empty() {
        return None;
    }
    std::str::from_utf8(&digits).ok()?.parse().ok()
}

fn contains_chunked(token: &[u8]) -> bool {
    token.windows(7).any(|w| w.eq_ignore_ascii_case(b"chunked"))
}

impl HttpParser {
    pub fn new(server: bool, block_size: usize) -> Self {
        HttpParser {
            server,
            phase: Phase::Line1,
            erase_lf: false,
            at_trailer: false,
            content_len: -1,
            data_len: 0,
            chunked: false,
            bodyless: false,
            key_is_length: false,
            key_is_encoding: false,
            chunk_line: [0; CHUNK_LINE_MAX],
            chunk_pos: 0,
            headers_done: false,
            params: ParamList::new(block_size),
        }
    }

    /// Back to the first line for the next message on the connection.
    pub fn reset(&mut self) {
        self.phase = Phase::Line1;
        self.at_trailer = false;
        self.content_len = -1;
        self.data_len = 0;
        self.chunked = false;
        self.bodyless = false;
        self.key_is_length = false;
        self.key_is_encoding = false;
        self.chunk_pos = 0;
        self.headers_done = false;
        self.params.clear();
    }

    #[inline]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    #[inline]
    pub fn is_server(&self) -> bool {
        self.server
    }

    /// The header section has been parsed.
    #[inline]
    pub fn headers_done(&self) -> bool {
        self.headers_done
    }

    /// The whole message (body and trailers included) has been parsed.
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.phase == Phase::Done
    }

    #[inline]
    pub fn is_chunked(&self) -> bool {
        self.chunked
    }

    /// Declared body length, `None` when unknown (read until close).
    pub fn content_length(&self) -> Option<u64> {
        (self.content_len >= 0 && !self.chunked).then_some(self.content_len as u64)
    }

    /// Body bytes placed so far.
    #[inline]
    pub fn body_read(&self) -> u64 {
        self.data_len as u64
    }

    /// Header tokens: the three first-line parts, then key/value pairs.
    pub fn take_head(&mut self) -> Vec<String> {
        self.params.drain(BlockKind::Header)
    }

    pub fn take_trailers(&mut self) -> Vec<String> {
        self.params.drain(BlockKind::Trailer)
    }

    fn fail(&mut self) -> LoopError {
        self.phase = Phase::Error;
        LoopError::http_parser()
    }

    fn block_kind(&self) -> BlockKind {
        if self.at_trailer {
            BlockKind::Trailer
        } else {
            BlockKind::Header
        }
    }

    /// Parse as much of `data` as possible. Body bytes go to `out`; with no
    /// buffer (or a full one) parsing stops at the first body byte and
    /// `Progress::stalled` is set.
    pub fn feed(&mut self, data: &[u8], mut out: Option<&mut BodyBuf>) -> LoopResult<Progress> {
        let mut progress = Progress::default();
        if self.phase == Phase::Error {
            return Err(LoopError::http_parser());
        }
        let mut i = 0;
        while i < data.len() {
            let c = data[i];
            if self.erase_lf && c == b'\n' {
                self.erase_lf = false;
                i += 1;
                continue;
            }
            self.erase_lf = self.phase != Phase::Body && c == b'\r';
            if self.phase == Phase::Done {
                return Err(self.fail());
            }

            if self.phase == Phase::Body {
                let mut size = data.len() - i;
                if self.content_len >= 0 {
                    size = size.min((self.content_len - self.data_len) as usize);
                }
                let Some(buf) = out.as_deref_mut().filter(|b| b.room() > 0) else {
                    progress.stalled = true;
                    break;
                };
                size = size.min(buf.room());
                buf.data.extend_from_slice(&data[i..i + size]);
                i += size;
                self.data_len += size as i64;
                progress.notify = true;
                if self.content_len >= 0 && self.data_len == self.content_len {
                    if self.chunked {
                        self.phase = Phase::ChunkHeader;
                        self.chunk_pos = 0;
                    } else {
                        self.phase = Phase::Done;
                    }
                }
                continue;
            }
            i += 1;

            if self.phase == Phase::ChunkHeader {
                if c == b'\r' || c == b'\n' {
                    if self.chunk_pos > 0 {
                        let Some(n) = parse_hex(&self.chunk_line[..self.chunk_pos]) else {
                            return Err(self.fail());
                        };
                        self.chunk_pos = 0;
                        if n == 0 {
                            self.phase = Phase::HeaderKey;
                        } else {
                            self.content_len += n;
                            self.phase = Phase::Body;
                        }
                    }
                } else {
                    if self.chunk_pos == CHUNK_LINE_MAX {
                        return Err(self.fail());
                    }
                    self.chunk_line[self.chunk_pos] = c;
                    self.chunk_pos += 1;
                }
                continue;
            }

            let kind = self.block_kind();
            if self.params.reserve(kind).is_err() {
                return Err(self.fail());
            }
            let blank = c == b' ' || c == b'\t';
            let line_end = c == b'\r' || c == b'\n';
            if self.params.token_is_empty() && (blank || (line_end && self.phase == Phase::Line1)) {
                continue;
            }
            let c = if self.erase_lf { b'\n' } else { c };

            let finished = match self.phase {
                Phase::Line1 if blank => {
                    self.phase = Phase::Line2;
                    if self.server {
                        let method = self.params.current();
                        self.bodyless = BODYLESS.iter().any(|m| *m == method);
                        true
                    } else {
                        let Some(v) = short_version(self.params.current()) else {
                            return Err(self.fail());
                        };
                        self.params.finish_as(&v);
                        continue;
                    }
                }
                Phase::Line2 if blank => {
                    self.phase = Phase::Line3;
                    true
                }
                Phase::Line3 if c == b'\n' => {
                    self.phase = Phase::HeaderKey;
                    if self.server {
                        let Some(v) = short_version(self.params.current()) else {
                            return Err(self.fail());
                        };
                        self.params.finish_as(&v);
                        continue;
                    }
                    true
                }
                Phase::HeaderValue if c == b'\n' => {
                    if self.key_is_length {
                        match parse_decimal(self.params.current()) {
                            Some(n) => self.content_len = n,
                            None => return Err(self.fail()),
                        }
                    } else if self.key_is_encoding {
                        self.chunked = contains_chunked(self.params.current());
                    }
                    self.phase = Phase::HeaderKey;
                    true
                }
                Phase::HeaderKey if c == b':' => {
                    let key = self.params.current();
                    self.key_is_length = key == b"content-length";
                    self.key_is_encoding = !self.key_is_length && key == b"transfer-encoding";
                    self.phase = Phase::HeaderValue;
                    true
                }
                Phase::HeaderKey if c == b'\n' => {
                    if self.params.token_is_empty() {
                        self.end_of_headers();
                        progress.notify = true;
                    } else {
                        // a key without a value
                        self.params.finish();
                        if self.params.reserve(kind).is_err() {
                            return Err(self.fail());
                        }
                        self.params.finish();
                    }
                    continue;
                }
                _ => false,
            };

            if finished {
                self.params.finish();
            } else {
                let c = match self.phase {
                    Phase::HeaderKey => lower(c),
                    Phase::Line1 => upper(c),
                    Phase::Line3 if self.server => upper(c),
                    _ => c,
                };
                self.params.push(c, blank);
            }
        }
        progress.consumed = i;
        Ok(progress)
    }

    fn end_of_headers(&mut self) {
        if self.at_trailer {
            self.phase = Phase::Done;
            return;
        }
        self.at_trailer = true;
        self.headers_done = true;
        if self.content_len == -1 && !self.chunked && self.bodyless {
            self.content_len = 0;
        }
        if self.chunked {
            self.phase = Phase::ChunkHeader;
            self.chunk_pos = 0;
            self.content_len = 0;
        } else if self.content_len != 0 {
            self.phase = Phase::Body;
        } else {
            self.phase = Phase::Done;
        }
    }
}
