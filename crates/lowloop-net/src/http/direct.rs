//! HTTP/1.1 over a direct-mode socket.
//!
//! The framer sits between a [`Socket`] and the application. Incoming bytes
//! are parsed on the multiplexer thread as they arrive; heads, body chunks
//! and write completions are handed to the application on the loop thread.
//!
//! Body bytes are only parsed into a pending read buffer. Without one the
//! framer keeps the unparsed tail of the last chunk and tells the socket to
//! stop reading; the next `read` consumes the tail and re-arms the socket.
//!
//! Lock order: framer state, then socket state. The socket never calls
//! into the framer with its own lock held.

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use lowloop_core::{kdebug, ktrace, LoopError, LoopResult, QueueLink, SlotId};
use lowloop_runtime::{EngineHandle, LoopCallback, LoopContext};

use super::head::{format_head, reason_phrase, MessageHead};
use super::parser::{BodyBuf, HttpParser};
use super::writer::HttpWriter;
use crate::socket::{Socket, SocketDirect, Trigger};

/// A parsed request (server side) or response (client side) head.
#[derive(Debug, Clone)]
pub struct HttpMessage {
    pub head: MessageHead,
    pub content_length: Option<u64>,
    pub chunked: bool,
    /// The peer allows the connection to be reused.
    pub keep_alive: bool,
}

/// One delivery of body bytes.
#[derive(Debug, Clone, Default)]
pub struct BodyChunk {
    pub data: Vec<u8>,
    /// Message complete, or the peer closed a read-until-close body.
    pub end: bool,
    pub trailers: Vec<(String, String)>,
    /// Client side, on the last chunk: whether the connection can carry
    /// another request.
    pub keep_alive: Option<bool>,
}

struct PendingBody {
    buf: BodyBuf,
    cb: SlotId,
}

struct HttpState {
    server: bool,
    socket: Weak<Socket>,
    parser: HttpParser,
    writer: HttpWriter,
    /// Unparsed tail of the last chunk and the offset into it.
    retained: Option<(Vec<u8>, usize)>,
    /// We told the socket to stop reading.
    paused: bool,
    read: Option<PendingBody>,
    on_message: Option<SlotId>,
    /// Client waiting for a response head keeps the loop alive.
    awaiting_ref: bool,
    head_delivered: bool,
    keep_alive: bool,
    closed: bool,
    read_error: Option<LoopError>,
    parse_error: Option<LoopError>,
    write_cb: Option<SlotId>,
    write_error: Option<LoopError>,
    shutdown_sent: bool,
    /// Bytes received in the current request/response cycle.
    cycle_bytes: u64,
    bytes_read: u64,
    bytes_written: u64,
    detached: bool,
}

pub struct HttpDirect {
    link: QueueLink,
    handle: EngineHandle,
    me: Weak<HttpDirect>,
    state: Mutex<HttpState>,
}

type MessageResult = LoopResult<HttpMessage>;

#[derive(Default)]
struct Actions {
    on_message: Option<SlotId>,
    message: Option<MessageResult>,
    read: Option<(SlotId, LoopResult<BodyChunk>)>,
    write: Option<(SlotId, LoopResult<()>)>,
    release_ref: bool,
    detach: bool,
    close: bool,
    shutdown: bool,
}

impl HttpDirect {
    fn new(handle: &EngineHandle, server: bool) -> Arc<HttpDirect> {
        let block = handle.config().http_param_block;
        Arc::new_cyclic(|me| HttpDirect {
            link: QueueLink::new(),
            handle: handle.clone(),
            me: me.clone(),
            state: Mutex::new(HttpState {
                server,
                socket: Weak::new(),
                parser: HttpParser::new(server, block),
                writer: HttpWriter::new(),
                retained: None,
                paused: false,
                read: None,
                on_message: None,
                awaiting_ref: false,
                head_delivered: false,
                keep_alive: true,
                closed: false,
                read_error: None,
                parse_error: None,
                write_cb: None,
                write_error: None,
                shutdown_sent: false,
                cycle_bytes: 0,
                bytes_read: 0,
                bytes_written: 0,
                detached: false,
            }),
        })
    }

    /// Parses requests, writes responses.
    pub fn server(handle: &EngineHandle) -> Arc<HttpDirect> {
        Self::new(handle, true)
    }

    /// Writes requests, parses responses.
    pub fn client(handle: &EngineHandle) -> Arc<HttpDirect> {
        Self::new(handle, false)
    }

    fn lock(&self) -> MutexGuard<'_, HttpState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn post_self(&self) {
        if let Some(me) = self.me.upgrade() {
            self.handle.post(me);
        }
    }

    fn socket(&self) -> Option<Arc<Socket>> {
        self.lock().socket.upgrade()
    }

    /// Put `socket` into direct mode with this framer as its consumer.
    pub fn attach_to(self: &Arc<Self>, socket: &Arc<Socket>) -> LoopResult<()> {
        let consumer: Arc<dyn SocketDirect> = self.clone();
        socket.set_direct(Some(consumer))
    }

    /// Handler for each parsed head (and for connection-level errors).
    pub fn on_message(
        &self,
        cx: &mut LoopContext,
        handler: impl FnMut(&mut LoopContext, MessageResult) -> LoopResult<()> + 'static,
    ) -> LoopResult<()> {
        let id = cx.retain_handler(handler)?;
        let (old, take_ref) = {
            let mut st = self.lock();
            if st.detached {
                drop(st);
                cx.release(id);
                return Err(LoopError::os(libc::EBADF, "on_message"));
            }
            let take_ref = !st.server && !st.awaiting_ref && !st.head_delivered;
            st.awaiting_ref |= take_ref;
            (st.on_message.replace(id), take_ref)
        };
        if let Some(old) = old {
            cx.release(old);
        }
        if take_ref {
            cx.run_ref_add(1);
        }
        self.post_self();
        Ok(())
    }

    /// Read up to `max` body bytes (0: the configured socket chunk).
    pub fn read(
        &self,
        cx: &mut LoopContext,
        max: usize,
        cb: impl FnOnce(&mut LoopContext, LoopResult<BodyChunk>) -> LoopResult<()> + 'static,
    ) -> LoopResult<()> {
        let max = if max == 0 { self.handle.config().socket_read_chunk } else { max };
        let resume = {
            let mut g = self.lock();
            let st = &mut *g;
            if st.detached {
                return Err(LoopError::os(libc::EBADF, "read"));
            }
            if st.read.is_some() {
                return Err(LoopError::os(libc::EAGAIN, "read"));
            }
            let mut buf = BodyBuf::new(max);
            let mut resume = false;
            if let Some((data, off)) = st.retained.take() {
                match st.parser.feed(&data[off..], Some(&mut buf)) {
                    Ok(p) => {
                        let off = off + p.consumed;
                        if off < data.len() {
                            st.retained = Some((data, off));
                        } else {
                            resume = st.paused;
                            st.paused = false;
                        }
                    }
                    Err(e) => st.parse_error = Some(e),
                }
            }
            let cb = cx.retain_callback(cb)?;
            st.read = Some(PendingBody { buf, cb });
            resume
        };
        cx.run_ref_add(1);
        self.post_self();
        if resume {
            if let Some(s) = self.socket() {
                s.trigger_direct(Trigger::Read);
            }
        }
        Ok(())
    }

    /// Queue a header block; it goes out with the first [`HttpDirect::write`].
    /// See [`HttpWriter::write_head`].
    pub fn write_head(&self, block: Vec<u8>, chunked: bool, content_length: Option<u64>) -> LoopResult<()> {
        let mut st = self.lock();
        if st.detached {
            return Err(LoopError::os(libc::EPIPE, "write"));
        }
        st.writer.write_head(block, chunked, content_length)
    }

    /// Queue body bytes, and with `end` the end of the message. `cb` runs
    /// once everything queued so far is on the wire.
    pub fn write(
        &self,
        cx: &mut LoopContext,
        data: Vec<u8>,
        end: bool,
        cb: impl FnOnce(&mut LoopContext, LoopResult<()>) -> LoopResult<()> + 'static,
    ) -> LoopResult<()> {
        {
            let mut st = self.lock();
            if st.detached {
                return Err(LoopError::os(libc::EPIPE, "write"));
            }
            if st.write_cb.is_some() {
                return Err(LoopError::os(libc::EAGAIN, "write"));
            }
            if end && st.writer.is_ended() {
                return Err(LoopError::os(libc::EPIPE, "write"));
            }
            st.writer.write_body(data)?;
            if end {
                st.writer.end_body()?;
            }
            st.write_cb = Some(cx.retain_callback(cb)?);
        }
        cx.run_ref_add(1);
        self.kick_writes();
        Ok(())
    }

    /// Whole response with a `Content-Length` header.
    pub fn respond(
        &self,
        cx: &mut LoopContext,
        status: u16,
        headers: &[(&str, String)],
        body: Vec<u8>,
        cb: impl FnOnce(&mut LoopContext, LoopResult<()>) -> LoopResult<()> + 'static,
    ) -> LoopResult<()> {
        let mut all = headers.to_vec();
        all.push(("Content-Length", body.len().to_string()));
        let line = format!("HTTP/1.1 {} {}", status, reason_phrase(status));
        self.write_head(format_head(&line, &all), false, Some(body.len() as u64))?;
        self.write(cx, body, true, cb)
    }

    /// Bytes read and written since the last call.
    pub fn take_counters(&self) -> (u64, u64) {
        let mut st = self.lock();
        let counters = (st.bytes_read, st.bytes_written);
        st.bytes_read = 0;
        st.bytes_written = 0;
        counters
    }

    /// Write from the loop thread; hand the rest to the multiplexer.
    fn kick_writes(&self) {
        if self.flush() {
            if let Some(s) = self.socket() {
                s.trigger_direct(Trigger::Write);
            }
        } else {
            self.post_self();
        }
    }

    /// Push the write chain. `true` while bytes remain and the socket
    /// would block.
    fn flush(&self) -> bool {
        let mut g = self.lock();
        let st = &mut *g;
        if st.writer.is_flushed() {
            return false;
        }
        let Some(socket) = st.socket.upgrade() else {
            st.write_error = Some(LoopError::os(libc::EPIPE, "write"));
            st.writer.discard();
            return false;
        };
        while !st.writer.is_flushed() {
            let res = {
                let slices = st.writer.chain().slices();
                socket.writev(&slices)
            };
            match res {
                Ok(0) => return true,
                Ok(n) => {
                    st.writer.advance(n);
                    st.bytes_written += n as u64;
                }
                Err(e) if e.is_would_block() => return true,
                Err(e) => {
                    kdebug!("http write failed: {}", e);
                    st.write_error = Some(e);
                    st.writer.discard();
                    return false;
                }
            }
        }
        false
    }

    /// Stop framing: the socket goes back to callback mode. Returns bytes
    /// received but not parsed.
    pub fn detach(&self, cx: &mut LoopContext) -> Vec<u8> {
        let (socket, ids, refs, rest) = {
            let mut st = self.lock();
            if st.detached {
                return Vec::new();
            }
            st.detached = true;
            let mut ids = Vec::new();
            let mut refs = 0isize;
            ids.extend(st.on_message.take());
            if let Some(r) = st.read.take() {
                ids.push(r.cb);
                refs += 1;
            }
            if let Some(cb) = st.write_cb.take() {
                ids.push(cb);
                refs += 1;
            }
            if st.awaiting_ref {
                st.awaiting_ref = false;
                refs += 1;
            }
            let rest = match st.retained.take() {
                Some((data, off)) => data[off..].to_vec(),
                None => Vec::new(),
            };
            (st.socket.upgrade(), ids, refs, rest)
        };
        for id in ids {
            cx.release(id);
        }
        if refs != 0 {
            cx.run_ref_add(-refs);
        }
        if let Some(me) = self.me.upgrade() {
            let as_cb: Arc<dyn LoopCallback> = me;
            self.handle.cancel(&as_cb);
        }
        if let Some(s) = socket {
            if let Err(e) = s.set_direct(None) {
                ktrace!("detach: {}", e);
            }
        }
        rest
    }

    /// Detach and close the connection.
    pub fn close(&self, cx: &mut LoopContext) {
        let socket = self.socket();
        self.detach(cx);
        if let Some(s) = socket {
            s.close(cx, None);
        }
    }

    /// Decide what the loop thread must do now. Runs with the lock held.
    fn collect(st: &mut HttpState) -> Actions {
        let mut act = Actions {
            on_message: st.on_message,
            ..Default::default()
        };
        let mut error = st.parse_error.take().or_else(|| st.read_error.take());

        if !st.head_delivered && error.is_none() && st.on_message.is_some() && st.parser.headers_done() {
            st.head_delivered = true;
            let head = MessageHead::from_tokens(st.parser.take_head());
            st.keep_alive = head.keep_alive(st.server);
            act.message = Some(Ok(HttpMessage {
                content_length: st.parser.content_length(),
                chunked: st.parser.is_chunked(),
                keep_alive: st.keep_alive,
                head,
            }));
            if st.awaiting_ref {
                st.awaiting_ref = false;
                act.release_ref = true;
            }
        }

        let read_ready = st.read.as_ref().is_some_and(|r| {
            error.is_some() || !r.buf.data.is_empty() || st.parser.is_complete() || st.closed
        });
        if read_ready {
            if let Some(r) = st.read.take() {
                let result = match error.take() {
                    Some(e) => Err(e),
                    None => {
                        let end = st.retained.is_none() && (st.parser.is_complete() || st.closed);
                        let trailers = if end {
                            pairs(st.parser.take_trailers())
                        } else {
                            Vec::new()
                        };
                        let keep_alive = (end && !st.server).then(|| {
                            !st.closed
                                && st.keep_alive
                                && st.parser.is_complete()
                                && st.writer.is_ended()
                                && st.writer.is_flushed()
                        });
                        act.detach = end && !st.server;
                        Ok(BodyChunk {
                            data: r.buf.data,
                            end,
                            trailers,
                            keep_alive,
                        })
                    }
                };
                act.read = Some((r.cb, result));
            }
        }

        if let Some(e) = error {
            if act.on_message.is_some() && act.message.is_none() {
                act.message = Some(Err(e));
            } else {
                kdebug!("http connection error: {}", e);
            }
            act.close = true;
        } else if st.closed && !st.head_delivered && st.read.is_none() {
            let idle = st.server && st.cycle_bytes == 0;
            if !idle && act.on_message.is_some() && act.message.is_none() {
                act.message = Some(Err(LoopError::os(libc::ECONNRESET, "read")));
            }
            act.close = true;
        }

        if let Some(cb) = st.write_cb {
            if st.writer.is_flushed() || st.write_error.is_some() {
                st.write_cb = None;
                let result = match st.write_error.take() {
                    Some(e) => {
                        act.close = true;
                        Err(e)
                    }
                    None => Ok(()),
                };
                act.write = Some((cb, result));
            }
        }

        let cycle_written = st.writer.is_ended() && st.writer.is_flushed() && st.write_cb.is_none();
        if st.server && st.head_delivered && cycle_written && !act.close {
            if !st.writer.length_matches() || !st.parser.is_complete() || !st.keep_alive || st.closed {
                act.close = true;
            } else {
                st.parser.reset();
                st.writer.reset();
                st.head_delivered = false;
                st.cycle_bytes = 0;
            }
        }
        if !st.server && cycle_written && !st.shutdown_sent && !st.writer.length_matches() {
            st.shutdown_sent = true;
            act.shutdown = true;
        }
        act
    }
}

fn pairs(tokens: Vec<String>) -> Vec<(String, String)> {
    let mut it = tokens.into_iter();
    let mut out = Vec::new();
    while let Some(key) = it.next() {
        out.push((key, it.next().unwrap_or_default()));
    }
    out
}

impl SocketDirect for HttpDirect {
    fn attach(&self, socket: Weak<Socket>) {
        self.lock().socket = socket;
    }

    fn on_data(&self, chunk: Result<Vec<u8>, LoopError>) -> bool {
        let keep = {
            let mut g = self.lock();
            let st = &mut *g;
            if st.detached {
                return false;
            }
            match chunk {
                Err(e) => {
                    st.read_error = Some(e);
                    st.closed = true;
                    false
                }
                Ok(data) if data.is_empty() => {
                    st.closed = true;
                    false
                }
                Ok(data) => {
                    st.bytes_read += data.len() as u64;
                    st.cycle_bytes += data.len() as u64;
                    let out = st.read.as_mut().map(|r| &mut r.buf);
                    match st.parser.feed(&data, out) {
                        Ok(p) => {
                            if p.consumed < data.len() {
                                st.retained = Some((data, p.consumed));
                                st.paused = true;
                            }
                            !st.paused
                        }
                        Err(e) => {
                            st.parse_error = Some(e);
                            false
                        }
                    }
                }
            }
        };
        self.post_self();
        keep
    }

    fn on_write(&self) -> bool {
        let more = self.flush();
        if !more {
            self.post_self();
        }
        more
    }
}

impl LoopCallback for HttpDirect {
    fn link(&self) -> &QueueLink {
        &self.link
    }

    fn on_loop(&self, cx: &mut LoopContext) -> LoopResult<bool> {
        let act = {
            let mut g = self.lock();
            if g.detached {
                return Ok(false);
            }
            Self::collect(&mut g)
        };
        if act.release_ref {
            cx.run_ref_add(-1);
        }
        let mut outcome = Ok(());
        if let (Some(id), Some(msg)) = (act.on_message, act.message) {
            outcome = cx.dispatch(id, msg);
        }
        if let Some((cb, res)) = act.read {
            cx.run_ref_add(-1);
            let r = cx.complete(cb, res);
            outcome = outcome.and(r);
        }
        if let Some((cb, res)) = act.write {
            cx.run_ref_add(-1);
            let r = cx.complete(cb, res);
            outcome = outcome.and(r);
        }
        if act.shutdown {
            if let Some(s) = self.socket() {
                if let Err(e) = s.shutdown() {
                    ktrace!("http shutdown: {}", e);
                }
            }
        }
        if act.close {
            self.close(cx);
        } else if act.detach {
            self.detach(cx);
        }
        outcome.map(|_| true)
    }
}
