//! Stream sockets, optionally over TLS.
//!
//! ```text
//!   loop thread                      lowloop-mux
//!   ───────────                      ───────────
//!   read/write(cb) ─ retain cb ──►   on_readiness: do the I/O,
//!                   request interest   store the result, post self
//!   on_loop: hand results to cbs ◄── completion
//! ```
//!
//! A socket is either in callback mode (one pending read and one pending
//! write, each with a retained continuation) or in direct mode, where every
//! readiness event goes straight to a [`SocketDirect`] consumer on the
//! multiplexer thread.
//!
//! All mutable state sits behind one mutex. Direct consumers are always
//! called with that mutex released.

pub mod direct;
pub mod iochain;

pub use direct::{SocketDirect, Trigger};
pub use iochain::WriteChain;

use std::io::IoSlice;
use std::mem;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use lowloop_core::{
    kdebug, ktrace, Descriptor, DescriptorKind, Interest, LoopError, LoopResult, Pollable, QueueLink, SlotId,
};
use lowloop_runtime::{EngineHandle, LoopCallback, LoopContext};

use crate::addr;
use crate::tls::{TlsContext, TlsSession};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketPhase {
    Connecting,
    Open,
    /// Our side sent FIN (or close_notify).
    HalfClosed,
    Closed,
}

/// Addresses reported on accept and connect.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SocketInfo {
    pub local: Option<SocketAddr>,
    pub remote: Option<SocketAddr>,
}

impl SocketInfo {
    fn of(fd: RawFd) -> Self {
        SocketInfo {
            local: addr::local_addr(fd),
            remote: addr::peer_addr(fd),
        }
    }

    /// `4` or `6`, from whichever address is known.
    pub fn family(&self) -> Option<u8> {
        self.local.or(self.remote).map(|a| addr::family_number(&a))
    }
}

struct PendingConnect {
    cb: SlotId,
    result: Option<LoopResult<SocketInfo>>,
}

struct PendingRead {
    max: usize,
    cb: SlotId,
    result: Option<LoopResult<Vec<u8>>>,
}

struct PendingWrite {
    data: Vec<u8>,
    pos: usize,
    cb: SlotId,
    result: Option<LoopResult<usize>>,
}

struct SocketState {
    phase: SocketPhase,
    peer_eof: bool,
    tls: Option<TlsSession>,
    handshake_done: bool,
    /// What the handshake waits for.
    tls_interest: Interest,
    info: SocketInfo,
    connect: Option<PendingConnect>,
    read: Option<PendingRead>,
    write: Option<PendingWrite>,
    direct: Option<Arc<dyn SocketDirect>>,
    direct_read: bool,
    direct_write: bool,
    /// TLS may hold decrypted bytes the kernel no longer signals.
    direct_kick: bool,
    destroyed: bool,
}

pub struct Socket {
    d: Descriptor,
    link: QueueLink,
    handle: EngineHandle,
    me: Weak<Socket>,
    state: Mutex<SocketState>,
}

/// Plain or TLS receive. `Ok(empty)` is end of stream.
fn recv(fd: RawFd, tls: Option<&mut TlsSession>, max: usize) -> LoopResult<Vec<u8>> {
    if fd < 0 {
        return Err(LoopError::os(libc::EBADF, "read"));
    }
    let mut buf = vec![0u8; max.max(1)];
    let n = match tls {
        Some(t) => t.read(fd, &mut buf)?,
        None => {
            let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            if n < 0 {
                return Err(LoopError::last_os("read"));
            }
            n as usize
        }
    };
    buf.truncate(n);
    Ok(buf)
}

fn send(fd: RawFd, tls: Option<&mut TlsSession>, data: &[u8]) -> LoopResult<usize> {
    if fd < 0 {
        return Err(LoopError::os(libc::EBADF, "write"));
    }
    match tls {
        Some(t) => t.write(fd, data),
        None => {
            let n = unsafe {
                libc::send(fd, data.as_ptr() as *const libc::c_void, data.len(), libc::MSG_NOSIGNAL)
            };
            if n < 0 {
                return Err(LoopError::last_os("write"));
            }
            Ok(n as usize)
        }
    }
}

impl Socket {
    fn build(handle: EngineHandle, fd: RawFd, phase: SocketPhase, tls: Option<TlsSession>) -> Arc<Socket> {
        let handshake_done = tls.is_none();
        let tls_interest = if tls.is_some() { Interest::READ } else { Interest::NONE };
        Arc::new_cyclic(|me| Socket {
            d: Descriptor::with_fd(DescriptorKind::Socket, fd),
            link: QueueLink::new(),
            handle,
            me: me.clone(),
            state: Mutex::new(SocketState {
                phase,
                peer_eof: false,
                tls,
                handshake_done,
                tls_interest,
                info: SocketInfo::default(),
                connect: None,
                read: None,
                write: None,
                direct: None,
                direct_read: false,
                direct_write: false,
                direct_kick: false,
                destroyed: false,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, SocketState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn pollable(&self) -> Option<Arc<dyn Pollable>> {
        self.me.upgrade().map(|me| me as Arc<dyn Pollable>)
    }

    /// Interest the current state calls for.
    fn wanted(st: &SocketState) -> Interest {
        if st.destroyed || st.phase == SocketPhase::Closed {
            return Interest::NONE;
        }
        if st.phase == SocketPhase::Connecting {
            return Interest::WRITE;
        }
        if !st.handshake_done {
            return st.tls_interest;
        }
        // Buffered TLS records go out before anything else is polled for.
        if st.tls.as_ref().is_some_and(|t| t.wants_write()) {
            return Interest::WRITE;
        }
        let mut mask = Interest::NONE;
        if st.direct.is_some() {
            if st.direct_read && !st.peer_eof {
                mask |= Interest::READ;
            }
            if st.direct_write || st.direct_kick {
                mask |= Interest::WRITE;
            }
        } else {
            if matches!(st.read, Some(PendingRead { result: None, .. })) {
                mask |= Interest::READ;
            }
            if matches!(st.write, Some(PendingWrite { result: None, .. })) {
                mask |= Interest::WRITE;
            }
        }
        mask
    }

    fn rearm(&self, st: &SocketState) {
        if let Some(p) = self.pollable() {
            self.handle.request_interest(&p, Self::wanted(st));
        }
    }

    /// Open a connection to `addr`. `tls` is the client context and the
    /// server name to verify. `cb` runs once the connection (and handshake)
    /// completes or fails; reads and writes may be queued before that.
    pub fn connect(
        cx: &mut LoopContext,
        addr: SocketAddr,
        tls: Option<(&TlsContext, &str)>,
        cb: impl FnOnce(&mut LoopContext, LoopResult<SocketInfo>) -> LoopResult<()> + 'static,
    ) -> LoopResult<Arc<Socket>> {
        let session = match tls {
            Some((ctx, name)) => Some(ctx.client_session(name)?),
            None => None,
        };
        let fd = addr::new_socket(&addr, libc::SOCK_STREAM)?;
        let (raw, len) = addr::to_raw(&addr);
        let rc = unsafe { libc::connect(fd, &raw as *const _ as *const libc::sockaddr, len) };
        if rc < 0 {
            let err = LoopError::last_os("connect");
            if err.errno() != Some(libc::EINPROGRESS) {
                unsafe {
                    libc::close(fd);
                }
                return Err(err);
            }
        }
        let socket = Socket::build(cx.handle().clone(), fd, SocketPhase::Connecting, session);
        let p: Arc<dyn Pollable> = socket.clone();
        if let Err(e) = cx.handle().advertise(p) {
            socket.d.close_native();
            return Err(e);
        }
        let id = match cx.retain_callback(cb) {
            Ok(id) => id,
            Err(e) => {
                let p: Arc<dyn Pollable> = socket.clone();
                cx.handle().destroy(&p);
                return Err(e);
            }
        };
        cx.run_ref_add(1);
        let mut st = socket.lock();
        st.connect = Some(PendingConnect { cb: id, result: None });
        socket.rearm(&st);
        drop(st);
        kdebug!("connecting fd {} to {}", fd, addr);
        Ok(socket)
    }

    /// Wrap a freshly accepted descriptor and register it.
    pub(crate) fn accepted(handle: &EngineHandle, fd: RawFd, tls: Option<TlsSession>) -> LoopResult<Arc<Socket>> {
        let socket = Socket::build(handle.clone(), fd, SocketPhase::Open, tls);
        let p: Arc<dyn Pollable> = socket.clone();
        if let Err(e) = handle.advertise(p) {
            socket.d.close_native();
            return Err(e);
        }
        let mut st = socket.lock();
        st.info = SocketInfo::of(fd);
        socket.rearm(&st);
        drop(st);
        Ok(socket)
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.d.fd()
    }

    pub fn phase(&self) -> SocketPhase {
        self.lock().phase
    }

    pub fn info(&self) -> SocketInfo {
        self.lock().info.clone()
    }

    pub fn is_tls(&self) -> bool {
        self.lock().tls.is_some()
    }

    fn check_usable(st: &SocketState, syscall: &'static str) -> LoopResult<()> {
        if st.destroyed || st.phase == SocketPhase::Closed {
            return Err(LoopError::os(libc::EBADF, syscall));
        }
        if st.direct.is_some() {
            return Err(LoopError::os(libc::EAGAIN, syscall));
        }
        Ok(())
    }

    /// Read up to `max` bytes. An empty vector is end of stream. Only one
    /// read may be outstanding; a second one fails with `EAGAIN`.
    pub fn read(
        &self,
        cx: &mut LoopContext,
        max: usize,
        cb: impl FnOnce(&mut LoopContext, LoopResult<Vec<u8>>) -> LoopResult<()> + 'static,
    ) -> LoopResult<()> {
        let max = if max == 0 { self.handle.config().socket_read_chunk } else { max };
        let mut st = self.lock();
        Self::check_usable(&st, "read")?;
        if st.read.is_some() {
            return Err(LoopError::os(libc::EAGAIN, "read"));
        }
        if st.peer_eof {
            drop(st);
            cx.next_tick(move |cx| cb(cx, Ok(Vec::new())));
            return Ok(());
        }
        if st.tls.is_none() && st.phase != SocketPhase::Connecting {
            match recv(self.d.fd(), None, max) {
                Err(e) if e.is_would_block() => {}
                res => {
                    if matches!(&res, Ok(data) if data.is_empty()) {
                        st.peer_eof = true;
                    }
                    drop(st);
                    cx.next_tick(move |cx| cb(cx, res));
                    return Ok(());
                }
            }
        }
        let id = cx.retain_callback(cb)?;
        st.read = Some(PendingRead { max, cb: id, result: None });
        cx.run_ref_add(1);
        self.rearm(&st);
        Ok(())
    }

    /// Write all of `data`; `cb` gets the byte count. Writes queued while
    /// connecting go out once connected.
    pub fn write(
        &self,
        cx: &mut LoopContext,
        data: Vec<u8>,
        cb: impl FnOnce(&mut LoopContext, LoopResult<usize>) -> LoopResult<()> + 'static,
    ) -> LoopResult<()> {
        let mut st = self.lock();
        Self::check_usable(&st, "write")?;
        if st.write.is_some() {
            return Err(LoopError::os(libc::EAGAIN, "write"));
        }
        if st.phase == SocketPhase::HalfClosed {
            return Err(LoopError::os(libc::EPIPE, "write"));
        }
        let mut pos = 0;
        if st.tls.is_none() && st.phase == SocketPhase::Open {
            let fd = self.d.fd();
            while pos < data.len() {
                match send(fd, None, &data[pos..]) {
                    Ok(n) => pos += n,
                    Err(e) if e.is_would_block() => break,
                    Err(e) => {
                        drop(st);
                        cx.next_tick(move |cx| cb(cx, Err(e)));
                        return Ok(());
                    }
                }
            }
            if pos == data.len() {
                drop(st);
                cx.next_tick(move |cx| cb(cx, Ok(pos)));
                return Ok(());
            }
        }
        let id = cx.retain_callback(cb)?;
        st.write = Some(PendingWrite { data, pos, cb: id, result: None });
        cx.run_ref_add(1);
        self.rearm(&st);
        Ok(())
    }

    /// Scatter-gather write for direct consumers. TLS sessions take one
    /// fragment per call.
    pub fn writev(&self, slices: &[IoSlice<'_>]) -> LoopResult<usize> {
        let mut st = self.lock();
        if st.destroyed || st.phase == SocketPhase::Closed {
            return Err(LoopError::os(libc::EBADF, "writev"));
        }
        let fd = self.d.fd();
        if let Some(t) = st.tls.as_mut() {
            let Some(first) = slices.first() else {
                return Ok(0);
            };
            let n = send(fd, Some(t), first)?;
            if t.wants_write() {
                let guard = &*st;
                self.rearm(guard);
            }
            return Ok(n);
        }
        drop(st);
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_iov = slices.as_ptr() as *mut libc::iovec;
        msg.msg_iovlen = slices.len() as _;
        let n = unsafe { libc::sendmsg(fd, &msg, libc::MSG_NOSIGNAL) };
        if n < 0 {
            return Err(LoopError::last_os("writev"));
        }
        Ok(n as usize)
    }

    /// Attach (or with `None`, detach) a direct consumer. Fails with
    /// `EBUSY` while a callback-mode read or write is outstanding.
    pub fn set_direct(&self, consumer: Option<Arc<dyn SocketDirect>>) -> LoopResult<()> {
        let mut st = self.lock();
        if st.destroyed {
            return Err(LoopError::os(libc::EBADF, "set_direct"));
        }
        if st.read.is_some() || st.write.is_some() {
            return Err(LoopError::os(libc::EBUSY, "set_direct"));
        }
        st.direct = consumer.clone();
        st.direct_read = consumer.is_some() && !st.peer_eof;
        st.direct_write = false;
        st.direct_kick = false;
        self.rearm(&st);
        drop(st);
        if let Some(c) = consumer {
            c.attach(self.me.clone());
        }
        Ok(())
    }

    /// Re-enable delivery to the direct consumer after it returned "stop"
    /// (read) or asked for writability (write). Any thread.
    pub fn trigger_direct(&self, which: Trigger) {
        let mut st = self.lock();
        if st.direct.is_none() || st.destroyed {
            return;
        }
        match which {
            Trigger::Read => {
                st.direct_read = !st.peer_eof;
                st.direct_kick = st.tls.is_some() && st.direct_read;
            }
            Trigger::Write => st.direct_write = true,
        }
        self.rearm(&st);
    }

    pub fn set_keepalive(&self, enable: bool, idle_secs: u32) -> LoopResult<()> {
        let fd = self.d.fd();
        addr::set_int_opt(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, enable as libc::c_int)?;
        if enable && idle_secs > 0 {
            addr::set_int_opt(fd, libc::IPPROTO_TCP, libc::TCP_KEEPIDLE, idle_secs as libc::c_int)?;
        }
        Ok(())
    }

    pub fn set_nodelay(&self, enable: bool) -> LoopResult<()> {
        addr::set_int_opt(self.d.fd(), libc::IPPROTO_TCP, libc::TCP_NODELAY, enable as libc::c_int)
    }

    /// Half-close: FIN, or close_notify under TLS. Reads keep working.
    pub fn shutdown(&self) -> LoopResult<()> {
        let mut st = self.lock();
        if st.phase != SocketPhase::Open {
            return Err(LoopError::os(libc::ENOTCONN, "shutdown"));
        }
        let fd = self.d.fd();
        match st.tls.as_mut() {
            Some(t) => match t.close_notify(fd) {
                Err(e) if !e.is_would_block() => return Err(e),
                _ => {}
            },
            None => {
                if unsafe { libc::shutdown(fd, libc::SHUT_WR) } < 0 {
                    return Err(LoopError::last_os("shutdown"));
                }
            }
        }
        st.phase = SocketPhase::HalfClosed;
        ktrace!("fd {} half-closed", fd);
        Ok(())
    }

    /// Close the socket. Outstanding continuations are dropped. With a
    /// callback the descriptor is destroyed before it runs; without one
    /// the multiplexer destroys it.
    pub fn close(
        &self,
        cx: &mut LoopContext,
        cb: Option<Box<dyn FnOnce(&mut LoopContext, LoopResult<()>) -> LoopResult<()>>>,
    ) {
        let dropped = {
            let mut st = self.lock();
            if st.destroyed {
                return;
            }
            st.destroyed = true;
            st.phase = SocketPhase::Closed;
            st.direct = None;
            let mut ids = Vec::new();
            ids.extend(st.connect.take().map(|c| c.cb));
            ids.extend(st.read.take().map(|r| r.cb));
            ids.extend(st.write.take().map(|w| w.cb));
            ids
        };
        for id in dropped {
            cx.release(id);
            cx.run_ref_add(-1);
        }
        if let Some(me) = self.me.upgrade() {
            let as_cb: Arc<dyn LoopCallback> = me.clone();
            self.handle.cancel(&as_cb);
            let p: Arc<dyn Pollable> = me;
            match cb {
                Some(cb) => {
                    self.handle.destroy(&p);
                    cx.next_tick(move |cx| cb(cx, Ok(())));
                }
                None => self.handle.mark_delete(&p),
            }
        }
    }

    /// Direct-mode dispatch, socket lock released.
    fn pump_direct(&self, consumer: Arc<dyn SocketDirect>, ready: Interest) {
        let chunk = self.handle.config().direct_read_chunk;
        let tls = self.lock().tls.is_some();
        if ready.is_readable() || ready.is_error() || tls {
            let armed = {
                let mut st = self.lock();
                let armed = st.direct_read && !st.peer_eof;
                st.direct_read = false;
                st.direct_kick = false;
                armed
            };
            if armed {
                loop {
                    let res = {
                        let mut st = self.lock();
                        let fd = self.d.fd();
                        recv(fd, st.tls.as_mut(), chunk)
                    };
                    if matches!(&res, Err(e) if e.is_would_block()) {
                        self.lock().direct_read = true;
                        break;
                    }
                    let end = match &res {
                        Ok(data) => data.is_empty(),
                        Err(_) => true,
                    };
                    if end {
                        self.lock().peer_eof = true;
                    }
                    if !consumer.on_data(res) || end {
                        break;
                    }
                    if !tls {
                        self.lock().direct_read = true;
                        break;
                    }
                }
            }
        }
        if ready.is_writable() {
            let armed = {
                let mut st = self.lock();
                let armed = st.direct_write;
                st.direct_write = false;
                armed
            };
            if armed && consumer.on_write() {
                self.lock().direct_write = true;
            }
        }
    }

    /// Callback-mode I/O for one readiness event. `true` when a result is
    /// ready for the loop.
    fn pump_callbacks(&self, st: &mut SocketState, ready: Interest) -> bool {
        let fd = self.d.fd();
        let mut post = false;
        let SocketState {
            tls, read, write, peer_eof, ..
        } = st;
        if let Some(r) = read.as_mut() {
            if r.result.is_none() && (ready.is_readable() || ready.is_error() || tls.is_some()) {
                match recv(fd, tls.as_mut(), r.max) {
                    Err(e) if e.is_would_block() => {}
                    res => {
                        if matches!(&res, Ok(data) if data.is_empty()) {
                            *peer_eof = true;
                        }
                        r.result = Some(res);
                        post = true;
                    }
                }
            }
        }
        if let Some(w) = write.as_mut() {
            if w.result.is_none() && (ready.is_writable() || ready.is_error()) {
                while w.pos < w.data.len() {
                    match send(fd, tls.as_mut(), &w.data[w.pos..]) {
                        Ok(n) => w.pos += n,
                        Err(e) if e.is_would_block() => break,
                        Err(e) => {
                            w.result = Some(Err(e));
                            break;
                        }
                    }
                }
                if w.result.is_none() && w.pos == w.data.len() {
                    w.result = Some(Ok(w.pos));
                }
                post |= w.result.is_some();
            }
        }
        post
    }

    /// Fail whatever is waiting after a connect or handshake error. `false`
    /// when nobody was waiting.
    fn fail_pending(st: &mut SocketState, err: LoopError) -> bool {
        st.phase = SocketPhase::Closed;
        if let Some(c) = st.connect.as_mut() {
            c.result = Some(Err(err));
            return true;
        }
        if let Some(r) = st.read.as_mut() {
            r.result = Some(Err(err));
            return true;
        }
        false
    }
}

impl Pollable for Socket {
    fn descriptor(&self) -> &Descriptor {
        &self.d
    }

    fn on_readiness(&self, ready: Interest) -> bool {
        let Some(me) = self.me.upgrade() else {
            return false;
        };
        let fd = self.d.fd();
        let mut st = self.lock();
        if st.destroyed {
            return true;
        }
        let mut post = false;
        let mut connected = false;

        if st.phase == SocketPhase::Connecting {
            let err = match addr::take_socket_error(fd) {
                Ok(0) => None,
                Ok(errno) => Some(LoopError::os(errno, "connect")),
                Err(e) => Some(e),
            };
            match err {
                None => {
                    st.phase = SocketPhase::Open;
                    st.info = SocketInfo::of(fd);
                }
                Some(e) => {
                    kdebug!("connect on fd {} failed: {}", fd, e);
                    if !Self::fail_pending(&mut st, e) {
                        return false;
                    }
                    post = true;
                }
            }
        }

        if st.phase == SocketPhase::Open && !st.handshake_done {
            let step = match st.tls.as_mut() {
                Some(t) => t.handshake(fd),
                None => Ok(None),
            };
            match step {
                Ok(None) => {
                    st.handshake_done = true;
                    st.tls_interest = Interest::NONE;
                    if st.direct.is_some() {
                        st.direct_read = true;
                        connected = true;
                    }
                }
                Ok(Some(mask)) => st.tls_interest = mask,
                Err(e) => {
                    kdebug!("tls handshake on fd {} failed: {}", fd, e);
                    if !Self::fail_pending(&mut st, e) {
                        return false;
                    }
                    post = true;
                }
            }
        }

        let awaiting_connect = st.connect.as_ref().is_some_and(|c| c.result.is_none());
        if st.handshake_done && st.phase == SocketPhase::Open && awaiting_connect {
            let info = st.info.clone();
            connected |= st.direct.is_some();
            if let Some(c) = st.connect.as_mut() {
                c.result = Some(Ok(info));
                post = true;
            }
        }

        let io_ready = st.handshake_done && matches!(st.phase, SocketPhase::Open | SocketPhase::HalfClosed);
        if io_ready && ready.is_writable() {
            if let Some(t) = st.tls.as_mut() {
                if let Err(e) = t.flush(fd) {
                    ktrace!("tls flush on fd {}: {}", fd, e);
                }
            }
        }
        if io_ready {
            match st.direct.clone() {
                Some(consumer) => {
                    drop(st);
                    if connected {
                        consumer.on_connected();
                    }
                    self.pump_direct(consumer, ready);
                    st = self.lock();
                }
                None => post |= self.pump_callbacks(&mut st, ready),
            }
        }

        if !st.destroyed {
            self.rearm(&st);
        }
        drop(st);
        if post {
            self.handle.post(me);
        }
        true
    }

    fn on_retire(&self) {
        let consumer = {
            let mut st = self.lock();
            st.phase = SocketPhase::Closed;
            st.destroyed = true;
            st.tls = None;
            st.direct.take()
        };
        drop(consumer);
        self.d.close_native();
    }
}

impl LoopCallback for Socket {
    fn link(&self) -> &QueueLink {
        &self.link
    }

    fn on_loop(&self, cx: &mut LoopContext) -> LoopResult<bool> {
        let (connect, read, write) = {
            let mut st = self.lock();
            if st.destroyed {
                return Ok(false);
            }
            let connect = if st.connect.as_ref().is_some_and(|c| c.result.is_some()) {
                st.connect.take()
            } else {
                None
            };
            let read = if st.read.as_ref().is_some_and(|r| r.result.is_some()) {
                st.read.take()
            } else {
                None
            };
            let write = if st.write.as_ref().is_some_and(|w| w.result.is_some()) {
                st.write.take()
            } else {
                None
            };
            (connect, read, write)
        };

        let mut outcome = Ok(());
        if let Some(PendingConnect { cb, result: Some(res) }) = connect {
            cx.run_ref_add(-1);
            outcome = outcome.and(cx.complete(cb, res));
        }
        if let Some(PendingRead { cb, result: Some(res), .. }) = read {
            cx.run_ref_add(-1);
            let r = cx.complete(cb, res);
            outcome = outcome.and(r);
        }
        if let Some(PendingWrite { cb, result: Some(res), .. }) = write {
            cx.run_ref_add(-1);
            let r = cx.complete(cb, res);
            outcome = outcome.and(r);
        }
        outcome.map(|_| true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lowloop_runtime::{DefaultHost, Engine, EngineConfig};
    use std::cell::RefCell;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::rc::Rc;

    fn engine() -> Engine {
        let config = EngineConfig::new()
            .num_workers(1)
            .install_signals(false)
            .stdio_baseline(false);
        Engine::new(config, Box::new(DefaultHost)).unwrap()
    }

    #[test]
    fn test_connect_write_read_close() {
        let server = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = server.local_addr().unwrap();
        let peer = std::thread::spawn(move || {
            let (mut s, _) = server.accept().unwrap();
            let mut buf = [0u8; 4];
            s.read_exact(&mut buf).unwrap();
            s.write_all(&buf).unwrap();
            // hold until the client closes
            let mut rest = Vec::new();
            let _ = s.read_to_end(&mut rest);
        });

        let mut e = engine();
        let info = Rc::new(RefCell::new(None));
        let got = Rc::new(RefCell::new(Vec::new()));
        e.with_context(|cx| {
            let info = info.clone();
            let sock = Socket::connect(cx, addr, None, move |_, res| {
                *info.borrow_mut() = Some(res?);
                Ok(())
            })
            .unwrap();
            assert_eq!(sock.phase(), SocketPhase::Connecting);
            sock.write(cx, b"ping".to_vec(), |_, res| {
                assert_eq!(res?, 4);
                Ok(())
            })
            .unwrap();
            let again = sock.write(cx, b"x".to_vec(), |_, _| Ok(())).unwrap_err();
            assert!(again.is_would_block());

            let got = got.clone();
            let s2 = sock.clone();
            sock.read(cx, 64, move |cx, res| {
                *got.borrow_mut() = res?;
                s2.close(cx, None);
                Ok(())
            })
            .unwrap();
        });
        e.run().unwrap();
        assert_eq!(&got.borrow()[..], b"ping");
        let info = info.borrow().clone().unwrap();
        assert_eq!(info.remote, Some(addr));
        assert_eq!(info.family(), Some(4));
        assert_eq!(e.handle().run_ref(), 0);
        drop(e);
        peer.join().unwrap();
    }

    #[test]
    fn test_read_reports_end_of_stream() {
        let server = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = server.local_addr().unwrap();
        let peer = std::thread::spawn(move || {
            let (s, _) = server.accept().unwrap();
            drop(s);
        });

        let mut e = engine();
        let eof = Rc::new(RefCell::new(None));
        e.with_context(|cx| {
            let sock = Socket::connect(cx, addr, None, |_, res| res.map(|_| ())).unwrap();
            let eof = eof.clone();
            let s2 = sock.clone();
            sock.read(cx, 16, move |cx, res| {
                *eof.borrow_mut() = Some(res?.is_empty());
                let closed: Box<dyn FnOnce(&mut LoopContext, LoopResult<()>) -> LoopResult<()>> =
                    Box::new(|_, res| res);
                s2.close(cx, Some(closed));
                Ok(())
            })
            .unwrap();
        });
        e.run().unwrap();
        assert_eq!(*eof.borrow(), Some(true));
        assert!(e.handle().registry().is_empty());
        peer.join().unwrap();
    }

    #[test]
    fn test_connect_refused() {
        let port = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
        let addr: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();
        let mut e = engine();
        let code = Rc::new(RefCell::new(None));
        e.with_context(|cx| {
            let code2 = code.clone();
            let res = Socket::connect(cx, addr, None, move |_, res| {
                *code2.borrow_mut() = res.err().map(|e| e.code());
                Ok(())
            });
            if let Err(err) = res {
                *code.borrow_mut() = Some(err.code());
            }
        });
        e.run().unwrap();
        assert_eq!(code.borrow().as_deref(), Some("ECONNREFUSED"));
    }

    struct Collect {
        got: Mutex<Vec<u8>>,
        done: std::sync::atomic::AtomicBool,
    }

    impl SocketDirect for Collect {
        fn attach(&self, _socket: Weak<Socket>) {}

        fn on_data(&self, chunk: Result<Vec<u8>, LoopError>) -> bool {
            match chunk {
                Ok(data) if !data.is_empty() => {
                    self.got.lock().unwrap().extend_from_slice(&data);
                    true
                }
                _ => {
                    self.done.store(true, std::sync::atomic::Ordering::SeqCst);
                    false
                }
            }
        }

        fn on_write(&self) -> bool {
            false
        }
    }

    #[test]
    fn test_direct_mode_receives_stream() {
        let server = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = server.local_addr().unwrap();
        let peer = std::thread::spawn(move || {
            let (mut s, _) = server.accept().unwrap();
            s.write_all(&[7u8; 3000]).unwrap();
        });

        let mut e = engine();
        let collect = Arc::new(Collect {
            got: Mutex::new(Vec::new()),
            done: std::sync::atomic::AtomicBool::new(false),
        });
        let consumer: Arc<dyn SocketDirect> = collect.clone();
        let sock = e.with_context(|cx| {
            let sock = Socket::connect(cx, addr, None, |_, res| res.map(|_| ())).unwrap();
            sock.set_direct(Some(consumer)).unwrap();
            assert!(sock.read(cx, 1, |_, _| Ok(())).unwrap_err().is_would_block());
            sock
        });
        e.run().unwrap();
        for _ in 0..200 {
            if collect.done.load(std::sync::atomic::Ordering::SeqCst) {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert_eq!(collect.got.lock().unwrap().len(), 3000);
        e.with_context(|cx| sock.close(cx, None));
        peer.join().unwrap();
    }

    #[test]
    fn test_tls_pending_records_poll_for_write_only() {
        let e = engine();
        let ctx = TlsContext::client_with_roots(rustls::RootCertStore::empty()).unwrap();
        let session = ctx.client_session("localhost").unwrap();
        let sock = Socket::build(e.handle().clone(), -1, SocketPhase::Open, Some(session));
        let mut st = sock.lock();
        assert_eq!(Socket::wanted(&st), Interest::READ);

        // the ClientHello is still buffered; a pending read must not add READ
        st.handshake_done = true;
        st.read = Some(PendingRead { max: 16, cb: SlotId::new(0, 0), result: None });
        assert_eq!(Socket::wanted(&st), Interest::WRITE);

        st.tls = None;
        assert_eq!(Socket::wanted(&st), Interest::READ);
    }
}
