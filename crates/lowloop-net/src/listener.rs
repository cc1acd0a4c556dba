//! Listening TCP sockets.
//!
//! `accept4` runs on the multiplexer thread; accepted descriptors are
//! wrapped and handed to the connection handler on the loop thread. When
//! the process runs out of descriptors the listener stops polling and sets
//! the registry's retry flag; the next descriptor destruction re-arms it.

use std::collections::VecDeque;
use std::mem;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use lowloop_core::{
    kdebug, kwarn, Descriptor, DescriptorKind, Interest, LoopError, LoopResult, Pollable, QueueLink, SlotId,
};
use lowloop_runtime::{EngineHandle, LoopCallback, LoopContext};

use crate::addr;
use crate::http::HttpDirect;
use crate::socket::{Socket, SocketDirect};
use crate::tls::TlsContext;

/// What the listener does with each accepted connection.
#[derive(Clone, Default)]
pub struct ListenOptions {
    /// Every accepted socket gets its own session from this shared context.
    pub tls: Option<Arc<TlsContext>>,
    /// Attach a server-side HTTP framer to every accepted socket.
    pub http: bool,
    pub backlog: Option<i32>,
}

/// One accepted connection, as delivered to the handler.
pub struct Connection {
    pub socket: Arc<Socket>,
    pub remote: Option<SocketAddr>,
    /// Present in HTTP mode.
    pub http: Option<Arc<HttpDirect>>,
}

struct ListenerState {
    accepted: VecDeque<RawFd>,
    error: Option<LoopError>,
    closed: bool,
}

pub struct Listener {
    d: Descriptor,
    link: QueueLink,
    handle: EngineHandle,
    me: Weak<Listener>,
    local: SocketAddr,
    options: ListenOptions,
    on_connection: SlotId,
    state: Mutex<ListenerState>,
    /// Accepts left to fail with `EMFILE`.
    #[cfg(test)]
    fail_accepts: std::sync::atomic::AtomicUsize,
}

impl Listener {
    /// Bind and listen on `addr` (port 0 picks a free port, see
    /// [`Listener::local_addr`]). The listener keeps the loop alive until
    /// closed.
    pub fn bind(
        cx: &mut LoopContext,
        addr: SocketAddr,
        options: ListenOptions,
        on_connection: impl FnMut(&mut LoopContext, LoopResult<Connection>) -> LoopResult<()> + 'static,
    ) -> LoopResult<Arc<Listener>> {
        let fd = addr::new_socket(&addr, libc::SOCK_STREAM)?;
        let fail = |e: LoopError| {
            unsafe {
                libc::close(fd);
            }
            e
        };
        addr::set_int_opt(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1).map_err(fail)?;
        let (raw, len) = addr::to_raw(&addr);
        if unsafe { libc::bind(fd, &raw as *const _ as *const libc::sockaddr, len) } < 0 {
            return Err(fail(LoopError::last_os("bind")));
        }
        let backlog = options.backlog.unwrap_or(cx.handle().config().listen_backlog);
        if unsafe { libc::listen(fd, backlog) } < 0 {
            return Err(fail(LoopError::last_os("listen")));
        }
        let local = addr::local_addr(fd).unwrap_or(addr);
        let id = cx.retain_handler(on_connection).map_err(fail)?;

        let listener = Arc::new_cyclic(|me| Listener {
            d: Descriptor::with_fd(DescriptorKind::Listener, fd),
            link: QueueLink::new(),
            handle: cx.handle().clone(),
            me: me.clone(),
            local,
            options,
            on_connection: id,
            state: Mutex::new(ListenerState {
                accepted: VecDeque::new(),
                error: None,
                closed: false,
            }),
            #[cfg(test)]
            fail_accepts: std::sync::atomic::AtomicUsize::new(0),
        });
        let p: Arc<dyn Pollable> = listener.clone();
        if let Err(e) = cx.handle().advertise(p.clone()) {
            cx.release(id);
            listener.d.close_native();
            return Err(e);
        }
        cx.handle().request_interest(&p, Interest::READ);
        cx.run_ref_add(1);
        kdebug!("listening on {} (fd {}, backlog {})", local, fd, backlog);
        Ok(listener)
    }

    fn lock(&self) -> MutexGuard<'_, ListenerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.d.fd()
    }

    /// Stop listening. Connections not yet handed out are closed.
    pub fn close(&self, cx: &mut LoopContext) {
        let pending = {
            let mut st = self.lock();
            if st.closed {
                return;
            }
            st.closed = true;
            mem::take(&mut st.accepted)
        };
        for fd in pending {
            unsafe {
                libc::close(fd);
            }
        }
        cx.release(self.on_connection);
        cx.run_ref_add(-1);
        if let Some(me) = self.me.upgrade() {
            let as_cb: Arc<dyn LoopCallback> = me.clone();
            self.handle.cancel(&as_cb);
            let p: Arc<dyn Pollable> = me;
            self.handle.destroy(&p);
        }
    }

    #[cfg(test)]
    fn injected_failure(&self) -> Option<i32> {
        use std::sync::atomic::Ordering;
        self.fail_accepts
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .ok()
            .map(|_| libc::EMFILE)
    }

    #[cfg(not(test))]
    #[inline]
    fn injected_failure(&self) -> Option<i32> {
        None
    }

    fn accept_one(&self, fd: RawFd) -> Result<RawFd, i32> {
        if let Some(errno) = self.injected_failure() {
            return Err(errno);
        }
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let client = unsafe {
            libc::accept4(
                fd,
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len,
                libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            )
        };
        if client < 0 {
            return Err(lowloop_core::error::last_errno());
        }
        Ok(client)
    }

    fn wrap(&self, fd: RawFd) -> LoopResult<Connection> {
        let session = match &self.options.tls {
            Some(ctx) => match ctx.server_session() {
                Ok(s) => Some(s),
                Err(e) => {
                    unsafe {
                        libc::close(fd);
                    }
                    return Err(e);
                }
            },
            None => None,
        };
        let socket = Socket::accepted(&self.handle, fd, session)?;
        let remote = socket.info().remote;
        let http = if self.options.http {
            let framer = HttpDirect::server(&self.handle);
            let consumer: Arc<dyn SocketDirect> = framer.clone();
            socket.set_direct(Some(consumer))?;
            Some(framer)
        } else {
            None
        };
        Ok(Connection { socket, remote, http })
    }
}

impl Pollable for Listener {
    fn descriptor(&self) -> &Descriptor {
        &self.d
    }

    fn on_readiness(&self, ready: Interest) -> bool {
        let Some(me) = self.me.upgrade() else {
            return false;
        };
        if !ready.is_readable() && !ready.is_error() {
            return true;
        }
        let fd = self.d.fd();
        let mut got = VecDeque::new();
        let mut error = None;
        loop {
            match self.accept_one(fd) {
                Ok(client) => got.push_back(client),
                Err(errno) if errno == libc::EAGAIN || errno == libc::EWOULDBLOCK => break,
                Err(errno) if errno == libc::EINTR || errno == libc::ECONNABORTED => continue,
                Err(errno) if errno == libc::ENFILE || errno == libc::EMFILE => {
                    kwarn!("out of descriptors, pausing listener on {}", self.local);
                    let p: Arc<dyn Pollable> = me.clone();
                    self.handle.request_interest(&p, Interest::NONE);
                    self.handle.registry().set_retry_accepts();
                    break;
                }
                Err(errno) => {
                    error = Some(LoopError::os(errno, "accept"));
                    break;
                }
            }
        }
        if got.is_empty() && error.is_none() {
            return true;
        }
        let mut st = self.lock();
        if st.closed {
            drop(st);
            for client in got {
                unsafe {
                    libc::close(client);
                }
            }
            return true;
        }
        st.accepted.extend(got);
        if error.is_some() {
            st.error = error;
        }
        drop(st);
        self.handle.post(me);
        true
    }
}

impl LoopCallback for Listener {
    fn link(&self) -> &QueueLink {
        &self.link
    }

    fn on_loop(&self, cx: &mut LoopContext) -> LoopResult<bool> {
        let (accepted, error) = {
            let mut st = self.lock();
            if st.closed {
                return Ok(false);
            }
            (mem::take(&mut st.accepted), st.error.take())
        };
        // The handler may close the listener mid-batch; whatever it has not
        // been given yet is closed here, never registered.
        let mut outcome = Ok(());
        let mut accepted = accepted;
        while let Some(fd) = accepted.pop_front() {
            if self.lock().closed {
                accepted.push_front(fd);
                break;
            }
            let conn = self.wrap(fd);
            let r = cx.dispatch(self.on_connection, conn);
            outcome = outcome.and(r);
        }
        if !accepted.is_empty() {
            kdebug!("listener on {} closed, dropping {} connections", self.local, accepted.len());
        }
        for fd in accepted {
            unsafe {
                libc::close(fd);
            }
        }
        if let Some(e) = error {
            if !self.lock().closed {
                let r = cx.dispatch::<LoopResult<Connection>>(self.on_connection, Err(e));
                outcome = outcome.and(r);
            }
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
    use std::net::TcpStream;
    use std::rc::Rc;

    fn engine() -> Engine {
        let config = EngineConfig::new()
            .num_workers(1)
            .install_signals(false)
            .stdio_baseline(false);
        Engine::new(config, Box::new(DefaultHost)).unwrap()
    }

    #[test]
    fn test_port_zero_resolves() {
        let mut e = engine();
        e.with_context(|cx| {
            let l = Listener::bind(cx, "127.0.0.1:0".parse().unwrap(), ListenOptions::default(), |_, _| Ok(()))
                .unwrap();
            assert_ne!(l.local_addr().port(), 0);
            assert_eq!(cx.handle().run_ref(), 1);
            l.close(cx);
            assert_eq!(cx.handle().run_ref(), 0);
        });
        assert!(e.handle().registry().is_empty());
    }

    #[test]
    fn test_accept_and_echo() {
        let mut e = engine();
        let remotes = Rc::new(RefCell::new(Vec::new()));
        let addr = e.with_context(|cx| {
            let remotes = remotes.clone();
            let me: Rc<RefCell<Option<Arc<Listener>>>> = Rc::new(RefCell::new(None));
            let me2 = me.clone();
            let l = Listener::bind(cx, "127.0.0.1:0".parse().unwrap(), ListenOptions::default(), move |cx, conn| {
                let conn = conn?;
                remotes.borrow_mut().push(conn.remote);
                let sock = conn.socket.clone();
                conn.socket.read(cx, 64, move |cx, data| {
                    let data = data?;
                    let s2 = sock.clone();
                    sock.write(cx, data, move |cx, n| {
                        n?;
                        s2.close(cx, None);
                        Ok(())
                    })
                })?;
                if let Some(l) = me2.borrow_mut().take() {
                    l.close(cx);
                }
                Ok(())
            })
            .unwrap();
            let addr = l.local_addr();
            *me.borrow_mut() = Some(l);
            addr
        });

        let client = std::thread::spawn(move || {
            let mut s = TcpStream::connect(addr).unwrap();
            s.write_all(b"hello").unwrap();
            let mut back = Vec::new();
            s.read_to_end(&mut back).unwrap();
            back
        });
        e.run().unwrap();
        assert_eq!(client.join().unwrap(), b"hello");
        assert_eq!(remotes.borrow().len(), 1);
        assert!(remotes.borrow()[0].is_some());
    }

    #[test]
    fn test_out_of_descriptors_pauses_until_next_destroy() {
        let mut e = engine();
        let delivered = Rc::new(RefCell::new(0));
        let me: Rc<RefCell<Option<Arc<Listener>>>> = Rc::new(RefCell::new(None));
        let listener = e.with_context(|cx| {
            let delivered = delivered.clone();
            let me2 = me.clone();
            let l = Listener::bind(cx, "127.0.0.1:0".parse().unwrap(), ListenOptions::default(), move |cx, conn| {
                *delivered.borrow_mut() += 1;
                let closed: Box<dyn FnOnce(&mut LoopContext, LoopResult<()>) -> LoopResult<()>> =
                    Box::new(|_, res| res);
                conn?.socket.close(cx, Some(closed));
                if let Some(l) = me2.borrow_mut().take() {
                    l.close(cx);
                }
                Ok(())
            })
            .unwrap();
            l.fail_accepts.store(1, std::sync::atomic::Ordering::SeqCst);
            *me.borrow_mut() = Some(l.clone());
            l
        });

        let client = TcpStream::connect(listener.local_addr()).unwrap();
        let mut paused = false;
        for _ in 0..400 {
            if listener.d.requested() == Interest::NONE && !listener.d.is_polled() {
                paused = true;
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert!(paused, "listener kept polling after EMFILE");
        assert_eq!(*delivered.borrow(), 0);

        // Any descriptor going away re-arms the listener.
        e.with_context(|cx| {
            let d = crate::datagram::Datagram::bind(cx, "127.0.0.1:0".parse().unwrap(), |_, _| Ok(())).unwrap();
            d.close(cx);
        });
        assert_eq!(listener.d.requested(), Interest::READ);
        e.run().unwrap();
        assert_eq!(*delivered.borrow(), 1);
        assert!(e.handle().registry().is_empty());
        drop(client);
    }

    #[test]
    fn test_close_in_handler_drops_rest_of_batch() {
        let mut e = engine();
        let calls = Rc::new(RefCell::new(0));
        let addr = e.with_context(|cx| {
            let calls = calls.clone();
            let me: Rc<RefCell<Option<Arc<Listener>>>> = Rc::new(RefCell::new(None));
            let me2 = me.clone();
            let l = Listener::bind(cx, "127.0.0.1:0".parse().unwrap(), ListenOptions::default(), move |cx, conn| {
                *calls.borrow_mut() += 1;
                let closed: Box<dyn FnOnce(&mut LoopContext, LoopResult<()>) -> LoopResult<()>> =
                    Box::new(|_, res| res);
                conn?.socket.close(cx, Some(closed));
                if let Some(l) = me2.borrow_mut().take() {
                    l.close(cx);
                }
                Ok(())
            })
            .unwrap();
            let addr = l.local_addr();
            *me.borrow_mut() = Some(l);
            addr
        });

        // All three sit in the backlog before the loop sees the first one.
        let clients: Vec<TcpStream> = (0..3).map(|_| TcpStream::connect(addr).unwrap()).collect();
        std::thread::sleep(std::time::Duration::from_millis(50));
        e.run().unwrap();
        assert_eq!(*calls.borrow(), 1);
        assert!(e.handle().registry().is_empty());
        assert_eq!(e.handle().run_ref(), 0);
        for mut c in clients {
            c.set_read_timeout(Some(std::time::Duration::from_secs(5))).unwrap();
            let mut rest = Vec::new();
            // EOF or a reset, either way the server side is gone
            let _ = c.read_to_end(&mut rest);
            assert!(rest.is_empty());
        }
    }
}
