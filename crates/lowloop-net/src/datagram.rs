//! UDP sockets.
//!
//! Receives run on the multiplexer thread until `EAGAIN`; each message goes
//! to the persistent handler on the loop thread. Sends go straight out when
//! the socket has room and are queued (in order) otherwise.

use std::collections::VecDeque;
use std::mem;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use lowloop_core::{kdebug, Descriptor, DescriptorKind, Interest, LoopError, LoopResult, Pollable, QueueLink, SlotId};
use lowloop_runtime::{EngineHandle, LoopCallback, LoopContext};

use crate::addr;

const MAX_DATAGRAM: usize = 65536;

struct Outgoing {
    data: Vec<u8>,
    to: SocketAddr,
    cb: SlotId,
}

struct DatagramState {
    inbox: VecDeque<(Vec<u8>, SocketAddr)>,
    outbox: VecDeque<Outgoing>,
    sent: Vec<(SlotId, LoopResult<()>)>,
    error: Option<LoopError>,
    closed: bool,
}

pub struct Datagram {
    d: Descriptor,
    link: QueueLink,
    handle: EngineHandle,
    me: Weak<Datagram>,
    local: SocketAddr,
    on_message: SlotId,
    state: Mutex<DatagramState>,
}

fn send_to(fd: RawFd, data: &[u8], to: &SocketAddr) -> LoopResult<()> {
    let (raw, len) = addr::to_raw(to);
    let n = unsafe {
        libc::sendto(
            fd,
            data.as_ptr() as *const libc::c_void,
            data.len(),
            0,
            &raw as *const _ as *const libc::sockaddr,
            len,
        )
    };
    if n < 0 {
        return Err(LoopError::last_os("send"));
    }
    Ok(())
}

fn recv_from(fd: RawFd, buf: &mut [u8]) -> LoopResult<(usize, Option<SocketAddr>)> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let n = unsafe {
        libc::recvfrom(
            fd,
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            0,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
        )
    };
    if n < 0 {
        return Err(LoopError::last_os("recvmsg"));
    }
    Ok((n as usize, addr::from_raw(&storage, len)))
}

impl Datagram {
    /// Bind a UDP socket. Every received message goes to `on_message`;
    /// the socket keeps the loop alive until closed.
    pub fn bind(
        cx: &mut LoopContext,
        addr: SocketAddr,
        on_message: impl FnMut(&mut LoopContext, LoopResult<(Vec<u8>, SocketAddr)>) -> LoopResult<()> + 'static,
    ) -> LoopResult<Arc<Datagram>> {
        let fd = addr::new_socket(&addr, libc::SOCK_DGRAM)?;
        let (raw, len) = addr::to_raw(&addr);
        if unsafe { libc::bind(fd, &raw as *const _ as *const libc::sockaddr, len) } < 0 {
            let e = LoopError::last_os("bind");
            unsafe {
                libc::close(fd);
            }
            return Err(e);
        }
        let local = addr::local_addr(fd).unwrap_or(addr);
        let id = match cx.retain_handler(on_message) {
            Ok(id) => id,
            Err(e) => {
                unsafe {
                    libc::close(fd);
                }
                return Err(e);
            }
        };
        let dgram = Arc::new_cyclic(|me| Datagram {
            d: Descriptor::with_fd(DescriptorKind::Socket, fd),
            link: QueueLink::new(),
            handle: cx.handle().clone(),
            me: me.clone(),
            local,
            on_message: id,
            state: Mutex::new(DatagramState {
                inbox: VecDeque::new(),
                outbox: VecDeque::new(),
                sent: Vec::new(),
                error: None,
                closed: false,
            }),
        });
        let p: Arc<dyn Pollable> = dgram.clone();
        if let Err(e) = cx.handle().advertise(p.clone()) {
            cx.release(id);
            dgram.d.close_native();
            return Err(e);
        }
        cx.handle().request_interest(&p, Interest::READ);
        cx.run_ref_add(1);
        kdebug!("udp bound on {} (fd {})", local, fd);
        Ok(dgram)
    }

    fn lock(&self) -> MutexGuard<'_, DatagramState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.d.fd()
    }

    fn rearm(&self, st: &DatagramState) {
        if let Some(me) = self.me.upgrade() {
            let p: Arc<dyn Pollable> = me;
            let mask = if st.outbox.is_empty() {
                Interest::READ
            } else {
                Interest::READ | Interest::WRITE
            };
            self.handle.request_interest(&p, mask);
        }
    }

    /// Send one message. `cb` runs once it has left the socket; errors
    /// other than a full socket buffer are returned directly.
    pub fn send(
        &self,
        cx: &mut LoopContext,
        data: Vec<u8>,
        to: SocketAddr,
        cb: impl FnOnce(&mut LoopContext, LoopResult<()>) -> LoopResult<()> + 'static,
    ) -> LoopResult<()> {
        let mut st = self.lock();
        if st.closed {
            return Err(LoopError::os(libc::EBADF, "send"));
        }
        if st.outbox.is_empty() {
            match send_to(self.d.fd(), &data, &to) {
                Ok(()) => {
                    drop(st);
                    cx.next_tick(move |cx| cb(cx, Ok(())));
                    return Ok(());
                }
                Err(e) if e.is_would_block() => {}
                Err(e) => return Err(e),
            }
        }
        let cb = cx.retain_callback(cb)?;
        st.outbox.push_back(Outgoing { data, to, cb });
        self.rearm(&st);
        drop(st);
        cx.run_ref_add(1);
        Ok(())
    }

    /// Stop receiving and drop queued sends.
    pub fn close(&self, cx: &mut LoopContext) {
        let (queued, sent) = {
            let mut st = self.lock();
            if st.closed {
                return;
            }
            st.closed = true;
            st.inbox.clear();
            (mem::take(&mut st.outbox), mem::take(&mut st.sent))
        };
        let refs = (queued.len() + sent.len()) as isize;
        for out in queued {
            cx.release(out.cb);
        }
        for (cb, _) in sent {
            cx.release(cb);
        }
        cx.release(self.on_message);
        cx.run_ref_add(-(refs + 1));
        if let Some(me) = self.me.upgrade() {
            let as_cb: Arc<dyn LoopCallback> = me.clone();
            self.handle.cancel(&as_cb);
            let p: Arc<dyn Pollable> = me;
            self.handle.destroy(&p);
        }
    }
}

impl Pollable for Datagram {
    fn descriptor(&self) -> &Descriptor {
        &self.d
    }

    fn on_readiness(&self, ready: Interest) -> bool {
        let Some(me) = self.me.upgrade() else {
            return false;
        };
        let fd = self.d.fd();
        let mut st = self.lock();
        if st.closed {
            return true;
        }
        let mut post = false;
        if ready.is_readable() || ready.is_error() {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                match recv_from(fd, &mut buf) {
                    Ok((n, Some(from))) => {
                        st.inbox.push_back((buf[..n].to_vec(), from));
                        post = true;
                    }
                    Ok((_, None)) => continue,
                    Err(e) if e.is_would_block() => break,
                    Err(e) => {
                        st.error = Some(e);
                        post = true;
                        break;
                    }
                }
            }
        }
        if ready.is_writable() {
            while let Some(out) = st.outbox.front() {
                match send_to(fd, &out.data, &out.to) {
                    Err(e) if e.is_would_block() => break,
                    res => {
                        if let Some(out) = st.outbox.pop_front() {
                            st.sent.push((out.cb, res));
                        }
                        post = true;
                    }
                }
            }
            self.rearm(&st);
        }
        drop(st);
        if post {
            self.handle.post(me);
        }
        true
    }
}

impl LoopCallback for Datagram {
    fn link(&self) -> &QueueLink {
        &self.link
    }

    fn on_loop(&self, cx: &mut LoopContext) -> LoopResult<bool> {
        let (inbox, sent, error) = {
            let mut st = self.lock();
            if st.closed {
                return Ok(false);
            }
            (mem::take(&mut st.inbox), mem::take(&mut st.sent), st.error.take())
        };
        for (cb, res) in sent {
            cx.run_ref_add(-1);
            cx.complete(cb, res)?;
        }
        for msg in inbox {
            cx.dispatch::<LoopResult<(Vec<u8>, SocketAddr)>>(self.on_message, Ok(msg))?;
        }
        if let Some(e) = error {
            cx.dispatch::<LoopResult<(Vec<u8>, SocketAddr)>>(self.on_message, Err(e))?;
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lowloop_runtime::{DefaultHost, Engine, EngineConfig};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn engine() -> Engine {
        let config = EngineConfig::new()
            .num_workers(1)
            .install_signals(false)
            .stdio_baseline(false);
        Engine::new(config, Box::new(DefaultHost)).unwrap()
    }

    #[test]
    fn test_send_between_sockets() {
        let mut e = engine();
        let got = Rc::new(RefCell::new(None));
        let all: Rc<RefCell<Vec<Arc<Datagram>>>> = Rc::new(RefCell::new(Vec::new()));
        let sender_addr = e.with_context(|cx| {
            let (got2, all2) = (got.clone(), all.clone());
            let b = Datagram::bind(cx, "127.0.0.1:0".parse().unwrap(), move |cx, msg| {
                *got2.borrow_mut() = Some(msg?);
                for d in all2.borrow_mut().drain(..) {
                    d.close(cx);
                }
                Ok(())
            })
            .unwrap();
            let a = Datagram::bind(cx, "127.0.0.1:0".parse().unwrap(), |_, _| Ok(())).unwrap();
            let sent = Rc::new(RefCell::new(false));
            let sent2 = sent.clone();
            a.send(cx, b"hello".to_vec(), b.local_addr(), move |_, res| {
                *sent2.borrow_mut() = res.is_ok();
                Ok(())
            })
            .unwrap();
            let from = a.local_addr();
            all.borrow_mut().extend([a, b]);
            from
        });
        e.run().unwrap();
        let (data, from) = got.borrow_mut().take().unwrap();
        assert_eq!(data, b"hello");
        assert_eq!(from, sender_addr);
        assert!(all.borrow().is_empty());
        assert!(e.handle().registry().is_empty());
    }

    #[test]
    fn test_send_after_close() {
        let mut e = engine();
        e.with_context(|cx| {
            let a = Datagram::bind(cx, "127.0.0.1:0".parse().unwrap(), |_, _| Ok(())).unwrap();
            let to = a.local_addr();
            a.close(cx);
            let err = a.send(cx, b"x".to_vec(), to, |_, _| Ok(())).unwrap_err();
            assert_eq!(err.code(), "EBADF");
        });
        e.run().unwrap();
    }
}
