//! TLS over non-blocking sockets (rustls, ring provider).
//!
//! A [`TlsContext`] is built once and shared by `Arc` with every socket
//! that uses it. Each socket owns one [`TlsSession`]; the session never
//! blocks, it reports which readiness it needs next instead.

use std::io::{self, BufReader, Read, Write};
use std::os::unix::io::RawFd;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, ClientConnection, Connection, RootCertStore, ServerConfig, ServerConnection};

use lowloop_core::{kdebug, Interest, LoopError, LoopResult};

fn provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn read_certs(pem: &[u8]) -> LoopResult<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(pem);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| LoopError::tls(format!("bad certificate PEM: {}", e), "load_certs"))?;
    if certs.is_empty() {
        return Err(LoopError::tls("no certificates found", "load_certs"));
    }
    Ok(certs)
}

fn read_key(pem: &[u8]) -> LoopResult<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(pem);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| LoopError::tls(format!("bad key PEM: {}", e), "load_key"))?
        .ok_or_else(|| LoopError::tls("no private key found", "load_key"))
}

/// Shared TLS configuration.
pub struct TlsContext {
    server: Option<Arc<ServerConfig>>,
    client: Option<Arc<ClientConfig>>,
}

impl TlsContext {
    /// Server side: certificate chain and private key, both PEM.
    pub fn server_from_pem(cert_pem: &[u8], key_pem: &[u8]) -> LoopResult<Self> {
        let certs = read_certs(cert_pem)?;
        let key = read_key(key_pem)?;
        let config = ServerConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()
            .map_err(|e| LoopError::tls(e.to_string(), "server_config"))?
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| LoopError::tls(e.to_string(), "server_config"))?;
        Ok(TlsContext {
            server: Some(Arc::new(config)),
            client: None,
        })
    }

    /// Client side, trusting the PEM certificates in `ca_pem`.
    pub fn client_from_pem(ca_pem: &[u8]) -> LoopResult<Self> {
        let mut roots = RootCertStore::empty();
        for cert in read_certs(ca_pem)? {
            roots
                .add(cert)
                .map_err(|e| LoopError::tls(e.to_string(), "client_config"))?;
        }
        Self::client_with_roots(roots)
    }

    pub fn client_with_roots(roots: RootCertStore) -> LoopResult<Self> {
        let config = ClientConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()
            .map_err(|e| LoopError::tls(e.to_string(), "client_config"))?
            .with_root_certificates(roots)
            .with_no_client_auth();
        Ok(TlsContext {
            server: None,
            client: Some(Arc::new(config)),
        })
    }

    pub fn is_server(&self) -> bool {
        self.server.is_some()
    }

    pub fn server_session(&self) -> LoopResult<TlsSession> {
        let config = self
            .server
            .clone()
            .ok_or_else(|| LoopError::tls("not a server context", "accept"))?;
        let conn = ServerConnection::new(config).map_err(|e| LoopError::tls(e.to_string(), "accept"))?;
        Ok(TlsSession::new(Connection::from(conn)))
    }

    pub fn client_session(&self, server_name: &str) -> LoopResult<TlsSession> {
        let config = self
            .client
            .clone()
            .ok_or_else(|| LoopError::tls("not a client context", "connect"))?;
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|_| LoopError::tls(format!("invalid server name: {:?}", server_name), "connect"))?;
        let conn = ClientConnection::new(config, name).map_err(|e| LoopError::tls(e.to_string(), "connect"))?;
        Ok(TlsSession::new(Connection::from(conn)))
    }
}

/// `Read`/`Write` straight on a non-blocking fd.
struct FdIo(RawFd);

impl Read for FdIo {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = unsafe { libc::read(self.0, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }
}

impl Write for FdIo {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = unsafe {
            libc::send(self.0, buf.as_ptr() as *const libc::c_void, buf.len(), libc::MSG_NOSIGNAL)
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn would_block() -> LoopError {
    LoopError::os(libc::EAGAIN, "read")
}

pub struct TlsSession {
    conn: Connection,
}

impl TlsSession {
    fn new(conn: Connection) -> Self {
        TlsSession { conn }
    }

    pub fn is_handshaking(&self) -> bool {
        self.conn.is_handshaking()
    }

    pub fn wants_write(&self) -> bool {
        self.conn.wants_write()
    }

    fn pull(&mut self, fd: RawFd, syscall: &'static str) -> LoopResult<usize> {
        match self.conn.read_tls(&mut FdIo(fd)) {
            Ok(0) => Ok(0),
            Ok(n) => {
                self.conn
                    .process_new_packets()
                    .map_err(|e| LoopError::tls(e.to_string(), syscall))?;
                Ok(n)
            }
            Err(e) => Err(LoopError::from_io(&e, syscall)),
        }
    }

    /// Push buffered records. `Ok(true)` once nothing is left.
    pub fn flush(&mut self, fd: RawFd) -> LoopResult<bool> {
        while self.conn.wants_write() {
            match self.conn.write_tls(&mut FdIo(fd)) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) => return Err(LoopError::from_io(&e, "write")),
            }
        }
        Ok(true)
    }

    /// Advance the handshake. `Ok(None)` when complete, otherwise the
    /// readiness to wait for.
    pub fn handshake(&mut self, fd: RawFd) -> LoopResult<Option<Interest>> {
        while self.conn.is_handshaking() {
            if self.conn.wants_write() {
                if !self.flush(fd)? {
                    return Ok(Some(Interest::WRITE));
                }
                continue;
            }
            match self.pull(fd, "handshake") {
                Ok(0) => return Err(LoopError::os(libc::ECONNRESET, "handshake")),
                Ok(_) => {}
                Err(e) if e.is_would_block() => return Ok(Some(Interest::READ)),
                Err(e) => return Err(e),
            }
        }
        if !self.flush(fd)? {
            return Ok(Some(Interest::WRITE));
        }
        kdebug!("tls handshake complete on fd {}", fd);
        Ok(None)
    }

    /// Plaintext read. `Ok(0)` is end of stream, `EAGAIN` means no record
    /// is complete yet.
    pub fn read(&mut self, fd: RawFd, buf: &mut [u8]) -> LoopResult<usize> {
        loop {
            match self.conn.reader().read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(0),
                Err(e) => return Err(LoopError::from_io(&e, "read")),
            }
            match self.pull(fd, "read") {
                Ok(0) => return Ok(0),
                // Records the peer's data provoked (key updates, alerts).
                Ok(_) => {
                    self.flush(fd)?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Plaintext write. Accepted bytes are buffered until flushed; `EAGAIN`
    /// when the session buffer is full.
    pub fn write(&mut self, fd: RawFd, data: &[u8]) -> LoopResult<usize> {
        let n = self
            .conn
            .writer()
            .write(data)
            .map_err(|e| LoopError::from_io(&e, "write"))?;
        match self.flush(fd) {
            Ok(_) => {}
            Err(e) if e.is_would_block() => {}
            Err(e) => return Err(e),
        }
        if n == 0 && !data.is_empty() {
            return Err(would_block());
        }
        Ok(n)
    }

    pub fn close_notify(&mut self, fd: RawFd) -> LoopResult<()> {
        self.conn.send_close_notify();
        self.flush(fd).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::{ListenOptions, Listener};
    use crate::socket::Socket;
    use lowloop_runtime::{DefaultHost, Engine, EngineConfig, LoopContext};
    use std::cell::RefCell;
    use std::rc::Rc;

    const CERT: &[u8] = include_bytes!("../testdata/localhost-cert.pem");
    const KEY: &[u8] = include_bytes!("../testdata/localhost-key.pem");

    fn engine() -> Engine {
        let config = EngineConfig::new()
            .num_workers(1)
            .install_signals(false)
            .stdio_baseline(false);
        Engine::new(config, Box::new(DefaultHost)).unwrap()
    }

    fn socketpair() -> [RawFd; 2] {
        let mut fds = [0i32; 2];
        let rc = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM | libc::SOCK_NONBLOCK, 0, fds.as_mut_ptr()) };
        assert_eq!(rc, 0);
        fds
    }

    #[test]
    fn test_server_requires_certificates() {
        let err = TlsContext::server_from_pem(b"not a pem", b"").err().unwrap();
        assert_eq!(err.code(), "ERR_TLS");
        assert_eq!(err.syscall(), Some("load_certs"));
    }

    #[test]
    fn test_client_without_roots() {
        let ctx = TlsContext::client_with_roots(RootCertStore::empty()).unwrap();
        assert!(!ctx.is_server());
        let session = ctx.client_session("example.com").unwrap();
        assert!(session.is_handshaking());
        assert!(session.wants_write());
    }

    #[test]
    fn test_session_side_must_match() {
        let ctx = TlsContext::client_with_roots(RootCertStore::empty()).unwrap();
        assert!(ctx.server_session().is_err());
        assert!(ctx.client_session("").is_err());
    }

    #[test]
    fn test_client_hello_reaches_the_wire() {
        let ctx = TlsContext::client_with_roots(RootCertStore::empty()).unwrap();
        let mut session = ctx.client_session("localhost").unwrap();
        let fds = socketpair();
        assert_eq!(session.handshake(fds[0]).unwrap(), Some(Interest::READ));
        let mut buf = [0u8; 5];
        let n = unsafe { libc::read(fds[1], buf.as_mut_ptr() as *mut libc::c_void, 5) };
        assert_eq!(n, 5);
        // TLS handshake record
        assert_eq!(buf[0], 0x16);
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn test_handshake_echo_and_close_notify() {
        let server_ctx = Arc::new(TlsContext::server_from_pem(CERT, KEY).unwrap());
        let client_ctx = TlsContext::client_from_pem(CERT).unwrap();
        let mut e = engine();
        let server_got = Rc::new(RefCell::new(Vec::new()));
        let server_eof = Rc::new(RefCell::new(false));
        let client_got = Rc::new(RefCell::new(Vec::new()));
        let client_eof = Rc::new(RefCell::new(false));

        e.with_context(|cx| {
            let me: Rc<RefCell<Option<Arc<Listener>>>> = Rc::new(RefCell::new(None));
            let me2 = me.clone();
            let (got, eof) = (server_got.clone(), server_eof.clone());
            let options = ListenOptions {
                tls: Some(server_ctx.clone()),
                ..Default::default()
            };
            let l = Listener::bind(cx, "127.0.0.1:0".parse().unwrap(), options, move |cx, conn| {
                let sock = conn?.socket;
                assert!(sock.is_tls());
                if let Some(l) = me2.borrow_mut().take() {
                    l.close(cx);
                }
                let (got, eof) = (got.clone(), eof.clone());
                let s2 = sock.clone();
                sock.read(cx, 0, move |cx, data| {
                    let data = data?;
                    got.borrow_mut().extend_from_slice(&data);
                    let s3 = s2.clone();
                    s2.write(cx, b"pong".to_vec(), move |cx, n| {
                        assert_eq!(n?, 4);
                        let s4 = s3.clone();
                        // the client's close_notify reads as end of stream
                        s3.read(cx, 0, move |cx, rest| {
                            *eof.borrow_mut() = rest?.is_empty();
                            s4.close(cx, None);
                            Ok(())
                        })
                    })
                })
            })
            .unwrap();
            let addr = l.local_addr();
            *me.borrow_mut() = Some(l);

            let (got, eof) = (client_got.clone(), client_eof.clone());
            let slot: Rc<RefCell<Option<Arc<Socket>>>> = Rc::new(RefCell::new(None));
            let slot2 = slot.clone();
            let sock = Socket::connect(cx, addr, Some((&client_ctx, "localhost")), move |cx, info| {
                info?;
                let Some(sock) = slot2.borrow_mut().take() else {
                    return Ok(());
                };
                sock.write(cx, b"ping".to_vec(), |_, n| n.map(|_| ()))?;
                let s2 = sock.clone();
                sock.read(cx, 0, move |cx, data| {
                    got.borrow_mut().extend_from_slice(&data?);
                    s2.shutdown()?;
                    let s3 = s2.clone();
                    s2.read(cx, 0, move |cx, rest| {
                        *eof.borrow_mut() = rest?.is_empty();
                        s3.close(cx, None);
                        Ok(())
                    })
                })
            })
            .unwrap();
            assert!(sock.is_tls());
            *slot.borrow_mut() = Some(sock);
        });

        e.run().unwrap();
        assert_eq!(&server_got.borrow()[..], b"ping");
        assert_eq!(&client_got.borrow()[..], b"pong");
        assert!(*server_eof.borrow());
        assert!(*client_eof.borrow());
        assert_eq!(e.handle().run_ref(), 0);
    }

    #[test]
    fn test_unknown_issuer_fails_the_connect() {
        let server_ctx = Arc::new(TlsContext::server_from_pem(CERT, KEY).unwrap());
        let client_ctx = TlsContext::client_with_roots(RootCertStore::empty()).unwrap();
        let mut e = engine();
        let code = Rc::new(RefCell::new(None));
        e.with_context(|cx| {
            let me: Rc<RefCell<Option<Arc<Listener>>>> = Rc::new(RefCell::new(None));
            let me2 = me.clone();
            let options = ListenOptions {
                tls: Some(server_ctx.clone()),
                ..Default::default()
            };
            let l = Listener::bind(cx, "127.0.0.1:0".parse().unwrap(), options, move |cx, conn| {
                let sock = conn?.socket;
                if let Some(l) = me2.borrow_mut().take() {
                    l.close(cx);
                }
                let s2 = sock.clone();
                let res = sock.read(cx, 0, move |cx, _| {
                    s2.close(cx, None);
                    Ok(())
                });
                // the failed handshake may already have taken the socket down
                if res.is_err() {
                    sock.close(cx, None);
                }
                Ok(())
            })
            .unwrap();
            let addr = l.local_addr();
            *me.borrow_mut() = Some(l);

            let code = code.clone();
            let slot: Rc<RefCell<Option<Arc<Socket>>>> = Rc::new(RefCell::new(None));
            let slot2 = slot.clone();
            let sock = Socket::connect(cx, addr, Some((&client_ctx, "localhost")), move |cx, info| {
                *code.borrow_mut() = info.err().map(|e| e.code());
                if let Some(s) = slot2.borrow_mut().take() {
                    s.close(cx, None);
                }
                Ok(())
            })
            .unwrap();
            *slot.borrow_mut() = Some(sock);
        });
        e.run().unwrap();
        assert_eq!(code.borrow().as_deref(), Some("ERR_TLS"));
    }

    #[test]
    fn test_write_failure_during_read_is_reported() {
        let client_ctx = TlsContext::client_with_roots(RootCertStore::empty()).unwrap();
        let server_ctx = TlsContext::server_from_pem(CERT, KEY).unwrap();
        let mut client = client_ctx.client_session("localhost").unwrap();
        let mut server = server_ctx.server_session().unwrap();
        let fds = socketpair();
        assert_eq!(client.handshake(fds[0]).unwrap(), Some(Interest::READ));
        // the client stops reading; the server's reply cannot be delivered
        assert_eq!(unsafe { libc::shutdown(fds[0], libc::SHUT_RD) }, 0);
        let mut buf = [0u8; 64];
        let err = server.read(fds[1], &mut buf).unwrap_err();
        assert_eq!(err.code(), "EPIPE");
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }
}
