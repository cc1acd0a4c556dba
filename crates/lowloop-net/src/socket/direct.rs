//! Direct mode: readiness forwarded to a native consumer.

use std::sync::Weak;

use lowloop_core::LoopError;

use super::Socket;

/// A native consumer of a socket's bytes (the HTTP framer).
///
/// All three hooks run on the multiplexer thread with the socket's own
/// lock released. Read chunks are owned, so a consumer that cannot take
/// everything keeps the rest without copying.
pub trait SocketDirect: Send + Sync + 'static {
    fn attach(&self, socket: Weak<Socket>);

    /// The connection finished connecting (and its TLS handshake).
    fn on_connected(&self) {}

    /// Incoming bytes. An empty chunk is end of stream. Returning `false`
    /// stops delivery until [`Socket::trigger_direct`] re-arms reading.
    fn on_data(&self, chunk: Result<Vec<u8>, LoopError>) -> bool;

    /// The socket is writable. Returning `true` keeps write interest.
    fn on_write(&self) -> bool;
}

/// Which direction to re-arm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Read,
    Write,
}
