//! # lowloop-net
//!
//! Network objects for the lowloop engine:
//! - TCP sockets with callback or direct delivery, optionally over TLS
//! - listeners (plain, TLS, or with an HTTP framer per connection)
//! - UDP datagram sockets
//! - HTTP/1.1 parsing and writing

mod addr;
pub mod socket;
pub mod tls;
pub mod listener;
pub mod datagram;
pub mod http;

// Re-exports
pub use addr::family_number;
pub use datagram::Datagram;
pub use http::{BodyChunk, HttpDirect, HttpMessage, MessageHead};
pub use listener::{Connection, ListenOptions, Listener};
pub use socket::{Socket, SocketDirect, SocketInfo, SocketPhase, Trigger};
pub use tls::{TlsContext, TlsSession};
