//! HTTP/1.1 framing: an incremental parser, a body writer and the
//! [`HttpDirect`] socket consumer that ties them to the event loop.

pub mod params;
pub mod parser;
pub mod head;
pub mod writer;
pub mod direct;

pub use direct::{BodyChunk, HttpDirect, HttpMessage};
pub use head::{format_head, reason_phrase, MessageHead};
pub use parser::{BodyBuf, HttpParser, Phase, Progress};
pub use writer::HttpWriter;
