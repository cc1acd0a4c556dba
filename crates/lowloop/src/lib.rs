//! # lowloop - embeddable event loop
//!
//! One loop thread runs every callback. Readiness waits happen on a
//! dedicated multiplexer thread and blocking syscalls on a worker pool;
//! both hand results back through the completion queue.
//!
//! ## Quick Start
//!
//! ```ignore
//! use lowloop::{DefaultHost, Engine, EngineConfig, ListenOptions, Listener};
//!
//! fn main() -> lowloop::LoopResult<()> {
//!     let mut engine = Engine::new(EngineConfig::from_env(), Box::new(DefaultHost))?;
//!     engine.with_context(|cx| {
//!         let options = ListenOptions { http: true, ..Default::default() };
//!         Listener::bind(cx, "127.0.0.1:8080".parse().unwrap(), options, |cx, conn| {
//!             let http = conn?.http.unwrap();
//!             let h = http.clone();
//!             http.on_message(cx, move |cx, msg| {
//!                 msg?;
//!                 h.respond(cx, 200, &[], b"hello\n".to_vec(), |_, res| res)
//!             })
//!         })
//!     })?;
//!     engine.run()?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │          Loop thread (Engine::run, caller's thread)       │
//! │   completions, timers, next ticks, retained callbacks     │
//! └──────────────────────────────────────────────────────────┘
//!        ▲ completion queue + wake pipe          ▲
//!        │                                       │
//! ┌──────────────┐                      ┌──────────────────────┐
//! │ lowloop-mux  │                      │ lowloop-worker-N     │
//! │ poll(2) set  │                      │ read / modify lanes  │
//! └──────────────┘                      └──────────────────────┘
//! ```

// Re-export the building blocks
pub use lowloop_core as core;
pub use lowloop_net as net;
pub use lowloop_runtime as runtime;

// Re-export core types
pub use lowloop_core::{
    Descriptor,
    DescriptorKind,
    ErrorKind,
    Interest,
    LoopError,
    LoopResult,
    Pollable,
    QueueLink,
    SlotId,
};

// Re-export kprint macros for debug logging
pub use lowloop_core::{kprint, kprintln, kerror, kwarn, kinfo, kdebug, ktrace};
pub use lowloop_core::kprint::{LogLevel, init as init_logging, set_log_level, set_flush_enabled};

// Re-export env utilities
pub use lowloop_core::env::{env_get, env_get_bool, env_get_opt, env_get_str, env_is_set};

// Re-export runtime types
pub use lowloop_runtime::{
    DefaultHost,
    Engine,
    EngineConfig,
    EngineHandle,
    FileHandle,
    FileStat,
    LoopCallback,
    LoopContext,
    LoopHost,
    OpenFlags,
};

// Re-export network types
pub use lowloop_net::{
    BodyChunk,
    Connection,
    Datagram,
    HttpDirect,
    HttpMessage,
    ListenOptions,
    Listener,
    MessageHead,
    Socket,
    SocketDirect,
    TlsContext,
};

/// Crate version, as reported by `lowloop-httpd --version`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
