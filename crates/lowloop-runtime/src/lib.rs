//! # lowloop-runtime
//!
//! The engine behind lowloop:
//! - the event loop on the caller's thread (completions, timers, next ticks)
//! - the `lowloop-mux` readiness thread and its poll set
//! - the `lowloop-worker-N` pool for blocking syscalls
//! - file and DNS operations built on the pool
//! - process signal relay through the wake pipe

pub mod config;
pub mod wake;
pub mod signal;
pub mod timer;
pub mod registry;
pub mod completion;
pub mod pool;
pub mod mux;
pub mod event_loop;
pub mod engine;
pub mod blocking;
pub mod fs;
pub mod dns;
pub mod stdio;

// Re-exports
pub use blocking::{BlockingOp, FnOp, PendingJob};
pub use completion::{CompletionQueue, LoopCallback};
pub use config::EngineConfig;
pub use dns::Family;
pub use engine::{Engine, EngineHandle};
pub use event_loop::{Callback, DefaultHost, Handler, LoopContext, LoopHost};
pub use fs::{FileHandle, FileStat, OpenFlags};
pub use mux::PollSource;
pub use pool::{Lane, WorkItem};
pub use registry::Registry;
