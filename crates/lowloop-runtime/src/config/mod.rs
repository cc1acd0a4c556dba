//! Engine configuration
//!
//! Compile-time defaults with runtime environment overrides.
//!
//! # Configuration Priority (highest wins)
//!
//! 1. Builder calls
//! 2. Environment variables (`from_env()` only)
//! 3. Library defaults
//!
//! # Example
//!
//! ```rust,ignore
//! use lowloop_runtime::config::EngineConfig;
//!
//! let config = EngineConfig::from_env()
//!     .num_workers(2)
//!     .install_signals(false);
//! ```

pub mod defaults;

use std::time::Duration;

use lowloop_core::env::{env_get, env_get_bool};
use lowloop_core::{LoopError, LoopResult};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Blocking worker threads
    pub num_workers: usize,
    /// Recreate fd 0/1/2 stream objects at start and on reset
    pub stdio_baseline: bool,
    /// Install the process signal handlers
    pub install_signals: bool,
    pub listen_backlog: i32,
    pub direct_read_chunk: usize,
    pub socket_read_chunk: usize,
    pub http_param_block: usize,
    /// Retained-value slots before `retain` reports exhaustion
    pub max_slots: usize,
    /// Heap limit requested on the command line, recorded for the host
    pub max_heap: Option<usize>,
    pub max_poll_wait: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl EngineConfig {
    /// Defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `LOWLOOP_WORKERS` - Blocking worker threads
    /// - `LOWLOOP_STDIO` - Create stdio baseline (0/1)
    /// - `LOWLOOP_SIGNALS` - Install signal handlers (0/1)
    /// - `LOWLOOP_BACKLOG` - listen(2) backlog
    /// - `LOWLOOP_DIRECT_READ_CHUNK` - Direct-mode read size
    /// - `LOWLOOP_SOCKET_READ_CHUNK` - Socket read size
    /// - `LOWLOOP_HTTP_PARAM_BLOCK` - HTTP token block size
    /// - `LOWLOOP_MAX_SLOTS` - Retained-value slots
    /// - `LOWLOOP_MAX_HEAP` - Heap limit in MB
    /// - `LOWLOOP_MAX_POLL_WAIT_MS` - Upper bound on one poll wait
    pub fn from_env() -> Self {
        Self {
            num_workers: env_get("LOWLOOP_WORKERS", defaults::NUM_WORKERS),
            stdio_baseline: env_get_bool("LOWLOOP_STDIO", defaults::STDIO_BASELINE),
            install_signals: env_get_bool("LOWLOOP_SIGNALS", defaults::INSTALL_SIGNALS),
            listen_backlog: env_get("LOWLOOP_BACKLOG", defaults::LISTEN_BACKLOG),
            direct_read_chunk: env_get("LOWLOOP_DIRECT_READ_CHUNK", defaults::DIRECT_READ_CHUNK),
            socket_read_chunk: env_get("LOWLOOP_SOCKET_READ_CHUNK", defaults::SOCKET_READ_CHUNK),
            http_param_block: env_get("LOWLOOP_HTTP_PARAM_BLOCK", defaults::HTTP_PARAM_BLOCK),
            max_slots: env_get("LOWLOOP_MAX_SLOTS", defaults::MAX_SLOTS),
            max_heap: lowloop_core::env::env_get_opt("LOWLOOP_MAX_HEAP"),
            max_poll_wait: Duration::from_millis(env_get(
                "LOWLOOP_MAX_POLL_WAIT_MS",
                defaults::MAX_POLL_WAIT_MS,
            )),
        }
    }

    /// Library defaults only; ignores the environment. Used by tests.
    pub fn new() -> Self {
        Self {
            num_workers: defaults::NUM_WORKERS,
            stdio_baseline: defaults::STDIO_BASELINE,
            install_signals: defaults::INSTALL_SIGNALS,
            listen_backlog: defaults::LISTEN_BACKLOG,
            direct_read_chunk: defaults::DIRECT_READ_CHUNK,
            socket_read_chunk: defaults::SOCKET_READ_CHUNK,
            http_param_block: defaults::HTTP_PARAM_BLOCK,
            max_slots: defaults::MAX_SLOTS,
            max_heap: None,
            max_poll_wait: Duration::from_millis(defaults::MAX_POLL_WAIT_MS),
        }
    }

    // Builder methods

    pub fn num_workers(mut self, n: usize) -> Self {
        self.num_workers = n;
        self
    }

    pub fn stdio_baseline(mut self, on: bool) -> Self {
        self.stdio_baseline = on;
        self
    }

    pub fn install_signals(mut self, on: bool) -> Self {
        self.install_signals = on;
        self
    }

    pub fn listen_backlog(mut self, backlog: i32) -> Self {
        self.listen_backlog = backlog;
        self
    }

    pub fn direct_read_chunk(mut self, size: usize) -> Self {
        self.direct_read_chunk = size;
        self
    }

    pub fn socket_read_chunk(mut self, size: usize) -> Self {
        self.socket_read_chunk = size;
        self
    }

    pub fn http_param_block(mut self, size: usize) -> Self {
        self.http_param_block = size;
        self
    }

    pub fn max_slots(mut self, n: usize) -> Self {
        self.max_slots = n;
        self
    }

    pub fn max_heap(mut self, mb: Option<usize>) -> Self {
        self.max_heap = mb;
        self
    }

    pub fn max_poll_wait(mut self, d: Duration) -> Self {
        self.max_poll_wait = d;
        self
    }

    /// Reject configurations the engine cannot start with.
    pub fn validate(&self) -> LoopResult<()> {
        if self.num_workers == 0 {
            return Err(LoopError::Fatal("num_workers must be > 0".into()));
        }
        if self.num_workers > defaults::MAX_WORKERS {
            return Err(LoopError::Fatal(format!(
                "num_workers must be <= {}",
                defaults::MAX_WORKERS
            )));
        }
        if self.direct_read_chunk == 0 || self.socket_read_chunk == 0 {
            return Err(LoopError::Fatal("read chunk sizes must be > 0".into()));
        }
        // A block must hold at least one maximal token plus its length byte.
        if self.http_param_block < 256 {
            return Err(LoopError::Fatal("http_param_block must be >= 256".into()));
        }
        if self.max_slots == 0 {
            return Err(LoopError::Fatal("max_slots must be > 0".into()));
        }
        Ok(())
    }

    /// Dump to stderr (debug aid).
    pub fn print(&self) {
        eprintln!("lowloop configuration:");
        eprintln!("  num_workers:        {}", self.num_workers);
        eprintln!("  stdio_baseline:     {}", self.stdio_baseline);
        eprintln!("  install_signals:    {}", self.install_signals);
        eprintln!("  listen_backlog:     {}", self.listen_backlog);
        eprintln!("  direct_read_chunk:  {}", self.direct_read_chunk);
        eprintln!("  socket_read_chunk:  {}", self.socket_read_chunk);
        eprintln!("  http_param_block:   {}", self.http_param_block);
        eprintln!("  max_slots:          {}", self.max_slots);
        eprintln!("  max_heap:           {:?}", self.max_heap);
        eprintln!("  max_poll_wait:      {:?}", self.max_poll_wait);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = EngineConfig::new();
        assert_eq!(config.num_workers, 4);
        assert_eq!(config.direct_read_chunk, 1024);
        assert_eq!(config.http_param_block, 10240);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = EngineConfig::new()
            .num_workers(1)
            .install_signals(false)
            .max_heap(Some(64));
        assert_eq!(config.num_workers, 1);
        assert!(!config.install_signals);
        assert_eq!(config.max_heap, Some(64));
    }

    #[test]
    fn test_validation() {
        assert!(EngineConfig::new().num_workers(0).validate().is_err());
        assert!(EngineConfig::new().num_workers(1000).validate().is_err());
        assert!(EngineConfig::new().http_param_block(16).validate().is_err());
    }
}
