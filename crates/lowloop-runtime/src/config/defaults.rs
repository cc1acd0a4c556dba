//! Library defaults for [`EngineConfig`](super::EngineConfig).

/// Blocking worker threads.
pub const NUM_WORKERS: usize = 4;

/// Create the fd 0/1/2 stream objects at start and on warm reset.
pub const STDIO_BASELINE: bool = true;

/// Route TERM/INT/HUP/USR1/USR2/PIPE/WINCH through the wake channel.
pub const INSTALL_SIGNALS: bool = true;

pub const LISTEN_BACKLOG: i32 = 511;

/// Bytes read per readiness event for direct-mode sockets.
pub const DIRECT_READ_CHUNK: usize = 1024;

/// Bytes read per readiness event for ordinary sockets.
pub const SOCKET_READ_CHUNK: usize = 64 * 1024;

/// Capacity of one HTTP header token block.
pub const HTTP_PARAM_BLOCK: usize = 10240;

pub const MAX_SLOTS: usize = 1 << 20;

/// Upper bound on one multiplexer wait when nothing else bounds it (ms).
pub const MAX_POLL_WAIT_MS: u64 = 60_000;

pub const MAX_WORKERS: usize = 256;
