//! The application pool: a bounded set of long-lived workers shared by all
//! request handlers.
//!
//! [`StandardPool`] is the in-process implementation; the
//! [`crate::server`] module splits the same contract across processes with
//! a dedicated pool-server process and thin clients.

mod cleaner;
mod interrupt;
mod list;
mod restart;
mod standard;

pub use interrupt::Interrupt;
pub use restart::{needs_restart, restart_file_path, RESTART_FILE};
pub use standard::{PoolStats, StandardPool};

use std::time::Duration;

use crate::error::Result;
use crate::session::Session;
use crate::spawn::SpawnOptions;

/// Construction-time pool limits.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Global cap on live workers.
    pub max: u32,
    /// Per-app cap on live workers. 0 means unbounded.
    pub max_per_app: u32,
    /// Idle workers older than this are evicted. Zero disables eviction.
    pub max_idle: Duration,
    /// How often the idle cleaner wakes.
    pub clean_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max: 20,
            max_per_app: 0,
            max_idle: Duration::from_secs(120),
            clean_interval: Duration::from_secs(2),
        }
    }
}

/// Parameters of one acquisition.
#[derive(Debug, Clone)]
pub struct GetOptions {
    /// What to hand the spawn service if a fresh worker is needed. The
    /// embedded `app_root` is the pool identity: it is treated as an opaque
    /// string, so non-canonical paths name distinct applications.
    pub spawn: SpawnOptions,
    /// Cancellation token observed while blocked.
    pub interrupt: Interrupt,
}

impl GetOptions {
    /// Options with conventional defaults for `app_root`.
    pub fn new(app_root: impl Into<String>) -> Self {
        Self {
            spawn: SpawnOptions::new(app_root),
            interrupt: Interrupt::new(),
        }
    }

    /// Attach a cancellation token.
    pub fn with_interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = interrupt;
        self
    }
}

impl From<SpawnOptions> for GetOptions {
    fn from(spawn: SpawnOptions) -> Self {
        Self {
            spawn,
            interrupt: Interrupt::new(),
        }
    }
}

/// The pool contract shared by the in-process pool and the client proxy.
///
/// All methods return `Result` because the proxy performs I/O for every
/// one of them. Apart from `get`, everything here exists for operators and
/// tests.
pub trait Pool: Send + Sync {
    /// Open a session with a worker for `opts.spawn.app_root`, spawning,
    /// reusing or sharing a worker as the pool sees fit.
    fn get(&self, opts: &GetOptions) -> Result<Session>;

    /// Discard every container and shut down every worker. Test hook.
    fn clear(&self) -> Result<()>;

    /// Set the global worker cap. Lowering it below the current count is
    /// allowed and takes effect through normal eviction.
    fn set_max(&self, max: u32) -> Result<()>;

    /// Set the per-app worker cap (0 = unbounded).
    fn set_max_per_app(&self, max_per_app: u32) -> Result<()>;

    /// Set the idle eviction horizon in seconds (0 disables eviction).
    fn set_max_idle_time(&self, seconds: u64) -> Result<()>;

    /// Number of containers with outstanding sessions.
    fn active(&self) -> Result<u32>;

    /// Total number of containers.
    fn count(&self) -> Result<u32>;

    /// Pid of the spawn server behind this pool.
    fn spawn_server_pid(&self) -> Result<i32>;
}
