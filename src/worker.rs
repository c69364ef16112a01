//! Handle to one live application worker process.

use std::io;
use std::os::unix::net::UnixStream;
use std::sync::Mutex;

use tracing::trace;

use crate::error::{Error, Result};
use crate::ipc::Channel;

/// Control-channel frame requesting a fresh session stream.
pub const SESSION_COMMAND: &str = "session";
/// Control-channel frame asking the worker to exit after in-flight work.
pub const SHUTDOWN_COMMAND: &str = "shutdown";

/// One running application process.
///
/// The handle owns the worker's control channel: a bidirectional stream set
/// up by the spawn service, over which the pool requests new sessions. The
/// worker process itself belongs to the spawn service; dropping the handle
/// closes the control channel, which is the worker's cue to exit once its
/// open sessions finish.
///
/// Handles are shared as `Arc<Worker>`: the pool's container holds one
/// reference and every outstanding [`crate::session::Session`] holds
/// another, so a worker survives pool-side eviction until its sessions are
/// done.
pub struct Worker {
    pid: i32,
    app_root: String,
    control: Mutex<Channel>,
}

impl Worker {
    /// Wrap a worker's pid, identity and control channel.
    pub fn new(pid: i32, app_root: impl Into<String>, control: Channel) -> Self {
        Self {
            pid,
            app_root: app_root.into(),
            control: Mutex::new(control),
        }
    }

    /// The worker's process id.
    pub fn pid(&self) -> i32 {
        self.pid
    }

    /// The application root this worker was spawned for.
    pub fn app_root(&self) -> &str {
        &self.app_root
    }

    /// Open a new session with this worker.
    ///
    /// Sends a `session` frame over the control channel and receives the
    /// session's stream as a passed file descriptor. Any failure here means
    /// the worker is unusable (typically: it died), and the pool discards
    /// the container in response.
    pub fn connect(&self) -> Result<UnixStream> {
        let mut control = self
            .control
            .lock()
            .map_err(|_| Error::Io(io::Error::other("worker control channel poisoned")))?;
        control.write_frame(&[SESSION_COMMAND])?;
        let reply = control.read_frame()?.ok_or_else(|| {
            Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "worker closed its control channel",
            ))
        })?;
        match reply.first().map(String::as_str) {
            Some("ok") => {}
            other => {
                return Err(Error::Protocol(format!(
                    "unexpected session reply from worker {}: {:?}",
                    self.pid, other
                )))
            }
        }
        let fd = control.recv_fd()?;
        trace!(pid = self.pid, app_root = %self.app_root, "opened worker session");
        Ok(UnixStream::from(fd))
    }

    /// Ask the worker to shut down. Best-effort: a dead worker is already
    /// what we wanted.
    pub fn shutdown(&self) {
        if let Ok(mut control) = self.control.lock() {
            let _ = control.write_frame(&[SHUTDOWN_COMMAND]);
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.shutdown();
        trace!(pid = self.pid, app_root = %self.app_root, "worker handle dropped");
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("pid", &self.pid)
            .field("app_root", &self.app_root)
            .finish()
    }
}
