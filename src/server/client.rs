//! In-process proxy to a remote pool server.

use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::ipc::Channel;
use crate::pool::{GetOptions, Pool};
use crate::server::protocol::{Command, Response};
use crate::session::{ReleaseHook, Session};

/// Implements [`Pool`] by forwarding every call to a pool server over one
/// connection. Exchanges are serialized on the connection; concurrent
/// callers simply queue on the internal mutex.
pub struct PoolClient {
    channel: Arc<Mutex<Channel>>,
}

impl PoolClient {
    /// Connect to the pool server listening at `socket_path`.
    pub fn connect(socket_path: impl AsRef<Path>) -> Result<Self> {
        let socket_path = socket_path.as_ref();
        let stream = UnixStream::connect(socket_path).map_err(|e| Error::System {
            op: "connect to pool server at",
            path: socket_path.to_path_buf(),
            source: e,
        })?;
        debug!(path = %socket_path.display(), "connected to pool server");
        Ok(Self::from_stream(stream))
    }

    /// Wrap an already-connected stream (tests, socketpair setups).
    pub fn from_stream(stream: UnixStream) -> Self {
        Self {
            channel: Arc::new(Mutex::new(Channel::new(stream))),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Channel>> {
        self.channel
            .lock()
            .map_err(|_| Error::Io(std::io::Error::other("pool client channel poisoned")))
    }

    /// Send `command`, read the response frame, surface wire errors.
    fn exchange(channel: &mut Channel, command: &Command) -> Result<Response> {
        let frame = command.to_frame();
        let refs: Vec<&str> = frame.iter().map(String::as_str).collect();
        channel.write_frame(&refs)?;
        let reply = channel.read_frame()?.ok_or_else(|| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "pool server closed the connection",
            ))
        })?;
        match Response::from_frame(&reply)? {
            Response::Error {
                kind,
                message,
                has_page,
            } => {
                let page = if has_page {
                    let bytes = channel.read_scalar()?.unwrap_or_default();
                    Some(String::from_utf8_lossy(&bytes).into_owned())
                } else {
                    None
                };
                Err(Error::from_wire(&kind, message, page))
            }
            Response::Busy => Err(Error::Busy),
            response => Ok(response),
        }
    }

    fn request_ok(&self, command: Command) -> Result<()> {
        let mut channel = self.lock()?;
        match Self::exchange(&mut channel, &command)? {
            Response::Ok => Ok(()),
            other => Err(Error::Protocol(format!(
                "expected plain ok, got {:?}",
                other
            ))),
        }
    }

    fn request_value(&self, command: Command) -> Result<i64> {
        let mut channel = self.lock()?;
        match Self::exchange(&mut channel, &command)? {
            Response::Value(value) => Ok(value),
            other => Err(Error::Protocol(format!(
                "expected a numeric response, got {:?}",
                other
            ))),
        }
    }
}

impl Pool for PoolClient {
    fn get(&self, opts: &GetOptions) -> Result<Session> {
        let mut channel = self.lock()?;
        match Self::exchange(&mut channel, &Command::Get(opts.spawn.clone()))? {
            Response::Session { pid, session_id } => {
                let fd = channel.recv_fd()?;
                drop(channel);
                trace!(pid, session_id, app_root = %opts.spawn.app_root, "session received");
                let hook = close_hook(Arc::downgrade(&self.channel), session_id);
                Ok(Session::new(UnixStream::from(fd), pid, Some(hook)))
            }
            other => Err(Error::Protocol(format!(
                "unexpected get response: {:?}",
                other
            ))),
        }
    }

    fn clear(&self) -> Result<()> {
        self.request_ok(Command::Clear)
    }

    fn set_max(&self, max: u32) -> Result<()> {
        self.request_ok(Command::SetMax(max))
    }

    fn set_max_per_app(&self, max_per_app: u32) -> Result<()> {
        self.request_ok(Command::SetMaxPerApp(max_per_app))
    }

    fn set_max_idle_time(&self, seconds: u64) -> Result<()> {
        self.request_ok(Command::SetMaxIdleTime(seconds))
    }

    fn active(&self) -> Result<u32> {
        let value = self.request_value(Command::GetActive)?;
        u32::try_from(value).map_err(|_| Error::Protocol(format!("bad active count: {value}")))
    }

    fn count(&self) -> Result<u32> {
        let value = self.request_value(Command::GetCount)?;
        u32::try_from(value).map_err(|_| Error::Protocol(format!("bad count: {value}")))
    }

    fn spawn_server_pid(&self) -> Result<i32> {
        let value = self.request_value(Command::GetSpawnServerPid)?;
        i32::try_from(value)
            .map_err(|_| Error::Protocol(format!("bad spawn server pid: {value}")))
    }
}

/// On session drop, tell the server to release the slot. Holds the
/// connection weakly: a session dropped after its client is gone does
/// nothing.
fn close_hook(weak: Weak<Mutex<Channel>>, session_id: u64) -> ReleaseHook {
    Box::new(move || {
        let Some(channel) = weak.upgrade() else {
            return;
        };
        let Ok(mut channel) = channel.lock() else {
            return;
        };
        let frame = Command::Close { session_id }.to_frame();
        let refs: Vec<&str> = frame.iter().map(String::as_str).collect();
        if channel.write_frame(&refs).is_ok() {
            // Consume the acknowledgement to keep the stream in sync.
            let _ = channel.read_frame();
        }
    })
}
