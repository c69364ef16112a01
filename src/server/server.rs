//! The pool-server process: one `StandardPool` shared by many clients.
//!
//! The server listens on a filesystem socket. Each accepted connection is
//! served by its own thread running a sequential command loop; the session
//! streams themselves never pass through the server, only their file
//! descriptors do. A connection's outstanding sessions are released when
//! the client closes them explicitly or when the connection drops.

use std::collections::HashMap;
use std::fs;
use std::os::fd::AsFd;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::ipc::Channel;
use crate::pool::{GetOptions, Pool};
use crate::server::protocol::{Command, Response};
use crate::session::Session;

static CONNECTION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Hosts a pool behind a Unix socket.
pub struct PoolServer {
    pool: Arc<dyn Pool>,
    listener: UnixListener,
    socket_path: PathBuf,
}

impl PoolServer {
    /// Bind the server socket. Replaces a stale socket file and restricts
    /// the new one to the owning user.
    pub fn bind(pool: Arc<dyn Pool>, socket_path: impl Into<PathBuf>) -> Result<Self> {
        let socket_path = socket_path.into();
        if let Some(parent) = socket_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| Error::System {
                    op: "create socket directory",
                    path: parent.to_path_buf(),
                    source: e,
                })?;
            }
        }
        match fs::remove_file(&socket_path) {
            Ok(()) => debug!(path = %socket_path.display(), "removed stale socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(Error::System {
                    op: "remove stale socket",
                    path: socket_path,
                    source: e,
                })
            }
        }
        let listener = UnixListener::bind(&socket_path).map_err(|e| Error::System {
            op: "bind socket",
            path: socket_path.clone(),
            source: e,
        })?;
        fs::set_permissions(&socket_path, fs::Permissions::from_mode(0o600)).map_err(|e| {
            Error::System {
                op: "restrict socket permissions",
                path: socket_path.clone(),
                source: e,
            }
        })?;
        Ok(Self {
            pool,
            listener,
            socket_path,
        })
    }

    /// The path the server is listening on.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Accept and serve connections until the listener fails.
    pub fn run(&self) -> Result<()> {
        info!(path = %self.socket_path.display(), "pool server listening");
        loop {
            let (stream, _addr) = self.listener.accept()?;
            if !peer_authorized(&stream) {
                warn!("rejected pool connection from another user");
                continue;
            }
            let pool = self.pool.clone();
            let id = CONNECTION_COUNTER.fetch_add(1, Ordering::Relaxed);
            thread::Builder::new()
                .name(format!("pool-conn-{}", id))
                .spawn(move || {
                    debug!(connection = id, "client connected");
                    if let Err(e) = serve_connection(pool, stream) {
                        debug!(connection = id, error = %e, "connection ended with error");
                    } else {
                        debug!(connection = id, "client disconnected");
                    }
                })
                .map_err(|e| Error::System {
                    op: "spawn connection thread for",
                    path: self.socket_path.clone(),
                    source: e,
                })?;
        }
    }
}

impl Drop for PoolServer {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.socket_path);
    }
}

/// Only the user the server runs as may talk to it. The socket mode is the
/// first gate; peer credentials close the hole of a pre-made connection.
#[cfg(target_os = "linux")]
fn peer_authorized(stream: &UnixStream) -> bool {
    use nix::sys::socket::{getsockopt, sockopt::PeerCredentials};
    match getsockopt(stream, PeerCredentials) {
        Ok(cred) => cred.uid() == nix::unistd::Uid::effective().as_raw(),
        Err(_) => false,
    }
}

#[cfg(not(target_os = "linux"))]
fn peer_authorized(_stream: &UnixStream) -> bool {
    // The 0600 socket mode is the gate on platforms without SO_PEERCRED.
    true
}

/// Sequential command loop for one client connection.
fn serve_connection(pool: Arc<dyn Pool>, stream: UnixStream) -> Result<()> {
    let mut channel = Channel::new(stream);
    // Sessions handed to this client, released on `close` or disconnect.
    let mut sessions: HashMap<u64, Session> = HashMap::new();
    let mut next_session_id: u64 = 1;

    while let Some(frame) = channel.read_frame()? {
        let command = match Command::from_frame(&frame) {
            Ok(command) => command,
            Err(e) => {
                // A client this confused gets one error and the boot.
                write_error(&mut channel, &e)?;
                break;
            }
        };
        match command {
            Command::Get(spawn) => {
                let opts = GetOptions::from(spawn);
                match pool.get(&opts) {
                    Ok(mut session) => {
                        let session_id = next_session_id;
                        next_session_id += 1;
                        write_response(
                            &mut channel,
                            &Response::Session {
                                pid: session.pid(),
                                session_id,
                            },
                        )?;
                        {
                            let stream = session
                                .stream()
                                .expect("freshly acquired session has a stream");
                            channel.send_fd(stream.as_fd())?;
                        }
                        // The client owns the stream now; we keep only the
                        // release bookkeeping.
                        session.close_stream();
                        sessions.insert(session_id, session);
                    }
                    Err(Error::Busy) => write_response(&mut channel, &Response::Busy)?,
                    Err(e) => write_error(&mut channel, &e)?,
                }
            }
            Command::Close { session_id } => {
                sessions.remove(&session_id);
                write_response(&mut channel, &Response::Ok)?;
            }
            Command::Clear => write_ack(&mut channel, pool.clear())?,
            Command::SetMax(n) => write_ack(&mut channel, pool.set_max(n))?,
            Command::SetMaxPerApp(n) => write_ack(&mut channel, pool.set_max_per_app(n))?,
            Command::SetMaxIdleTime(secs) => {
                write_ack(&mut channel, pool.set_max_idle_time(secs))?
            }
            Command::GetActive => write_value(&mut channel, pool.active().map(i64::from))?,
            Command::GetCount => write_value(&mut channel, pool.count().map(i64::from))?,
            Command::GetSpawnServerPid => {
                write_value(&mut channel, pool.spawn_server_pid().map(i64::from))?
            }
        }
    }
    // Dropping `sessions` releases everything the client still held.
    Ok(())
}

fn write_response(channel: &mut Channel, response: &Response) -> Result<()> {
    let frame = response.to_frame();
    let refs: Vec<&str> = frame.iter().map(String::as_str).collect();
    channel.write_frame(&refs)?;
    Ok(())
}

fn write_error(channel: &mut Channel, error: &Error) -> Result<()> {
    let page = error.error_page().map(str::to_owned);
    write_response(
        channel,
        &Response::Error {
            kind: error.wire_kind().to_string(),
            message: error.to_string(),
            has_page: page.is_some(),
        },
    )?;
    if let Some(page) = page {
        channel.write_scalar(page.as_bytes())?;
    }
    Ok(())
}

fn write_ack(channel: &mut Channel, result: Result<()>) -> Result<()> {
    match result {
        Ok(()) => write_response(channel, &Response::Ok),
        Err(e) => write_error(channel, &e),
    }
}

fn write_value(channel: &mut Channel, result: Result<i64>) -> Result<()> {
    match result {
        Ok(value) => write_response(channel, &Response::Value(value)),
        Err(e) => write_error(channel, &e),
    }
}
