//! The spawn-service contract and its out-of-process client.
//!
//! Spawning an application instance is slow and framework-specific, so it
//! lives in a separate spawn server. The pool only needs the thin contract
//! modelled by [`SpawnService`]: fabricate a worker for an app root, and
//! request a code reload. [`SpawnServiceClient`] speaks to a real spawn
//! server subprocess; tests substitute their own implementations.

use std::io::{BufRead, BufReader};
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::process::{Child, Command, Stdio};
use std::str::FromStr;
use std::time::{Duration, Instant};

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::ipc::Channel;
use crate::worker::Worker;

/// How the spawn server should bring up a new worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpawnMethod {
    /// Fork from a preloaded framework image.
    #[default]
    Smart,
    /// Boot every worker from scratch.
    Conservative,
}

impl SpawnMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Smart => "smart",
            Self::Conservative => "conservative",
        }
    }
}

impl FromStr for SpawnMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "smart" => Ok(Self::Smart),
            "conservative" => Ok(Self::Conservative),
            _ => Err(Error::Config(format!("unknown spawn method: {:?}", s))),
        }
    }
}

impl std::fmt::Display for SpawnMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The application framework family a worker hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AppType {
    #[default]
    Rails,
    Rack,
    Wsgi,
}

impl AppType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rails => "rails",
            Self::Rack => "rack",
            Self::Wsgi => "wsgi",
        }
    }
}

impl FromStr for AppType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "rails" => Ok(Self::Rails),
            "rack" => Ok(Self::Rack),
            "wsgi" => Ok(Self::Wsgi),
            _ => Err(Error::Config(format!("unknown app type: {:?}", s))),
        }
    }
}

impl std::fmt::Display for AppType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything the spawn service needs to bring up one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnOptions {
    /// Application root. Treated as an opaque identity; callers canonicalize.
    pub app_root: String,
    /// Drop privileges in the spawned worker.
    pub lower_privilege: bool,
    /// Fallback user when privilege lowering fails.
    pub lowest_user: String,
    /// RAILS_ENV/RACK_ENV-style environment name. Never empty.
    pub environment: String,
    pub spawn_method: SpawnMethod,
    pub app_type: AppType,
}

impl SpawnOptions {
    /// Options with the conventional defaults for `app_root`.
    pub fn new(app_root: impl Into<String>) -> Self {
        Self {
            app_root: app_root.into(),
            lower_privilege: true,
            lowest_user: "nobody".into(),
            environment: "production".into(),
            spawn_method: SpawnMethod::default(),
            app_type: AppType::default(),
        }
    }
}

/// The contract the pool consumes.
///
/// Methods take `&mut self` because the pool serializes all spawn-service
/// traffic under its own lock.
pub trait SpawnService: Send {
    /// Fabricate a fresh worker for `opts.app_root`.
    fn spawn_worker(&mut self, opts: &SpawnOptions) -> Result<Worker>;

    /// Tell the service to drop any cached code for `app_root` so the next
    /// spawn picks up the deployed version.
    fn reload(&mut self, app_root: &str) -> Result<()>;

    /// The spawn server's pid, for diagnostics.
    fn server_pid(&self) -> i32;
}

/// Grace period between asking the spawn server to exit and killing it.
const EXIT_GRACE: Duration = Duration::from_secs(2);

/// Client for an external spawn-server process.
///
/// The server is started as a subprocess with one end of a socketpair as
/// its stdin; worker control descriptors travel back over that socket as
/// ancillary data. Its stderr is drained into our log.
#[derive(Debug)]
pub struct SpawnServiceClient {
    child: Child,
    channel: Channel,
}

impl SpawnServiceClient {
    /// Start the spawn server from `command` (program plus arguments).
    pub fn new(command: &[String]) -> Result<Self> {
        let program = command
            .first()
            .ok_or_else(|| Error::Config("empty spawn server command".into()))?;

        let (ours, theirs) = UnixStream::pair()?;
        let mut cmd = Command::new(program);
        cmd.args(&command[1..])
            .stdin(Stdio::from(OwnedFd::from(theirs)))
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| Error::Spawn {
            message: format!("cannot start spawn server {:?}: {}", program, e),
            page: None,
        })?;

        if let Some(stderr) = child.stderr.take() {
            let pid = child.id();
            std::thread::Builder::new()
                .name(format!("spawn-server-{}-stderr", pid))
                .spawn(move || log_spawn_server_stderr(pid, stderr))
                .ok();
        }

        debug!(pid = child.id(), program = %program, "spawn server started");
        Ok(Self {
            child,
            channel: Channel::new(ours),
        })
    }

    fn read_spawn_reply(&mut self, app_root: &str) -> Result<Worker> {
        let reply = self.channel.read_frame()?.ok_or_else(|| Error::Spawn {
            message: "spawn server exited unexpectedly".into(),
            page: None,
        })?;
        match reply[0].as_str() {
            "ok" => {
                let pid: i32 = reply
                    .get(1)
                    .and_then(|p| p.parse().ok())
                    .ok_or_else(|| Error::Protocol("spawn reply carries no pid".into()))?;
                let fd = self.channel.recv_fd()?;
                Ok(Worker::new(pid, app_root, Channel::new(UnixStream::from(fd))))
            }
            "error" => {
                let has_page = reply.last().map(String::as_str) == Some("data");
                let message = reply[1..reply.len() - usize::from(has_page)].join(" ");
                let page = if has_page {
                    let bytes = self.channel.read_scalar()?.unwrap_or_default();
                    Some(String::from_utf8_lossy(&bytes).into_owned())
                } else {
                    None
                };
                Err(Error::Spawn { message, page })
            }
            other => Err(Error::Protocol(format!(
                "unexpected spawn reply: {:?}",
                other
            ))),
        }
    }
}

impl SpawnService for SpawnServiceClient {
    fn spawn_worker(&mut self, opts: &SpawnOptions) -> Result<Worker> {
        self.channel.write_frame(&[
            "spawn",
            &opts.app_root,
            if opts.lower_privilege { "1" } else { "0" },
            &opts.lowest_user,
            &opts.environment,
            opts.spawn_method.as_str(),
            opts.app_type.as_str(),
        ])?;
        self.read_spawn_reply(&opts.app_root)
    }

    fn reload(&mut self, app_root: &str) -> Result<()> {
        self.channel.write_frame(&["reload", app_root])?;
        Ok(())
    }

    fn server_pid(&self) -> i32 {
        self.child.id() as i32
    }
}

impl Drop for SpawnServiceClient {
    fn drop(&mut self) {
        // Ask nicely, then escalate.
        let _ = self.channel.write_frame(&["exit"]);
        let deadline = Instant::now() + EXIT_GRACE;
        while Instant::now() < deadline {
            match self.child.try_wait() {
                Ok(Some(_)) => return,
                Ok(None) => std::thread::sleep(Duration::from_millis(10)),
                Err(_) => return,
            }
        }
        let pid = Pid::from_raw(self.child.id() as i32);
        let _ = signal::kill(pid, Signal::SIGTERM);
        std::thread::sleep(Duration::from_millis(100));
        if let Ok(None) = self.child.try_wait() {
            let _ = self.child.kill();
        }
        let _ = self.child.wait();
    }
}

/// Forward the spawn server's stderr lines into our log, classified by the
/// conventional `error:`/`warning:` prefixes frameworks print.
fn log_spawn_server_stderr(pid: u32, stderr: std::process::ChildStderr) {
    let reader = BufReader::new(stderr);
    for line in reader.lines() {
        let line = match line {
            Ok(l) => l,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }
        let lower = line.to_lowercase();
        if lower.contains("error:") {
            warn!(spawn_server_pid = pid, "{}", line);
        } else {
            debug!(spawn_server_pid = pid, "{}", line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_method_and_app_type_parse() {
        assert_eq!("smart".parse::<SpawnMethod>().unwrap(), SpawnMethod::Smart);
        assert_eq!(
            "conservative".parse::<SpawnMethod>().unwrap(),
            SpawnMethod::Conservative
        );
        assert!("eager".parse::<SpawnMethod>().is_err());

        assert_eq!("rack".parse::<AppType>().unwrap(), AppType::Rack);
        assert_eq!("wsgi".parse::<AppType>().unwrap(), AppType::Wsgi);
        assert!("php".parse::<AppType>().is_err());
    }

    #[test]
    fn spawn_options_defaults() {
        let opts = SpawnOptions::new("/srv/app");
        assert!(opts.lower_privilege);
        assert_eq!(opts.lowest_user, "nobody");
        assert_eq!(opts.environment, "production");
        assert_eq!(opts.spawn_method, SpawnMethod::Smart);
        assert_eq!(opts.app_type, AppType::Rails);
    }

    #[test]
    fn missing_spawn_server_program_is_a_spawn_error() {
        let err = SpawnServiceClient::new(&["/nonexistent/spawn-server".into()]).unwrap_err();
        assert!(matches!(err, Error::Spawn { .. }));
    }

    #[test]
    fn empty_command_is_a_config_error() {
        let err = SpawnServiceClient::new(&[]).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn server_exit_surfaces_as_spawn_error() {
        // `true` exits immediately, so the spawn request sees EOF.
        let mut client = SpawnServiceClient::new(&["true".into()]).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        let err = client.spawn_worker(&SpawnOptions::new("/srv/app")).unwrap_err();
        match err {
            Error::Spawn { .. } | Error::Io(_) => {}
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
