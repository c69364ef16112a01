//! Command-line interface definitions using clap.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::logging::{self, LogConfig, LogFormat, LogRotation};
use crate::paths;
use crate::version;

/// appool - application pool server
#[derive(Parser, Debug)]
#[command(name = "appool")]
#[command(author, version = version::clap_version(), about, long_about = None)]
pub struct Cli {
    /// Log level: error, warn, info, debug, trace.
    #[arg(long, env = "APPOOL_LOG_LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Log format: pretty, compact, json.
    #[arg(long, env = "APPOOL_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Log to file (in addition to stderr).
    #[arg(long, env = "APPOOL_LOG_FILE", global = true)]
    pub log_file: Option<PathBuf>,

    /// Log rotation: hourly, daily, never.
    #[arg(long, env = "APPOOL_LOG_ROTATION", default_value = "daily", global = true)]
    pub log_rotation: String,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the pool server.
    Serve(ServeArgs),

    /// Print installation details.
    Config(ConfigArgs),
}

/// Arguments for the pool server.
#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Unix socket path to listen on.
    #[arg(long, env = "APPOOL_SOCKET", default_value_os_t = paths::default_socket_path())]
    pub socket: PathBuf,

    /// Spawn server command: program followed by its arguments.
    #[arg(long = "spawn-server", num_args = 1.., required = true, value_name = "COMMAND")]
    pub spawn_server: Vec<String>,

    /// Global cap on live workers.
    #[arg(long, env = "APPOOL_MAX", default_value_t = 20)]
    pub max: u32,

    /// Per-app cap on live workers (0 = unbounded).
    #[arg(long, env = "APPOOL_MAX_PER_APP", default_value_t = 0)]
    pub max_per_app: u32,

    /// Seconds a worker may stay idle before eviction (0 = never).
    #[arg(long, env = "APPOOL_MAX_IDLE_TIME", default_value_t = 120)]
    pub max_idle_time: u64,
}

/// Arguments for `appool config`.
#[derive(Args, Debug)]
pub struct ConfigArgs {
    /// Print the installation root.
    #[arg(long)]
    pub root: bool,

    /// Print the version string.
    #[arg(long)]
    pub version: bool,
}

impl Cli {
    /// Build the logging configuration from flags plus env overrides.
    pub fn log_config(&self) -> LogConfig {
        let mut config = LogConfig::new();
        if let Some(ref level) = self.log_level
            && let Some(level) = logging::parse_level(level)
        {
            config = config.with_level(level);
        }
        if let Some(ref format) = self.log_format
            && let Ok(format) = format.parse::<LogFormat>()
        {
            config = config.with_format(format);
        }
        if let Some(ref path) = self.log_file {
            config = config.with_file(path.clone());
        }
        if let Ok(rotation) = self.log_rotation.parse::<LogRotation>() {
            config = config.with_rotation(rotation);
        }
        config.with_env_overrides()
    }
}
