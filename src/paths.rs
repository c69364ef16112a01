//! Filesystem locations used by appool.

use std::path::PathBuf;

/// The installation root: the directory the `bin/` holding our executable
/// lives under, falling back to the executable's own directory.
pub fn install_root() -> PathBuf {
    let exe = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("."));
    let bin_dir = exe.parent().map(PathBuf::from).unwrap_or_default();
    match bin_dir.file_name().and_then(|n| n.to_str()) {
        Some("bin") => bin_dir.parent().map(PathBuf::from).unwrap_or(bin_dir),
        _ => bin_dir,
    }
}

/// Runtime directory for sockets and similar transient state.
///
/// `XDG_RUNTIME_DIR` when available, the system temp directory otherwise.
pub fn runtime_dir() -> PathBuf {
    dirs::runtime_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("appool")
}

/// Default pool-server socket path.
pub fn default_socket_path() -> PathBuf {
    runtime_dir().join("pool.sock")
}
