//! Restart-trigger detection.
//!
//! A deploy requests a code reload by touching (or leaving behind)
//! `{app_root}/tmp/restart.txt`. Deleting the file is the primary
//! acknowledgement; when the file cannot be deleted (read-only filesystem,
//! permissions), its mtime is tracked instead so each touch triggers at
//! most one restart.

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::debug;

/// Trigger file path, relative to the app root.
pub const RESTART_FILE: &str = "tmp/restart.txt";

/// Location of the restart trigger for `app_root`.
pub fn restart_file_path(app_root: &str) -> PathBuf {
    Path::new(app_root).join(RESTART_FILE)
}

/// Whether `app_root` has requested a restart.
///
/// `mtimes` is the pool's record of trigger mtimes for apps whose trigger
/// file could not be deleted. Filesystem failures never propagate: a failed
/// stat is treated as "no trigger file".
pub fn needs_restart(app_root: &str, mtimes: &mut HashMap<String, SystemTime>) -> bool {
    let path = restart_file_path(app_root);

    let meta = match fs::metadata(&path) {
        Ok(meta) => meta,
        Err(_) => {
            mtimes.remove(app_root);
            return false;
        }
    };

    match fs::remove_file(&path) {
        Ok(()) => {
            debug!(app_root, "restart requested (trigger file deleted)");
            mtimes.remove(app_root);
            true
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {
            // Lost a race with another deleter; the trigger still counts.
            mtimes.remove(app_root);
            true
        }
        Err(_) => {
            // Undeletable trigger: restart once per observed mtime.
            let mtime = meta.modified().unwrap_or(UNIX_EPOCH);
            let changed = mtimes.get(app_root) != Some(&mtime);
            mtimes.insert(app_root.to_string(), mtime);
            if changed {
                debug!(app_root, "restart requested (trigger file mtime changed)");
            }
            changed
        }
    }
}
