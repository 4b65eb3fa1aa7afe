//! Advisory pidfile for `rasoom serve`.

use std::io::Write;
use std::path::{Path, PathBuf};

/// Note any live server already using the data dir, clear a stale pidfile,
/// then write ours. `None` when the file cannot be written.
pub fn acquire(path: &Path) -> Option<PathBuf> {
    if let Ok(content) = std::fs::read_to_string(path)
        && let Ok(pid) = content.trim().parse::<u32>()
    {
        if is_process_alive(pid) {
            tracing::warn!(pid, "another rasoom serve is running on this data dir");
        } else {
            tracing::info!(pid, "cleaned up stale pidfile");
            let _ = std::fs::remove_file(path);
        }
    }

    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    match std::fs::File::create(path) {
        Ok(mut f) => {
            let _ = write!(f, "{}", std::process::id());
            tracing::info!("wrote pidfile: {}", path.display());
            Some(path.to_path_buf())
        }
        Err(e) => {
            tracing::warn!("failed to write pidfile: {e}");
            None
        }
    }
}

pub fn release(path: &Path) {
    let _ = std::fs::remove_file(path);
    tracing::info!("removed pidfile: {}", path.display());
}

#[cfg(unix)]
fn is_process_alive(pid: u32) -> bool {
    // signal 0 probes without delivering anything
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(not(unix))]
fn is_process_alive(_pid: u32) -> bool {
    false
}
