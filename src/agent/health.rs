//! Agent health heartbeat file
//!
//! The connection manager touches this file every 90 seconds while the
//! process is healthy; `lightspeed-agent health` checks its age and exits
//! non-zero when the heartbeat is stale.

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Heartbeat period and freshness bound
pub const HEALTH_INTERVAL: Duration = Duration::from_secs(90);

/// Default heartbeat location under the user cache directory.
pub fn default_health_file() -> PathBuf {
    std::env::temp_dir().join("lightspeed-agent.health")
}

/// Touches the heartbeat file.
///
/// # Errors
///
/// Returns the underlying I/O error; callers log and carry on.
pub fn beat(path: &Path) -> std::io::Result<()> {
    std::fs::write(path, chrono::Utc::now().to_rfc3339())
}

/// Removes the heartbeat file on shutdown; a missing file is fine.
pub fn cleanup(path: &Path) {
    let _ = std::fs::remove_file(path);
}

/// True when the heartbeat is fresher than [`HEALTH_INTERVAL`].
pub fn is_fresh(path: &Path) -> bool {
    let Ok(meta) = std::fs::metadata(path) else {
        return false;
    };
    let Ok(modified) = meta.modified() else {
        return false;
    };
    match modified.elapsed() {
        Ok(age) => age <= HEALTH_INTERVAL,
        // Clock skew puts the mtime in the future; count that as fresh.
        Err(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn beat_then_check_is_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.health");
        assert!(!is_fresh(&path));
        beat(&path).unwrap();
        assert!(is_fresh(&path));
        cleanup(&path);
        assert!(!is_fresh(&path));
    }
}
