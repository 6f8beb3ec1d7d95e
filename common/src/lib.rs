pub mod ipc;
pub mod job;
pub mod job_type;

use std::path::PathBuf;

pub use ipc::{Request, Response, StreamStatus};
pub use job::{JobFeedback, JobHistoryEntry, JobStatistics, JobStatus, StatusEntry, GENERIC_FAILURE};
pub use job_type::{job_type_name, UNKNOWN_JOB_TYPE};

/// Path of the job feedback stream, relative to the server base URL.
pub const FEEDBACK_PATH: &str = "/api/admin/v1/jobs/feedback";

/// Upper bound on tracked jobs; the oldest by creation time go first.
pub const MAX_HISTORY_ENTRIES: usize = 1000;

// Production paths
pub const DEFAULT_SOCKET_PATH: &str = "/var/run/jobfeed/jobfeed.sock";
pub const DEFAULT_CONFIG_PATH: &str = "/etc/jobfeed/config.yaml";
pub const DEFAULT_LOG_FILE: &str = "/var/log/jobfeed/daemon.log";
pub const DEFAULT_ALERTS_LOG_FILE: &str = "/var/log/jobfeed/alerts.log";

// Fallback paths for non-root users
pub const USER_SOCKET_PATH: &str = "/tmp/jobfeed.sock";
pub const USER_LOG_FILE: &str = "jobfeed-daemon.log";
pub const USER_ALERTS_LOG_FILE: &str = "jobfeed-alerts.log";

/// `system` when its directory exists, the per-user fallback otherwise.
pub fn system_or_user_path(system: &str, user: &str) -> PathBuf {
    let system = PathBuf::from(system);
    match system.parent() {
        Some(dir) if dir.is_dir() => system,
        _ => PathBuf::from(user),
    }
}

/// Socket the daemon listens on unless configured otherwise.
pub fn default_socket_path() -> PathBuf {
    system_or_user_path(DEFAULT_SOCKET_PATH, USER_SOCKET_PATH)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_fallback_when_system_dir_is_missing() {
        assert_eq!(
            system_or_user_path("/nonexistent-jobfeed-dir/jobfeed.sock", USER_SOCKET_PATH),
            PathBuf::from(USER_SOCKET_PATH)
        );
        let dir = std::env::temp_dir();
        let system = dir.join("jobfeed.sock");
        assert_eq!(
            system_or_user_path(system.to_str().unwrap(), USER_SOCKET_PATH),
            system
        );
    }
}
