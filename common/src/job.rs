use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::job_type::job_type_name;

/// Message used when the server reports a failure without any detail.
pub const GENERIC_FAILURE: &str = "Job failed";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum JobStatus {
    Started,
    Progress {
        percent: u8,
        message: Option<String>,
    },
    Completed {
        result: Option<String>,
    },
    Failed {
        error: String,
    },
    Cancelled {
        reason: Option<String>,
    },
}

impl JobStatus {
    /// Completed, Failed and Cancelled end a job.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed { .. } | JobStatus::Failed { .. } | JobStatus::Cancelled { .. }
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            JobStatus::Started => "Started",
            JobStatus::Progress { .. } => "Progress",
            JobStatus::Completed { .. } => "Completed",
            JobStatus::Failed { .. } => "Failed",
            JobStatus::Cancelled { .. } => "Cancelled",
        }
    }

    /// Human readable one-liner shown next to each history entry.
    pub fn describe(&self) -> String {
        match self {
            JobStatus::Started => "Job started".to_string(),
            JobStatus::Progress { percent, message } => match message.as_deref() {
                Some(msg) if !msg.is_empty() => format!("{}% - {}", percent, msg),
                _ => format!("{}% complete", percent),
            },
            JobStatus::Completed { result } => match result.as_deref() {
                Some(result) if !result.is_empty() => format!("Job completed: {}", result),
                _ => "Job completed successfully".to_string(),
            },
            JobStatus::Failed { error } => format!("Job failed: {}", error),
            JobStatus::Cancelled { reason } => match reason.as_deref() {
                Some(reason) if !reason.is_empty() => format!("Job cancelled: {}", reason),
                _ => "Job cancelled".to_string(),
            },
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// One normalized status update for one job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobFeedback {
    pub job_id: String,
    pub job_type: Option<String>,
    pub worker_id: Option<String>,
    pub status: JobStatus,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusEntry {
    pub status: JobStatus,
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobHistoryEntry {
    pub id: Uuid,
    pub job_id: String,
    pub worker_id: Option<String>,
    pub job_type: String,
    pub status_history: Vec<StatusEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub duration_ms: Option<i64>,
}

impl JobHistoryEntry {
    /// Start a record from the first feedback seen for a job. The status
    /// itself is not appended here, see [`JobHistoryEntry::apply`].
    pub fn new(feedback: &JobFeedback) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id: feedback.job_id.clone(),
            worker_id: feedback.worker_id.clone(),
            job_type: job_type_name(feedback.job_type.as_deref(), &feedback.job_id),
            status_history: Vec::new(),
            created_at: feedback.timestamp,
            updated_at: feedback.timestamp,
            duration_ms: None,
        }
    }

    /// Append the feedback's status. Entries arriving after a terminal
    /// status are still appended.
    pub fn apply(&mut self, feedback: &JobFeedback) {
        if feedback.worker_id.is_some() {
            self.worker_id = feedback.worker_id.clone();
        }
        self.status_history.push(StatusEntry {
            status: feedback.status.clone(),
            timestamp: feedback.timestamp,
            message: feedback.status.describe(),
        });
        self.updated_at = feedback.timestamp;
        if feedback.status.is_terminal() {
            self.duration_ms = Some((self.updated_at - self.created_at).num_milliseconds());
        }
    }

    pub fn latest_status(&self) -> Option<&JobStatus> {
        self.status_history.last().map(|entry| &entry.status)
    }

    /// A job with no entries yet counts as running.
    pub fn is_running(&self) -> bool {
        !self.latest_status().is_some_and(JobStatus::is_terminal)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobStatistics {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub running: usize,
}

impl JobStatistics {
    pub fn from_entries<'a>(entries: impl IntoIterator<Item = &'a JobHistoryEntry>) -> Self {
        let mut stats = Self::default();
        for entry in entries {
            stats.total += 1;
            match entry.latest_status() {
                Some(JobStatus::Completed { .. }) => stats.completed += 1,
                Some(JobStatus::Failed { .. }) => stats.failed += 1,
                Some(JobStatus::Cancelled { .. }) => stats.cancelled += 1,
                _ => stats.running += 1,
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn feedback(status: JobStatus, secs: i64) -> JobFeedback {
        JobFeedback {
            job_id: "job-1".to_string(),
            job_type: Some("CreateVm".to_string()),
            worker_id: None,
            status,
            timestamp: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
        }
    }

    #[test]
    fn test_describe_messages() {
        let progress = JobStatus::Progress { percent: 42, message: Some("uploading image".into()) };
        assert_eq!(progress.describe(), "42% - uploading image");

        let bare_progress = JobStatus::Progress { percent: 7, message: None };
        assert_eq!(bare_progress.describe(), "7% complete");

        let failed = JobStatus::Failed { error: "disk full".into() };
        assert_eq!(failed.describe(), "Job failed: disk full");

        assert_eq!(JobStatus::Cancelled { reason: None }.describe(), "Job cancelled");
        assert_eq!(JobStatus::Completed { result: None }.describe(), "Job completed successfully");
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!JobStatus::Started.is_terminal());
        assert!(!JobStatus::Progress { percent: 99, message: None }.is_terminal());
        assert!(JobStatus::Completed { result: None }.is_terminal());
        assert!(JobStatus::Failed { error: GENERIC_FAILURE.into() }.is_terminal());
        assert!(JobStatus::Cancelled { reason: None }.is_terminal());
    }

    #[test]
    fn test_entry_duration_set_on_terminal() {
        let first = feedback(JobStatus::Started, 0);
        let mut entry = JobHistoryEntry::new(&first);
        entry.apply(&first);
        assert_eq!(entry.duration_ms, None);
        assert!(entry.is_running());

        entry.apply(&feedback(JobStatus::Completed { result: None }, 90));
        assert_eq!(entry.duration_ms, Some(90_000));
        assert_eq!(entry.status_history.len(), 2);
        assert!(!entry.is_running());
        assert_eq!(entry.job_type, "Create VM");
    }

    #[test]
    fn test_worker_id_keeps_last_non_null() {
        let mut first = feedback(JobStatus::Started, 0);
        first.worker_id = Some("worker-a".into());
        let mut entry = JobHistoryEntry::new(&first);
        entry.apply(&first);

        entry.apply(&feedback(JobStatus::Progress { percent: 10, message: None }, 1));
        assert_eq!(entry.worker_id.as_deref(), Some("worker-a"));

        let mut moved = feedback(JobStatus::Progress { percent: 20, message: None }, 2);
        moved.worker_id = Some("worker-b".into());
        entry.apply(&moved);
        assert_eq!(entry.worker_id.as_deref(), Some("worker-b"));
    }

    #[test]
    fn test_statistics_add_up() {
        let statuses = [
            JobStatus::Started,
            JobStatus::Completed { result: None },
            JobStatus::Failed { error: "x".into() },
            JobStatus::Cancelled { reason: None },
            JobStatus::Progress { percent: 5, message: None },
        ];
        let entries: Vec<JobHistoryEntry> = statuses
            .into_iter()
            .enumerate()
            .map(|(i, status)| {
                let mut fb = feedback(status, i as i64);
                fb.job_id = format!("job-{}", i);
                let mut entry = JobHistoryEntry::new(&fb);
                entry.apply(&fb);
                entry
            })
            .collect();

        let stats = JobStatistics::from_entries(&entries);
        assert_eq!(stats.total, 5);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.cancelled, 1);
        assert_eq!(stats.running, 2);
        assert_eq!(stats.completed + stats.failed + stats.cancelled + stats.running, stats.total);
    }
}
