use serde::{Deserialize, Serialize};
use crate::job::{JobHistoryEntry, JobStatistics};

#[derive(Debug, Serialize, Deserialize)]
pub enum Request {
    ListJobs { limit: Option<usize> },
    GetJob(String),
    GetStatistics,
    ClearHistory,
    Status,
    /// Reconnect the feedback stream with a fresh retry budget.
    Reconnect,
}

#[derive(Debug, Serialize, Deserialize)]
pub enum Response {
    Ok,
    Error(String),
    JobList(Vec<JobHistoryEntry>),
    JobDetail(Option<JobHistoryEntry>),
    Statistics(JobStatistics),
    Status(StreamStatus),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamStatus {
    pub connected: bool,
    pub state: String,
    pub active_leases: usize,
}
