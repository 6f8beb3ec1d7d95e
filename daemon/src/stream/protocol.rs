//! Wire format of the job feedback stream and the status normalization
//! boundary. Nothing past [`RawJobFeedback::normalize`] ever sees the
//! bare-string status encoding.

use chrono::{DateTime, Utc};
use common::{JobFeedback, JobStatus, GENERIC_FAILURE};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("job feedback without a job_id")]
    MissingJobId,
}

/// Messages the server pushes over the feedback stream.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Connected {
        #[serde(default)]
        message: Option<String>,
    },
    Pong,
    Error {
        error: String,
    },
    JobFeedback {
        feedback: RawJobFeedback,
    },
    #[serde(other)]
    Unknown,
}

/// Messages the client sends.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Ping,
}

/// Feedback exactly as it arrives, before normalization.
#[derive(Debug, Clone, Deserialize)]
pub struct RawJobFeedback {
    pub job_id: String,
    #[serde(default)]
    pub job_type: Option<String>,
    #[serde(default)]
    pub worker_id: Option<String>,
    #[serde(default)]
    pub status: Value,
    #[serde(default)]
    pub timestamp: Option<String>,
}

impl RawJobFeedback {
    pub fn normalize(self) -> Result<JobFeedback, DecodeError> {
        if self.job_id.trim().is_empty() {
            return Err(DecodeError::MissingJobId);
        }
        let status = normalize_status(&self.status);
        let timestamp = parse_timestamp(self.timestamp.as_deref(), &self.job_id);
        Ok(JobFeedback {
            job_id: self.job_id,
            job_type: self.job_type,
            worker_id: self.worker_id,
            status,
            timestamp,
        })
    }
}

pub fn decode(text: &str) -> Result<ServerMessage, DecodeError> {
    Ok(serde_json::from_str(text)?)
}

pub fn encode(message: &ClientMessage) -> Result<String, serde_json::Error> {
    serde_json::to_string(message)
}

/// Map either encoding of a job status onto [`JobStatus`]. Anything that
/// cannot be understood becomes `Started` so the job stays tracked.
pub fn normalize_status(raw: &Value) -> JobStatus {
    match raw {
        Value::String(name) => match name.as_str() {
            "Started" => JobStatus::Started,
            "Completed" => JobStatus::Completed { result: None },
            "Failed" => JobStatus::Failed {
                error: GENERIC_FAILURE.to_string(),
            },
            "Cancelled" => JobStatus::Cancelled { reason: None },
            other => {
                log::warn!("Unrecognised job status {:?}, treating as Started", other);
                JobStatus::Started
            }
        },
        Value::Object(map) => {
            let mut variants = map.iter();
            match (variants.next(), variants.next()) {
                (Some((variant, payload)), None) => status_from_object(variant, payload)
                    .unwrap_or_else(|| {
                        log::warn!("Unrecognised job status variant {:?}, treating as Started", variant);
                        JobStatus::Started
                    }),
                _ => {
                    log::warn!("Job status object must have exactly one variant, treating as Started");
                    JobStatus::Started
                }
            }
        }
        other => {
            log::warn!("Unparseable job status {}, treating as Started", other);
            JobStatus::Started
        }
    }
}

fn status_from_object(variant: &str, payload: &Value) -> Option<JobStatus> {
    let text = |key: &str| {
        payload
            .get(key)
            .and_then(Value::as_str)
            .map(str::to_string)
    };
    let status = match variant {
        "Started" => JobStatus::Started,
        "Progress" => JobStatus::Progress {
            percent: percent(payload.get("percent")),
            message: text("message"),
        },
        "Completed" => JobStatus::Completed {
            result: text("result"),
        },
        "Failed" => JobStatus::Failed {
            error: text("error").unwrap_or_else(|| GENERIC_FAILURE.to_string()),
        },
        "Cancelled" => JobStatus::Cancelled {
            reason: text("reason"),
        },
        _ => return None,
    };
    Some(status)
}

fn percent(value: Option<&Value>) -> u8 {
    let raw = value.and_then(Value::as_f64).unwrap_or(0.0);
    raw.round().clamp(0.0, 100.0) as u8
}

fn parse_timestamp(raw: Option<&str>, job_id: &str) -> DateTime<Utc> {
    match raw.map(DateTime::parse_from_rfc3339) {
        Some(Ok(ts)) => ts.with_timezone(&Utc),
        Some(Err(e)) => {
            log::warn!("Bad timestamp on feedback for job {}: {}, using receive time", job_id, e);
            Utc::now()
        }
        None => {
            log::warn!("Feedback for job {} has no timestamp, using receive time", job_id);
            Utc::now()
        }
    }
}
