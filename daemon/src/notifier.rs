use crate::config::NotificationConfig;
use crate::stream::{FeedbackClient, StreamEvent, StreamLease};
use common::{job_type_name, JobFeedback, JobStatus};
use dashmap::DashMap;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertLevel {
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Alert {
    pub job_id: String,
    pub level: AlertLevel,
    pub title: String,
    pub message: String,
    /// How long the alert should stay on screen.
    pub duration: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AlertHandle(pub Uuid);

impl AlertHandle {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for AlertHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AlertHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where alerts end up, e.g. toasts in a UI.
pub trait AlertSink: Send + Sync {
    fn show(&self, alert: Alert) -> AlertHandle;
    fn dismiss(&self, handle: AlertHandle);
}

/// Writes alerts to the `alerts` log target.
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn show(&self, alert: Alert) -> AlertHandle {
        let handle = AlertHandle::new();
        let level = match alert.level {
            AlertLevel::Info | AlertLevel::Success => log::Level::Info,
            AlertLevel::Warning => log::Level::Warn,
            AlertLevel::Error => log::Level::Error,
        };
        log::log!(
            target: "alerts",
            level,
            "[{}] {} - {} ({}s)",
            alert.job_id,
            alert.title,
            alert.message,
            alert.duration.as_secs()
        );
        handle
    }

    fn dismiss(&self, handle: AlertHandle) {
        log::debug!(target: "alerts", "dismissed {}", handle);
    }
}

#[derive(Default)]
struct Runtime {
    lease: Option<StreamLease>,
    pump: Option<JoinHandle<()>>,
}

struct NotifierInner {
    client: FeedbackClient,
    sink: Arc<dyn AlertSink>,
    config: NotificationConfig,
    active: DashMap<String, AlertHandle>,
    runtime: Mutex<Runtime>,
}

/// Turns job feedback into short-lived alerts, keeping at most one visible
/// alert per job.
#[derive(Clone)]
pub struct JobNotifier {
    inner: Arc<NotifierInner>,
}

impl JobNotifier {
    pub fn new(client: FeedbackClient, sink: Arc<dyn AlertSink>, config: NotificationConfig) -> Self {
        Self {
            inner: Arc::new(NotifierInner {
                client,
                sink,
                config,
                active: DashMap::new(),
                runtime: Mutex::new(Runtime::default()),
            }),
        }
    }

    pub fn start(&self) {
        let mut runtime = self.inner.runtime.lock().unwrap();
        if runtime.pump.is_some() {
            return;
        }
        let mut events = self.inner.client.events();
        let notifier: Weak<NotifierInner> = Arc::downgrade(&self.inner);
        runtime.pump = Some(tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let StreamEvent::Feedback(feedback) = event {
                    let Some(inner) = notifier.upgrade() else { break };
                    JobNotifier { inner }.handle_feedback(&feedback);
                }
            }
        }));
        runtime.lease = Some(self.inner.client.acquire());
        log::info!("Job notifications started");
    }

    pub fn stop(&self) {
        let mut runtime = self.inner.runtime.lock().unwrap();
        if let Some(pump) = runtime.pump.take() {
            pump.abort();
        }
        if runtime.lease.take().is_none() {
            return;
        }
        let job_ids: Vec<String> = self.inner.active.iter().map(|entry| entry.key().clone()).collect();
        for job_id in job_ids {
            self.dismiss_current(&job_id);
        }
        log::info!("Job notifications stopped");
    }

    pub fn is_connected(&self) -> bool {
        self.inner.client.is_connected()
    }

    /// Number of jobs with a visible alert.
    pub fn active_alerts(&self) -> usize {
        self.inner.active.len()
    }

    pub fn handle_feedback(&self, feedback: &JobFeedback) {
        let name = job_type_name(feedback.job_type.as_deref(), &feedback.job_id);
        let config = &self.inner.config;

        // Whatever was shown for this job goes away first.
        self.dismiss_current(&feedback.job_id);

        let (level, title, message, duration_ms) = match &feedback.status {
            JobStatus::Started => (
                AlertLevel::Info,
                format!("{} started", name),
                feedback.status.describe(),
                config.info_duration_ms,
            ),
            JobStatus::Progress { .. } => (
                AlertLevel::Info,
                format!("{} in progress", name),
                feedback.status.describe(),
                config.info_duration_ms,
            ),
            JobStatus::Completed { .. } => (
                AlertLevel::Success,
                format!("{} completed", name),
                feedback.status.describe(),
                config.success_duration_ms,
            ),
            JobStatus::Failed { .. } => (
                AlertLevel::Error,
                format!("{} failed", name),
                feedback.status.describe(),
                config.failure_duration_ms,
            ),
            JobStatus::Cancelled { .. } => (
                AlertLevel::Warning,
                format!("{} cancelled", name),
                feedback.status.describe(),
                config.warning_duration_ms,
            ),
        };

        let handle = self.inner.sink.show(Alert {
            job_id: feedback.job_id.clone(),
            level,
            title,
            message,
            duration: Duration::from_millis(duration_ms),
        });

        if !feedback.status.is_terminal() {
            self.inner.active.insert(feedback.job_id.clone(), handle);
        }
    }

    fn dismiss_current(&self, job_id: &str) {
        if let Some((_, previous)) = self.inner.active.remove(job_id) {
            self.inner.sink.dismiss(previous);
        }
    }
}
