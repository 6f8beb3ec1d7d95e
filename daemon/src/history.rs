//! In-memory job history built from the feedback stream.
//!
//! One [`JobHistoryEntry`] per job id, capped at a fixed number of entries
//! (oldest by creation time evicted first). Subscribers get the full list,
//! most recently updated first, when they subscribe and after every change.
//! The feedback stream only runs while somebody is subscribed.

use crate::stream::{FeedbackClient, StreamEvent, StreamLease};
use common::{JobFeedback, JobHistoryEntry, JobStatistics};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tokio::task::JoinHandle;

pub type HistoryListener = Arc<dyn Fn(&[JobHistoryEntry]) + Send + Sync>;

struct Registry {
    listeners: Vec<(u64, HistoryListener)>,
    next_id: u64,
    lease: Option<StreamLease>,
    pump: Option<JoinHandle<()>>,
}

struct HistoryInner {
    client: FeedbackClient,
    max_entries: usize,
    jobs: Mutex<HashMap<String, JobHistoryEntry>>,
    registry: Mutex<Registry>,
}

#[derive(Clone)]
pub struct JobHistory {
    inner: Arc<HistoryInner>,
}

impl JobHistory {
    pub fn new(client: FeedbackClient, max_entries: usize) -> Self {
        Self {
            inner: Arc::new(HistoryInner {
                client,
                max_entries: max_entries.max(1),
                jobs: Mutex::new(HashMap::new()),
                registry: Mutex::new(Registry {
                    listeners: Vec::new(),
                    next_id: 0,
                    lease: None,
                    pump: None,
                }),
            }),
        }
    }

    /// Register `listener`. It is called right away with the current list
    /// and again after every change, until the returned guard is dropped.
    pub fn subscribe<F>(&self, listener: F) -> HistorySubscription
    where
        F: Fn(&[JobHistoryEntry]) + Send + Sync + 'static,
    {
        let listener: HistoryListener = Arc::new(listener);
        let (id, snapshot) = {
            let mut registry = self.inner.registry.lock().unwrap();
            let id = registry.next_id;
            registry.next_id += 1;
            registry.listeners.push((id, listener.clone()));
            if registry.listeners.len() == 1 {
                log::debug!("First history subscriber, starting feedback stream");
                registry.pump = Some(self.spawn_pump());
                registry.lease = Some(self.inner.client.acquire());
            }
            (id, self.jobs())
        };
        listener(&snapshot);

        HistorySubscription {
            history: self.inner.clone(),
            id,
        }
    }

    fn spawn_pump(&self) -> JoinHandle<()> {
        let mut events = self.inner.client.events();
        let history: Weak<HistoryInner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let StreamEvent::Feedback(feedback) = event {
                    let Some(inner) = history.upgrade() else { break };
                    JobHistory { inner }.record(feedback);
                }
            }
        })
    }

    /// Fold one feedback event into the history and notify subscribers.
    pub fn record(&self, feedback: JobFeedback) {
        let snapshot = {
            let mut jobs = self.inner.jobs.lock().unwrap();
            jobs.entry(feedback.job_id.clone())
                .or_insert_with(|| JobHistoryEntry::new(&feedback))
                .apply(&feedback);
            evict_oldest(&mut jobs, self.inner.max_entries);
            sorted(&jobs)
        };
        log::debug!(
            "Job {} is now {} ({} tracked)",
            feedback.job_id,
            feedback.status,
            snapshot.len()
        );
        self.notify(&snapshot);
    }

    pub fn get_job(&self, job_id: &str) -> Option<JobHistoryEntry> {
        self.inner.jobs.lock().unwrap().get(job_id).cloned()
    }

    /// All tracked jobs, most recently updated first.
    pub fn jobs(&self) -> Vec<JobHistoryEntry> {
        sorted(&self.inner.jobs.lock().unwrap())
    }

    pub fn statistics(&self) -> JobStatistics {
        JobStatistics::from_entries(self.inner.jobs.lock().unwrap().values())
    }

    pub fn len(&self) -> usize {
        self.inner.jobs.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.registry.lock().unwrap().listeners.len()
    }

    pub fn clear_history(&self) {
        self.inner.jobs.lock().unwrap().clear();
        log::info!("Job history cleared");
        self.notify(&[]);
    }

    fn notify(&self, snapshot: &[JobHistoryEntry]) {
        let listeners: Vec<HistoryListener> = self
            .inner
            .registry
            .lock()
            .unwrap()
            .listeners
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in listeners {
            listener(snapshot);
        }
    }
}

impl HistoryInner {
    fn remove_listener(&self, id: u64) {
        let mut registry = self.registry.lock().unwrap();
        registry.listeners.retain(|(listener_id, _)| *listener_id != id);
        if registry.listeners.is_empty() {
            if let Some(pump) = registry.pump.take() {
                pump.abort();
            }
            if registry.lease.take().is_some() {
                log::debug!("Last history subscriber gone, releasing feedback stream");
            }
        }
    }
}

/// Active history subscription; dropping it unsubscribes.
pub struct HistorySubscription {
    history: Arc<HistoryInner>,
    id: u64,
}

impl HistorySubscription {
    pub fn unsubscribe(self) {}
}

impl Drop for HistorySubscription {
    fn drop(&mut self) {
        self.history.remove_listener(self.id);
    }
}

fn evict_oldest(jobs: &mut HashMap<String, JobHistoryEntry>, max_entries: usize) {
    while jobs.len() > max_entries {
        let oldest = jobs
            .values()
            .min_by_key(|entry| entry.created_at)
            .map(|entry| entry.job_id.clone());
        match oldest {
            Some(job_id) => {
                log::debug!("History full, evicting job {}", job_id);
                jobs.remove(&job_id);
            }
            None => break,
        }
    }
}

fn sorted(jobs: &HashMap<String, JobHistoryEntry>) -> Vec<JobHistoryEntry> {
    let mut list: Vec<JobHistoryEntry> = jobs.values().cloned().collect();
    list.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    list
}
