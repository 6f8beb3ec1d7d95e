use crate::history::JobHistory;
use crate::stream::FeedbackClient;
use common::{Request, Response, StreamStatus};
use std::path::Path;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

pub fn handle_request(history: &JobHistory, client: &FeedbackClient, req: Request) -> Response {
    match req {
        Request::ListJobs { limit } => {
            let mut jobs = history.jobs();
            if let Some(limit) = limit {
                jobs.truncate(limit);
            }
            Response::JobList(jobs)
        }
        Request::GetJob(job_id) => Response::JobDetail(history.get_job(&job_id)),
        Request::GetStatistics => Response::Statistics(history.statistics()),
        Request::ClearHistory => {
            history.clear_history();
            Response::Ok
        }
        Request::Reconnect => {
            log::info!("Reconnect requested over IPC");
            client.connect();
            Response::Ok
        }
        Request::Status => Response::Status(StreamStatus {
            connected: client.is_connected(),
            state: client.state().to_string(),
            active_leases: client.active_leases(),
        }),
    }
}

pub fn bind(socket_path: &Path) -> anyhow::Result<UnixListener> {
    if socket_path.exists() {
        std::fs::remove_file(socket_path)?;
    }
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let listener = UnixListener::bind(socket_path)?;

    // Operators query the daemon without being root
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(socket_path)?.permissions();
    perms.set_mode(0o666);
    std::fs::set_permissions(socket_path, perms)?;

    Ok(listener)
}

pub async fn serve(listener: UnixListener, history: JobHistory, client: FeedbackClient) -> anyhow::Result<()> {
    loop {
        let (socket, _) = listener.accept().await?;
        let history = history.clone();
        let client = client.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(socket, &history, &client).await {
                log::error!("IPC connection failed: {}", e);
            }
        });
    }
}

/// One JSON request per line, one JSON response per line.
async fn handle_connection(socket: UnixStream, history: &JobHistory, client: &FeedbackClient) -> anyhow::Result<()> {
    let (reader, mut writer) = socket.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let resp = match serde_json::from_str::<Request>(&line) {
            Ok(req) => {
                log::debug!("Received request: {:?}", req);
                handle_request(history, client, req)
            }
            Err(e) => {
                log::warn!("failed to deserialize request; err = {:?}", e);
                Response::Error(format!("Invalid request: {}", e))
            }
        };

        let mut resp_bytes = serde_json::to_vec(&resp)?;
        resp_bytes.push(b'\n');
        writer.write_all(&resp_bytes).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthError, AuthSession};
    use crate::config::{StaticEndpoint, StreamConfig};
    use chrono::Utc;
    use common::{JobFeedback, JobStatus};
    use std::sync::Arc;

    struct NoSession;

    #[async_trait::async_trait]
    impl AuthSession for NoSession {
        fn is_logged_in(&self) -> bool {
            false
        }

        async fn sign_request(&self, _url: &str, _method: &str) -> Result<String, AuthError> {
            Err(AuthError::NotLoggedIn)
        }
    }

    fn fixture() -> (JobHistory, FeedbackClient) {
        let client = FeedbackClient::new(
            StreamConfig::default(),
            Arc::new(NoSession),
            Arc::new(StaticEndpoint::new("http://127.0.0.1:9")),
        );
        let history = JobHistory::new(client.clone(), 100);
        for (i, job_id) in ["a", "b", "c"].iter().enumerate() {
            history.record(JobFeedback {
                job_id: job_id.to_string(),
                job_type: None,
                worker_id: None,
                status: JobStatus::Started,
                timestamp: Utc::now() + chrono::Duration::seconds(i as i64),
            });
        }
        (history, client)
    }

    #[test]
    fn test_list_respects_limit() {
        let (history, client) = fixture();
        match handle_request(&history, &client, Request::ListJobs { limit: Some(2) }) {
            Response::JobList(jobs) => {
                assert_eq!(jobs.len(), 2);
                assert_eq!(jobs[0].job_id, "c");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_get_stats_and_clear() {
        let (history, client) = fixture();
        assert!(matches!(
            handle_request(&history, &client, Request::GetJob("b".into())),
            Response::JobDetail(Some(job)) if job.job_id == "b"
        ));
        assert!(matches!(
            handle_request(&history, &client, Request::GetStatistics),
            Response::Statistics(stats) if stats.total == 3 && stats.running == 3
        ));
        assert!(matches!(handle_request(&history, &client, Request::ClearHistory), Response::Ok));
        assert!(history.is_empty());
    }

    #[test]
    fn test_status_reports_idle_stream() {
        let (history, client) = fixture();
        match handle_request(&history, &client, Request::Status) {
            Response::Status(status) => {
                assert!(!status.connected);
                assert_eq!(status.state, "idle");
                assert_eq!(status.active_leases, 0);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reconnect_without_session_stays_idle() {
        let (history, client) = fixture();
        assert!(matches!(handle_request(&history, &client, Request::Reconnect), Response::Ok));
        assert_eq!(client.state(), crate::stream::ConnectionState::Idle);
    }

    #[tokio::test]
    async fn test_socket_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobfeed.sock");
        let (history, client) = fixture();
        let listener = bind(&path).unwrap();
        tokio::spawn(serve(listener, history, client));

        let stream = UnixStream::connect(&path).await.unwrap();
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        let mut req = serde_json::to_vec(&Request::GetStatistics).unwrap();
        req.push(b'\n');
        writer.write_all(&req).await.unwrap();
        let line = lines.next_line().await.unwrap().unwrap();
        assert!(matches!(serde_json::from_str::<Response>(&line).unwrap(), Response::Statistics(stats) if stats.total == 3));

        writer.write_all(b"{nonsense}\n").await.unwrap();
        let line = lines.next_line().await.unwrap().unwrap();
        assert!(matches!(serde_json::from_str::<Response>(&line).unwrap(), Response::Error(_)));
    }
}
