use clap::{Parser, Subcommand};
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use common::{JobHistoryEntry, Request, Response};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Daemon socket [default: system socket, or the per-user one]
    #[arg(short, long)]
    socket: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List tracked jobs, most recently updated first
    List {
        /// Show at most this many jobs
        #[arg(short, long)]
        limit: Option<usize>,
    },
    /// Show the status timeline of one job
    Get {
        job_id: String,
    },
    /// Show job counts
    Stats,
    /// Forget all tracked jobs
    Clear,
    /// Show the feedback stream connection state
    Status,
    /// Reconnect the feedback stream, e.g. after it gave up retrying
    Reconnect,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let req = match cli.command {
        Commands::List { limit } => Request::ListJobs { limit },
        Commands::Get { job_id } => Request::GetJob(job_id),
        Commands::Stats => Request::GetStatistics,
        Commands::Clear => Request::ClearHistory,
        Commands::Status => Request::Status,
        Commands::Reconnect => Request::Reconnect,
    };

    let socket = cli.socket.unwrap_or_else(common::default_socket_path);
    let stream = UnixStream::connect(&socket).await?;
    let (reader, mut writer) = stream.into_split();

    let mut req_bytes = serde_json::to_vec(&req)?;
    req_bytes.push(b'\n');
    writer.write_all(&req_bytes).await?;

    let line = BufReader::new(reader)
        .lines()
        .next_line()
        .await?
        .ok_or_else(|| anyhow::anyhow!("Daemon closed the connection without answering"))?;
    let resp: Response = serde_json::from_str(&line)?;

    match resp {
        Response::Ok => println!("Success"),
        Response::Error(e) => eprintln!("Error: {}", e),
        Response::JobList(jobs) => {
            if jobs.is_empty() {
                println!("No jobs tracked.");
            } else {
                println!("{}", jobs_table(&jobs));
            }
        }
        Response::JobDetail(job_opt) => {
            if let Some(job) = job_opt {
                print_job(&job);
            } else {
                println!("Job not found.");
            }
        }
        Response::Statistics(stats) => {
            let mut table = Table::new();
            table.load_preset(UTF8_FULL);
            table.set_header(vec!["Total", "Running", "Completed", "Failed", "Cancelled"]);
            table.add_row(vec![
                stats.total.to_string(),
                stats.running.to_string(),
                stats.completed.to_string(),
                stats.failed.to_string(),
                stats.cancelled.to_string(),
            ]);
            println!("{}", table);
        }
        Response::Status(status) => {
            println!("Stream:    {}", status.state);
            println!("Connected: {}", status.connected);
            println!("Consumers: {}", status.active_leases);
        }
    }

    Ok(())
}

fn jobs_table(jobs: &[JobHistoryEntry]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["Job ID", "Type", "Status", "Last Message", "Updated", "Duration"]);

    for job in jobs {
        let last = job.status_history.last();
        table.add_row(vec![
            job.job_id.clone(),
            job.job_type.clone(),
            last.map(|entry| entry.status.label().to_string()).unwrap_or_else(|| "-".to_string()),
            last.map(|entry| entry.message.clone()).unwrap_or_default(),
            local_time(job.updated_at),
            format_duration(job.duration_ms),
        ]);
    }
    table
}

fn print_job(job: &JobHistoryEntry) {
    println!("Job Details:");
    println!("  Job ID:   {}", job.job_id);
    println!("  Type:     {}", job.job_type);
    println!("  Worker:   {}", job.worker_id.as_deref().unwrap_or("-"));
    println!("  Created:  {}", local_time(job.created_at));
    println!("  Updated:  {}", local_time(job.updated_at));
    println!("  Duration: {}", format_duration(job.duration_ms));

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Time", "Status", "Message"]);
    for entry in &job.status_history {
        table.add_row(vec![
            local_time(entry.timestamp),
            entry.status.label().to_string(),
            entry.message.clone(),
        ]);
    }
    println!("{}", table);
}

fn local_time(ts: chrono::DateTime<chrono::Utc>) -> String {
    ts.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S").to_string()
}

fn format_duration(duration_ms: Option<i64>) -> String {
    match duration_ms {
        Some(ms) if ms >= 60_000 => format!("{}m {}s", ms / 60_000, (ms % 60_000) / 1000),
        Some(ms) => format!("{:.1}s", ms as f64 / 1000.0),
        None => "-".to_string(),
    }
}
