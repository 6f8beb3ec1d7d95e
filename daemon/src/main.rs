use clap::{Parser, Subcommand};
use jobfeed_daemon::config::LoggingConfig;
use jobfeed_daemon::{
    auth, server, Config, ConfigFileEndpoint, FeedbackClient, JobHistory, JobNotifier, KeyFileSession,
    LogAlertSink, StreamEvent,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (.yaml, .yml or .toml)
    #[arg(short, long, default_value = common::DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Follow the job feedback stream (default)
    Run,
    /// Generate a signing key
    Keygen {
        /// Where to write the hex encoded secret key
        #[arg(short, long)]
        out: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Some(Commands::Keygen { out }) = &cli.command {
        let pubkey = auth::generate_key_file(out)?;
        println!("Wrote key to {:?}", out);
        println!("Public key: {}", pubkey);
        return Ok(());
    }

    let config = Config::load_or_default(&cli.config)?;
    setup_logging(&config.logging)?;
    log::info!("Starting jobfeed-daemon...");

    run(config, &cli.config).await
}

async fn run(config: Config, config_path: &Path) -> anyhow::Result<()> {
    let endpoint = Arc::new(ConfigFileEndpoint::new(config_path, config.server.base_url.clone()));
    let session = Arc::new(KeyFileSession::new(config.auth.key_file.clone()));
    if config.auth.key_file.is_none() {
        log::warn!("No auth.key_file configured; the feedback stream will stay idle");
    }

    let client = FeedbackClient::new(config.stream.clone(), session, endpoint);
    let history = JobHistory::new(client.clone(), config.history.max_entries);
    let notifier = JobNotifier::new(client.clone(), Arc::new(LogAlertSink), config.notifications.clone());
    let mut events = client.events();

    // Keep history for the daemon's whole lifetime
    let subscription = history.subscribe(|jobs| {
        log::debug!("Job history now holds {} job(s)", jobs.len());
    });
    if config.notifications.enabled {
        notifier.start();
    }

    let listener = server::bind(&config.server.socket_path)?;
    println!("Listening on {:?}", config.server.socket_path);

    let status_log = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                StreamEvent::Connected => log::info!("Job feed online"),
                StreamEvent::Disconnected(info) => log::info!("Job feed offline: {}", info),
                StreamEvent::Error(e) => log::warn!("Job feed error: {}", e),
                StreamEvent::Feedback(_) => {}
            }
        }
    });

    tokio::select! {
        result = server::serve(listener, history.clone(), client.clone()) => {
            if let Err(e) = result {
                log::error!("IPC server stopped: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => log::info!("Shutting down..."),
    }

    notifier.stop();
    subscription.unsubscribe();
    client.disconnect();
    status_log.abort();
    if let Err(e) = std::fs::remove_file(&config.server.socket_path) {
        log::debug!("Could not remove socket: {}", e);
    }
    Ok(())
}

fn setup_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let level_name = std::env::var("JOBFEED_LOG_LEVEL").unwrap_or_else(|_| config.level.clone());
    let level: log::LevelFilter = level_name.parse().unwrap_or(log::LevelFilter::Info);

    let log_file = std::env::var("JOBFEED_LOG")
        .map(PathBuf::from)
        .ok()
        .or_else(|| config.output.clone())
        .unwrap_or_else(|| common::system_or_user_path(common::DEFAULT_LOG_FILE, common::USER_LOG_FILE));
    let alerts_file = config
        .alerts_output
        .clone()
        .unwrap_or_else(|| common::system_or_user_path(common::DEFAULT_ALERTS_LOG_FILE, common::USER_ALERTS_LOG_FILE));

    let base_config = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{}][{}][{}] {}",
                chrono::Local::now().format("%Y-%m-%d][%H:%M:%S"),
                record.target(),
                record.level(),
                message
            ))
        })
        .level(level);

    // Main log file: Filter OUT alerts
    let main_log = fern::Dispatch::new()
        .filter(|metadata| metadata.target() != "alerts")
        .chain(std::io::stdout())
        .chain(fern::log_file(&log_file)?);

    // Alerts log file: Filter IN alerts
    let alerts_log = fern::Dispatch::new()
        .filter(|metadata| metadata.target() == "alerts")
        .chain(fern::log_file(&alerts_file)?);

    base_config
        .chain(main_log)
        .chain(alerts_log)
        .apply()?;

    Ok(())
}
