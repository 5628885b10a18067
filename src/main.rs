use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use saved_post_archiver::archiver::{ArchiveWorker, Downloader, YtDlp};
use saved_post_archiver::config::{Config, LogFormat};
use saved_post_archiver::posts::reddit::{RedditClient, RedditCredentials};
use saved_post_archiver::state::{ItemStatus, StatusStore};

/// Download the media of your saved Reddit posts.
#[derive(Debug, Parser)]
#[command(name = "saved-post-archiver", version, about)]
struct Cli {
    /// Directory to download posts into.
    output_dir: PathBuf,

    /// JSON file with Reddit credentials (username, password, client_id, client_secret).
    user_config: PathBuf,

    /// Log debug output to the console.
    #[arg(short, long)]
    debug: bool,

    /// Download the posts listed in a data-export CSV instead of the saved list.
    #[arg(long, value_name = "FILENAME")]
    csv: Option<PathBuf>,

    /// Don't retry posts that failed on a previous run.
    #[arg(long)]
    skip_failed: bool,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("Fatal error: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let config = Config::from_env();
    let (log_dir, log_format) = config.as_ref().map_or_else(
        |_| (PathBuf::from("logs"), LogFormat::Pretty),
        |c| (c.log_dir.clone(), c.log_format),
    );
    init_tracing(cli.debug, &log_dir, log_format)?;

    info!("Starting saved-post-archiver");

    let mut config = config.context("Failed to load configuration")?;
    config.output_dir.clone_from(&cli.output_dir);
    config.skip_failed |= cli.skip_failed;
    config.validate().context("Invalid configuration")?;

    tokio::fs::create_dir_all(&config.output_dir)
        .await
        .with_context(|| {
            format!(
                "Failed to create output directory: {}",
                config.output_dir.display()
            )
        })?;

    let credentials = RedditCredentials::load(&cli.user_config).await?;
    let reddit = RedditClient::new(&config, credentials)?;
    reddit
        .verify_login()
        .await
        .context("Failed to log in, check the user config")?;
    info!(username = %reddit.username(), "Logged in");

    let yt_dlp = YtDlp::new(config.yt_dlp_path.clone(), config.video_timeout);
    if !yt_dlp.is_available().await {
        warn!(path = %config.yt_dlp_path, "yt-dlp not found, video posts will fail");
    }

    let store = StatusStore::load(config.status_path());
    info!(
        known = store.len(),
        downloaded = store.count(ItemStatus::Downloaded),
        failed = store.count(ItemStatus::Failed),
        "Loaded post status"
    );

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Interrupt received, finishing up...");
        signal_token.cancel();
    });

    let downloader = Downloader::from_config(&config, Arc::new(yt_dlp))?;
    let skip_failed = config.skip_failed;
    let mut worker = ArchiveWorker::new(config, Arc::new(reddit), downloader, store, shutdown);

    let summary = match cli.csv.as_deref() {
        Some(csv) => worker.download_csv(csv, skip_failed).await?,
        None => worker.download_saved(skip_failed).await?,
    };

    info!(
        total = summary.total_known,
        added = worker.added(),
        failed = summary.failed,
        interrupted = summary.interrupted,
        "Done"
    );

    Ok(())
}

/// Console output plus a per-run log file with everything at debug level.
fn init_tracing(debug: bool, log_dir: &Path, format: LogFormat) -> Result<()> {
    let default_level = if debug {
        "info,saved_post_archiver=debug"
    } else {
        "info"
    };
    let console_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("Failed to create log directory: {}", log_dir.display()))?;
    let log_path = log_dir.join(
        chrono::Local::now()
            .format("%Y%m%d_%H%M%S.log")
            .to_string(),
    );
    let log_file = File::create(&log_path)
        .with_context(|| format!("Failed to create log file: {}", log_path.display()))?;

    let console = match format {
        LogFormat::Json => tracing_subscriber::fmt::layer().json().boxed(),
        LogFormat::Pretty => tracing_subscriber::fmt::layer().boxed(),
    };
    let file = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(Arc::new(log_file))
        .with_filter(EnvFilter::new("info,saved_post_archiver=debug"));

    tracing_subscriber::registry()
        .with(console.with_filter(console_filter))
        .with(file)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
