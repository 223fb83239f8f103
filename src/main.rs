//! torrent-stream - Main entry point
//!
//! Runs one download job from the command line and prints its outcome as a
//! JSON line.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use torrent_stream::cli::{CliArgs, ProgressDisplay};
use torrent_stream::config::Config;
use torrent_stream::job::{run_job, JobOutcome};

/// Set up panic handler for unexpected errors
fn setup_panic_handler() {
    std::panic::set_hook(Box::new(|panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();
        match panic_info.location() {
            Some(location) => error!(
                "PANIC occurred at {}:{}:{}",
                location.file(),
                location.line(),
                location.column()
            ),
            None => error!("PANIC occurred at unknown location"),
        }
        let payload = panic_info.payload();
        if let Some(s) = payload.downcast_ref::<&str>() {
            error!("Panic message: {}", s);
        } else if let Some(s) = payload.downcast_ref::<String>() {
            error!("Panic message: {}", s);
        } else {
            error!("Panic message: unknown");
        }
        error!("Backtrace:\n{:?}", backtrace);
    }));
}

/// Initialize logging; `RUST_LOG` takes precedence over the verbosity flags
fn init_logging(args: &CliArgs) {
    let level = args.log_level();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("torrent_stream={}", level.as_str().to_lowercase())));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if args.is_verbose() {
        subscriber.pretty().init();
        info!("Using pretty log format (verbose mode)");
    } else {
        subscriber.compact().init();
    }

    debug!("Logging initialized with level {:?}", level);
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_panic_handler();

    let args = CliArgs::parse_args();
    init_logging(&args);
    info!("torrent-stream starting");
    debug!("CLI arguments: {:?}", args);

    let config = Config::from_args(&args).context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    let request = args.job_request();
    let observer = Arc::new(ProgressDisplay::new(args.is_quiet()));

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling download");
            cancel_tx.send_replace(true);
        }
    });

    let result = run_job(&request, &config, observer, cancel_rx).await;
    let outcome = JobOutcome::from_result(&request.job_id, &result);
    println!(
        "{}",
        serde_json::to_string(&outcome).context("Failed to encode job outcome")?
    );

    if result.is_err() {
        std::process::exit(1);
    }
    Ok(())
}
