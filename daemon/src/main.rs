mod config;
mod metrics;
mod scheduler;
mod supervisor;

use anyhow::Context;
use clap::Parser;
use common::EnvironmentConfig;
use config::{Config, LoggingConfig};
use metrics::MetricsCollector;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use supervisor::ServiceSupervisor;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(author, version, about = "Cron-scheduled, size-triggered log rotation daemon")]
struct Args {
    /// Environment to load configuration for (e.g. prod, staging, dev)
    env: String,
    /// Directory holding one service file per environment
    #[arg(long, default_value = common::DEFAULT_CONFIG_DIR)]
    config_dir: PathBuf,
    /// Daemon settings file (.yaml, .yml or .toml)
    #[arg(long, env = "LOGWHEEL_CONFIG")]
    settings: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let settings = Config::load(args.settings.as_deref())?;
    setup_logging(&settings.logging)?;
    log::info!("Starting logwheel-daemon for environment '{}'...", args.env);

    let environment = EnvironmentConfig::load(&args.config_dir, &args.env)
        .with_context(|| format!("Failed to load environment '{}'", args.env))?;
    log::info!(
        "Loaded {} service definition(s) from {}",
        environment.len(),
        environment.source.display()
    );

    let validated = environment.validate();
    for rejected in &validated.rejected {
        log::error!("Skipping service {}: {}", rejected.label, rejected.error);
    }

    let metrics = Arc::new(MetricsCollector::new());
    let mut supervisor = ServiceSupervisor::new(&settings, metrics)?;
    let unscheduled = supervisor.register_all(validated.services);

    if supervisor.is_empty() {
        anyhow::bail!(
            "No services could be scheduled for environment '{}' ({} rejected)",
            args.env,
            validated.rejected.len() + unscheduled.len()
        );
    }

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));

    supervisor.run(shutdown).await;
    log::info!("logwheel-daemon stopped");
    Ok(())
}

async fn wait_for_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = until_ok(tokio::signal::ctrl_c(), "ctrl-c") => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                log::warn!("Failed to install SIGTERM handler: {}", e);
                until_ok(tokio::signal::ctrl_c(), "ctrl-c").await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        until_ok(tokio::signal::ctrl_c(), "ctrl-c").await;
    }

    log::info!("Shutdown requested, no new rotations will start");
    shutdown.cancel();
}

/// Resolve when `listener` reports a signal. A listener that fails to
/// register never resolves, so it cannot trigger a shutdown by itself.
async fn until_ok<F, E>(listener: F, what: &str)
where
    F: Future<Output = Result<(), E>>,
    E: std::fmt::Display,
{
    if let Err(e) = listener.await {
        log::error!("Failed to listen for {}: {}", what, e);
        std::future::pending::<()>().await;
    }
}

fn setup_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{}][{}][{}] {}",
                chrono::Local::now().format("%Y-%m-%d][%H:%M:%S"),
                record.target(),
                record.level(),
                message
            ))
        })
        .level(config.level_filter()?)
        .chain(std::io::stdout());

    if let Some(ref path) = config.output {
        let file = fern::log_file(path)
            .with_context(|| format!("Failed to open log file {:?}", path))?;
        dispatch = dispatch.chain(file);
    }

    dispatch.apply()?;
    Ok(())
}
