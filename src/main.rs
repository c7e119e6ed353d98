use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use relayd::config::Config;
use relayd::manager::ServiceManager;
use relayd::watcher::ConfigWatcher;
use tracing_subscriber::EnvFilter;

/// DNS-aware layer-4 relay: per-service TCP/UDP forwarding with primary/
/// failover backend selection and hot config reload.
#[derive(Parser, Debug)]
#[command(name = "relayd", version, about)]
struct Cli {
    /// Path to the YAML service configuration.
    #[arg(short, long, value_name = "PATH", default_value = "config/config.yaml")]
    config: PathBuf,

    /// Minimum log level. Overridden by the RUST_LOG environment variable
    /// when set.
    #[arg(long, value_enum, default_value = "INFO")]
    log_level: LogLevel,

    /// Log output format.
    #[arg(long, value_enum, default_value = "text")]
    log_format: LogFormat,

    /// Disable the config file watcher; reloads then require a process
    /// restart.
    #[arg(long)]
    no_reload: bool,

    /// Debounce window, in seconds, for collapsing rapid config edits into
    /// a single reload.
    #[arg(long, default_value_t = 10)]
    reload_delay: u64,

    /// DNS cache TTL, in seconds: how often the whole resolver cache is
    /// cleared.
    #[arg(long, default_value_t = 3600)]
    dns_ttl: u64,
}

#[derive(Copy, Clone, Debug, clap::ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// Matches spec §6's literal CLI grammar (`DEBUG|INFO|WARNING|ERROR`) while
/// mapping onto `tracing`'s level names (`warn`, not `warning`) internally.
#[derive(Copy, Clone, Debug, clap::ValueEnum)]
#[value(rename_all = "UPPER")]
enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    fn as_tracing_level(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
            LogLevel::Error => "error",
        }
    }
}

fn init_logging(level: LogLevel, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_tracing_level()));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => subscriber.init(),
        LogFormat::Json => subscriber.json().init(),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.log_level, cli.log_format);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "fatal error");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load(&cli.config).with_context(|| format!("loading config from {}", cli.config.display()))?;

    let (manager, events_rx) = ServiceManager::new(config, Duration::from_secs(cli.dns_ttl))
        .context("constructing service manager")?;

    tokio::spawn(relayd::events::log_consumer(events_rx));

    manager.start_all().await.context("starting services")?;
    tracing::info!("relayd started");

    let watcher = if cli.no_reload {
        None
    } else {
        let manager = manager.clone();
        let config_path = cli.config.clone();
        let debounce = Duration::from_secs(cli.reload_delay);
        let handle = tokio::runtime::Handle::current();
        let watcher = ConfigWatcher::start(&config_path, debounce, move || {
            let manager = manager.clone();
            let config_path = config_path.clone();
            handle.spawn(async move {
                match Config::load(&config_path) {
                    Ok(new_config) => match manager.reload(new_config).await {
                        Ok(()) => tracing::info!("config reloaded"),
                        Err(e) => tracing::error!(error = %e, "reload failed, previous config retained"),
                    },
                    Err(e) => tracing::error!(error = %e, "failed to parse updated config, previous config retained"),
                }
            });
        })
        .context("starting config watcher")?;
        Some(watcher)
    };

    wait_for_shutdown_signal().await;
    tracing::info!("shutdown signal received");

    if let Some(watcher) = watcher {
        watcher.stop();
    }
    manager.shutdown().await;

    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    tokio::select! {
        _ = sigterm.recv() => {}
        _ = sigint.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
