mod access_lists;
mod active_sessions;
mod config;
mod daemon;
mod daemon_log;
mod error;
mod lifecycle_watcher;
mod platform_io;
mod platform_service;
mod process_table;
mod rpc;
mod secure_files;
mod service_paths;
mod write_lock;

#[cfg(test)]
mod testing;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::ServiceConfig;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::filter::filter_fn;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

const BUILD_SHA: &str = env!("GEOPMD_GIT_SHA");

#[derive(Parser)]
#[command(name = "geopmd")]
#[command(about = "Privileged daemon brokering hardware signal and control access")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// YAML configuration file (default: /etc/geopm-service/geopmd.yaml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log filter, e.g. "info" or "geopm_service=debug"
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Append logs to this file instead of stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    /// Override the run root (sessions, control lock, saved controls)
    #[arg(long, global = true)]
    run_root: Option<PathBuf>,

    /// Override the access-list root
    #[arg(long, global = true)]
    config_root: Option<PathBuf>,

    /// Override the RPC socket path
    #[arg(long, global = true)]
    socket: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the platform service until SIGTERM or SIGINT
    Run,
    /// Print the effective configuration as YAML
    CheckConfig,
}

impl Cli {
    /// Config file and environment, then the flags given on the command line.
    fn service_config(&self) -> Result<ServiceConfig> {
        let mut config = ServiceConfig::resolve(self.config.as_deref())?;
        if let Some(path) = &self.run_root {
            config.run_root = path.clone();
        }
        if let Some(path) = &self.config_root {
            config.config_root = path.clone();
        }
        if let Some(path) = &self.socket {
            config.socket_path = path.clone();
        }
        config.validate()?;
        Ok(config)
    }
}

/// Service warnings go out bare so every line starts with the warning
/// prefix; everything else gets the usual fmt decoration.
fn install_logging<W>(filter: EnvFilter, writer: W, ansi: bool)
where
    W: for<'w> MakeWriter<'w> + Clone + Send + Sync + 'static,
{
    let decorated = tracing_subscriber::fmt::layer()
        .with_ansi(ansi)
        .with_writer(writer.clone())
        .with_filter(filter_fn(|meta: &tracing::Metadata<'_>| {
            !daemon_log::is_service_warning(meta)
        }));
    tracing_subscriber::registry()
        .with(filter)
        .with(daemon_log::warning_layer(writer))
        .with(decorated)
        .init();
}

fn init_logging(level: &str, log_file: Option<&PathBuf>) -> Result<()> {
    let filter =
        EnvFilter::try_new(level).with_context(|| format!("Invalid log level: {}", level))?;
    match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file: {}", path.display()))?;
            install_logging(filter, Arc::new(file), false);
        }
        None => install_logging(filter, std::io::stderr, true),
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.service_config()?;
    match cli.command {
        Command::CheckConfig => {
            print!("{}", serde_yaml::to_string(&config)?);
            Ok(())
        }
        Command::Run => {
            init_logging(&cli.log_level, cli.log_file.as_ref())?;
            tracing::info!(build_sha = BUILD_SHA, "geopmd starting");
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .context("Failed to build the tokio runtime")?;
            runtime.block_on(daemon::run(config))
        }
    }
}
