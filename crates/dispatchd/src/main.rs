//! dispatchd: the build-host dispatch daemon.
//!
//! Assembles the placement components over an on-disk state store and
//! exposes each decision as a subcommand. Results are printed to stdout
//! as JSON; logs go to stderr.
//!
//! # Usage
//!
//! ```text
//! dispatchd --config /etc/dispatchd.toml select --project proj --pipeline p1 --stage 1
//! dispatchd start '{"project_id":"proj","pipeline_id":"p1","build_id":"b1","stage_id":"1"}'
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use dispatch_placement::{Dispatcher, Ports};
use dispatch_state::{StateStore, StaticGray};
use tracing::info;

mod commands;
mod config;

use config::{DaemonConfig, LogFormat};

#[derive(Parser)]
#[command(name = "dispatchd", about = "Build-host dispatch daemon", version)]
struct Cli {
    /// Path to dispatchd.toml. Defaults apply when omitted.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the configured data directory.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Select a build host for a (pipeline, stage).
    Select {
        #[arg(long)]
        project: String,
        #[arg(long)]
        pipeline: String,
        #[arg(long)]
        stage: String,
        /// Host IPs that must not be returned.
        #[arg(long)]
        exclude: Vec<String>,
    },
    /// Place and record a starting build. Takes the build-start event as JSON.
    Start { event: String },
    /// Release the slot and in-flight count of a finished build.
    Finish {
        event: String,
        #[arg(long)]
        slot: u32,
        #[arg(long)]
        ip: String,
    },
    /// Show or replace the load threshold tiers.
    LoadConfig {
        #[command(subcommand)]
        action: LoadConfigAction,
    },
    /// Show or replace the drift threshold.
    DriftThreshold {
        #[command(subcommand)]
        action: DriftThresholdAction,
    },
    /// Manage registered build hosts.
    Host {
        #[command(subcommand)]
        action: HostAction,
    },
    /// Print the proxy URL for a path on a build host.
    ProxyUrl {
        uri: String,
        #[arg(long)]
        ip: String,
        /// Defaults to the host's registered port.
        #[arg(long)]
        port: Option<u16>,
    },
}

#[derive(Subcommand)]
enum LoadConfigAction {
    Show,
    /// Replace all three tiers from a JSON object keyed first/second/third.
    Set { json: String },
}

#[derive(Subcommand)]
enum DriftThresholdAction {
    Show,
    Set { value: u32 },
}

#[derive(Subcommand)]
enum HostAction {
    /// Insert or replace a host from its JSON record.
    Put { json: String },
    List,
    /// Dedicate hosts to a project. No IPs clears the dedication.
    Dedicate { project: String, ips: Vec<String> },
}

fn init_tracing(format: LogFormat) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| "info,dispatchd=debug,dispatch=debug".parse())?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => DaemonConfig::from_file(path)?,
        None => DaemonConfig::default(),
    };
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }
    init_tracing(config.log_format)?;

    std::fs::create_dir_all(&config.data_dir)?;
    let db_path = config.db_path();
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, gray_env = config.gray_env, "state store opened");

    let dispatcher = Dispatcher::new(
        Ports::from_store(&store, StaticGray(config.gray_env)),
        config.dispatch.clone(),
    );

    match cli.command {
        Command::Select {
            project,
            pipeline,
            stage,
            exclude,
        } => commands::build::select(&dispatcher, &project, &pipeline, &stage, exclude).await,
        Command::Start { event } => commands::build::start(&dispatcher, &event).await,
        Command::Finish { event, slot, ip } => {
            commands::build::finish(&dispatcher, &event, slot, &ip).await
        }
        Command::LoadConfig { action } => match action {
            LoadConfigAction::Show => commands::tuning::show_load_config(&dispatcher).await,
            LoadConfigAction::Set { json } => {
                commands::tuning::set_load_config(&dispatcher, &json).await
            }
        },
        Command::DriftThreshold { action } => match action {
            DriftThresholdAction::Show => commands::tuning::show_drift_threshold(&dispatcher).await,
            DriftThresholdAction::Set { value } => {
                commands::tuning::set_drift_threshold(&dispatcher, value).await
            }
        },
        Command::Host { action } => match action {
            HostAction::Put { json } => commands::host::put(&store, &json),
            HostAction::List => commands::host::list(&store),
            HostAction::Dedicate { project, ips } => {
                commands::host::dedicate(&store, &project, &ips)
            }
        },
        Command::ProxyUrl { uri, ip, port } => {
            commands::host::proxy_url(&dispatcher, &uri, &ip, port).await
        }
    }
}
