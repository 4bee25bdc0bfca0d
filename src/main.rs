//! draftflow command line entry point

use draftflow::agent::{AgentCapability, LlmAgent};
use draftflow::config::DraftflowConfig;
use draftflow::context::PipelineInputs;
use draftflow::gate::OperatorReply;
use draftflow::llm::providers::{OpenAiConfig, OpenAiProvider};
use draftflow::observability::{init_default_logging, HealthServer};
use draftflow::orchestrator::Orchestrator;
use draftflow::persistence::PersistenceGateway;
use draftflow::steps::{self, CATALOG};
use draftflow::transport::{ConsoleChannel, MqttChannel, NotificationChannel};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Orchestrates long-form content pipelines
#[derive(Parser)]
#[command(name = "draftflow")]
#[command(about = "Orchestrates LLM agents from a brief to a finished article")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "DRAFTFLOW_CONFIG")]
    config: Option<PathBuf>,

    /// Owner recorded on new processes and checked on restore
    #[arg(long, default_value = "cli", env = "DRAFTFLOW_OWNER")]
    owner: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum ChannelKind {
    Console,
    Mqtt,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a new process
    Run {
        #[arg(long)]
        brief: String,
        #[arg(long)]
        audience: Option<String>,
        #[arg(long)]
        tone: Option<String>,
        #[arg(long)]
        target_words: Option<u32>,
        #[arg(long, value_enum, default_value = "console")]
        channel: ChannelKind,
    },
    /// Continue a stored process
    Resume {
        process_id: String,
        #[arg(long, value_enum, default_value = "console")]
        channel: ChannelKind,
    },
    /// Answer a pending input request, e.g. '{"action":"approve"}'
    Respond { process_id: String, reply: String },
    /// Show the stored status of a process
    Status { process_id: String },
    /// List the snapshot chain of a process
    Snapshots { process_id: String },
    /// Check out a snapshot as the live state
    Restore {
        process_id: String,
        snapshot_id: String,
    },
    /// Cancel a stored process
    Cancel { process_id: String },
    /// Print and check the step catalog
    Catalog,
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_default_logging();

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run {
            brief,
            audience,
            tone,
            target_words,
            channel,
        } => {
            let inputs = PipelineInputs {
                brief,
                audience,
                tone,
                target_words,
            };
            run_process(&config, &cli.owner, inputs, channel).await
        }
        Commands::Resume {
            process_id,
            channel,
        } => resume_process(&config, &process_id, channel).await,
        Commands::Respond { process_id, reply } => respond(&config, &process_id, &reply).await,
        Commands::Status { process_id } => show_status(&config, &process_id).await,
        Commands::Snapshots { process_id } => show_snapshots(&config, &process_id).await,
        Commands::Restore {
            process_id,
            snapshot_id,
        } => restore(&config, &process_id, &snapshot_id, &cli.owner).await,
        Commands::Cancel { process_id } => cancel(&config, &process_id).await,
        Commands::Catalog => show_catalog(),
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn load_configuration(config_path: &Option<PathBuf>) -> CliResult<DraftflowConfig> {
    match config_path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            Ok(DraftflowConfig::load_from_file(path)?)
        }
        None => {
            let default_paths = ["draftflow.toml", "config/draftflow.toml"];
            for path_str in default_paths {
                let path = PathBuf::from(path_str);
                if path.exists() {
                    info!("Loading configuration from: {}", path.display());
                    return Ok(DraftflowConfig::load_from_file(&path)?);
                }
            }
            info!("No configuration file found, using defaults");
            Ok(DraftflowConfig::default())
        }
    }
}

fn build_capability(config: &DraftflowConfig) -> CliResult<Arc<dyn AgentCapability>> {
    let mut openai = OpenAiConfig {
        api_key: config.get_llm_api_key()?,
        timeout: Duration::from_secs(config.llm.timeout_secs),
        ..Default::default()
    };
    if let Some(base_url) = &config.llm.base_url {
        openai.base_url = base_url.clone();
    }
    let provider = Arc::new(OpenAiProvider::new(openai)?);
    Ok(Arc::new(LlmAgent::from_config(
        provider,
        &config.llm,
        &config.agents,
    )))
}

async fn build_orchestrator(config: &DraftflowConfig) -> CliResult<Orchestrator> {
    let orchestrator = Orchestrator::from_config(config, build_capability(config)?)?;

    if let Some(health) = &config.health {
        let server = Arc::new(HealthServer::new(
            "draftflow",
            health.port,
            orchestrator.gateway().clone(),
            orchestrator.registry().clone(),
        ));
        tokio::spawn(server.start());
    }
    Ok(orchestrator)
}

async fn open_channel(
    config: &DraftflowConfig,
    kind: ChannelKind,
    process_id: &str,
) -> CliResult<Arc<dyn NotificationChannel>> {
    match kind {
        ChannelKind::Console => Ok(Arc::new(ConsoleChannel::new())),
        ChannelKind::Mqtt => {
            let section = config
                .mqtt
                .as_ref()
                .ok_or("the mqtt channel needs an [mqtt] configuration section")?;
            Ok(Arc::new(MqttChannel::connect(section, process_id).await?))
        }
    }
}

async fn run_process(
    config: &DraftflowConfig,
    owner: &str,
    inputs: PipelineInputs,
    channel: ChannelKind,
) -> CliResult<()> {
    let orchestrator = build_orchestrator(config).await?;
    let ctx = orchestrator.create(owner, inputs).await?;
    info!(process_id = %ctx.process_id, "Starting process");
    drive(&orchestrator, config, &ctx.process_id, channel).await
}

async fn resume_process(
    config: &DraftflowConfig,
    process_id: &str,
    channel: ChannelKind,
) -> CliResult<()> {
    let orchestrator = build_orchestrator(config).await?;
    drive(&orchestrator, config, process_id, channel).await
}

/// Attach a channel, which starts or resumes the run, and follow it until
/// it finishes, suspends or Ctrl-C cancels it
async fn drive(
    orchestrator: &Orchestrator,
    config: &DraftflowConfig,
    process_id: &str,
    kind: ChannelKind,
) -> CliResult<()> {
    let channel = open_channel(config, kind, process_id).await?;
    orchestrator.attach(process_id, channel).await?;

    let view = tokio::select! {
        view = follow(orchestrator, process_id) => view?,
        _ = signal::ctrl_c() => {
            info!("Received Ctrl-C, cancelling process");
            orchestrator.cancel(process_id).await?;
            orchestrator.wait(process_id).await?
        }
    };

    println!("{}", serde_json::to_string_pretty(&view)?);
    Ok(())
}

/// Wait across runs: a live reply can start a new run after a timeout
async fn follow(
    orchestrator: &Orchestrator,
    process_id: &str,
) -> CliResult<draftflow::persistence::ProcessStatusView> {
    loop {
        let view = orchestrator.wait(process_id).await?;
        if !orchestrator.is_running(process_id) {
            return Ok(view);
        }
    }
}

async fn respond(config: &DraftflowConfig, process_id: &str, reply: &str) -> CliResult<()> {
    let reply: OperatorReply = serde_json::from_str(reply)?;
    let orchestrator = build_orchestrator(config).await?;
    let decision = orchestrator.respond(process_id, reply).await?;
    info!(process_id, action = decision.action(), "Reply accepted");

    let view = orchestrator.wait(process_id).await?;
    println!("{}", serde_json::to_string_pretty(&view)?);
    Ok(())
}

async fn show_status(config: &DraftflowConfig, process_id: &str) -> CliResult<()> {
    let gateway = PersistenceGateway::from_config(&config.storage)?;
    let view = gateway.status(process_id).await?;
    println!("{}", serde_json::to_string_pretty(&view)?);
    Ok(())
}

async fn show_snapshots(config: &DraftflowConfig, process_id: &str) -> CliResult<()> {
    let gateway = PersistenceGateway::from_config(&config.storage)?;
    for snapshot in gateway.list_snapshots(process_id).await? {
        println!(
            "{} {:<16} -> {:<16} parent={} {}",
            snapshot.snapshot_id,
            snapshot.step.to_string(),
            snapshot.resumes_at.to_string(),
            snapshot.parent_id.as_deref().unwrap_or("-"),
            if snapshot.is_head { "HEAD" } else { "" }
        );
    }
    Ok(())
}

async fn restore(
    config: &DraftflowConfig,
    process_id: &str,
    snapshot_id: &str,
    owner: &str,
) -> CliResult<()> {
    let gateway = PersistenceGateway::from_config(&config.storage)?;
    let ctx = gateway.restore(process_id, snapshot_id, owner).await?;
    println!(
        "Restored {} at {}; run `draftflow resume {}` to continue",
        process_id, ctx.current_step, process_id
    );
    Ok(())
}

async fn cancel(config: &DraftflowConfig, process_id: &str) -> CliResult<()> {
    let gateway = PersistenceGateway::from_config(&config.storage)?;
    let ctx = gateway.cancel_stored(process_id).await?;
    if ctx.status != draftflow::ProcessStatus::Cancelled {
        warn!(process_id, status = ?ctx.status, "Process had already finished");
    }
    println!("{} {}", process_id, ctx.current_step);
    Ok(())
}

fn show_catalog() -> CliResult<()> {
    steps::validate()?;
    println!("{:<18} {:<20} {:<18} {:<10} agent", "step", "kind", "next", "resilient");
    for row in CATALOG.iter() {
        println!(
            "{:<18} {:<20} {:<18} {:<10} {}",
            row.step.to_string(),
            row.kind.to_string(),
            row.next.map(|s| s.to_string()).unwrap_or_else(|| "-".to_string()),
            row.resilient,
            row.agent.unwrap_or("-")
        );
    }
    Ok(())
}

fn handle_config_command(config: &DraftflowConfig, show: bool) -> CliResult<()> {
    config.validate()?;
    if show {
        println!("{}", toml::to_string_pretty(config)?);
    }
    info!("Configuration validation complete");
    Ok(())
}
