mod daemon;
mod memory_cmds;
mod scheduler_cmds;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use reverie_config::AppConfig;
use reverie_llm::{Embedder, Generator, OllamaGenerator, build_embedder};
use reverie_memory::{DurableStore, GraphParams, LockOptions, MemoryGraph};

const DEFAULT_CONFIG: &str = "config/default.toml";

#[derive(Debug, Parser)]
#[command(
    name = "reverie",
    version,
    about = "Persistent associative memory with an adaptive background scheduler"
)]
struct Cli {
    /// Configuration file (TOML).
    #[arg(long, global = true, default_value = DEFAULT_CONFIG)]
    config: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the scheduler until interrupted.
    Run,
    /// Validate and repair the data directory.
    Audit {
        #[arg(long)]
        json: bool,
    },
    Memory {
        #[command(subcommand)]
        command: MemoryCommands,
    },
    Scheduler {
        #[command(subcommand)]
        command: SchedulerCommands,
    },
    Mood {
        #[command(subcommand)]
        command: MoodCommands,
    },
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Debug, Subcommand)]
enum MemoryCommands {
    /// Store a record and link it to its neighbours.
    Add {
        text: String,
        #[arg(long, default_value = "external")]
        origin: String,
    },
    Search {
        query: String,
        #[arg(short, long, default_value_t = 5)]
        k: usize,
    },
    /// Records linked to `id`, strongest first.
    Associated {
        id: String,
        #[arg(long)]
        min_strength: Option<f64>,
    },
    /// Breadth-first walk of the association graph.
    Trace {
        id: String,
        #[arg(long, default_value_t = 2)]
        depth: usize,
        #[arg(long, default_value_t = 3)]
        branch: usize,
    },
    Show {
        id: String,
    },
    Stats,
    /// Apply activation decay now.
    Decay,
    /// List concept clusters.
    Concepts {
        /// Regroup every record before listing.
        #[arg(long)]
        regroup: bool,
    },
    /// Records in one concept cluster.
    Concept {
        id: String,
    },
    /// Rebuild the vector index from stored records.
    RebuildIndex {
        /// Also rederive the association graph from record connections.
        #[arg(long)]
        associations: bool,
    },
}

#[derive(Debug, Subcommand)]
enum SchedulerCommands {
    /// Per-job last run, interval bounds and whether it is due.
    Status,
    /// Record a job as executed now.
    Mark { kind: String },
    /// Nudge the dynamic intervals once.
    Retune,
}

#[derive(Debug, Subcommand)]
enum MoodCommands {
    Show,
    Set {
        mood: String,
        #[arg(long, default_value_t = 0.5)]
        intensity: f64,
    },
}

#[derive(Debug, Subcommand)]
enum ConfigCommands {
    Show,
    /// Write the effective configuration to the config path.
    Init {
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = AppConfig::load_from(&cli.config)?;
    let _log_guard = init_tracing(&config);

    match cli.command {
        Commands::Run => daemon::run(config).await?,
        Commands::Audit { json } => scheduler_cmds::run_audit(&config, json).await?,
        Commands::Memory { command } => {
            let mut memory = open_memory(&config).await?;
            match command {
                MemoryCommands::Add { text, origin } => memory_cmds::add(&mut memory, &text, &origin).await?,
                MemoryCommands::Search { query, k } => memory_cmds::search(&mut memory, &query, k).await?,
                MemoryCommands::Associated { id, min_strength } => {
                    memory_cmds::associated(&memory, &id, min_strength)?
                }
                MemoryCommands::Trace { id, depth, branch } => memory_cmds::trace(&memory, &id, depth, branch)?,
                MemoryCommands::Show { id } => memory_cmds::show(&memory, &id)?,
                MemoryCommands::Stats => memory_cmds::stats(&memory)?,
                MemoryCommands::Decay => memory_cmds::decay(&memory).await?,
                MemoryCommands::Concepts { regroup } => memory_cmds::concepts(&mut memory, regroup).await?,
                MemoryCommands::Concept { id } => memory_cmds::concept(&memory, &id)?,
                MemoryCommands::RebuildIndex { associations } => {
                    memory_cmds::rebuild(&mut memory, associations).await?
                }
            }
        }
        Commands::Scheduler { command } => {
            let clock = scheduler_cmds::open_clock(&config).await?;
            match command {
                SchedulerCommands::Status => scheduler_cmds::status(&clock)?,
                SchedulerCommands::Mark { kind } => scheduler_cmds::mark(&clock, &kind).await?,
                SchedulerCommands::Retune => scheduler_cmds::retune(&clock).await?,
            }
        }
        Commands::Mood { command } => {
            let clock = scheduler_cmds::open_clock(&config).await?;
            match command {
                MoodCommands::Show => scheduler_cmds::mood_show(&clock)?,
                MoodCommands::Set { mood, intensity } => scheduler_cmds::mood_set(&clock, &mood, intensity).await?,
            }
        }
        Commands::Config { command } => match command {
            ConfigCommands::Show => print!("{}", toml::to_string_pretty(&config)?),
            ConfigCommands::Init { force } => init_config(&config, &cli.config, force)?,
        },
    }

    Ok(())
}

/// `RUST_LOG` wins over the configured level.  With `telemetry.log_dir`
/// set, a daily rolling file receives the same events; the returned guard
/// must live until exit so buffered lines are flushed.
fn init_tracing(config: &AppConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.telemetry.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    match config.telemetry.log_dir.as_deref().filter(|dir| !dir.trim().is_empty()) {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "reverie.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(filter).with(stderr).init();
            None
        }
    }
}

fn init_config(config: &AppConfig, path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists; pass --force to overwrite", path.display());
    }
    config.save_to(path)?;
    println!("configuration written to {}", path.display());
    Ok(())
}

pub(crate) fn durable_store(config: &AppConfig) -> DurableStore {
    DurableStore::new(LockOptions::from(&config.storage))
}

pub(crate) fn build_model_embedder(config: &AppConfig) -> Result<Arc<dyn Embedder>> {
    build_embedder(
        &config.llm.embedder,
        &config.llm.embed_model,
        &config.llm.base_url,
        config.llm.embedding_dim,
    )
}

pub(crate) fn build_generator(config: &AppConfig) -> Result<Arc<dyn Generator>> {
    match config.llm.provider.trim().to_ascii_lowercase().as_str() {
        "ollama" => Ok(Arc::new(OllamaGenerator::new(&config.llm.model, &config.llm.base_url))),
        other => bail!("unsupported llm provider: {other}"),
    }
}

async fn open_memory(config: &AppConfig) -> Result<MemoryGraph> {
    let memory = MemoryGraph::open(
        config.storage.data_path(),
        build_model_embedder(config)?,
        GraphParams::from(&config.memory),
        LockOptions::from(&config.storage),
    )
    .await?;
    Ok(memory)
}
