//! regionsyncd — the regionsync replication agent.
//!
//! # Usage
//!
//! ```text
//! regionsyncd run --config /etc/regionsync/regionsync.toml
//! regionsyncd submit --config regionsync.toml create-table orders --id 11 --regions eu-west
//! regionsyncd status --config regionsync.toml
//! ```
//!
//! The served store is a redb file, which one process at a time may hold.
//! `submit`, `status` and `checkpoints` open it directly and so run while
//! the agent is stopped.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::bail;
use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use regionsync_checkpoint::{AesGcmCipher, CheckpointStore, RetryPolicy};
use regionsync_core::{AgentConfig, Shutdown};
use regionsync_request::RequestTable;
use regionsync_state::{RequestPayload, StateStore, TableMetadata};
use regionsyncd::{Agent, SourceStores, exit_code, open_local_store};

const DEFAULT_FILTER: &str = "info,regionsyncd=debug,regionsync=debug";

#[derive(Parser)]
#[command(name = "regionsyncd", about = "regionsync replication agent")]
struct Cli {
    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run the agent until a signal or a Shutdown request.
    Run {
        #[arg(long, short)]
        config: PathBuf,

        /// Host every agent index of the group in this process.
        #[arg(long)]
        whole_group: bool,
    },
    /// Post a lifecycle request to the served store and print its id.
    Submit {
        #[arg(long, short)]
        config: PathBuf,

        #[command(subcommand)]
        request: RequestArg,
    },
    /// Print regions, tables, requests, responses, versions and streaming
    /// records of the served store as JSON.
    Status {
        #[arg(long, short)]
        config: PathBuf,
    },
    /// List this agent's initialization checkpoints.
    Checkpoints {
        #[arg(long, short)]
        config: PathBuf,

        /// Delete checkpoints whose copy completed.
        #[arg(long)]
        collect: bool,
    },
}

#[derive(Subcommand)]
enum RequestArg {
    CreateTable(TableArgs),
    UpdateTable(TableArgs),
    DropTable(TableArgs),
    CreateChildTable(TableArgs),
    DropChildTable(TableArgs),
    AddRegion { region: String },
    RemoveRegion { region: String },
    Shutdown,
}

#[derive(Args)]
struct TableArgs {
    name: String,

    /// Live table id.
    #[arg(long)]
    id: u64,

    /// Source regions the table replicates from.
    #[arg(long, value_delimiter = ',')]
    regions: Vec<String>,

    /// Parent table, for nested tables.
    #[arg(long)]
    parent: Option<String>,

    #[arg(long, default_value_t = 0)]
    schema_version: u32,
}

impl TableArgs {
    /// Resolve region names to the served store's ids.
    fn metadata(self, store: &StateStore) -> anyhow::Result<TableMetadata> {
        let mut ids = Vec::with_capacity(self.regions.len());
        for region in &self.regions {
            let Some(id) = store.region_id(region)? else {
                bail!("region {region} has no id in the served store; submit add-region first");
            };
            ids.push(id);
        }
        let mut table = TableMetadata::new(&self.name, self.id, ids).with_schema_version(self.schema_version);
        if let Some(parent) = &self.parent {
            table = table.with_parent(parent);
        }
        Ok(table)
    }
}

impl RequestArg {
    fn into_payload(self, store: &StateStore) -> anyhow::Result<RequestPayload> {
        Ok(match self {
            RequestArg::CreateTable(t) => RequestPayload::CreateTable { table: t.metadata(store)? },
            RequestArg::UpdateTable(t) => RequestPayload::UpdateTable { table: t.metadata(store)? },
            RequestArg::DropTable(t) => RequestPayload::DropTable { table: t.metadata(store)? },
            RequestArg::CreateChildTable(t) => {
                RequestPayload::CreateChildTable { table: t.metadata(store)? }
            }
            RequestArg::DropChildTable(t) => {
                RequestPayload::DropChildTable { table: t.metadata(store)? }
            }
            RequestArg::AddRegion { region } => RequestPayload::AddRegion { region },
            RequestArg::RemoveRegion { region } => RequestPayload::RemoveRegion { region },
            RequestArg::Shutdown => RequestPayload::Shutdown,
        })
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let result = match cli.command {
        Command::Run { config, whole_group } => run(&config, whole_group).await,
        Command::Submit { config, request } => submit(&config, request),
        Command::Status { config } => status(&config),
        Command::Checkpoints { config, collect } => checkpoints(&config, collect).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let code = exit_code(&e);
            error!(error = %format!("{e:#}"), code, "regionsyncd failed");
            ExitCode::from(code)
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn run(config_path: &Path, whole_group: bool) -> anyhow::Result<()> {
    let config = AgentConfig::from_file(config_path)?;
    let store = open_local_store(&config)?;
    let stores = SourceStores::new();

    let indices: Vec<u32> = if whole_group {
        (0..config.agent.group_size).collect()
    } else {
        vec![config.agent.index]
    };
    let mut agents = Vec::with_capacity(indices.len());
    for index in indices {
        let agent = Agent::new(config.clone(), store.clone())?
            .with_index(index)?
            .with_source_stores(stores.clone());
        agents.push(agent);
    }
    let triggers: Vec<_> = agents.iter().map(Agent::trigger).collect();

    let signal_triggers = triggers.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received");
        for trigger in &signal_triggers {
            trigger.trigger();
        }
    });

    let mut running = JoinSet::new();
    for agent in agents {
        running.spawn(agent.run());
    }

    // One failed agent stops the rest of the process.
    let mut first_error = None;
    while let Some(joined) = running.join_next().await {
        let result = joined.map_err(|e| anyhow::anyhow!("agent task panicked: {e}"));
        match result.and_then(|r| r) {
            Ok(exit) => info!(?exit, "agent finished"),
            Err(e) => {
                error!(error = %format!("{e:#}"), "agent failed");
                for trigger in &triggers {
                    trigger.trigger();
                }
                first_error.get_or_insert(e);
            }
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
                return;
            }
            Err(e) => warn!(error = %e, "SIGTERM handler unavailable"),
        }
    }
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "ctrl-c handler unavailable, running until killed");
        std::future::pending::<()>().await;
    }
}

fn submit(config_path: &Path, request: RequestArg) -> anyhow::Result<()> {
    let config = AgentConfig::from_file(config_path)?;
    let store = open_local_store(&config)?;
    store.init_local_region(config.serving.name())?;

    let payload = request.into_payload(&store)?;
    let request = RequestTable::new(store).submit(payload)?;
    info!(request_id = request.id, kind = %request.kind(), "request submitted");
    println!("{}", request.id);
    Ok(())
}

fn status(config_path: &Path) -> anyhow::Result<()> {
    let config = AgentConfig::from_file(config_path)?;
    let store = open_local_store(&config)?;

    let report = serde_json::json!({
        "region": config.serving.name(),
        "regions": store.list_regions()?,
        "tables": store.list_tables()?,
        "requests": store.scan_requests(None, 1000)?,
        "responses": store.list_responses()?,
        "versions": store.get_versions()?,
        "streaming": store.list_streaming()?,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn checkpoints(config_path: &Path, collect: bool) -> anyhow::Result<()> {
    let config = AgentConfig::from_file(config_path)?;
    let identity = config.identity()?;
    let store = open_local_store(&config)?;

    let mut checkpoints = CheckpointStore::new(
        store,
        &identity.agent_id(),
        config.serving.name(),
        RetryPolicy::from_config(&config)?,
        Shutdown::never(),
    );
    if let Some(key) = config.encryption_key()? {
        checkpoints = checkpoints.with_cipher(std::sync::Arc::new(AesGcmCipher::new(&key)));
    }

    for c in checkpoints.list().await? {
        println!(
            "{}\t{}\t{:?}\tlocal={}\tremote={}\t{}",
            c.source_region,
            c.table,
            c.state,
            c.local_table_id,
            c.remote_table_id,
            c.message.as_deref().unwrap_or("")
        );
    }
    if collect {
        let removed = checkpoints.collect_completed().await?;
        println!("removed {removed} completed checkpoint(s)");
    }
    Ok(())
}
