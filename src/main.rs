use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{CommandFactory, Parser, Subcommand};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use chatflow_channels::util::render_plain;
use chatflow_channels::{AdapterSink, ChannelDispatcher, ConsoleAdapter};
use chatflow_core::config::AppConfig;
use chatflow_core::event::EventBus;
use chatflow_core::flow::{FlowDefinition, FlowDocument};
use chatflow_core::traits::{EffectSink, FlowStore};
use chatflow_core::types::{ContactId, FlowEvent, FlowId};
use chatflow_engine::{
    validate_flow, EngineOptions, ExecutionEngine, FlowCatalog, LaneRegistry, RunLogger, Services,
    SimulationRunner, TranscriptEntry,
};
use chatflow_store::SqliteStore;

#[derive(Parser)]
#[command(name = "chatflow", version, about = "Conversational flow engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "chatflow.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a flow document for graph errors
    Validate {
        /// Exported flow document (JSON)
        file: PathBuf,
    },
    /// Store a flow document as a new draft version
    Import {
        file: PathBuf,
        /// Activate the imported version right away
        #[arg(long)]
        activate: bool,
    },
    /// Write a stored flow as a portable document
    Export {
        flow: String,
        /// Version to export (latest when omitted)
        #[arg(long)]
        version: Option<u32>,
        /// Output file (stdout when omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// List stored flow versions
    List,
    /// Make a version the one new conversations start on
    Activate {
        flow: String,
        #[arg(long)]
        version: Option<u32>,
    },
    /// Stop new conversations from starting on a flow
    Deactivate { flow: String },
    /// Delete every version of a flow without live runs
    Delete { flow: String },
    /// List live runs of a flow
    Runs { flow: String },
    /// Preview a flow without external side effects
    Simulate {
        /// Flow document path or stored flow id
        source: String,
        /// Scripted reply for the next waiting node (repeatable)
        #[arg(short, long = "reply")]
        replies: Vec<String>,
        /// Message that starts the run
        #[arg(long, default_value = "hi")]
        trigger: String,
        /// Print transcript entries as JSON lines
        #[arg(long)]
        json: bool,
        /// Call the configured integrations instead of simulated ones
        #[arg(long)]
        live: bool,
    },
    /// Talk to the active flow of a channel from the terminal
    Chat {
        /// Channel id the console poses as
        #[arg(long, default_value = "console")]
        channel: String,
        /// Contact id the console poses as
        #[arg(long, default_value = "console")]
        contact: String,
    },
    /// Force-close a contact's live run
    Stop { flow: String, contact: String },
    /// Show current configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("chatflow=info,warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // Handle commands that need no config first
    match &cli.command {
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(*shell, &mut cmd, "chatflow", &mut std::io::stdout());
            return Ok(());
        }
        Commands::Validate { file } => return validate_file(file),
        _ => {}
    }

    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Config => {
            let mut shown = config.clone();
            if let Some(llm) = shown.llm.as_mut() {
                if llm.api_key.is_some() {
                    llm.api_key = Some("********".into());
                }
            }
            println!("{:#?}", shown);
        }
        Commands::Import { file, activate } => {
            let store = open_store(&config)?;
            let catalog = FlowCatalog::new(store.clone(), store);
            let json = std::fs::read_to_string(&file)?;
            let flow = catalog.import(&json).await?;
            println!("Imported {} v{}", flow.id, flow.version);
            for issue in validate_flow(&flow) {
                println!("  issue: {}", issue);
            }
            if activate {
                catalog.activate(&flow.id, Some(flow.version)).await?;
                println!("Activated {} v{}", flow.id, flow.version);
            }
        }
        Commands::Export { flow, version, output } => {
            let store = open_store(&config)?;
            let catalog = FlowCatalog::new(store.clone(), store);
            let doc = catalog.export(&FlowId::from_str(&flow), version).await?;
            match output {
                Some(path) => {
                    std::fs::write(&path, doc)?;
                    info!(path = %path.display(), "Flow exported");
                }
                None => println!("{}", doc),
            }
        }
        Commands::List => {
            let store = open_store(&config)?;
            let catalog = FlowCatalog::new(store.clone(), store);
            let flows = catalog.list().await?;
            if flows.is_empty() {
                println!("No flows stored.");
            }
            for f in flows {
                println!(
                    "{:<24} v{:<4} {:<9} {:<12} {}",
                    f.id.0,
                    f.version,
                    format!("{:?}", f.status).to_lowercase(),
                    f.channel_binding.as_deref().unwrap_or("-"),
                    f.name
                );
            }
        }
        Commands::Activate { flow, version } => {
            let store = open_store(&config)?;
            let catalog = FlowCatalog::new(store.clone(), store);
            let flow = catalog.activate(&FlowId::from_str(&flow), version).await?;
            println!("Activated {} v{}", flow.id, flow.version);
        }
        Commands::Deactivate { flow } => {
            let store = open_store(&config)?;
            let catalog = FlowCatalog::new(store.clone(), store);
            if catalog.deactivate(&FlowId::from_str(&flow)).await? {
                println!("Deactivated {}", flow);
            } else {
                println!("{} has no active version", flow);
            }
        }
        Commands::Delete { flow } => {
            let store = open_store(&config)?;
            let catalog = FlowCatalog::new(store.clone(), store);
            let removed = catalog.delete(&FlowId::from_str(&flow)).await?;
            println!("Deleted {} ({} version(s))", flow, removed);
        }
        Commands::Runs { flow } => {
            let store = open_store(&config)?;
            let catalog = FlowCatalog::new(store.clone(), store);
            let runs = catalog.live_runs(&FlowId::from_str(&flow)).await?;
            if runs.is_empty() {
                println!("No live runs.");
            }
            for run in runs {
                println!(
                    "{:<20} v{:<4} {:<13} {:<16} {}",
                    run.contact_id.0,
                    run.flow_version,
                    run.status.as_str(),
                    run.current_node_id,
                    run.updated_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
        Commands::Simulate {
            source,
            replies,
            trigger,
            json,
            live,
        } => {
            simulate(&config, &source, replies, trigger, json, live).await?;
        }
        Commands::Chat { channel, contact } => {
            chat(&config, &channel, &contact).await?;
        }
        Commands::Stop { flow, contact } => {
            let store = open_store(&config)?;
            let engine = build_engine(&config, store, Arc::new(AdapterSink::new()), Arc::new(EventBus::default()));
            if engine
                .stop(&FlowId::from_str(&flow), &ContactId::from_str(&contact))
                .await?
            {
                println!("Stopped run of {} for {}", flow, contact);
            } else {
                println!("No live run of {} for {}", flow, contact);
            }
        }
        Commands::Completions { .. } | Commands::Validate { .. } => {}
    }

    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        return Ok(AppConfig::load(path)?);
    }
    let home_config = dirs_home().map(|h| h.join(".chatflow").join("config.toml"));
    match home_config {
        Some(ref home) if home.exists() => {
            info!(path = %home.display(), "Loading config from home directory");
            Ok(AppConfig::load(home)?)
        }
        _ => {
            warn!(path = %path.display(), "No config file found, using defaults");
            Ok(AppConfig::default())
        }
    }
}

fn open_store(config: &AppConfig) -> anyhow::Result<Arc<SqliteStore>> {
    let path = config.storage_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(Arc::new(SqliteStore::open(&path)?))
}

fn services(config: &AppConfig) -> Services {
    let completion = config
        .llm
        .as_ref()
        .map(|llm| chatflow_integrations::create_completion_client(llm, &config.http));
    if completion.is_none() {
        info!("No [llm] section, language model nodes will take their error edge");
    }
    Services {
        http: chatflow_integrations::create_http_client(&config.http),
        completion,
        sub_bot: chatflow_integrations::create_sub_bot_client(&config.http),
        contacts: chatflow_integrations::create_contact_directory(),
    }
}

fn build_engine(
    config: &AppConfig,
    store: Arc<SqliteStore>,
    sink: Arc<dyn EffectSink>,
    bus: Arc<EventBus>,
) -> ExecutionEngine {
    ExecutionEngine::new(
        store.clone(),
        store,
        services(config),
        sink,
        bus,
        EngineOptions::from_config(&config.engine),
    )
    .with_hooks(config.hooks.clone())
}

fn validate_file(file: &Path) -> anyhow::Result<()> {
    let json = std::fs::read_to_string(file)?;
    let flow = FlowDocument::import(&json)?;
    let issues = validate_flow(&flow);
    if issues.is_empty() {
        println!("{}: ok ({} nodes, {} edges)", flow.id, flow.nodes.len(), flow.edges.len());
        return Ok(());
    }
    for issue in &issues {
        println!("{}: {}", flow.id, issue);
    }
    anyhow::bail!("{} validation issue(s)", issues.len())
}

async fn simulate(
    config: &AppConfig,
    source: &str,
    replies: Vec<String>,
    trigger: String,
    json: bool,
    live: bool,
) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let entry = load_source(store.as_ref(), source).await?;

    let mut runner = SimulationRunner::new(entry.clone())
        .with_script(replies)
        .with_trigger(trigger)
        .with_max_steps(config.simulation.max_steps)
        .with_engine_options(EngineOptions::from_config(&config.engine));
    // Stored flows stay reachable as switch targets
    for other in switch_targets(store.as_ref(), &entry.id).await? {
        runner = runner.with_flow(other);
    }
    if live {
        runner = runner.with_services(services(config));
    }

    let mut simulation = runner.start()?;
    while let Some(entry) = simulation.next_entry().await? {
        if json {
            println!("{}", serde_json::to_string(&entry)?);
        } else {
            println!("{}", describe(&entry));
        }
    }
    Ok(())
}

async fn load_source(store: &SqliteStore, source: &str) -> anyhow::Result<FlowDefinition> {
    let path = Path::new(source);
    if path.exists() {
        let json = std::fs::read_to_string(path)?;
        return Ok(FlowDocument::import(&json)?);
    }
    store
        .latest_flow(&FlowId::from_str(source))
        .await?
        .ok_or_else(|| anyhow::anyhow!("No flow file or stored flow named '{}'", source))
}

async fn switch_targets(store: &SqliteStore, entry: &FlowId) -> anyhow::Result<Vec<FlowDefinition>> {
    let ids: BTreeSet<FlowId> = store
        .list_flows()
        .await?
        .into_iter()
        .map(|f| f.id)
        .filter(|id| id != entry)
        .collect();
    let mut flows = Vec::with_capacity(ids.len());
    for id in ids {
        let flow = match store.active_flow(&id).await? {
            Some(active) => Some(active),
            None => store.latest_flow(&id).await?,
        };
        flows.extend(flow);
    }
    Ok(flows)
}

fn describe(entry: &TranscriptEntry) -> String {
    match entry {
        TranscriptEntry::Inbound { text } => format!("you> {}", text),
        TranscriptEntry::Bot(message) => format!("bot> {}", render_plain(message)),
        TranscriptEntry::Handoff(record) => format!("[handoff to {}]", record.target),
        TranscriptEntry::Integration {
            node_id,
            kind,
            target,
            succeeded,
        } => format!(
            "[{} {} at {}: {}]",
            kind,
            target,
            node_id,
            if *succeeded { "ok" } else { "failed" }
        ),
        TranscriptEntry::Finished { status, reason } => match reason {
            Some(reason) => format!("[finished: {} ({})]", status, reason),
            None => format!("[finished: {}]", status),
        },
    }
}

async fn chat(config: &AppConfig, channel: &str, contact: &str) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let Some(flow) = store.active_for_channel(channel).await? else {
        anyhow::bail!("No active flow is bound to channel '{}'", channel);
    };
    println!(
        "Chatting with {} v{} on '{}'. Ctrl-D to quit.",
        flow.id, flow.version, channel
    );

    let cancel = CancellationToken::new();
    let bus = Arc::new(EventBus::default());
    let sink = Arc::new(AdapterSink::new());
    let engine = Arc::new(build_engine(config, store, sink.clone(), bus.clone()));

    let logger = match &config.log {
        Some(log) if log.enabled => {
            Some(RunLogger::new(config.log_dir(), log.level).spawn(&bus, cancel.clone()))
        }
        _ => None,
    };
    let notices = tokio::spawn(print_notices(bus.subscribe(), cancel.clone()));

    let lanes = Arc::new(LaneRegistry::new(engine, &config.lanes));
    let mut dispatcher = ChannelDispatcher::new(lanes, sink, cancel.clone());
    dispatcher.add_adapter(Arc::new(ConsoleAdapter::stdio(channel, ContactId::from_str(contact))));

    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });

    dispatcher.run().await?;

    cancel.cancel();
    notices.await.ok();
    if let Some(logger) = logger {
        logger.await.ok();
    }
    Ok(())
}

/// Echo run lifecycle events the console would otherwise not show.
async fn print_notices(mut rx: broadcast::Receiver<FlowEvent>, cancel: CancellationToken) {
    loop {
        // Drain what is already queued before honouring cancellation
        let event = tokio::select! {
            biased;
            event = rx.recv() => event,
            _ = cancel.cancelled() => break,
        };
        match event {
            Ok(FlowEvent::Handoff { target, .. }) => println!("[handed off to {}]", target),
            Ok(FlowEvent::RunCompleted { steps, .. }) => println!("[conversation ended after {} steps]", steps),
            Ok(FlowEvent::RunFailed { reason, .. }) => println!("[conversation failed: {}]", reason),
            Ok(FlowEvent::FlowSwitched { to, .. }) => println!("[switched to flow {}]", to),
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
