//! Shepherd: budgeted, risk-ordered, resumable code-modification runs.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use shepherd_core::{Clock, DataPaths, Error, SessionManifest, ShepherdConfig};
use shepherd_pipeline::StageRegistry;
use shepherd_risk::{scan_dir, DependencyFeed, RiskGraph};
use shepherd_runtime::{FsWorkspace, MonotonicClock, Orchestrator, RunReport};
use shepherd_store::{AnalyticsLog, SessionStore, SqliteStore};

mod report;

/// Config file picked up from the target root when `--config` is not given.
const DEFAULT_CONFIG_FILE: &str = "shepherd.json";

#[derive(Parser, Debug)]
#[clap(
    name = "shepherd",
    version = env!("CARGO_PKG_VERSION"),
    about = "Budgeted, risk-ordered, resumable code-modification scheduler"
)]
struct Cli {
    /// State directory (defaults to $SHEPHERD_DATA_DIR, then `.shepherd`).
    #[clap(long, global = true)]
    data_dir: Option<PathBuf>,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a new session over every file under ROOT
    Start {
        root: PathBuf,
        /// Dependency feed (JSON) with dependents, complexity and criticality.
        #[clap(long)]
        feed: Option<PathBuf>,
        /// Configuration file (defaults to ROOT/shepherd.json when present).
        #[clap(long)]
        config: Option<PathBuf>,
        /// Only schedule resources listed in the feed.
        #[clap(long)]
        no_scan: bool,
    },
    /// Continue a paused or interrupted session
    Resume {
        session_id: String,
        /// Use this configuration instead of the one the session started with.
        #[clap(long)]
        config: Option<PathBuf>,
    },
    /// Show progress of a session
    Status {
        session_id: String,
        #[clap(long)]
        json: bool,
    },
    /// Ask a running session to stop, or abort a paused one
    Cancel { session_id: String },
}

fn resolve_data_dir(flag: Option<PathBuf>) -> PathBuf {
    flag.or_else(|| std::env::var("SHEPHERD_DATA_DIR").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(".shepherd"))
}

/// 3 for configuration errors, 5 for everything else.
fn exit_code_for(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<Error>() {
        Some(Error::Configuration(_)) => 3,
        _ => 5,
    }
}

/// Store handles shared by every command.
struct App {
    store: Arc<SqliteStore>,
    sessions: Arc<SessionStore>,
    clock: Arc<dyn Clock>,
}

fn open(data_dir: &Path) -> anyhow::Result<App> {
    let paths = DataPaths::new(data_dir)
        .with_context(|| format!("failed to create data directory {}", data_dir.display()))?;
    let store = Arc::new(SqliteStore::open(&paths.db_file)?);
    let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::new());
    let sessions = Arc::new(
        SessionStore::new(store.clone(), clock.clone())
            .with_analytics(AnalyticsLog::new(&paths.analytics_log)),
    );
    Ok(App {
        store,
        sessions,
        clock,
    })
}

fn load_config(path: Option<&Path>) -> anyhow::Result<ShepherdConfig> {
    if let Some(path) = path {
        if !path.exists() {
            return Err(Error::Configuration(format!(
                "config file {} not found",
                path.display()
            ))
            .into());
        }
    }
    Ok(ShepherdConfig::load(path)?)
}

fn build_orchestrator(
    app: &App,
    config: ShepherdConfig,
    root: &Path,
) -> anyhow::Result<Orchestrator> {
    let registry = StageRegistry::from_config(&config)?;
    let pipeline = registry.build(&config.pipeline, config.stage_timeout())?;
    let orchestrator = Orchestrator::new(
        config,
        app.sessions.clone(),
        Arc::new(FsWorkspace::new(root)),
        app.clock.clone(),
        pipeline,
    );

    let token = orchestrator.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; finishing running items and aborting");
            token.cancel();
        }
    });
    Ok(orchestrator)
}

async fn start(
    app: &App,
    root: &Path,
    feed_path: Option<PathBuf>,
    config_path: Option<PathBuf>,
    no_scan: bool,
) -> anyhow::Result<RunReport> {
    let root = root
        .canonicalize()
        .map_err(|e| Error::Configuration(format!("target root {}: {}", root.display(), e)))?;
    let config_path = config_path
        .map(|p| p.canonicalize().unwrap_or(p))
        .or_else(|| {
            let candidate = root.join(DEFAULT_CONFIG_FILE);
            candidate.exists().then_some(candidate)
        });
    let config = load_config(config_path.as_deref())?;

    let mut feed = match &feed_path {
        Some(path) => DependencyFeed::load(path)?,
        None => DependencyFeed::default(),
    };
    if !no_scan {
        let added = feed.merge_scan(scan_dir(&root)?);
        info!("Scanned {}: {} files outside the feed", root.display(), added);
    }
    if feed.is_empty() {
        return Err(
            Error::Configuration(format!("no resources found under {}", root.display())).into(),
        );
    }
    let graph = RiskGraph::build(&feed, &config.risk)?;

    let manifest = SessionManifest {
        root: root.clone(),
        feed: feed_path,
        config: config_path,
    };
    let orchestrator = build_orchestrator(app, config, &root)?;
    Ok(orchestrator.start(&graph, manifest).await?)
}

async fn resume(
    app: &App,
    session_id: &str,
    config_path: Option<PathBuf>,
) -> anyhow::Result<RunReport> {
    let session = app.sessions.load(session_id)?;
    let config_path = config_path.or(session.manifest.config.clone());
    let config = load_config(config_path.as_deref())?;
    let orchestrator = build_orchestrator(app, config, &session.manifest.root)?;
    Ok(orchestrator.resume(session_id).await?)
}

fn status(app: &App, session_id: &str, json: bool) -> anyhow::Result<()> {
    let session = app.sessions.load(session_id)?;
    let events = app.store.recovery_events(session_id)?;
    let report = RunReport::from_session(&session, events.len());
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    let checkpoint = match app.sessions.latest_checkpoint(session_id) {
        Ok(checkpoint) => checkpoint.map(|c| (c.seq, c.created_at)),
        Err(e @ Error::CheckpointCorruption { .. }) => {
            warn!("{}", e);
            None
        }
        Err(e) => return Err(e.into()),
    };
    report::print_status(&session, &report, checkpoint, &events);
    Ok(())
}

async fn run(cli: Cli) -> anyhow::Result<u8> {
    let data_dir = resolve_data_dir(cli.data_dir);
    let app = open(&data_dir)?;
    info!("Data directory: {}", data_dir.display());

    let report = match cli.command {
        Command::Start {
            root,
            feed,
            config,
            no_scan,
        } => start(&app, &root, feed, config, no_scan).await?,
        Command::Resume { session_id, config } => resume(&app, &session_id, config).await?,
        Command::Status { session_id, json } => {
            status(&app, &session_id, json)?;
            return Ok(0);
        }
        Command::Cancel { session_id } => {
            let status = app.sessions.request_cancel(&session_id)?;
            println!("Session {}: cancellation requested ({})", session_id, status);
            return Ok(0);
        }
    };
    report::print_run(&report);
    Ok(report.exit_code() as u8)
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(exit_code_for(&e))
        }
    }
}
