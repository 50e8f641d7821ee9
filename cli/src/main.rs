use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use orbis_core::analysis::{MessageFilter, SessionAnalyzer, SessionStats};
use orbis_core::clock::span_seconds;
use orbis_core::config::OrbisConfig;
use orbis_core::logging::init_logging;
use orbis_core::registry::{RegistryWatcher, SharedRegistry};
use orbis_core::route::RouteOptions;
use orbis_core::session::convert;
use orbis_core::{Orbis, OrbisError, Result, SessionPlayer, SessionRecorder};

#[derive(Debug, Parser)]
#[command(name = "orbis", version, about = "ORBIS model factory control and observation plane")]
struct Cli {
    /// TOML configuration file (defaults to $ORBIS_CONFIG or ./orbis.toml)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Reload registry files when they change on disk
    #[arg(long, global = true)]
    registry_watch: bool,

    /// Registry schema version this process expects
    #[arg(long, global = true, value_name = "VERSION")]
    model_version: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Record all bus traffic until Ctrl-C or the duration elapses
    Record {
        #[arg(long, default_value = "session")]
        name: String,
        /// Stop after this many seconds
        #[arg(long)]
        duration: Option<u64>,
    },
    /// Republish a recorded `.log` or `.db` session
    Replay {
        file: PathBuf,
        #[arg(long)]
        speed: Option<f64>,
        #[arg(long = "loop")]
        looping: bool,
    },
    /// Statistics and message chains for a recorded session
    Analyze {
        file: PathBuf,
        /// Keep high-rate sensor streams
        #[arg(long)]
        no_prefilter: bool,
        /// Link otherwise unrelated messages that are close in time
        #[arg(long)]
        temporal: bool,
        /// Build a rooted chain from the message at this index
        #[arg(long)]
        root: Option<usize>,
        /// Rooted window in seconds
        #[arg(long)]
        window: Option<i64>,
        /// Write the chain graph as Graphviz
        #[arg(long, value_name = "FILE")]
        dot: Option<PathBuf>,
    },
    /// Generate (and optionally publish) an FTS navigation order
    Route {
        route_id: String,
        #[arg(long)]
        order_id: Option<String>,
        #[arg(long)]
        publish: bool,
    },
    /// Convert a session between `.log` and `.db`
    Convert { source: PathBuf, target: PathBuf },
}

enum Outcome {
    Done,
    Cancelled,
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("orbis: {e}");
            return ExitCode::from(e.exit_code() as u8);
        }
    };
    let _ring = match init_logging(&config.logging) {
        Ok(ring) => ring,
        Err(e) => {
            eprintln!("orbis: {e}");
            return ExitCode::from(1);
        }
    };

    match run(cli.command, config).await {
        Ok(Outcome::Done) => ExitCode::SUCCESS,
        Ok(Outcome::Cancelled) => {
            info!("Cancelled by user");
            ExitCode::from(2)
        }
        Err(e) => {
            tracing::error!(error = %e, "orbis failed");
            eprintln!("orbis: {e}");
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

fn load_config(cli: &Cli) -> Result<OrbisConfig> {
    let mut config = match &cli.config {
        Some(path) => OrbisConfig::load_from(path)?,
        None => OrbisConfig::load()?,
    };
    if let Some(version) = &cli.model_version {
        config.registry.model_version = Some(version.clone());
    }
    if cli.registry_watch {
        config.registry.watch = true;
    }
    Ok(config)
}

async fn run(command: Command, config: OrbisConfig) -> Result<Outcome> {
    match command {
        Command::Convert { source, target } => {
            let count = convert(&source, &target)?;
            println!("converted {count} messages to {}", target.display());
            Ok(Outcome::Done)
        }
        Command::Analyze {
            file,
            no_prefilter,
            temporal,
            root,
            window,
            dot,
        } => analyze(&config, &file, no_prefilter, temporal, root, window, dot.as_deref()),
        Command::Record { name, duration } => {
            let orbis = Orbis::new(config)?;
            let _watcher = watch_registry(&orbis);
            record(&orbis, &name, duration).await
        }
        Command::Replay { file, speed, looping } => {
            let orbis = Orbis::new(config)?;
            let _watcher = watch_registry(&orbis);
            replay(&orbis, &file, speed, looping).await
        }
        Command::Route {
            route_id,
            order_id,
            publish,
        } => {
            let orbis = Orbis::new(config)?;
            route(&orbis, &route_id, order_id, publish).await
        }
    }
}

fn watch_registry(orbis: &Orbis) -> Option<JoinHandle<()>> {
    let registry = &orbis.config.registry;
    if !registry.watch {
        return None;
    }
    let topics = registry.topics.clone();
    let shared = orbis.registry.clone();
    let every = Duration::from_secs(registry.watch_interval_secs.max(1));
    Some(RegistryWatcher::spawn(registry.files(), every, move |path| {
        if topics.as_deref() == Some(path) {
            if let Err(e) = shared.reload() {
                warn!(
                    target: "registry",
                    path = %path.display(),
                    error = %e,
                    "Reload failed; keeping previous registry"
                );
            }
        } else {
            info!(
                target: "registry",
                path = %path.display(),
                "Registry file changed; restart to apply"
            );
        }
    }))
}

async fn record(orbis: &Orbis, name: &str, duration: Option<u64>) -> Result<Outcome> {
    let recorder = SessionRecorder::new(orbis.client.clone(), orbis.config.session.clone());
    recorder.connect().await?;
    recorder.start_recording(name).await?;

    let deadline = duration.map(|secs| tokio::time::Instant::now() + Duration::from_secs(secs));
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let outcome = loop {
        tokio::select! {
            _ = &mut ctrl_c => break Outcome::Cancelled,
            _ = ticker.tick() => {
                if deadline.map_or(false, |d| tokio::time::Instant::now() >= d) {
                    break Outcome::Done;
                }
                if recorder.autosave_due() {
                    if let Err(e) = recorder.autosave().await {
                        warn!(target: "recorder", error = %e, "Autosave failed");
                    }
                }
            }
        }
    };

    let files = recorder.stop().await?;
    println!("{} messages", files.messages);
    println!("{}", files.db.display());
    println!("{}", files.log.display());
    orbis.shutdown().await?;
    Ok(outcome)
}

async fn replay(orbis: &Orbis, file: &Path, speed: Option<f64>, looping: bool) -> Result<Outcome> {
    let player = SessionPlayer::new(orbis.client.clone(), &orbis.config.session);
    if !player.load(file) {
        return Err(OrbisError::Config(format!("nothing to replay in {}", file.display())));
    }
    orbis.client.connect().await?;
    player.start(speed.unwrap_or(orbis.config.session.default_replay_speed), looping)?;

    let outcome = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            player.stop();
            Outcome::Cancelled
        }
        _ = player.wait() => Outcome::Done,
    };

    let status = player.status();
    println!(
        "published {} of {} messages ({} failed)",
        status.published, status.total, status.failed
    );
    orbis.shutdown().await?;
    Ok(outcome)
}

fn analyze(
    config: &OrbisConfig,
    file: &Path,
    no_prefilter: bool,
    temporal: bool,
    root: Option<usize>,
    window: Option<i64>,
    dot: Option<&Path>,
) -> Result<Outcome> {
    let registry = SharedRegistry::load(config.registry.topics.as_deref())?;
    if let Some(expected) = &config.registry.model_version {
        registry.current().check_version(expected)?;
    }

    let mut analyzer = SessionAnalyzer::new(registry.current(), &config.analysis);
    analyzer.load(file)?;

    let filter = if no_prefilter {
        MessageFilter::without_prefilter()
    } else {
        MessageFilter::default()
    };
    let view = analyzer.filter(&filter);
    let stats = SessionStats::from_messages(view.messages.iter().copied());

    let graph = match root {
        Some(index) => analyzer
            .rooted_analysis(index, window.map(span_seconds))
            .ok_or_else(|| OrbisError::NotFound(format!("no message at index {index}")))?,
        None => analyzer.chain_graph(&view.messages, temporal),
    };
    let chains = graph.chains();

    let report = json!({
        "file": file.display().to_string(),
        "total": view.total,
        "in_scope": view.len(),
        "prefiltered": view.prefiltered,
        "visible_topics": view.visible_topics,
        "statistics": stats,
        "production_roots": analyzer.production_roots(),
        "graph": {
            "nodes": graph.len(),
            "edges": graph.edges.len(),
            "relations": graph.relations(),
            "chains": chains.iter().map(Vec::len).collect::<Vec<_>>(),
        },
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    if let Some(path) = dot {
        std::fs::write(path, graph.to_dot())?;
        info!(target: "analyzer", path = %path.display(), "Chain graph written");
    }
    Ok(Outcome::Done)
}

async fn route(
    orbis: &Orbis,
    route_id: &str,
    order_id: Option<String>,
    publish: bool,
) -> Result<Outcome> {
    let generator = orbis.routes.as_ref().ok_or_else(|| {
        OrbisError::Config("registry.layout and registry.routes must be configured".into())
    })?;

    let order = generator.generate(
        route_id,
        &RouteOptions {
            order_id,
            ..Default::default()
        },
    )?;
    println!("{}", serde_json::to_string_pretty(&order)?);

    if publish {
        orbis.client.connect().await?;
        let outbound = order.to_outbound()?;
        if !orbis.client.publish_outbound(&outbound).await {
            return Err(OrbisError::Transport(format!(
                "broker did not acknowledge {}",
                outbound.topic
            )));
        }
        info!(
            target: "route",
            topic = %outbound.topic,
            order_id = %order.order_id,
            "Route order published"
        );
        orbis.shutdown().await?;
    }
    Ok(Outcome::Done)
}
