use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use replay_store::{FragmentStore, JsonlStore};
use waps_packet::{ChannelKey, Classifier};
use waps_ies::{
    command_stack::CommandStackSink,
    config::IesConfig,
    coordinator::{Coordinator, CoordinatorConfig, Outputs},
    events::{EventBus, EVENT_BUS_CAPACITY},
    image_files::ImageFileSink,
    nats::NatsPublisher,
    report::{write_report, ReportFilter},
    routes,
    shutdown::Shutdown,
    sinks::{spawn_sink, SinkContext, SinkWorker, StoreSink},
    source::{replay_capture, resume_from_store, LiveSource, PacketIntake},
    stats::SessionStats,
    AppState,
};

#[derive(Parser)]
#[command(name = "waps-ies", version, about = "WAPS Image Extraction Software")]
struct Cli {
    /// JSON configuration file
    #[arg(short, long, global = true, env = "WAPS_IES_CONFIG")]
    config: Option<PathBuf>,

    /// Debug logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Receive telemetry from the live TCP link
    Run {
        /// Telemetry server, host:port
        #[arg(long)]
        server: Option<String>,

        #[command(flatten)]
        session: SessionArgs,
    },

    /// Replay raw CCSDS capture files in order
    Replay {
        #[arg(required = true)]
        files: Vec<PathBuf>,

        #[command(flatten)]
        session: SessionArgs,
    },

    /// Summarise the replay store
    Report {
        #[arg(long)]
        store: Option<PathBuf>,

        #[arg(long, requires = "slot")]
        aec: Option<u8>,

        #[arg(long, requires = "aec")]
        slot: Option<u8>,

        /// List the stored fragments of one generation (needs --aec and --slot)
        #[arg(long, requires = "aec")]
        generation: Option<u32>,
    },
}

#[derive(Args)]
struct SessionArgs {
    #[arg(long)]
    output: Option<PathBuf>,

    #[arg(long)]
    commands: Option<PathBuf>,

    #[arg(long, conflicts_with = "no_store")]
    store: Option<PathBuf>,

    /// Run without the replay store
    #[arg(long)]
    no_store: bool,

    /// Rebuild channel state from the replay store before ingesting
    #[arg(long, conflicts_with = "no_store")]
    resume: bool,

    #[arg(long)]
    http_port: Option<u16>,

    #[arg(long, env = "NATS_URL")]
    nats_url: Option<String>,

    #[arg(long)]
    accept_corrupted: bool,
}

impl SessionArgs {
    fn apply(&self, config: &mut IesConfig) {
        if let Some(output) = &self.output {
            config.output_path = output.clone();
        }
        if let Some(commands) = &self.commands {
            config.command_path = commands.clone();
        }
        if let Some(store) = &self.store {
            config.store_path = Some(store.clone());
        }
        if self.no_store {
            config.store_path = None;
        }
        if let Some(port) = self.http_port {
            config.http_port = port;
        }
        if self.nats_url.is_some() {
            config.nats_url = self.nats_url.clone();
        }
        if self.accept_corrupted {
            config.accept_corrupted = true;
        }
    }
}

enum Mode {
    Live(String),
    Replay(Vec<PathBuf>),
}

impl Mode {
    fn name(&self) -> &'static str {
        match self {
            Mode::Live(_) => "live",
            Mode::Replay(_) => "replay",
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "waps_ies=debug,info"
    } else {
        "waps_ies=info,info"
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = IesConfig::load_or_default(cli.config.as_deref())?;
    config.apply_env()?;

    match cli.command {
        Command::Run { server, session } => {
            session.apply(&mut config);
            if server.is_some() {
                config.server = server;
            }
            let Some(server) = config.server.clone() else {
                bail!("no telemetry server configured (--server, WAPS_IES_SERVER or the config file)");
            };
            config.validate()?;
            run_session(config, Mode::Live(server), session.resume).await
        }
        Command::Replay { files, session } => {
            session.apply(&mut config);
            config.validate()?;
            run_session(config, Mode::Replay(files), session.resume).await
        }
        Command::Report {
            store,
            aec,
            slot,
            generation,
        } => {
            let path = store
                .or_else(|| config.store_path.clone())
                .context("no replay store configured")?;
            let key = match (aec, slot) {
                (Some(aec), Some(slot)) => Some(
                    ChannelKey::from_ids(aec, slot)
                        .with_context(|| format!("no such channel: AEC {aec} slot {slot}"))?,
                ),
                _ => None,
            };
            report(&path, &config, ReportFilter { key, generation })
        }
    }
}

fn report(path: &Path, config: &IesConfig, filter: ReportFilter) -> Result<()> {
    if !path.exists() {
        bail!("replay store {} does not exist", path.display());
    }
    let mut store = JsonlStore::open(path)?;
    let records = match (filter.key, filter.generation) {
        (Some(key), Some(generation)) => store.lookup(key, generation)?,
        _ => store.load()?,
    };
    let stdout = std::io::stdout();
    write_report(&records, config.policy()?, filter, &mut stdout.lock())
}

async fn run_session(config: IesConfig, mode: Mode, resume: bool) -> Result<()> {
    let aec_map = config.aec_map()?;
    tracing::info!("🛰️  WAPS IES starting ({} mode)", mode.name());
    if aec_map.is_empty() {
        tracing::warn!("⚠️  No ECs configured, every WAPS packet will be rejected");
    }
    for entry in &config.ecs {
        tracing::info!("   Tracking EC {} ({})", entry.address, entry.position);
    }

    let bus = EventBus::new(EVENT_BUS_CAPACITY);
    let stats = Arc::new(SessionStats::new());
    let shutdown = Shutdown::new();
    let ctx = SinkContext {
        bus: bus.clone(),
        stats: Arc::clone(&stats),
        shutdown: shutdown.clone(),
    };

    let mut outputs = Outputs::new(bus.clone(), Arc::clone(&stats));
    let mut workers: Vec<SinkWorker> = Vec::new();

    let (images, worker) = spawn_sink(
        ImageFileSink::new(&config.output_path, aec_map.clone()),
        config.sink_retry.clone(),
        ctx.clone(),
    )?;
    outputs.images = Some(images);
    workers.push(worker);
    tracing::info!("   Images to {}", config.output_path.display());

    let (commands, worker) = spawn_sink(
        CommandStackSink::new(&config.command_path, aec_map.clone()),
        config.sink_retry.clone(),
        ctx.clone(),
    )?;
    outputs.commands = Some(commands);
    workers.push(worker);
    tracing::info!("   Command stacks to {}", config.command_path.display());

    let mut stored = Vec::new();
    if let Some(path) = &config.store_path {
        let mut store = JsonlStore::open(path)
            .with_context(|| format!("cannot open replay store {}", path.display()))?;
        if resume {
            stored = store.load()?;
        }
        tracing::info!("   Replay store {} ({} fragments)", path.display(), store.len());
        let (handle, worker) = spawn_sink(StoreSink::new(Box::new(store)), config.sink_retry.clone(), ctx)?;
        outputs.store = Some(handle);
        workers.push(worker);
    } else {
        tracing::info!("   Replay store disabled");
    }

    let coordinator = Coordinator::start(
        CoordinatorConfig::new(config.policy()?, config.sweep_interval()),
        outputs,
    );
    if !stored.is_empty() {
        resume_from_store(stored, &coordinator.sender())
            .await
            .context("coordinator stopped while resuming")?;
        if !coordinator.flush().await {
            bail!("coordinator stopped while resuming");
        }
    }

    let nats = NatsPublisher::connect(config.nats_url.as_deref(), config.instance.clone()).await;
    let nats_task = tokio::spawn(nats.run(bus.subscribe(), shutdown.clone()));

    let state = AppState {
        instance: config.instance.clone(),
        mode: mode.name(),
        server: match &mode {
            Mode::Live(server) => Some(server.clone()),
            Mode::Replay(_) => None,
        },
        directory: coordinator.directory(),
        stats: Arc::clone(&stats),
        bus: bus.clone(),
    };
    let addr = format!("0.0.0.0:{}", config.http_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("cannot bind status API on {addr}"))?;
    tracing::info!("   Status API on http://{}/api/v1/status", addr);
    let http_shutdown = shutdown.clone();
    let http_task = tokio::spawn(async move {
        axum::serve(listener, routes::router(state))
            .with_graceful_shutdown(async move { http_shutdown.wait().await })
            .await
    });

    let status_task = tokio::spawn(log_status(
        Arc::clone(&stats),
        config.status_interval(),
        shutdown.clone(),
    ));

    let interrupt = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("🛑 Interrupted, draining");
            interrupt.trigger();
        }
    });

    let classifier = Arc::new(Classifier::new(aec_map));
    let intake = PacketIntake::new(classifier, Arc::clone(&stats), coordinator.sender());
    match mode {
        Mode::Live(server) => {
            LiveSource::new(server, config.tcp_timeout(), intake, bus.clone(), Arc::clone(&stats))
                .run(shutdown.clone())
                .await;
        }
        Mode::Replay(files) => {
            for file in &files {
                if shutdown.is_triggered() {
                    break;
                }
                if let Err(e) = replay_capture(file, &intake, &shutdown).await {
                    tracing::error!("❌ Capture {} failed: {}", file.display(), e);
                    stats.record_unexpected_error();
                }
            }
            drop(intake);
            shutdown.trigger();
        }
    }

    coordinator.shutdown().await;
    futures::future::join_all(workers.into_iter().map(SinkWorker::join_async)).await;

    status_task.abort();
    match http_task.await {
        Ok(Err(e)) => tracing::warn!("Status API stopped with error: {}", e),
        Err(e) => tracing::warn!("Status API task failed: {}", e),
        Ok(Ok(())) => {}
    }
    match nats_task.await {
        Ok(Err(e)) => tracing::warn!("NATS publisher stopped with error: {}", e),
        Err(e) => tracing::warn!("NATS publisher task failed: {}", e),
        Ok(Ok(())) => {}
    }

    stats.snapshot().log_closeout();
    if shutdown.is_fatal() {
        bail!("stopped after an unrecoverable storage error");
    }
    tracing::info!("✅ WAPS IES stopped");
    Ok(())
}

async fn log_status(stats: Arc<SessionStats>, every: std::time::Duration, shutdown: Shutdown) {
    let mut interval = tokio::time::interval(every);
    interval.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.wait() => break,
            _ = interval.tick() => tracing::info!("{}", stats.snapshot().status_line()),
        }
    }
}
