//! ade-daemon - the Aegis Decision Engine service binary.
//!
//! Startup order: configuration, tracing, storage (schema applied
//! idempotently), services, scheduler, HTTP server. SIGINT/SIGTERM triggers
//! graceful shutdown with a bounded drain window; unrecoverable startup
//! errors exit non-zero.

use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use ade_core::config::{Config, LogFormat};
use ade_core::scheduler::Scheduler;
use ade_core::webhook::{HttpTransport, WebhookClient};

use ade_daemon::action::ActionRuntime;
use ade_daemon::decision::DecisionService;
use ade_daemon::feedback::FeedbackService;
use ade_daemon::ingest::{IngestService, LogPublisher};
use ade_daemon::policy_cache::PolicyCache;
use ade_daemon::server::{self, AppState};
use ade_daemon::simulation::SimulationService;
use ade_daemon::state::FeatureService;
use ade_daemon::storage::{
    ActionStore, Database, DecisionStore, EventStore, FeatureStore, FeedbackStore, PolicyStore,
    SimulationStore,
};

/// Aegis Decision Engine daemon.
#[derive(Parser, Debug)]
#[command(name = "ade-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Override `ADE_PORT`.
    #[arg(long)]
    port: Option<u16>,

    /// Override `DATABASE_URL`.
    #[arg(long)]
    database: Option<String>,

    /// Override `ADE_LOG_LEVEL`.
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = Config::from_env().context("failed to load configuration")?;
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(database) = args.database {
        config.database.url = database;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }

    init_tracing(&config);

    info!(
        host = %config.server.host,
        port = config.server.port,
        database = %config.database.url,
        "starting ade-daemon"
    );

    let db = Database::open(&config.database.url).context("failed to open database")?;

    // Stores.
    let events = EventStore::new(db.clone());
    let snapshots = FeatureStore::new(db.clone());
    let policies = PolicyStore::new(db.clone());
    let decisions = DecisionStore::new(db.clone());
    let actions = ActionStore::new(db.clone());
    let feedback_store = FeedbackStore::new(db.clone());
    let simulations = SimulationStore::new(db.clone());

    // Services.
    let ingest = Arc::new(IngestService::new(events.clone(), Arc::new(LogPublisher)));
    let features = Arc::new(FeatureService::new(
        events.clone(),
        snapshots,
        config.features.window,
        config.features.max_events,
    ));

    let policy_cache = Arc::new(PolicyCache::new());
    match policies.list_active().await {
        Ok(active) => {
            let count = active.len();
            if let Err(e) = policy_cache.swap(active) {
                warn!(error = %e, "stored policy failed validation; cache left empty");
            } else {
                info!(policies = count, "policy cache primed");
            }
        },
        Err(e) => warn!(error = %e, "failed to prime policy cache"),
    }

    let decision_service = Arc::new(DecisionService::new(
        decisions,
        policies.clone(),
        Arc::clone(&policy_cache),
        Arc::clone(&features),
        events,
        config.features.window,
    ));

    let scheduler = Arc::new(Scheduler::new());
    let transport = Arc::new(HttpTransport::new().context("failed to build webhook transport")?);
    let webhook = WebhookClient::new(transport, config.webhook(), config.breaker);
    let runtime = Arc::new(ActionRuntime::new(
        actions,
        webhook,
        Arc::clone(&scheduler),
        config.action.default_webhook_url.clone(),
    ));

    // The dispatch closure holds a weak handle so scheduler and runtime do
    // not keep each other alive across shutdown.
    let dispatch: Weak<ActionRuntime> = Arc::downgrade(&runtime);
    scheduler.start(move |job| {
        let dispatch = dispatch.clone();
        async move {
            match dispatch.upgrade() {
                Some(runtime) => runtime.handle_due_job(job).await,
                None => warn!(job_id = %job.job_id, "action runtime gone; job dropped"),
            }
        }
    });

    let feedback = Arc::new(FeedbackService::new(feedback_store, Arc::clone(&runtime)));
    let simulation_service = Arc::new(SimulationService::new(
        simulations,
        config.simulation.max_iterations,
    ));

    let state = AppState {
        ingest,
        features,
        decisions: decision_service,
        actions: runtime,
        feedback,
        simulations: simulation_service,
        policies: policy_cache,
        policy_store: policies,
        db,
    };

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("invalid bind address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    info!(addr = %addr, "listening");

    axum::serve(listener, server::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    // Drain: give in-flight scheduled work a bounded window to finish.
    info!(
        drain_secs = config.server.shutdown_timeout.as_secs(),
        "shutting down"
    );
    if tokio::time::timeout(config.server.shutdown_timeout, scheduler.stop())
        .await
        .is_err()
    {
        warn!("drain window expired with workers still running");
    }

    info!("shutdown complete");
    Ok(())
}

fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));

    match config.logging.format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        },
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        },
    }
}

async fn shutdown_signal() {
    let mut sigint =
        signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    let mut sigterm =
        signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

    tokio::select! {
        _ = sigint.recv() => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
    }
}
