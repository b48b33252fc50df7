//! Scalpstream - KIS Realtime Market Data Collector
//!
//! Holds the most interesting symbols on the realtime feed at all times:
//! - Slot-managed subscriptions with priority eviction under a hard cap
//! - Self-healing WebSocket session with scheduled credential refresh
//! - Append-only daily evidence trail: scalp ticks, overflow, gaps

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use dotenv::dotenv;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use scalpstream::collector::TrackBCollector;
use scalpstream::config::Config;
use scalpstream::engine::{ProviderEngine, StreamSession};
use scalpstream::gap::GapDetector;
use scalpstream::kis::{BrokerAuth, KisAuth, KisRestClient, KisWsClient, RateLimiter};
use scalpstream::lifecycle::TokenLifecycleManager;
use scalpstream::models::SlotCandidate;
use scalpstream::slot::SlotManager;

#[derive(Parser, Debug)]
#[command(name = "scalpstream", about = "KIS realtime market data collector")]
struct Args {
    /// Use the virtual (paper trading) gateway.
    #[arg(long = "virtual")]
    virtual_mode: bool,

    /// Symbols to seed into slots at startup, before any trigger fires.
    #[arg(long, value_delimiter = ',')]
    seed: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    load_env();
    if args.virtual_mode {
        // The flag wins over whatever the environment says.
        std::env::set_var("KIS_VIRTUAL", "1");
    }
    init_tracing();

    info!("🚀 Scalpstream starting - realtime slot-managed collection");
    let config = Config::from_env().context("loading configuration")?;
    info!(
        mode = if config.ws.virtual_mode { "virtual" } else { "real" },
        max_subscriptions = config.ws.max_subscriptions,
        "configuration loaded"
    );

    let auth = Arc::new(KisAuth::new(config.auth.clone()).context("initializing auth")?);
    let limiter = Arc::new(RateLimiter::new(config.rate.clone()));
    let rest = Arc::new(
        KisRestClient::new(Arc::clone(&auth), limiter).context("initializing rest client")?,
    );
    let broker_auth: Arc<dyn BrokerAuth> = auth.clone();
    let ws = Arc::new(KisWsClient::new(config.ws.clone(), Arc::clone(&broker_auth)));
    ws.set_on_error(|msg| error!(reason = %msg, "stream error reported"));

    let engine = Arc::new(ProviderEngine::new(rest, Arc::clone(&ws), config.ws.virtual_mode));
    let slots = Arc::new(
        SlotManager::new(config.slot.clone(), config.system_log_dir.clone())
            .context("initializing slot manager")?,
    );
    let gaps = Arc::new(
        GapDetector::new(config.gap.clone(), config.system_log_dir.clone())
            .context("initializing gap detector")?,
    );
    let session: Arc<dyn StreamSession> = engine.clone();
    let collector = Arc::new(
        TrackBCollector::new(
            Arc::clone(&slots),
            Arc::clone(&gaps),
            Arc::clone(&session),
            config.scalp_data_dir.clone(),
        )
        .context("initializing collector")?,
    );
    collector.install_price_sink();

    let lifecycle = Arc::new(TokenLifecycleManager::new(
        config.lifecycle.clone(),
        Arc::clone(&broker_auth),
        Arc::clone(&session),
    ));
    lifecycle.set_on_error(|msg| error!(reason = %msg, "credential lifecycle error"));

    // A failed first connect is not fatal: the proactive refresh path
    // retries the full stop/refresh/start sequence on its own schedule.
    if !engine.start_stream().await {
        warn!("initial stream start failed, lifecycle will retry");
    }

    let (candidate_tx, candidate_rx) = mpsc::channel::<SlotCandidate>(256);
    let collector_task = tokio::spawn(Arc::clone(&collector).run(candidate_rx));
    let sweep_task = tokio::spawn(Arc::clone(&collector).run_gap_sweep());
    let lifecycle_task = tokio::spawn(Arc::clone(&lifecycle).run());

    let mut seeds = config.seed_symbols.clone();
    seeds.extend(args.seed);
    seeds.sort();
    seeds.dedup();
    for symbol in seeds {
        let candidate = SlotCandidate {
            symbol,
            priority: 0.5,
            trigger_type: "seed".to_string(),
            detected_at: Utc::now(),
        };
        if candidate_tx.send(candidate).await.is_err() {
            warn!("candidate channel closed before seeding finished");
            break;
        }
    }

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutdown signal received");

    lifecycle.stop();
    collector.stop();
    drop(candidate_tx);
    engine.stop_stream().await;

    collector_task.abort();
    sweep_task.abort();
    lifecycle_task.abort();

    let stats = collector.stats();
    info!(
        candidates = stats.candidates_processed,
        scalp_records = stats.scalp_records,
        evictions = stats.evictions_unsubscribed,
        "👋 scalpstream stopped"
    );
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "scalpstream=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_env() {
    // Standard dotenv search (cwd + parents), then the manifest dir for
    // runs launched from elsewhere with --manifest-path.
    let _ = dotenv();
    let manifest_env = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
    if manifest_env.exists() {
        let _ = dotenv::from_path(&manifest_env);
    }
}
