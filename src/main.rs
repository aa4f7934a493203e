use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use streamnzb::config::AppConfig;
use streamnzb::indexer::{Aggregator, Indexer, build_indexer};
use streamnzb::nntp::{ArticleSource, ConnectionPool};
use streamnzb::oracle::OracleClient;
use streamnzb::proxy::ProxyServer;
use streamnzb::server::{self, AppState};
use streamnzb::session::SessionManager;
use streamnzb::state::StateManager;
use streamnzb::triage::{FilterConfig, TriageService, WeightConfig};
use streamnzb::usage::UsageManager;
use streamnzb::validation::{ValidationChecker, ValidationConfig};

#[derive(Parser)]
#[command(name = "streamnzb", about = "Stream video straight from Usenet", version)]
struct Args {
    /// Load this .env file instead of ./.env
    #[arg(long)]
    env_file: Option<PathBuf>,

    /// Override the data directory (defaults to $DATA_DIR or ./data)
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    match &args.env_file {
        Some(path) => {
            dotenvy::from_path(path)
                .with_context(|| format!("loading env file {}", path.display()))?;
        }
        None => {
            dotenvy::dotenv().ok();
        }
    }

    let config = AppConfig::from_env().context("invalid configuration")?;
    let settings = Arc::new(config.settings.clone());

    init_tracing(settings.log_level.as_deref());
    info!(version = env!("CARGO_PKG_VERSION"), "starting streamnzb");

    let data_dir = args
        .data_dir
        .unwrap_or_else(|| PathBuf::from(&settings.data_dir));
    let state = Arc::new(
        StateManager::open(&data_dir)
            .await
            .context("opening state store")?,
    );
    let usage = Arc::new(UsageManager::load(Arc::clone(&state)).await);

    // Provider pools: one auth probe each; failures are skipped, not fatal.
    let mut pools: Vec<Arc<ConnectionPool>> = Vec::new();
    for provider in config.providers.iter().filter(|p| p.enabled) {
        let pool = ConnectionPool::new(provider.clone());
        match pool.validate().await {
            Ok(()) => pools.push(pool),
            Err(e) => error!(host = %provider.host, error = %e, "provider validation failed, skipping"),
        }
    }
    if pools.is_empty() {
        warn!("no usable providers; stream requests will return empty lists");
    }
    let sources: Vec<Arc<dyn ArticleSource>> = pools
        .iter()
        .map(|p| Arc::clone(p) as Arc<dyn ArticleSource>)
        .collect();

    // Indexer backends.
    let indexers: Vec<Arc<dyn Indexer>> = config
        .indexers
        .iter()
        .map(|c| build_indexer(c, Arc::clone(&usage), settings.nzb_download_timeout()))
        .collect();
    if indexers.is_empty() {
        warn!("no indexers configured; searches will return empty lists");
    }
    let active_names: Vec<String> = indexers.iter().map(|i| i.name().to_string()).collect();
    usage.sync_usage(&active_names).await;
    let aggregator = Arc::new(Aggregator::new(indexers));

    let oracle = Arc::new(OracleClient::new(
        settings.nzbcheck_url.clone(),
        settings.nzbcheck_api_key.clone(),
    ));

    let validator = Arc::new(ValidationChecker::new(
        sources.clone(),
        ValidationConfig {
            sample_size: settings.validation_sample_size,
            threshold: settings.validation_threshold,
            max_providers: settings.validation_max_providers,
            max_per_provider: settings.validation_max_per_provider,
            cache_ttl: settings.cache_ttl(),
        },
    ));

    let sessions = SessionManager::new(
        sources.clone(),
        Arc::clone(&aggregator),
        settings.session_idle_ttl(),
    );
    let _eviction = sessions.spawn_eviction();
    let _provider_usage = spawn_provider_usage_sync(pools.clone(), Arc::clone(&usage));

    let shared_sources = Arc::new(RwLock::new(sources));

    if config.proxy.enabled {
        let proxy = ProxyServer::new(config.proxy.clone(), Arc::clone(&shared_sources));
        tokio::spawn(async move {
            if let Err(e) = proxy.run().await {
                error!(error = %e, "NNTP proxy terminated");
            }
        });
    }

    let app_state = AppState {
        settings: Arc::clone(&settings),
        aggregator,
        triage: Arc::new(TriageService::new(
            FilterConfig::default(),
            WeightConfig::default(),
        )),
        validator,
        oracle,
        sessions,
        sources: shared_sources,
    };
    let app = server::router(app_state);

    let listener = TcpListener::bind(("0.0.0.0", settings.addon_port))
        .await
        .with_context(|| format!("binding addon port {}", settings.addon_port))?;
    info!(addr = %listener.local_addr()?, "addon listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("draining provider pools");
    for pool in &pools {
        pool.shutdown();
    }

    Ok(())
}

fn init_tracing(log_level: Option<&str>) {
    let default = log_level.unwrap_or("streamnzb=info,tower_http=warn");
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(default))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Periodically roll per-pool article counters into the persisted
/// provider-usage table.
fn spawn_provider_usage_sync(
    pools: Vec<Arc<ConnectionPool>>,
    usage: Arc<UsageManager>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut last: Vec<u64> = pools.iter().map(|p| p.stats().articles_served).collect();
        let mut tick = tokio::time::interval(Duration::from_secs(60));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            for (pool, last_served) in pools.iter().zip(last.iter_mut()) {
                let stats = pool.stats();
                let delta = stats.articles_served.saturating_sub(*last_served);
                if delta > 0 {
                    usage.record_provider_articles(&stats.host, delta).await;
                    *last_served = stats.articles_served;
                }
            }
        }
    })
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
