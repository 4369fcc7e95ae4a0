use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};

use copybot::api::create_router;
use copybot::config::AppConfig;
use copybot::db::{self, account_repo, link_repo};
use copybot::engine::{RelayEngine, RelayEvent, RelayRegistry};
use copybot::exchange::{ExchangeApi, RestClient};
use copybot::metrics::init_metrics;
use copybot::models::ExecutionRecord;
use copybot::services::record_writer::run_record_writer;
use copybot::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    // rustls needs an explicit process-wide crypto provider
    if rustls::crypto::ring::default_provider().install_default().is_err() {
        tracing::debug!("rustls crypto provider already installed");
    }

    let config = AppConfig::from_env()?;
    let addr = format!("{}:{}", config.host, config.port);
    let metrics_handle = init_metrics()?;

    tracing::info!("Connecting to database...");
    let db = db::init_pool(&config.database_url).await?;
    db::run_migrations(&db).await?;
    tracing::info!("Database connected");

    // --- Exchange client shared by every relay ---
    let api: Arc<dyn ExchangeApi> = Arc::new(RestClient::new(
        reqwest::Client::new(),
        config.exchange_rest_url.clone(),
        config.order_timeout(),
    ));

    // --- Persistence: execution records ---
    let (record_tx, record_rx) = mpsc::channel::<ExecutionRecord>(1000);
    let writer = tokio::spawn(run_record_writer(db.clone(), record_rx));

    // --- Relays: one engine per leader ---
    let (events_tx, _) = broadcast::channel::<RelayEvent>(1024);
    let registry = Arc::new(RelayRegistry::new());
    let relay_config = config.relay_config();

    let leader_ids = if config.leader_ids.is_empty() {
        link_repo::linked_leader_ids(&db).await?
    } else {
        config.leader_ids.clone()
    };
    if leader_ids.is_empty() {
        tracing::warn!("No leaders configured; set LEADER_IDS or add follower_links rows");
    }

    for leader_id in &leader_ids {
        let Some(leader) = account_repo::get_account(&db, leader_id).await? else {
            tracing::error!(leader = %leader_id, "Leader account not found, relay not created");
            continue;
        };
        let links = link_repo::links_for_leader(&db, leader_id).await?;
        let follower_count = links.len();

        let engine = RelayEngine::builder(leader_id.clone(), relay_config.clone(), Arc::clone(&api))
            .events(events_tx.clone())
            .records(record_tx.clone())
            .build();
        engine.set_links(links).await?;
        registry.register(Arc::new(engine), leader).await;

        tracing::info!(
            leader = %leader_id,
            followers = follower_count,
            mode = ?relay_config.connector.mode,
            dry_run = relay_config.dispatcher.dry_run,
            "Relay registered"
        );
    }
    // Engines hold the remaining senders
    drop(record_tx);

    let started = registry.start_all().await;
    tracing::info!(started, total = leader_ids.len(), "Relays started");

    let state = AppState {
        registry: Arc::clone(&registry),
        config,
        events: events_tx,
        metrics_handle,
        db: Some(db),
    };
    let router = create_router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {addr}");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shutting down relays...");
    registry.stop_all().await;
    drop(registry);
    if tokio::time::timeout(std::time::Duration::from_secs(5), writer).await.is_err() {
        tracing::warn!("Record writer did not drain in time");
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}
