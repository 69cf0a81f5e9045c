use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use relaydesk_core::bus::EventBus;
use relaydesk_core::config::AppConfig;
use relaydesk_core::metrics::MetricsStore;
use relaydesk_coordination::{CoordinationStore, MemoryCoordination, RedisCoordination};
use relaydesk_dispatch::{
    AdapterSet, ConversationService, OutboundService, OutboundWorker, WebhookProcessor,
};
use relaydesk_persistence::InboxStore;
use relaydesk_providers::http_client;
use relaydesk_queue::{start_pool, PoolOptions};
use relaydesk_server::bridge::start_event_bridge;
use relaydesk_server::gateway::{router, AppState};
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "relaydesk-server", version, about = "Unified social-inbox backend")]
struct Args {
    /// Override the PORT environment variable
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = AppConfig::from_env()?;
    if let Some(port) = args.port {
        config.port = port;
    }

    let store = InboxStore::connect(&config.database_url).await?;

    let coordination: Arc<dyn CoordinationStore> = match &config.coord_url {
        Some(url) => {
            let redis = RedisCoordination::connect(url).await?;
            info!("coordination store connected");
            Arc::new(redis)
        }
        None => {
            warn!("COORD_URL not set, using in-process coordination (single node only)");
            Arc::new(MemoryCoordination::new())
        }
    };

    let bus = Arc::new(EventBus::new(1024));
    let metrics = MetricsStore::new();
    let adapters = AdapterSet::from_client(http_client(config.provider_timeout));

    let processor = Arc::new(WebhookProcessor::new(
        store.clone(),
        bus.clone(),
        metrics.clone(),
        adapters.clone(),
    ));
    let (ingest_queue, ingest_pool) = start_pool(
        "webhook-ingest",
        PoolOptions {
            workers: config.ingest.workers,
            queue_depth: config.ingest.queue_depth,
            max_attempts: config.ingest.max_attempts,
            backoff_base: config.ingest.backoff_base,
            retry_jitter_ms: 250,
        },
        Some(metrics.clone()),
        move |job| {
            let processor = processor.clone();
            async move { processor.process(job).await }
        },
    );

    let worker = Arc::new(OutboundWorker::new(
        store.clone(),
        bus.clone(),
        metrics.clone(),
        adapters.clone(),
    ));
    let (outbound_queue, outbound_pool) = start_pool(
        "outbound-send",
        PoolOptions {
            workers: config.outbound.workers,
            queue_depth: config.outbound.queue_depth,
            max_attempts: config.outbound.max_attempts,
            backoff_base: config.outbound.backoff_base,
            retry_jitter_ms: 250,
        },
        Some(metrics.clone()),
        move |job| {
            let worker = worker.clone();
            async move { worker.deliver(job).await }
        },
    );

    let (bridge_out, bridge_in) = start_event_bridge(bus.clone(), coordination.clone());

    let state = AppState {
        store: store.clone(),
        bus: bus.clone(),
        coordination: coordination.clone(),
        metrics,
        adapters,
        conversations: Arc::new(ConversationService::new(
            store.clone(),
            coordination.clone(),
            bus.clone(),
        )),
        outbound: Arc::new(OutboundService::new(store.clone(), bus.clone())),
        ingest_queue: ingest_queue.clone(),
        outbound_queue: outbound_queue.clone(),
        auth_secret: config.auth.secret.clone(),
        provider_defaults: config.providers.clone(),
    };

    let cors = match &config.frontend_url {
        Some(origin) => CorsLayer::new()
            .allow_origin(origin.parse::<axum::http::HeaderValue>()?)
            .allow_methods(Any)
            .allow_headers(Any),
        None => CorsLayer::permissive(),
    };

    let app = router(state).layer(cors);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr).await?;
    info!("relaydesk listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutting down, draining worker pools");
    drop(ingest_queue);
    drop(outbound_queue);
    if tokio::time::timeout(Duration::from_secs(30), async {
        ingest_pool.drain().await;
        outbound_pool.drain().await;
    })
    .await
    .is_err()
    {
        error!("worker pools did not drain within 30s");
    }

    bridge_out.abort();
    bridge_in.abort();
    store.close().await;
    info!("shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
    }
}
