mod admission;
mod config;
mod errors;
mod evaluation;
mod extract;
mod llm_client;
mod models;
mod pipeline;
mod queue;
mod registry;
mod retrieval;
mod routes;
mod state;
mod store;
mod worker;

#[cfg(test)]
mod testing;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use aws_config::Region;
use aws_sdk_s3::config::Credentials;
use redis::aio::ConnectionManager;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::admission::window::RedisWindowCounter;
use crate::admission::AdmissionController;
use crate::config::Config;
use crate::extract::PdfTextExtractor;
use crate::llm_client::LlmClient;
use crate::pipeline::EvaluationPipeline;
use crate::queue::redis_queue::RedisTaskQueue;
use crate::queue::TaskQueue;
use crate::registry::blob::S3BlobStore;
use crate::registry::{BlobStore, FileRegistry, UPLOAD_PREFIX};
use crate::retrieval::KnowledgeBase;
use crate::routes::build_router;
use crate::state::AppState;
use crate::store::redis_store::RedisStore;
use crate::store::StateStore;
use crate::worker::recovery::recover_failed;
use crate::worker::{spawn_maintenance, spawn_pool, Worker};

const QUEUE_NAME: &str = "evaluation";
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (fails on missing required env vars)
    let config = Config::from_env()?;

    // Initialize structured logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("{}={}", env!("CARGO_PKG_NAME"), &config.rust_log))
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(
        "Starting evaluator v{} (role: {:?})",
        env!("CARGO_PKG_VERSION"),
        config.role
    );

    // Redis backs the state store, the job queue and the rate limiter
    let conn = redis::Client::open(config.redis_url.as_str())?
        .get_connection_manager()
        .await?;
    info!("Redis connection established");

    // Initialize S3 / MinIO
    let s3 = build_s3_client(&config).await;
    let bucket = S3BlobStore::new(s3, config.s3_bucket.clone());
    if let Err(e) = bucket.expire_prefix(UPLOAD_PREFIX, config.record_ttl).await {
        warn!("Uploads will not expire automatically: {e:#}");
    }
    let blobs: Arc<dyn BlobStore> = Arc::new(bucket);
    info!("S3 client initialized");

    let store = StateStore::new(Arc::new(RedisStore::new(conn.clone())), config.record_ttl);
    let queue: Arc<dyn TaskQueue> = Arc::new(RedisTaskQueue::new(conn.clone(), QUEUE_NAME));

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            shutdown.cancel();
        });
    }

    let background = if config.role.runs_workers() {
        start_workers(&config, store.clone(), queue.clone(), blobs.clone(), &shutdown).await?
    } else {
        Vec::new()
    };

    if config.role.runs_api() {
        serve_api(&config, conn, store, queue, blobs, &shutdown).await?;
        shutdown.cancel();
    } else {
        shutdown.cancelled().await;
    }

    for handle in background {
        match tokio::time::timeout(DRAIN_TIMEOUT, handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Background task failed: {e:?}"),
            Err(_) => warn!("Background task timed out during shutdown"),
        }
    }
    info!("Shutdown complete");
    Ok(())
}

/// Loads the knowledge base (fatal when empty), then starts the recovery
/// sweep, queue maintenance and the worker pool.
async fn start_workers(
    config: &Config,
    store: StateStore,
    queue: Arc<dyn TaskQueue>,
    blobs: Arc<dyn BlobStore>,
    shutdown: &CancellationToken,
) -> Result<Vec<JoinHandle<()>>> {
    let dir = config.knowledge_base_dir.clone();
    let knowledge_base = tokio::task::spawn_blocking(move || KnowledgeBase::load(&dir)).await??;
    info!(
        "Knowledge base loaded from {} ({} passages)",
        config.knowledge_base_dir.display(),
        knowledge_base.len()
    );

    let llm = LlmClient::new(config.anthropic_api_key.clone(), config.remote_call_timeout)?
        .with_api_url(config.anthropic_api_url.clone());
    info!("LLM client initialized (model: {})", llm_client::MODEL);

    let pipeline = Arc::new(EvaluationPipeline::new(
        Arc::new(knowledge_base),
        Arc::new(llm),
        Arc::new(PdfTextExtractor::new(blobs)),
        config.remote_call_timeout,
        config.retrieval_top_k,
    ));
    let worker = Worker::new(queue.clone(), store, pipeline, config);

    let mut handles = Vec::new();

    let sweep_queue = queue.clone();
    let spacing = config.recovery_delay;
    let sweep_shutdown = shutdown.clone();
    handles.push(tokio::spawn(async move {
        tokio::select! {
            _ = sweep_shutdown.cancelled() => info!("Recovery sweep interrupted by shutdown"),
            result = recover_failed(sweep_queue.as_ref(), spacing) => {
                if let Err(e) = result {
                    error!("Recovery sweep failed: {e}");
                }
            }
        }
    }));
    handles.push(spawn_maintenance(queue, config, shutdown));
    handles.extend(spawn_pool(worker, config.worker_concurrency, shutdown));

    info!("Worker pool started ({} workers)", config.worker_concurrency);
    Ok(handles)
}

async fn serve_api(
    config: &Config,
    conn: ConnectionManager,
    store: StateStore,
    queue: Arc<dyn TaskQueue>,
    blobs: Arc<dyn BlobStore>,
    shutdown: &CancellationToken,
) -> Result<()> {
    let state = AppState {
        registry: FileRegistry::new(store.clone(), blobs, config.max_upload_bytes),
        store,
        queue,
        admission: AdmissionController::new(
            Arc::new(RedisWindowCounter::new(conn)),
            config.trust_forwarded_for,
        ),
        config: Arc::new(config.clone()),
    };

    let app = build_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    info!("Listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let shutdown = shutdown.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.cancelled().await })
    .await?;

    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}

/// Constructs an S3 client configured for MinIO (local) or AWS (production).
async fn build_s3_client(config: &Config) -> aws_sdk_s3::Client {
    let credentials = Credentials::new(
        &config.aws_access_key_id,
        &config.aws_secret_access_key,
        None,
        None,
        "evaluator-static",
    );

    let s3_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .region(Region::new("us-east-1"))
        .credentials_provider(credentials)
        .endpoint_url(&config.s3_endpoint)
        .load()
        .await;

    aws_sdk_s3::Client::new(&s3_config)
}
