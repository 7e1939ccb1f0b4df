/// Server setup and initialization
///
/// Wires together all components: snapshot backend, store registry, record
/// service, gateway routes, queue broker and wait scheduler. `Emulator` is the
/// installed system; `start_server` is the thin wrapper serving it over HTTP.

use crate::{
    api::{create_socket_routes, Gateway},
    config::{Config, EmulatorConfig},
    runtime::{QueueBroker, WaitScheduler},
    service::WorkflowService,
    store::{SqliteSnapshotBackend, StoreRegistry},
};
use anyhow::Result;
use axum::{routing::get, Router};
use std::sync::Arc;
use tokio::{net::TcpListener, sync::Mutex, task::JoinHandle};

/// A running emulator: background loops plus the routers that expose it
pub struct Emulator {
    registry: Arc<StoreRegistry>,
    service: Arc<WorkflowService>,
    gateway: Gateway,
    broker: Arc<QueueBroker>,
    scheduler: Arc<WaitScheduler>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Emulator {
    /// Install the emulator over the SQLite snapshot file from `config`
    pub async fn install(config: &Config) -> Result<Self> {
        tracing::info!("Opening snapshot store: {}", config.storage.snapshot_path);
        let backend = SqliteSnapshotBackend::connect(&config.storage.snapshot_path)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to open snapshot store: {}", e))?;

        let registry = Arc::new(StoreRegistry::new(
            Arc::new(backend),
            config.storage.namespace.clone(),
        ));
        Self::with_registry(registry, &config.emulator).await
    }

    /// Install the emulator over an existing registry and start its loops
    pub async fn with_registry(registry: Arc<StoreRegistry>, config: &EmulatorConfig) -> Result<Self> {
        tracing::info!("Initializing record service");
        let service = Arc::new(WorkflowService::new(Arc::clone(&registry)));
        let gateway = Gateway::new(Arc::clone(&service));

        tracing::info!("Starting background loops");
        let broker = Arc::new(QueueBroker::new(Arc::clone(&service)));
        let broker_task = broker.start(config.broker_poll_interval());

        let scheduler = Arc::new(
            WaitScheduler::new(
                Arc::clone(&registry),
                Arc::clone(&service),
                config.wait_scheduler_interval(),
            )
            .await
            .map_err(|e| anyhow::anyhow!("Failed to initialize wait scheduler: {}", e))?,
        );
        scheduler.start().await?;

        let watcher_task = registry.watch_changes();

        Ok(Self {
            registry,
            service,
            gateway,
            broker,
            scheduler,
            tasks: Mutex::new(vec![broker_task, watcher_task]),
        })
    }

    pub fn registry(&self) -> &Arc<StoreRegistry> {
        &self.registry
    }

    pub fn service(&self) -> &Arc<WorkflowService> {
        &self.service
    }

    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    pub fn broker(&self) -> &Arc<QueueBroker> {
        &self.broker
    }

    pub fn scheduler(&self) -> &Arc<WaitScheduler> {
        &self.scheduler
    }

    /// Record API routes plus the worker socket endpoint
    pub fn router(&self) -> Router {
        self.gateway
            .router()
            .merge(create_socket_routes().with_state(Arc::clone(&self.broker)))
    }

    /// Serve the emulator in front of `inner`, which keeps every other path
    pub fn intercept(&self, inner: Router) -> Router {
        self.router().fallback_service(inner)
    }

    /// Stop the scheduler and the background tasks
    pub async fn stop(&self) -> Result<()> {
        self.scheduler.stop().await?;
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        tracing::info!("Emulator stopped");
        Ok(())
    }
}

/// Create the main Axum application: the emulator plus a health check
pub fn create_app(emulator: &Emulator) -> Router {
    tracing::info!("Creating HTTP router with all endpoints");
    let host = Router::new().route("/healthz", get(health_check));
    emulator.intercept(host)
}

/// Start the HTTP server with the given configuration
///
/// Installs the emulator and serves it on the configured address until
/// Ctrl-C, then stops the background loops.
pub async fn start_server(config: Config) -> Result<()> {
    // Initialize tracing subscriber for logging
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    tracing::info!("Starting workflow backend emulator...");

    let emulator = Emulator::install(&config).await?;
    let app = create_app(&emulator);

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&bind_addr).await?;

    tracing::info!("Server listening on http://{}", bind_addr);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    emulator.stop().await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

/// Health check endpoint handler
async fn health_check() -> &'static str {
    "ok"
}
