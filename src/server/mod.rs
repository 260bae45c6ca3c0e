use axum::{Router, extract::DefaultBodyLimit, middleware};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::{
    auth::{Resolver, admin_auth_middleware, auth_middleware},
    bus::{BusHealthChecker, EventSink, EventSource},
    cache::{AuthCache, spawn_invalidation_listener},
    config::Config,
    error::AppError,
    health::HealthService,
    ledger::Ledger,
    pipeline::RequestPipeline,
    pricing::Pricing,
    providers::{HttpProviderAdapter, ProviderAdapter, ProviderKind},
    routes,
    storage::{Store, StoreHealthChecker},
};

/// Maximum inbound request body size (10 MiB).
pub const MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

/// How long shutdown waits for outstanding stream settlements.
const SETTLEMENT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// One gateway instance: every per-instance singleton (store pool, bus
/// subscription, auth cache, pipeline) lives here and is wired at init.
#[derive(Clone)]
pub struct Server {
    pub config: Arc<Config>,
    pub store: Arc<dyn Store>,
    pub bus: Arc<dyn EventSink>,
    pub cache: Arc<AuthCache>,
    pub resolver: Arc<Resolver>,
    pub pipeline: Arc<RequestPipeline>,
    pub health_service: Arc<HealthService>,
    bus_listener: Arc<JoinHandle<()>>,
}

impl Server {
    pub async fn new(config: Config) -> Result<Self, AppError> {
        let store = crate::storage::connect(&config.store).await?;
        store.health_check().await?;

        let (sink, source) = crate::bus::connect(&config.bus).await?;
        sink.health_check().await?;

        let openai: Arc<dyn ProviderAdapter> = Arc::new(HttpProviderAdapter::new(
            ProviderKind::OpenAi,
            &config.providers.openai,
        )?);
        let anthropic: Arc<dyn ProviderAdapter> = Arc::new(HttpProviderAdapter::new(
            ProviderKind::Anthropic,
            &config.providers.anthropic,
        )?);

        Ok(Self::from_parts(config, store, sink, source, openai, anthropic).await)
    }

    /// Wire a server from explicit components; tests inject memory
    /// backends and recording adapters here.
    pub async fn from_parts(
        config: Config,
        store: Arc<dyn Store>,
        bus: Arc<dyn EventSink>,
        source: Box<dyn EventSource>,
        openai: Arc<dyn ProviderAdapter>,
        anthropic: Arc<dyn ProviderAdapter>,
    ) -> Self {
        let cache = Arc::new(AuthCache::new(store.clone(), &config.cache));
        let bus_listener = Arc::new(spawn_invalidation_listener(cache.clone(), source));

        let resolver = Arc::new(Resolver::new(cache.clone()));
        let pricing = Pricing::new(cache.clone());
        let ledger = Arc::new(Ledger::new(
            store.clone(),
            pricing,
            cache.clone(),
            bus.clone(),
        ));
        let pipeline = Arc::new(RequestPipeline::new(
            ledger,
            openai,
            anthropic,
            Duration::from_secs(config.upstream.timeout_seconds),
        ));

        let health_service = Arc::new(HealthService::new());
        health_service
            .register(Arc::new(StoreHealthChecker::new(store.clone())))
            .await;
        health_service
            .register(Arc::new(BusHealthChecker::new(bus.clone())))
            .await;

        Self {
            config: Arc::new(config),
            store,
            bus,
            cache,
            resolver,
            pipeline,
            health_service,
            bus_listener,
        }
    }

    pub async fn run(&self) -> Result<(), AppError> {
        info!("running store migrations");
        self.store.migrate().await?;

        let app = self.create_app();
        let addr: SocketAddr = format!("{}:{}", self.config.server.host, self.config.server.port)
            .parse()
            .map_err(|e| AppError::Internal(format!("invalid listen address: {e}")))?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| AppError::Internal(format!("failed to bind {addr}: {e}")))?;

        info!("gateway listening on http://{addr}");

        let serve = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal());

        if let Err(e) = serve.await {
            error!("server error: {e}");
        }

        // Stream settlements may still be running after the last response
        // was sent; give them a bounded window to finish.
        if !self
            .pipeline
            .settlements()
            .wait_idle(SETTLEMENT_DRAIN_TIMEOUT)
            .await
        {
            error!("settlement drain timed out; aborting remaining tasks");
            self.pipeline.settlements().abort_all().await;
        }
        self.bus_listener.abort();

        info!("shutdown complete");
        Ok(())
    }

    pub fn create_app(&self) -> Router {
        let proxy = routes::proxy_routes()
            .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
            .layer(middleware::from_fn_with_state(self.clone(), auth_middleware));

        let admin = routes::admin::admin_routes().layer(middleware::from_fn_with_state(
            self.clone(),
            admin_auth_middleware,
        ));

        Router::new()
            .merge(proxy)
            .nest("/admin", admin)
            .nest("/health", routes::health_routes())
            .layer(middleware::from_fn(routes::request_id_middleware))
            .with_state(self.clone())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {e}");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => error!("failed to install SIGTERM handler: {e}"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C"),
        _ = terminate => info!("received SIGTERM"),
    }
}
