use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use axum_server::Handle;
use blob_store::{ObjectStorePrimary, PrimaryStore};
use gateway_metrics::gateway_stats;
use tokio::signal;
use tracing::{error, info};

use crate::{
    background::BackgroundTasks,
    config::GatewayConfig,
    dispatcher::Dispatcher,
    edge_cache::{EdgeCacheController, MemoryEdgeCache},
    mirror::CopyOnRead,
    origin::{HttpOrigin, Origin},
    routes::{create_routes, RouteState},
};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

pub struct Service {
    pub config: GatewayConfig,
    pub origin: Arc<dyn Origin>,
    pub dispatcher: Dispatcher,
    pub background: BackgroundTasks,
    pub metrics: Arc<gateway_stats::Metrics>,
}

impl Service {
    pub fn new(config: GatewayConfig) -> Result<Self> {
        let origin: Arc<dyn Origin> = Arc::new(
            HttpOrigin::new(
                &config.origin_url,
                Duration::from_secs(config.origin_connect_timeout_secs),
            )
            .context("error initializing origin client")?,
        );
        let store: Arc<dyn PrimaryStore> = Arc::new(
            ObjectStorePrimary::new(&config.primary_store)
                .context("error initializing primary store")?,
        );
        let metrics = Arc::new(gateway_stats::Metrics::new());

        let engine = CopyOnRead::new(
            origin.clone(),
            store.clone(),
            config.mirror.clone(),
            metrics.clone(),
        );
        let cache = EdgeCacheController::new(
            Arc::new(MemoryEdgeCache::new()),
            store.clone(),
            &config.edge_cache,
            metrics.clone(),
        )?;
        let dispatcher = Dispatcher::new(
            origin.clone(),
            store.clone(),
            engine,
            cache,
            metrics.clone(),
        );

        Ok(Self {
            config,
            origin,
            dispatcher,
            background: BackgroundTasks::new(metrics.clone()),
            metrics,
        })
    }

    pub async fn start(&self) -> Result<()> {
        let route_state = RouteState {
            dispatcher: self.dispatcher.clone(),
            origin: self.origin.clone(),
            background: self.background.clone(),
            index_object: self.config.index_object.clone(),
            metrics: self.metrics.clone(),
        };

        let handle = Handle::new();
        let handle_sh = handle.clone();
        tokio::spawn(shutdown_signal(handle_sh));

        let addr: SocketAddr = self.config.listen_addr.parse()?;
        info!(
            origin = %self.config.origin_url,
            primary_store = %self.config.primary_store.path,
            "gateway listening on {}",
            self.config.listen_addr
        );
        let routes = create_routes(
            route_state,
            &self.config.env,
            &self.config.instance_id(),
        );
        axum_server::bind(addr)
            .handle(handle)
            .serve(routes.into_make_service())
            .await?;

        info!(
            pending = self.background.pending(),
            "waiting for background mirrors and cache writes"
        );
        self.background.shutdown().await;
        info!(failed = self.background.failures(), "background work drained");
        Ok(())
    }
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!("failed to install signal handler: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
        },
        _ = terminate => {
        },
    }
    handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
    info!("signal received, shutting down server gracefully");
}
