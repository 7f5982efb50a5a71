//! Process wiring
//!
//! Builds the backend, store, ingester, querier and compactor from a
//! [`Config`], starts the background loops and the HTTP server, and tears
//! everything down in order on shutdown: stop accepting requests, flush the
//! ingester, stop the compactor.

use crate::backend::{Backend, BackendError, LocalBackend, MemoryBackend, RawBackend, S3Backend};
use crate::compactor::Compactor;
use crate::config::{BackendKind, Config, ConfigError};
use crate::ingester::{IngestError, Ingester};
use crate::querier::{FederatedQuerier, Querier, QueryError};
use crate::server::{AppState, Server, ServerError};
use crate::store::Store;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Startup errors
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Ingester error: {0}")]
    Ingest(#[from] IngestError),

    #[error("Querier error: {0}")]
    Query(#[from] QueryError),

    #[error("Server error: {0}")]
    Server(#[from] ServerError),
}

pub struct App {
    config: Config,
    store: Arc<Store>,
    ingester: Arc<Ingester>,
    compactor: Option<Arc<Compactor>>,
    server: Server,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl App {
    /// Build every component. WAL blocks left by a previous run are replayed
    /// and queued for flush.
    pub async fn build(config: Config) -> Result<Self, AppError> {
        config.validate()?;

        let backend = Backend::new(raw_backend(&config).await?);
        let max_workers = config.storage.pool.max_workers;
        let store = Arc::new(Store::new(backend.clone(), max_workers));

        let ingester = Arc::new(Ingester::new(
            config.ingester.clone(),
            config.storage.block.clone(),
            &config.storage.wal.path,
            backend,
            store.clone(),
            config.logging.rate_limited_per_second,
        )?);
        let replayed = ingester.replay_wal()?;
        tracing::info!(blocks = replayed, wal = %config.storage.wal.path, "WAL replay finished");

        let federation = if config.querier.federation.is_empty() {
            None
        } else {
            Some(FederatedQuerier::new(
                config.querier.federation.clone(),
                config.querier.federation_timeout(),
                max_workers,
            )?)
        };
        let querier = Arc::new(Querier::new(ingester.clone(), store.clone(), federation));

        let compactor = config.compactor.enabled.then(|| {
            Arc::new(Compactor::new(
                config.compactor.clone(),
                config.storage.block.clone(),
                store.clone(),
                max_workers,
            ))
        });

        let state = Arc::new(AppState {
            ingester: ingester.clone(),
            querier,
            store: store.clone(),
            metrics_enabled: config.metrics.enabled,
        });
        let server = Server::new(&config.server.address, state)?;
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            store,
            ingester,
            compactor,
            server,
            shutdown_tx,
            tasks: Vec::new(),
        })
    }

    /// Start background loops and the HTTP server. Returns the bound address.
    pub async fn start(&mut self) -> Result<SocketAddr, AppError> {
        if let Err(e) = self.store.poll_blocklist().await {
            tracing::warn!(error = %e, "Initial blocklist poll failed");
        }

        self.tasks.push(tokio::spawn(
            self.ingester.clone().run(self.shutdown_tx.subscribe()),
        ));
        if let Some(compactor) = &self.compactor {
            self.tasks
                .push(tokio::spawn(compactor.clone().run(self.shutdown_tx.subscribe())));
        } else {
            self.tasks.push(tokio::spawn(poll_loop(
                self.store.clone(),
                self.config.storage.blocklist_poll(),
                self.shutdown_tx.subscribe(),
            )));
        }

        let addr = self.server.start().await?;
        tracing::info!(
            address = %addr,
            backend = ?self.config.storage.backend,
            compactor = self.compactor.is_some(),
            "Kura started"
        );
        Ok(addr)
    }

    /// Serve until `signal` resolves, then shut down.
    pub async fn run_until<F>(mut self, signal: F) -> Result<(), AppError>
    where
        F: Future<Output = ()>,
    {
        self.start().await?;
        signal.await;
        self.shutdown().await;
        Ok(())
    }

    /// Stop serving, flush the ingester and wait for background loops.
    pub async fn shutdown(&mut self) {
        tracing::info!("Shutting down");
        self.server.shutdown().await;
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Background task failed");
            }
        }
        tracing::info!("Shutdown complete");
    }

    pub fn ingester(&self) -> &Arc<Ingester> {
        &self.ingester
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }
}

async fn raw_backend(config: &Config) -> Result<Arc<dyn RawBackend>, AppError> {
    let raw: Arc<dyn RawBackend> = match config.storage.backend {
        BackendKind::Local => Arc::new(LocalBackend::new(&config.storage.local.path).await?),
        BackendKind::S3 => {
            let s3 = config.storage.s3.as_ref().ok_or_else(|| {
                ConfigError::ValidationError("storage.s3 must be set with the s3 backend".into())
            })?;
            Arc::new(S3Backend::new(s3).await?)
        }
        BackendKind::Memory => Arc::new(MemoryBackend::new()),
    };
    Ok(raw)
}

/// Keeps the blocklist fresh when no compactor is polling it.
async fn poll_loop(
    store: Arc<Store>,
    period: std::time::Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = store.poll_blocklist().await {
                    tracing::error!(error = %e, "Blocklist poll failed");
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}
