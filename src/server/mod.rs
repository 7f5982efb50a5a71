//! HTTP server
//!
//! Serves the trace API, search, the blocklist, health checks and Prometheus
//! metrics over HTTP/1.
//!
//! # Example
//!
//! ```no_run
//! use kura::server::{AppState, Server};
//! use std::sync::Arc;
//!
//! # async fn example(state: Arc<AppState>) -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = Server::new("127.0.0.1:3200", state)?;
//! let addr = server.start().await?;
//! println!("listening on {}", addr);
//! server.shutdown().await;
//! # Ok(())
//! # }
//! ```

use crate::ingester::Ingester;
use crate::querier::Querier;
use crate::store::Store;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

mod handlers;

pub use handlers::{handle_request, DEFAULT_TENANT};

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Failed to bind to address: {0}")]
    BindError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Shared state handed to every request
pub struct AppState {
    pub ingester: Arc<Ingester>,
    pub querier: Arc<Querier>,
    pub store: Arc<Store>,
    pub metrics_enabled: bool,
}

/// HTTP Server
pub struct Server {
    addr: SocketAddr,
    state: Arc<AppState>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    server_handle: Option<tokio::task::JoinHandle<()>>,
}

impl Server {
    pub fn new(address: &str, state: Arc<AppState>) -> Result<Self, ServerError> {
        let addr: SocketAddr = address
            .parse()
            .map_err(|e| ServerError::BindError(format!("{}: {}", address, e)))?;

        Ok(Self {
            addr,
            state,
            shutdown_tx: None,
            server_handle: None,
        })
    }

    /// Bind and start serving in the background.
    ///
    /// Returns the bound address, which differs from the configured one when
    /// port 0 was requested.
    pub async fn start(&mut self) -> Result<SocketAddr, ServerError> {
        let listener = TcpListener::bind(self.addr)
            .await
            .map_err(|e| ServerError::BindError(format!("{}: {}", self.addr, e)))?;
        let addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        self.shutdown_tx = Some(shutdown_tx);

        let state = self.state.clone();
        self.server_handle = Some(tokio::spawn(async move {
            run_server(listener, state, shutdown_rx).await;
        }));

        tracing::info!(address = %addr, "HTTP server listening");
        Ok(addr)
    }

    /// Stop accepting connections and wait for the accept loop to exit.
    pub async fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.server_handle.take() {
            let _ = handle.await;
        }
    }
}

async fn run_server(
    listener: TcpListener,
    state: Arc<AppState>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut shutdown_rx => {
                break;
            }
            result = listener.accept() => {
                match result {
                    Ok((stream, _)) => {
                        let io = TokioIo::new(stream);
                        let state = state.clone();
                        tokio::spawn(async move {
                            let service = service_fn(move |req| handle_request(state.clone(), req));
                            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                                tracing::debug!(error = %e, "Connection closed with error");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to accept connection");
                        continue;
                    }
                }
            }
        }
    }
}
