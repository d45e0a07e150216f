//! Admin control API: triggers reconciliation, inspects workers, pins the
//! default version, and shuts the orchestrator down.
//!
//! Binds to loopback only and speaks JSON on every route. There is no
//! authentication; the API is a local control socket, not a public surface.

use crate::error::{json_error_response, json_response, Result};
use crate::meta::Instance;
use crate::reconcile::Reconciler;
use std::collections::BTreeMap;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Serialize a value as the 200 response body; a serialization failure
/// becomes the standard 500 error body
fn json_ok<T: serde::Serialize>(value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_string(value) {
        Ok(body) => json_response(StatusCode::OK, body),
        Err(e) => json_error_response(e),
    }
}

/// Extract a query parameter from the request URI
fn query_param(uri: &Uri, key: &str) -> Option<String> {
    uri.query()?.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == key && !v.is_empty()).then(|| v.to_string())
    })
}

/// HTTP server driving the reconciler
pub struct AdminServer {
    bind_addr: SocketAddr,
    reconciler: Arc<Reconciler>,
    /// Flipping this is the one cancellation path for the whole process
    stop_tx: watch::Sender<bool>,
}

impl AdminServer {
    pub fn new(bind_addr: SocketAddr, reconciler: Arc<Reconciler>, stop_tx: watch::Sender<bool>) -> Self {
        Self {
            bind_addr,
            reconciler,
            stop_tx,
        }
    }

    /// Accept loop; returns once the stop flag is set
    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Admin API listening");

        let mut shutdown_rx = self.stop_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let reconciler = Arc::clone(&self.reconciler);
                            let stop_tx = self.stop_tx.clone();

                            tokio::spawn(async move {
                                let io = TokioIo::new(stream);
                                let service = service_fn(move |req| {
                                    let reconciler = Arc::clone(&reconciler);
                                    let stop_tx = stop_tx.clone();
                                    async move { handle_request(req, reconciler, stop_tx).await }
                                });

                                if let Err(e) = AutoBuilder::new(TokioExecutor::new())
                                    .serve_connection(io, service)
                                    .await
                                {
                                    debug!(addr = %addr, error = %e, "Admin connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept admin connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Admin API shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    reconciler: Arc<Reconciler>,
    stop_tx: watch::Sender<bool>,
) -> std::result::Result<Response<Full<Bytes>>, hyper::Error> {
    let path = req.uri().path().to_string();
    let method = req.method().clone();
    debug!(%method, %path, "Admin API request");

    let response = match path.as_str() {
        "/reload" => {
            let version = query_param(req.uri(), "version");
            match reload(&reconciler, version.as_deref()).await {
                Ok(instances) => json_ok(&instances),
                Err(e) => json_error_response(e),
            }
        }

        "/processes" => json_ok(&reconciler.supervisor().list()),

        "/resize" => {
            let version = query_param(req.uri(), "version");
            let size = query_param(req.uri(), "size").and_then(|s| s.parse::<u32>().ok());
            match (version, size) {
                (Some(version), Some(size)) => {
                    match reconciler.supervisor().resize(&version, size).await {
                        Ok(()) => json_response(
                            StatusCode::OK,
                            serde_json::json!({ "version": version, "size": size }).to_string(),
                        ),
                        Err(e) => json_error_response(e),
                    }
                }
                _ => json_error_response("resize requires version and size parameters"),
            }
        }

        "/stop" => {
            info!("Stop requested via admin API");
            // Flip the flag first so no exit event schedules a respawn
            let _ = stop_tx.send(true);
            reconciler.supervisor().terminate_all();
            json_response(StatusCode::OK, serde_json::json!({ "stopping": true }).to_string())
        }

        "/version" => {
            let body = serde_json::json!({ "name": PKG_NAME, "version": VERSION });
            json_response(StatusCode::OK, body.to_string())
        }

        // Default route: current instance map
        _ => json_ok(&reconciler.instances().await),
    };

    Ok(response)
}

/// Pin the requested version (if any) and run a reconciliation pass
async fn reload(
    reconciler: &Reconciler,
    version: Option<&str>,
) -> Result<BTreeMap<String, Instance>> {
    if let Some(version) = version {
        reconciler.pin_current_version(version)?;
    }
    reconciler.reconcile().await
}
