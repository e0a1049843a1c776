//! Scrape server
//!
//! Serves `/metrics` from whatever registry is currently published. The
//! registry slot is a single atomic reference: a scrape either sees the old
//! registry (still draining) or the new one, never a half-swapped state.

use crate::dump;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use gpuscope_collector::{exposition, Registry, Transform};
use gpuscope_core::config::DumpConfig;
use gpuscope_core::{EntityGroup, Error, Result};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const TEXT_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// HTTP scrape endpoint with an atomically swappable registry.
pub struct MetricsServer {
    state: Arc<ServerState>,
}

struct ServerState {
    registry: RwLock<Option<Registry>>,
    pipeline: Vec<Arc<dyn Transform>>,
    reload_in_progress: AtomicBool,
    dump: DumpConfig,
}

impl MetricsServer {
    pub fn new(pipeline: Vec<Arc<dyn Transform>>, dump: DumpConfig) -> Arc<Self> {
        Arc::new(Self {
            state: Arc::new(ServerState {
                registry: RwLock::new(None),
                pipeline,
                reload_in_progress: AtomicBool::new(false),
                dump,
            }),
        })
    }

    /// Publish a registry. Exactly one registry is active at any moment.
    pub fn set_registry(&self, registry: Registry) {
        *self.state.registry.write().unwrap_or_else(|e| e.into_inner()) = Some(registry);
    }

    /// Unpublish and return the current registry; `/metrics` serves empty
    /// documents until the next `set_registry`.
    pub fn clear_registry(&self) -> Option<Registry> {
        self.state.registry.write().unwrap_or_else(|e| e.into_inner()).take()
    }

    /// The currently published registry, if any.
    pub fn registry(&self) -> Option<Registry> {
        self.state.registry.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn is_reload_in_progress(&self) -> bool {
        self.state.reload_in_progress.load(Ordering::SeqCst)
    }

    pub fn set_reload_in_progress(&self, in_progress: bool) {
        self.state.reload_in_progress.store(in_progress, Ordering::SeqCst);
    }

    /// Serve until the token is cancelled.
    pub async fn run(&self, address: &str, cancel: CancellationToken) -> Result<()> {
        let addr = listen_addr(address)?;
        let app = self.router();
        let listener = TcpListener::bind(addr).await?;
        info!(address = %addr, "HTTP server started - ready to serve metrics");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await
            .map_err(|e| Error::internal(format!("metrics server failed: {}", e)))?;
        Ok(())
    }

    /// The axum application. Exposed for in-process testing.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/health", get(health_handler))
            .with_state(self.state.clone())
    }
}

/// Resolve a listen address, accepting the bare `:port` shorthand.
fn listen_addr(address: &str) -> Result<SocketAddr> {
    let normalized = if address.starts_with(':') {
        format!("0.0.0.0{}", address)
    } else {
        address.to_string()
    };
    normalized
        .parse()
        .map_err(|e| Error::config(format!("invalid listen address '{}': {}", address, e)))
}

async fn metrics_handler(State(state): State<Arc<ServerState>>) -> Response {
    // Snapshot the registry outside of any await point.
    let registry = {
        let slot = state.registry.read().unwrap_or_else(|e| e.into_inner());
        slot.clone()
    };
    let Some(registry) = registry else {
        return empty_document();
    };

    match registry.gather().await {
        Ok(mut gather) => {
            if let Some(gpu_metrics) = gather.get_mut(&EntityGroup::Gpu) {
                for stage in &state.pipeline {
                    if let Err(e) = stage.process(gpu_metrics) {
                        warn!(stage = stage.name(), error = %e, "transformation stage failed");
                    }
                }
            }

            let body = exposition::render(&gather);
            if state.dump.enabled {
                dump::write_snapshot(&state.dump, &body);
            }
            ([("content-type", TEXT_CONTENT_TYPE)], body).into_response()
        }
        Err(Error::RegistryShuttingDown) => empty_document(),
        Err(e) if e.is_fatal() => {
            error!(error = %e, "could not retrieve metrics");
            std::process::exit(1);
        }
        Err(e) => {
            error!(error = %e, "gather failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "failed to gather metrics").into_response()
        }
    }
}

/// A reload window serves 200 with an empty body, never an error.
fn empty_document() -> Response {
    ([("content-type", TEXT_CONTENT_TYPE)], String::new()).into_response()
}

async fn health_handler() -> Response {
    (StatusCode::OK, "OK").into_response()
}
