//! # HTTP Server Module
//!
//! Builds the public and admin axum apps and runs them until shutdown.
//!
//! Public surface:
//! - `GET /health`: constant liveness payload, never proxied
//! - `GET|POST /api/*path`: handed to [`GatewayService::handle`]
//!
//! Layer order, outermost first: panic catcher, CORS, trace, request id, then
//! authentication on the `/api` routes only.
//!
//! ## Rust Concepts Used
//!
//! - `FutureExt::catch_unwind` turns a panic inside one request into a 500 for that
//!   request alone
//! - `tokio::sync::watch` fans a single shutdown signal out to both listeners
//! - `into_make_service_with_connect_info` exposes the peer address to handlers

use axum::{
    body::Bytes,
    extract::{ConnectInfo, State},
    http::{HeaderMap, Method, StatusCode, Uri},
    middleware::{from_fn, from_fn_with_state},
    response::{IntoResponse, Json, Response},
    routing::get,
    Extension, Router,
};
use futures::FutureExt;
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use std::any::Any;
use std::future::Future;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::admin::{AdminRouter, AdminState};
use crate::auth::{auth_middleware, AuthContext, AuthGuard, JwtAuthenticator};
use crate::core::circuit_breaker::CircuitBreaker;
use crate::core::config::GatewayConfig;
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::ProxyRequest;
use crate::gateway::service::GatewayService;
use crate::middleware::{cors_layer, request_id_middleware, RequestId};
use crate::routing::{Route, RouteTable};

pub const HEALTH_MESSAGE: &str = "Gateway service is healthy";

/// Public and admin servers sharing one [`GatewayService`]
pub struct GatewayServer {
    config: GatewayConfig,
    service: GatewayService,
    metrics: Option<PrometheusHandle>,
}

impl GatewayServer {
    pub fn new(config: GatewayConfig, service: GatewayService) -> Self {
        Self {
            config,
            service,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    pub fn service(&self) -> &GatewayService {
        &self.service
    }

    /// The public app: `/health` plus the proxied `/api` routes
    pub fn gateway_app(&self) -> GatewayResult<Router> {
        let mut api = Router::new()
            .route("/api/*path", get(proxy_handler).post(proxy_handler))
            .with_state(self.service.clone());

        if self.config.auth.enabled {
            let authenticator = JwtAuthenticator::from_config(&self.config.auth)?;
            let guard = AuthGuard::new(Arc::new(authenticator), self.config.auth.skip_paths.clone());
            api = api.layer(from_fn_with_state(guard, auth_middleware));
            info!(skip_paths = ?self.config.auth.skip_paths, "JWT authentication enabled");
        }

        Ok(Router::new()
            .route("/health", get(gateway_health))
            .merge(api)
            .fallback(unmatched)
            .layer(from_fn(request_id_middleware))
            .layer(TraceLayer::new_for_http())
            .layer(cors_layer(&self.config.cors))
            .layer(CatchPanicLayer::custom(panic_response)))
    }

    pub fn admin_app(&self) -> Router {
        let mut state = AdminState::new(self.service.clone());
        if let Some(handle) = &self.metrics {
            state = state.with_metrics(handle.clone());
        }
        AdminRouter::create_router(state)
            .layer(TraceLayer::new_for_http())
            .layer(CatchPanicLayer::custom(panic_response))
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.config.server.bind_address, self.config.server.port)
    }

    pub fn admin_bind_addr(&self) -> String {
        format!(
            "{}:{}",
            self.config.server.bind_address, self.config.server.admin_port
        )
    }

    /// Bind both listeners and serve until SIGINT or SIGTERM
    pub async fn start(self) -> GatewayResult<()> {
        let gateway_addr = self.bind_addr();
        let admin_addr = self.admin_bind_addr();

        let gateway_listener = TcpListener::bind(&gateway_addr).await.map_err(|e| {
            GatewayError::internal(format!("Failed to bind gateway server to {}: {}", gateway_addr, e))
        })?;
        let admin_listener = if self.config.server.admin_enabled() {
            Some(TcpListener::bind(&admin_addr).await.map_err(|e| {
                GatewayError::internal(format!("Failed to bind admin server to {}: {}", admin_addr, e))
            })?)
        } else {
            info!("Admin listener disabled");
            None
        };

        self.serve(gateway_listener, admin_listener, shutdown_signal())
            .await
    }

    /// Serve on already-bound listeners until `shutdown` completes.
    ///
    /// In-flight requests get `server.shutdown_timeout` to finish once shutdown starts.
    /// Without an admin listener only the public app is served.
    pub async fn serve<F>(
        self,
        gateway_listener: TcpListener,
        admin_listener: Option<TcpListener>,
        shutdown: F,
    ) -> GatewayResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let gateway_app = self.gateway_app()?;
        let admin_app = self.admin_app();
        let drain_timeout = self.config.server.shutdown_timeout;

        info!(addr = ?gateway_listener.local_addr().ok(), "Gateway HTTP server listening");

        let sweeper = CircuitBreaker::start_sweeper(Arc::clone(self.service.breaker()));

        let (stop_tx, stop_rx) = watch::channel(false);
        let gateway = axum::serve(
            gateway_listener,
            gateway_app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(stopped(stop_rx.clone()));
        let mut gateway_task = tokio::spawn(async move { gateway.await });
        let mut admin_task = match admin_listener {
            Some(listener) => {
                info!(addr = ?listener.local_addr().ok(), "Admin HTTP server listening");
                let admin = axum::serve(listener, admin_app).with_graceful_shutdown(stopped(stop_rx));
                tokio::spawn(async move { admin.await })
            }
            None => tokio::spawn(async move {
                stopped(stop_rx).await;
                Ok::<(), std::io::Error>(())
            }),
        };

        let early_exit = tokio::select! {
            _ = shutdown => None,
            res = &mut gateway_task => Some(("gateway", res)),
            res = &mut admin_task => Some(("admin", res)),
        };

        sweeper.abort();
        let _ = stop_tx.send(true);

        if let Some((name, res)) = early_exit {
            gateway_task.abort();
            admin_task.abort();
            return match res {
                Ok(Ok(())) => Err(GatewayError::internal(format!("{} server exited unexpectedly", name))),
                Ok(Err(e)) => Err(GatewayError::internal(format!("{} server error: {}", name, e))),
                Err(e) => Err(GatewayError::internal(format!("{} server task failed: {}", name, e))),
            };
        }

        info!(timeout = ?drain_timeout, "Shutdown signal received, draining connections");
        let drain = async {
            let (gateway_res, admin_res) = tokio::join!(gateway_task, admin_task);
            for (name, res) in [("gateway", gateway_res), ("admin", admin_res)] {
                match res {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(server = name, error = %e, "Server stopped with error"),
                    Err(e) => warn!(server = name, error = %e, "Server task failed"),
                }
            }
        };
        if tokio::time::timeout(drain_timeout, drain).await.is_err() {
            warn!("Shutdown timeout elapsed, dropping remaining connections");
        }

        info!("Gateway stopped");
        Ok(())
    }
}

async fn stopped(mut rx: watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Completes on Ctrl-C, or SIGTERM on unix
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Swap route tables whenever a reloaded configuration is broadcast.
///
/// Only routes are hot; every other setting needs a restart.
pub fn spawn_route_reloader(
    routes: Arc<RouteTable>,
    mut updates: broadcast::Receiver<Arc<GatewayConfig>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match updates.recv().await {
                Ok(config) => routes.replace(config.routes.iter().map(Route::from).collect()),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Missed configuration updates, waiting for the next one");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

async fn gateway_health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "gateway",
        "message": HEALTH_MESSAGE,
    }))
}

async fn unmatched(uri: Uri) -> GatewayError {
    GatewayError::route_not_found(uri.path())
}

/// Main request handler: adapt the axum request and run the pipeline
#[allow(clippy::too_many_arguments)]
async fn proxy_handler(
    State(service): State<GatewayService>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    auth: Option<Extension<AuthContext>>,
    request_id: Option<Extension<RequestId>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let caller = connect_info.map(|ConnectInfo(addr)| addr.ip());
    let mut request = ProxyRequest::new(method, uri.path())
        .with_query(uri.query().map(str::to_string))
        .with_headers(headers)
        .with_body(body)
        .with_caller(caller)
        .with_user_id(auth.map(|Extension(ctx)| ctx.user_id));
    if let Some(Extension(RequestId(id))) = request_id {
        request = request.with_id(id);
    }

    let method = request.method.clone();
    let path = request.path.clone();
    let id = request.id.clone();

    match AssertUnwindSafe(service.handle(request)).catch_unwind().await {
        Ok(response) => response.into_response(),
        Err(panic) => {
            error!(
                request_id = %id,
                method = %method,
                path = %path,
                caller = ?caller,
                panic = %panic_message(panic.as_ref()),
                "Request handling panicked"
            );
            GatewayError::internal("unexpected failure while handling request").into_response()
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    error!(panic = %panic_message(panic.as_ref()), "Panic escaped a handler");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({
            "error": {
                "code": 500,
                "message": "Internal server error",
                "type": "internal_error",
            }
        })),
    )
        .into_response()
}
