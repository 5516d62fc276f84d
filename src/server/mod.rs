// Trial server - route assembly, middleware stack, and server lifecycle

pub mod handlers;
pub mod middleware;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use tokio::sync::{oneshot, RwLock};
use tracing::{debug, error, info};

use handlers::trial::{handle_method_not_allowed, handle_request_trial};
use handlers::AppState;
use middleware::{cors_layer, request_log_middleware};

pub const TRIAL_PATH: &str = "/api/request-trial";
pub const LEGACY_TRIAL_PATH: &str = "/.netlify/functions/request-trial";

async fn health_check_handler() -> Response {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
    .into_response()
}

/// Full application router. Exposed separately from `TrialServer::start` so
/// tests can drive it without a socket.
pub fn build_router(state: AppState, max_body_bytes: usize) -> Router {
    let trial = post(handle_request_trial).fallback(handle_method_not_allowed);

    Router::new()
        .route(TRIAL_PATH, trial.clone())
        .route(LEGACY_TRIAL_PATH, trial)
        .route("/health", get(health_check_handler))
        .route("/healthz", get(health_check_handler))
        .layer(axum::middleware::from_fn(request_log_middleware))
        .layer(cors_layer())
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .with_state(state)
}

// ============================================================================
// TrialServer - Server lifecycle management
// ============================================================================

#[derive(Clone)]
pub struct TrialServer {
    shutdown_tx: Arc<tokio::sync::Mutex<Option<oneshot::Sender<()>>>>,
    pub local_addr: SocketAddr,
    pub is_running: Arc<RwLock<bool>>,
}

impl TrialServer {
    /// Bind and start serving. Port 0 picks a free port; see `local_addr`.
    pub async fn start(
        host: &str,
        port: u16,
        state: AppState,
        max_body_bytes: usize,
    ) -> Result<(Self, tokio::task::JoinHandle<()>), String> {
        let app = build_router(state, max_body_bytes);

        let addr = format!("{}:{}", host, port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| format!("Failed to bind {}: {}", addr, e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| format!("Failed to read local address: {}", e))?;

        info!("Trial server started at http://{}", local_addr);

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let is_running = Arc::new(RwLock::new(true));

        let server_instance = Self {
            shutdown_tx: Arc::new(tokio::sync::Mutex::new(Some(shutdown_tx))),
            local_addr,
            is_running: is_running.clone(),
        };

        let handle = tokio::spawn(async move {
            use hyper::server::conn::http1;
            use hyper_util::rt::TokioIo;
            use hyper_util::service::TowerToHyperService;

            let app_service = app.into_service();

            loop {
                tokio::select! {
                    res = listener.accept() => {
                        match res {
                            Ok((stream, remote_addr)) => {
                                let io = TokioIo::new(stream);

                                use tower::ServiceExt;
                                use hyper::body::Incoming;
                                let svc = app_service.clone().map_request(
                                    move |mut req: axum::http::Request<Incoming>| {
                                        req.extensions_mut().insert(
                                            axum::extract::ConnectInfo(remote_addr),
                                        );
                                        req
                                    },
                                );

                                let hyper_svc = TowerToHyperService::new(svc);

                                tokio::task::spawn(async move {
                                    if let Err(err) = http1::Builder::new()
                                        .serve_connection(io, hyper_svc)
                                        .await
                                    {
                                        debug!("Connection ended: {:?}", err);
                                    }
                                });
                            }
                            Err(e) => {
                                error!("Accept connection failed: {:?}", e);
                            }
                        }
                    }
                    _ = &mut shutdown_rx => {
                        info!("Trial server shutting down");
                        break;
                    }
                }
            }
            *is_running.write().await = false;
        });

        Ok((server_instance, handle))
    }

    /// Signal the accept loop to stop. In-flight connections finish on their own.
    pub async fn stop(&self) {
        let mut lock = self.shutdown_tx.lock().await;
        if let Some(tx) = lock.take() {
            let _ = tx.send(());
            info!("Trial server stop signal sent");
        }
    }

    pub async fn running(&self) -> bool {
        *self.is_running.read().await
    }
}
