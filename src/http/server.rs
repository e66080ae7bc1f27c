//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create the Axum router for webhook ingestion
//! - Wire up middleware (request ID, tracing, request timeout)
//! - Hand every delivery to the current `SecurityGateway`
//! - Swap in a rebuilt gateway when a new configuration arrives
//! - Stop accepting and drain on shutdown

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use axum::{
    body::Body,
    extract::{ConnectInfo, Path, State},
    http::Request,
    response::{IntoResponse, Response},
    routing::post,
    Router,
};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tower::ServiceBuilder;
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::config::schema::GatewayConfig;
use crate::config::validation::validate_config;
use crate::http::request::extract_context;
use crate::security::clock::SystemClock;
use crate::security::{GatewayHandle, SecurityGateway, SecurityState};

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub inner: GatewayHandle,
}

impl AppState {
    pub fn new(gateway: SecurityGateway) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(gateway)),
        }
    }

    /// Replace the running gateway, keeping its security state.
    pub fn reload(&self, config: GatewayConfig) -> bool {
        if let Err(errors) = validate_config(&config) {
            for error in &errors {
                tracing::error!(%error, "Rejected configuration update");
            }
            return false;
        }

        let state = self.inner.load().state().clone();
        let gateway = SecurityGateway::new(Arc::new(config), state);
        tracing::info!(
            rate_limit_mode = ?gateway.rate_limiter().mode(),
            "Configuration reloaded, gateway swapped"
        );
        self.inner.store(Arc::new(gateway));
        true
    }
}

/// HTTP server for webhook ingestion.
pub struct HttpServer {
    router: Router,
    state: AppState,
}

impl HttpServer {
    /// Create a server with fresh security state on the system clock.
    pub fn new(config: GatewayConfig) -> Self {
        let state = Arc::new(SecurityState::new(&config, Arc::new(SystemClock)));
        Self::with_gateway(SecurityGateway::new(Arc::new(config), state))
    }

    /// Create a server around an already built gateway.
    pub fn with_gateway(gateway: SecurityGateway) -> Self {
        let request_secs = gateway.config().timeouts.request_secs;
        let state = AppState::new(gateway);
        let router = Self::build_router(request_secs, state.clone());
        Self { router, state }
    }

    /// Build the Axum router with all middleware layers.
    #[allow(deprecated)]
    fn build_router(request_secs: u64, state: AppState) -> Router {
        Router::new()
            .route("/webhooks", post(ingest))
            .route("/webhooks/{*topic}", post(ingest_topic))
            .with_state(state)
            .layer(
                ServiceBuilder::new()
                    .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                    .layer(TraceLayer::new_for_http())
                    .layer(PropagateRequestIdLayer::x_request_id())
                    .layer(TimeoutLayer::new(Duration::from_secs(request_secs))),
            )
    }

    /// Shared handle for the admin API and background tasks.
    pub fn state(&self) -> AppState {
        self.state.clone()
    }

    /// The ingestion router, for in-process use.
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Serve until `shutdown` fires. Configurations arriving on
    /// `config_updates` replace the gateway without dropping state.
    pub async fn run(
        self,
        listener: TcpListener,
        mut config_updates: mpsc::UnboundedReceiver<GatewayConfig>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        let reload_state = self.state.clone();
        let mut reload_shutdown = shutdown.resubscribe();
        let reloader = tokio::spawn(async move {
            loop {
                tokio::select! {
                    update = config_updates.recv() => match update {
                        Some(config) => {
                            reload_state.reload(config);
                        }
                        None => break,
                    },
                    _ = reload_shutdown.recv() => break,
                }
            }
        });

        let app = self.router.into_make_service_with_connect_info::<SocketAddr>();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
                tracing::info!("HTTP server received shutdown signal, draining");
            })
            .await?;

        reloader.abort();
        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

async fn ingest(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> Response {
    evaluate(state, peer, None, request).await
}

async fn ingest_topic(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Path(topic): Path<String>,
    request: Request<Body>,
) -> Response {
    evaluate(state, peer, Some(topic), request).await
}

async fn evaluate(state: AppState, peer: SocketAddr, topic: Option<String>, request: Request<Body>) -> Response {
    // One generation serves the whole request, even across a reload.
    let gateway = state.inner.load_full();
    let ctx = extract_context(&gateway, peer, topic, request).await;
    gateway.evaluate(&ctx).await.into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::clock::ManualClock;
    use crate::security::signature::sign;
    use axum::extract::connect_info::MockConnectInfo;
    use axum::http::StatusCode;
    use tower::ServiceExt;

    const START_MS: u64 = 1_700_000_000_000;

    fn server(config: GatewayConfig) -> HttpServer {
        let state = Arc::new(SecurityState::new(&config, Arc::new(ManualClock::new(START_MS))));
        HttpServer::with_gateway(SecurityGateway::new(Arc::new(config), state))
    }

    fn config() -> GatewayConfig {
        let mut config = GatewayConfig::default();
        config.security.webhook_secret = "s3cr3t".to_string();
        config
    }

    fn app(server: &HttpServer) -> Router {
        server
            .router()
            .layer(MockConnectInfo(SocketAddr::from(([203, 0, 113, 5], 50_000))))
    }

    fn signed_request(uri: &str, body: &'static str, id: &str) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .header("x-webhook-signature", sign(b"s3cr3t", body.as_bytes()))
            .header("x-webhook-timestamp", (START_MS / 1000).to_string())
            .header("x-webhook-id", id)
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn test_signed_delivery_accepted_with_request_id() {
        let server = server(config());
        let response = app(&server)
            .oneshot(signed_request("/webhooks/orders/create", r#"{"a":1}"#, "1"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-request-id"));
        assert!(response.headers().contains_key("x-ratelimit-remaining"));
    }

    #[tokio::test]
    async fn test_unknown_path_and_method() {
        let server = server(config());
        let response = app(&server)
            .oneshot(Request::get("/webhooks").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);

        let response = app(&server)
            .oneshot(Request::post("/other").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_reload_keeps_state_and_swaps_config() {
        let server = server(config());
        let state = server.state();
        let before = state.inner.load_full();
        before.reputation().record_failure("198.51.100.1".parse().unwrap());

        let mut updated = config();
        updated.security.max_failed_attempts = 9;
        assert!(state.reload(updated));

        let after = state.inner.load_full();
        assert_eq!(after.config().security.max_failed_attempts, 9);
        assert!(Arc::ptr_eq(before.state(), after.state()));
        assert_eq!(after.reputation().tracked_count(), 1);
    }

    #[tokio::test]
    async fn test_invalid_reload_is_ignored() {
        let server = server(config());
        let state = server.state();
        let mut broken = config();
        broken.security.max_payload_size = 0;
        assert!(!state.reload(broken));
        assert_ne!(state.inner.load().config().security.max_payload_size, 0);
    }
}
