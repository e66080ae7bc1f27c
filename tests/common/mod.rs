//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use webhook_gateway::admin::serve_admin;
use webhook_gateway::config::GatewayConfig;
use webhook_gateway::http::{AppState, HttpServer};
use webhook_gateway::lifecycle::Shutdown;
use webhook_gateway::security::clock::ManualClock;
use webhook_gateway::security::signature::sign;
use webhook_gateway::security::{SecurityGateway, SecurityState};
use webhook_gateway::store::{CounterStore, StoreError, WindowCount};

pub const SECRET: &str = "s3cr3t";
pub const ADMIN_KEY: &str = "integration-admin-key";
pub const START_MS: u64 = 1_700_000_000_000;

/// Baseline config: 5 requests per second, 3 strikes, 60s blocks.
pub fn test_config() -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.security.webhook_secret = SECRET.to_string();
    config.security.max_payload_size = 1024;
    config.security.max_failed_attempts = 3;
    config.security.block_duration = 60;
    config.rate_limit.window_ms = 1000;
    config.rate_limit.max_requests = 5;
    config.admin.enabled = true;
    config.admin.api_key = ADMIN_KEY.to_string();
    config
}

pub fn manual_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(START_MS))
}

pub fn build_gateway(config: GatewayConfig, clock: Arc<ManualClock>) -> SecurityGateway {
    let state = Arc::new(SecurityState::new(&config, clock));
    SecurityGateway::new(Arc::new(config), state)
}

/// A running gateway with its admin API.
pub struct TestGateway {
    pub addr: SocketAddr,
    pub admin_addr: SocketAddr,
    pub state: AppState,
    pub shutdown: Arc<Shutdown>,
    pub updates: mpsc::UnboundedSender<GatewayConfig>,
}

impl TestGateway {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn admin_url(&self, path: &str) -> String {
        format!("http://{}{}", self.admin_addr, path)
    }
}

impl Drop for TestGateway {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}

/// Bind both listeners up front so the first request never races startup.
pub async fn spawn_gateway(addr: SocketAddr, admin_addr: SocketAddr, gateway: SecurityGateway) -> TestGateway {
    let listener = TcpListener::bind(addr).await.unwrap();
    let admin_listener = TcpListener::bind(admin_addr).await.unwrap();

    let shutdown = Arc::new(Shutdown::new());
    let (updates, config_updates) = mpsc::unbounded_channel();
    let server = HttpServer::with_gateway(gateway);
    let state = server.state();

    let server_shutdown = shutdown.subscribe();
    tokio::spawn(async move {
        let _ = server.run(listener, config_updates, server_shutdown).await;
    });
    tokio::spawn(serve_admin(admin_listener, state.clone(), shutdown.subscribe()));

    TestGateway {
        addr,
        admin_addr,
        state,
        shutdown,
        updates,
    }
}

pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .no_proxy()
        .build()
        .unwrap()
}

/// One delivery as the commerce platform would send it.
pub struct Delivery<'a> {
    pub path: &'a str,
    pub body: String,
    pub signature: String,
    pub timestamp_secs: u64,
    pub id: String,
    pub source: Option<&'a str>,
}

impl<'a> Delivery<'a> {
    pub fn signed(body: impl Into<String>, id: impl ToString) -> Self {
        let body = body.into();
        Self {
            path: "/webhooks/orders/create",
            signature: sign(SECRET.as_bytes(), body.as_bytes()),
            body,
            timestamp_secs: START_MS / 1000,
            id: id.to_string(),
            source: None,
        }
    }

    pub fn from_source(mut self, ip: &'a str) -> Self {
        self.source = Some(ip);
        self
    }

    pub fn at(mut self, now_ms: u64) -> Self {
        self.timestamp_secs = now_ms / 1000;
        self
    }

    pub async fn send(self, client: &reqwest::Client, gateway: &TestGateway) -> reqwest::Response {
        // The test client connects from loopback, a trusted proxy by default.
        let mut request = client
            .post(gateway.url(self.path))
            .header("content-type", "application/json")
            .header("x-webhook-signature", self.signature)
            .header("x-webhook-timestamp", self.timestamp_secs.to_string())
            .header("x-webhook-id", self.id)
            .body(self.body);
        if let Some(ip) = self.source {
            request = request.header("x-forwarded-for", ip);
        }
        request.send().await.expect("gateway unreachable")
    }
}

pub async fn admin_get(client: &reqwest::Client, gateway: &TestGateway, path: &str) -> reqwest::Response {
    client
        .get(gateway.admin_url(path))
        .bearer_auth(ADMIN_KEY)
        .send()
        .await
        .expect("admin unreachable")
}

pub async fn admin_action(
    client: &reqwest::Client,
    gateway: &TestGateway,
    action: serde_json::Value,
) -> serde_json::Value {
    client
        .post(gateway.admin_url("/admin/security"))
        .bearer_auth(ADMIN_KEY)
        .json(&action)
        .send()
        .await
        .expect("admin unreachable")
        .json()
        .await
        .unwrap()
}

/// Counter store that is always down.
#[derive(Debug)]
pub struct DownStore;

#[async_trait]
impl CounterStore for DownStore {
    async fn acquire(&self, _key: &str, _max: u64, _ttl_ms: u64) -> Result<WindowCount, StoreError> {
        Err(StoreError::Connection("connection refused".to_string()))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Err(StoreError::Connection("connection refused".to_string()))
    }

    fn name(&self) -> &'static str {
        "down"
    }
}
