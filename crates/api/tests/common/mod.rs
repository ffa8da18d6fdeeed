#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Method, Request, Response};
use axum::Router;
use http_body_util::BodyExt;
use kvdesk_api::config::ServerConfig;
use kvdesk_api::router::build_app_router;
use kvdesk_api::state::AppState;
use kvdesk_api::ws::WsManager;
use kvdesk_bulk::{BulkActionRegistry, BulkConfig, RetryPolicy};
use kvdesk_events::EventBus;
use kvdesk_store::{MemoryStore, StaticClientProvider};
use serde_json::Value;
use tower::ServiceExt;

pub const DB: &str = "db";

/// Server config with the dev CORS origin and a 30-second timeout.
pub fn test_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        cors_origins: vec!["http://localhost:5173".to_string()],
        request_timeout_secs: 30,
        shutdown_timeout_secs: 5,
        databases: format!("{DB}=memory://2"),
    }
}

/// Small batches and near-instant retries.
pub fn bulk_config() -> BulkConfig {
    BulkConfig {
        scan_count: 50,
        scan_retry: RetryPolicy {
            max_retries: 1,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            multiplier: 2.0,
        },
        upload_batch_size: 25,
        report_channel_capacity: 4,
        ..BulkConfig::default()
    }
}

pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    pub store: Arc<MemoryStore>,
    pub events: Arc<EventBus>,
}

impl TestApp {
    pub async fn send(&self, request: Request<Body>) -> Response<Body> {
        self.router.clone().oneshot(request).await.unwrap()
    }

    pub async fn get(&self, uri: &str) -> Response<Body> {
        self.send(request(Method::GET, uri, None)).await
    }

    pub async fn post_json(&self, uri: &str, body: &Value) -> Response<Body> {
        self.send(request(Method::POST, uri, Some(body))).await
    }

    pub async fn delete(&self, uri: &str) -> Response<Body> {
        self.send(request(Method::DELETE, uri, None)).await
    }
}

/// Full application over an in-memory two-shard database named [`DB`],
/// with the same middleware stack as production.
pub fn build_test_app() -> TestApp {
    let config = test_config();
    let store = Arc::new(MemoryStore::new(2));
    let events = Arc::new(EventBus::default());
    let provider = StaticClientProvider::new().with_client(DB, store.clone());

    let state = AppState {
        config: Arc::new(config.clone()),
        ws_manager: Arc::new(WsManager::new()),
        bulk_actions: Arc::new(BulkActionRegistry::new(
            Arc::new(provider),
            Arc::clone(&events),
            Arc::new(bulk_config()),
        )),
    };

    TestApp {
        router: build_app_router(state.clone(), &config),
        state,
        store,
        events,
    }
}

pub fn request(method: Method, uri: &str, body: Option<&Value>) -> Request<Body> {
    let builder = Request::builder().method(method).uri(uri);
    match body {
        Some(json) => builder
            .header("content-type", "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

pub fn seed(store: &MemoryStore, prefix: &str, count: usize) {
    for i in 0..count {
        store.set_string(&format!("{prefix}{i}"), "v");
    }
}

pub async fn body_bytes(response: Response<Body>) -> Vec<u8> {
    response.into_body().collect().await.unwrap().to_bytes().to_vec()
}

pub async fn body_json(response: Response<Body>) -> Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

pub async fn body_text(response: Response<Body>) -> String {
    String::from_utf8(body_bytes(response).await).unwrap()
}
