#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use kvdesk_bulk::{BulkActionRegistry, BulkConfig, RetryPolicy};
use kvdesk_core::bulk_action::{
    BulkActionFilter, BulkActionType, CreateBulkAction, SummaryLimits, UploadPayload,
};
use kvdesk_events::EventBus;
use kvdesk_store::{MemoryStore, StaticClientProvider};
use tokio::sync::mpsc;

pub const DB: &str = "db";

/// Small batches and near-instant retries so tests exercise many batch
/// boundaries quickly.
pub fn test_config() -> BulkConfig {
    BulkConfig {
        scan_count: 50,
        scan_retry: RetryPolicy {
            max_retries: 2,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            multiplier: 2.0,
        },
        upload_batch_size: 25,
        summary_limits: SummaryLimits::default(),
        terminal_ttl: Duration::from_secs(3600),
        reaper_interval: Duration::from_secs(60),
        report_channel_capacity: 4,
        report_stall_timeout: Duration::from_secs(5),
    }
}

pub struct TestEngine {
    pub store: Arc<MemoryStore>,
    pub events: Arc<EventBus>,
    pub registry: Arc<BulkActionRegistry>,
}

pub fn engine(shards: usize) -> TestEngine {
    engine_with(shards, test_config())
}

pub fn engine_with(shards: usize, config: BulkConfig) -> TestEngine {
    let store = Arc::new(MemoryStore::new(shards));
    let provider = StaticClientProvider::new().with_client(DB, store.clone());
    let events = Arc::new(EventBus::default());
    let registry = Arc::new(BulkActionRegistry::new(
        Arc::new(provider),
        events.clone(),
        Arc::new(config),
    ));
    TestEngine {
        store,
        events,
        registry,
    }
}

pub fn seed(store: &MemoryStore, prefix: &str, count: usize) {
    for i in 0..count {
        store.set_string(&format!("{prefix}{i}"), "value");
    }
}

pub fn delete_request(pattern: &str, report_enabled: bool) -> CreateBulkAction {
    CreateBulkAction {
        database_id: DB.to_string(),
        action_type: BulkActionType::Delete,
        filter: BulkActionFilter {
            pattern: pattern.to_string(),
            key_type: None,
        },
        report_enabled,
        upload: None,
    }
}

pub fn upload_request(commands: Vec<String>, report_enabled: bool) -> CreateBulkAction {
    CreateBulkAction {
        database_id: DB.to_string(),
        action_type: BulkActionType::Upload,
        filter: BulkActionFilter::default(),
        report_enabled,
        upload: Some(UploadPayload { commands }),
    }
}

/// Read a report stream to EOF.
pub async fn read_report(mut chunks: mpsc::Receiver<Bytes>) -> String {
    let mut out = Vec::new();
    while let Some(chunk) = chunks.recv().await {
        out.extend_from_slice(&chunk);
    }
    String::from_utf8(out).expect("report is utf-8")
}
