mod common;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use assert_matches::assert_matches;
use common::*;
use kvdesk_bulk::BulkAction;
use kvdesk_core::bulk_action::{BulkActionStatus, SummaryLimits};
use kvdesk_core::error::CoreError;
use kvdesk_store::{KeyValueClient, MemoryStore};

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn delete_by_pattern_completes() {
    let engine = engine(3);
    seed(&engine.store, "user:", 400);
    seed(&engine.store, "session:", 100);

    let created = engine
        .registry
        .create("chan", delete_request("user:*", false))
        .await
        .unwrap();
    assert_eq!(created.status, BulkActionStatus::Running);
    assert_eq!(created.summary.processed, 0);

    let done = engine.registry.wait(&created.id).await.unwrap();
    assert_eq!(done.status, BulkActionStatus::Completed);
    assert_eq!(done.summary.processed, 400);
    assert_eq!(done.summary.succeed, 400);
    assert_eq!(done.summary.failed, 0);
    assert_eq!(done.progress.total, 500);
    assert!(done.progress.scanned >= 400);
    assert!(done.error.is_none());
    assert_eq!(engine.store.len(), 100);

    let again = engine.registry.get(&created.id).await.unwrap();
    assert_eq!(again, done);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn every_observed_overview_is_consistent() {
    let engine = engine(3);
    seed(&engine.store, "k", 2_000);
    let mut rx = engine.events.subscribe();

    let created = engine
        .registry
        .create("chan", delete_request("*", false))
        .await
        .unwrap();

    let mut last_scanned = 0;
    loop {
        let overview = engine.registry.get(&created.id).await.unwrap();
        let s = &overview.summary;
        assert_eq!(s.processed, s.succeed + s.failed);
        assert!(overview.progress.scanned >= last_scanned);
        last_scanned = overview.progress.scanned;
        if overview.status.is_terminal() {
            break;
        }
        tokio::task::yield_now().await;
    }

    let mut last_scanned = 0;
    while let Ok(event) = rx.try_recv() {
        let s = &event.overview.summary;
        assert_eq!(s.processed, s.succeed + s.failed);
        assert!(event.overview.progress.scanned >= last_scanned);
        last_scanned = event.overview.progress.scanned;
    }
}

#[tokio::test]
async fn empty_keyspace_completes_with_nothing_processed() {
    let engine = engine(2);
    let created = engine
        .registry
        .create("chan", delete_request("*", false))
        .await
        .unwrap();
    let done = engine.registry.wait(&created.id).await.unwrap();
    assert_eq!(done.status, BulkActionStatus::Completed);
    assert_eq!(done.summary.processed, 0);
    assert_eq!(done.progress.total, 0);
}

// ---------------------------------------------------------------------------
// Abort
// ---------------------------------------------------------------------------

#[tokio::test]
async fn immediate_abort_processes_nothing() {
    let engine = engine(1);
    seed(&engine.store, "user:", 100);

    let created = engine
        .registry
        .create("chan", delete_request("user:*", false))
        .await
        .unwrap();
    let first = engine.registry.abort(&created.id).await.unwrap();
    let second = engine.registry.abort(&created.id).await.unwrap();
    assert_eq!(first.id, created.id);
    assert_eq!(second.id, created.id);

    let done = engine.registry.wait(&created.id).await.unwrap();
    assert_eq!(done.status, BulkActionStatus::Aborted);
    assert_eq!(done.summary.processed, 0);
    assert_eq!(engine.store.len(), 100);

    let after = engine.registry.abort(&created.id).await.unwrap();
    assert_eq!(after.status, BulkActionStatus::Aborted);
}

#[tokio::test]
async fn abort_mid_run_applies_only_whole_batches() {
    let mut config = test_config();
    config.scan_count = 10;
    let engine = engine_with(1, config);
    seed(&engine.store, "k", 100);

    let slot: Arc<Mutex<Option<Arc<BulkAction>>>> = Arc::new(Mutex::new(None));
    let calls = Arc::new(AtomicU32::new(0));
    {
        let slot = slot.clone();
        let calls = calls.clone();
        engine.store.set_scan_hook(Arc::new(move |_: &MemoryStore, _: &str, _: u64| {
            // Abort while the third page is being fetched.
            if calls.fetch_add(1, Ordering::SeqCst) == 2 {
                if let Some(action) = slot.lock().unwrap().as_ref() {
                    action.abort();
                }
            }
        }));
    }

    let created = engine
        .registry
        .create("chan", delete_request("*", false))
        .await
        .unwrap();
    *slot.lock().unwrap() = Some(engine.registry.action(&created.id).await.unwrap());

    let done = engine.registry.wait(&created.id).await.unwrap();
    assert_eq!(done.status, BulkActionStatus::Aborted);
    assert_eq!(done.summary.processed, 30);
    assert_eq!(done.progress.scanned, 30);
    assert_eq!(engine.store.len(), 70);
}

#[tokio::test]
async fn terminal_state_is_absorbing() {
    let engine = engine(1);
    seed(&engine.store, "k", 10);
    let created = engine
        .registry
        .create("chan", delete_request("*", false))
        .await
        .unwrap();
    let done = engine.registry.wait(&created.id).await.unwrap();
    assert_eq!(done.status, BulkActionStatus::Completed);

    let aborted = engine.registry.abort(&created.id).await.unwrap();
    assert_eq!(aborted.status, BulkActionStatus::Completed);
    assert_eq!(aborted.duration, done.duration);
}

#[tokio::test]
async fn abort_all_stops_running_actions() {
    let engine = engine(1);
    seed(&engine.store, "k", 10);
    let a = engine.registry.create("a", delete_request("*", false)).await.unwrap();
    let b = engine.registry.create("b", delete_request("*", false)).await.unwrap();

    assert_eq!(engine.registry.abort_all().await, 2);
    for id in [&a.id, &b.id] {
        let done = engine.registry.wait(id).await.unwrap();
        assert_eq!(done.status, BulkActionStatus::Aborted);
    }
}

// ---------------------------------------------------------------------------
// Concurrent modification
// ---------------------------------------------------------------------------

#[tokio::test]
async fn concurrent_deletes_during_scan() {
    let mut config = test_config();
    config.scan_count = 500;
    let engine = engine_with(1, config);
    seed(&engine.store, "user:", 10_000);

    let fired = Arc::new(AtomicBool::new(false));
    {
        let fired = fired.clone();
        engine.store.set_scan_hook(Arc::new(move |store: &MemoryStore, _: &str, cursor: u64| {
            if cursor > 0 && !fired.swap(true, Ordering::SeqCst) {
                for i in [3, 4_000, 5_000, 9_998, 9_999] {
                    store.remove(&format!("user:{i}"));
                }
            }
        }));
    }

    let created = engine
        .registry
        .create("chan", delete_request("user:*", false))
        .await
        .unwrap();
    let done = engine.registry.wait(&created.id).await.unwrap();

    assert!(fired.load(Ordering::SeqCst));
    assert_eq!(done.status, BulkActionStatus::Completed);
    assert!(done.summary.failed <= 5);
    assert!(done.summary.succeed >= 9_995);
    assert_eq!(done.summary.processed, done.summary.succeed + done.summary.failed);
    assert!(engine.store.is_empty());
}

// ---------------------------------------------------------------------------
// Failures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn per_key_failures_are_counted_and_capped() {
    let mut config = test_config();
    config.summary_limits = SummaryLimits {
        max_errors: 2,
        max_keys: 3,
    };
    let engine = engine_with(1, config);
    seed(&engine.store, "k", 20);
    for i in 0..5 {
        engine
            .store
            .inject_command_error(&format!("k{i}"), "NOPERM no permissions");
    }

    let created = engine
        .registry
        .create("chan", delete_request("*", false))
        .await
        .unwrap();
    let done = engine.registry.wait(&created.id).await.unwrap();

    assert_eq!(done.status, BulkActionStatus::Completed);
    assert_eq!(done.summary.processed, 20);
    assert_eq!(done.summary.failed, 5);
    assert_eq!(done.summary.succeed, 15);
    assert_eq!(done.summary.errors.len(), 2);
    assert_eq!(done.summary.errors[0].key, "k0");
    assert_eq!(done.summary.errors[0].message, "NOPERM no permissions");
    assert_eq!(done.summary.keys.len(), 3);
    assert_eq!(engine.store.len(), 5);
}

#[tokio::test]
async fn exhausted_scan_retries_fail_the_action() {
    let engine = engine(1);
    seed(&engine.store, "k", 10);
    let shard = kvdesk_store::KeyValueClient::shards(engine.store.as_ref())[0].clone();
    engine.store.inject_scan_failures(&shard, 10);

    let created = engine
        .registry
        .create("chan", delete_request("*", false))
        .await
        .unwrap();
    assert_eq!(created.status, BulkActionStatus::Running);

    let done = engine.registry.wait(&created.id).await.unwrap();
    assert_eq!(done.status, BulkActionStatus::Failed);
    assert!(done.error.as_deref().unwrap_or_default().contains("after 3 attempts"));
    assert_eq!(done.summary.processed, 0);
}

#[tokio::test]
async fn transient_scan_failures_are_tolerated() {
    let engine = engine(1);
    seed(&engine.store, "k", 10);
    let shard = kvdesk_store::KeyValueClient::shards(engine.store.as_ref())[0].clone();
    engine.store.inject_scan_failures(&shard, 2);

    let created = engine
        .registry
        .create("chan", delete_request("*", false))
        .await
        .unwrap();
    let done = engine.registry.wait(&created.id).await.unwrap();
    assert_eq!(done.status, BulkActionStatus::Completed);
    assert_eq!(done.summary.succeed, 10);
}

#[tokio::test]
async fn outage_mid_run_fails_and_keeps_applied_batches() {
    let mut config = test_config();
    config.scan_count = 10;
    let engine = engine_with(1, config);
    seed(&engine.store, "k", 50);

    engine.store.set_scan_hook(Arc::new(|store: &MemoryStore, _: &str, cursor: u64| {
        if cursor > 0 {
            store.set_unreachable(true);
        }
    }));

    let created = engine
        .registry
        .create("chan", delete_request("*", false))
        .await
        .unwrap();
    let done = engine.registry.wait(&created.id).await.unwrap();

    assert_eq!(done.status, BulkActionStatus::Failed);
    assert!(done.error.is_some());
    assert_eq!(done.summary.processed, 10);
    assert!(done.summary.errors.is_empty());
}

// ---------------------------------------------------------------------------
// Registry rules
// ---------------------------------------------------------------------------

#[tokio::test]
async fn get_unknown_id_is_not_found() {
    let engine = engine(1);
    assert_matches!(
        engine.registry.get("1234").await,
        Err(CoreError::NotFound { .. })
    );
    assert_matches!(
        engine.registry.abort("1234").await,
        Err(CoreError::NotFound { .. })
    );
    assert_matches!(
        engine.registry.stream_report("1234").await,
        Err(CoreError::NotFound { .. })
    );
}

#[tokio::test]
async fn second_running_action_on_channel_conflicts() {
    let engine = engine(1);
    seed(&engine.store, "k", 10);

    let first = engine
        .registry
        .create("chan", delete_request("*", false))
        .await
        .unwrap();
    assert_matches!(
        engine.registry.create("chan", delete_request("*", false)).await,
        Err(CoreError::Conflict(_))
    );

    // Other channels are independent.
    engine
        .registry
        .create("other", delete_request("nothing:*", false))
        .await
        .unwrap();

    engine.registry.wait(&first.id).await.unwrap();
    let next = engine
        .registry
        .create("chan", delete_request("*", false))
        .await
        .unwrap();
    assert_ne!(next.id, first.id);
}

#[tokio::test]
async fn ids_are_unique() {
    let engine = engine(1);
    let mut ids = HashSet::new();
    for i in 0..20 {
        let created = engine
            .registry
            .create(&format!("c{i}"), delete_request("*", false))
            .await
            .unwrap();
        assert!(ids.insert(created.id));
    }
}

#[tokio::test]
async fn invalid_requests_are_rejected() {
    let engine = engine(1);

    let mut missing_db = delete_request("*", false);
    missing_db.database_id = "nope".into();
    assert_matches!(
        engine.registry.create("chan", missing_db).await,
        Err(CoreError::NotFound { entity: "Database", .. })
    );

    let mut upload_without_payload = upload_request(vec!["SET a 1".into()], false);
    upload_without_payload.upload = None;
    assert_matches!(
        engine.registry.create("chan", upload_without_payload).await,
        Err(CoreError::Validation(_))
    );

    assert_matches!(
        engine.registry.create("chan", delete_request("", false)).await,
        Err(CoreError::Validation(_))
    );
    assert!(engine.registry.is_empty().await);
}

#[tokio::test]
async fn channel_disconnect_aborts_its_action() {
    let engine = engine(1);
    seed(&engine.store, "k", 10);

    let created = engine
        .registry
        .create("chan", delete_request("*", false))
        .await
        .unwrap();
    let overview = engine.registry.on_channel_disconnect("chan").await.unwrap();
    assert_eq!(overview.id, created.id);

    let done = engine.registry.wait(&created.id).await.unwrap();
    assert_eq!(done.status, BulkActionStatus::Aborted);
    assert_eq!(done.summary.processed, 0);

    assert!(engine.registry.on_channel_disconnect("chan").await.is_none());
    assert!(engine.registry.on_channel_disconnect("never").await.is_none());

    // The channel is free again and the old action is still readable.
    engine
        .registry
        .create("chan", delete_request("*", false))
        .await
        .unwrap();
    assert!(engine.registry.get(&created.id).await.is_ok());
}

#[tokio::test]
async fn remove_evicts_immediately() {
    let engine = engine(1);
    seed(&engine.store, "k", 10);
    let created = engine
        .registry
        .create("chan", delete_request("*", false))
        .await
        .unwrap();

    engine.registry.remove(&created.id).await.unwrap();
    assert_matches!(
        engine.registry.get(&created.id).await,
        Err(CoreError::NotFound { .. })
    );
    assert_matches!(
        engine.registry.remove(&created.id).await,
        Err(CoreError::NotFound { .. })
    );
    engine
        .registry
        .create("chan", delete_request("*", false))
        .await
        .unwrap();
}

#[tokio::test]
async fn reaper_evicts_only_expired_terminal_actions() {
    let engine = engine(1);
    seed(&engine.store, "k", 10);

    let done = engine
        .registry
        .create("a", delete_request("*", false))
        .await
        .unwrap();
    engine.registry.wait(&done.id).await.unwrap();
    let running = engine
        .registry
        .create("b", delete_request("*", false))
        .await
        .unwrap();

    assert_eq!(engine.registry.evict_expired(Duration::from_secs(3600)).await, 0);
    assert_eq!(engine.registry.evict_expired(Duration::ZERO).await, 1);
    assert_matches!(
        engine.registry.get(&done.id).await,
        Err(CoreError::NotFound { .. })
    );
    assert!(engine.registry.get(&running.id).await.is_ok());
}

// ---------------------------------------------------------------------------
// Upload
// ---------------------------------------------------------------------------

#[tokio::test]
async fn upload_writes_across_shards_in_batches() {
    let engine = engine(3);
    let mut commands: Vec<String> = (0..60).map(|i| format!("SET key:{i} v{i}")).collect();
    commands.push("HSET profile name \"Ada Lovelace\"".into());
    commands.push("SET unterminated \"quote".into());

    let created = engine
        .registry
        .create("chan", upload_request(commands, false))
        .await
        .unwrap();
    let done = engine.registry.wait(&created.id).await.unwrap();

    assert_eq!(done.status, BulkActionStatus::Completed);
    assert_eq!(done.progress.total, 62);
    assert_eq!(done.progress.scanned, 62);
    assert_eq!(done.summary.succeed, 61);
    assert_eq!(done.summary.failed, 1);
    assert_eq!(engine.store.len(), 61);
}

#[tokio::test]
async fn upload_shard_outage_counts_writes_that_landed() {
    let engine = engine(2);
    let first_shard = engine.store.route("key:0");
    let down = engine
        .store
        .shards()
        .into_iter()
        .find(|s| *s != first_shard)
        .unwrap();
    engine.store.set_shard_unreachable(&down, true);

    let commands: Vec<String> = (0..20).map(|i| format!("SET key:{i} v{i}")).collect();
    let created = engine
        .registry
        .create("chan", upload_request(commands, true))
        .await
        .unwrap();
    let done = engine.registry.wait(&created.id).await.unwrap();

    assert_eq!(done.status, BulkActionStatus::Failed);
    assert!(done.error.as_deref().unwrap_or_default().contains(&down));
    let written = engine.store.len() as u64;
    assert!(written > 0 && written < 20);
    assert_eq!(done.summary.succeed, written);
    assert_eq!(done.summary.processed, written);
    assert_eq!(done.progress.scanned, written);

    let download = engine.registry.stream_report(&created.id).await.unwrap();
    let text = read_report(download.chunks).await;
    assert_eq!(text.lines().filter(|l| l.ends_with("\tOK\t")).count() as u64, written);
    assert!(text.contains("#summary\tstatus=failed"));
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

fn assert_complete_report(text: &str, expected_keys: usize) {
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), expected_keys + 1, "result lines plus summary");

    let keys: HashSet<&str> = lines[..expected_keys]
        .iter()
        .map(|l| l.split('\t').next().unwrap_or_default())
        .collect();
    assert_eq!(keys.len(), expected_keys, "no duplicates");
    assert!(lines[..expected_keys].iter().all(|l| l.ends_with("\tOK\t")));
    assert!(lines[expected_keys].starts_with("#summary\tstatus=completed"));
    assert!(lines[expected_keys].contains(&format!("processed={expected_keys}")));
}

#[tokio::test]
async fn report_disabled_is_bad_request() {
    let engine = engine(1);
    let created = engine
        .registry
        .create("chan", delete_request("*", false))
        .await
        .unwrap();
    assert_matches!(
        engine.registry.stream_report(&created.id).await,
        Err(CoreError::BadRequest(_))
    );
}

#[tokio::test]
async fn report_attached_before_start_is_complete() {
    let engine = engine(2);
    seed(&engine.store, "user:", 300);

    let created = engine
        .registry
        .create("chan", delete_request("user:*", true))
        .await
        .unwrap();
    let download = engine.registry.stream_report(&created.id).await.unwrap();
    assert!(download.filename.starts_with("bulk-delete-report-"));
    assert!(download.filename.ends_with(".txt"));

    let text = read_report(download.chunks).await;
    assert_complete_report(&text, 300);
}

#[tokio::test]
async fn report_attached_after_completion_is_complete() {
    let engine = engine(2);
    seed(&engine.store, "user:", 300);

    let created = engine
        .registry
        .create("chan", delete_request("user:*", true))
        .await
        .unwrap();
    engine.registry.wait(&created.id).await.unwrap();

    let download = engine.registry.stream_report(&created.id).await.unwrap();
    assert_complete_report(&read_report(download.chunks).await, 300);

    assert_matches!(
        engine.registry.stream_report(&created.id).await,
        Err(CoreError::Conflict(_))
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn report_attached_mid_run_is_complete() {
    let mut config = test_config();
    config.scan_count = 20;
    let engine = engine_with(1, config);
    seed(&engine.store, "user:", 400);
    engine.store.set_scan_hook(Arc::new(|_: &MemoryStore, _: &str, _: u64| {
        std::thread::sleep(Duration::from_millis(1));
    }));
    let mut rx = engine.events.subscribe();

    let created = engine
        .registry
        .create("chan", delete_request("user:*", true))
        .await
        .unwrap();

    while let Ok(event) = rx.recv().await {
        if event.overview.progress.scanned > 0 {
            break;
        }
    }
    let download = engine.registry.stream_report(&created.id).await.unwrap();
    assert_complete_report(&read_report(download.chunks).await, 400);
}

#[tokio::test]
async fn dropped_report_reader_does_not_affect_the_run() {
    let engine = engine(1);
    seed(&engine.store, "k", 200);

    let created = engine
        .registry
        .create("chan", delete_request("*", true))
        .await
        .unwrap();
    let download = engine.registry.stream_report(&created.id).await.unwrap();
    drop(download);

    let done = engine.registry.wait(&created.id).await.unwrap();
    assert_eq!(done.status, BulkActionStatus::Completed);
    assert_eq!(done.summary.succeed, 200);
}

fn stalling_report_config(stall_timeout: Duration) -> kvdesk_bulk::BulkConfig {
    let mut config = test_config();
    config.scan_count = 10;
    config.report_channel_capacity = 1;
    config.report_stall_timeout = stall_timeout;
    config
}

#[tokio::test]
async fn abort_is_honoured_while_report_reader_stalls() {
    let engine = engine_with(1, stalling_report_config(Duration::from_secs(3600)));
    seed(&engine.store, "user:", 1000);
    let mut rx = engine.events.subscribe();

    let created = engine
        .registry
        .create("chan", delete_request("user:*", true))
        .await
        .unwrap();
    // Attached and never read.
    let download = engine.registry.stream_report(&created.id).await.unwrap();

    while let Ok(event) = rx.recv().await {
        if event.overview.progress.scanned > 0 {
            break;
        }
    }
    engine.registry.abort(&created.id).await.unwrap();

    let done = tokio::time::timeout(Duration::from_secs(3), engine.registry.wait(&created.id))
        .await
        .expect("run stays stuck on the stalled reader")
        .unwrap();
    assert_eq!(done.status, BulkActionStatus::Aborted);
    assert!(done.summary.processed < 1000);
    assert!(!engine.store.is_empty());

    let text = read_report(download.chunks).await;
    assert!(!text.contains("#summary"));
}

#[tokio::test]
async fn stalled_report_reader_is_detached_and_run_completes() {
    let engine = engine_with(1, stalling_report_config(Duration::from_millis(50)));
    seed(&engine.store, "user:", 1000);

    let created = engine
        .registry
        .create("chan", delete_request("user:*", true))
        .await
        .unwrap();
    let download = engine.registry.stream_report(&created.id).await.unwrap();

    let done = tokio::time::timeout(Duration::from_secs(10), engine.registry.wait(&created.id))
        .await
        .expect("run stays stuck on the stalled reader")
        .unwrap();
    assert_eq!(done.status, BulkActionStatus::Completed);
    assert_eq!(done.summary.succeed, 1000);
    assert!(engine.store.is_empty());

    let text = read_report(download.chunks).await;
    assert!(text.lines().count() < 1000);
    assert!(!text.contains("#summary"));
}

#[tokio::test]
async fn failed_run_report_carries_error() {
    let engine = engine(1);
    engine.store.set_unreachable(true);

    let created = engine
        .registry
        .create("chan", delete_request("*", true))
        .await
        .unwrap();
    engine.registry.wait(&created.id).await.unwrap();

    let download = engine.registry.stream_report(&created.id).await.unwrap();
    let text = read_report(download.chunks).await;
    assert!(text.starts_with("#summary\tstatus=failed"));
    assert!(text.contains("\terror="));
}
