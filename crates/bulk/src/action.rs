//! One bulk action run.
//!
//! A [`BulkAction`] is the read side of a run: it hands out overview
//! snapshots, exposes abort and the optional report. The write side is a
//! spawned task that exclusively owns the `watch::Sender` of the overview,
//! so all progress and summary updates are serialized through it and
//! readers only ever see whole snapshots.
//!
//! Cancellation is observed once per loop iteration, before the next batch
//! is fetched. A batch that has started executing is always applied in full.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use kvdesk_core::bulk_action::{
    BulkActionFilter, BulkActionOverview, BulkActionStatus, BulkActionType, CreateBulkAction,
};
use kvdesk_core::report::result_line;
use kvdesk_core::types::{ActionId, ChannelId};
use kvdesk_events::{BulkActionEvent, EventBus};
use kvdesk_store::{ClientProvider, KeyValueClient};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::BulkConfig;
use crate::error::RunError;
use crate::executor::{self, Batch, ItemOutcome};
use crate::report::ReportStreamer;
use crate::scan::{estimate_total, ScanCursorIterator};

/// Shared collaborators every run needs.
#[derive(Clone)]
pub struct RunContext {
    pub provider: Arc<dyn ClientProvider>,
    pub events: Arc<EventBus>,
    pub config: Arc<BulkConfig>,
}

#[derive(Debug, Clone)]
struct Snapshot {
    overview: BulkActionOverview,
    finished_at: Option<Instant>,
}

pub struct BulkAction {
    id: ActionId,
    channel_id: ChannelId,
    started: Instant,
    state: watch::Receiver<Snapshot>,
    cancel: CancellationToken,
    report: Option<Arc<ReportStreamer>>,
}

impl BulkAction {
    /// Create the action and spawn its run task. The action is `running`
    /// from the moment this returns.
    pub fn start(
        id: ActionId,
        channel_id: ChannelId,
        params: CreateBulkAction,
        ctx: RunContext,
    ) -> Arc<Self> {
        let overview = BulkActionOverview::new(
            id.clone(),
            params.database_id.clone(),
            params.action_type,
            params.filter.clone(),
        );
        let (tx, rx) = watch::channel(Snapshot {
            overview,
            finished_at: None,
        });

        let cancel = CancellationToken::new();
        let report = params.report_enabled.then(|| {
            Arc::new(
                ReportStreamer::new(id.clone(), ctx.config.report_channel_capacity)
                    .with_abort(cancel.clone())
                    .with_stall_timeout(ctx.config.report_stall_timeout),
            )
        });
        let started = Instant::now();

        let records = params
            .upload
            .map(|u| {
                u.commands
                    .into_iter()
                    .filter(|line| !line.trim().is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let runner = Runner {
            id: id.clone(),
            channel_id: channel_id.clone(),
            database_id: params.database_id,
            action_type: params.action_type,
            filter: params.filter,
            records,
            state: tx,
            cancel: cancel.clone(),
            report: report.clone(),
            started,
            ctx,
        };

        tracing::info!(
            action_id = %id,
            channel_id = %channel_id,
            database_id = %runner.database_id,
            action_type = runner.action_type.as_str(),
            "Bulk action started",
        );
        tokio::spawn(runner.run());

        Arc::new(Self {
            id,
            channel_id,
            started,
            state: rx,
            cancel,
            report,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    /// Copy of the current state. `duration` is live while running.
    pub fn overview(&self) -> BulkActionOverview {
        let mut overview = self.state.borrow().overview.clone();
        if overview.status == BulkActionStatus::Running {
            overview.duration = elapsed_ms(self.started);
        }
        overview
    }

    pub fn status(&self) -> BulkActionStatus {
        self.state.borrow().overview.status
    }

    pub fn is_running(&self) -> bool {
        self.status() == BulkActionStatus::Running
    }

    /// When the action reached its terminal state, if it has.
    pub fn finished_at(&self) -> Option<Instant> {
        self.state.borrow().finished_at
    }

    /// Request cooperative cancellation. Idempotent; the status turns
    /// `aborted` at the next batch boundary.
    pub fn abort(&self) -> BulkActionOverview {
        if !self.cancel.is_cancelled() && self.is_running() {
            tracing::info!(action_id = %self.id, "Bulk action abort requested");
        }
        self.cancel.cancel();
        self.overview()
    }

    pub fn report(&self) -> Option<&Arc<ReportStreamer>> {
        self.report.as_ref()
    }

    /// Wait until the action is terminal and return its final overview.
    pub async fn wait(&self) -> BulkActionOverview {
        let mut rx = self.state.clone();
        // An error means the run task is gone, which only happens after
        // the final state was published.
        let _ = rx
            .wait_for(|s| s.overview.status.is_terminal())
            .await;
        self.overview()
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

// ---------------------------------------------------------------------------
// Run task
// ---------------------------------------------------------------------------

enum Source {
    Scan(ScanCursorIterator),
    Records {
        lines: VecDeque<String>,
        batch_size: usize,
    },
}

impl Source {
    async fn next_batch(&mut self) -> Result<Option<Batch>, RunError> {
        match self {
            Source::Scan(iter) => Ok(iter.next_batch().await?.map(Batch::Keys)),
            Source::Records { lines, batch_size } => {
                if lines.is_empty() {
                    return Ok(None);
                }
                let take = (*batch_size).min(lines.len());
                Ok(Some(Batch::Records(lines.drain(..take).collect())))
            }
        }
    }
}

struct Runner {
    id: ActionId,
    channel_id: ChannelId,
    database_id: String,
    action_type: BulkActionType,
    filter: BulkActionFilter,
    records: Vec<String>,
    state: watch::Sender<Snapshot>,
    cancel: CancellationToken,
    report: Option<Arc<ReportStreamer>>,
    started: Instant,
    ctx: RunContext,
}

impl Runner {
    async fn run(mut self) {
        let (status, error) = match self.execute().await {
            Ok(status) => (status, None),
            Err(e) => {
                tracing::error!(action_id = %self.id, error = %e, "Bulk action failed");
                (BulkActionStatus::Failed, Some(e.to_string()))
            }
        };

        let duration = elapsed_ms(self.started);
        self.state.send_modify(|s| {
            s.overview.status = status;
            s.overview.error = error;
            s.overview.duration = duration;
            s.finished_at = Some(Instant::now());
        });
        let overview = self.snapshot();

        if let Some(report) = &self.report {
            report.finish(&overview).await;
        }

        tracing::info!(
            action_id = %self.id,
            status = status.as_str(),
            processed = overview.summary.processed,
            failed = overview.summary.failed,
            duration_ms = duration,
            "Bulk action finished",
        );
        self.ctx
            .events
            .publish(BulkActionEvent::finished(self.channel_id.clone(), overview));
    }

    async fn execute(&mut self) -> Result<BulkActionStatus, RunError> {
        let client = self
            .ctx
            .provider
            .client(&self.database_id)
            .await
            .map_err(|source| RunError::Client {
                database_id: self.database_id.clone(),
                source,
            })?;

        let mut source = self.open_source(&client).await;
        self.publish_progress();

        loop {
            if self.cancel.is_cancelled() {
                return Ok(BulkActionStatus::Aborted);
            }
            let Some(batch) = source.next_batch().await? else {
                return Ok(BulkActionStatus::Completed);
            };
            match executor::execute(client.as_ref(), &batch).await {
                Ok(outcomes) => self.apply(batch.len(), &outcomes).await,
                Err(failure) => {
                    // Work that reached the server before the failure still counts.
                    if !failure.completed.is_empty() {
                        self.apply(failure.completed.len(), &failure.completed).await;
                    }
                    return Err(failure.error);
                }
            }
        }
    }

    async fn open_source(&mut self, client: &Arc<dyn KeyValueClient>) -> Source {
        let config = &self.ctx.config;
        let (source, total) = match self.action_type {
            BulkActionType::Delete => {
                let total = estimate_total(client.as_ref()).await;
                let iter = ScanCursorIterator::new(
                    Arc::clone(client),
                    &self.filter,
                    config.scan_count,
                    config.scan_retry.clone(),
                );
                (Source::Scan(iter), total)
            }
            BulkActionType::Upload => {
                let lines: VecDeque<String> = std::mem::take(&mut self.records).into();
                let total = lines.len() as u64;
                let source = Source::Records {
                    lines,
                    batch_size: config.upload_batch_size,
                };
                (source, total)
            }
        };

        self.state.send_modify(|s| s.overview.progress.total = total);
        source
    }

    /// Fold one executed batch into the overview, then report and notify.
    async fn apply(&mut self, batch_len: usize, outcomes: &[ItemOutcome]) {
        let limits = self.ctx.config.summary_limits;
        let duration = elapsed_ms(self.started);

        self.state.send_modify(|s| {
            let overview = &mut s.overview;
            overview.progress.scanned += batch_len as u64;
            for outcome in outcomes {
                match &outcome.error {
                    None => overview.summary.record_success(&outcome.key, limits),
                    Some(message) => overview.summary.record_failure(&outcome.key, message, limits),
                }
            }
            overview.duration = duration;
        });

        if let Some(report) = &self.report {
            let mut chunk = String::new();
            for outcome in outcomes {
                chunk.push_str(&result_line(&outcome.key, outcome.error.as_deref()));
            }
            report.append(chunk).await;
        }

        self.publish_progress();
    }

    fn snapshot(&self) -> BulkActionOverview {
        self.state.borrow().overview.clone()
    }

    fn publish_progress(&self) {
        self.ctx
            .events
            .publish(BulkActionEvent::overview(self.channel_id.clone(), self.snapshot()));
    }
}
