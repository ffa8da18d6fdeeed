//! Execution report of one bulk action.
//!
//! Lines are buffered in memory until a reader attaches. Attaching hands
//! the reader everything produced so far as a single chunk, after which
//! each appended chunk is sent as soon as it is produced. Sending awaits
//! channel capacity, so a slow reader slows the run down rather than
//! growing memory. A reader that goes away is detached and the run goes on.
//! So is a reader that stops reading: a send that does not complete within
//! the stall timeout, or that is still pending when the run is aborted,
//! detaches the reader and discards the rest of the report.
//!
//! The report ends with the summary line written by [`ReportStreamer::finish`];
//! the reader observes end-of-stream right after it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use kvdesk_core::bulk_action::BulkActionOverview;
use kvdesk_core::error::CoreError;
use kvdesk_core::report::summary_line;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Default)]
struct ReportState {
    /// Output produced while no reader is attached.
    buffer: Vec<u8>,
    sink: Option<mpsc::Sender<Bytes>>,
    /// The reader went away; further output is discarded.
    detached: bool,
    finished: bool,
}

pub struct ReportStreamer {
    action_id: String,
    capacity: usize,
    stall_timeout: Duration,
    abort: CancellationToken,
    attached: AtomicBool,
    state: Mutex<ReportState>,
}

impl ReportStreamer {
    pub fn new(action_id: impl Into<String>, capacity: usize) -> Self {
        Self {
            action_id: action_id.into(),
            capacity: capacity.max(1),
            stall_timeout: DEFAULT_STALL_TIMEOUT,
            abort: CancellationToken::new(),
            attached: AtomicBool::new(false),
            state: Mutex::new(ReportState::default()),
        }
    }

    /// Stop waiting on a stalled reader once `abort` is cancelled.
    pub fn with_abort(mut self, abort: CancellationToken) -> Self {
        self.abort = abort;
        self
    }

    pub fn with_stall_timeout(mut self, stall_timeout: Duration) -> Self {
        self.stall_timeout = stall_timeout;
        self
    }

    /// Attach the (only) reader.
    ///
    /// The returned receiver yields every line of the report exactly once,
    /// no matter when it is attached, and closes after the summary line.
    pub async fn attach(&self) -> Result<mpsc::Receiver<Bytes>, CoreError> {
        if self.attached.swap(true, Ordering::SeqCst) {
            return Err(CoreError::Conflict(format!(
                "Report of bulk action {} is already being streamed",
                self.action_id
            )));
        }

        let (tx, rx) = mpsc::channel(self.capacity);
        let mut state = self.state.lock().await;

        let pending = std::mem::take(&mut state.buffer);
        if !pending.is_empty() {
            // Fresh channel with capacity >= 1: cannot be full.
            let _ = tx.try_send(Bytes::from(pending));
        }
        if !state.finished {
            state.sink = Some(tx);
        }

        tracing::debug!(action_id = %self.action_id, finished = state.finished, "Report reader attached");
        Ok(rx)
    }

    /// Append one chunk of report lines.
    pub async fn append(&self, chunk: String) {
        if chunk.is_empty() {
            return;
        }
        let mut state = self.state.lock().await;
        if state.finished {
            return;
        }
        self.write(&mut state, chunk).await;
    }

    /// Write the summary line and close the report.
    pub async fn finish(&self, overview: &BulkActionOverview) {
        let mut state = self.state.lock().await;
        if state.finished {
            return;
        }
        self.write(&mut state, summary_line(overview)).await;
        state.finished = true;
        state.sink = None;
    }

    async fn write(&self, state: &mut ReportState, chunk: String) {
        if let Some(sink) = &state.sink {
            let delivered = tokio::select! {
                biased;
                sent = sink.send(Bytes::from(chunk)) => sent.map_err(|_| "reader went away"),
                () = self.abort.cancelled() => Err("run aborted while the reader is stalled"),
                () = tokio::time::sleep(self.stall_timeout) => Err("reader stalled"),
            };
            if let Err(reason) = delivered {
                tracing::warn!(action_id = %self.action_id, reason, "Detaching report reader");
                state.sink = None;
                state.detached = true;
            }
        } else if !state.detached {
            state.buffer.extend_from_slice(chunk.as_bytes());
        }
    }
}
