pub mod batch_logger;
pub mod summary;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::warn;

pub use batch_logger::{BatchLogger, BATCH_SIZE, FLUSH_INTERVAL, LOG_CHANNEL_CAPACITY};
pub use summary::{ProcSummary, RunSummary};

/// Timestamp layout shared by the execution log and the summary.
pub const TIME_FORMAT: &str = "%d-%m-%Y %H:%M:%S";

/// Renders a duration as seconds with millisecond precision, the way both
/// CSV outputs expect it.
pub fn format_seconds(duration: chrono::Duration) -> String {
    format!("{:.3}", duration.num_milliseconds() as f64 / 1000.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcStatus {
    Success,
    Fail,
}

impl ProcStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcStatus::Success => "SUCCESS",
            ProcStatus::Fail => "FAIL",
        }
    }
}

/// One completion record: a whole work item, or a single chunk of a chunked
/// extraction.
#[derive(Debug, Clone)]
pub struct ProcLog {
    pub sol_id: String,
    pub procedure: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub status: ProcStatus,
    pub error_details: String,
}

impl ProcLog {
    pub fn execution_time(&self) -> chrono::Duration {
        self.end_time.signed_duration_since(self.start_time)
    }
}

/// Outcome of a single chunk produced by the chunked extractor.
#[derive(Debug, Clone)]
pub struct ChunkResult {
    pub sol_id: String,
    pub procedure: String,
    pub chunk_num: u32,
    pub records: u64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub status: ProcStatus,
    pub error: Option<String>,
}

impl ChunkResult {
    fn to_log(&self) -> ProcLog {
        ProcLog {
            sol_id: self.sol_id.clone(),
            procedure: self.procedure.clone(),
            start_time: self.start_time,
            end_time: self.end_time,
            status: self.status,
            error_details: self.error.clone().unwrap_or_default(),
        }
    }
}

/// Fan-in for completion records. Every record goes through here exactly
/// once: into the batch logger's channel and into the run summary, which is
/// what keeps the summary consistent with the written log.
#[derive(Clone)]
pub struct Reporter {
    log_tx: mpsc::Sender<ProcLog>,
    summary: Arc<RunSummary>,
}

impl Reporter {
    pub fn new(log_tx: mpsc::Sender<ProcLog>, summary: Arc<RunSummary>) -> Self {
        Self { log_tx, summary }
    }

    pub async fn record(&self, log: ProcLog) {
        self.summary.apply(&log);
        if self.log_tx.send(log).await.is_err() {
            warn!("log sink closed before run completion; dropping record");
        }
    }

    pub async fn record_chunk(&self, chunk: &ChunkResult) {
        self.record(chunk.to_log()).await;
    }
}
