use std::fs::File;
use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use super::{format_seconds, ProcLog, TIME_FORMAT};

pub const BATCH_SIZE: usize = 100;
pub const FLUSH_INTERVAL: Duration = Duration::from_secs(5);
pub const LOG_CHANNEL_CAPACITY: usize = 1000;

const HEADER: [&str; 7] = [
    "SOL_ID",
    "PROCEDURE",
    "START_TIME",
    "END_TIME",
    "EXECUTION_SECONDS",
    "STATUS",
    "ERROR_DETAILS",
];

/// Buffered CSV sink for execution logs.
///
/// Records arrive through a bounded channel and are written by a dedicated
/// task, in batches of [`BATCH_SIZE`] or every [`FLUSH_INTERVAL`], whichever
/// comes first. The file is created lazily on the first flush. Shutdown is a
/// deterministic drain: once every sender is dropped the task flushes the
/// remainder and exits, and [`BatchLogger::close`] waits for that.
pub struct BatchLogger {
    handle: JoinHandle<()>,
}

impl BatchLogger {
    pub fn spawn(path: PathBuf) -> (Self, mpsc::Sender<ProcLog>) {
        let (tx, rx) = mpsc::channel(LOG_CHANNEL_CAPACITY);
        let handle = tokio::spawn(write_loop(path, rx));
        (Self { handle }, tx)
    }

    /// Waits until every buffered record has hit the file. All senders must
    /// be dropped first or this never returns.
    pub async fn close(self) {
        if let Err(err) = self.handle.await {
            error!(error = %err, "log writer task failed");
        }
    }
}

async fn write_loop(path: PathBuf, mut rx: mpsc::Receiver<ProcLog>) {
    let mut interval = tokio::time::interval(FLUSH_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let mut sink: Option<csv::Writer<File>> = None;
    let mut buffer: Vec<ProcLog> = Vec::with_capacity(BATCH_SIZE);

    loop {
        tokio::select! {
            next = rx.recv() => match next {
                Some(log) => {
                    buffer.push(log);
                    if buffer.len() >= BATCH_SIZE {
                        flush(&path, &mut sink, &mut buffer);
                    }
                }
                None => {
                    flush(&path, &mut sink, &mut buffer);
                    break;
                }
            },
            _ = interval.tick() => {
                if !buffer.is_empty() {
                    flush(&path, &mut sink, &mut buffer);
                }
            }
        }
    }

    if let Some(mut writer) = sink {
        if let Err(err) = writer.flush() {
            error!(path = %path.display(), error = %err, "failed to flush execution log");
        }
    }
    debug!(path = %path.display(), "execution log closed");
}

fn flush(path: &PathBuf, sink: &mut Option<csv::Writer<File>>, buffer: &mut Vec<ProcLog>) {
    if buffer.is_empty() {
        return;
    }

    if sink.is_none() {
        match csv::Writer::from_path(path) {
            Ok(mut writer) => {
                if let Err(err) = writer.write_record(HEADER) {
                    error!(path = %path.display(), error = %err, "failed to write log header");
                    return;
                }
                *sink = Some(writer);
            }
            Err(err) => {
                error!(path = %path.display(), error = %err, "failed to create execution log");
                return;
            }
        }
    }

    let writer = sink.as_mut().expect("sink initialized above");
    for log in buffer.drain(..) {
        let start = log.start_time.format(TIME_FORMAT).to_string();
        let end = log.end_time.format(TIME_FORMAT).to_string();
        let seconds = format_seconds(log.execution_time());
        let error_details = if log.error_details.is_empty() {
            "-"
        } else {
            log.error_details.as_str()
        };
        let record = [
            log.sol_id.as_str(),
            log.procedure.as_str(),
            start.as_str(),
            end.as_str(),
            seconds.as_str(),
            log.status.as_str(),
            error_details,
        ];
        if let Err(err) = writer.write_record(record) {
            error!(path = %path.display(), error = %err, "failed to append log record");
        }
    }
    if let Err(err) = writer.flush() {
        error!(path = %path.display(), error = %err, "failed to flush execution log");
    }
}
