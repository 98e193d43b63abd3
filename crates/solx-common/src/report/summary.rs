use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use thiserror::Error;

use super::{format_seconds, ProcLog, ProcStatus, TIME_FORMAT};

#[derive(Debug, Error)]
pub enum SummaryError {
    #[error("failed to write summary {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode summary {}: {source}", .path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
}

/// Aggregated window for one procedure: earliest start, latest end, and a
/// status where FAIL is terminal.
#[derive(Debug, Clone)]
pub struct ProcSummary {
    pub procedure: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub status: ProcStatus,
}

/// Per-run summary map. Contention is immaterial next to database latency,
/// so a single mutex guards the whole map.
pub struct RunSummary {
    inner: Mutex<HashMap<String, ProcSummary>>,
}

impl Default for RunSummary {
    fn default() -> Self {
        Self::new()
    }
}

impl RunSummary {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub fn apply(&self, log: &ProcLog) {
        let mut map = self.inner.lock().expect("summary lock poisoned");
        match map.get_mut(&log.procedure) {
            Some(entry) => {
                if log.start_time < entry.start_time {
                    entry.start_time = log.start_time;
                }
                if log.end_time > entry.end_time {
                    entry.end_time = log.end_time;
                }
                if log.status == ProcStatus::Fail {
                    entry.status = ProcStatus::Fail;
                }
            }
            None => {
                map.insert(
                    log.procedure.clone(),
                    ProcSummary {
                        procedure: log.procedure.clone(),
                        start_time: log.start_time,
                        end_time: log.end_time,
                        status: log.status,
                    },
                );
            }
        }
    }

    /// Snapshot sorted by procedure name, the order the CSV is written in.
    pub fn snapshot(&self) -> Vec<ProcSummary> {
        let map = self.inner.lock().expect("summary lock poisoned");
        let mut rows: Vec<ProcSummary> = map.values().cloned().collect();
        rows.sort_by(|a, b| a.procedure.cmp(&b.procedure));
        rows
    }

    pub fn write_csv(&self, path: &Path) -> Result<(), SummaryError> {
        let mut writer = csv::Writer::from_path(path).map_err(|source| SummaryError::Csv {
            path: path.to_path_buf(),
            source,
        })?;
        writer
            .write_record([
                "PROCEDURE",
                "EARLIEST_START_TIME",
                "LATEST_END_TIME",
                "EXECUTION_SECONDS",
                "STATUS",
            ])
            .map_err(|source| SummaryError::Csv {
                path: path.to_path_buf(),
                source,
            })?;

        for row in self.snapshot() {
            let window = row.end_time.signed_duration_since(row.start_time);
            let start = row.start_time.format(TIME_FORMAT).to_string();
            let end = row.end_time.format(TIME_FORMAT).to_string();
            let seconds = format_seconds(window);
            writer
                .write_record([
                    row.procedure.as_str(),
                    start.as_str(),
                    end.as_str(),
                    seconds.as_str(),
                    row.status.as_str(),
                ])
                .map_err(|source| SummaryError::Csv {
                    path: path.to_path_buf(),
                    source,
                })?;
        }
        writer.flush().map_err(|source| SummaryError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(())
    }
}
