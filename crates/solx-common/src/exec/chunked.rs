use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use super::ExecError;
use crate::config::RunConfig;
use crate::db::StatementCache;
use crate::format::format_row;
use crate::pipeline::WorkItem;
use crate::report::{ChunkResult, ProcStatus, Reporter};
use crate::template::ColumnConfig;

/// One fetched row: the template's columns in order, each a nullable string.
pub type RecordRow = Vec<(String, Option<String>)>;

/// Result of one chunk-driver round: the materialized rows for this chunk
/// and whether the backend has more chunks to hand out.
pub struct ChunkBatch {
    pub rows: Vec<RecordRow>,
    pub has_more: bool,
}

/// Backend seam for chunked extraction: runs the chunk procedure and fetches
/// the balanced rows it materialized for `(sol_id, chunk_num)`.
#[async_trait]
pub trait ChunkDriver: Send + Sync {
    async fn run_chunk(
        &self,
        sol_id: &str,
        chunk_num: u32,
        chunk_size: u32,
    ) -> Result<ChunkBatch, ExecError>;
}

/// Production driver. The backend owns `<package>.<procedure>_extract`,
/// which pages debit rows plus their credit legs into
/// `<package>_chunk_results` and returns a has-more flag; the rows come back
/// ordered by `(record_type, record_id)` so each chunk is debit-credit
/// balanced.
pub struct PgChunkDriver<'a> {
    client: &'a deadpool_postgres::Client,
    cache: &'a StatementCache,
    package: &'a str,
    procedure: &'a str,
    columns: &'a [ColumnConfig],
}

impl<'a> PgChunkDriver<'a> {
    pub fn new(
        client: &'a deadpool_postgres::Client,
        cache: &'a StatementCache,
        package: &'a str,
        procedure: &'a str,
        columns: &'a [ColumnConfig],
    ) -> Self {
        Self {
            client,
            cache,
            package,
            procedure,
            columns,
        }
    }
}

#[async_trait]
impl ChunkDriver for PgChunkDriver<'_> {
    async fn run_chunk(
        &self,
        sol_id: &str,
        chunk_num: u32,
        chunk_size: u32,
    ) -> Result<ChunkBatch, ExecError> {
        let chunk_num_bind = chunk_num as i32;
        let chunk_size_bind = chunk_size as i32;

        let call = format!("SELECT {}.{}_extract($1, $2, $3)", self.package, self.procedure);
        let stmt = self
            .cache
            .get_or_prepare(self.client, &call)
            .await
            .map_err(ExecError::Prepare)?;
        let flag_row = self
            .client
            .query_one(&stmt, &[&sol_id, &chunk_num_bind, &chunk_size_bind])
            .await
            .map_err(ExecError::Call)?;
        let has_more: i32 = flag_row.try_get(0).map_err(ExecError::Call)?;

        let list = self
            .columns
            .iter()
            .map(|c| format!("{}::text", c.name))
            .collect::<Vec<_>>()
            .join(", ");
        let fetch = format!(
            "SELECT {list} FROM {}_chunk_results \
             WHERE sol_id = $1 AND chunk_num = $2 \
             ORDER BY record_type, record_id",
            self.package
        );
        let stmt = self
            .cache
            .get_or_prepare(self.client, &fetch)
            .await
            .map_err(ExecError::Prepare)?;
        let rows = self
            .client
            .query(&stmt, &[&sol_id, &chunk_num_bind])
            .await
            .map_err(ExecError::Query)?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let mut record: RecordRow = Vec::with_capacity(self.columns.len());
            for (idx, column) in self.columns.iter().enumerate() {
                let value: Option<String> = row.try_get(idx).map_err(ExecError::Query)?;
                record.push((column.name.clone(), value));
            }
            records.push(record);
        }
        Ok(ChunkBatch {
            rows: records,
            has_more: has_more == 1,
        })
    }
}

/// Output file for one chunk. A run that ends at the first chunk (or finds
/// no rows at all) writes the unsuffixed name.
pub fn chunk_file_path(
    dir: &Path,
    sol_id: &str,
    procedure: &str,
    chunk: Option<u32>,
) -> PathBuf {
    match chunk {
        Some(n) => dir.join(format!("{sol_id}_{procedure}_{n}.txt")),
        None => dir.join(format!("{sol_id}_{procedure}.txt")),
    }
}

/// Drives chunked extraction for one `(SOL, procedure)` tuple.
///
/// Emits one ChunkResult per written chunk through the reporter. A chunk
/// failure stops the loop for this tuple and leaves earlier chunk files on
/// disk; an empty chunk after the first writes no file and emits nothing.
/// Returns whether every chunk succeeded.
pub async fn run_chunked(
    driver: &dyn ChunkDriver,
    cfg: &RunConfig,
    columns: &[ColumnConfig],
    item: &WorkItem,
    reporter: &Reporter,
) -> bool {
    let mut chunk_num: u32 = 1;
    let mut total_records: u64 = 0;

    loop {
        let start_time = Utc::now();
        let batch = match driver
            .run_chunk(&item.sol_id, chunk_num, cfg.chunk_size)
            .await
        {
            Ok(batch) => batch,
            Err(source) => {
                let err = ExecError::Chunk {
                    chunk: chunk_num,
                    source: Box::new(source),
                };
                reporter
                    .record_chunk(&failed(item, chunk_num, start_time, err.to_string()))
                    .await;
                return false;
            }
        };
        let end_time = Utc::now();

        if batch.rows.is_empty() && chunk_num == 1 {
            // No data for this tuple at all: leave an empty file so the
            // downstream consumers see every tuple accounted for.
            let path = chunk_file_path(&cfg.spool_output_path, &item.sol_id, &item.procedure, None);
            if let Err(source) = File::create(&path) {
                let err = ExecError::Chunk {
                    chunk: chunk_num,
                    source: Box::new(ExecError::Write {
                        path: path.clone(),
                        source,
                    }),
                };
                reporter
                    .record_chunk(&failed(item, chunk_num, start_time, err.to_string()))
                    .await;
                return false;
            }
            reporter
                .record_chunk(&ChunkResult {
                    sol_id: item.sol_id.clone(),
                    procedure: item.procedure.clone(),
                    chunk_num: 1,
                    records: 0,
                    start_time,
                    end_time,
                    status: ProcStatus::Success,
                    error: None,
                })
                .await;
            return true;
        }

        if !batch.rows.is_empty() {
            let single = chunk_num == 1 && !batch.has_more;
            let path = chunk_file_path(
                &cfg.spool_output_path,
                &item.sol_id,
                &item.procedure,
                if single { None } else { Some(chunk_num) },
            );
            if let Err(source) = write_chunk(&path, &batch.rows, columns, cfg) {
                let err = ExecError::Chunk {
                    chunk: chunk_num,
                    source: Box::new(source),
                };
                reporter
                    .record_chunk(&failed(item, chunk_num, start_time, err.to_string()))
                    .await;
                return false;
            }
            total_records += batch.rows.len() as u64;
            reporter
                .record_chunk(&ChunkResult {
                    sol_id: item.sol_id.clone(),
                    procedure: item.procedure.clone(),
                    chunk_num,
                    records: batch.rows.len() as u64,
                    start_time,
                    end_time,
                    status: ProcStatus::Success,
                    error: None,
                })
                .await;
        }

        if !batch.has_more {
            break;
        }
        chunk_num += 1;
    }

    debug!(
        procedure = %item.procedure,
        sol_id = %item.sol_id,
        chunks = chunk_num,
        total_records,
        "chunked extraction complete"
    );
    true
}

fn failed(
    item: &WorkItem,
    chunk_num: u32,
    start_time: chrono::DateTime<Utc>,
    error: String,
) -> ChunkResult {
    ChunkResult {
        sol_id: item.sol_id.clone(),
        procedure: item.procedure.clone(),
        chunk_num,
        records: 0,
        start_time,
        end_time: Utc::now(),
        status: ProcStatus::Fail,
        error: Some(error),
    }
}

fn write_chunk(
    path: &Path,
    rows: &[RecordRow],
    columns: &[ColumnConfig],
    cfg: &RunConfig,
) -> Result<(), ExecError> {
    let file = File::create(path).map_err(|source| ExecError::Write {
        path: path.to_path_buf(),
        source,
    })?;
    let mut out = BufWriter::new(file);
    for row in rows {
        let values: Vec<String> = row
            .iter()
            .map(|(_, value)| value.clone().unwrap_or_default())
            .collect();
        let line = format_row(cfg.format, &cfg.delimiter, columns, &values);
        out.write_all(line.as_bytes())
            .and_then(|_| out.write_all(b"\n"))
            .map_err(|source| ExecError::Write {
                path: path.to_path_buf(),
                source,
            })?;
    }
    out.flush().map_err(|source| ExecError::Write {
        path: path.to_path_buf(),
        source,
    })
}
