use std::fs::File;
use std::io::{BufWriter, Write};

use futures_util::{pin_mut, TryStreamExt};
use metrics::{counter, histogram};
use tokio_postgres::types::ToSql;
use tracing::debug;

use super::ExecError;
use crate::config::RunConfig;
use crate::db::StatementCache;
use crate::format::format_row;
use crate::pipeline::WorkItem;
use crate::spool::spool_path;
use crate::template::ColumnConfig;

const SPOOL_BUFFER: usize = 128 * 1024;

/// The template's columns are read back as text so every value arrives as a
/// nullable string regardless of its declared type.
pub fn build_select(procedure: &str, columns: &[ColumnConfig]) -> String {
    let list = columns
        .iter()
        .map(|c| format!("{}::text", c.name))
        .collect::<Vec<_>>()
        .join(", ");
    format!("SELECT {list} FROM {procedure} WHERE sol_id = $1")
}

/// Streams one procedure's rows for one SOL into its spool file. A query
/// with zero rows still leaves an (empty) spool behind so the merge phase
/// sees every tuple.
pub async fn extract_one(
    client: &deadpool_postgres::Client,
    cache: &StatementCache,
    cfg: &RunConfig,
    columns: &[ColumnConfig],
    item: &WorkItem,
) -> Result<u64, ExecError> {
    let query = build_select(&item.procedure, columns);
    let stmt = cache
        .get_or_prepare(client, &query)
        .await
        .map_err(ExecError::Prepare)?;

    let params: [&(dyn ToSql + Sync); 1] = [&item.sol_id];
    let rows = client
        .query_raw(&stmt, params)
        .await
        .map_err(ExecError::Query)?;
    pin_mut!(rows);

    let path = spool_path(&cfg.spool_output_path, &item.procedure, &item.sol_id);
    let file = File::create(&path).map_err(|source| ExecError::Write {
        path: path.clone(),
        source,
    })?;
    let mut out = BufWriter::with_capacity(SPOOL_BUFFER, file);

    let mut row_count = 0u64;
    let mut byte_count = 0u64;
    let mut values: Vec<String> = Vec::with_capacity(columns.len());
    while let Some(row) = rows.try_next().await.map_err(ExecError::Query)? {
        values.clear();
        for idx in 0..columns.len() {
            let value: Option<String> = row.try_get(idx).map_err(ExecError::Query)?;
            values.push(value.unwrap_or_default());
        }
        let line = format_row(cfg.format, &cfg.delimiter, columns, &values);
        out.write_all(line.as_bytes())
            .and_then(|_| out.write_all(b"\n"))
            .map_err(|source| ExecError::Write {
                path: path.clone(),
                source,
            })?;
        row_count += 1;
        byte_count += line.len() as u64 + 1;
    }
    out.flush().map_err(|source| ExecError::Write {
        path: path.clone(),
        source,
    })?;

    histogram!("solx_extract_rows").record(row_count as f64);
    counter!("solx_extract_bytes_total").increment(byte_count);
    debug!(
        procedure = %item.procedure,
        sol_id = %item.sol_id,
        rows = row_count,
        "spool written"
    );
    Ok(row_count)
}
