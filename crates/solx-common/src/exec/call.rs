use std::time::{Duration, Instant};

use tracing::warn;

use super::ExecError;
use crate::db::StatementCache;
use crate::pipeline::WorkItem;

const SLOW_CALL: Duration = Duration::from_secs(5);

pub fn build_call(package: &str, procedure: &str) -> String {
    format!("CALL {package}.{procedure}($1)")
}

/// Invokes one insert procedure with the SOL ID as its single bind.
/// Duration is measured end-to-end around the driver call.
pub async fn invoke(
    client: &deadpool_postgres::Client,
    cache: &StatementCache,
    package: &str,
    item: &WorkItem,
) -> Result<(), ExecError> {
    let query = build_call(package, &item.procedure);
    let stmt = cache
        .get_or_prepare(client, &query)
        .await
        .map_err(ExecError::Prepare)?;

    let started = Instant::now();
    client
        .execute(&stmt, &[&item.sol_id])
        .await
        .map_err(ExecError::Call)?;

    let took = started.elapsed();
    if took > SLOW_CALL {
        warn!(
            package,
            procedure = %item.procedure,
            sol_id = %item.sol_id,
            secs = took.as_secs_f64(),
            "slow procedure call"
        );
    }
    Ok(())
}
