pub mod call;
pub mod chunked;
pub mod extract;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::{Mode, RunConfig};
use crate::db::{LanePools, StatementCache};
use crate::pipeline::worker::HandlerError;
use crate::pipeline::{Handled, ItemHandler, Lane, WorkItem};
use crate::report::Reporter;
use crate::template::TemplateMap;

pub use chunked::{ChunkBatch, ChunkDriver, PgChunkDriver, RecordRow};

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("missing template for procedure {0}")]
    MissingTemplate(String),
    #[error("failed to acquire {lane} connection: {source}")]
    Acquire {
        lane: &'static str,
        #[source]
        source: deadpool_postgres::PoolError,
    },
    #[error("statement preparation failed: {0}")]
    Prepare(#[source] tokio_postgres::Error),
    #[error("query failed: {0}")]
    Query(#[source] tokio_postgres::Error),
    #[error("procedure call failed: {0}")]
    Call(#[source] tokio_postgres::Error),
    #[error("failed to write {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("chunk {chunk} failed: {source}")]
    Chunk {
        chunk: u32,
        #[source]
        source: Box<ExecError>,
    },
}

/// Production work handler: dispatches each item to the extraction,
/// chunked-extraction or procedure-call path, always through the lane's own
/// pool and statement cache.
pub struct ProcExecutor {
    mode: Mode,
    run_cfg: Arc<RunConfig>,
    templates: Arc<TemplateMap>,
    pools: Arc<LanePools>,
    caches: [StatementCache; 4],
}

impl ProcExecutor {
    pub fn new(
        mode: Mode,
        run_cfg: Arc<RunConfig>,
        templates: Arc<TemplateMap>,
        pools: Arc<LanePools>,
    ) -> Self {
        Self {
            mode,
            run_cfg,
            templates,
            pools,
            caches: [
                StatementCache::new(Lane::Fast),
                StatementCache::new(Lane::Medium),
                StatementCache::new(Lane::Slow),
                StatementCache::new(Lane::Error),
            ],
        }
    }

    fn cache(&self, lane: Lane) -> &StatementCache {
        &self.caches[lane.index()]
    }

    async fn client(&self, lane: Lane) -> Result<deadpool_postgres::Client, ExecError> {
        self.pools
            .pool(lane)
            .get()
            .await
            .map_err(|source| ExecError::Acquire {
                lane: lane.as_str(),
                source,
            })
    }

    fn columns(&self, procedure: &str) -> Result<&[crate::template::ColumnConfig], ExecError> {
        self.templates
            .get(procedure)
            .map(Vec::as_slice)
            .ok_or_else(|| ExecError::MissingTemplate(procedure.to_string()))
    }
}

#[async_trait]
impl ItemHandler for ProcExecutor {
    async fn run(
        &self,
        lane: Lane,
        item: &WorkItem,
        reporter: &Reporter,
    ) -> Result<Handled, HandlerError> {
        match self.mode {
            Mode::Insert => {
                let client = self.client(lane).await?;
                call::invoke(
                    &client,
                    self.cache(lane),
                    &self.run_cfg.package_name,
                    item,
                )
                .await?;
                Ok(Handled::Done)
            }
            Mode::Extract if self.run_cfg.is_chunked(&item.procedure) => {
                let columns = self.columns(&item.procedure)?;
                let client = self.client(lane).await?;
                let driver = PgChunkDriver::new(
                    &client,
                    self.cache(lane),
                    &self.run_cfg.package_name,
                    &item.procedure,
                    columns,
                );
                let success =
                    chunked::run_chunked(&driver, &self.run_cfg, columns, item, reporter).await;
                Ok(Handled::Reported { success })
            }
            Mode::Extract => {
                let columns = self.columns(&item.procedure)?;
                let client = self.client(lane).await?;
                extract::extract_one(&client, self.cache(lane), &self.run_cfg, columns, item)
                    .await?;
                Ok(Handled::Done)
            }
        }
    }
}
