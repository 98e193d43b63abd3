use std::collections::HashSet;
use std::sync::RwLock;

use deadpool_postgres::Client;
use metrics::counter;
use tokio_postgres::Statement;

use crate::pipeline::Lane;

/// Per-pool prepared-statement cache.
///
/// Statement handles are bound to the connection that prepared them, so the
/// actual handles live in the pool's per-connection caches
/// (`prepare_cached`). This wrapper tracks the distinct query texts a pool
/// has prepared; a handle can never be used against another pool because
/// it never leaves this pool's connections.
pub struct StatementCache {
    lane: Lane,
    seen: RwLock<HashSet<String>>,
}

impl StatementCache {
    pub fn new(lane: Lane) -> Self {
        Self {
            lane,
            seen: RwLock::new(HashSet::new()),
        }
    }

    pub fn lane(&self) -> Lane {
        self.lane
    }

    pub async fn get_or_prepare(
        &self,
        client: &Client,
        query: &str,
    ) -> Result<Statement, tokio_postgres::Error> {
        if self.note(query) {
            counter!("solx_statement_cache_misses_total", "lane" => self.lane.as_str())
                .increment(1);
        } else {
            counter!("solx_statement_cache_hits_total", "lane" => self.lane.as_str())
                .increment(1);
        }
        client.prepare_cached(query).await
    }

    /// Records a query text, returning true the first time it is seen.
    /// Double-checked so the common hit path only takes the read lock.
    fn note(&self, query: &str) -> bool {
        if self
            .seen
            .read()
            .expect("statement cache lock poisoned")
            .contains(query)
        {
            return false;
        }
        self.seen
            .write()
            .expect("statement cache lock poisoned")
            .insert(query.to_string())
    }

    /// Number of distinct query texts prepared through this cache.
    pub fn tracked(&self) -> usize {
        self.seen
            .read()
            .expect("statement cache lock poisoned")
            .len()
    }
}
