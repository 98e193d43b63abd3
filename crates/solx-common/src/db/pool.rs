use std::env;
use std::time::Duration;

use deadpool::managed::{Hook, HookError, Metrics};
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod, Runtime};
use thiserror::Error;
use tokio_postgres::NoTls;
use tracing::{debug, info};

use crate::config::AppConfig;
use crate::pipeline::{Lane, LaneAllocation};

const WARMUP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum PoolSetupError {
    #[error("failed to build {lane} pool: {source}")]
    Build {
        lane: &'static str,
        #[source]
        source: deadpool::managed::BuildError,
    },
    #[error("failed to acquire {lane} connection during warmup: {source}")]
    Acquire {
        lane: &'static str,
        #[source]
        source: deadpool_postgres::PoolError,
    },
    #[error("warmup query failed on {lane} pool: {source}")]
    Warmup {
        lane: &'static str,
        #[source]
        source: tokio_postgres::Error,
    },
    #[error("pool warmup timed out after {0:?}")]
    WarmupTimeout(Duration),
}

/// Sizing and recycling policy for one lane's pool.
///
/// The fast lane turns connections over quickly and recycles them young;
/// the slow lane holds long queries and must not churn lifetimes; the small
/// error pool throttles retries so a poison procedure cannot exhaust the
/// backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LanePoolSettings {
    pub max_size: usize,
    pub max_lifetime: Duration,
    pub idle_timeout: Duration,
}

impl LanePoolSettings {
    pub fn for_lane(lane: Lane, allocation: LaneAllocation) -> Self {
        match lane {
            Lane::Fast => Self {
                max_size: allocation.fast,
                max_lifetime: Duration::from_secs(5 * 60),
                idle_timeout: Duration::from_secs(60),
            },
            Lane::Medium => Self {
                max_size: allocation.medium,
                max_lifetime: Duration::from_secs(15 * 60),
                idle_timeout: Duration::from_secs(5 * 60),
            },
            Lane::Slow => Self {
                max_size: allocation.slow,
                max_lifetime: Duration::from_secs(30 * 60),
                idle_timeout: Duration::from_secs(15 * 60),
            },
            Lane::Error => Self {
                max_size: allocation.error,
                max_lifetime: Duration::from_secs(10 * 60),
                idle_timeout: Duration::from_secs(2 * 60),
            },
        }
    }
}

struct PoolTimeouts {
    wait: Duration,
    create: Duration,
}

impl PoolTimeouts {
    fn from_env() -> Self {
        Self {
            wait: Duration::from_secs(env_secs("SOLX_DB_TIMEOUT_WAIT_SECS", 5)),
            create: Duration::from_secs(env_secs("SOLX_DB_TIMEOUT_CREATE_SECS", 5)),
        }
    }
}

fn env_secs(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}

fn pg_config(app: &AppConfig) -> tokio_postgres::Config {
    let mut cfg = tokio_postgres::Config::new();
    cfg.host(&app.db_host);
    cfg.port(app.db_port);
    cfg.user(&app.db_user);
    cfg.password(&app.db_password);
    cfg.dbname(&app.db_sid);
    cfg.application_name("solx-batch");
    cfg
}

fn build_pool(
    pg: tokio_postgres::Config,
    settings: LanePoolSettings,
    timeouts: &PoolTimeouts,
) -> Result<Pool, deadpool::managed::BuildError> {
    let manager = Manager::from_config(
        pg,
        NoTls,
        ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        },
    );
    let max_lifetime = settings.max_lifetime;
    let idle_timeout = settings.idle_timeout;
    Pool::builder(manager)
        .max_size(settings.max_size)
        .runtime(Runtime::Tokio1)
        .wait_timeout(Some(timeouts.wait))
        .create_timeout(Some(timeouts.create))
        // deadpool has no built-in connection lifetime, so expiry happens on
        // recycle: anything past the lane's lifetime or idle window is
        // discarded instead of handed back out.
        .pre_recycle(Hook::sync_fn(move |_client, metrics: &Metrics| {
            if metrics.age() > max_lifetime {
                return Err(HookError::message("exceeded lane lifetime"));
            }
            if metrics.last_used() > idle_timeout {
                return Err(HookError::message("idle past lane timeout"));
            }
            Ok(())
        }))
        .build()
}

/// Four independent pools against the same database, one per lane, each
/// sized and recycled for its latency class.
pub struct LanePools {
    pools: [Pool; 4],
}

impl LanePools {
    /// Builds all four pools. No connection is opened here; `warmup`
    /// performs the first round-trips.
    pub fn connect(app: &AppConfig, allocation: LaneAllocation) -> Result<Self, PoolSetupError> {
        let timeouts = PoolTimeouts::from_env();
        let pg = pg_config(app);

        let mut pools = Vec::with_capacity(Lane::ALL.len());
        for lane in Lane::ALL {
            let settings = LanePoolSettings::for_lane(lane, allocation);
            let pool = build_pool(pg.clone(), settings, &timeouts).map_err(|source| {
                PoolSetupError::Build {
                    lane: lane.as_str(),
                    source,
                }
            })?;
            debug!(
                lane = lane.as_str(),
                max_size = settings.max_size,
                "built lane pool"
            );
            pools.push(pool);
        }

        let pools: [Pool; 4] = match pools.try_into() {
            Ok(pools) => pools,
            Err(_) => unreachable!("one pool per lane"),
        };
        Ok(Self { pools })
    }

    pub fn pool(&self, lane: Lane) -> &Pool {
        &self.pools[lane.index()]
    }

    /// Issues one trivial round-trip per pool, all four concurrently, under
    /// a single aggregate deadline.
    pub async fn warmup(&self) -> Result<(), PoolSetupError> {
        tokio::time::timeout(WARMUP_TIMEOUT, async {
            tokio::try_join!(
                self.ping(Lane::Fast),
                self.ping(Lane::Medium),
                self.ping(Lane::Slow),
                self.ping(Lane::Error),
            )?;
            Ok::<(), PoolSetupError>(())
        })
        .await
        .map_err(|_| PoolSetupError::WarmupTimeout(WARMUP_TIMEOUT))??;
        info!("connection pools warmed up");
        Ok(())
    }

    async fn ping(&self, lane: Lane) -> Result<(), PoolSetupError> {
        let client = self
            .pool(lane)
            .get()
            .await
            .map_err(|source| PoolSetupError::Acquire {
                lane: lane.as_str(),
                source,
            })?;
        client
            .simple_query("SELECT 1")
            .await
            .map_err(|source| PoolSetupError::Warmup {
                lane: lane.as_str(),
                source,
            })?;
        Ok(())
    }

    /// Stops handing out connections. Pooled connections are dropped with
    /// the pool, which closes each connection's prepared statements with it.
    pub fn close(&self) {
        for lane in Lane::ALL {
            self.pool(lane).close();
        }
    }
}
