use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::report::{ProcLog, ProcStatus, Reporter};
use crate::stats::StatsRegistry;

use super::lanes::{classify, Lane, LaneAllocation, LaneQueues, WorkItem};

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// What a handler did with an item.
pub enum Handled {
    /// The item succeeded; the pool emits its SUCCESS record.
    Done,
    /// The handler already emitted its own records (one per chunk); the pool
    /// only feeds the stats registry.
    Reported { success: bool },
}

/// The work a lane worker performs per item. `lane` is the lane the item was
/// taken from; under stealing that is the target lane, so implementations
/// acquire resources sized for the stolen lane, not the worker's home.
#[async_trait]
pub trait ItemHandler: Send + Sync {
    async fn run(
        &self,
        lane: Lane,
        item: &WorkItem,
        reporter: &Reporter,
    ) -> Result<Handled, HandlerError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunTotals {
    pub completed: usize,
    pub failed: usize,
}

struct Progress {
    started: Instant,
    total: usize,
    completed: AtomicUsize,
    failed: AtomicUsize,
}

impl Progress {
    fn new(total: usize) -> Self {
        Self {
            started: Instant::now(),
            total,
            completed: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
        }
    }

    fn bump(&self) {
        let completed = self.completed.fetch_add(1, Ordering::Relaxed) + 1;
        if completed % 100 == 0 || completed == self.total {
            let elapsed = self.started.elapsed();
            let eta_secs = if completed > 0 {
                let per_item = elapsed.as_secs_f64() / completed as f64;
                (per_item * (self.total - completed) as f64).round() as u64
            } else {
                0
            };
            let percent =
                (completed as f64 * 10_000.0 / self.total.max(1) as f64).round() / 100.0;
            info!(
                completed,
                total = self.total,
                percent,
                elapsed_secs = elapsed.as_secs(),
                eta_secs,
                "progress"
            );
        }
    }
}

struct Shared<H> {
    queues: LaneQueues,
    registry: Arc<StatsRegistry>,
    handler: Arc<H>,
    reporter: Reporter,
    cancel: CancellationToken,
    progress: Progress,
}

/// Multi-lane worker pool.
///
/// Workers are bound to a home lane in the configured allocation. The
/// enqueue pass is single-producer: each tuple is classified once and
/// offered to its lane, then every lane is closed. A worker that has
/// drained its closed home lane steals from slower lanes (fast helps
/// medium then slow, medium helps slow); error-lane workers never steal.
pub struct WorkerPool<H> {
    allocation: LaneAllocation,
    registry: Arc<StatsRegistry>,
    handler: Arc<H>,
    cancel: CancellationToken,
}

impl<H: ItemHandler + 'static> WorkerPool<H> {
    pub fn new(
        concurrency: usize,
        registry: Arc<StatsRegistry>,
        handler: Arc<H>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            allocation: LaneAllocation::split(concurrency),
            registry,
            handler,
            cancel,
        }
    }

    pub fn allocation(&self) -> LaneAllocation {
        self.allocation
    }

    /// Runs the full cartesian product of procedures and SOLs to completion
    /// and returns the totals. Every item produces at least one completion
    /// record through the reporter unless the run is cancelled.
    pub async fn run(
        &self,
        procedures: &[String],
        sols: &[String],
        reporter: Reporter,
    ) -> RunTotals {
        let total = procedures.len() * sols.len();
        let shared = Arc::new(Shared {
            queues: LaneQueues::new(),
            registry: Arc::clone(&self.registry),
            handler: Arc::clone(&self.handler),
            reporter,
            cancel: self.cancel.clone(),
            progress: Progress::new(total),
        });

        info!(
            fast = self.allocation.fast,
            medium = self.allocation.medium,
            slow = self.allocation.slow,
            error = self.allocation.error,
            total_items = total,
            "starting lane workers"
        );

        let mut workers = Vec::with_capacity(self.allocation.total());
        for lane in Lane::ALL {
            for _ in 0..self.allocation.get(lane) {
                let shared = Arc::clone(&shared);
                workers.push(tokio::spawn(worker_loop(shared, lane)));
            }
        }

        'enqueue: for procedure in procedures {
            for sol in sols {
                let item = WorkItem::new(procedure.clone(), sol.clone());
                let lane = classify(&shared.registry, &item);
                tokio::select! {
                    biased;
                    _ = shared.cancel.cancelled() => break 'enqueue,
                    sent = shared.queues.sender(lane).send(item) => {
                        if sent.is_err() {
                            break 'enqueue;
                        }
                    }
                }
            }
        }
        shared.queues.close_all();

        for worker in workers {
            let _ = worker.await;
        }

        RunTotals {
            completed: shared.progress.completed.load(Ordering::Relaxed),
            failed: shared.progress.failed.load(Ordering::Relaxed),
        }
    }
}

fn steal_targets(lane: Lane) -> &'static [Lane] {
    match lane {
        Lane::Fast => &[Lane::Medium, Lane::Slow],
        Lane::Medium => &[Lane::Slow],
        Lane::Slow | Lane::Error => &[],
    }
}

async fn worker_loop<H: ItemHandler>(shared: Arc<Shared<H>>, home: Lane) {
    drain(&shared, home).await;
    for &target in steal_targets(home) {
        drain(&shared, target).await;
    }
    debug!(lane = home.as_str(), "worker finished");
}

/// Consumes one lane until it is closed and empty or the run is cancelled.
async fn drain<H: ItemHandler>(shared: &Shared<H>, lane: Lane) {
    let receiver = shared.queues.receiver(lane);
    loop {
        tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break,
            next = receiver.recv() => match next {
                Ok(item) => process(shared, lane, item).await,
                Err(_) => break,
            }
        }
    }
}

async fn process<H: ItemHandler>(shared: &Shared<H>, lane: Lane, item: WorkItem) {
    let start_time = Utc::now();
    let started = Instant::now();
    let outcome = shared.handler.run(lane, &item, &shared.reporter).await;
    let duration = started.elapsed();
    let end_time = Utc::now();

    let (success, log) = match outcome {
        Ok(Handled::Done) => (
            true,
            Some(ProcLog {
                sol_id: item.sol_id.clone(),
                procedure: item.procedure.clone(),
                start_time,
                end_time,
                status: ProcStatus::Success,
                error_details: String::new(),
            }),
        ),
        Ok(Handled::Reported { success }) => (success, None),
        Err(err) => (
            false,
            Some(ProcLog {
                sol_id: item.sol_id.clone(),
                procedure: item.procedure.clone(),
                start_time,
                end_time,
                status: ProcStatus::Fail,
                error_details: err.to_string(),
            }),
        ),
    };

    shared.registry.update(&item.procedure, duration, success);
    if !success {
        shared.progress.failed.fetch_add(1, Ordering::Relaxed);
    }
    if let Some(log) = log {
        shared.reporter.record(log).await;
    }
    shared.progress.bump();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::RunSummary;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// Test double: fails a procedure a scripted number of times and records
    /// which lane each item arrived on.
    struct ScriptedHandler {
        failures: Mutex<HashMap<String, usize>>,
        seen: Mutex<Vec<(Lane, WorkItem)>>,
        self_reported: bool,
    }

    impl ScriptedHandler {
        fn new() -> Self {
            Self {
                failures: Mutex::new(HashMap::new()),
                seen: Mutex::new(Vec::new()),
                self_reported: false,
            }
        }

        fn failing(procedure: &str, times: usize) -> Self {
            let handler = Self::new();
            handler
                .failures
                .lock()
                .unwrap()
                .insert(procedure.to_string(), times);
            handler
        }

        fn lanes_for(&self, procedure: &str) -> Vec<Lane> {
            self.seen
                .lock()
                .unwrap()
                .iter()
                .filter(|(_, item)| item.procedure == procedure)
                .map(|(lane, _)| *lane)
                .collect()
        }
    }

    #[async_trait]
    impl ItemHandler for ScriptedHandler {
        async fn run(
            &self,
            lane: Lane,
            item: &WorkItem,
            _reporter: &Reporter,
        ) -> Result<Handled, HandlerError> {
            self.seen.lock().unwrap().push((lane, item.clone()));
            let should_fail = {
                let mut failures = self.failures.lock().unwrap();
                match failures.get_mut(&item.procedure) {
                    Some(remaining) if *remaining > 0 => {
                        *remaining -= 1;
                        true
                    }
                    _ => false,
                }
            };
            if should_fail {
                return Err("injected failure".into());
            }
            if self.self_reported {
                return Ok(Handled::Reported { success: true });
            }
            Ok(Handled::Done)
        }
    }

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    async fn run_pool(
        handler: Arc<ScriptedHandler>,
        registry: Arc<StatsRegistry>,
        procedures: &[&str],
        sols: &[&str],
    ) -> (RunTotals, Vec<ProcLog>, Arc<RunSummary>) {
        let (tx, mut rx) = mpsc::channel(1024);
        let summary = Arc::new(RunSummary::new());
        let reporter = Reporter::new(tx, summary.clone());
        let pool = WorkerPool::new(4, registry, handler, CancellationToken::new());

        let totals = pool
            .run(&strings(procedures), &strings(sols), reporter)
            .await;

        let mut logs = Vec::new();
        while let Ok(log) = rx.try_recv() {
            logs.push(log);
        }
        (totals, logs, summary)
    }

    #[tokio::test]
    async fn every_tuple_completes_exactly_once() {
        let handler = Arc::new(ScriptedHandler::new());
        let registry = Arc::new(StatsRegistry::new(&["A", "B"]));
        let (totals, logs, summary) =
            run_pool(handler, registry.clone(), &["A", "B"], &["S1", "S2", "S3"]).await;

        assert_eq!(totals, RunTotals { completed: 6, failed: 0 });
        assert_eq!(logs.len(), 6);
        assert!(logs.iter().all(|l| l.status == ProcStatus::Success));
        assert!(logs
            .iter()
            .all(|l| l.execution_time() >= chrono::Duration::zero()));

        let rows = summary.snapshot();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.status == ProcStatus::Success));
        assert_eq!(registry.snapshot("A").total_executions, 3);
    }

    #[tokio::test]
    async fn failures_are_logged_and_counted() {
        let handler = Arc::new(ScriptedHandler::failing("B", 2));
        let registry = Arc::new(StatsRegistry::new(&["B"]));
        let (totals, logs, summary) =
            run_pool(handler, registry, &["B"], &["S1", "S2", "S3"]).await;

        assert_eq!(totals.completed, 3);
        assert_eq!(totals.failed, 2);
        assert_eq!(
            logs.iter().filter(|l| l.status == ProcStatus::Fail).count(),
            2
        );
        let failed = logs.iter().find(|l| l.status == ProcStatus::Fail).unwrap();
        assert_eq!(failed.error_details, "injected failure");
        assert_eq!(summary.snapshot()[0].status, ProcStatus::Fail);
    }

    #[tokio::test]
    async fn sustained_failures_open_the_circuit() {
        let handler = Arc::new(ScriptedHandler::failing("B", usize::MAX));
        let registry = Arc::new(StatsRegistry::new(&["B"]));
        let sols: Vec<&str> = vec!["S1", "S2", "S3", "S4", "S5", "S6"];
        let (totals, _, _) = run_pool(handler, registry.clone(), &["B"], &sols).await;

        assert_eq!(totals.failed, 6);
        assert_eq!(
            registry.snapshot("B").circuit,
            crate::stats::CircuitState::Open
        );
    }

    #[tokio::test]
    async fn slow_items_are_processed_on_the_slow_lane() {
        let handler = Arc::new(ScriptedHandler::new());
        let registry = Arc::new(StatsRegistry::new(&["SLOW", "QUICK"]));
        // Pre-seed the averages so classification routes deterministically.
        registry.update("SLOW", Duration::from_secs(45), true);
        registry.update("QUICK", Duration::from_millis(50), true);

        let (totals, _, _) = run_pool(
            handler.clone(),
            registry,
            &["SLOW", "QUICK"],
            &["S1", "S2"],
        )
        .await;

        assert_eq!(totals.completed, 4);
        // Whoever executed them (home worker or stealer), slow items were
        // delivered through the slow lane.
        assert!(handler
            .lanes_for("SLOW")
            .iter()
            .all(|lane| *lane == Lane::Slow));
        assert!(handler
            .lanes_for("QUICK")
            .iter()
            .all(|lane| *lane == Lane::Fast));
    }

    #[tokio::test]
    async fn self_reported_items_skip_the_pool_log() {
        let mut handler = ScriptedHandler::new();
        handler.self_reported = true;
        let handler = Arc::new(handler);
        let registry = Arc::new(StatsRegistry::new(&["A"]));
        let (totals, logs, _) = run_pool(handler, registry.clone(), &["A"], &["S1"]).await;

        assert_eq!(totals.completed, 1);
        assert!(logs.is_empty());
        // Stats are still fed for self-reported items.
        assert_eq!(registry.snapshot("A").total_executions, 1);
    }

    #[tokio::test]
    async fn cancelled_pool_stops_enqueueing() {
        let handler = Arc::new(ScriptedHandler::new());
        let registry = Arc::new(StatsRegistry::new(&["A"]));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let (tx, _rx) = mpsc::channel(16);
        let reporter = Reporter::new(tx, Arc::new(RunSummary::new()));
        let pool = WorkerPool::new(4, registry, handler, cancel);
        let totals = pool
            .run(&strings(&["A"]), &strings(&["S1", "S2"]), reporter)
            .await;

        assert_eq!(totals.completed, 0);
    }

    #[test]
    fn steal_order_is_fast_medium_slow() {
        assert_eq!(steal_targets(Lane::Fast), &[Lane::Medium, Lane::Slow]);
        assert_eq!(steal_targets(Lane::Medium), &[Lane::Slow]);
        assert!(steal_targets(Lane::Slow).is_empty());
        assert!(steal_targets(Lane::Error).is_empty());
    }
}
