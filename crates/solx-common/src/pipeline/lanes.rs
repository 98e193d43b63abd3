use std::time::Duration;

use async_channel::{Receiver, Sender};

use crate::stats::{CircuitState, StatsRegistry};

/// Average-latency boundaries between lanes.
pub const FAST_THRESHOLD: Duration = Duration::from_secs(5);
pub const MEDIUM_THRESHOLD: Duration = Duration::from_secs(30);

pub const WORK_LANE_CAPACITY: usize = 20_000;
pub const ERROR_LANE_CAPACITY: usize = 5_000;

/// One unit of work: a single procedure run against a single SOL.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkItem {
    pub procedure: String,
    pub sol_id: String,
}

impl WorkItem {
    pub fn new(procedure: impl Into<String>, sol_id: impl Into<String>) -> Self {
        Self {
            procedure: procedure.into(),
            sol_id: sol_id.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lane {
    Fast,
    Medium,
    Slow,
    Error,
}

impl Lane {
    pub const ALL: [Lane; 4] = [Lane::Fast, Lane::Medium, Lane::Slow, Lane::Error];

    pub fn as_str(&self) -> &'static str {
        match self {
            Lane::Fast => "fast",
            Lane::Medium => "medium",
            Lane::Slow => "slow",
            Lane::Error => "error",
        }
    }

    pub(crate) fn index(&self) -> usize {
        match self {
            Lane::Fast => 0,
            Lane::Medium => 1,
            Lane::Slow => 2,
            Lane::Error => 3,
        }
    }
}

/// Worker / connection counts per lane for a given total concurrency.
///
/// The split is 50/30/15/5 with a floor of one per lane; the arithmetic
/// remainder accrues to the error lane before the floor is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaneAllocation {
    pub fast: usize,
    pub medium: usize,
    pub slow: usize,
    pub error: usize,
}

impl LaneAllocation {
    pub fn split(concurrency: usize) -> Self {
        let fast = (concurrency as f64 * 0.5) as usize;
        let medium = (concurrency as f64 * 0.3) as usize;
        let slow = (concurrency as f64 * 0.15) as usize;
        let error = concurrency.saturating_sub(fast + medium + slow);
        Self {
            fast: fast.max(1),
            medium: medium.max(1),
            slow: slow.max(1),
            error: error.max(1),
        }
    }

    pub fn get(&self, lane: Lane) -> usize {
        match lane {
            Lane::Fast => self.fast,
            Lane::Medium => self.medium,
            Lane::Slow => self.slow,
            Lane::Error => self.error,
        }
    }

    pub fn total(&self) -> usize {
        self.fast + self.medium + self.slow + self.error
    }
}

/// The four bounded lane queues. Channels are multi-consumer so stealing
/// workers can drain a foreign lane after it closes.
pub struct LaneQueues {
    channels: [(Sender<WorkItem>, Receiver<WorkItem>); 4],
}

impl Default for LaneQueues {
    fn default() -> Self {
        Self::new()
    }
}

impl LaneQueues {
    pub fn new() -> Self {
        Self {
            channels: [
                async_channel::bounded(WORK_LANE_CAPACITY),
                async_channel::bounded(WORK_LANE_CAPACITY),
                async_channel::bounded(WORK_LANE_CAPACITY),
                async_channel::bounded(ERROR_LANE_CAPACITY),
            ],
        }
    }

    pub fn sender(&self, lane: Lane) -> &Sender<WorkItem> {
        &self.channels[lane.index()].0
    }

    pub fn receiver(&self, lane: Lane) -> Receiver<WorkItem> {
        self.channels[lane.index()].1.clone()
    }

    /// Signals end-of-stream on every lane. Receivers keep draining whatever
    /// is already buffered.
    pub fn close_all(&self) {
        for (sender, _) in &self.channels {
            sender.close();
        }
    }
}

/// Picks the lane for a work item from the procedure's observed behavior:
/// an open circuit (after the lazy half-open probe) routes to the error
/// lane, a procedure with no history defaults to fast, and everything else
/// is placed by its cumulative average latency.
pub fn classify(registry: &StatsRegistry, item: &WorkItem) -> Lane {
    if registry.probe_circuit(&item.procedure) == CircuitState::Open {
        return Lane::Error;
    }

    let snapshot = registry.snapshot(&item.procedure);
    if snapshot.total_executions == 0 {
        return Lane::Fast;
    }
    if snapshot.avg_duration < FAST_THRESHOLD {
        Lane::Fast
    } else if snapshot.avg_duration < MEDIUM_THRESHOLD {
        Lane::Medium
    } else {
        Lane::Slow
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::BreakerPolicy;

    #[test]
    fn split_matches_ratios_at_twenty() {
        let alloc = LaneAllocation::split(20);
        assert_eq!(alloc.fast, 10);
        assert_eq!(alloc.medium, 6);
        assert_eq!(alloc.slow, 3);
        assert_eq!(alloc.error, 1);
        assert_eq!(alloc.total(), 20);
    }

    #[test]
    fn split_enforces_one_per_lane_when_small() {
        let alloc = LaneAllocation::split(1);
        assert_eq!(alloc.fast, 1);
        assert_eq!(alloc.medium, 1);
        assert_eq!(alloc.slow, 1);
        assert_eq!(alloc.error, 1);
    }

    #[test]
    fn remainder_accrues_to_error_lane() {
        // 10 → 5 + 3 + 1, remainder 1 to error.
        let alloc = LaneAllocation::split(10);
        assert_eq!(alloc.error, 1);
        assert_eq!(alloc.total(), 10);
        assert!(alloc.fast >= alloc.medium && alloc.medium >= alloc.slow);
    }

    #[test]
    fn new_procedure_goes_fast() {
        let registry = StatsRegistry::new(&["P"]);
        let lane = classify(&registry, &WorkItem::new("P", "S1"));
        assert_eq!(lane, Lane::Fast);
    }

    #[test]
    fn lanes_follow_average_latency() {
        let registry = StatsRegistry::new(&["F", "M", "S"]);
        registry.update("F", Duration::from_secs(2), true);
        registry.update("M", Duration::from_secs(15), true);
        registry.update("S", Duration::from_secs(60), true);

        assert_eq!(classify(&registry, &WorkItem::new("F", "S1")), Lane::Fast);
        assert_eq!(classify(&registry, &WorkItem::new("M", "S1")), Lane::Medium);
        assert_eq!(classify(&registry, &WorkItem::new("S", "S1")), Lane::Slow);
    }

    #[test]
    fn average_crossing_thresholds_promotes_lane() {
        let registry = StatsRegistry::new(&["C"]);
        registry.update("C", Duration::from_millis(100), true);
        assert_eq!(classify(&registry, &WorkItem::new("C", "S1")), Lane::Fast);

        // One 60 s execution drags the cumulative average past 5 s.
        registry.update("C", Duration::from_secs(60), true);
        assert_eq!(classify(&registry, &WorkItem::new("C", "S1")), Lane::Medium);

        // Two more push it past 30 s.
        registry.update("C", Duration::from_secs(60), true);
        registry.update("C", Duration::from_secs(60), true);
        assert_eq!(classify(&registry, &WorkItem::new("C", "S1")), Lane::Slow);
    }

    #[test]
    fn open_circuit_routes_to_error_lane() {
        let registry = StatsRegistry::new(&["B"]);
        for _ in 0..5 {
            registry.update("B", Duration::from_secs(1), false);
        }
        assert_eq!(classify(&registry, &WorkItem::new("B", "S1")), Lane::Error);
    }

    #[test]
    fn half_open_circuit_classifies_by_latency_again() {
        let registry = StatsRegistry::with_policy(
            &["B"],
            BreakerPolicy {
                failure_threshold: 5,
                reset_timeout: Duration::ZERO,
            },
        );
        for _ in 0..5 {
            registry.update("B", Duration::from_secs(1), false);
        }
        std::thread::sleep(Duration::from_millis(2));

        // The probe flips OPEN → HALF_OPEN and classification continues on
        // the 1 s average.
        assert_eq!(classify(&registry, &WorkItem::new("B", "S1")), Lane::Fast);
    }

    #[test]
    fn classification_is_idempotent_without_updates() {
        let registry = StatsRegistry::new(&["P"]);
        registry.update("P", Duration::from_secs(10), true);
        let item = WorkItem::new("P", "S1");
        let first = classify(&registry, &item);
        for _ in 0..5 {
            assert_eq!(classify(&registry, &item), first);
        }
    }

    #[test]
    fn queues_deliver_after_close() {
        let queues = LaneQueues::new();
        queues
            .sender(Lane::Fast)
            .send_blocking(WorkItem::new("P", "S1"))
            .unwrap();
        queues.close_all();

        let receiver = queues.receiver(Lane::Fast);
        assert_eq!(
            receiver.recv_blocking().unwrap(),
            WorkItem::new("P", "S1")
        );
        assert!(receiver.recv_blocking().is_err());
    }
}
