pub mod lanes;
pub mod worker;

pub use lanes::{
    classify, Lane, LaneAllocation, LaneQueues, WorkItem, ERROR_LANE_CAPACITY,
    FAST_THRESHOLD, MEDIUM_THRESHOLD, WORK_LANE_CAPACITY,
};
pub use worker::{Handled, ItemHandler, RunTotals, WorkerPool};
