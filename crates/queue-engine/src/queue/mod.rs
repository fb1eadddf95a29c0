//! Queue ordering and wait-time estimation.
//!
//! Both submodules are pure functions over ticket snapshots: the ranking is
//! re-derivable from persisted state alone, and the estimator never drifts
//! incrementally — every caller recomputes from current state.

pub mod estimator;
pub mod ranking;

pub use estimator::{dynamic_service_time_mins, estimated_wait_mins, next_call_estimate_mins};
pub use ranking::{position_of, rank_waiting};
