//! Queue dispatch: validation and execution of every ticket transition.
//!
//! The [`DispatchEngine`] composes the ranking and estimator functions, the
//! counter registry, and the ticket store under a per-branch serialization
//! discipline, and publishes ordered events through the broadcaster.

pub mod engine;
pub mod types;

pub use engine::DispatchEngine;
pub use types::{
    BranchSnapshot, CheckinReceipt, ClaimedTicket, CounterView, DayTotals, ServiceQueueStats,
    TicketPositionInfo, WaitingTicketView,
};
