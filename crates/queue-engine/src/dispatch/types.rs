//! View types returned by dispatch operations and reads.
//!
//! Everything here is derived from committed state at the moment of the call.
//! A snapshot is a view, never a source of truth: it may be at most one
//! mutation stale relative to a concurrent writer and is recomputed on demand.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::branch::{BranchId, QueueStatus, ServiceId};
use crate::counter::{CounterId, CounterStats, CounterStatus};
use crate::events::PositionUrgency;
use crate::ticket::{Ticket, TicketId, TicketPriority, TicketStatus};

/// Outcome of a successful check-in
#[derive(Debug, Clone, Serialize)]
pub struct CheckinReceipt {
    pub ticket: Ticket,
    /// 1-based queue position at issue time
    pub position: u32,
    pub estimated_wait_mins: u32,
}

/// Outcome of a successful call-next claim
#[derive(Debug, Clone, Serialize)]
pub struct ClaimedTicket {
    pub ticket: Ticket,
    pub counter_number: u32,
}

/// A waiting ticket with its computed rank
#[derive(Debug, Clone, Serialize)]
pub struct WaitingTicketView {
    pub ticket_id: TicketId,
    pub ticket_number: String,
    pub service_id: ServiceId,
    pub service_name: String,
    pub priority: TicketPriority,
    pub created_at: DateTime<Utc>,
    pub position: u32,
    pub estimated_wait_mins: u32,
}

/// A counter with its live assignment
#[derive(Debug, Clone, Serialize)]
pub struct CounterView {
    pub counter_id: CounterId,
    pub number: u32,
    pub status: CounterStatus,
    pub assigned_user_id: Option<String>,
    pub current_ticket_number: Option<String>,
    pub on_break_until: Option<DateTime<Utc>>,
}

/// Per-service queue statistics
#[derive(Debug, Clone, Serialize)]
pub struct ServiceQueueStats {
    pub service_id: ServiceId,
    pub name: String,
    pub prefix: String,
    pub waiting_count: usize,
    /// Average in effect right now (manual or measured)
    pub avg_service_time_mins: u32,
    /// Estimate a customer checking in now would be quoted
    pub estimated_wait_mins: u32,
    /// Minutes until the head of this service's queue is expected to be called
    pub next_call_estimate_mins: u32,
    /// Ticket numbers about to be called, in order
    pub next_ticket_numbers: Vec<String>,
}

/// Day-to-date totals for a branch
#[derive(Debug, Clone, Serialize)]
pub struct DayTotals {
    pub waiting: usize,
    pub served: usize,
    pub no_shows: usize,
    /// Average minutes from check-in to call over today's completed tickets
    pub avg_completed_wait_mins: Option<i64>,
}

/// Full state of a branch's queue, built for displays and dashboards
#[derive(Debug, Clone, Serialize)]
pub struct BranchSnapshot {
    pub branch_id: BranchId,
    pub queue_status: QueueStatus,
    pub generated_at: DateTime<Utc>,
    pub counters: Vec<CounterView>,
    pub counter_stats: CounterStats,
    /// Waiting tickets in calling order
    pub waiting: Vec<WaitingTicketView>,
    pub services: Vec<ServiceQueueStats>,
    pub totals: DayTotals,
}

/// Where one ticket stands right now
#[derive(Debug, Clone, Serialize)]
pub struct TicketPositionInfo {
    pub ticket_id: TicketId,
    pub ticket_number: String,
    pub status: TicketStatus,
    /// Set only while the ticket is waiting
    pub position: Option<u32>,
    pub estimated_wait_mins: Option<u32>,
    pub urgency: Option<PositionUrgency>,
    /// Counter serving or having served the ticket, if any
    pub counter_number: Option<u32>,
}
