//! Ticket persistence behind the [`TicketStore`] trait.
//!
//! The dispatch engine is the only writer. Every transition is committed as
//! one atomic unit: ticket update plus history append either both land or
//! neither does. The conditional update [`TicketStore::update_ticket_if_status`]
//! is the claim primitive — it applies the new record only while the stored
//! status still matches the caller's snapshot, so a racing claim surfaces as
//! a clean `false` instead of a silent double-assignment.

pub mod memory;
pub mod schema;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::branch::BranchId;
use crate::error::Result;
use crate::ticket::{Ticket, TicketHistoryEntry, TicketId, TicketStatus};

pub use memory::MemoryTicketStore;
pub use sqlite::SqliteTicketStore;

/// Durable record of tickets and their history
#[async_trait]
pub trait TicketStore: Send + Sync {
    /// Persist a fresh ticket together with its creation history entry
    async fn insert_ticket(&self, ticket: &Ticket, history: &TicketHistoryEntry) -> Result<()>;

    /// Fetch a ticket by id
    async fn ticket(&self, id: &TicketId) -> Result<Option<Ticket>>;

    /// Compare-and-swap on ticket status.
    ///
    /// Replaces the stored record with `updated` and appends `history` in one
    /// atomic unit, but only if the stored status still equals `expected`.
    /// Returns `false` without writing anything when the status moved.
    async fn update_ticket_if_status(
        &self,
        updated: &Ticket,
        expected: TicketStatus,
        history: &TicketHistoryEntry,
    ) -> Result<bool>;

    /// Tickets of a branch in the given status, checked in at or after `since`
    async fn tickets_with_status(
        &self,
        branch_id: &BranchId,
        status: TicketStatus,
        since: DateTime<Utc>,
    ) -> Result<Vec<Ticket>>;

    /// Tickets currently occupying a counter (called or serving)
    async fn active_tickets(&self, branch_id: &BranchId) -> Result<Vec<Ticket>>;

    /// Tickets completed at or after `since`
    async fn completed_since(
        &self,
        branch_id: &BranchId,
        since: DateTime<Utc>,
    ) -> Result<Vec<Ticket>>;

    /// Highest issued ticket sequence for (branch, prefix) since `day_start`.
    ///
    /// Seeds the in-process [`crate::ticket::TicketSequencer`] after a restart.
    async fn max_ticket_seq(
        &self,
        branch_id: &BranchId,
        prefix: &str,
        day_start: DateTime<Utc>,
    ) -> Result<u32>;

    /// Full audit trail of a ticket, oldest first
    async fn history(&self, ticket_id: &TicketId) -> Result<Vec<TicketHistoryEntry>>;
}
