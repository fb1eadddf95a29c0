//! Role-scoped operation surfaces over the dispatch engine.
//!
//! Each API is a thin handle around the shared engine, exposing exactly the
//! operations its actor is entitled to: kiosks check in and read, tellers
//! drive their counter, managers steer the whole queue. Authentication and
//! role enforcement live in a collaborator; these types define the contract
//! it guards.

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::alerts::Alert;
use crate::branch::{BranchId, ServiceId};
use crate::counter::{BreakReason, Counter, CounterId, TellerBreak};
use crate::dispatch::{
    BranchSnapshot, CheckinReceipt, ClaimedTicket, DispatchEngine, TicketPositionInfo,
};
use crate::error::Result;
use crate::events::QueueEvent;
use crate::ticket::{CheckinRequest, Ticket, TicketId};

/// Operations available to check-in kiosks and the customer mobile view
#[derive(Clone)]
pub struct KioskApi {
    engine: Arc<DispatchEngine>,
}

impl KioskApi {
    pub fn new(engine: Arc<DispatchEngine>) -> Self {
        Self { engine }
    }

    /// Issue a ticket for a walk-in customer
    pub async fn checkin(&self, request: CheckinRequest) -> Result<CheckinReceipt> {
        self.engine.checkin(request).await
    }

    /// Where a ticket stands right now
    pub async fn ticket_position(&self, ticket_id: &TicketId) -> Result<TicketPositionInfo> {
        self.engine.ticket_position(ticket_id).await
    }

    /// Withdraw a waiting ticket (customer-initiated)
    pub async fn cancel_ticket(&self, ticket_id: &TicketId) -> Result<Ticket> {
        self.engine.cancel_ticket(ticket_id, "customer").await
    }

    /// Live feed for a waiting-area display
    pub fn subscribe_display(&self, branch_id: &BranchId) -> broadcast::Receiver<QueueEvent> {
        self.engine.broadcaster().subscribe_display(branch_id)
    }

    /// Live feed for one ticket (customer's phone)
    pub fn subscribe_ticket(&self, ticket_id: &TicketId) -> broadcast::Receiver<QueueEvent> {
        self.engine.broadcaster().subscribe_ticket(ticket_id)
    }

    /// Display refresh
    pub async fn branch_snapshot(&self, branch_id: &BranchId) -> Result<BranchSnapshot> {
        self.engine.branch_snapshot(branch_id).await
    }
}

/// Operations available to a teller at a counter
#[derive(Clone)]
pub struct TellerApi {
    engine: Arc<DispatchEngine>,
}

impl TellerApi {
    pub fn new(engine: Arc<DispatchEngine>) -> Self {
        Self { engine }
    }

    /// Call the next eligible customer to the counter
    pub async fn call_next(&self, counter_id: &CounterId, teller_id: &str) -> Result<ClaimedTicket> {
        self.engine.call_next(counter_id, teller_id).await
    }

    /// Call the next customer of one specific service
    pub async fn call_next_by_service(
        &self,
        counter_id: &CounterId,
        service_id: &ServiceId,
        teller_id: &str,
    ) -> Result<ClaimedTicket> {
        self.engine
            .call_next_by_service(counter_id, service_id, teller_id)
            .await
    }

    /// Finish serving the current customer
    pub async fn complete_ticket(
        &self,
        ticket_id: &TicketId,
        teller_id: &str,
        notes: Option<String>,
    ) -> Result<Ticket> {
        self.engine.complete_ticket(ticket_id, teller_id, notes).await
    }

    /// The called customer never arrived
    pub async fn mark_no_show(&self, ticket_id: &TicketId, teller_id: &str) -> Result<Ticket> {
        self.engine.mark_no_show(ticket_id, teller_id).await
    }

    /// Send the current customer to another service's queue
    pub async fn transfer_ticket(
        &self,
        ticket_id: &TicketId,
        target_service_id: &ServiceId,
        teller_id: &str,
    ) -> Result<Ticket> {
        self.engine
            .transfer_ticket(ticket_id, target_service_id, teller_id)
            .await
    }

    pub async fn open_counter(&self, counter_id: &CounterId) -> Result<Counter> {
        self.engine.open_counter(counter_id).await
    }

    pub async fn close_counter(&self, counter_id: &CounterId) -> Result<Counter> {
        self.engine.close_counter(counter_id).await
    }

    pub async fn start_break(
        &self,
        counter_id: &CounterId,
        reason: BreakReason,
        duration_mins: u32,
    ) -> Result<TellerBreak> {
        self.engine.start_break(counter_id, reason, duration_mins).await
    }

    pub async fn end_break(&self, counter_id: &CounterId) -> Result<Counter> {
        self.engine.end_break(counter_id).await
    }

    pub async fn extend_break(
        &self,
        counter_id: &CounterId,
        additional_mins: u32,
    ) -> Result<Counter> {
        self.engine.extend_break(counter_id, additional_mins).await
    }

    /// The teller's view of their branch queue
    pub async fn queue_view(&self, branch_id: &BranchId) -> Result<BranchSnapshot> {
        self.engine.branch_snapshot(branch_id).await
    }
}

/// Operations available to a branch manager
#[derive(Clone)]
pub struct ManagerApi {
    engine: Arc<DispatchEngine>,
}

impl ManagerApi {
    pub fn new(engine: Arc<DispatchEngine>) -> Self {
        Self { engine }
    }

    /// Make a waiting ticket next in line
    pub async fn bump_priority(
        &self,
        ticket_id: &TicketId,
        manager_id: &str,
        reason: Option<String>,
    ) -> Result<Ticket> {
        self.engine.bump_priority(ticket_id, manager_id, reason).await
    }

    /// Cancel a waiting ticket on a customer's behalf
    pub async fn cancel_ticket(&self, ticket_id: &TicketId, manager_id: &str) -> Result<Ticket> {
        self.engine.cancel_ticket(ticket_id, manager_id).await
    }

    /// Move an active ticket to another service's queue
    pub async fn transfer_ticket(
        &self,
        ticket_id: &TicketId,
        target_service_id: &ServiceId,
        manager_id: &str,
    ) -> Result<Ticket> {
        self.engine
            .transfer_ticket(ticket_id, target_service_id, manager_id)
            .await
    }

    pub async fn pause_queue(&self, branch_id: &BranchId, manager_id: &str) -> Result<()> {
        self.engine.pause_queue(branch_id, manager_id).await
    }

    pub async fn resume_queue(&self, branch_id: &BranchId, manager_id: &str) -> Result<()> {
        self.engine.resume_queue(branch_id, manager_id).await
    }

    /// Cancel everything outstanding and restart today's numbering
    pub async fn reset_queue(&self, branch_id: &BranchId, manager_id: &str) -> Result<usize> {
        self.engine.reset_queue(branch_id, manager_id).await
    }

    /// Current operational alerts for the branch
    pub async fn branch_alerts(&self, branch_id: &BranchId) -> Vec<Alert> {
        self.engine.evaluate_branch_alerts(branch_id).await
    }

    pub async fn branch_snapshot(&self, branch_id: &BranchId) -> Result<BranchSnapshot> {
        self.engine.branch_snapshot(branch_id).await
    }

    /// Live feed of everything happening in the branch
    pub fn subscribe_branch(&self, branch_id: &BranchId) -> broadcast::Receiver<QueueEvent> {
        self.engine.broadcaster().subscribe_branch(branch_id)
    }
}
