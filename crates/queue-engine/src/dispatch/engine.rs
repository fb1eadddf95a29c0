//! The dispatch engine: owner of every ticket and counter mutation.
//!
//! All mutating operations for a branch run under that branch's mutex, so
//! same-branch claims are serialized by construction while different branches
//! proceed fully in parallel. Reads never take the mutex — they see committed
//! store state that is at most one mutation stale.
//!
//! Even inside the critical section, a claim is committed through the store's
//! conditional update: if the serialization boundary is ever bypassed, the
//! status check turns a would-be double assignment into a retryable
//! `ConcurrentModification` instead of corrupted state.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc, Weekday};
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::alerts::{self, Alert, AlertInputs, TellerServiceStat};
use crate::branch::{Branch, BranchId, BranchRegistry, QueueStatus, ServiceCategory, ServiceId};
use crate::config::QueueEngineConfig;
use crate::counter::{BreakReason, Counter, CounterId, CounterRegistry, TellerBreak};
use crate::error::{QueueEngineError, Result};
use crate::events::{
    CounterDisplay, EventBroadcaster, PositionUrgency, QueueEvent, TicketDisplay,
};
use crate::notify::{Notification, NotificationChannel, NotificationKind, NotificationSink};
use crate::queue::{
    dynamic_service_time_mins, estimated_wait_mins, next_call_estimate_mins, position_of,
    rank_waiting,
};
use crate::store::TicketStore;
use crate::ticket::{
    CheckinRequest, Ticket, TicketAction, TicketHistoryEntry, TicketId, TicketPriority,
    TicketSequencer, TicketStatus, SYSTEM_ACTOR_ID,
};

use super::types::{
    BranchSnapshot, CheckinReceipt, ClaimedTicket, CounterView, DayTotals, ServiceQueueStats,
    TicketPositionInfo, WaitingTicketView,
};

/// Orchestrator of the ticket lifecycle for every branch
pub struct DispatchEngine {
    config: QueueEngineConfig,
    store: Arc<dyn TicketStore>,
    branches: Arc<BranchRegistry>,
    counters: Arc<CounterRegistry>,
    broadcaster: Arc<EventBroadcaster>,
    sink: Arc<dyn NotificationSink>,
    sequencer: TicketSequencer,
    /// One mutex per branch: the serialization boundary for mutations
    branch_locks: DashMap<BranchId, Arc<Mutex<()>>>,
    /// Tickets already sent their "almost your turn" message
    almost_notified: DashMap<TicketId, ()>,
}

impl DispatchEngine {
    pub fn new(
        config: QueueEngineConfig,
        store: Arc<dyn TicketStore>,
        sink: Arc<dyn NotificationSink>,
    ) -> Result<Arc<Self>> {
        config
            .validate()
            .map_err(QueueEngineError::configuration)?;

        let broadcaster = Arc::new(EventBroadcaster::new(config.general.event_channel_capacity));
        info!("🏦 Dispatch engine created ({})", config.general.deployment_name);

        Ok(Arc::new(Self {
            config,
            store,
            branches: Arc::new(BranchRegistry::new()),
            counters: Arc::new(CounterRegistry::new()),
            broadcaster,
            sink,
            sequencer: TicketSequencer::new(),
            branch_locks: DashMap::new(),
            almost_notified: DashMap::new(),
        }))
    }

    pub fn config(&self) -> &QueueEngineConfig {
        &self.config
    }

    pub fn branches(&self) -> &Arc<BranchRegistry> {
        &self.branches
    }

    pub fn counters(&self) -> &Arc<CounterRegistry> {
        &self.counters
    }

    pub fn broadcaster(&self) -> &Arc<EventBroadcaster> {
        &self.broadcaster
    }

    pub fn store(&self) -> &Arc<dyn TicketStore> {
        &self.store
    }

    // ========================================================================
    // Ticket lifecycle operations
    // ========================================================================

    /// Check a customer in and issue a ticket.
    pub async fn checkin(&self, req: CheckinRequest) -> Result<CheckinReceipt> {
        let service = self.branches.service(&req.service_category_id)?;
        if service.branch_id != req.branch_id {
            return Err(QueueEngineError::not_found(format!(
                "Service {} does not belong to branch {}",
                service.name, req.branch_id
            )));
        }
        if !service.is_active {
            return Err(QueueEngineError::invalid_transition(format!(
                "Service {} is not accepting tickets",
                service.name
            )));
        }

        let mutex = self.branch_mutex(&req.branch_id);
        let _guard = mutex.lock().await;

        // Queue status is validated under the lock so a racing pause wins
        let branch = self.branches.branch(&req.branch_id)?;
        match branch.queue_status {
            QueueStatus::Open => {}
            QueueStatus::Paused => {
                return Err(QueueEngineError::queue_paused(format!(
                    "Branch {} is not taking new tickets right now",
                    branch.name
                )))
            }
            QueueStatus::Closed => {
                return Err(QueueEngineError::queue_closed(format!(
                    "Branch {} is closed",
                    branch.name
                )))
            }
        }

        let now = Utc::now();
        let day_start = branch.local_day_start(now);

        let mut waiting = self
            .store
            .tickets_with_status(&branch.id, TicketStatus::Waiting, day_start)
            .await?;
        if waiting.len() >= self.config.queues.max_queue_size {
            return Err(QueueEngineError::QueueFull(format!(
                "Branch {} queue is at capacity ({})",
                branch.name,
                waiting.len()
            )));
        }

        let number = self
            .sequencer
            .next_number(
                self.store.as_ref(),
                &branch.id,
                &service.prefix,
                &branch.local_date_key(now),
                day_start,
            )
            .await?;

        let ticket = Ticket::new(&req, number, now);
        let history = TicketHistoryEntry::new(
            ticket.id.clone(),
            TicketAction::Created,
            None,
            serde_json::json!({ "method": req.checkin_method.as_str() }),
            now,
        );
        self.store.insert_ticket(&ticket, &history).await?;

        waiting.push(ticket.clone());
        rank_waiting(&mut waiting);
        let position = position_of(&waiting, &ticket.id).unwrap_or(waiting.len()) as u32;

        let avg = self.service_avg_mins(&service).await?;
        let open = self
            .counters
            .open_counters_for_service(&branch.id, &service.id);
        let estimate = estimated_wait_mins(position as usize, open, avg);

        info!(
            "🎫 Ticket {} issued at {} (position {}, ~{} min)",
            ticket.ticket_number, branch.name, position, estimate
        );

        self.broadcaster.publish(&QueueEvent::TicketCreated {
            branch_id: branch.id.clone(),
            ticket: ticket_display(&ticket, &service.name, Some(position), Some(estimate), None),
        });
        self.broadcaster.publish(&QueueEvent::QueueUpdated {
            branch_id: branch.id.clone(),
            waiting_count: waiting.len(),
        });

        self.deliver(
            NotificationKind::Confirmation,
            &ticket,
            &branch,
            Some(&service.name),
            None,
            Some(position),
            Some(estimate),
        )
        .await;

        Ok(CheckinReceipt {
            ticket,
            position,
            estimated_wait_mins: estimate,
        })
    }

    /// Claim the highest-ranked eligible waiting ticket for a counter.
    pub async fn call_next(&self, counter_id: &CounterId, teller_id: &str) -> Result<ClaimedTicket> {
        self.call_next_filtered(counter_id, teller_id, None).await
    }

    /// Claim the next ticket of one specific service the counter is assigned to.
    pub async fn call_next_by_service(
        &self,
        counter_id: &CounterId,
        service_id: &ServiceId,
        teller_id: &str,
    ) -> Result<ClaimedTicket> {
        let counter = self.counters.get(counter_id)?;
        if !counter.serves(service_id) {
            return Err(QueueEngineError::invalid_transition(format!(
                "Counter {} is not assigned to this service",
                counter.number
            )));
        }
        self.call_next_filtered(counter_id, teller_id, Some(service_id))
            .await
    }

    async fn call_next_filtered(
        &self,
        counter_id: &CounterId,
        teller_id: &str,
        only_service: Option<&ServiceId>,
    ) -> Result<ClaimedTicket> {
        let branch_id = self.counters.get(counter_id)?.branch_id;
        let branch = self.branches.branch(&branch_id)?;

        let mutex = self.branch_mutex(&branch_id);
        let _guard = mutex.lock().await;

        // Counter state is re-read under the lock
        let counter = self.counters.get(counter_id)?;
        if !counter.is_free() {
            return Err(QueueEngineError::invalid_transition(format!(
                "Counter {} is not free to call the next ticket",
                counter.number
            )));
        }

        let now = Utc::now();
        let day_start = branch.local_day_start(now);

        let mut attempt = 0;
        let claimed = loop {
            let mut waiting = self
                .store
                .tickets_with_status(&branch.id, TicketStatus::Waiting, day_start)
                .await?;
            rank_waiting(&mut waiting);

            let candidate = waiting.iter().find(|t| {
                counter.serves(&t.service_category_id)
                    && only_service.map_or(true, |sid| &t.service_category_id == sid)
            });
            let Some(candidate) = candidate else {
                return Err(QueueEngineError::no_eligible_ticket(format!(
                    "No waiting ticket eligible for counter {}",
                    counter.number
                )));
            };

            // Call auto-starts service; both timestamps are stamped together
            let mut updated = candidate.clone();
            updated.status = TicketStatus::Serving;
            updated.counter_id = Some(counter.id.clone());
            updated.served_by_user_id = Some(teller_id.to_string());
            updated.called_at = Some(now);
            updated.serving_started_at = Some(now);

            let history = TicketHistoryEntry::new(
                updated.id.clone(),
                TicketAction::Called,
                Some(teller_id.to_string()),
                serde_json::json!({ "counter": counter.number }),
                now,
            );
            if self
                .store
                .update_ticket_if_status(&updated, TicketStatus::Waiting, &history)
                .await?
            {
                break updated;
            }

            attempt += 1;
            if attempt > 1 {
                return Err(QueueEngineError::concurrent_modification(format!(
                    "Ticket {} was claimed elsewhere twice in a row",
                    candidate.ticket_number
                )));
            }
            warn!(
                "⚠️ Claim race on ticket {}, retrying against a fresh snapshot",
                candidate.ticket_number
            );
        };

        if let Err(e) = self
            .counters
            .set_current_ticket(counter_id, claimed.id.clone())
        {
            // Compensating rollback: the ticket goes back to the queue with
            // its original check-in time, as a transfer-back would.
            error!(
                "🚨 Counter {} rejected claim of {}: {} — requeueing ticket",
                counter.number, claimed.ticket_number, e
            );
            let mut revert = claimed.clone();
            revert.status = TicketStatus::Waiting;
            revert.counter_id = None;
            revert.served_by_user_id = None;
            revert.called_at = None;
            revert.serving_started_at = None;
            let history = TicketHistoryEntry::new(
                revert.id.clone(),
                TicketAction::Transferred,
                Some(teller_id.to_string()),
                serde_json::json!({ "rollback": "call_next" }),
                now,
            );
            self.store
                .update_ticket_if_status(&revert, TicketStatus::Serving, &history)
                .await?;
            return Err(e);
        }

        self.almost_notified.remove(&claimed.id);

        let service = self.branches.service(&claimed.service_category_id)?;
        info!(
            "📣 Ticket {} called to counter {} by {}",
            claimed.ticket_number, counter.number, teller_id
        );

        let display = ticket_display(&claimed, &service.name, None, None, Some(counter.number));
        self.broadcaster.publish(&QueueEvent::TicketCalled {
            branch_id: branch.id.clone(),
            ticket: display.clone(),
            counter_number: counter.number,
        });
        self.broadcaster.publish(&QueueEvent::TicketServing {
            branch_id: branch.id.clone(),
            ticket: display,
            counter_number: counter.number,
        });
        self.broadcaster.publish(&QueueEvent::CounterUpdated {
            branch_id: branch.id.clone(),
            counter: CounterDisplay {
                counter_number: counter.number,
                status: counter.status,
                current_ticket_number: Some(claimed.ticket_number.clone()),
            },
        });

        self.refresh_queue(&branch, now).await?;

        self.deliver(
            NotificationKind::YourTurn,
            &claimed,
            &branch,
            Some(&service.name),
            Some(counter.number),
            None,
            None,
        )
        .await;

        Ok(ClaimedTicket {
            ticket: claimed,
            counter_number: counter.number,
        })
    }

    /// Finish serving a ticket and free its counter.
    pub async fn complete_ticket(
        &self,
        ticket_id: &TicketId,
        teller_id: &str,
        notes: Option<String>,
    ) -> Result<Ticket> {
        self.finish_ticket(
            ticket_id,
            teller_id,
            TicketStatus::Completed,
            TicketAction::Completed,
            notes,
        )
        .await
    }

    /// Record that a called customer never arrived.
    pub async fn mark_no_show(&self, ticket_id: &TicketId, teller_id: &str) -> Result<Ticket> {
        self.finish_ticket(
            ticket_id,
            teller_id,
            TicketStatus::NoShow,
            TicketAction::NoShow,
            None,
        )
        .await
    }

    async fn finish_ticket(
        &self,
        ticket_id: &TicketId,
        teller_id: &str,
        target: TicketStatus,
        action: TicketAction,
        notes: Option<String>,
    ) -> Result<Ticket> {
        let ticket = self.fetch_ticket(ticket_id).await?;
        let branch = self.branches.branch(&ticket.branch_id)?;

        let mutex = self.branch_mutex(&branch.id);
        let _guard = mutex.lock().await;

        let ticket = self.fetch_ticket(ticket_id).await?;
        if !ticket.status.can_transition_to(target) {
            return Err(QueueEngineError::invalid_transition(format!(
                "Cannot move ticket {} from {} to {}",
                ticket.ticket_number, ticket.status, target
            )));
        }
        if ticket.served_by_user_id.as_deref() != Some(teller_id) {
            return Err(QueueEngineError::invalid_transition(format!(
                "Ticket {} is not being served by this teller",
                ticket.ticket_number
            )));
        }

        let now = Utc::now();
        let freed_counter = ticket.counter_id.clone();

        let mut updated = ticket.clone();
        updated.status = target;
        updated.counter_id = None;
        if target == TicketStatus::Completed {
            updated.completed_at = Some(now);
            if notes.is_some() {
                updated.notes = notes;
            }
        }

        let history = TicketHistoryEntry::new(
            updated.id.clone(),
            action,
            Some(teller_id.to_string()),
            serde_json::json!({}),
            now,
        );
        if !self
            .store
            .update_ticket_if_status(&updated, ticket.status, &history)
            .await?
        {
            return Err(QueueEngineError::concurrent_modification(format!(
                "Ticket {} changed while finishing it",
                ticket.ticket_number
            )));
        }

        let counter_number = self.release_counter(&branch.id, freed_counter.as_ref())?;

        let service = self.branches.service(&updated.service_category_id)?;
        let display = ticket_display(&updated, &service.name, None, None, counter_number);
        match target {
            TicketStatus::Completed => {
                let service_time = updated.service_time_mins().unwrap_or(0);
                info!(
                    "✅ Ticket {} completed in {} min",
                    updated.ticket_number, service_time
                );
                self.broadcaster.publish(&QueueEvent::TicketCompleted {
                    branch_id: branch.id.clone(),
                    ticket: display,
                    service_time_mins: service_time,
                });
            }
            _ => {
                info!("🚫 Ticket {} marked no-show", updated.ticket_number);
                self.broadcaster.publish(&QueueEvent::TicketNoShow {
                    branch_id: branch.id.clone(),
                    ticket: display,
                });
            }
        }

        let waiting = self
            .store
            .tickets_with_status(&branch.id, TicketStatus::Waiting, branch.local_day_start(now))
            .await?;
        self.broadcaster.publish(&QueueEvent::QueueUpdated {
            branch_id: branch.id.clone(),
            waiting_count: waiting.len(),
        });

        Ok(updated)
    }

    /// Move an active ticket to another service's queue.
    ///
    /// The ticket re-enters ranking with its original check-in time, so the
    /// transfer never resets its FIFO fairness.
    pub async fn transfer_ticket(
        &self,
        ticket_id: &TicketId,
        target_service_id: &ServiceId,
        actor_id: &str,
    ) -> Result<Ticket> {
        let ticket = self.fetch_ticket(ticket_id).await?;
        let branch = self.branches.branch(&ticket.branch_id)?;

        let target = self.branches.service(target_service_id)?;
        if target.branch_id != branch.id {
            return Err(QueueEngineError::not_found(format!(
                "Service {} does not belong to branch {}",
                target.name, branch.id
            )));
        }
        if !target.is_active {
            return Err(QueueEngineError::invalid_transition(format!(
                "Service {} is not accepting tickets",
                target.name
            )));
        }

        let mutex = self.branch_mutex(&branch.id);
        let _guard = mutex.lock().await;

        let ticket = self.fetch_ticket(ticket_id).await?;
        if !ticket.status.can_transition_to(TicketStatus::Waiting) {
            return Err(QueueEngineError::invalid_transition(format!(
                "Cannot transfer ticket {} from {}",
                ticket.ticket_number, ticket.status
            )));
        }

        let now = Utc::now();
        let from_service = self.branches.service(&ticket.service_category_id)?;
        let freed_counter = ticket.counter_id.clone();

        let mut updated = ticket.clone();
        updated.status = TicketStatus::Waiting;
        updated.service_category_id = target.id.clone();
        updated.counter_id = None;
        updated.served_by_user_id = None;
        updated.called_at = None;
        updated.serving_started_at = None;

        let history = TicketHistoryEntry::new(
            updated.id.clone(),
            TicketAction::Transferred,
            Some(actor_id.to_string()),
            serde_json::json!({
                "from_service": from_service.id.as_str(),
                "to_service": target.id.as_str(),
            }),
            now,
        );
        if !self
            .store
            .update_ticket_if_status(&updated, ticket.status, &history)
            .await?
        {
            return Err(QueueEngineError::concurrent_modification(format!(
                "Ticket {} changed while transferring it",
                ticket.ticket_number
            )));
        }

        self.release_counter(&branch.id, freed_counter.as_ref())?;

        info!(
            "🔀 Ticket {} transferred {} -> {}",
            updated.ticket_number, from_service.name, target.name
        );
        self.broadcaster.publish(&QueueEvent::TicketTransferred {
            branch_id: branch.id.clone(),
            ticket: ticket_display(&updated, &target.name, None, None, None),
            from_service_name: from_service.name.clone(),
            to_service_name: target.name.clone(),
        });

        self.refresh_queue(&branch, now).await?;
        Ok(updated)
    }

    /// Withdraw a waiting ticket.
    pub async fn cancel_ticket(&self, ticket_id: &TicketId, actor_id: &str) -> Result<Ticket> {
        let ticket = self.fetch_ticket(ticket_id).await?;
        let branch = self.branches.branch(&ticket.branch_id)?;

        let mutex = self.branch_mutex(&branch.id);
        let _guard = mutex.lock().await;

        let ticket = self.fetch_ticket(ticket_id).await?;
        if !ticket.status.can_transition_to(TicketStatus::Cancelled) {
            return Err(QueueEngineError::invalid_transition(format!(
                "Cannot cancel ticket {} from {}",
                ticket.ticket_number, ticket.status
            )));
        }

        let now = Utc::now();
        let mut updated = ticket.clone();
        updated.status = TicketStatus::Cancelled;

        let history = TicketHistoryEntry::new(
            updated.id.clone(),
            TicketAction::Cancelled,
            Some(actor_id.to_string()),
            serde_json::json!({}),
            now,
        );
        if !self
            .store
            .update_ticket_if_status(&updated, TicketStatus::Waiting, &history)
            .await?
        {
            return Err(QueueEngineError::concurrent_modification(format!(
                "Ticket {} changed while cancelling it",
                ticket.ticket_number
            )));
        }

        self.almost_notified.remove(&updated.id);
        info!("🗑️ Ticket {} cancelled", updated.ticket_number);

        self.refresh_queue(&branch, now).await?;
        Ok(updated)
    }

    /// Make a waiting ticket next in line by promoting it to vip.
    pub async fn bump_priority(
        &self,
        ticket_id: &TicketId,
        actor_id: &str,
        reason: Option<String>,
    ) -> Result<Ticket> {
        let ticket = self.fetch_ticket(ticket_id).await?;
        let branch = self.branches.branch(&ticket.branch_id)?;

        let mutex = self.branch_mutex(&branch.id);
        let _guard = mutex.lock().await;

        let ticket = self.fetch_ticket(ticket_id).await?;
        if ticket.status != TicketStatus::Waiting {
            return Err(QueueEngineError::invalid_transition(format!(
                "Only waiting tickets can be prioritized, ticket {} is {}",
                ticket.ticket_number, ticket.status
            )));
        }
        if ticket.priority == TicketPriority::Vip {
            return Err(QueueEngineError::invalid_transition(format!(
                "Ticket {} is already prioritized",
                ticket.ticket_number
            )));
        }

        let now = Utc::now();
        let mut updated = ticket.clone();
        updated.priority = TicketPriority::Vip;
        updated.prioritized_by = Some(actor_id.to_string());
        updated.prioritized_at = Some(now);
        updated.priority_reason = reason.clone();

        let history = TicketHistoryEntry::new(
            updated.id.clone(),
            TicketAction::PriorityBumped,
            Some(actor_id.to_string()),
            serde_json::json!({ "reason": reason }),
            now,
        );
        if !self
            .store
            .update_ticket_if_status(&updated, TicketStatus::Waiting, &history)
            .await?
        {
            return Err(QueueEngineError::concurrent_modification(format!(
                "Ticket {} changed while prioritizing it",
                ticket.ticket_number
            )));
        }

        let service = self.branches.service(&updated.service_category_id)?;
        info!("⭐ Ticket {} bumped by {}", updated.ticket_number, actor_id);
        self.broadcaster.publish(&QueueEvent::TicketPrioritized {
            branch_id: branch.id.clone(),
            ticket: ticket_display(&updated, &service.name, None, None, None),
        });

        self.refresh_queue(&branch, now).await?;
        Ok(updated)
    }

    // ========================================================================
    // Queue-level operations
    // ========================================================================

    /// Stop accepting check-ins without closing the branch.
    pub async fn pause_queue(&self, branch_id: &BranchId, actor_id: &str) -> Result<()> {
        let mutex = self.branch_mutex(branch_id);
        let _guard = mutex.lock().await;

        let now = Utc::now();
        self.branches.update_branch(branch_id, |branch| {
            if branch.queue_status != QueueStatus::Open {
                return Err(QueueEngineError::invalid_transition(format!(
                    "Branch {} queue is {}",
                    branch.name, branch.queue_status
                )));
            }
            branch.queue_status = QueueStatus::Paused;
            branch.queue_paused_at = Some(now);
            branch.queue_paused_by = Some(actor_id.to_string());
            Ok(())
        })?;

        info!("⏸️ Queue paused for branch {} by {}", branch_id, actor_id);
        self.broadcaster.publish(&QueueEvent::QueuePaused {
            branch_id: branch_id.clone(),
            paused_by: actor_id.to_string(),
        });
        Ok(())
    }

    /// Resume a paused queue.
    pub async fn resume_queue(&self, branch_id: &BranchId, actor_id: &str) -> Result<()> {
        let mutex = self.branch_mutex(branch_id);
        let _guard = mutex.lock().await;

        self.branches.update_branch(branch_id, |branch| {
            if branch.queue_status != QueueStatus::Paused {
                return Err(QueueEngineError::invalid_transition(format!(
                    "Branch {} queue is {}, not paused",
                    branch.name, branch.queue_status
                )));
            }
            branch.queue_status = QueueStatus::Open;
            branch.queue_paused_at = None;
            branch.queue_paused_by = None;
            Ok(())
        })?;

        info!("▶️ Queue resumed for branch {} by {}", branch_id, actor_id);
        self.broadcaster.publish(&QueueEvent::QueueResumed {
            branch_id: branch_id.clone(),
        });
        Ok(())
    }

    /// Cancel every outstanding ticket and restart today's numbering.
    pub async fn reset_queue(&self, branch_id: &BranchId, actor_id: &str) -> Result<usize> {
        let branch = self.branches.branch(branch_id)?;

        let mutex = self.branch_mutex(branch_id);
        let _guard = mutex.lock().await;

        let now = Utc::now();
        let cancelled = self
            .cancel_outstanding(&branch, actor_id, true, now)
            .await?;
        self.sequencer
            .reset_day(branch_id, &branch.local_date_key(now));

        info!(
            "🧨 Queue reset for branch {} ({} tickets cancelled)",
            branch.name, cancelled
        );
        self.broadcaster.publish(&QueueEvent::QueueReset {
            branch_id: branch_id.clone(),
            cancelled_tickets: cancelled,
        });
        self.broadcaster.publish(&QueueEvent::QueueUpdated {
            branch_id: branch_id.clone(),
            waiting_count: 0,
        });
        Ok(cancelled)
    }

    // ========================================================================
    // Counter operations
    // ========================================================================

    /// Open a counter for service.
    pub async fn open_counter(&self, counter_id: &CounterId) -> Result<Counter> {
        let branch_id = self.counters.get(counter_id)?.branch_id;
        let mutex = self.branch_mutex(&branch_id);
        let _guard = mutex.lock().await;

        let counter = self.counters.open(counter_id)?;
        info!("🟢 Counter {} opened", counter.number);
        self.publish_counter(&counter, None);
        self.refresh_queue(&self.branches.branch(&branch_id)?, Utc::now())
            .await?;
        Ok(counter)
    }

    /// Close a counter. Rejected while it still has an active ticket.
    pub async fn close_counter(&self, counter_id: &CounterId) -> Result<Counter> {
        let branch_id = self.counters.get(counter_id)?.branch_id;
        let mutex = self.branch_mutex(&branch_id);
        let _guard = mutex.lock().await;

        let counter = self.counters.close(counter_id)?;
        info!("🔴 Counter {} closed", counter.number);
        self.publish_counter(&counter, None);
        self.refresh_queue(&self.branches.branch(&branch_id)?, Utc::now())
            .await?;
        Ok(counter)
    }

    /// Start a timed break on a counter.
    pub async fn start_break(
        &self,
        counter_id: &CounterId,
        reason: BreakReason,
        duration_mins: u32,
    ) -> Result<TellerBreak> {
        let branch_id = self.counters.get(counter_id)?.branch_id;
        let mutex = self.branch_mutex(&branch_id);
        let _guard = mutex.lock().await;

        let now = Utc::now();
        let (counter, teller_break) =
            self.counters
                .start_break(counter_id, reason, duration_mins, now)?;
        self.publish_counter(&counter, None);
        self.refresh_queue(&self.branches.branch(&branch_id)?, now)
            .await?;
        Ok(teller_break)
    }

    /// End a counter's break and reopen it.
    pub async fn end_break(&self, counter_id: &CounterId) -> Result<Counter> {
        let branch_id = self.counters.get(counter_id)?.branch_id;
        let mutex = self.branch_mutex(&branch_id);
        let _guard = mutex.lock().await;

        let counter = self.counters.end_break(counter_id)?;
        self.publish_counter(&counter, None);
        self.refresh_queue(&self.branches.branch(&branch_id)?, Utc::now())
            .await?;
        Ok(counter)
    }

    /// Push a break's expected end further out.
    pub async fn extend_break(&self, counter_id: &CounterId, additional_mins: u32) -> Result<Counter> {
        let branch_id = self.counters.get(counter_id)?.branch_id;
        let mutex = self.branch_mutex(&branch_id);
        let _guard = mutex.lock().await;

        let counter = self.counters.extend_break(counter_id, additional_mins)?;
        self.publish_counter(&counter, None);
        Ok(counter)
    }

    // ========================================================================
    // Reads (no branch lock)
    // ========================================================================

    /// Build the full queue view for displays and dashboards.
    pub async fn branch_snapshot(&self, branch_id: &BranchId) -> Result<BranchSnapshot> {
        let branch = self.branches.branch(branch_id)?;
        let now = Utc::now();
        let day_start = branch.local_day_start(now);

        let mut waiting = self
            .store
            .tickets_with_status(branch_id, TicketStatus::Waiting, day_start)
            .await?;
        rank_waiting(&mut waiting);

        let mut loads: HashMap<ServiceId, (u32, usize)> = HashMap::new();
        let mut waiting_views = Vec::with_capacity(waiting.len());
        for (index, ticket) in waiting.iter().enumerate() {
            let service = self.branches.service(&ticket.service_category_id)?;
            let (avg, open) = self.service_load(&mut loads, branch_id, &service).await?;
            let position = index as u32 + 1;
            waiting_views.push(WaitingTicketView {
                ticket_id: ticket.id.clone(),
                ticket_number: ticket.ticket_number.clone(),
                service_id: service.id.clone(),
                service_name: service.name.clone(),
                priority: ticket.priority,
                created_at: ticket.created_at,
                position,
                estimated_wait_mins: estimated_wait_mins(position as usize, open, avg),
            });
        }

        let active = self.store.active_tickets(branch_id).await?;
        let by_counter: HashMap<&CounterId, &Ticket> = active
            .iter()
            .filter_map(|t| t.counter_id.as_ref().map(|c| (c, t)))
            .collect();

        let counters = self.counters.branch_counters(branch_id);
        let counter_views = counters
            .iter()
            .map(|c| CounterView {
                counter_id: c.id.clone(),
                number: c.number,
                status: c.status,
                assigned_user_id: c.assigned_user_id.clone(),
                current_ticket_number: by_counter.get(&c.id).map(|t| t.ticket_number.clone()),
                on_break_until: c.active_break.as_ref().map(|b| b.expected_end),
            })
            .collect();

        let mut service_stats = Vec::new();
        for service in self.branches.active_services(branch_id) {
            let (avg, open) = self.service_load(&mut loads, branch_id, &service).await?;
            let in_service: Vec<&WaitingTicketView> = waiting_views
                .iter()
                .filter(|v| v.service_id == service.id)
                .collect();
            service_stats.push(ServiceQueueStats {
                service_id: service.id.clone(),
                name: service.name.clone(),
                prefix: service.prefix.clone(),
                waiting_count: in_service.len(),
                avg_service_time_mins: avg,
                estimated_wait_mins: estimated_wait_mins(in_service.len() + 1, open, avg),
                next_call_estimate_mins: next_call_estimate_mins(open, avg),
                next_ticket_numbers: in_service
                    .iter()
                    .take(3)
                    .map(|v| v.ticket_number.clone())
                    .collect(),
            });
        }

        let completed = self.store.completed_since(branch_id, day_start).await?;
        let no_shows = self
            .store
            .tickets_with_status(branch_id, TicketStatus::NoShow, day_start)
            .await?;
        let answered: Vec<i64> = completed
            .iter()
            .filter_map(|t| t.answered_wait_mins())
            .collect();
        let avg_completed_wait_mins = if answered.is_empty() {
            None
        } else {
            Some(answered.iter().sum::<i64>() / answered.len() as i64)
        };

        Ok(BranchSnapshot {
            branch_id: branch_id.clone(),
            queue_status: branch.queue_status,
            generated_at: now,
            counters: counter_views,
            counter_stats: self.counters.stats(branch_id),
            waiting: waiting_views,
            services: service_stats,
            totals: DayTotals {
                waiting: waiting.len(),
                served: completed.len(),
                no_shows: no_shows.len(),
                avg_completed_wait_mins,
            },
        })
    }

    /// Where a single ticket stands right now.
    pub async fn ticket_position(&self, ticket_id: &TicketId) -> Result<TicketPositionInfo> {
        let ticket = self.fetch_ticket(ticket_id).await?;
        let branch = self.branches.branch(&ticket.branch_id)?;

        let counter_number = match &ticket.counter_id {
            Some(counter_id) => Some(self.counters.get(counter_id)?.number),
            None => None,
        };

        if ticket.status != TicketStatus::Waiting {
            return Ok(TicketPositionInfo {
                ticket_id: ticket.id.clone(),
                ticket_number: ticket.ticket_number.clone(),
                status: ticket.status,
                position: None,
                estimated_wait_mins: None,
                urgency: None,
                counter_number,
            });
        }

        let now = Utc::now();
        let mut waiting = self
            .store
            .tickets_with_status(&branch.id, TicketStatus::Waiting, branch.local_day_start(now))
            .await?;
        rank_waiting(&mut waiting);
        let position = position_of(&waiting, &ticket.id)
            .ok_or_else(|| {
                QueueEngineError::internal(format!(
                    "Waiting ticket {} missing from its own queue",
                    ticket.ticket_number
                ))
            })? as u32;

        let service = self.branches.service(&ticket.service_category_id)?;
        let avg = self.service_avg_mins(&service).await?;
        let open = self
            .counters
            .open_counters_for_service(&branch.id, &service.id);

        Ok(TicketPositionInfo {
            ticket_id: ticket.id.clone(),
            ticket_number: ticket.ticket_number.clone(),
            status: ticket.status,
            position: Some(position),
            estimated_wait_mins: Some(estimated_wait_mins(position as usize, open, avg)),
            urgency: Some(PositionUrgency::for_position(position)),
            counter_number,
        })
    }

    // ========================================================================
    // Alerts and scheduling
    // ========================================================================

    /// Evaluate the branch's operational alerts and publish them.
    ///
    /// Evaluation failures degrade to an empty alert set rather than blocking
    /// dispatch.
    pub async fn evaluate_branch_alerts(&self, branch_id: &BranchId) -> Vec<Alert> {
        match self.try_evaluate_alerts(branch_id).await {
            Ok(alerts) => alerts,
            Err(e) => {
                warn!("⚠️ Alert evaluation failed for {}: {}", branch_id, e);
                Vec::new()
            }
        }
    }

    async fn try_evaluate_alerts(&self, branch_id: &BranchId) -> Result<Vec<Alert>> {
        let branch = self.branches.branch(branch_id)?;
        let now = Utc::now();
        let day_start = branch.local_day_start(now);

        let waiting = self
            .store
            .tickets_with_status(branch_id, TicketStatus::Waiting, day_start)
            .await?;
        let completed = self.store.completed_since(branch_id, day_start).await?;

        let mut per_teller: HashMap<String, Vec<i64>> = HashMap::new();
        for ticket in &completed {
            if let (Some(user), Some(mins)) =
                (ticket.served_by_user_id.clone(), ticket.service_time_mins())
            {
                per_teller.entry(user).or_default().push(mins);
            }
        }
        let mut teller_stats: Vec<TellerServiceStat> = per_teller
            .into_iter()
            .map(|(user_id, samples)| TellerServiceStat {
                avg_service_mins: samples.iter().sum::<i64>() / samples.len() as i64,
                completed_today: samples.len(),
                user_id,
            })
            .collect();
        teller_stats.sort_by(|a, b| a.user_id.cmp(&b.user_id));

        let breaks = self.counters.active_breaks(branch_id);

        let alerts = alerts::evaluate(
            &AlertInputs {
                branch_id,
                now,
                waiting: &waiting,
                teller_stats: &teller_stats,
                breaks: &breaks,
            },
            &self.config.alerts.thresholds(),
        );

        debug!("🚨 {} alerts for branch {}", alerts.len(), branch_id);
        self.broadcaster.publish(&QueueEvent::AlertsUpdated {
            branch_id: branch_id.clone(),
            alerts: alerts.clone(),
            evaluated_at: now,
        });
        Ok(alerts)
    }

    /// Apply operating hours across all branches: auto-open at opening time,
    /// auto-close (cancelling leftovers) at closing time.
    pub async fn run_schedule_tick(&self, now: DateTime<Utc>) {
        for branch_id in self.branches.branch_ids() {
            if let Err(e) = self.check_branch_schedule(&branch_id, now).await {
                warn!("⚠️ Schedule check failed for {}: {}", branch_id, e);
            }
        }
    }

    async fn check_branch_schedule(&self, branch_id: &BranchId, now: DateTime<Utc>) -> Result<()> {
        let branch = self.branches.branch(branch_id)?;
        if !branch.auto_schedule_enabled {
            return Ok(());
        }
        let Some(hours) = branch.operating_hours.clone() else {
            return Ok(());
        };

        let (local_time, weekday) = branch.local_time(now);
        let weekend = matches!(weekday, Weekday::Sat | Weekday::Sun);
        let within_hours = !(hours.closed_on_weekends && weekend)
            && local_time >= hours.opening
            && local_time < hours.closing;

        match (within_hours, branch.queue_status) {
            (true, QueueStatus::Closed) => self.auto_open(&branch, now).await,
            (false, status) if status != QueueStatus::Closed => self.auto_close(&branch, now).await,
            // Already in the right state, including manual pauses during hours
            _ => Ok(()),
        }
    }

    async fn auto_open(&self, branch: &Branch, now: DateTime<Utc>) -> Result<()> {
        let mutex = self.branch_mutex(&branch.id);
        let _guard = mutex.lock().await;

        self.branches.update_branch(&branch.id, |b| {
            b.queue_status = QueueStatus::Open;
            b.queue_paused_at = None;
            b.queue_paused_by = None;
            Ok(())
        })?;
        self.sequencer
            .reset_day(&branch.id, &branch.local_date_key(now));

        info!("🔓 Branch {} auto-opened", branch.name);
        self.broadcaster.publish(&QueueEvent::QueueAutoOpened {
            branch_id: branch.id.clone(),
        });
        Ok(())
    }

    async fn auto_close(&self, branch: &Branch, now: DateTime<Utc>) -> Result<()> {
        let mutex = self.branch_mutex(&branch.id);
        let _guard = mutex.lock().await;

        self.branches.update_branch(&branch.id, |b| {
            b.queue_status = QueueStatus::Closed;
            Ok(())
        })?;
        // Tickets left waiting at closing time are cancelled as system actions
        let cancelled = self
            .cancel_outstanding(branch, SYSTEM_ACTOR_ID, false, now)
            .await?;

        info!(
            "🔒 Branch {} auto-closed ({} tickets cancelled)",
            branch.name, cancelled
        );
        self.broadcaster.publish(&QueueEvent::QueueAutoClosed {
            branch_id: branch.id.clone(),
            cancelled_tickets: cancelled,
        });
        Ok(())
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn branch_mutex(&self, branch_id: &BranchId) -> Arc<Mutex<()>> {
        self.branch_locks
            .entry(branch_id.clone())
            .or_default()
            .clone()
    }

    async fn fetch_ticket(&self, ticket_id: &TicketId) -> Result<Ticket> {
        self.store
            .ticket(ticket_id)
            .await?
            .ok_or_else(|| QueueEngineError::not_found(format!("Ticket not found: {}", ticket_id)))
    }

    /// Average service minutes in effect for a service right now
    async fn service_avg_mins(&self, service: &ServiceCategory) -> Result<u32> {
        let est = &self.config.estimator;
        let manual = if service.avg_service_time_mins > 0 {
            service.avg_service_time_mins
        } else {
            est.default_avg_service_time_mins
        };
        if !service.use_dynamic_service_time {
            return Ok(manual);
        }

        let since = Utc::now() - Duration::hours(est.dynamic_window_hours as i64);
        let completed = self.store.completed_since(&service.branch_id, since).await?;
        let samples: Vec<i64> = completed
            .iter()
            .filter(|t| t.service_category_id == service.id)
            .filter_map(|t| t.service_time_mins())
            .collect();
        Ok(dynamic_service_time_mins(
            &samples,
            manual,
            est.dynamic_min_samples,
            est.dynamic_clamp_min_mins,
            est.dynamic_clamp_max_mins,
        ))
    }

    async fn service_load(
        &self,
        cache: &mut HashMap<ServiceId, (u32, usize)>,
        branch_id: &BranchId,
        service: &ServiceCategory,
    ) -> Result<(u32, usize)> {
        if let Some(load) = cache.get(&service.id) {
            return Ok(*load);
        }
        let avg = self.service_avg_mins(service).await?;
        let open = self
            .counters
            .open_counters_for_service(branch_id, &service.id);
        cache.insert(service.id.clone(), (avg, open));
        Ok((avg, open))
    }

    /// Recompute and publish positions and estimates after the queue changed.
    ///
    /// Runs inside the caller's critical section so the updates are emitted in
    /// commit order. Also fires the one-shot "almost your turn" notifications.
    async fn refresh_queue(&self, branch: &Branch, now: DateTime<Utc>) -> Result<()> {
        let day_start = branch.local_day_start(now);
        let mut waiting = self
            .store
            .tickets_with_status(&branch.id, TicketStatus::Waiting, day_start)
            .await?;
        rank_waiting(&mut waiting);

        let notify_at = if branch.notify_at_position > 0 {
            branch.notify_at_position
        } else {
            self.config.queues.default_notify_at_position
        };

        let mut loads: HashMap<ServiceId, (u32, usize)> = HashMap::new();
        for (index, ticket) in waiting.iter().enumerate() {
            let position = index as u32 + 1;
            let service = self.branches.service(&ticket.service_category_id)?;
            let (avg, open) = self.service_load(&mut loads, &branch.id, &service).await?;
            let estimate = estimated_wait_mins(position as usize, open, avg);

            self.broadcaster.publish(&QueueEvent::TicketPositionUpdated {
                branch_id: branch.id.clone(),
                ticket_id: ticket.id.clone(),
                position,
                estimated_wait_mins: estimate,
                urgency: PositionUrgency::for_position(position),
            });

            if position <= notify_at
                && !self.almost_notified.contains_key(&ticket.id)
            {
                self.almost_notified.insert(ticket.id.clone(), ());
                self.deliver(
                    NotificationKind::AlmostTurn,
                    ticket,
                    branch,
                    Some(&service.name),
                    None,
                    Some(position),
                    Some(estimate),
                )
                .await;
            }
        }

        self.broadcaster.publish(&QueueEvent::QueueUpdated {
            branch_id: branch.id.clone(),
            waiting_count: waiting.len(),
        });
        Ok(())
    }

    /// Cancel today's waiting tickets (and optionally the active ones)
    async fn cancel_outstanding(
        &self,
        branch: &Branch,
        actor_id: &str,
        include_active: bool,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let day_start = branch.local_day_start(now);
        let mut tickets = self
            .store
            .tickets_with_status(&branch.id, TicketStatus::Waiting, day_start)
            .await?;
        if include_active {
            tickets.extend(self.store.active_tickets(&branch.id).await?);
        }

        let mut cancelled = 0;
        for ticket in tickets {
            let freed_counter = ticket.counter_id.clone();
            let mut updated = ticket.clone();
            updated.status = TicketStatus::Cancelled;
            updated.counter_id = None;

            let history = TicketHistoryEntry::new(
                updated.id.clone(),
                TicketAction::AutoCancelled,
                Some(actor_id.to_string()),
                serde_json::json!({}),
                now,
            );
            if self
                .store
                .update_ticket_if_status(&updated, ticket.status, &history)
                .await?
            {
                cancelled += 1;
                self.almost_notified.remove(&ticket.id);
                self.release_counter(&branch.id, freed_counter.as_ref())?;
            }
        }
        Ok(cancelled)
    }

    /// Clear a counter's active ticket and publish its new state
    fn release_counter(
        &self,
        branch_id: &BranchId,
        counter_id: Option<&CounterId>,
    ) -> Result<Option<u32>> {
        let Some(counter_id) = counter_id else {
            return Ok(None);
        };
        let counter = self.counters.clear_current_ticket(counter_id)?;
        debug_assert_eq!(&counter.branch_id, branch_id);
        self.publish_counter(&counter, None);
        Ok(Some(counter.number))
    }

    fn publish_counter(&self, counter: &Counter, ticket_number: Option<String>) {
        self.broadcaster.publish(&QueueEvent::CounterUpdated {
            branch_id: counter.branch_id.clone(),
            counter: CounterDisplay {
                counter_number: counter.number,
                status: counter.status,
                current_ticket_number: ticket_number,
            },
        });
    }

    #[allow(clippy::too_many_arguments)]
    async fn deliver(
        &self,
        kind: NotificationKind,
        ticket: &Ticket,
        branch: &Branch,
        service_name: Option<&str>,
        counter_number: Option<u32>,
        position: Option<u32>,
        estimated_wait_mins: Option<u32>,
    ) {
        if !self.config.notifications.enabled
            || ticket.notification_channel == NotificationChannel::None
        {
            return;
        }
        let Some(phone) = ticket.customer_phone.clone() else {
            return;
        };

        self.sink
            .deliver(Notification {
                ticket_id: ticket.id.clone(),
                kind,
                channel: ticket.notification_channel,
                recipient: phone,
                ticket_number: ticket.ticket_number.clone(),
                branch_name: Some(branch.name.clone()),
                service_name: service_name.map(str::to_string),
                counter_number,
                position,
                estimated_wait_mins,
            })
            .await;
    }
}

fn ticket_display(
    ticket: &Ticket,
    service_name: &str,
    position: Option<u32>,
    estimated_wait_mins: Option<u32>,
    counter_number: Option<u32>,
) -> TicketDisplay {
    TicketDisplay {
        ticket_id: ticket.id.clone(),
        ticket_number: ticket.ticket_number.clone(),
        service_name: service_name.to_string(),
        status: ticket.status,
        priority: ticket.priority,
        position,
        estimated_wait_mins,
        counter_number,
    }
}
