//! Real-time event fan-out to displays, kiosks, and manager dashboards.
//!
//! Subscribers join one of three room kinds: the branch room (tellers and
//! managers), the display room (waiting-area screens), or a single ticket's
//! room (the customer's phone). The engine publishes while it still holds the
//! branch critical section, so per-branch delivery order always matches the
//! commit order of the underlying mutations.
//!
//! Payloads carry display projections only — ticket number, service name,
//! position, estimate, counter number — never the full internal record.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::alerts::Alert;
use crate::branch::BranchId;
use crate::counter::CounterStatus;
use crate::ticket::{TicketId, TicketPriority, TicketStatus};

/// How close a waiting customer is to being called
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionUrgency {
    Normal,
    Approaching,
    Imminent,
}

impl PositionUrgency {
    /// Urgency band for a 1-based queue position
    pub fn for_position(position: u32) -> Self {
        match position {
            0..=2 => PositionUrgency::Imminent,
            3..=5 => PositionUrgency::Approaching,
            _ => PositionUrgency::Normal,
        }
    }
}

/// Projection of a ticket suitable for public displays
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketDisplay {
    pub ticket_id: TicketId,
    pub ticket_number: String,
    pub service_name: String,
    pub status: TicketStatus,
    pub priority: TicketPriority,
    pub position: Option<u32>,
    pub estimated_wait_mins: Option<u32>,
    pub counter_number: Option<u32>,
}

/// Projection of a counter for displays
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CounterDisplay {
    pub counter_number: u32,
    pub status: CounterStatus,
    pub current_ticket_number: Option<String>,
}

/// State-change notification delivered to subscriber rooms
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum QueueEvent {
    #[serde(rename = "ticket:created")]
    TicketCreated {
        branch_id: BranchId,
        ticket: TicketDisplay,
    },

    #[serde(rename = "ticket:called")]
    TicketCalled {
        branch_id: BranchId,
        ticket: TicketDisplay,
        counter_number: u32,
    },

    #[serde(rename = "ticket:serving")]
    TicketServing {
        branch_id: BranchId,
        ticket: TicketDisplay,
        counter_number: u32,
    },

    #[serde(rename = "ticket:completed")]
    TicketCompleted {
        branch_id: BranchId,
        ticket: TicketDisplay,
        service_time_mins: i64,
    },

    #[serde(rename = "ticket:no_show")]
    TicketNoShow {
        branch_id: BranchId,
        ticket: TicketDisplay,
    },

    #[serde(rename = "ticket:transferred")]
    TicketTransferred {
        branch_id: BranchId,
        ticket: TicketDisplay,
        from_service_name: String,
        to_service_name: String,
    },

    #[serde(rename = "ticket:prioritized")]
    TicketPrioritized {
        branch_id: BranchId,
        ticket: TicketDisplay,
    },

    /// Fresh position after the queue ahead of this ticket moved.
    /// Delivered only to the ticket's own room.
    #[serde(rename = "ticket:position_updated")]
    TicketPositionUpdated {
        branch_id: BranchId,
        ticket_id: TicketId,
        position: u32,
        estimated_wait_mins: u32,
        urgency: PositionUrgency,
    },

    #[serde(rename = "queue:updated")]
    QueueUpdated {
        branch_id: BranchId,
        waiting_count: usize,
    },

    #[serde(rename = "counter:updated")]
    CounterUpdated {
        branch_id: BranchId,
        counter: CounterDisplay,
    },

    #[serde(rename = "queue:paused")]
    QueuePaused {
        branch_id: BranchId,
        paused_by: String,
    },

    #[serde(rename = "queue:resumed")]
    QueueResumed { branch_id: BranchId },

    #[serde(rename = "queue:reset")]
    QueueReset {
        branch_id: BranchId,
        cancelled_tickets: usize,
    },

    #[serde(rename = "queue:auto_closed")]
    QueueAutoClosed {
        branch_id: BranchId,
        cancelled_tickets: usize,
    },

    #[serde(rename = "queue:auto_opened")]
    QueueAutoOpened { branch_id: BranchId },

    #[serde(rename = "alerts:updated")]
    AlertsUpdated {
        branch_id: BranchId,
        alerts: Vec<Alert>,
        evaluated_at: DateTime<Utc>,
    },
}

impl QueueEvent {
    /// Wire name of the event, matching the serialized `event` tag
    pub fn name(&self) -> &'static str {
        match self {
            QueueEvent::TicketCreated { .. } => "ticket:created",
            QueueEvent::TicketCalled { .. } => "ticket:called",
            QueueEvent::TicketServing { .. } => "ticket:serving",
            QueueEvent::TicketCompleted { .. } => "ticket:completed",
            QueueEvent::TicketNoShow { .. } => "ticket:no_show",
            QueueEvent::TicketTransferred { .. } => "ticket:transferred",
            QueueEvent::TicketPrioritized { .. } => "ticket:prioritized",
            QueueEvent::TicketPositionUpdated { .. } => "ticket:position_updated",
            QueueEvent::QueueUpdated { .. } => "queue:updated",
            QueueEvent::CounterUpdated { .. } => "counter:updated",
            QueueEvent::QueuePaused { .. } => "queue:paused",
            QueueEvent::QueueResumed { .. } => "queue:resumed",
            QueueEvent::QueueReset { .. } => "queue:reset",
            QueueEvent::QueueAutoClosed { .. } => "queue:auto_closed",
            QueueEvent::QueueAutoOpened { .. } => "queue:auto_opened",
            QueueEvent::AlertsUpdated { .. } => "alerts:updated",
        }
    }

    /// Branch the event belongs to
    pub fn branch_id(&self) -> &BranchId {
        match self {
            QueueEvent::TicketCreated { branch_id, .. }
            | QueueEvent::TicketCalled { branch_id, .. }
            | QueueEvent::TicketServing { branch_id, .. }
            | QueueEvent::TicketCompleted { branch_id, .. }
            | QueueEvent::TicketNoShow { branch_id, .. }
            | QueueEvent::TicketTransferred { branch_id, .. }
            | QueueEvent::TicketPrioritized { branch_id, .. }
            | QueueEvent::TicketPositionUpdated { branch_id, .. }
            | QueueEvent::QueueUpdated { branch_id, .. }
            | QueueEvent::CounterUpdated { branch_id, .. }
            | QueueEvent::QueuePaused { branch_id, .. }
            | QueueEvent::QueueResumed { branch_id }
            | QueueEvent::QueueReset { branch_id, .. }
            | QueueEvent::QueueAutoClosed { branch_id, .. }
            | QueueEvent::QueueAutoOpened { branch_id }
            | QueueEvent::AlertsUpdated { branch_id, .. } => branch_id,
        }
    }

    /// Ticket whose room should also receive this event, if any
    pub fn ticket_id(&self) -> Option<&TicketId> {
        match self {
            QueueEvent::TicketCalled { ticket, .. }
            | QueueEvent::TicketServing { ticket, .. }
            | QueueEvent::TicketCompleted { ticket, .. }
            | QueueEvent::TicketNoShow { ticket, .. }
            | QueueEvent::TicketTransferred { ticket, .. }
            | QueueEvent::TicketPrioritized { ticket, .. } => Some(&ticket.ticket_id),
            QueueEvent::TicketPositionUpdated { ticket_id, .. } => Some(ticket_id),
            _ => None,
        }
    }

    /// Position updates are private to the ticket room; everything else also
    /// reaches the branch and display rooms.
    fn ticket_room_only(&self) -> bool {
        matches!(self, QueueEvent::TicketPositionUpdated { .. })
    }

    /// Terminal events after which the ticket room can be torn down
    fn closes_ticket_room(&self) -> bool {
        matches!(
            self,
            QueueEvent::TicketCompleted { .. } | QueueEvent::TicketNoShow { .. }
        )
    }
}

/// Fan-out of [`QueueEvent`]s to branch, display, and ticket rooms
pub struct EventBroadcaster {
    capacity: usize,
    branch_rooms: DashMap<BranchId, broadcast::Sender<QueueEvent>>,
    display_rooms: DashMap<BranchId, broadcast::Sender<QueueEvent>>,
    ticket_rooms: DashMap<TicketId, broadcast::Sender<QueueEvent>>,
}

impl EventBroadcaster {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            branch_rooms: DashMap::new(),
            display_rooms: DashMap::new(),
            ticket_rooms: DashMap::new(),
        }
    }

    /// Subscribe to everything that happens in a branch
    pub fn subscribe_branch(&self, branch_id: &BranchId) -> broadcast::Receiver<QueueEvent> {
        self.room(&self.branch_rooms, branch_id.clone())
    }

    /// Subscribe as a waiting-area display
    pub fn subscribe_display(&self, branch_id: &BranchId) -> broadcast::Receiver<QueueEvent> {
        self.room(&self.display_rooms, branch_id.clone())
    }

    /// Subscribe to one ticket's lifecycle (customer mobile view)
    pub fn subscribe_ticket(&self, ticket_id: &TicketId) -> broadcast::Receiver<QueueEvent> {
        self.room(&self.ticket_rooms, ticket_id.clone())
    }

    /// Deliver an event to every room it is scoped to.
    ///
    /// Lagging subscribers are the broadcast channel's problem (they observe
    /// `RecvError::Lagged`); publishing never blocks the dispatch path.
    pub fn publish(&self, event: &QueueEvent) {
        trace!("📢 {} for branch {}", event.name(), event.branch_id());

        if let Some(ticket_id) = event.ticket_id() {
            if let Some(sender) = self.ticket_rooms.get(ticket_id) {
                let _ = sender.send(event.clone());
            }
            if event.closes_ticket_room() {
                self.ticket_rooms.remove(ticket_id);
                debug!("🧹 Closed ticket room {}", ticket_id);
            }
            if event.ticket_room_only() {
                return;
            }
        }

        let branch_id = event.branch_id();
        if let Some(sender) = self.branch_rooms.get(branch_id) {
            let _ = sender.send(event.clone());
        }
        if let Some(sender) = self.display_rooms.get(branch_id) {
            let _ = sender.send(event.clone());
        }
    }

    /// Number of live ticket rooms, for monitoring
    pub fn ticket_room_count(&self) -> usize {
        self.ticket_rooms.len()
    }

    fn room<K: std::hash::Hash + Eq + Clone>(
        &self,
        rooms: &DashMap<K, broadcast::Sender<QueueEvent>>,
        key: K,
    ) -> broadcast::Receiver<QueueEvent> {
        rooms
            .entry(key)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn display(id: &str, number: &str) -> TicketDisplay {
        TicketDisplay {
            ticket_id: TicketId::from(id),
            ticket_number: number.to_string(),
            service_name: "Deposits".to_string(),
            status: TicketStatus::Waiting,
            priority: TicketPriority::Normal,
            position: Some(1),
            estimated_wait_mins: Some(10),
            counter_number: None,
        }
    }

    #[tokio::test]
    async fn branch_and_display_rooms_both_receive_queue_events() {
        let broadcaster = EventBroadcaster::new(16);
        let branch = BranchId::from("b1");
        let mut branch_rx = broadcaster.subscribe_branch(&branch);
        let mut display_rx = broadcaster.subscribe_display(&branch);

        broadcaster.publish(&QueueEvent::TicketCreated {
            branch_id: branch.clone(),
            ticket: display("t1", "A-001"),
        });

        assert_eq!(branch_rx.recv().await.unwrap().name(), "ticket:created");
        assert_eq!(display_rx.recv().await.unwrap().name(), "ticket:created");
    }

    #[tokio::test]
    async fn position_updates_stay_in_the_ticket_room() {
        let broadcaster = EventBroadcaster::new(16);
        let branch = BranchId::from("b1");
        let ticket = TicketId::from("t1");
        let mut branch_rx = broadcaster.subscribe_branch(&branch);
        let mut ticket_rx = broadcaster.subscribe_ticket(&ticket);

        broadcaster.publish(&QueueEvent::TicketPositionUpdated {
            branch_id: branch.clone(),
            ticket_id: ticket.clone(),
            position: 2,
            estimated_wait_mins: 10,
            urgency: PositionUrgency::Imminent,
        });
        broadcaster.publish(&QueueEvent::QueueUpdated {
            branch_id: branch.clone(),
            waiting_count: 3,
        });

        // The branch room never sees the private position update
        assert_eq!(branch_rx.recv().await.unwrap().name(), "queue:updated");
        assert_eq!(
            ticket_rx.recv().await.unwrap().name(),
            "ticket:position_updated"
        );
    }

    #[tokio::test]
    async fn events_arrive_in_publish_order() {
        let broadcaster = EventBroadcaster::new(16);
        let branch = BranchId::from("b1");
        let mut rx = broadcaster.subscribe_branch(&branch);

        broadcaster.publish(&QueueEvent::TicketCalled {
            branch_id: branch.clone(),
            ticket: display("t1", "A-001"),
            counter_number: 1,
        });
        broadcaster.publish(&QueueEvent::TicketCompleted {
            branch_id: branch.clone(),
            ticket: display("t1", "A-001"),
            service_time_mins: 5,
        });

        assert_eq!(rx.recv().await.unwrap().name(), "ticket:called");
        assert_eq!(rx.recv().await.unwrap().name(), "ticket:completed");
    }

    #[tokio::test]
    async fn terminal_events_tear_down_the_ticket_room() {
        let broadcaster = EventBroadcaster::new(16);
        let branch = BranchId::from("b1");
        let ticket = TicketId::from("t1");
        let _rx = broadcaster.subscribe_ticket(&ticket);
        assert_eq!(broadcaster.ticket_room_count(), 1);

        broadcaster.publish(&QueueEvent::TicketCompleted {
            branch_id: branch,
            ticket: display("t1", "A-001"),
            service_time_mins: 5,
        });
        assert_eq!(broadcaster.ticket_room_count(), 0);
    }

    #[test]
    fn urgency_bands_follow_position() {
        assert_eq!(PositionUrgency::for_position(1), PositionUrgency::Imminent);
        assert_eq!(PositionUrgency::for_position(2), PositionUrgency::Imminent);
        assert_eq!(PositionUrgency::for_position(5), PositionUrgency::Approaching);
        assert_eq!(PositionUrgency::for_position(6), PositionUrgency::Normal);
    }

    #[test]
    fn events_serialize_with_wire_names() {
        let event = QueueEvent::QueuePaused {
            branch_id: BranchId::from("b1"),
            paused_by: "mgr-1".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "queue:paused");
        assert_eq!(json["data"]["paused_by"], "mgr-1");
    }
}
