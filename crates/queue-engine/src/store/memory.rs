//! In-memory ticket store for tests and embedded deployments.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::branch::BranchId;
use crate::error::Result;
use crate::ticket::{Ticket, TicketHistoryEntry, TicketId, TicketSequencer, TicketStatus};

use super::TicketStore;

/// Ticket store over process memory.
///
/// The write lock is held across the status check and the apply, so the
/// conditional update and its history append are one atomic unit — the same
/// guarantee the sqlite store gets from a transaction.
pub struct MemoryTicketStore {
    tickets: RwLock<HashMap<TicketId, Ticket>>,
    history: RwLock<Vec<TicketHistoryEntry>>,
}

impl MemoryTicketStore {
    pub fn new() -> Self {
        Self {
            tickets: RwLock::new(HashMap::new()),
            history: RwLock::new(Vec::new()),
        }
    }
}

impl Default for MemoryTicketStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TicketStore for MemoryTicketStore {
    async fn insert_ticket(&self, ticket: &Ticket, history: &TicketHistoryEntry) -> Result<()> {
        let mut tickets = self.tickets.write();
        tickets.insert(ticket.id.clone(), ticket.clone());
        self.history.write().push(history.clone());
        Ok(())
    }

    async fn ticket(&self, id: &TicketId) -> Result<Option<Ticket>> {
        Ok(self.tickets.read().get(id).cloned())
    }

    async fn update_ticket_if_status(
        &self,
        updated: &Ticket,
        expected: TicketStatus,
        history: &TicketHistoryEntry,
    ) -> Result<bool> {
        let mut tickets = self.tickets.write();
        match tickets.get(&updated.id) {
            Some(current) if current.status == expected => {
                tickets.insert(updated.id.clone(), updated.clone());
                self.history.write().push(history.clone());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn tickets_with_status(
        &self,
        branch_id: &BranchId,
        status: TicketStatus,
        since: DateTime<Utc>,
    ) -> Result<Vec<Ticket>> {
        Ok(self
            .tickets
            .read()
            .values()
            .filter(|t| &t.branch_id == branch_id && t.status == status && t.created_at >= since)
            .cloned()
            .collect())
    }

    async fn active_tickets(&self, branch_id: &BranchId) -> Result<Vec<Ticket>> {
        Ok(self
            .tickets
            .read()
            .values()
            .filter(|t| &t.branch_id == branch_id && t.status.is_active())
            .cloned()
            .collect())
    }

    async fn completed_since(
        &self,
        branch_id: &BranchId,
        since: DateTime<Utc>,
    ) -> Result<Vec<Ticket>> {
        Ok(self
            .tickets
            .read()
            .values()
            .filter(|t| {
                &t.branch_id == branch_id
                    && t.status == TicketStatus::Completed
                    && t.completed_at.is_some_and(|at| at >= since)
            })
            .cloned()
            .collect())
    }

    async fn max_ticket_seq(
        &self,
        branch_id: &BranchId,
        prefix: &str,
        day_start: DateTime<Utc>,
    ) -> Result<u32> {
        let wanted = format!("{}-", prefix);
        Ok(self
            .tickets
            .read()
            .values()
            .filter(|t| {
                &t.branch_id == branch_id
                    && t.created_at >= day_start
                    && t.ticket_number.starts_with(&wanted)
            })
            .filter_map(|t| TicketSequencer::parse_seq(&t.ticket_number))
            .max()
            .unwrap_or(0))
    }

    async fn history(&self, ticket_id: &TicketId) -> Result<Vec<TicketHistoryEntry>> {
        Ok(self
            .history
            .read()
            .iter()
            .filter(|h| &h.ticket_id == ticket_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::branch::ServiceId;
    use crate::ticket::{CheckinRequest, TicketAction};

    fn ticket(id: &str, status: TicketStatus) -> Ticket {
        let req = CheckinRequest::kiosk(BranchId::from("b1"), ServiceId::from("s1"));
        let mut t = Ticket::new(&req, "A-001".to_string(), Utc::now());
        t.id = TicketId::from(id);
        t.status = status;
        t
    }

    fn entry(ticket_id: &str, action: TicketAction) -> TicketHistoryEntry {
        TicketHistoryEntry::new(
            TicketId::from(ticket_id),
            action,
            None,
            serde_json::json!({}),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn conditional_update_rejects_stale_status() {
        let store = MemoryTicketStore::new();
        let t = ticket("t1", TicketStatus::Waiting);
        store
            .insert_ticket(&t, &entry("t1", TicketAction::Created))
            .await
            .unwrap();

        let mut claimed = t.clone();
        claimed.status = TicketStatus::Serving;

        // First claim wins
        let ok = store
            .update_ticket_if_status(&claimed, TicketStatus::Waiting, &entry("t1", TicketAction::Called))
            .await
            .unwrap();
        assert!(ok);

        // Second claim against the stale snapshot loses and writes nothing
        let ok = store
            .update_ticket_if_status(&claimed, TicketStatus::Waiting, &entry("t1", TicketAction::Called))
            .await
            .unwrap();
        assert!(!ok);
        assert_eq!(store.history(&t.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn max_ticket_seq_scopes_by_prefix_and_day() {
        let store = MemoryTicketStore::new();
        let day_start = Utc::now() - chrono::Duration::hours(1);

        for (id, number) in [("t1", "A-004"), ("t2", "A-011"), ("t3", "B-099")] {
            let mut t = ticket(id, TicketStatus::Waiting);
            t.ticket_number = number.to_string();
            store
                .insert_ticket(&t, &entry(id, TicketAction::Created))
                .await
                .unwrap();
        }

        // Yesterday's ticket does not count
        let mut old = ticket("t4", TicketStatus::Completed);
        old.ticket_number = "A-950".to_string();
        old.created_at = day_start - chrono::Duration::days(1);
        store
            .insert_ticket(&old, &entry("t4", TicketAction::Created))
            .await
            .unwrap();

        let branch = BranchId::from("b1");
        assert_eq!(store.max_ticket_seq(&branch, "A", day_start).await.unwrap(), 11);
        assert_eq!(store.max_ticket_seq(&branch, "B", day_start).await.unwrap(), 99);
        assert_eq!(store.max_ticket_seq(&branch, "C", day_start).await.unwrap(), 0);
    }
}
