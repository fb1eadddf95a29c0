//! Sqlite-backed ticket store.
//!
//! The claim primitive is a conditional UPDATE checked through
//! `rows_affected`, wrapped in a transaction with the history INSERT. Uses
//! the runtime `sqlx::query` API, so building does not require a database.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

use crate::branch::BranchId;
use crate::error::{QueueEngineError, Result};
use crate::notify::NotificationChannel;
use crate::ticket::{
    CheckinMethod, Ticket, TicketAction, TicketHistoryEntry, TicketId, TicketSequencer,
    TicketStatus,
};

use super::{schema, TicketStore};

const TICKET_COLUMNS: &str = "id, branch_id, service_category_id, ticket_number, status, \
     priority, customer_phone, notification_channel, checkin_method, counter_id, \
     served_by_user_id, created_at, called_at, serving_started_at, completed_at, \
     priority_reason, prioritized_by, prioritized_at, notes";

/// Ticket store over a sqlx sqlite pool
#[derive(Clone)]
pub struct SqliteTicketStore {
    pool: SqlitePool,
}

impl SqliteTicketStore {
    /// Connect to a sqlite database and create the schema if needed.
    ///
    /// `database_url` is a sqlx URL such as `sqlite:///var/lib/branchq/queue.db?mode=rwc`.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(db_err)?;
        schema::create_schema(&pool).await?;
        info!("💾 Ticket store ready at {}", database_url);
        Ok(Self { pool })
    }

    /// Open a private in-memory database.
    ///
    /// Pinned to a single connection: each sqlite `:memory:` connection is its
    /// own database, so a larger pool would scatter the tables.
    pub async fn in_memory() -> Result<Self> {
        Self::connect("sqlite::memory:", 1).await
    }

    async fn insert_history(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        entry: &TicketHistoryEntry,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO ticket_history (ticket_id, action, actor_id, metadata, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(entry.ticket_id.as_str())
        .bind(entry.action.as_str())
        .bind(entry.actor_id.as_deref())
        .bind(entry.metadata.to_string())
        .bind(entry.created_at)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }
}

#[async_trait]
impl TicketStore for SqliteTicketStore {
    async fn insert_ticket(&self, ticket: &Ticket, history: &TicketHistoryEntry) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        sqlx::query(&format!(
            "INSERT INTO tickets ({})
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            TICKET_COLUMNS
        ))
        .bind(ticket.id.as_str())
        .bind(ticket.branch_id.as_str())
        .bind(ticket.service_category_id.as_str())
        .bind(&ticket.ticket_number)
        .bind(ticket.status.as_str())
        .bind(ticket.priority.as_str())
        .bind(ticket.customer_phone.as_deref())
        .bind(ticket.notification_channel.as_str())
        .bind(ticket.checkin_method.as_str())
        .bind(ticket.counter_id.as_ref().map(|c| c.as_str().to_string()))
        .bind(ticket.served_by_user_id.as_deref())
        .bind(ticket.created_at)
        .bind(ticket.called_at)
        .bind(ticket.serving_started_at)
        .bind(ticket.completed_at)
        .bind(ticket.priority_reason.as_deref())
        .bind(ticket.prioritized_by.as_deref())
        .bind(ticket.prioritized_at)
        .bind(ticket.notes.as_deref())
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        Self::insert_history(&mut tx, history).await?;
        tx.commit().await.map_err(db_err)?;

        debug!("💾 Ticket {} persisted", ticket.ticket_number);
        Ok(())
    }

    async fn ticket(&self, id: &TicketId) -> Result<Option<Ticket>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM tickets WHERE id = ?",
            TICKET_COLUMNS
        ))
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.map(|r| row_to_ticket(&r)).transpose()
    }

    async fn update_ticket_if_status(
        &self,
        updated: &Ticket,
        expected: TicketStatus,
        history: &TicketHistoryEntry,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let result = sqlx::query(
            "UPDATE tickets
             SET service_category_id = ?, status = ?, priority = ?, counter_id = ?,
                 served_by_user_id = ?, called_at = ?, serving_started_at = ?,
                 completed_at = ?, priority_reason = ?, prioritized_by = ?,
                 prioritized_at = ?, notes = ?
             WHERE id = ? AND status = ?",
        )
        .bind(updated.service_category_id.as_str())
        .bind(updated.status.as_str())
        .bind(updated.priority.as_str())
        .bind(updated.counter_id.as_ref().map(|c| c.as_str().to_string()))
        .bind(updated.served_by_user_id.as_deref())
        .bind(updated.called_at)
        .bind(updated.serving_started_at)
        .bind(updated.completed_at)
        .bind(updated.priority_reason.as_deref())
        .bind(updated.prioritized_by.as_deref())
        .bind(updated.prioritized_at)
        .bind(updated.notes.as_deref())
        .bind(updated.id.as_str())
        .bind(expected.as_str())
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        let applied = result.rows_affected() > 0;

        if applied {
            Self::insert_history(&mut tx, history).await?;
            tx.commit().await.map_err(db_err)?;
            debug!(
                "💾 Ticket {} moved {} -> {}",
                updated.ticket_number, expected, updated.status
            );
        } else {
            tx.rollback().await.map_err(db_err)?;
        }

        Ok(applied)
    }

    async fn tickets_with_status(
        &self,
        branch_id: &BranchId,
        status: TicketStatus,
        since: DateTime<Utc>,
    ) -> Result<Vec<Ticket>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM tickets
             WHERE branch_id = ? AND status = ? AND created_at >= ?
             ORDER BY created_at ASC",
            TICKET_COLUMNS
        ))
        .bind(branch_id.as_str())
        .bind(status.as_str())
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(row_to_ticket).collect()
    }

    async fn active_tickets(&self, branch_id: &BranchId) -> Result<Vec<Ticket>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM tickets
             WHERE branch_id = ? AND status IN ('called', 'serving')
             ORDER BY created_at ASC",
            TICKET_COLUMNS
        ))
        .bind(branch_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(row_to_ticket).collect()
    }

    async fn completed_since(
        &self,
        branch_id: &BranchId,
        since: DateTime<Utc>,
    ) -> Result<Vec<Ticket>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM tickets
             WHERE branch_id = ? AND status = 'completed' AND completed_at >= ?
             ORDER BY completed_at ASC",
            TICKET_COLUMNS
        ))
        .bind(branch_id.as_str())
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(row_to_ticket).collect()
    }

    async fn max_ticket_seq(
        &self,
        branch_id: &BranchId,
        prefix: &str,
        day_start: DateTime<Utc>,
    ) -> Result<u32> {
        let rows = sqlx::query(
            "SELECT ticket_number FROM tickets
             WHERE branch_id = ? AND created_at >= ? AND ticket_number LIKE ?",
        )
        .bind(branch_id.as_str())
        .bind(day_start)
        .bind(format!("{}-%", prefix))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let max = rows
            .iter()
            .filter_map(|r| r.try_get::<String, _>("ticket_number").ok())
            .filter_map(|number| TicketSequencer::parse_seq(&number))
            .max()
            .unwrap_or(0);
        Ok(max)
    }

    async fn history(&self, ticket_id: &TicketId) -> Result<Vec<TicketHistoryEntry>> {
        let rows = sqlx::query(
            "SELECT ticket_id, action, actor_id, metadata, created_at
             FROM ticket_history WHERE ticket_id = ? ORDER BY id ASC",
        )
        .bind(ticket_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(row_to_history).collect()
    }
}

fn db_err(e: sqlx::Error) -> QueueEngineError {
    QueueEngineError::Database(e.into())
}

fn parse_err(what: &str, e: impl std::fmt::Display) -> QueueEngineError {
    QueueEngineError::internal(format!("Corrupt {} in ticket row: {}", what, e))
}

fn row_to_ticket(row: &SqliteRow) -> Result<Ticket> {
    let status: String = row.try_get("status").map_err(db_err)?;
    let priority: String = row.try_get("priority").map_err(db_err)?;
    let channel: String = row.try_get("notification_channel").map_err(db_err)?;
    let method: String = row.try_get("checkin_method").map_err(db_err)?;
    let checkin_method = match method.as_str() {
        "kiosk" => CheckinMethod::Kiosk,
        "mobile" => CheckinMethod::Mobile,
        "manual" => CheckinMethod::Manual,
        other => return Err(parse_err("checkin_method", other)),
    };

    Ok(Ticket {
        id: TicketId(row.try_get("id").map_err(db_err)?),
        branch_id: BranchId(row.try_get("branch_id").map_err(db_err)?),
        service_category_id: crate::branch::ServiceId(
            row.try_get("service_category_id").map_err(db_err)?,
        ),
        ticket_number: row.try_get("ticket_number").map_err(db_err)?,
        status: status.parse().map_err(|e| parse_err("status", e))?,
        priority: priority.parse().map_err(|e| parse_err("priority", e))?,
        customer_phone: row.try_get("customer_phone").map_err(db_err)?,
        notification_channel: channel
            .parse::<NotificationChannel>()
            .map_err(|e| parse_err("notification_channel", e))?,
        checkin_method,
        counter_id: row
            .try_get::<Option<String>, _>("counter_id")
            .map_err(db_err)?
            .map(crate::counter::CounterId),
        served_by_user_id: row.try_get("served_by_user_id").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
        called_at: row.try_get("called_at").map_err(db_err)?,
        serving_started_at: row.try_get("serving_started_at").map_err(db_err)?,
        completed_at: row.try_get("completed_at").map_err(db_err)?,
        priority_reason: row.try_get("priority_reason").map_err(db_err)?,
        prioritized_by: row.try_get("prioritized_by").map_err(db_err)?,
        prioritized_at: row.try_get("prioritized_at").map_err(db_err)?,
        notes: row.try_get("notes").map_err(db_err)?,
    })
}

fn row_to_history(row: &SqliteRow) -> Result<TicketHistoryEntry> {
    let action: String = row.try_get("action").map_err(db_err)?;
    let metadata: String = row.try_get("metadata").map_err(db_err)?;

    Ok(TicketHistoryEntry {
        ticket_id: TicketId(row.try_get("ticket_id").map_err(db_err)?),
        action: action
            .parse::<TicketAction>()
            .map_err(|e| parse_err("action", e))?,
        actor_id: row.try_get("actor_id").map_err(db_err)?,
        metadata: serde_json::from_str(&metadata).map_err(|e| parse_err("metadata", e))?,
        created_at: row.try_get("created_at").map_err(db_err)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::branch::ServiceId;
    use crate::ticket::CheckinRequest;

    fn ticket(id: &str) -> Ticket {
        let req = CheckinRequest::kiosk(BranchId::from("b1"), ServiceId::from("s1"));
        let mut t = Ticket::new(&req, "A-001".to_string(), Utc::now());
        t.id = TicketId::from(id);
        t
    }

    fn entry(ticket_id: &str, action: TicketAction) -> TicketHistoryEntry {
        TicketHistoryEntry::new(
            TicketId::from(ticket_id),
            action,
            Some("teller-1".to_string()),
            serde_json::json!({"counter": 1}),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn tickets_round_trip() {
        let store = SqliteTicketStore::in_memory().await.unwrap();
        let t = ticket("t1");
        store
            .insert_ticket(&t, &entry("t1", TicketAction::Created))
            .await
            .unwrap();

        let loaded = store.ticket(&t.id).await.unwrap().unwrap();
        assert_eq!(loaded, t);

        let history = store.history(&t.id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].action, TicketAction::Created);
        assert_eq!(history[0].metadata, serde_json::json!({"counter": 1}));
    }

    #[tokio::test]
    async fn conditional_update_checks_rows_affected() {
        let store = SqliteTicketStore::in_memory().await.unwrap();
        let t = ticket("t1");
        store
            .insert_ticket(&t, &entry("t1", TicketAction::Created))
            .await
            .unwrap();

        let mut claimed = t.clone();
        claimed.status = TicketStatus::Serving;
        claimed.counter_id = Some(crate::counter::CounterId::from("c1"));

        let first = store
            .update_ticket_if_status(&claimed, TicketStatus::Waiting, &entry("t1", TicketAction::Called))
            .await
            .unwrap();
        assert!(first);

        // Stale claim rolls back, leaving a single history entry for the call
        let second = store
            .update_ticket_if_status(&claimed, TicketStatus::Waiting, &entry("t1", TicketAction::Called))
            .await
            .unwrap();
        assert!(!second);
        assert_eq!(store.history(&t.id).await.unwrap().len(), 2);

        let loaded = store.ticket(&t.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TicketStatus::Serving);
    }

    #[tokio::test]
    async fn queries_scope_by_branch_and_status() {
        let store = SqliteTicketStore::in_memory().await.unwrap();
        let since = Utc::now() - chrono::Duration::hours(1);

        let waiting = ticket("t1");
        store
            .insert_ticket(&waiting, &entry("t1", TicketAction::Created))
            .await
            .unwrap();

        let mut done = ticket("t2");
        done.status = TicketStatus::Completed;
        done.completed_at = Some(Utc::now());
        store
            .insert_ticket(&done, &entry("t2", TicketAction::Created))
            .await
            .unwrap();

        let branch = BranchId::from("b1");
        let found = store
            .tickets_with_status(&branch, TicketStatus::Waiting, since)
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, waiting.id);

        assert_eq!(store.completed_since(&branch, since).await.unwrap().len(), 1);
        assert!(store.active_tickets(&branch).await.unwrap().is_empty());
        assert_eq!(store.max_ticket_seq(&branch, "A", since).await.unwrap(), 1);
    }
}
