//! Database schema for the sqlite ticket store.

use anyhow::Result;
use sqlx::SqlitePool;
use tracing::debug;

/// Create the tickets table
pub async fn create_tickets_table(pool: &SqlitePool) -> Result<()> {
    debug!("📋 Creating tickets table");

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tickets (
            id TEXT PRIMARY KEY,
            branch_id TEXT NOT NULL,
            service_category_id TEXT NOT NULL,
            ticket_number TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'waiting',
            priority TEXT NOT NULL DEFAULT 'normal',
            customer_phone TEXT,
            notification_channel TEXT NOT NULL DEFAULT 'none',
            checkin_method TEXT NOT NULL DEFAULT 'kiosk',
            counter_id TEXT,
            served_by_user_id TEXT,
            created_at TEXT NOT NULL,
            called_at TEXT,
            serving_started_at TEXT,
            completed_at TEXT,
            priority_reason TEXT,
            prioritized_by TEXT,
            prioritized_at TEXT,
            notes TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_tickets_branch_status
         ON tickets (branch_id, status, created_at)",
    )
    .execute(pool)
    .await?;

    debug!("✅ Tickets table created");
    Ok(())
}

/// Create the ticket history table
pub async fn create_ticket_history_table(pool: &SqlitePool) -> Result<()> {
    debug!("📋 Creating ticket_history table");

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS ticket_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            ticket_id TEXT NOT NULL,
            action TEXT NOT NULL,
            actor_id TEXT,
            metadata TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL,
            FOREIGN KEY (ticket_id) REFERENCES tickets(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_ticket_history_ticket
         ON ticket_history (ticket_id, id)",
    )
    .execute(pool)
    .await?;

    debug!("✅ Ticket history table created");
    Ok(())
}

/// Create all tables required by the ticket store
pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    create_tickets_table(pool).await?;
    create_ticket_history_table(pool).await?;
    Ok(())
}
