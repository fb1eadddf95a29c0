//! Notification dispatch seam.
//!
//! The engine hands fully-formed messages to a [`NotificationSink`] and never
//! waits on delivery; SMS/WhatsApp transport lives in a collaborator behind
//! this trait. The default [`NullSink`] drops everything.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::ticket::TicketId;

/// Channel the customer asked to be notified on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationChannel {
    None,
    Sms,
    Whatsapp,
}

impl NotificationChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationChannel::None => "none",
            NotificationChannel::Sms => "sms",
            NotificationChannel::Whatsapp => "whatsapp",
        }
    }
}

impl fmt::Display for NotificationChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for NotificationChannel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "none" => Ok(NotificationChannel::None),
            "sms" => Ok(NotificationChannel::Sms),
            "whatsapp" => Ok(NotificationChannel::Whatsapp),
            _ => Err(format!("Unknown notification channel: {}", s)),
        }
    }
}

/// What the message tells the customer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// Check-in confirmation with position and estimate
    Confirmation,
    /// The customer is near the front of the queue
    AlmostTurn,
    /// The customer has been called to a counter
    YourTurn,
}

/// A message ready for delivery, keyed by ticket and channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub ticket_id: TicketId,
    pub kind: NotificationKind,
    pub channel: NotificationChannel,
    pub recipient: String,
    pub ticket_number: String,
    pub branch_name: Option<String>,
    pub service_name: Option<String>,
    pub counter_number: Option<u32>,
    pub position: Option<u32>,
    pub estimated_wait_mins: Option<u32>,
}

/// Fire-and-forget delivery of customer notifications
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Hand a message to the delivery collaborator. Must not block dispatch.
    async fn deliver(&self, notification: Notification);
}

/// Sink that drops every message; useful for tests and kiosk-only deployments
pub struct NullSink;

#[async_trait]
impl NotificationSink for NullSink {
    async fn deliver(&self, notification: Notification) {
        debug!(
            "🔕 Dropping {:?} notification for ticket {}",
            notification.kind, notification.ticket_number
        );
    }
}
