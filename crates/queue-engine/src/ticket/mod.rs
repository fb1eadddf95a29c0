//! Ticket domain types and the ticket lifecycle state machine.
//!
//! A ticket is one customer's place in a branch queue. It is created at
//! check-in, claimed by a counter through call-next, and ends in exactly one
//! of the terminal states. Every transition is validated against the legal
//! edges here and recorded as an append-only [`TicketHistoryEntry`].

pub mod number;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::branch::{BranchId, ServiceId};
use crate::counter::CounterId;
use crate::notify::NotificationChannel;

pub use number::TicketSequencer;

/// Unique ticket identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TicketId(pub String);

impl TicketId {
    /// Generate a fresh ticket id
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TicketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TicketId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Ticket status enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    /// In the queue, not yet claimed by a counter
    Waiting,
    /// Claimed by a counter, customer announced
    Called,
    /// Being served at a counter
    Serving,
    /// Service finished
    Completed,
    /// Customer never arrived after being called
    NoShow,
    /// Withdrawn before being served
    Cancelled,
}

impl TicketStatus {
    /// Terminal statuses never transition again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TicketStatus::Completed | TicketStatus::NoShow | TicketStatus::Cancelled
        )
    }

    /// True while the ticket occupies a counter
    pub fn is_active(&self) -> bool {
        matches!(self, TicketStatus::Called | TicketStatus::Serving)
    }

    /// Legal edges of the ticket lifecycle
    pub fn can_transition_to(&self, next: TicketStatus) -> bool {
        use TicketStatus::*;
        match (self, next) {
            (Waiting, Called) | (Waiting, Serving) => true,
            (Waiting, Cancelled) => true,
            (Called, Serving) => true,
            (Called, NoShow) | (Serving, NoShow) => true,
            (Called, Completed) | (Serving, Completed) => true,
            // Transfer to another service re-enters the queue
            (Called, Waiting) | (Serving, Waiting) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TicketStatus::Waiting => "waiting",
            TicketStatus::Called => "called",
            TicketStatus::Serving => "serving",
            TicketStatus::Completed => "completed",
            TicketStatus::NoShow => "no_show",
            TicketStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TicketStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(TicketStatus::Waiting),
            "called" => Ok(TicketStatus::Called),
            "serving" => Ok(TicketStatus::Serving),
            "completed" => Ok(TicketStatus::Completed),
            "no_show" => Ok(TicketStatus::NoShow),
            "cancelled" => Ok(TicketStatus::Cancelled),
            _ => Err(format!("Unknown ticket status: {}", s)),
        }
    }
}

/// Ticket priority tier
///
/// Vip tickets rank before all normal tickets regardless of arrival time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketPriority {
    Normal,
    Vip,
}

impl TicketPriority {
    /// Ranking key: lower sorts first
    pub fn rank(&self) -> u8 {
        match self {
            TicketPriority::Vip => 0,
            TicketPriority::Normal => 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TicketPriority::Normal => "normal",
            TicketPriority::Vip => "vip",
        }
    }
}

impl fmt::Display for TicketPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TicketPriority {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "normal" => Ok(TicketPriority::Normal),
            "vip" => Ok(TicketPriority::Vip),
            _ => Err(format!("Unknown ticket priority: {}", s)),
        }
    }
}

/// How the customer checked in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckinMethod {
    Kiosk,
    Mobile,
    Manual,
}

impl CheckinMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckinMethod::Kiosk => "kiosk",
            CheckinMethod::Mobile => "mobile",
            CheckinMethod::Manual => "manual",
        }
    }
}

/// Audit actions recorded in ticket history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketAction {
    Created,
    Called,
    Serving,
    Completed,
    NoShow,
    Cancelled,
    Transferred,
    PriorityBumped,
    /// Cancelled by the scheduler at closing time
    AutoCancelled,
}

impl TicketAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            TicketAction::Created => "created",
            TicketAction::Called => "called",
            TicketAction::Serving => "serving",
            TicketAction::Completed => "completed",
            TicketAction::NoShow => "no_show",
            TicketAction::Cancelled => "cancelled",
            TicketAction::Transferred => "transferred",
            TicketAction::PriorityBumped => "priority_bumped",
            TicketAction::AutoCancelled => "auto_cancelled",
        }
    }
}

impl fmt::Display for TicketAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TicketAction {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "created" => Ok(TicketAction::Created),
            "called" => Ok(TicketAction::Called),
            "serving" => Ok(TicketAction::Serving),
            "completed" => Ok(TicketAction::Completed),
            "no_show" => Ok(TicketAction::NoShow),
            "cancelled" => Ok(TicketAction::Cancelled),
            "transferred" => Ok(TicketAction::Transferred),
            "priority_bumped" => Ok(TicketAction::PriorityBumped),
            "auto_cancelled" => Ok(TicketAction::AutoCancelled),
            _ => Err(format!("Unknown ticket action: {}", s)),
        }
    }
}

/// Actor id recorded for scheduler-initiated transitions
pub const SYSTEM_ACTOR_ID: &str = "SYSTEM";

/// One customer's place in a branch queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticket {
    pub id: TicketId,
    pub branch_id: BranchId,
    pub service_category_id: ServiceId,
    /// Human-readable number, prefix plus daily sequence (e.g. "D-007")
    pub ticket_number: String,
    pub status: TicketStatus,
    pub priority: TicketPriority,
    pub customer_phone: Option<String>,
    pub notification_channel: NotificationChannel,
    pub checkin_method: CheckinMethod,
    /// Counter serving this ticket; set only while called/serving
    pub counter_id: Option<CounterId>,
    /// Teller serving this ticket; set only while called/serving
    pub served_by_user_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub called_at: Option<DateTime<Utc>>,
    pub serving_started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub priority_reason: Option<String>,
    pub prioritized_by: Option<String>,
    pub prioritized_at: Option<DateTime<Utc>>,
    pub notes: Option<String>,
}

impl Ticket {
    /// Create a fresh waiting ticket at check-in time
    pub fn new(req: &CheckinRequest, ticket_number: String, now: DateTime<Utc>) -> Self {
        // A phone without an explicit channel defaults to SMS
        let channel = match (&req.customer_phone, req.notification_channel) {
            (Some(_), NotificationChannel::None) => NotificationChannel::Sms,
            (Some(_), explicit) => explicit,
            (None, _) => NotificationChannel::None,
        };

        Self {
            id: TicketId::new(),
            branch_id: req.branch_id.clone(),
            service_category_id: req.service_category_id.clone(),
            ticket_number,
            status: TicketStatus::Waiting,
            priority: req.priority,
            customer_phone: req.customer_phone.clone(),
            notification_channel: channel,
            checkin_method: req.checkin_method,
            counter_id: None,
            served_by_user_id: None,
            created_at: now,
            called_at: None,
            serving_started_at: None,
            completed_at: None,
            priority_reason: None,
            prioritized_by: None,
            prioritized_at: None,
            notes: None,
        }
    }

    /// Minutes the customer has been waiting, from check-in to `now`
    pub fn wait_mins(&self, now: DateTime<Utc>) -> i64 {
        (now - self.created_at).num_minutes()
    }

    /// Minutes of actual service, once completed
    pub fn service_time_mins(&self) -> Option<i64> {
        let start = self.serving_started_at.or(self.called_at)?;
        let end = self.completed_at?;
        Some(((end - start).num_seconds() as f64 / 60.0).round() as i64)
    }

    /// Minutes from check-in until the customer was called
    pub fn answered_wait_mins(&self) -> Option<i64> {
        let called = self.called_at?;
        Some((called - self.created_at).num_minutes())
    }
}

/// Check-in request from a kiosk, mobile client, or manual entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckinRequest {
    pub branch_id: BranchId,
    pub service_category_id: ServiceId,
    pub customer_phone: Option<String>,
    pub notification_channel: NotificationChannel,
    pub priority: TicketPriority,
    pub checkin_method: CheckinMethod,
}

impl CheckinRequest {
    /// Plain kiosk check-in with no notification contact
    pub fn kiosk(branch_id: BranchId, service_category_id: ServiceId) -> Self {
        Self {
            branch_id,
            service_category_id,
            customer_phone: None,
            notification_channel: NotificationChannel::None,
            priority: TicketPriority::Normal,
            checkin_method: CheckinMethod::Kiosk,
        }
    }
}

/// Append-only audit record, written once per transition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketHistoryEntry {
    pub ticket_id: TicketId,
    pub action: TicketAction,
    pub actor_id: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl TicketHistoryEntry {
    pub fn new(
        ticket_id: TicketId,
        action: TicketAction,
        actor_id: Option<String>,
        metadata: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            ticket_id,
            action,
            actor_id,
            metadata,
            created_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses_have_no_outgoing_edges() {
        use TicketStatus::*;
        for terminal in [Completed, NoShow, Cancelled] {
            for next in [Waiting, Called, Serving, Completed, NoShow, Cancelled] {
                assert!(
                    !terminal.can_transition_to(next),
                    "{} -> {} should be illegal",
                    terminal,
                    next
                );
            }
        }
    }

    #[test]
    fn waiting_can_only_be_claimed_or_cancelled() {
        use TicketStatus::*;
        assert!(Waiting.can_transition_to(Called));
        assert!(Waiting.can_transition_to(Serving));
        assert!(Waiting.can_transition_to(Cancelled));
        assert!(!Waiting.can_transition_to(Completed));
        assert!(!Waiting.can_transition_to(NoShow));
    }

    #[test]
    fn transfer_reenters_the_queue_from_active_states() {
        assert!(TicketStatus::Called.can_transition_to(TicketStatus::Waiting));
        assert!(TicketStatus::Serving.can_transition_to(TicketStatus::Waiting));
    }

    #[test]
    fn status_round_trips_through_strings() {
        use TicketStatus::*;
        for status in [Waiting, Called, Serving, Completed, NoShow, Cancelled] {
            assert_eq!(status.as_str().parse::<TicketStatus>().unwrap(), status);
        }
    }

    #[test]
    fn vip_ranks_before_normal() {
        assert!(TicketPriority::Vip.rank() < TicketPriority::Normal.rank());
    }

    #[test]
    fn phone_without_channel_defaults_to_sms() {
        let req = CheckinRequest {
            customer_phone: Some("+21612345678".to_string()),
            ..CheckinRequest::kiosk(BranchId::from("b1"), ServiceId::from("s1"))
        };
        let ticket = Ticket::new(&req, "A-001".to_string(), Utc::now());
        assert_eq!(ticket.notification_channel, NotificationChannel::Sms);
    }
}
