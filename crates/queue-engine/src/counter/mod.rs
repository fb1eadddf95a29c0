//! Counter registry: physical teller positions and their break state.
//!
//! A counter serves at most one active ticket at any instant. The registry
//! owns all counter state behind its own lock; the dispatch engine is the
//! only writer of `current_ticket_id`.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::branch::{BranchId, ServiceId};
use crate::error::{QueueEngineError, Result};
use crate::ticket::TicketId;

/// Unique counter identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CounterId(pub String);

impl CounterId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CounterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CounterId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Counter status enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterStatus {
    /// Staffed and accepting call-next
    Open,
    /// Not staffed
    Closed,
    /// Teller on a timed break
    OnBreak,
}

impl CounterStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CounterStatus::Open => "open",
            CounterStatus::Closed => "closed",
            CounterStatus::OnBreak => "on_break",
        }
    }
}

impl fmt::Display for CounterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for CounterStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "open" => Ok(CounterStatus::Open),
            "closed" => Ok(CounterStatus::Closed),
            "on_break" => Ok(CounterStatus::OnBreak),
            _ => Err(format!("Unknown counter status: {}", s)),
        }
    }
}

/// Why a teller stepped away
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakReason {
    Lunch,
    Prayer,
    Personal,
    Urgent,
}

impl BreakReason {
    /// Suggested duration when the teller does not pick one
    pub fn default_mins(&self) -> u32 {
        match self {
            BreakReason::Lunch => 30,
            BreakReason::Prayer => 15,
            BreakReason::Personal => 15,
            BreakReason::Urgent => 0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BreakReason::Lunch => "lunch",
            BreakReason::Prayer => "prayer",
            BreakReason::Personal => "personal",
            BreakReason::Urgent => "urgent",
        }
    }
}

/// An active teller break on a counter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TellerBreak {
    pub id: String,
    pub counter_id: CounterId,
    pub branch_id: BranchId,
    pub user_id: String,
    pub reason: BreakReason,
    pub duration_mins: u32,
    pub started_at: DateTime<Utc>,
    pub expected_end: DateTime<Utc>,
}

impl TellerBreak {
    /// Minutes past the expected end, zero if still within the break
    pub fn overtime_mins(&self, now: DateTime<Utc>) -> i64 {
        ((now - self.expected_end).num_minutes()).max(0)
    }
}

/// A physical service position
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Counter {
    pub id: CounterId,
    pub branch_id: BranchId,
    pub number: u32,
    pub label: Option<String>,
    pub status: CounterStatus,
    /// The one active ticket, only while this counter is open and serving
    pub current_ticket_id: Option<TicketId>,
    pub assigned_user_id: Option<String>,
    /// Services this counter can serve; empty means any service
    pub assigned_service_ids: HashSet<ServiceId>,
    pub active_break: Option<TellerBreak>,
}

impl Counter {
    pub fn new(id: CounterId, branch_id: BranchId, number: u32) -> Self {
        Self {
            id,
            branch_id,
            number,
            label: None,
            status: CounterStatus::Closed,
            current_ticket_id: None,
            assigned_user_id: None,
            assigned_service_ids: HashSet::new(),
            active_break: None,
        }
    }

    /// Whether this counter may claim tickets of the given service
    pub fn serves(&self, service_id: &ServiceId) -> bool {
        self.assigned_service_ids.is_empty() || self.assigned_service_ids.contains(service_id)
    }

    /// Free to claim a new ticket
    pub fn is_free(&self) -> bool {
        self.status == CounterStatus::Open && self.current_ticket_id.is_none()
    }
}

/// Counter statistics for a branch
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CounterStats {
    pub total: usize,
    pub open: usize,
    pub closed: usize,
    pub on_break: usize,
}

/// Registry of counters, guarded by its own lock
pub struct CounterRegistry {
    counters: RwLock<HashMap<CounterId, Counter>>,
}

impl CounterRegistry {
    pub fn new() -> Self {
        Self {
            counters: RwLock::new(HashMap::new()),
        }
    }

    /// Register or replace a counter
    pub fn upsert(&self, counter: Counter) {
        info!("🪟 Registering counter {} (branch {})", counter.number, counter.branch_id);
        self.counters.write().insert(counter.id.clone(), counter);
    }

    pub fn get(&self, id: &CounterId) -> Result<Counter> {
        self.counters
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| QueueEngineError::not_found(format!("Counter not found: {}", id)))
    }

    /// All counters of a branch, ordered by counter number
    pub fn branch_counters(&self, branch_id: &BranchId) -> Vec<Counter> {
        let mut counters: Vec<Counter> = self
            .counters
            .read()
            .values()
            .filter(|c| &c.branch_id == branch_id)
            .cloned()
            .collect();
        counters.sort_by_key(|c| c.number);
        counters
    }

    /// Number of open counters able to serve the given service
    pub fn open_counters_for_service(&self, branch_id: &BranchId, service_id: &ServiceId) -> usize {
        self.counters
            .read()
            .values()
            .filter(|c| &c.branch_id == branch_id && c.status == CounterStatus::Open && c.serves(service_id))
            .count()
    }

    /// Number of open counters in the branch
    pub fn open_counters(&self, branch_id: &BranchId) -> usize {
        self.counters
            .read()
            .values()
            .filter(|c| &c.branch_id == branch_id && c.status == CounterStatus::Open)
            .count()
    }

    /// Active breaks across a branch
    pub fn active_breaks(&self, branch_id: &BranchId) -> Vec<(TellerBreak, u32)> {
        self.counters
            .read()
            .values()
            .filter(|c| &c.branch_id == branch_id)
            .filter_map(|c| c.active_break.clone().map(|b| (b, c.number)))
            .collect()
    }

    /// Aggregate counter stats for a branch
    pub fn stats(&self, branch_id: &BranchId) -> CounterStats {
        let counters = self.counters.read();
        let branch = counters.values().filter(|c| &c.branch_id == branch_id);
        let mut stats = CounterStats { total: 0, open: 0, closed: 0, on_break: 0 };
        for counter in branch {
            stats.total += 1;
            match counter.status {
                CounterStatus::Open => stats.open += 1,
                CounterStatus::Closed => stats.closed += 1,
                CounterStatus::OnBreak => stats.on_break += 1,
            }
        }
        stats
    }

    pub fn count(&self) -> usize {
        self.counters.read().len()
    }

    /// Assign a teller to a counter
    pub fn assign_user(&self, id: &CounterId, user_id: Option<String>) -> Result<Counter> {
        self.with_counter(id, |counter| {
            counter.assigned_user_id = user_id;
            Ok(())
        })
    }

    /// Replace the set of services a counter may serve
    pub fn assign_services(&self, id: &CounterId, services: HashSet<ServiceId>) -> Result<Counter> {
        self.with_counter(id, |counter| {
            counter.assigned_service_ids = services;
            Ok(())
        })
    }

    /// Point the counter at its newly claimed ticket
    pub fn set_current_ticket(&self, id: &CounterId, ticket_id: TicketId) -> Result<Counter> {
        self.with_counter(id, |counter| {
            if counter.status != CounterStatus::Open {
                return Err(QueueEngineError::invalid_transition(format!(
                    "Counter {} is not open",
                    counter.number
                )));
            }
            if counter.current_ticket_id.is_some() {
                return Err(QueueEngineError::invalid_transition(format!(
                    "Counter {} already has an active ticket",
                    counter.number
                )));
            }
            counter.current_ticket_id = Some(ticket_id);
            Ok(())
        })
    }

    /// Clear the counter's active ticket after completion/no-show/transfer
    pub fn clear_current_ticket(&self, id: &CounterId) -> Result<Counter> {
        self.with_counter(id, |counter| {
            counter.current_ticket_id = None;
            Ok(())
        })
    }

    /// Open a counter for service
    pub fn open(&self, id: &CounterId) -> Result<Counter> {
        self.with_counter(id, |counter| {
            if counter.active_break.is_some() {
                return Err(QueueEngineError::invalid_transition(format!(
                    "Counter {} has an active break; end it first",
                    counter.number
                )));
            }
            counter.status = CounterStatus::Open;
            Ok(())
        })
    }

    /// Close a counter; rejected while a ticket is being served
    pub fn close(&self, id: &CounterId) -> Result<Counter> {
        self.with_counter(id, |counter| {
            if counter.current_ticket_id.is_some() {
                return Err(QueueEngineError::invalid_transition(format!(
                    "Counter {} still has an active ticket",
                    counter.number
                )));
            }
            counter.status = CounterStatus::Closed;
            counter.active_break = None;
            Ok(())
        })
    }

    /// Start a timed break on an open counter
    pub fn start_break(
        &self,
        id: &CounterId,
        reason: BreakReason,
        duration_mins: u32,
        now: DateTime<Utc>,
    ) -> Result<(Counter, TellerBreak)> {
        if !(1..=120).contains(&duration_mins) {
            return Err(QueueEngineError::invalid_transition(
                "Break duration must be between 1 and 120 minutes".to_string(),
            ));
        }

        let mut started: Option<TellerBreak> = None;
        let counter = self.with_counter(id, |counter| {
            let user_id = counter.assigned_user_id.clone().ok_or_else(|| {
                QueueEngineError::invalid_transition(format!(
                    "Counter {} has no assigned teller",
                    counter.number
                ))
            })?;
            if counter.active_break.is_some() || counter.status == CounterStatus::OnBreak {
                return Err(QueueEngineError::invalid_transition(format!(
                    "Counter {} is already on break",
                    counter.number
                )));
            }
            if counter.current_ticket_id.is_some() {
                return Err(QueueEngineError::invalid_transition(format!(
                    "Counter {} still has an active ticket",
                    counter.number
                )));
            }

            let teller_break = TellerBreak {
                id: Uuid::new_v4().to_string(),
                counter_id: counter.id.clone(),
                branch_id: counter.branch_id.clone(),
                user_id,
                reason,
                duration_mins,
                started_at: now,
                expected_end: now + Duration::minutes(duration_mins as i64),
            };
            counter.status = CounterStatus::OnBreak;
            counter.active_break = Some(teller_break.clone());
            started = Some(teller_break);
            Ok(())
        })?;

        let teller_break = started.ok_or_else(|| QueueEngineError::internal("break not recorded"))?;
        info!(
            "☕ Break started on counter {} ({}, {} min)",
            counter.number,
            reason.as_str(),
            duration_mins
        );
        Ok((counter, teller_break))
    }

    /// End the counter's active break and reopen it
    pub fn end_break(&self, id: &CounterId) -> Result<Counter> {
        let counter = self.with_counter(id, |counter| {
            if counter.active_break.take().is_none() {
                return Err(QueueEngineError::invalid_transition(format!(
                    "Counter {} has no active break",
                    counter.number
                )));
            }
            counter.status = CounterStatus::Open;
            Ok(())
        })?;
        info!("🔙 Break ended on counter {}", counter.number);
        Ok(counter)
    }

    /// Push the active break's expected end further out
    pub fn extend_break(&self, id: &CounterId, additional_mins: u32) -> Result<Counter> {
        if additional_mins == 0 {
            return Err(QueueEngineError::invalid_transition(
                "Break extension must be at least 1 minute".to_string(),
            ));
        }
        self.with_counter(id, |counter| {
            let number = counter.number;
            match counter.active_break.as_mut() {
                Some(teller_break) => {
                    teller_break.duration_mins += additional_mins;
                    teller_break.expected_end =
                        teller_break.expected_end + Duration::minutes(additional_mins as i64);
                    Ok(())
                }
                None => Err(QueueEngineError::invalid_transition(format!(
                    "Counter {} has no active break",
                    number
                ))),
            }
        })
    }

    fn with_counter<F>(&self, id: &CounterId, f: F) -> Result<Counter>
    where
        F: FnOnce(&mut Counter) -> Result<()>,
    {
        let mut counters = self.counters.write();
        let counter = counters
            .get_mut(id)
            .ok_or_else(|| QueueEngineError::not_found(format!("Counter not found: {}", id)))?;
        f(counter)?;
        Ok(counter.clone())
    }
}

impl Default for CounterRegistry {
    fn default() -> Self {
        Self::new()
    }
}
