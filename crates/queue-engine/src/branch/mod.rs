//! Branch and service-category registry.
//!
//! Branches and their service categories are configured by the admin
//! surface and read-mostly from the engine's point of view. The registry
//! is the authority for branch queue status (open / paused / closed) and
//! per-branch operating hours.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveTime, Utc, Weekday};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{QueueEngineError, Result};

/// Unique branch identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BranchId(pub String);

impl BranchId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BranchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for BranchId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Unique service-category identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceId(pub String);

impl ServiceId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ServiceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Branch queue status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Open,
    Paused,
    /// End-of-day closure, distinct from a manual pause
    Closed,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Open => "open",
            QueueStatus::Paused => "paused",
            QueueStatus::Closed => "closed",
        }
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for QueueStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "open" => Ok(QueueStatus::Open),
            "paused" => Ok(QueueStatus::Paused),
            "closed" => Ok(QueueStatus::Closed),
            _ => Err(format!("Unknown queue status: {}", s)),
        }
    }
}

/// Daily operating hours driving automatic queue open/close
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatingHours {
    pub opening: NaiveTime,
    pub closing: NaiveTime,
    pub closed_on_weekends: bool,
}

/// A kind of service the branch offers (deposits, loans, ...)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceCategory {
    pub id: ServiceId,
    pub branch_id: BranchId,
    pub name: String,
    /// Ticket number prefix (e.g. "D" for deposits)
    pub prefix: String,
    /// Ordering weight for service listings in snapshots
    pub priority_weight: u32,
    pub avg_service_time_mins: u32,
    /// Replace the manual average with the measured one when enough data exists
    pub use_dynamic_service_time: bool,
    pub is_active: bool,
}

/// A physical branch: the unit of queue isolation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Branch {
    pub id: BranchId,
    pub name: String,
    pub queue_status: QueueStatus,
    /// Queue position at which the "almost your turn" notification fires;
    /// zero falls back to the deployment-wide default
    pub notify_at_position: u32,
    /// Offset of the branch's local clock from UTC, in minutes
    pub utc_offset_minutes: i32,
    pub operating_hours: Option<OperatingHours>,
    pub auto_schedule_enabled: bool,
    pub queue_paused_at: Option<DateTime<Utc>>,
    pub queue_paused_by: Option<String>,
}

impl Branch {
    /// Create an open branch with defaults suitable for tests and bootstrap
    pub fn new(id: BranchId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            queue_status: QueueStatus::Open,
            notify_at_position: 0,
            utc_offset_minutes: 0,
            operating_hours: None,
            auto_schedule_enabled: false,
            queue_paused_at: None,
            queue_paused_by: None,
        }
    }

    fn offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_minutes * 60)
            .unwrap_or_else(|| FixedOffset::east_opt(0).expect("zero offset is valid"))
    }

    /// Start of the branch's local calendar day, in UTC
    pub fn local_day_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let local = now.with_timezone(&self.offset());
        let midnight = local
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .expect("midnight is valid");
        DateTime::<Utc>::from_naive_utc_and_offset(midnight - Duration::minutes(self.utc_offset_minutes as i64), Utc)
    }

    /// The branch's local calendar date as "YYYY-MM-DD"
    pub fn local_date_key(&self, now: DateTime<Utc>) -> String {
        now.with_timezone(&self.offset())
            .date_naive()
            .format("%Y-%m-%d")
            .to_string()
    }

    /// Local wall-clock time and weekday at `now`
    pub fn local_time(&self, now: DateTime<Utc>) -> (NaiveTime, Weekday) {
        let local = now.with_timezone(&self.offset());
        (local.time(), local.weekday())
    }
}

/// Registry of branches and their service categories
pub struct BranchRegistry {
    branches: RwLock<HashMap<BranchId, Branch>>,
    services: RwLock<HashMap<ServiceId, ServiceCategory>>,
}

impl BranchRegistry {
    pub fn new() -> Self {
        Self {
            branches: RwLock::new(HashMap::new()),
            services: RwLock::new(HashMap::new()),
        }
    }

    /// Register or replace a branch
    pub fn upsert_branch(&self, branch: Branch) {
        self.branches.write().insert(branch.id.clone(), branch);
    }

    /// Register or replace a service category
    pub fn upsert_service(&self, service: ServiceCategory) {
        self.services.write().insert(service.id.clone(), service);
    }

    pub fn branch(&self, id: &BranchId) -> Result<Branch> {
        self.branches
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| QueueEngineError::not_found(format!("Branch not found: {}", id)))
    }

    pub fn service(&self, id: &ServiceId) -> Result<ServiceCategory> {
        self.services
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| QueueEngineError::not_found(format!("Service category not found: {}", id)))
    }

    /// Active services of a branch, ordered by their display weight
    pub fn active_services(&self, branch_id: &BranchId) -> Vec<ServiceCategory> {
        let mut services: Vec<ServiceCategory> = self
            .services
            .read()
            .values()
            .filter(|s| &s.branch_id == branch_id && s.is_active)
            .cloned()
            .collect();
        services.sort_by(|a, b| a.priority_weight.cmp(&b.priority_weight).then(a.prefix.cmp(&b.prefix)));
        services
    }

    /// All service prefixes configured for a branch
    pub fn branch_prefixes(&self, branch_id: &BranchId) -> Vec<String> {
        self.services
            .read()
            .values()
            .filter(|s| &s.branch_id == branch_id)
            .map(|s| s.prefix.clone())
            .collect()
    }

    pub fn branch_ids(&self) -> Vec<BranchId> {
        self.branches.read().keys().cloned().collect()
    }

    pub fn branch_count(&self) -> usize {
        self.branches.read().len()
    }

    /// Mutate a branch in place under the registry lock
    pub fn update_branch<F, T>(&self, id: &BranchId, f: F) -> Result<T>
    where
        F: FnOnce(&mut Branch) -> Result<T>,
    {
        let mut branches = self.branches.write();
        let branch = branches
            .get_mut(id)
            .ok_or_else(|| QueueEngineError::not_found(format!("Branch not found: {}", id)))?;
        f(branch)
    }
}

impl Default for BranchRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn local_day_start_respects_utc_offset() {
        let mut branch = Branch::new(BranchId::from("b1"), "Downtown");
        branch.utc_offset_minutes = 60; // UTC+1

        // 23:30 UTC is already 00:30 next day locally
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 23, 30, 0).unwrap();
        let day_start = branch.local_day_start(now);
        assert_eq!(day_start, Utc.with_ymd_and_hms(2026, 3, 1, 23, 0, 0).unwrap());
        assert_eq!(branch.local_date_key(now), "2026-03-02");
    }

    #[test]
    fn active_services_are_ordered_by_weight() {
        let registry = BranchRegistry::new();
        let branch_id = BranchId::from("b1");
        for (id, prefix, weight, active) in
            [("s1", "C", 2, true), ("s2", "A", 1, true), ("s3", "Z", 0, false)]
        {
            registry.upsert_service(ServiceCategory {
                id: ServiceId::from(id),
                branch_id: branch_id.clone(),
                name: prefix.to_string(),
                prefix: prefix.to_string(),
                priority_weight: weight,
                avg_service_time_mins: 10,
                use_dynamic_service_time: false,
                is_active: active,
            });
        }

        let services = registry.active_services(&branch_id);
        assert_eq!(services.len(), 2);
        assert_eq!(services[0].prefix, "A");
        assert_eq!(services[1].prefix, "C");
    }
}
