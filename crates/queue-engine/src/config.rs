use serde::{Deserialize, Serialize};

use crate::alerts::AlertThresholds;

/// Queue engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEngineConfig {
    /// General engine settings
    pub general: GeneralConfig,

    /// Queue behavior configuration
    pub queues: QueueConfig,

    /// Wait-time estimator configuration
    pub estimator: EstimatorConfig,

    /// Operational alert thresholds
    pub alerts: AlertConfig,

    /// Customer notification configuration
    pub notifications: NotificationConfig,

    /// Database configuration
    pub database: DatabaseConfig,
}

/// General engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Deployment name used in logs and event metadata
    pub deployment_name: String,

    /// Buffer size for each event room's broadcast channel
    pub event_channel_capacity: usize,

    /// Interval between status log lines from the server monitor task (seconds)
    pub monitor_interval_secs: u64,

    /// Interval between operating-hours checks for auto open/close (seconds)
    pub schedule_interval_secs: u64,
}

/// Queue behavior configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum waiting tickets per branch before check-ins are rejected
    pub max_queue_size: usize,

    /// Default queue position at which an "almost your turn" notification fires
    pub default_notify_at_position: u32,
}

/// Wait-time estimator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EstimatorConfig {
    /// Branch-wide fallback when a service has no configured average (minutes)
    pub default_avg_service_time_mins: u32,

    /// Trailing window for the measured per-service average (hours)
    pub dynamic_window_hours: u64,

    /// Minimum completed tickets before the measured average replaces the manual one
    pub dynamic_min_samples: usize,

    /// Lower clamp for the measured average (minutes)
    pub dynamic_clamp_min_mins: u32,

    /// Upper clamp for the measured average (minutes)
    pub dynamic_clamp_max_mins: u32,
}

/// Alert evaluation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertConfig {
    /// Waiting longer than this raises a long-wait warning (minutes)
    pub long_wait_mins: i64,

    /// Waiting ticket count that raises a queue-backup warning
    pub queue_warning: usize,

    /// Waiting ticket count that escalates queue-backup to critical
    pub queue_critical: usize,

    /// Rolling average service time above this flags a slow teller (minutes)
    pub slow_teller_mins: i64,

    /// Break overtime that escalates from warning to critical (minutes)
    pub break_overtime_critical_mins: i64,

    /// Interval between background alert evaluations (seconds)
    pub evaluation_interval_secs: u64,
}

/// Customer notification configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// Whether the engine hands messages to the notification sink at all
    pub enabled: bool,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database file path (empty for in-memory)
    pub database_path: String,

    /// Maximum database connections
    pub max_connections: u32,
}

impl QueueEngineConfig {
    /// Validate the configuration for consistency and correctness
    pub fn validate(&self) -> Result<(), String> {
        if self.general.event_channel_capacity == 0 {
            return Err("event_channel_capacity must be greater than 0".to_string());
        }

        if self.general.monitor_interval_secs == 0 {
            return Err("monitor_interval_secs must be greater than 0".to_string());
        }

        if self.general.schedule_interval_secs == 0 {
            return Err("schedule_interval_secs must be greater than 0".to_string());
        }

        if self.queues.max_queue_size == 0 {
            return Err("max_queue_size must be greater than 0".to_string());
        }

        if self.estimator.default_avg_service_time_mins == 0 {
            return Err("default_avg_service_time_mins must be greater than 0".to_string());
        }

        if self.estimator.dynamic_clamp_min_mins > self.estimator.dynamic_clamp_max_mins {
            return Err("dynamic_clamp_min_mins cannot exceed dynamic_clamp_max_mins".to_string());
        }

        if self.alerts.long_wait_mins <= 0 {
            return Err("long_wait_mins must be greater than 0".to_string());
        }

        if self.alerts.queue_critical < self.alerts.queue_warning {
            return Err("queue_critical cannot be below queue_warning".to_string());
        }

        if self.alerts.evaluation_interval_secs == 0 {
            return Err("evaluation_interval_secs must be greater than 0".to_string());
        }

        if self.database.max_connections == 0 {
            return Err("max_connections must be greater than 0".to_string());
        }

        Ok(())
    }
}

impl AlertConfig {
    /// View of the alert section as evaluator thresholds
    pub fn thresholds(&self) -> AlertThresholds {
        AlertThresholds {
            long_wait_mins: self.long_wait_mins,
            queue_warning: self.queue_warning,
            queue_critical: self.queue_critical,
            slow_teller_mins: self.slow_teller_mins,
            break_overtime_critical_mins: self.break_overtime_critical_mins,
        }
    }
}

impl Default for QueueEngineConfig {
    fn default() -> Self {
        Self {
            general: GeneralConfig::default(),
            queues: QueueConfig::default(),
            estimator: EstimatorConfig::default(),
            alerts: AlertConfig::default(),
            notifications: NotificationConfig::default(),
            database: DatabaseConfig::default(),
        }
    }
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            deployment_name: "branchq".to_string(),
            event_channel_capacity: 256,
            monitor_interval_secs: 60,
            schedule_interval_secs: 60,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 100,
            default_notify_at_position: 2,
        }
    }
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            default_avg_service_time_mins: 10,
            dynamic_window_hours: 24,
            dynamic_min_samples: 3,
            dynamic_clamp_min_mins: 1,
            dynamic_clamp_max_mins: 60,
        }
    }
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            long_wait_mins: 20,
            queue_warning: 10,
            queue_critical: 20,
            slow_teller_mins: 15,
            break_overtime_critical_mins: 10,
            evaluation_interval_secs: 30,
        }
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            database_path: String::new(),
            max_connections: 10,
        }
    }
}
