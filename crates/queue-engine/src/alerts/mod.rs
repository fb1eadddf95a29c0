//! Operational alert evaluation.
//!
//! The evaluator is stateless: every cycle recomputes the full alert set from
//! the snapshot it is handed, so there is nothing to dismiss or expire in the
//! core. Output ordering is deterministic for identical input — critical
//! first, then most recent first, then id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::branch::BranchId;
use crate::counter::TellerBreak;
use crate::ticket::Ticket;

/// Alert severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

impl AlertSeverity {
    /// Sort key: lower sorts first
    fn rank(&self) -> u8 {
        match self {
            AlertSeverity::Critical => 0,
            AlertSeverity::Warning => 1,
        }
    }
}

/// What condition the alert flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// A customer has been waiting past the threshold
    LongWait,
    /// The whole queue is backing up
    QueueBackup,
    /// A teller's rolling average service time is above target
    SlowTeller,
    /// An active break ran past its expected end
    BreakOvertime,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::LongWait => "long_wait",
            AlertKind::QueueBackup => "queue_backup",
            AlertKind::SlowTeller => "slow_teller",
            AlertKind::BreakOvertime => "break_overtime",
        }
    }
}

/// A derived operational alert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    /// Stable id a collaborator can key dismissal state on
    pub id: String,
    pub branch_id: BranchId,
    pub kind: AlertKind,
    pub severity: AlertSeverity,
    pub message: String,
    /// When the underlying condition started
    pub raised_at: DateTime<Utc>,
}

/// Thresholds the rules are evaluated against
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertThresholds {
    pub long_wait_mins: i64,
    pub queue_warning: usize,
    pub queue_critical: usize,
    pub slow_teller_mins: i64,
    pub break_overtime_critical_mins: i64,
}

impl AlertThresholds {
    /// Long waits escalate to critical this many minutes past the warning line
    pub const LONG_WAIT_CRITICAL_MARGIN_MINS: i64 = 10;
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            long_wait_mins: 20,
            queue_warning: 10,
            queue_critical: 20,
            slow_teller_mins: 15,
            break_overtime_critical_mins: 10,
        }
    }
}

/// Rolling service-time average for one teller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TellerServiceStat {
    pub user_id: String,
    pub avg_service_mins: i64,
    pub completed_today: usize,
}

/// Snapshot of branch state the rules run over
pub struct AlertInputs<'a> {
    pub branch_id: &'a BranchId,
    pub now: DateTime<Utc>,
    /// Waiting tickets, any order
    pub waiting: &'a [Ticket],
    pub teller_stats: &'a [TellerServiceStat],
    /// Active breaks with the counter number they belong to
    pub breaks: &'a [(TellerBreak, u32)],
}

/// Evaluate every rule against the snapshot
pub fn evaluate(inputs: &AlertInputs<'_>, thresholds: &AlertThresholds) -> Vec<Alert> {
    let mut alerts = Vec::new();

    long_wait_alerts(inputs, thresholds, &mut alerts);
    queue_backup_alert(inputs, thresholds, &mut alerts);
    slow_teller_alerts(inputs, thresholds, &mut alerts);
    break_overtime_alerts(inputs, thresholds, &mut alerts);

    alerts.sort_by(|a, b| {
        a.severity
            .rank()
            .cmp(&b.severity.rank())
            .then_with(|| b.raised_at.cmp(&a.raised_at))
            .then_with(|| a.id.cmp(&b.id))
    });
    alerts
}

fn long_wait_alerts(
    inputs: &AlertInputs<'_>,
    thresholds: &AlertThresholds,
    alerts: &mut Vec<Alert>,
) {
    let critical_at = thresholds.long_wait_mins + AlertThresholds::LONG_WAIT_CRITICAL_MARGIN_MINS;

    for ticket in inputs.waiting {
        let wait_mins = ticket.wait_mins(inputs.now);
        if wait_mins < thresholds.long_wait_mins {
            continue;
        }

        let severity = if wait_mins >= critical_at {
            AlertSeverity::Critical
        } else {
            AlertSeverity::Warning
        };
        alerts.push(Alert {
            id: format!("long_wait:{}", ticket.id),
            branch_id: inputs.branch_id.clone(),
            kind: AlertKind::LongWait,
            severity,
            message: format!(
                "Ticket {} has been waiting {} minutes",
                ticket.ticket_number, wait_mins
            ),
            raised_at: ticket.created_at,
        });
    }
}

fn queue_backup_alert(
    inputs: &AlertInputs<'_>,
    thresholds: &AlertThresholds,
    alerts: &mut Vec<Alert>,
) {
    let waiting = inputs.waiting.len();
    if waiting < thresholds.queue_warning {
        return;
    }

    let severity = if waiting >= thresholds.queue_critical {
        AlertSeverity::Critical
    } else {
        AlertSeverity::Warning
    };
    // The newest arrival marks when the backup reached its current depth
    let raised_at = inputs
        .waiting
        .iter()
        .map(|t| t.created_at)
        .max()
        .unwrap_or(inputs.now);

    alerts.push(Alert {
        id: format!("queue_backup:{}", inputs.branch_id),
        branch_id: inputs.branch_id.clone(),
        kind: AlertKind::QueueBackup,
        severity,
        message: format!("{} customers waiting", waiting),
        raised_at,
    });
}

fn slow_teller_alerts(
    inputs: &AlertInputs<'_>,
    thresholds: &AlertThresholds,
    alerts: &mut Vec<Alert>,
) {
    for stat in inputs.teller_stats {
        if stat.avg_service_mins <= thresholds.slow_teller_mins {
            continue;
        }

        alerts.push(Alert {
            id: format!("slow_teller:{}", stat.user_id),
            branch_id: inputs.branch_id.clone(),
            kind: AlertKind::SlowTeller,
            severity: AlertSeverity::Warning,
            message: format!(
                "Teller {} averages {} min over {} tickets",
                stat.user_id, stat.avg_service_mins, stat.completed_today
            ),
            raised_at: inputs.now,
        });
    }
}

fn break_overtime_alerts(
    inputs: &AlertInputs<'_>,
    thresholds: &AlertThresholds,
    alerts: &mut Vec<Alert>,
) {
    for (teller_break, counter_number) in inputs.breaks {
        let overtime = teller_break.overtime_mins(inputs.now);
        if overtime <= 0 {
            continue;
        }

        let severity = if overtime >= thresholds.break_overtime_critical_mins {
            AlertSeverity::Critical
        } else {
            AlertSeverity::Warning
        };
        alerts.push(Alert {
            id: format!("break_overtime:{}", teller_break.id),
            branch_id: inputs.branch_id.clone(),
            kind: AlertKind::BreakOvertime,
            severity,
            message: format!(
                "Counter {} break is {} minutes over ({})",
                counter_number,
                overtime,
                teller_break.reason.as_str()
            ),
            raised_at: teller_break.expected_end,
        });
    }
}
