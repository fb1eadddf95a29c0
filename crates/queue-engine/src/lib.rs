//! # Queue Dispatch & Ticket Lifecycle Engine
//!
//! This crate is the core of a branch banking queue system: customers check
//! in at a kiosk or on mobile, receive a ticket, wait in a priority-ordered
//! FIFO, and are called to an open counter by a teller. The engine owns every
//! ticket state transition, computes queue positions and wait estimates,
//! assigns tickets to counters under concurrent teller actions, derives
//! operational alerts, and emits ordered real-time events to all observers.
//!
//! ## Features
//!
//! - **Ticket Lifecycle**: check-in, call-next, complete, no-show, transfer,
//!   priority bump, cancel — every edge validated, every transition audited
//! - **Claim Safety**: per-branch serialization plus a compare-and-swap
//!   commit, so two counters can never claim the same ticket
//! - **Queue Ranking**: deterministic total order (vip first, then arrival)
//! - **Wait Estimates**: recomputed from queue depth and counter throughput
//! - **Operational Alerts**: long waits, queue backups, slow tellers, break
//!   overtime
//! - **Real-Time Events**: branch-, display-, and ticket-scoped rooms with
//!   per-branch causal ordering
//! - **Persistence**: sqlite or in-memory store behind one trait
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │               QueueServer                │
//! ├──────────────────────────────────────────┤
//! │   KioskApi │ TellerApi │ ManagerApi      │
//! ├──────────────────────────────────────────┤
//! │             DispatchEngine               │
//! ├──────────────────────────────────────────┤
//! │ Ranking │ Estimator │ Counters │ Alerts  │
//! ├──────────────────────────────────────────┤
//! │     TicketStore │ EventBroadcaster       │
//! └──────────────────────────────────────────┘
//! ```
//!
//! - [`dispatch`]: the orchestrator — validation and execution of transitions
//! - [`ticket`]: ticket types, state machine, daily number sequences
//! - [`counter`]: counter registry, teller breaks
//! - [`branch`]: branches, service categories, operating hours
//! - [`queue`]: pure ranking and wait-time estimation
//! - [`alerts`]: stateless alert evaluation
//! - [`events`]: room-scoped event fan-out
//! - [`store`]: persistence behind the `TicketStore` trait
//! - [`api`]: role-scoped operation surfaces
//! - [`server`]: lifecycle plus background loops
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use branchq_queue_engine::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let mut server = QueueServerBuilder::new()
//!         .with_config(QueueEngineConfig::default())
//!         .with_in_memory_store()
//!         .build()
//!         .await?;
//!
//!     // Register a branch, a service, and a counter
//!     let engine = server.engine().clone();
//!     let branch = Branch::new(BranchId::from("downtown"), "Downtown");
//!     engine.branches().upsert_branch(branch);
//!
//!     server.start().await?;
//!     server.run().await
//! }
//! ```

// Core modules
pub mod config;
pub mod error;

// Domain modules
pub mod branch;
pub mod counter;
pub mod queue;
pub mod ticket;

// Engine and collaborators
pub mod alerts;
pub mod dispatch;
pub mod events;
pub mod notify;
pub mod store;

// External interfaces
pub mod api;
pub mod server;

// Re-exports for convenience
pub use config::QueueEngineConfig;
pub use dispatch::DispatchEngine;
pub use error::{QueueEngineError, Result};
pub use server::{QueueServer, QueueServerBuilder};

/// Common imports for applications built on the engine
pub mod prelude {
    pub use crate::{DispatchEngine, QueueEngineConfig, QueueEngineError, QueueServer,
        QueueServerBuilder, Result};

    pub use crate::config::{
        AlertConfig, DatabaseConfig, EstimatorConfig, GeneralConfig, NotificationConfig,
        QueueConfig,
    };

    pub use crate::branch::{
        Branch, BranchId, BranchRegistry, OperatingHours, QueueStatus, ServiceCategory, ServiceId,
    };
    pub use crate::counter::{
        BreakReason, Counter, CounterId, CounterRegistry, CounterStatus, TellerBreak,
    };
    pub use crate::ticket::{
        CheckinMethod, CheckinRequest, Ticket, TicketAction, TicketHistoryEntry, TicketId,
        TicketPriority, TicketStatus, SYSTEM_ACTOR_ID,
    };

    pub use crate::dispatch::{
        BranchSnapshot, CheckinReceipt, ClaimedTicket, TicketPositionInfo, WaitingTicketView,
    };

    pub use crate::alerts::{Alert, AlertKind, AlertSeverity, AlertThresholds};
    pub use crate::events::{EventBroadcaster, PositionUrgency, QueueEvent, TicketDisplay};
    pub use crate::notify::{
        Notification, NotificationChannel, NotificationKind, NotificationSink, NullSink,
    };
    pub use crate::store::{MemoryTicketStore, SqliteTicketStore, TicketStore};

    pub use crate::api::{KioskApi, ManagerApi, TellerApi};

    // Common external types
    pub use chrono::{DateTime, Utc};
    pub use uuid::Uuid;
}
