//! Queue server: engine lifecycle plus background tasks.
//!
//! [`QueueServer`] owns the dispatch engine and its three periodic loops:
//! alert evaluation (publishes `alerts:updated` per branch), the operating
//! hours scheduler (auto open/close), and a status monitor that logs a
//! summary line. Build one with [`QueueServerBuilder`], call
//! [`start`](QueueServer::start), and hand the role APIs to your transport
//! layer.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep};
use tracing::{debug, info};

use crate::api::{KioskApi, ManagerApi, TellerApi};
use crate::config::QueueEngineConfig;
use crate::dispatch::DispatchEngine;
use crate::error::Result;
use crate::notify::{NotificationSink, NullSink};
use crate::store::{MemoryTicketStore, SqliteTicketStore, TicketStore};

/// A complete queue server managing engine lifecycle and background loops
pub struct QueueServer {
    engine: Arc<DispatchEngine>,

    kiosk_api: KioskApi,
    teller_api: TellerApi,
    manager_api: ManagerApi,

    config: QueueEngineConfig,

    alert_handle: Option<JoinHandle<()>>,
    schedule_handle: Option<JoinHandle<()>>,
    monitor_handle: Option<JoinHandle<()>>,
}

impl QueueServer {
    /// Create a server around the given store and notification sink
    pub fn new(
        config: QueueEngineConfig,
        store: Arc<dyn TicketStore>,
        sink: Arc<dyn NotificationSink>,
    ) -> Result<Self> {
        let engine = DispatchEngine::new(config.clone(), store, sink)?;

        let kiosk_api = KioskApi::new(engine.clone());
        let teller_api = TellerApi::new(engine.clone());
        let manager_api = ManagerApi::new(engine.clone());

        Ok(Self {
            engine,
            kiosk_api,
            teller_api,
            manager_api,
            config,
            alert_handle: None,
            schedule_handle: None,
            monitor_handle: None,
        })
    }

    /// Create a server with an in-memory ticket store and no notifications
    pub fn new_in_memory(config: QueueEngineConfig) -> Result<Self> {
        Self::new(config, Arc::new(MemoryTicketStore::new()), Arc::new(NullSink))
    }

    /// Start the background loops
    pub async fn start(&mut self) -> Result<()> {
        info!(
            "🚀 Queue server starting ({})",
            self.config.general.deployment_name
        );

        let engine = self.engine.clone();
        let alert_interval = self.config.alerts.evaluation_interval_secs;
        self.alert_handle = Some(tokio::spawn(async move {
            Self::alert_loop(engine, alert_interval).await;
        }));

        let engine = self.engine.clone();
        let schedule_interval = self.config.general.schedule_interval_secs;
        self.schedule_handle = Some(tokio::spawn(async move {
            Self::schedule_loop(engine, schedule_interval).await;
        }));

        let engine = self.engine.clone();
        let monitor_interval = self.config.general.monitor_interval_secs;
        self.monitor_handle = Some(tokio::spawn(async move {
            Self::monitor_loop(engine, monitor_interval).await;
        }));

        info!("✅ Queue server started");
        Ok(())
    }

    /// Stop the background loops
    pub async fn stop(&mut self) -> Result<()> {
        info!("🛑 Stopping queue server...");

        for handle in [
            self.alert_handle.take(),
            self.schedule_handle.take(),
            self.monitor_handle.take(),
        ]
        .into_iter()
        .flatten()
        {
            handle.abort();
            let _ = handle.await;
        }

        info!("✅ Queue server stopped");
        Ok(())
    }

    /// Run the server indefinitely
    pub async fn run(&self) -> Result<()> {
        info!("🏦 Queue server is running");
        loop {
            sleep(Duration::from_secs(60)).await;
        }
    }

    pub fn kiosk_api(&self) -> &KioskApi {
        &self.kiosk_api
    }

    pub fn teller_api(&self) -> &TellerApi {
        &self.teller_api
    }

    pub fn manager_api(&self) -> &ManagerApi {
        &self.manager_api
    }

    /// The underlying engine, for registration and advanced wiring
    pub fn engine(&self) -> &Arc<DispatchEngine> {
        &self.engine
    }

    /// Periodically re-derive and publish each branch's alerts
    async fn alert_loop(engine: Arc<DispatchEngine>, interval_secs: u64) {
        info!("🚨 Starting alert evaluation loop ({}s)", interval_secs);
        let mut ticker = interval(Duration::from_secs(interval_secs));

        loop {
            ticker.tick().await;
            for branch_id in engine.branches().branch_ids() {
                let alerts = engine.evaluate_branch_alerts(&branch_id).await;
                debug!("🚨 Branch {}: {} active alerts", branch_id, alerts.len());
            }
        }
    }

    /// Periodically apply operating hours across branches
    async fn schedule_loop(engine: Arc<DispatchEngine>, interval_secs: u64) {
        info!("🕐 Starting operating-hours scheduler ({}s)", interval_secs);
        let mut ticker = interval(Duration::from_secs(interval_secs));

        loop {
            ticker.tick().await;
            engine.run_schedule_tick(Utc::now()).await;
        }
    }

    /// Periodic status summary
    async fn monitor_loop(engine: Arc<DispatchEngine>, interval_secs: u64) {
        info!("👀 Starting status monitor ({}s)", interval_secs);
        let mut ticker = interval(Duration::from_secs(interval_secs));

        loop {
            ticker.tick().await;
            for branch_id in engine.branches().branch_ids() {
                match engine.branch_snapshot(&branch_id).await {
                    Ok(snapshot) => info!(
                        "📊 Branch {} — {} waiting, {} served, {}/{} counters open, queue {}",
                        branch_id,
                        snapshot.totals.waiting,
                        snapshot.totals.served,
                        snapshot.counter_stats.open,
                        snapshot.counter_stats.total,
                        snapshot.queue_status,
                    ),
                    Err(e) => debug!("Status snapshot failed for {}: {}", branch_id, e),
                }
            }
        }
    }
}

/// Builder for [`QueueServer`] with fluent configuration
pub struct QueueServerBuilder {
    config: Option<QueueEngineConfig>,
    store: Option<Arc<dyn TicketStore>>,
    sink: Option<Arc<dyn NotificationSink>>,
    database_path: Option<String>,
}

impl QueueServerBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            store: None,
            sink: None,
            database_path: None,
        }
    }

    pub fn with_config(mut self, config: QueueEngineConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Use a caller-provided ticket store
    pub fn with_store(mut self, store: Arc<dyn TicketStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Open (or create) a sqlite database at the given path
    pub fn with_database_path(mut self, path: String) -> Self {
        self.database_path = Some(path);
        self
    }

    /// Keep tickets in process memory
    pub fn with_in_memory_store(mut self) -> Self {
        self.store = Some(Arc::new(MemoryTicketStore::new()));
        self
    }

    /// Deliver customer notifications through the given sink
    pub fn with_notification_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub async fn build(self) -> Result<QueueServer> {
        let config = self.config.unwrap_or_default();

        let store: Arc<dyn TicketStore> = match (self.store, self.database_path) {
            (Some(store), _) => store,
            (None, Some(path)) => {
                let url = format!("sqlite://{}?mode=rwc", path);
                Arc::new(SqliteTicketStore::connect(&url, config.database.max_connections).await?)
            }
            (None, None) if !config.database.database_path.is_empty() => {
                let url = format!("sqlite://{}?mode=rwc", config.database.database_path);
                Arc::new(SqliteTicketStore::connect(&url, config.database.max_connections).await?)
            }
            (None, None) => Arc::new(MemoryTicketStore::new()),
        };

        let sink = self.sink.unwrap_or_else(|| Arc::new(NullSink));
        QueueServer::new(config, store, sink)
    }
}

impl Default for QueueServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn builder_defaults_to_memory_store() {
        let mut server = QueueServerBuilder::new()
            .with_config(QueueEngineConfig::default())
            .build()
            .await
            .unwrap();

        server.start().await.unwrap();
        assert_eq!(server.engine().branches().branch_count(), 0);
        server.stop().await.unwrap();
    }
}
