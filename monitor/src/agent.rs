//! Per-plugin actor.
//!
//! A [`PluginAgent`] owns everything that belongs to one plugin: its
//! [`PluginPipeline`], its [`FlowStateEngine`], the record de-duplicator, and
//! the [`PluginWatcher`] on its live log. Watch events, timer ticks, and
//! collaborator signals all arrive as [`AgentMessage`]s and are handled one at
//! a time, so pipeline stages and bucket updates for a plugin never overlap.
//!
//! Callers interact through a cloneable [`AgentHandle`].
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tokio::sync::mpsc;
//! use flowpulse_monitor::agent::{AgentConfig, PluginAgent};
//! use flowpulse_monitor::sender::{HttpFlowClient, SenderConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = HttpFlowClient::new(SenderConfig::new(
//!         "https://flow.example.com".to_string(),
//!         "workstation-1".to_string(),
//!     ))?;
//!     let (updates_tx, mut updates_rx) = mpsc::channel(64);
//!
//!     let (handle, _task) = PluginAgent::spawn(
//!         "intellij",
//!         "/home/me/.flowpulse/plugins/intellij".into(),
//!         Arc::new(client),
//!         updates_tx,
//!         AgentConfig::default(),
//!     )?;
//!
//!     while let Some(update) = updates_rx.recv().await {
//!         println!("{} momentum {}", update.plugin_id, update.momentum);
//!     }
//!     handle.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, NaiveDateTime};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::{MonitorError, Result};
use crate::flow::{FileActivitySummary, FlowStateEngine, FlowStatus, RecordDeduplicator, Snapshot};
use crate::parser::read_log;
use crate::pipeline::{CycleReport, PluginPipeline};
use crate::sender::FlowService;
use crate::types::{ActivityRecord, MemberState, MomentumUpdate};
use crate::watcher::{PluginWatcher, WatchEvent, WatcherConfig};

/// Capacity of an agent's inbox.
const INBOX_CAPACITY: usize = 64;

/// Capacity of the watcher → agent channel.
const WATCH_CHANNEL_CAPACITY: usize = 16;

/// Messages handled by a [`PluginAgent`].
#[derive(Debug)]
pub enum AgentMessage {
    /// The live log changed and should be re-read.
    LogChanged(PathBuf),
    /// Run a pipeline cycle.
    PublishTick,
    /// Fetch a snapshot, recompute momentum, and check for idleness.
    RefreshTick,
    MemberStateUpdated(MemberState),
    TroubleshootingThresholdExceeded,
    FileActivityReport(oneshot::Sender<Vec<FileActivitySummary>>),
    Status(oneshot::Sender<FlowStatus>),
    /// Run a pipeline cycle and reply with its report.
    PublishNow(oneshot::Sender<Result<CycleReport>>),
    Shutdown,
}

/// Timing and behaviour knobs for an agent.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub publish_interval: Duration,
    pub refresh_interval: Duration,
    pub intention_credit: bool,
    pub watcher: WatcherConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            publish_interval: Duration::from_secs(300),
            refresh_interval: Duration::from_secs(120),
            intention_credit: false,
            watcher: WatcherConfig::default(),
        }
    }
}

/// Cloneable sender side of a running agent.
#[derive(Debug, Clone)]
pub struct AgentHandle {
    plugin_id: String,
    tx: mpsc::Sender<AgentMessage>,
}

impl AgentHandle {
    #[must_use]
    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    /// Queues a message for the agent.
    ///
    /// # Errors
    ///
    /// Returns [`MonitorError::AgentStopped`] if the agent has exited.
    pub async fn send(&self, message: AgentMessage) -> Result<()> {
        self.tx
            .send(message)
            .await
            .map_err(|_| MonitorError::AgentStopped(self.plugin_id.clone()))
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> AgentMessage) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(make(reply_tx)).await?;
        reply_rx
            .await
            .map_err(|_| MonitorError::AgentStopped(self.plugin_id.clone()))
    }

    pub async fn log_changed(&self, path: PathBuf) -> Result<()> {
        self.send(AgentMessage::LogChanged(path)).await
    }

    pub async fn member_state_updated(&self, state: MemberState) -> Result<()> {
        self.send(AgentMessage::MemberStateUpdated(state)).await
    }

    pub async fn troubleshooting_threshold_exceeded(&self) -> Result<()> {
        self.send(AgentMessage::TroubleshootingThresholdExceeded).await
    }

    pub async fn refresh(&self) -> Result<()> {
        self.send(AgentMessage::RefreshTick).await
    }

    /// Runs a pipeline cycle now and waits for its report.
    pub async fn publish_now(&self) -> Result<CycleReport> {
        self.request(AgentMessage::PublishNow).await?
    }

    pub async fn file_activity_report(&self) -> Result<Vec<FileActivitySummary>> {
        self.request(AgentMessage::FileActivityReport).await
    }

    pub async fn status(&self) -> Result<FlowStatus> {
        self.request(AgentMessage::Status).await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.send(AgentMessage::Shutdown).await
    }
}

/// The actor owning one plugin's pipeline and flow state.
pub struct PluginAgent<S> {
    plugin_id: String,
    pipeline: PluginPipeline,
    engine: FlowStateEngine,
    dedup: RecordDeduplicator,
    service: Arc<S>,
    updates: mpsc::Sender<MomentumUpdate>,
    watcher: Option<PluginWatcher>,
}

impl<S: FlowService + 'static> PluginAgent<S> {
    /// Creates an agent without a file watcher. Changes must be reported
    /// through [`AgentMessage::LogChanged`].
    #[must_use]
    pub fn new(
        plugin_id: impl Into<String>,
        plugin_dir: PathBuf,
        service: Arc<S>,
        updates: mpsc::Sender<MomentumUpdate>,
        intention_credit: bool,
    ) -> Self {
        let plugin_id = plugin_id.into();
        Self {
            pipeline: PluginPipeline::new(plugin_id.clone(), plugin_dir),
            engine: FlowStateEngine::new(plugin_id.clone(), intention_credit),
            dedup: RecordDeduplicator::new(),
            plugin_id,
            service,
            updates,
            watcher: None,
        }
    }

    /// Starts a watched agent on its own task.
    ///
    /// # Errors
    ///
    /// Returns [`MonitorError::Watch`] if the plugin directory cannot be
    /// watched.
    pub fn spawn(
        plugin_id: impl Into<String>,
        plugin_dir: PathBuf,
        service: Arc<S>,
        updates: mpsc::Sender<MomentumUpdate>,
        config: AgentConfig,
    ) -> Result<(AgentHandle, JoinHandle<()>)> {
        let mut agent = Self::new(
            plugin_id,
            plugin_dir.clone(),
            service,
            updates,
            config.intention_credit,
        );

        let (watch_tx, watch_rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        agent.watcher = Some(PluginWatcher::with_config(
            plugin_dir,
            watch_tx,
            config.watcher.clone(),
        )?);

        Ok(agent.start(Some(watch_rx), &config))
    }

    /// Runs the agent on its own task, optionally fed by a watcher channel.
    pub fn start(
        self,
        watch_rx: Option<mpsc::Receiver<WatchEvent>>,
        config: &AgentConfig,
    ) -> (AgentHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        let handle = AgentHandle {
            plugin_id: self.plugin_id.clone(),
            tx,
        };
        let task = tokio::spawn(self.run(
            rx,
            watch_rx,
            config.publish_interval,
            config.refresh_interval,
        ));
        (handle, task)
    }

    async fn run(
        mut self,
        mut inbox: mpsc::Receiver<AgentMessage>,
        mut watch_rx: Option<mpsc::Receiver<WatchEvent>>,
        publish_interval: Duration,
        refresh_interval: Duration,
    ) {
        info!(plugin_id = %self.plugin_id, "Plugin agent started");

        match self.pipeline.recover().await {
            Ok(action) => debug!(plugin_id = %self.plugin_id, ?action, "Startup recovery"),
            Err(e) => warn!(plugin_id = %self.plugin_id, error = %e, "Startup recovery failed"),
        }

        let mut publish = interval_at(Instant::now() + publish_interval, publish_interval);
        publish.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut refresh = interval_at(Instant::now(), refresh_interval);
        refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let message = tokio::select! {
                message = inbox.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
                watch = recv_watch(&mut watch_rx) => match watch {
                    Some(WatchEvent::Changed(path)) => AgentMessage::LogChanged(path),
                    None => {
                        warn!(plugin_id = %self.plugin_id, "Watcher stopped");
                        watch_rx = None;
                        continue;
                    }
                },
                _ = publish.tick() => AgentMessage::PublishTick,
                _ = refresh.tick() => AgentMessage::RefreshTick,
            };

            if !self.handle(message).await {
                break;
            }
        }

        info!(plugin_id = %self.plugin_id, "Plugin agent stopped");
    }

    /// Handles one message. Returns false when the agent should stop.
    pub async fn handle(&mut self, message: AgentMessage) -> bool {
        let now = Local::now().naive_local();

        match message {
            AgentMessage::LogChanged(path) => self.on_log_changed(path, now).await,
            AgentMessage::PublishTick => {
                if let Err(e) = self.run_cycle(now).await {
                    warn!(plugin_id = %self.plugin_id, error = %e, "Pipeline cycle failed");
                }
            }
            AgentMessage::PublishNow(reply) => {
                let _ = reply.send(self.run_cycle(now).await);
            }
            AgentMessage::RefreshTick => self.on_refresh(now).await,
            AgentMessage::MemberStateUpdated(state) => {
                let update = self.engine.update_member_state(state, now);
                self.broadcast(update).await;
            }
            AgentMessage::TroubleshootingThresholdExceeded => {
                let update = self.engine.troubleshooting_threshold_exceeded(now);
                self.broadcast(update).await;
            }
            AgentMessage::FileActivityReport(reply) => {
                let _ = reply.send(self.engine.file_activity_report());
            }
            AgentMessage::Status(reply) => {
                let _ = reply.send(self.engine.status());
            }
            AgentMessage::Shutdown => return false,
        }
        true
    }

    async fn on_log_changed(&mut self, path: PathBuf, now: NaiveDateTime) {
        let mut records: Vec<ActivityRecord> = Vec::new();
        let outcome = read_log(&path, &mut records, |acc, _kind, record| acc.push(record)).await;

        if let Some(e) = &outcome.io_error {
            debug!(
                plugin_id = %self.plugin_id,
                path = %path.display(),
                error = %e,
                "Live log unreadable"
            );
        } else if !outcome.failures.is_empty() {
            warn!(
                plugin_id = %self.plugin_id,
                path = %path.display(),
                failures = outcome.failures.len(),
                "Live log has unparseable lines"
            );
        }

        let fresh = self.dedup.admit(records);
        if fresh.is_empty() {
            return;
        }
        debug!(plugin_id = %self.plugin_id, records = fresh.len(), "New activity records");

        let update = self.engine.ingest(fresh, now);
        self.broadcast(update).await;
    }

    /// Reads the live log into the engine, then runs a pipeline cycle.
    ///
    /// Records appended since the last dispatched change would otherwise be
    /// committed without ever being counted. De-duplication makes the extra
    /// read idempotent.
    async fn run_cycle(&mut self, now: NaiveDateTime) -> Result<CycleReport> {
        let live = self.pipeline.folders().live().to_path_buf();
        if tokio::fs::try_exists(&live).await.unwrap_or(false) {
            self.on_log_changed(live, now).await;
        }

        let report = self.pipeline.run_cycle(self.service.as_ref()).await?;

        if report.committed {
            if let Some(watcher) = &self.watcher {
                watcher.rearm().await?;
            }
        }
        Ok(report)
    }

    async fn on_refresh(&mut self, now: NaiveDateTime) {
        let update = match self.fetch_snapshot().await {
            Ok(snapshot) => self.engine.apply_snapshot(snapshot, now),
            Err(e) => {
                warn!(
                    plugin_id = %self.plugin_id,
                    error = %e,
                    "Snapshot refresh failed, keeping previous"
                );
                self.engine.refresh(now)
            }
        };
        self.broadcast(update).await;
        self.engine.check_idle(now);
    }

    async fn fetch_snapshot(&self) -> Result<Snapshot> {
        let table = self.service.fetch_flow_state().await?;
        Ok(Snapshot::from_map(&table.to_key_value_map())?)
    }

    async fn broadcast(&self, update: Option<MomentumUpdate>) {
        let Some(update) = update else {
            return;
        };
        debug!(plugin_id = %self.plugin_id, momentum = update.momentum, "Momentum changed");
        if self.updates.send(update).await.is_err() {
            debug!(plugin_id = %self.plugin_id, "Momentum receiver dropped");
        }
    }
}

/// Receives from an optional channel; pending forever when there is none.
async fn recv_watch(rx: &mut Option<mpsc::Receiver<WatchEvent>>) -> Option<WatchEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
