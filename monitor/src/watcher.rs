//! Watcher for a plugin's live activity log.
//!
//! Every plugin writes to a single well-known file, `<plugin>/active.flow`.
//! The pipeline periodically renames that file away and the plugin starts a
//! fresh one, so the watcher has to follow the file across its disappearance.
//!
//! # State Machine
//!
//! ```text
//!            arm / created              found
//! Unarmed ─────────────────▶ CheckExists ──────▶ Watching
//!    ▲                        │    ▲                 │
//!    │   3 retries exhausted  │    │ renamed/removed │
//!    └────────────────────────┘    └─────────────────┘
//!                      not found: wait 5s, retry
//! ```
//!
//! While `Watching`, appends are debounced (100ms) and reported as
//! [`WatchEvent::Changed`] carrying only the path. The watcher keeps no
//! record-level state; callers de-duplicate by record end time.
//!
//! # Architecture
//!
//! The OS watch is placed on the plugin directory rather than the file so it
//! survives the file being renamed. The notify callback only classifies events
//! and forwards them through a channel to an async task that owns the state
//! machine, the retry timer, and the debounce window.
//!
//! # Example
//!
//! ```no_run
//! use std::path::PathBuf;
//! use tokio::sync::mpsc;
//! use flowpulse_monitor::watcher::{PluginWatcher, WatchEvent};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (tx, mut rx) = mpsc::channel(16);
//!     let _watcher = PluginWatcher::new(PathBuf::from("/home/me/.flowpulse/plugins/intellij"), tx)?;
//!
//!     while let Some(WatchEvent::Changed(path)) = rx.recv().await {
//!         println!("{} changed", path.display());
//!     }
//!     Ok(())
//! }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{
    event::ModifyKind, Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher,
};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::utils::debounce::DebounceWindow;

/// File name of the live log inside a plugin directory.
pub const LIVE_LOG_NAME: &str = "active.flow";

/// Delay between existence checks while the live log is missing.
pub const EXISTS_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Existence retries before the watcher gives up and disarms.
pub const MAX_EXISTS_RETRIES: u32 = 3;

/// Events emitted by the watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// The live log exists and has (possibly) new content.
    Changed(PathBuf),
}

/// Watcher lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    Unarmed,
    CheckExists,
    Watching,
}

/// What to do after an existence check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    /// The file is present; the watcher is now watching it.
    Found,
    /// The file is missing; check again after the retry delay.
    RetryLater,
    /// The file stayed missing through every retry; the watcher disarmed.
    GaveUp,
}

/// Pure transition logic for one plugin's watcher.
#[derive(Debug, Clone)]
pub struct WatchStateMachine {
    state: WatchState,
    retries: u32,
    max_retries: u32,
}

impl WatchStateMachine {
    #[must_use]
    pub fn new(max_retries: u32) -> Self {
        Self {
            state: WatchState::Unarmed,
            retries: 0,
            max_retries,
        }
    }

    #[must_use]
    pub fn state(&self) -> WatchState {
        self.state
    }

    #[must_use]
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Enters `CheckExists` with a fresh retry budget.
    pub fn arm(&mut self) {
        self.state = WatchState::CheckExists;
        self.retries = 0;
    }

    /// Applies the result of an existence check.
    pub fn on_exists_check(&mut self, found: bool) -> CheckOutcome {
        if self.state != WatchState::CheckExists {
            self.arm();
        }

        if found {
            self.state = WatchState::Watching;
            self.retries = 0;
            return CheckOutcome::Found;
        }

        if self.retries < self.max_retries {
            self.retries += 1;
            CheckOutcome::RetryLater
        } else {
            self.state = WatchState::Unarmed;
            CheckOutcome::GaveUp
        }
    }

    /// The live file was renamed or removed. Returns true if a check is needed.
    pub fn on_moved_away(&mut self) -> bool {
        if self.state == WatchState::Watching {
            self.arm();
            true
        } else {
            false
        }
    }

    /// The live file was created. Returns true if a check is needed.
    pub fn on_created(&mut self) -> bool {
        match self.state {
            WatchState::Unarmed => {
                self.arm();
                true
            }
            WatchState::CheckExists => true,
            WatchState::Watching => false,
        }
    }

    /// Whether a content change should be dispatched.
    #[must_use]
    pub fn accepts_changes(&self) -> bool {
        self.state == WatchState::Watching
    }
}

/// Errors that can occur while setting up a watcher.
#[derive(Error, Debug)]
pub enum WatcherError {
    /// Failed to initialize the file system watcher.
    #[error("failed to create watcher: {0}")]
    WatcherInit(#[from] notify::Error),

    /// The plugin directory does not exist.
    #[error("plugin directory does not exist: {0}")]
    DirectoryNotFound(PathBuf),

    /// The watcher task has stopped.
    #[error("watcher task stopped")]
    ChannelClosed,
}

/// Result type for watcher operations.
pub type Result<T> = std::result::Result<T, WatcherError>;

/// Timing knobs for a watcher.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    pub retry_delay: Duration,
    pub max_retries: u32,
    pub debounce: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            retry_delay: EXISTS_RETRY_DELAY,
            max_retries: MAX_EXISTS_RETRIES,
            debounce: Duration::from_millis(crate::utils::DEFAULT_DEBOUNCE_MS),
        }
    }
}

/// File-level signals forwarded from the notify callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InternalEvent {
    Created,
    Changed,
    MovedAway,
}

#[derive(Debug)]
enum Command {
    Rearm,
}

/// Watches one plugin's live log.
///
/// Dropping the watcher stops the OS watch and the processing task.
#[derive(Debug)]
pub struct PluginWatcher {
    /// Kept alive to maintain the watch subscription.
    #[allow(dead_code)]
    watcher: RecommendedWatcher,
    live_path: PathBuf,
    state_rx: watch::Receiver<WatchState>,
    command_tx: mpsc::Sender<Command>,
    task: JoinHandle<()>,
}

impl PluginWatcher {
    /// Starts watching `<plugin_dir>/active.flow` with default timings.
    ///
    /// # Errors
    ///
    /// Returns an error if the plugin directory does not exist or the OS
    /// watch cannot be installed.
    pub fn new(plugin_dir: PathBuf, events: mpsc::Sender<WatchEvent>) -> Result<Self> {
        Self::with_config(plugin_dir, events, WatcherConfig::default())
    }

    /// Starts watching with explicit timings.
    ///
    /// # Errors
    ///
    /// Same as [`PluginWatcher::new`].
    pub fn with_config(
        plugin_dir: PathBuf,
        events: mpsc::Sender<WatchEvent>,
        config: WatcherConfig,
    ) -> Result<Self> {
        if !plugin_dir.is_dir() {
            return Err(WatcherError::DirectoryNotFound(plugin_dir));
        }

        let live_path = plugin_dir.join(LIVE_LOG_NAME);
        let (internal_tx, internal_rx) = mpsc::channel::<InternalEvent>(256);
        let (command_tx, command_rx) = mpsc::channel::<Command>(8);
        let (state_tx, state_rx) = watch::channel(WatchState::Unarmed);

        let task = tokio::spawn(run_watch_loop(
            live_path.clone(),
            config,
            internal_rx,
            command_rx,
            state_tx,
            events,
        ));

        let watcher = create_watcher(internal_tx, &plugin_dir)?;

        info!(path = %live_path.display(), "Watching plugin log");

        Ok(Self {
            watcher,
            live_path,
            state_rx,
            command_tx,
            task,
        })
    }

    /// Path of the live log being watched.
    #[must_use]
    pub fn live_path(&self) -> &Path {
        &self.live_path
    }

    /// Current watcher state.
    #[must_use]
    pub fn state(&self) -> WatchState {
        *self.state_rx.borrow()
    }

    /// Returns to `CheckExists` with a fresh retry budget.
    ///
    /// # Errors
    ///
    /// Returns [`WatcherError::ChannelClosed`] if the watcher task has stopped.
    pub async fn rearm(&self) -> Result<()> {
        self.command_tx
            .send(Command::Rearm)
            .await
            .map_err(|_| WatcherError::ChannelClosed)
    }
}

impl Drop for PluginWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn create_watcher(
    internal_tx: mpsc::Sender<InternalEvent>,
    plugin_dir: &Path,
) -> Result<RecommendedWatcher> {
    let live_name = std::ffi::OsString::from(LIVE_LOG_NAME);
    let mut watcher = RecommendedWatcher::new(
        move |res: std::result::Result<Event, notify::Error>| {
            handle_notify_event(res, &live_name, &internal_tx);
        },
        Config::default(),
    )?;

    watcher.watch(plugin_dir, RecursiveMode::NonRecursive)?;
    debug!(dir = %plugin_dir.display(), "Started plugin directory watch");

    Ok(watcher)
}

/// Classifies a notify event. Runs on the notify thread, so it never blocks.
fn handle_notify_event(
    res: std::result::Result<Event, notify::Error>,
    live_name: &std::ffi::OsStr,
    internal_tx: &mpsc::Sender<InternalEvent>,
) {
    let event = match res {
        Ok(event) => event,
        Err(e) => {
            error!(error = %e, "File watcher error");
            return;
        }
    };

    trace!(kind = ?event.kind, paths = ?event.paths, "Received notify event");

    if !event
        .paths
        .iter()
        .any(|p| p.file_name() == Some(live_name))
    {
        return;
    }

    let internal = match event.kind {
        EventKind::Create(_) => InternalEvent::Created,
        EventKind::Modify(ModifyKind::Name(_)) | EventKind::Remove(_) => InternalEvent::MovedAway,
        EventKind::Modify(ModifyKind::Data(_)) | EventKind::Modify(ModifyKind::Any) => {
            InternalEvent::Changed
        }
        _ => return,
    };

    if let Err(e) = internal_tx.try_send(internal) {
        warn!(error = %e, "Failed to queue watch event, channel may be full");
    }
}

async fn run_watch_loop(
    live_path: PathBuf,
    config: WatcherConfig,
    mut internal_rx: mpsc::Receiver<InternalEvent>,
    mut command_rx: mpsc::Receiver<Command>,
    state_tx: watch::Sender<WatchState>,
    events: mpsc::Sender<WatchEvent>,
) {
    let mut machine = WatchStateMachine::new(config.max_retries);
    let mut debounce = DebounceWindow::new(config.debounce);

    machine.arm();
    let mut check_at: Option<Instant> = Some(Instant::now());
    state_tx.send_replace(machine.state());

    loop {
        tokio::select! {
            command = command_rx.recv() => match command {
                Some(Command::Rearm) => {
                    debug!(path = %live_path.display(), "Re-arming watcher");
                    machine.arm();
                    debounce.cancel();
                    check_at = Some(Instant::now());
                }
                None => break,
            },

            internal = internal_rx.recv() => match internal {
                Some(InternalEvent::Changed) => {
                    if machine.accepts_changes() {
                        debounce.touch(Instant::now());
                    }
                }
                Some(InternalEvent::Created) => {
                    if machine.on_created() {
                        check_at = Some(Instant::now());
                    } else {
                        debounce.touch(Instant::now());
                    }
                }
                Some(InternalEvent::MovedAway) => {
                    if machine.on_moved_away() {
                        info!(path = %live_path.display(), "Live log moved away, re-checking");
                        debounce.cancel();
                        check_at = Some(Instant::now());
                    }
                }
                None => break,
            },

            _ = sleep_until_opt(check_at) => {
                check_at = None;
                let found = tokio::fs::try_exists(&live_path).await.unwrap_or(false);
                match machine.on_exists_check(found) {
                    CheckOutcome::Found => {
                        debug!(path = %live_path.display(), "Live log found");
                        debounce.touch(Instant::now());
                    }
                    CheckOutcome::RetryLater => {
                        debug!(
                            path = %live_path.display(),
                            retry = machine.retries(),
                            "Live log missing, will retry"
                        );
                        check_at = Some(Instant::now() + config.retry_delay);
                    }
                    CheckOutcome::GaveUp => {
                        info!(
                            path = %live_path.display(),
                            "Live log still missing, watcher disarmed"
                        );
                    }
                }
            }

            _ = debounce.wait() => {
                if debounce.take_due(Instant::now()) && machine.accepts_changes() {
                    trace!(path = %live_path.display(), "Dispatching change");
                    if events.send(WatchEvent::Changed(live_path.clone())).await.is_err() {
                        debug!("Watch event receiver dropped");
                        break;
                    }
                }
            }
        }

        state_tx.send_replace(machine.state());
    }

    debug!(path = %live_path.display(), "Watch loop shutting down");
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Write;
    use tokio::time::timeout;

    fn fast_config() -> WatcherConfig {
        WatcherConfig {
            retry_delay: Duration::from_millis(50),
            max_retries: 3,
            debounce: Duration::from_millis(30),
        }
    }

    fn append(path: &Path, line: &str) {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .expect("Failed to open file");
        writeln!(file, "{line}").expect("Failed to append");
    }

    #[test]
    fn machine_starts_unarmed() {
        let machine = WatchStateMachine::new(3);
        assert_eq!(machine.state(), WatchState::Unarmed);
        assert!(!machine.accepts_changes());
    }

    #[test]
    fn machine_watches_once_found() {
        let mut machine = WatchStateMachine::new(3);
        machine.arm();
        assert_eq!(machine.on_exists_check(true), CheckOutcome::Found);
        assert_eq!(machine.state(), WatchState::Watching);
        assert!(machine.accepts_changes());
    }

    #[test]
    fn machine_gives_up_after_three_retries() {
        let mut machine = WatchStateMachine::new(3);
        machine.arm();

        assert_eq!(machine.on_exists_check(false), CheckOutcome::RetryLater);
        assert_eq!(machine.on_exists_check(false), CheckOutcome::RetryLater);
        assert_eq!(machine.on_exists_check(false), CheckOutcome::RetryLater);
        assert_eq!(machine.retries(), 3);
        assert_eq!(machine.on_exists_check(false), CheckOutcome::GaveUp);
        assert_eq!(machine.state(), WatchState::Unarmed);
    }

    #[test]
    fn rename_resets_retry_counter() {
        let mut machine = WatchStateMachine::new(3);
        machine.arm();
        machine.on_exists_check(false);
        machine.on_exists_check(false);
        machine.on_exists_check(true);

        assert!(machine.on_moved_away());
        assert_eq!(machine.state(), WatchState::CheckExists);
        assert_eq!(machine.retries(), 0);
    }

    #[test]
    fn rename_while_checking_is_ignored() {
        let mut machine = WatchStateMachine::new(3);
        machine.arm();
        assert!(!machine.on_moved_away());
    }

    #[test]
    fn creation_rearms_unarmed_watcher() {
        let mut machine = WatchStateMachine::new(0);
        machine.arm();
        assert_eq!(machine.on_exists_check(false), CheckOutcome::GaveUp);

        assert!(machine.on_created());
        assert_eq!(machine.state(), WatchState::CheckExists);
        assert_eq!(machine.retries(), 0);
    }

    #[tokio::test]
    async fn missing_directory_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = mpsc::channel(4);
        let result = PluginWatcher::new(dir.path().join("missing"), tx);
        assert!(matches!(result, Err(WatcherError::DirectoryNotFound(_))));
    }

    #[tokio::test]
    async fn existing_log_is_dispatched_and_appends_are_debounced() {
        let dir = tempfile::tempdir().unwrap();
        let live = dir.path().join(LIVE_LOG_NAME);
        append(&live, "first");

        let (tx, mut rx) = mpsc::channel(16);
        let watcher = PluginWatcher::with_config(dir.path().to_path_buf(), tx, fast_config())
            .expect("watcher should start");

        let first = timeout(Duration::from_secs(2), rx.recv()).await;
        assert_eq!(first.unwrap(), Some(WatchEvent::Changed(live.clone())));
        assert_eq!(watcher.state(), WatchState::Watching);

        for i in 0..5 {
            append(&live, &format!("burst {i}"));
        }

        let burst = timeout(Duration::from_secs(2), rx.recv()).await;
        assert_eq!(burst.unwrap(), Some(WatchEvent::Changed(live.clone())));

        // The whole burst collapses into one dispatch.
        let extra = timeout(Duration::from_millis(300), rx.recv()).await;
        assert!(extra.is_err(), "burst should produce a single event");
    }

    #[tokio::test]
    async fn watcher_follows_log_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let live = dir.path().join(LIVE_LOG_NAME);
        append(&live, "first");

        let (tx, mut rx) = mpsc::channel(16);
        let _watcher = PluginWatcher::with_config(dir.path().to_path_buf(), tx, fast_config())
            .expect("watcher should start");
        timeout(Duration::from_secs(2), rx.recv()).await.unwrap();

        fs::rename(&live, dir.path().join("moved.flow")).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        append(&live, "fresh");

        let after = timeout(Duration::from_secs(2), rx.recv()).await;
        assert_eq!(after.unwrap(), Some(WatchEvent::Changed(live)));
    }
}
