//! Process supervision for detected servers.
//!
//! The supervisor owns the map of running processes keyed by server id and
//! enforces at most one running instance per id. Start spawns the process
//! and its console relay; stop runs the graceful-then-forced termination
//! protocol. Removal from the map is guarded so a `stop()` racing the exit
//! watcher can never double-remove or double-notify.

pub mod error;
pub mod managed_process;
pub mod process;
pub mod state_machine;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, Mutex};

use crate::config::GlobalConfig;
use crate::detector::{self, ServerInfo};
use crate::files::{self, FileEntry};
use crate::properties;
use crate::utils::current_timestamp;
use error::SupervisorError;
use managed_process::{ConsoleBuffer, ManagedProcess};
use state_machine::{State, StateMachine};

/// Jar-name markers for modded distributions, in priority order. The first
/// marker with a matching jar wins; with no match the first jar in listing
/// order is used.
const JAR_MARKERS: [&str; 3] = ["forge", "fabric", "paper"];

/// Graceful stop: liveness polls at one-second intervals.
const STOP_POLL_ITERATIONS: u32 = 30;
/// How long a SIGTERM gets before escalating to SIGKILL.
const TERMINATE_TIMEOUT: Duration = Duration::from_secs(10);
/// Grace period after a SIGKILL before giving up on the waiter.
const KILL_TIMEOUT: Duration = Duration::from_secs(5);

/// Number of console lines included in a status report.
const STATUS_CONSOLE_LINES: usize = 20;

/// Event published when a server leaves the running map, whether through a
/// `stop()` call or its own exit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    Stopped { id: String },
}

/// A console attachment: the buffered replay plus, for a running server, a
/// live receiver yielding every subsequent line.
pub struct ConsoleAttach {
    /// Buffered lines, oldest first.
    pub replay: Vec<String>,
    /// Live line stream; `None` when the server is not running.
    pub live: Option<broadcast::Receiver<String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub id: String,
    pub name: String,
    pub running: bool,
    /// Seconds since the process was started; 0 when not running.
    pub uptime: u64,
    /// The most recent buffered console lines.
    pub console: Vec<String>,
}

/// One entry in the running map.
struct ManagedServer {
    id: String,
    process: ManagedProcess,
    state: std::sync::Mutex<StateMachine>,
    started_at: u64,
}

impl ManagedServer {
    /// Running -> Stopping, exactly once. A second caller (or a call racing
    /// the exit watcher's removal) gets `false`.
    fn begin_stopping(&self) -> bool {
        match self.state.lock() {
            Ok(mut sm) => sm.transition(State::Stopping).is_ok(),
            Err(e) => {
                tracing::error!("State lock poisoned for '{}': {}", self.id, e);
                false
            }
        }
    }
}

pub struct Supervisor {
    config: GlobalConfig,
    servers: Arc<Mutex<HashMap<String, Arc<ManagedServer>>>>,
    /// Console buffers by id. A server's buffer stays here after it exits so
    /// its last output remains readable; a restart installs a fresh one.
    consoles: Arc<Mutex<HashMap<String, Arc<Mutex<ConsoleBuffer>>>>>,
    /// Ids with a start in flight but no map entry yet.
    starting: Mutex<HashSet<String>>,
    events: broadcast::Sender<ServerEvent>,
}

impl Supervisor {
    pub fn new(config: GlobalConfig) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            config,
            servers: Arc::new(Mutex::new(HashMap::new())),
            consoles: Arc::new(Mutex::new(HashMap::new())),
            starting: Mutex::new(HashSet::new()),
            events,
        }
    }

    /// All detected servers, running or not.
    pub fn list_servers(&self) -> Vec<ServerInfo> {
        detector::detect_servers(&self.config.servers_dir)
    }

    /// Subscribe to termination notices.
    pub fn subscribe_events(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    /// Whether a running-map entry exists for the id.
    pub async fn is_running(&self, id: &str) -> bool {
        self.servers.lock().await.contains_key(id)
    }

    // ─── Lifecycle ───────────────────────────────────────────

    /// Start the server. Fails without side effects when the id is unknown,
    /// already has an entry, has no jar, or the spawn itself fails.
    pub async fn start(&self, id: &str) -> bool {
        match self.try_start(id).await {
            Ok(pid) => {
                tracing::info!("Started server '{}' with PID {}", id, pid);
                true
            }
            Err(e) => {
                tracing::error!("Failed to start server '{}' [{}]: {}", id, e.error_code(), e);
                false
            }
        }
    }

    async fn try_start(&self, id: &str) -> Result<u32, SupervisorError> {
        // Reserve the id up front so concurrent starts cannot both spawn,
        // then do the slow work (rescan, spawn) without holding the map
        // lock. Lock order is servers before starting.
        {
            let servers = self.servers.lock().await;
            let mut starting = self.starting.lock().await;
            if servers.contains_key(id) || !starting.insert(id.to_string()) {
                return Err(SupervisorError::AlreadyRunning(id.to_string()));
            }
        }
        let result = self.spawn_reserved(id).await;
        self.starting.lock().await.remove(id);
        result
    }

    async fn spawn_reserved(&self, id: &str) -> Result<u32, SupervisorError> {
        let dir = self
            .resolve_path(id)
            .ok_or_else(|| SupervisorError::NotFound(id.to_string()))?;
        let jar = select_jar(&dir)
            .ok_or_else(|| SupervisorError::NoArtifact(dir.display().to_string()))?;

        let props = properties::read_properties(&dir, &self.config.default_memory);
        let memory = props
            .get("memory")
            .cloned()
            .unwrap_or_else(|| self.config.default_memory.clone());

        let args = vec![
            format!("-Xmx{}", memory),
            format!("-Xms{}", memory),
            "-jar".to_string(),
            jar,
            "nogui".to_string(),
        ];
        let buffer = Arc::new(Mutex::new(ConsoleBuffer::new(
            self.config.console_buffer_size,
        )));
        let process = ManagedProcess::spawn(&self.config.java_path, &args, &dir, buffer.clone())
            .await
            .map_err(|e| SupervisorError::SpawnFailure(e.to_string()))?;
        let pid = process.pid;

        // Replace any buffer retained from a previous run of this id.
        self.consoles.lock().await.insert(id.to_string(), buffer);

        let mut state = StateMachine::new();
        let _ = state.transition(State::Running);
        let entry = Arc::new(ManagedServer {
            id: id.to_string(),
            process,
            state: std::sync::Mutex::new(state),
            started_at: current_timestamp(),
        });
        self.servers.lock().await.insert(id.to_string(), entry.clone());

        properties::touch_last_started(&dir);
        self.spawn_exit_watcher(entry);
        Ok(pid)
    }

    /// The exit watcher performs the relay-side removal: when the process
    /// exits on its own, the entry is removed and one termination notice is
    /// emitted, unless an explicit `stop()` already removed it.
    fn spawn_exit_watcher(&self, entry: Arc<ManagedServer>) {
        let servers = self.servers.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            entry.process.wait_for_exit().await;
            let removed = servers.lock().await.remove(&entry.id);
            if removed.is_some() {
                tracing::info!("Server '{}' exited", entry.id);
                let _ = events.send(ServerEvent::Stopped {
                    id: entry.id.clone(),
                });
            }
        });
    }

    /// Stop the server: write the `stop` command, poll liveness for up to
    /// 30 seconds, then SIGTERM with a 10-second grace period, then SIGKILL.
    /// The caller blocks for the duration; other ids are unaffected.
    pub async fn stop(&self, id: &str) -> bool {
        let entry = { self.servers.lock().await.get(id).cloned() };
        let Some(entry) = entry else {
            tracing::warn!("Server '{}' is not running", id);
            return false;
        };
        if !entry.begin_stopping() {
            tracing::warn!("Server '{}' is already stopping", id);
            return false;
        }

        if let Err(e) = entry.process.send_command("stop").await {
            // Broken stdin usually means the process vanished; make sure.
            tracing::error!("Error stopping server '{}': {}", id, e);
            if entry.process.is_running() {
                if let Err(e) = process::force_kill_pid(entry.process.pid) {
                    tracing::error!("Failed to kill PID {}: {}", entry.process.pid, e);
                }
                entry.process.wait_for_exit_timeout(KILL_TIMEOUT).await;
            }
            self.remove_and_notify(id).await;
            return false;
        }

        let mut exited = false;
        for _ in 0..STOP_POLL_ITERATIONS {
            if !entry.process.is_running() {
                exited = true;
                break;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        if !exited && entry.process.is_running() {
            tracing::warn!(
                "Server '{}' did not stop gracefully, forcing termination",
                id
            );
            if let Err(e) = process::terminate_pid(entry.process.pid) {
                tracing::error!("Failed to terminate PID {}: {}", entry.process.pid, e);
            }
            if !entry.process.wait_for_exit_timeout(TERMINATE_TIMEOUT).await {
                tracing::warn!("Server '{}' ignored termination, killing", id);
                if let Err(e) = process::force_kill_pid(entry.process.pid) {
                    tracing::error!("Failed to kill PID {}: {}", entry.process.pid, e);
                }
                entry.process.wait_for_exit_timeout(KILL_TIMEOUT).await;
            }
        }

        self.remove_and_notify(id).await;
        tracing::info!("Stopped server '{}'", id);
        true
    }

    /// Guarded removal: only the first of `stop()` and the exit watcher to
    /// observe a live entry removes it and emits the termination notice.
    async fn remove_and_notify(&self, id: &str) {
        let removed = self.servers.lock().await.remove(id);
        if removed.is_some() {
            let _ = self.events.send(ServerEvent::Stopped { id: id.to_string() });
        }
    }

    /// Send a command line to the server's stdin.
    pub async fn send_command(&self, id: &str, command: &str) -> bool {
        match self.try_send_command(id, command).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(
                    "Failed to send command to server '{}' [{}]: {}",
                    id,
                    e.error_code(),
                    e
                );
                false
            }
        }
    }

    async fn try_send_command(&self, id: &str, command: &str) -> Result<(), SupervisorError> {
        if command.trim().is_empty() {
            return Err(SupervisorError::EmptyCommand);
        }
        let entry = self
            .servers
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| SupervisorError::NotRunning(id.to_string()))?;
        entry.process.send_command(command).await.map_err(|e| {
            SupervisorError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                e.to_string(),
            ))
        })?;
        Ok(())
    }

    /// Status report for a detected server, or `None` when the id does not
    /// resolve at all.
    pub async fn status(&self, id: &str) -> Option<ServerStatus> {
        let info = detector::find_server(&self.config.servers_dir, id)?;
        let entry = { self.servers.lock().await.get(id).cloned() };
        match entry {
            Some(entry) => Some(ServerStatus {
                id: info.id,
                name: info.name,
                running: true,
                uptime: current_timestamp().saturating_sub(entry.started_at),
                console: entry.process.recent_console(STATUS_CONSOLE_LINES).await,
            }),
            None => {
                // The last process's buffer is retained, so a stopped
                // server still reports its final output.
                let buffer = { self.consoles.lock().await.get(id).cloned() };
                let console = match buffer {
                    Some(buffer) => buffer.lock().await.recent(STATUS_CONSOLE_LINES),
                    None => Vec::new(),
                };
                Some(ServerStatus {
                    id: info.id,
                    name: info.name,
                    running: false,
                    uptime: 0,
                    console,
                })
            }
        }
    }

    /// Attach to a server's console. For a running server the replay
    /// snapshot and the live receiver are registered atomically so nothing
    /// is missed or duplicated. For a stopped server with retained output
    /// the replay is returned without a live stream. `None` when the id has
    /// no console at all.
    pub async fn attach_console(&self, id: &str) -> Option<ConsoleAttach> {
        if let Some(entry) = { self.servers.lock().await.get(id).cloned() } {
            let (replay, rx) = entry.process.attach().await;
            return Some(ConsoleAttach {
                replay,
                live: Some(rx),
            });
        }
        let buffer = { self.consoles.lock().await.get(id).cloned() }?;
        let replay = buffer.lock().await.snapshot();
        Some(ConsoleAttach { replay, live: None })
    }

    /// Stop every running server; used on daemon shutdown.
    pub async fn shutdown_all(&self) {
        let ids: Vec<String> = { self.servers.lock().await.keys().cloned().collect() };
        for id in ids {
            self.stop(&id).await;
        }
    }

    // ─── Properties ──────────────────────────────────────────

    /// Merged properties view (config file plus virtual `memory` key).
    pub fn read_properties(&self, id: &str) -> Option<HashMap<String, String>> {
        let dir = self.resolve_path(id)?;
        Some(properties::read_properties(&dir, &self.config.default_memory))
    }

    /// Apply a properties patch. Refused while the server has a running-map
    /// entry: the live process does not re-read its config, so on-disk edits
    /// would silently diverge.
    pub async fn write_properties(&self, id: &str, patch: HashMap<String, String>) -> bool {
        let Some(dir) = self.resolve_path(id) else {
            tracing::warn!("Server '{}' not found", id);
            return false;
        };
        if self.is_running(id).await {
            tracing::warn!("Cannot update properties while server '{}' is running", id);
            return false;
        }
        match properties::write_properties(&dir, patch) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!("Failed to write properties for '{}': {}", id, e);
                false
            }
        }
    }

    // ─── Sandboxed files ─────────────────────────────────────

    pub fn list_files(&self, id: &str, relative: &str) -> Vec<FileEntry> {
        match self.resolve_path(id) {
            Some(dir) => files::list_files(&dir, relative),
            None => Vec::new(),
        }
    }

    pub fn read_file(&self, id: &str, relative: &str) -> String {
        match self.resolve_path(id) {
            Some(dir) => files::read_file(&dir, relative),
            None => String::new(),
        }
    }

    pub fn write_file(&self, id: &str, relative: &str, content: &str) -> bool {
        match self.resolve_path(id) {
            Some(dir) => files::write_file(&dir, relative, content),
            None => false,
        }
    }

    fn resolve_path(&self, id: &str) -> Option<PathBuf> {
        detector::resolve_path(&self.config.servers_dir, id)
    }
}

/// Pick the jar to launch: first matching modded-distribution marker in
/// priority order, otherwise the first jar in directory-listing order.
fn select_jar(dir: &Path) -> Option<String> {
    let jars = detector::jar_files(dir);
    for marker in JAR_MARKERS {
        if let Some(jar) = jars.iter().find(|jar| jar.to_lowercase().contains(marker)) {
            return Some(jar.clone());
        }
    }
    jars.into_iter().next()
}
