//! Connector supervisor: one external connector process per session
//!
//! This subsystem is responsible for:
//! - Launching `program args... <session_id>` bound to the allocated address
//! - Keeping a supervised-process table (pid, generation, restarts, token)
//! - Watching every child for exit and reporting it on a channel
//! - Terminating the previous process before a relaunch on the same address
//!
//! Each connector runs as the leader of its own process group, and stops
//! signal the whole group (SIGTERM, then SIGKILL after `stop_timeout_ms`) so
//! browsers the connector launched go down with it.
//!
//! `run_exit_monitor` feeds exits back to the registry, which marks crashed
//! sessions `disconnected` and asks for a backoff-delayed respawn.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_retry::strategy::ExponentialBackoff;
use uuid::Uuid;

use whatsflow_core::config::{ConnectorConfig, SupervisorConfig};
use whatsflow_core::{AddressAllocator, ConnectorAddress, Result, SessionId, WhatsflowError};

use crate::subsystems::registry::SessionRegistry;

/// Reported by an exit watcher once its child is gone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessExit {
    pub session_id: SessionId,
    pub generation: u64,
    pub code: Option<i32>,
    /// True when the supervisor itself killed the process.
    pub requested: bool,
}

pub type ExitReceiver = mpsc::UnboundedReceiver<ProcessExit>;

/// Supervisor view of one session, for the API.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessInfo {
    pub session_id: SessionId,
    pub running: bool,
    pub pid: Option<u32>,
    pub generation: u64,
    pub address: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub restarts: u32,
    pub last_exit_code: Option<i32>,
}

struct RunningProcess {
    pid: Option<u32>,
    address: ConnectorAddress,
    started_at: DateTime<Utc>,
    stop_tx: Option<oneshot::Sender<()>>,
    watcher: JoinHandle<()>,
}

#[derive(Default)]
struct Slot {
    generation: u64,
    restarts: u32,
    token: Option<String>,
    last_exit_code: Option<i32>,
    process: Option<RunningProcess>,
}

impl Slot {
    fn info(&self, session_id: SessionId) -> ProcessInfo {
        ProcessInfo {
            session_id,
            running: self.process.is_some(),
            pid: self.process.as_ref().and_then(|p| p.pid),
            generation: self.generation,
            address: self.process.as_ref().map(|p| p.address.to_string()),
            started_at: self.process.as_ref().map(|p| p.started_at),
            restarts: self.restarts,
            last_exit_code: self.last_exit_code,
        }
    }
}

type Table = Arc<Mutex<HashMap<SessionId, Slot>>>;

fn table_guard(table: &Table) -> MutexGuard<'_, HashMap<SessionId, Slot>> {
    // A panic while holding the lock leaves plain bookkeeping behind; keep going.
    table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct ConnectorSupervisor {
    connector: ConnectorConfig,
    policy: SupervisorConfig,
    allocator: AddressAllocator,
    table: Table,
    spawn_locks: Mutex<HashMap<SessionId, Arc<tokio::sync::Mutex<()>>>>,
    /// Ids whose session was deleted. Launches for them are refused.
    retired: Mutex<HashSet<SessionId>>,
    exits_tx: mpsc::UnboundedSender<ProcessExit>,
}

impl ConnectorSupervisor {
    pub fn new(
        connector: ConnectorConfig,
        policy: SupervisorConfig,
        allocator: AddressAllocator,
    ) -> (Self, ExitReceiver) {
        let (exits_tx, exits_rx) = mpsc::unbounded_channel();
        let supervisor = Self {
            connector,
            policy,
            allocator,
            table: Arc::new(Mutex::new(HashMap::new())),
            spawn_locks: Mutex::new(HashMap::new()),
            retired: Mutex::new(HashSet::new()),
            exits_tx,
        };
        (supervisor, exits_rx)
    }

    pub fn allocator(&self) -> &AddressAllocator {
        &self.allocator
    }

    /// Launch (or relaunch) the connector for `session_id`. Resets the crash
    /// restart budget.
    pub async fn spawn(&self, session_id: SessionId) -> Result<ProcessInfo> {
        let lock = self.spawn_lock(session_id);
        let _guard = lock.lock().await;
        self.launch(session_id, true).await
    }

    /// Relaunch after a crash, unless something else already replaced the
    /// process that exited. Returns `Ok(None)` when nothing was done.
    pub async fn respawn(
        &self,
        session_id: SessionId,
        expected_generation: u64,
    ) -> Result<Option<ProcessInfo>> {
        let lock = self.spawn_lock(session_id);
        let _guard = lock.lock().await;

        let stale = match table_guard(&self.table).get(&session_id) {
            Some(slot) => slot.generation != expected_generation || slot.process.is_some(),
            None => true,
        };
        if stale {
            return Ok(None);
        }
        self.launch(session_id, false).await.map(Some)
    }

    /// Stop the session's process, if any, and forget its slot. The id is
    /// retired first, so a launch still queued on the spawn lock is refused.
    pub async fn terminate(&self, session_id: SessionId) {
        self.retired
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(session_id);

        let lock = self.spawn_lock(session_id);
        let _guard = lock.lock().await;
        self.stop_current(session_id).await;
        table_guard(&self.table).remove(&session_id);
    }

    /// Kill every supervised process. Called on control-plane shutdown.
    pub async fn shutdown(&self) {
        let processes: Vec<(SessionId, RunningProcess)> = table_guard(&self.table)
            .iter_mut()
            .filter_map(|(id, slot)| slot.process.take().map(|p| (*id, p)))
            .collect();

        tracing::info!(count = processes.len(), "Stopping connector processes");
        let timeout = self.stop_timeout();
        futures::future::join_all(
            processes
                .into_iter()
                .map(|(id, process)| stop_process(id, process, timeout)),
        )
        .await;
    }

    pub fn info(&self, session_id: SessionId) -> ProcessInfo {
        table_guard(&self.table)
            .get(&session_id)
            .map(|slot| slot.info(session_id))
            .unwrap_or_else(|| Slot::default().info(session_id))
    }

    pub fn is_running(&self, session_id: SessionId) -> bool {
        table_guard(&self.table)
            .get(&session_id)
            .map_or(false, |slot| slot.process.is_some())
    }

    pub fn snapshot(&self) -> Vec<ProcessInfo> {
        let mut infos: Vec<ProcessInfo> = table_guard(&self.table)
            .iter()
            .map(|(id, slot)| slot.info(*id))
            .collect();
        infos.sort_by_key(|i| i.session_id);
        infos
    }

    /// True when `token` is the one issued to the session's current process.
    pub fn verify_token(&self, session_id: SessionId, token: Option<&str>) -> bool {
        match (table_guard(&self.table).get(&session_id), token) {
            (Some(Slot { token: Some(expected), .. }), Some(given)) => expected == given,
            _ => false,
        }
    }

    /// Whether `exit` belongs to the process the table still considers current.
    pub fn is_current_exit(&self, exit: &ProcessExit) -> bool {
        !exit.requested
            && table_guard(&self.table)
                .get(&exit.session_id)
                .map_or(false, |slot| {
                    slot.generation == exit.generation && slot.process.is_none()
                })
    }

    /// Backoff before the next crash restart, or `None` when auto-restart is
    /// off or the budget is spent.
    pub fn restart_delay(&self, session_id: SessionId) -> Option<Duration> {
        if !self.policy.auto_restart {
            return None;
        }
        let restarts = table_guard(&self.table).get(&session_id)?.restarts;
        if restarts >= self.policy.max_restarts {
            return None;
        }
        Some(backoff_delay(&self.policy, restarts))
    }

    // ------------------------------------------------------------------------
    // internals
    // ------------------------------------------------------------------------

    fn spawn_lock(&self, session_id: SessionId) -> Arc<tokio::sync::Mutex<()>> {
        self.spawn_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(session_id)
            .or_default()
            .clone()
    }

    fn is_retired(&self, session_id: SessionId) -> bool {
        self.retired
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(&session_id)
    }

    fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.policy.stop_timeout_ms)
    }

    async fn stop_current(&self, session_id: SessionId) {
        let previous = table_guard(&self.table)
            .get_mut(&session_id)
            .and_then(|slot| slot.process.take());
        if let Some(process) = previous {
            stop_process(session_id, process, self.stop_timeout()).await;
        }
    }

    /// Caller holds the per-session spawn lock.
    async fn launch(&self, session_id: SessionId, reset_budget: bool) -> Result<ProcessInfo> {
        if self.is_retired(session_id) {
            return Err(WhatsflowError::NotFound(format!(
                "Session {} was deleted",
                session_id
            )));
        }
        self.stop_current(session_id).await;

        let address = self.allocator.address_for(session_id)?;
        ensure_address_free(&address).await?;

        let token = Uuid::new_v4().to_string();
        let mut command = self.build_command(session_id, &address, &token);
        let child = command.spawn().map_err(|e| {
            WhatsflowError::SpawnFailed(format!("{}: {}", self.connector.program, e))
        })?;
        let pid = child.id();

        let mut table = table_guard(&self.table);
        let slot = table.entry(session_id).or_default();
        slot.generation += 1;
        if reset_budget {
            slot.restarts = 0;
        } else {
            slot.restarts += 1;
        }
        slot.token = Some(token);

        let (stop_tx, stop_rx) = oneshot::channel();
        let watcher = tokio::spawn(watch_exit(
            session_id,
            slot.generation,
            child,
            stop_rx,
            self.stop_timeout(),
            self.table.clone(),
            self.exits_tx.clone(),
        ));
        slot.process = Some(RunningProcess {
            pid,
            address: address.clone(),
            started_at: Utc::now(),
            stop_tx: Some(stop_tx),
            watcher,
        });

        tracing::info!(
            session_id,
            pid = ?pid,
            address = %address,
            generation = slot.generation,
            restarts = slot.restarts,
            "Started connector"
        );
        Ok(slot.info(session_id))
    }

    fn build_command(&self, session_id: SessionId, address: &ConnectorAddress, token: &str) -> Command {
        let program = shellexpand::tilde(&self.connector.program).into_owned();
        let callback_url = format!(
            "{}/sessions/{}/status",
            self.connector.callback_url.trim_end_matches('/'),
            session_id
        );

        let mut command = Command::new(program);
        command
            .args(&self.connector.args)
            .arg(session_id.to_string())
            .env("WHATSFLOW_SESSION_ID", session_id.to_string())
            .env("WHATSFLOW_CONNECTOR_HOST", &address.host)
            .env("WHATSFLOW_CONNECTOR_PORT", address.port.to_string())
            .env("WHATSFLOW_CALLBACK_URL", callback_url)
            .env("WHATSFLOW_CALLBACK_TOKEN", token)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        if let Some(dir) = &self.connector.working_dir {
            command.current_dir(PathBuf::from(shellexpand::tilde(dir).into_owned()));
        }
        command
    }
}

/// Bind-probe the connector address. A listener already on the port means
/// another process owns it and the new connector would fail to bind.
async fn ensure_address_free(address: &ConnectorAddress) -> Result<()> {
    match TcpListener::bind((address.host.as_str(), address.port)).await {
        Ok(listener) => {
            drop(listener);
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
            Err(WhatsflowError::AddressInUse(address.to_string()))
        }
        // connector host is not an address of this machine; nothing to probe
        Err(e) if e.kind() == std::io::ErrorKind::AddrNotAvailable => {
            tracing::warn!(address = %address, "Connector host is not local, skipping port probe");
            Ok(())
        }
        Err(e) => Err(WhatsflowError::SpawnFailed(format!(
            "cannot bind {}: {}",
            address, e
        ))),
    }
}

#[derive(Debug, Clone, Copy)]
enum GroupSignal {
    Terminate,
    Kill,
}

/// Signal every process in the connector's group. Returns false when no
/// signal could be sent (empty group, or no process groups on this platform).
#[cfg(unix)]
fn signal_group(pid: u32, signal: GroupSignal) -> bool {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    let signal = match signal {
        GroupSignal::Terminate => libc::SIGTERM,
        GroupSignal::Kill => libc::SIGKILL,
    };
    // pgid == pid: connectors are spawned with process_group(0)
    unsafe { libc::killpg(pgid, signal) == 0 }
}

#[cfg(not(unix))]
fn signal_group(_pid: u32, _signal: GroupSignal) -> bool {
    false
}

async fn stop_process(session_id: SessionId, mut process: RunningProcess, grace: Duration) {
    if let Some(stop_tx) = process.stop_tx.take() {
        let _ = stop_tx.send(());
    }
    // the watcher spends up to `grace` on SIGTERM before escalating
    let bound = grace * 2 + Duration::from_secs(1);
    match tokio::time::timeout(bound, &mut process.watcher).await {
        Ok(_) => tracing::debug!(session_id, pid = ?process.pid, "Connector stopped"),
        Err(_) => {
            tracing::warn!(session_id, pid = ?process.pid, "Connector did not stop in time, aborting watcher");
            if let Some(pid) = process.pid {
                signal_group(pid, GroupSignal::Kill);
            }
            // Aborting drops the Child, and kill_on_drop sends SIGKILL.
            process.watcher.abort();
        }
    }
}

/// SIGTERM the group, wait up to `grace`, then SIGKILL.
async fn stop_child(
    session_id: SessionId,
    pid: Option<u32>,
    child: &mut Child,
    grace: Duration,
) -> std::io::Result<ExitStatus> {
    let terminated = pid.map_or(false, |pid| signal_group(pid, GroupSignal::Terminate));
    if terminated {
        if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
            return status;
        }
        tracing::warn!(session_id, pid = ?pid, "Connector ignored SIGTERM, killing");
        if let Some(pid) = pid {
            signal_group(pid, GroupSignal::Kill);
        }
    }
    if let Err(e) = child.start_kill() {
        tracing::debug!(session_id, error = %e, "Kill failed, process already gone");
    }
    child.wait().await
}

async fn watch_exit(
    session_id: SessionId,
    generation: u64,
    mut child: Child,
    stop_rx: oneshot::Receiver<()>,
    grace: Duration,
    table: Table,
    exits_tx: mpsc::UnboundedSender<ProcessExit>,
) {
    let pid = child.id();
    let (status, requested) = tokio::select! {
        status = child.wait() => (status, false),
        _ = stop_rx => (stop_child(session_id, pid, &mut child, grace).await, true),
    };

    // anything the connector left running in its group goes too
    if let Some(pid) = pid {
        signal_group(pid, GroupSignal::Kill);
    }

    let code = match status {
        Ok(status) => status.code(),
        Err(e) => {
            tracing::error!(session_id, error = %e, "Failed to wait on connector");
            None
        }
    };

    if !requested {
        let mut guard = table_guard(&table);
        if let Some(slot) = guard.get_mut(&session_id) {
            if slot.generation == generation {
                slot.process = None;
                slot.last_exit_code = code;
            }
        }
        tracing::warn!(session_id, generation, code = ?code, "Connector exited");
    }

    let _ = exits_tx.send(ProcessExit {
        session_id,
        generation,
        code,
        requested,
    });
}

fn backoff_delay(policy: &SupervisorConfig, restarts: u32) -> Duration {
    // 2^n * base/2 => base, 2*base, 4*base, ...
    let factor = (policy.backoff_base_ms / 2).max(1);
    ExponentialBackoff::from_millis(2)
        .factor(factor)
        .max_delay(Duration::from_millis(policy.backoff_max_ms))
        .nth(restarts as usize)
        .unwrap_or_else(|| Duration::from_millis(policy.backoff_max_ms))
}

/// Consume exit reports until shutdown or until every sender is gone.
pub async fn run_exit_monitor(
    mut exits: ExitReceiver,
    registry: Arc<SessionRegistry>,
    mut shutdown: broadcast::Receiver<()>,
) {
    tracing::info!("Connector exit monitor started");
    loop {
        tokio::select! {
            exit = exits.recv() => {
                let Some(exit) = exit else { break };
                registry.handle_connector_exit(exit).await;
            }
            _ = shutdown.recv() => {
                tracing::info!("Connector exit monitor shutting down");
                break;
            }
        }
    }
}
