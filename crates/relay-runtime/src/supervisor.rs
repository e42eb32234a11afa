//! Lifecycle management for forwarder processes.
//!
//! The [`ProcessSupervisor`] is the process registry: at most one
//! [`ProcessHandle`] per client id, registered atomically with the spawn.
//! Each process gets one collector task per output pipe and one exit-monitor
//! task. The monitor owns the [`Child`], so signals are delivered through it
//! and never to a pid that may already have been reused.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use relay_core::error::{RelayError, Result};
use relay_core::layout::StorageLayout;
use relay_core::models::{ClientConfig, ProcessInfo, ProcessStatus, ScriptFormat};
use relay_core::settings::SupervisorConfig;
use relay_data::log_store::{DailyLogWriter, LogStore};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::log_hub::{format_line, LogHub, LogStream, LogSubscription};

/// How long a forced kill may take before `stop` gives up waiting.
const KILL_WAIT: Duration = Duration::from_secs(2);

/// How long the monitor waits for collectors to flush after exit.
const COLLECTOR_DRAIN: Duration = Duration::from_secs(1);

// ── Argument vector ───────────────────────────────────────────────────────────

/// Forwarder command line for `client`, saving events into `save_dir`.
///
/// ```text
/// client [--target-connection-timeout N] --saveDir DIR [--httpie]
///        [--ignore-event T]... [--noReplay] [--sse-buffer-size N] SOURCE TARGET
/// ```
pub fn build_forwarder_args(client: &ClientConfig, save_dir: &Path) -> Vec<String> {
    let mut args = vec!["client".to_string()];

    if client.target_timeout_secs > 0 {
        args.push("--target-connection-timeout".to_string());
        args.push(client.target_timeout_secs.to_string());
    }

    args.push("--saveDir".to_string());
    args.push(save_dir.to_string_lossy().into_owned());

    if client.script_format == ScriptFormat::Httpie {
        args.push("--httpie".to_string());
    }

    for event_type in client.ignore_events.iter().filter(|e| !e.is_empty()) {
        args.push("--ignore-event".to_string());
        args.push(event_type.clone());
    }

    if client.save_only {
        args.push("--noReplay".to_string());
    }

    if client.buffer_size > 0 {
        args.push("--sse-buffer-size".to_string());
        args.push(client.buffer_size.to_string());
    }

    args.push(client.source_url.clone());
    args.push(client.target_url.clone());
    args
}

// ── ProcessHandle ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
enum Control {
    Terminate,
    Kill,
}

#[derive(Debug)]
struct HandleState {
    status: ProcessStatus,
    pid: Option<u32>,
    last_error: Option<String>,
}

/// One supervised forwarder instance.
#[derive(Debug)]
pub struct ProcessHandle {
    client: ClientConfig,
    started_at: DateTime<Utc>,
    restart_count: u32,
    hub: LogHub,
    state: Mutex<HandleState>,
    stop_requested: AtomicBool,
    control: mpsc::UnboundedSender<Control>,
    exited: watch::Receiver<bool>,
}

impl ProcessHandle {
    fn lock_state(&self) -> MutexGuard<'_, HandleState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_live(&self) -> bool {
        self.lock_state().status == ProcessStatus::Running
    }

    fn pid(&self) -> Option<u32> {
        self.lock_state().pid
    }

    pub fn info(&self) -> ProcessInfo {
        let state = self.lock_state();
        ProcessInfo {
            client_id: self.client.id.clone(),
            pid: state.pid,
            status: state.status,
            started_at: self.started_at,
            restart_count: self.restart_count,
            last_error: state.last_error.clone(),
        }
    }

    /// `true` once the monitor has observed the exit, within `limit`.
    async fn wait_exit(&self, limit: Duration) -> bool {
        let mut exited = self.exited.clone();
        // A dropped sender also means the monitor is gone.
        let observed = tokio::time::timeout(limit, exited.wait_for(|done| *done))
            .await
            .is_ok();
        observed
    }
}

/// How `start_inner` picks the restart counter of the new handle.
enum StartMode {
    /// Caller-initiated start; carries the counter of an exited handle.
    Fresh,
    /// Explicit restart with the given counter.
    Restart(u32),
    /// Automatic restart; only proceeds while `replacing` is still registered.
    Auto {
        replacing: Arc<ProcessHandle>,
        restart_count: u32,
    },
}

// ── Status listener ───────────────────────────────────────────────────────────

/// Told about status changes the supervisor makes without a caller asking:
/// a crash (`Error`) and a successful automatic restart (`Running`).
#[derive(Clone)]
pub struct StatusListener(Arc<dyn Fn(&ClientConfig, ProcessStatus) + Send + Sync>);

impl StatusListener {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&ClientConfig, ProcessStatus) + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    fn notify(&self, client: &ClientConfig, status: ProcessStatus) {
        (self.0)(client, status)
    }
}

impl fmt::Debug for StatusListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StatusListener")
    }
}

// ── ProcessSupervisor ─────────────────────────────────────────────────────────

/// Registry of supervised forwarder processes.
///
/// Construct once with [`ProcessSupervisor::new`] and call
/// [`ProcessSupervisor::stop_all`] at shutdown.
#[derive(Debug)]
pub struct ProcessSupervisor {
    config: SupervisorConfig,
    layout: StorageLayout,
    logs: LogStore,
    registry: Mutex<HashMap<String, Arc<ProcessHandle>>>,
    listener: Option<StatusListener>,
    weak_self: Weak<ProcessSupervisor>,
}

impl ProcessSupervisor {
    pub fn new(config: SupervisorConfig) -> Arc<Self> {
        Self::build(config, None)
    }

    /// Like [`ProcessSupervisor::new`], reporting crashes and automatic
    /// restarts to `listener`.
    pub fn with_status_listener(config: SupervisorConfig, listener: StatusListener) -> Arc<Self> {
        Self::build(config, Some(listener))
    }

    fn build(config: SupervisorConfig, listener: Option<StatusListener>) -> Arc<Self> {
        let layout = StorageLayout::new(&config.base_dir);
        Arc::new_cyclic(|weak_self| Self {
            config,
            logs: LogStore::new(layout.clone()),
            layout,
            registry: Mutex::new(HashMap::new()),
            listener,
            weak_self: weak_self.clone(),
        })
    }

    fn notify(&self, client: &ClientConfig, status: ProcessStatus) {
        if let Some(listener) = &self.listener {
            listener.notify(client, status);
        }
    }

    fn lock_registry(&self) -> MutexGuard<'_, HashMap<String, Arc<ProcessHandle>>> {
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lookup(&self, client_id: &str) -> Option<Arc<ProcessHandle>> {
        self.lock_registry().get(client_id).cloned()
    }

    // ── Public API ────────────────────────────────────────────────────────

    /// Spawn the forwarder for `client`.
    ///
    /// Fails with `AlreadyRunning` when a live handle exists. An exited
    /// (`Error`) handle is replaced and its subscribers are closed. Must be
    /// called from within a Tokio runtime.
    pub fn start(&self, client: &ClientConfig) -> Result<ProcessInfo> {
        self.start_inner(client, StartMode::Fresh)
    }

    /// Terminate the forwarder gracefully, escalating to a kill after the
    /// grace window. All log subscribers are closed before the handle is
    /// removed.
    pub async fn stop(&self, client_id: &str) -> Result<()> {
        let handle = self
            .lookup(client_id)
            .ok_or_else(|| RelayError::NotRunning(client_id.to_string()))?;

        if !handle.is_live() {
            self.dispose(client_id, &handle);
            return Err(RelayError::NotRunning(client_id.to_string()));
        }

        handle.stop_requested.store(true, Ordering::SeqCst);
        let pid = handle.pid();
        let subscribers = handle.hub.subscriber_count();
        info!(client_id, ?pid, subscribers, "stopping forwarder");

        // The monitor may already have exited; nothing left to signal then.
        let _ = handle.control.send(Control::Terminate);

        if !handle.wait_exit(self.config.stop_grace).await {
            warn!(client_id, ?pid, "forwarder ignored SIGTERM; killing");
            let _ = handle.control.send(Control::Kill);
            if !handle.wait_exit(KILL_WAIT).await {
                error!(client_id, ?pid, "forwarder still not reaped after kill");
            }
        }

        self.dispose(client_id, &handle);
        info!(client_id, "forwarder stopped");
        Ok(())
    }

    /// Stop (if running), settle, then start with an incremented counter.
    pub async fn restart(&self, client: &ClientConfig) -> Result<ProcessInfo> {
        let previous = self
            .lookup(&client.id)
            .map(|h| h.restart_count)
            .unwrap_or(0);

        match self.stop(&client.id).await {
            Ok(()) | Err(RelayError::NotRunning(_)) => {}
            Err(e) => return Err(e),
        }

        tokio::time::sleep(self.config.restart_settle).await;
        self.start_inner(client, StartMode::Restart(previous.saturating_add(1)))
    }

    pub fn is_running(&self, client_id: &str) -> bool {
        self.lookup(client_id).map(|h| h.is_live()).unwrap_or(false)
    }

    /// Current state of a registered handle, including crashed ones.
    pub fn get_process_info(&self, client_id: &str) -> Result<ProcessInfo> {
        self.lookup(client_id)
            .map(|h| h.info())
            .ok_or_else(|| RelayError::NotRunning(client_id.to_string()))
    }

    /// Info for every registered handle.
    pub fn list_processes(&self) -> Vec<ProcessInfo> {
        let mut infos: Vec<ProcessInfo> = self.lock_registry().values().map(|h| h.info()).collect();
        infos.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        infos
    }

    /// Captured history plus a live subscription to new lines.
    pub fn subscribe_logs(&self, client_id: &str) -> Result<(Vec<String>, LogSubscription)> {
        let handle = self
            .lookup(client_id)
            .ok_or_else(|| RelayError::NotRunning(client_id.to_string()))?;
        Ok(handle.hub.subscribe_with_history())
    }

    pub fn log_history(&self, client_id: &str) -> Result<Vec<String>> {
        self.lookup(client_id)
            .map(|h| h.hub.history())
            .ok_or_else(|| RelayError::NotRunning(client_id.to_string()))
    }

    /// Stop every registered handle.
    pub async fn stop_all(&self) {
        let ids: Vec<String> = self.lock_registry().keys().cloned().collect();
        if !ids.is_empty() {
            info!(count = ids.len(), "stopping all forwarders");
        }
        for id in ids {
            match self.stop(&id).await {
                Ok(()) | Err(RelayError::NotRunning(_)) => {}
                Err(e) => warn!(client_id = %id, error = %e, "failed to stop forwarder"),
            }
        }
    }

    // ── Internal helpers ──────────────────────────────────────────────────

    /// Check, spawn and register under one registry lock.
    fn start_inner(&self, client: &ClientConfig, mode: StartMode) -> Result<ProcessInfo> {
        let mut registry = self.lock_registry();
        let existing = registry.get(&client.id).cloned();

        if let StartMode::Auto { replacing, .. } = &mode {
            let still_current = existing
                .as_ref()
                .map(|h| Arc::ptr_eq(h, replacing))
                .unwrap_or(false);
            if !still_current {
                return Err(RelayError::NotRunning(client.id.clone()));
            }
        }

        if let Some(h) = &existing {
            if h.is_live() {
                return Err(RelayError::AlreadyRunning(client.id.clone()));
            }
        }

        let restart_count = match mode {
            StartMode::Fresh => existing.as_ref().map(|h| h.restart_count).unwrap_or(0),
            StartMode::Restart(n) => n,
            StartMode::Auto { restart_count, .. } => restart_count,
        };

        let handle = match self.spawn(client, restart_count) {
            Ok(handle) => handle,
            Err(e) => {
                if let Some(stale) = &existing {
                    stale.lock_state().last_error = Some(e.to_string());
                }
                return Err(e);
            }
        };

        if let Some(stale) = existing {
            stale.hub.close_all();
        }
        registry.insert(client.id.clone(), Arc::clone(&handle));
        Ok(handle.info())
    }

    fn spawn(&self, client: &ClientConfig, restart_count: u32) -> Result<Arc<ProcessHandle>> {
        let save_dir = self.layout.events_dir(&client.owner_id, &client.id);
        if let Err(e) = std::fs::create_dir_all(&save_dir) {
            warn!(client_id = %client.id, error = %e, "could not create save directory");
        }
        let args = build_forwarder_args(client, &save_dir);

        let mut child = Command::new(&self.config.forwarder_bin)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| RelayError::ProcessSpawn {
                client_id: client.id.clone(),
                source,
            })?;

        let pid = child.id();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (exited_tx, exited_rx) = watch::channel(false);

        let handle = Arc::new(ProcessHandle {
            client: client.clone(),
            started_at: Utc::now(),
            restart_count,
            hub: LogHub::new(self.config.log_history, self.config.subscriber_capacity),
            state: Mutex::new(HandleState {
                status: ProcessStatus::Running,
                pid,
                last_error: None,
            }),
            stop_requested: AtomicBool::new(false),
            control: control_tx,
            exited: exited_rx,
        });

        let sink = Arc::new(Mutex::new(self.logs.writer(&client.owner_id, &client.id)));
        let mut collectors = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            collectors.push(tokio::spawn(collect_output(
                stdout,
                LogStream::Stdout,
                handle.hub.clone(),
                Arc::clone(&sink),
                client.id.clone(),
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            collectors.push(tokio::spawn(collect_output(
                stderr,
                LogStream::Stderr,
                handle.hub.clone(),
                sink,
                client.id.clone(),
            )));
        }

        tokio::spawn(monitor_process(
            child,
            Arc::clone(&handle),
            control_rx,
            exited_tx,
            collectors,
            self.weak_self.clone(),
        ));

        info!(client_id = %client.id, ?pid, restart_count, "forwarder started");
        debug!(client_id = %client.id, ?args, "forwarder arguments");
        Ok(handle)
    }

    /// Close subscribers and unregister, unless a newer handle took the slot.
    fn dispose(&self, client_id: &str, handle: &Arc<ProcessHandle>) {
        handle.hub.close_all();
        let mut registry = self.lock_registry();
        if registry
            .get(client_id)
            .map(|current| Arc::ptr_eq(current, handle))
            .unwrap_or(false)
        {
            registry.remove(client_id);
        }
    }
}

// ── Tasks ─────────────────────────────────────────────────────────────────────

/// Forward each line of one pipe into the hub and the daily log file until EOF.
async fn collect_output<R>(
    pipe: R,
    stream: LogStream,
    hub: LogHub,
    sink: Arc<Mutex<DailyLogWriter>>,
    client_id: String,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut reader = BufReader::new(pipe);
    let mut buf = Vec::new();
    let mut sink_failed = false;
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf);
                let text = text.trim_end_matches(['\n', '\r']);
                let now = Utc::now();
                let line = format_line(now, stream, text);
                debug!(client_id = %client_id, "{}", line);

                let written = sink
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .write_line(now, &line);
                // Warn once per pipe; the hub still gets every line.
                if let Err(e) = written {
                    if !sink_failed {
                        warn!(client_id = %client_id, %stream, error = %e, "failed to write log file");
                        sink_failed = true;
                    }
                }
                hub.add_log(line);
            }
            Err(e) => {
                warn!(client_id = %client_id, %stream, error = %e, "error reading forwarder output");
                break;
            }
        }
    }
}

/// Own the child until it exits, then record how it ended.
async fn monitor_process(
    mut child: Child,
    handle: Arc<ProcessHandle>,
    mut control: mpsc::UnboundedReceiver<Control>,
    exited: watch::Sender<bool>,
    collectors: Vec<JoinHandle<()>>,
    supervisor: Weak<ProcessSupervisor>,
) {
    let client_id = handle.client.id.clone();

    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            Some(cmd) = control.recv() => deliver(&mut child, cmd, &client_id),
        }
    };

    let deadline = tokio::time::Instant::now() + COLLECTOR_DRAIN;
    for collector in collectors {
        let _ = tokio::time::timeout_at(deadline, collector).await;
    }

    let intentional = handle.stop_requested.load(Ordering::SeqCst);
    {
        let mut state = handle.lock_state();
        state.pid = None;
        if intentional {
            state.status = ProcessStatus::Stopped;
        } else {
            let message = match &status {
                Ok(s) => format!("process exited unexpectedly ({s})"),
                Err(e) => format!("failed to wait for process: {e}"),
            };
            error!(client_id = %client_id, error = %message, "forwarder crashed");
            state.status = ProcessStatus::Error;
            state.last_error = Some(message);
        }
    }
    exited.send_replace(true);

    if intentional {
        debug!(client_id = %client_id, "forwarder exited after stop request");
        return;
    }

    if let Some(sup) = supervisor.upgrade() {
        sup.notify(&handle.client, ProcessStatus::Error);
    }

    auto_restart(supervisor, handle).await;
}

/// Bounded automatic restart after a crash.
async fn auto_restart(supervisor: Weak<ProcessSupervisor>, handle: Arc<ProcessHandle>) {
    let client_id = handle.client.id.as_str();
    let (enabled, max_attempts, delay) = match supervisor.upgrade() {
        Some(sup) => (
            sup.config.auto_restart,
            sup.config.max_restart_attempts,
            sup.config.auto_restart_delay,
        ),
        None => return,
    };

    if !enabled {
        return;
    }
    if handle.restart_count >= max_attempts {
        warn!(
            client_id,
            max_attempts, "auto-restart limit reached; manual restart required"
        );
        return;
    }

    let attempt = handle.restart_count + 1;
    info!(client_id, attempt, max_attempts, "auto-restarting forwarder");
    tokio::time::sleep(delay).await;

    let Some(sup) = supervisor.upgrade() else {
        return;
    };
    let mode = StartMode::Auto {
        replacing: Arc::clone(&handle),
        restart_count: attempt,
    };
    match sup.start_inner(&handle.client, mode) {
        Ok(info) => {
            info!(client_id, pid = ?info.pid, attempt, "forwarder auto-restarted");
            sup.notify(&handle.client, ProcessStatus::Running);
        }
        Err(RelayError::NotRunning(_)) | Err(RelayError::AlreadyRunning(_)) => {
            debug!(client_id, "handle superseded; auto-restart skipped");
        }
        Err(e) => error!(client_id, error = %e, "auto-restart failed"),
    }
}

fn deliver(child: &mut Child, cmd: Control, client_id: &str) {
    match cmd {
        Control::Terminate => terminate(child, client_id),
        Control::Kill => {
            if let Err(e) = child.start_kill() {
                warn!(client_id, error = %e, "failed to kill forwarder");
            }
        }
    }
}

#[cfg(unix)]
fn terminate(child: &mut Child, client_id: &str) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return;
    };
    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    if let Err(e) = kill(Pid::from_raw(raw), Signal::SIGTERM) {
        warn!(client_id, pid, error = %e, "failed to send SIGTERM");
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child, client_id: &str) {
    if let Err(e) = child.start_kill() {
        warn!(client_id, error = %e, "failed to terminate forwarder");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn client(id: &str) -> ClientConfig {
        let mut c = ClientConfig::new(id, "owner-1", "https://smee.io/abc", "http://127.0.0.1:9/hook");
        c.ignore_events = vec!["ping".into(), "".into(), "star".into()];
        c
    }

    #[test]
    fn test_build_forwarder_args() {
        let mut c = client("c1");
        c.save_only = true;
        c.script_format = ScriptFormat::Httpie;
        let args = build_forwarder_args(&c, Path::new("/data/events"));
        assert_eq!(
            args,
            vec![
                "client",
                "--target-connection-timeout",
                "60",
                "--saveDir",
                "/data/events",
                "--httpie",
                "--ignore-event",
                "ping",
                "--ignore-event",
                "star",
                "--noReplay",
                "--sse-buffer-size",
                "1048576",
                "https://smee.io/abc",
                "http://127.0.0.1:9/hook",
            ]
        );
    }

    #[test]
    fn test_build_forwarder_args_minimal() {
        let mut c = client("c1");
        c.ignore_events.clear();
        c.target_timeout_secs = 0;
        c.buffer_size = 0;
        let args = build_forwarder_args(&c, Path::new("/d"));
        assert_eq!(args, vec!["client", "--saveDir", "/d", "https://smee.io/abc", "http://127.0.0.1:9/hook"]);
    }

    #[cfg(unix)]
    mod process {
        use super::*;
        use std::os::unix::fs::PermissionsExt;

        fn fake_forwarder(dir: &Path, body: &str) -> PathBuf {
            let path = dir.join("fake-forwarder.sh");
            std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        fn supervisor(dir: &TempDir, body: &str) -> Arc<ProcessSupervisor> {
            let bin = fake_forwarder(dir.path(), body);
            ProcessSupervisor::new(SupervisorConfig {
                forwarder_bin: bin,
                base_dir: dir.path().join("data"),
                stop_grace: Duration::from_secs(2),
                restart_settle: Duration::from_millis(50),
                auto_restart_delay: Duration::from_millis(50),
                ..SupervisorConfig::default()
            })
        }

        async fn wait_until<F: Fn() -> bool>(cond: F) -> bool {
            for _ in 0..100 {
                if cond() {
                    return true;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            false
        }

        #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
        async fn test_start_stop_with_subscriber() {
            let dir = TempDir::new().unwrap();
            let sup = supervisor(&dir, "sleep 0.5\necho one\necho two\necho three\nexec sleep 30");
            let c = client("client-a");

            let info = sup.start(&c).unwrap();
            assert_eq!(info.status, ProcessStatus::Running);
            assert!(info.pid.is_some());
            assert!(sup.is_running("client-a"));
            assert_eq!(sup.list_processes().len(), 1);

            let (_, mut sub) = sup.subscribe_logs("client-a").unwrap();
            let mut lines = Vec::new();
            for _ in 0..3 {
                let line = tokio::time::timeout(Duration::from_secs(5), sub.recv())
                    .await
                    .unwrap()
                    .unwrap();
                lines.push(line);
            }
            assert!(lines[0].ends_with("[stdout] one"));
            assert!(lines[1].ends_with("[stdout] two"));
            assert!(lines[2].ends_with("[stdout] three"));

            sup.stop("client-a").await.unwrap();
            assert!(!sup.is_running("client-a"));
            let end = tokio::time::timeout(Duration::from_secs(1), sub.recv()).await.unwrap();
            assert_eq!(end, None);
            assert!(matches!(
                sup.get_process_info("client-a"),
                Err(RelayError::NotRunning(_))
            ));
        }

        #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
        async fn test_concurrent_start_only_one_wins() {
            let dir = TempDir::new().unwrap();
            let sup = supervisor(&dir, "exec sleep 30");
            let c = client("client-a");

            let mut tasks = Vec::new();
            for _ in 0..8 {
                let sup = Arc::clone(&sup);
                let c = c.clone();
                tasks.push(tokio::spawn(async move { sup.start(&c) }));
            }
            let mut ok = 0;
            let mut already = 0;
            for t in tasks {
                match t.await.unwrap() {
                    Ok(_) => ok += 1,
                    Err(RelayError::AlreadyRunning(_)) => already += 1,
                    Err(e) => panic!("unexpected error: {e}"),
                }
            }
            assert_eq!((ok, already), (1, 7));
            sup.stop_all().await;
            assert!(sup.list_processes().is_empty());
        }

        #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
        async fn test_stop_unknown_is_not_running() {
            let dir = TempDir::new().unwrap();
            let sup = supervisor(&dir, "exec sleep 30");
            assert!(matches!(sup.stop("ghost").await, Err(RelayError::NotRunning(_))));
        }

        #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
        async fn test_sigterm_ignored_escalates_to_kill() {
            let dir = TempDir::new().unwrap();
            let bin = fake_forwarder(
                dir.path(),
                "trap '' TERM\nwhile true; do sleep 0.1; done",
            );
            let sup = ProcessSupervisor::new(SupervisorConfig {
                forwarder_bin: bin,
                base_dir: dir.path().join("data"),
                stop_grace: Duration::from_millis(300),
                ..SupervisorConfig::default()
            });
            sup.start(&client("stubborn")).unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
            sup.stop("stubborn").await.unwrap();
            assert!(!sup.is_running("stubborn"));
        }

        #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
        async fn test_restart_increments_counter() {
            let dir = TempDir::new().unwrap();
            let sup = supervisor(&dir, "exec sleep 30");
            let c = client("client-a");

            sup.start(&c).unwrap();
            let info = sup.restart(&c).await.unwrap();
            assert_eq!(info.status, ProcessStatus::Running);
            assert_eq!(info.restart_count, 1);

            let info = sup.restart(&c).await.unwrap();
            assert_eq!(info.restart_count, 2);

            // Stop then start matches restart apart from the counter.
            sup.stop(&c.id).await.unwrap();
            let info = sup.start(&c).unwrap();
            assert_eq!(info.status, ProcessStatus::Running);
            assert_eq!(info.restart_count, 0);

            sup.stop_all().await;
        }

        #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
        async fn test_restart_when_not_running_still_counts() {
            let dir = TempDir::new().unwrap();
            let sup = supervisor(&dir, "exec sleep 30");
            let info = sup.restart(&client("fresh")).await.unwrap();
            assert_eq!(info.restart_count, 1);
            sup.stop_all().await;
        }

        #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
        async fn test_crash_sets_error_state() {
            let dir = TempDir::new().unwrap();
            let sup = supervisor(&dir, "echo boom >&2\nexit 3");
            sup.start(&client("crashy")).unwrap();

            let crashed = wait_until(|| {
                sup.get_process_info("crashy")
                    .map(|i| i.status == ProcessStatus::Error)
                    .unwrap_or(false)
            })
            .await;
            assert!(crashed);

            let info = sup.get_process_info("crashy").unwrap();
            assert!(info.pid.is_none());
            assert!(info.last_error.unwrap().contains('3'));
            assert!(!sup.is_running("crashy"));
            assert!(sup
                .log_history("crashy")
                .unwrap()
                .iter()
                .any(|l| l.ends_with("[stderr] boom")));

            // Stop on a crashed handle reports NotRunning and clears it.
            assert!(matches!(sup.stop("crashy").await, Err(RelayError::NotRunning(_))));
            assert!(sup.get_process_info("crashy").is_err());
        }

        #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
        async fn test_status_listener_sees_crash_and_auto_restart() {
            let dir = TempDir::new().unwrap();
            let bin = fake_forwarder(dir.path(), "sleep 0.3\nexit 1");
            let seen = Arc::new(Mutex::new(Vec::new()));
            let recorder = Arc::clone(&seen);
            let sup = ProcessSupervisor::with_status_listener(
                SupervisorConfig {
                    forwarder_bin: bin,
                    base_dir: dir.path().join("data"),
                    auto_restart: true,
                    max_restart_attempts: 1,
                    auto_restart_delay: Duration::from_millis(50),
                    ..SupervisorConfig::default()
                },
                StatusListener::new(move |c, status| {
                    recorder.lock().unwrap().push((c.id.clone(), status));
                }),
            );
            sup.start(&client("flappy")).unwrap();

            assert!(wait_until(|| seen.lock().unwrap().len() == 3).await);
            let seen = seen.lock().unwrap().clone();
            let statuses: Vec<ProcessStatus> = seen.iter().map(|(_, s)| *s).collect();
            assert_eq!(
                statuses,
                vec![ProcessStatus::Error, ProcessStatus::Running, ProcessStatus::Error]
            );
            assert!(seen.iter().all(|(id, _)| id == "flappy"));
        }

        #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
        async fn test_stop_does_not_notify_listener() {
            let dir = TempDir::new().unwrap();
            let bin = fake_forwarder(dir.path(), "exec sleep 30");
            let calls = Arc::new(Mutex::new(0usize));
            let counter = Arc::clone(&calls);
            let sup = ProcessSupervisor::with_status_listener(
                SupervisorConfig {
                    forwarder_bin: bin,
                    base_dir: dir.path().join("data"),
                    ..SupervisorConfig::default()
                },
                StatusListener::new(move |_, _| *counter.lock().unwrap() += 1),
            );
            sup.start(&client("quiet")).unwrap();
            sup.stop("quiet").await.unwrap();
            assert_eq!(*calls.lock().unwrap(), 0);
        }

        #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
        async fn test_output_is_written_to_daily_log_file() {
            let dir = TempDir::new().unwrap();
            let sup = supervisor(&dir, "echo hello\necho oops >&2\nexec sleep 30");
            let c = client("logged");
            sup.start(&c).unwrap();
            assert!(wait_until(|| sup.log_history("logged").map(|h| h.len() == 2).unwrap_or(false)).await);
            sup.stop("logged").await.unwrap();

            let layout = StorageLayout::new(dir.path().join("data"));
            let file = layout.log_file("owner-1", "logged", Utc::now().date_naive());
            let text = std::fs::read_to_string(file).unwrap();
            assert!(text.lines().any(|l| l.ends_with("[stdout] hello")));
            assert!(text.lines().any(|l| l.ends_with("[stderr] oops")));
        }

        #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
        async fn test_auto_restart_is_bounded() {
            let dir = TempDir::new().unwrap();
            let bin = fake_forwarder(dir.path(), "exit 1");
            let sup = ProcessSupervisor::new(SupervisorConfig {
                forwarder_bin: bin,
                base_dir: dir.path().join("data"),
                auto_restart: true,
                max_restart_attempts: 2,
                auto_restart_delay: Duration::from_millis(50),
                ..SupervisorConfig::default()
            });
            sup.start(&client("flappy")).unwrap();

            let settled = wait_until(|| {
                sup.get_process_info("flappy")
                    .map(|i| i.restart_count == 2 && i.status == ProcessStatus::Error)
                    .unwrap_or(false)
            })
            .await;
            assert!(settled);

            tokio::time::sleep(Duration::from_millis(300)).await;
            let info = sup.get_process_info("flappy").unwrap();
            assert_eq!(info.restart_count, 2);
            assert_eq!(info.status, ProcessStatus::Error);
        }

        #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
        async fn test_start_replaces_crashed_handle() {
            let dir = TempDir::new().unwrap();
            let sup = supervisor(&dir, "exit 2");
            let c = client("c");
            sup.start(&c).unwrap();
            assert!(
                wait_until(|| sup
                    .get_process_info("c")
                    .map(|i| i.status == ProcessStatus::Error)
                    .unwrap_or(false))
                .await
            );
            let (_, mut old_sub) = sup.subscribe_logs("c").unwrap();

            let info = sup.start(&c).unwrap();
            assert_eq!(info.status, ProcessStatus::Running);
            assert_eq!(
                tokio::time::timeout(Duration::from_secs(1), old_sub.recv()).await.unwrap(),
                None
            );
        }

        #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
        async fn test_spawn_failure() {
            let dir = TempDir::new().unwrap();
            let sup = ProcessSupervisor::new(SupervisorConfig {
                forwarder_bin: dir.path().join("does-not-exist"),
                base_dir: dir.path().join("data"),
                ..SupervisorConfig::default()
            });
            assert!(matches!(
                sup.start(&client("c")),
                Err(RelayError::ProcessSpawn { .. })
            ));
            assert!(!sup.is_running("c"));
        }
    }
}
