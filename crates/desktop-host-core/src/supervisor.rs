//! Ownership of the single backend server child process.
//!
//! Control (`start`/`stop`) and observation (`observe`) are split so a crash
//! and an explicit stop reach the coordinator through the same stream.
//! Every transition happens under the handle mutex, which makes the terminal
//! transition a compare-and-set: whichever of "exit observed" and "stop
//! requested" takes the lock first wins and the other becomes a no-op.

use std::{
    fmt, fs,
    process::{Child, Command, ExitStatus, Stdio},
    sync::{
        atomic::{AtomicU64, Ordering},
        mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError},
        Arc, Mutex, MutexGuard,
    },
    thread,
    time::Duration,
};

use serde::Serialize;

use crate::{error::SpawnError, launch_plan::LaunchPlan, EXIT_POLL_INTERVAL};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProcessState {
    NotStarted,
    Starting,
    Running,
    ExitedClean,
    ExitedError,
    SpawnFailed,
}

impl ProcessState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::ExitedClean | Self::ExitedError | Self::SpawnFailed
        )
    }

    pub fn is_active(self) -> bool {
        matches!(self, Self::Starting | Self::Running)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct HandleId(pub u64);

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "server#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<String>,
    /// Set when the exit was caused by [`ProcessSupervisor::stop`].
    pub requested: bool,
    /// OS-level error reported while observing the process.
    pub error: Option<String>,
}

impl ExitInfo {
    fn from_status(status: ExitStatus, requested: bool) -> Self {
        Self {
            code: status.code(),
            signal: exit_signal_name(&status),
            requested,
            error: None,
        }
    }

    fn from_error(message: String) -> Self {
        Self {
            code: None,
            signal: None,
            requested: false,
            error: Some(message),
        }
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(error) = &self.error {
            return write!(f, "error: {error}");
        }
        match (&self.code, &self.signal) {
            (Some(code), _) => write!(f, "code {code}"),
            (None, Some(signal)) => write!(f, "signal {signal}"),
            (None, None) => write!(f, "unknown status"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateChange {
    pub handle: HandleId,
    pub pid: Option<u32>,
    pub from: ProcessState,
    pub to: ProcessState,
    pub exit: Option<ExitInfo>,
}

impl StateChange {
    /// Terminal transition that nobody asked for.
    pub fn is_unexpected_exit(&self) -> bool {
        self.to.is_terminal() && !self.exit.as_ref().is_some_and(|exit| exit.requested)
    }
}

#[derive(Debug)]
struct HandleInner {
    state: ProcessState,
    pid: Option<u32>,
    exit: Option<ExitInfo>,
    child: Option<Child>,
    changes: Option<Sender<StateChange>>,
}

/// Shared view of one server process. Clones observe the same process.
#[derive(Debug, Clone)]
pub struct ServerProcessHandle {
    id: HandleId,
    inner: Arc<Mutex<HandleInner>>,
    stream: Arc<Mutex<Option<Receiver<StateChange>>>>,
}

impl ServerProcessHandle {
    fn new(id: HandleId) -> Self {
        let (sender, receiver) = mpsc::channel();
        Self {
            id,
            inner: Arc::new(Mutex::new(HandleInner {
                state: ProcessState::NotStarted,
                pid: None,
                exit: None,
                child: None,
                changes: Some(sender),
            })),
            stream: Arc::new(Mutex::new(Some(receiver))),
        }
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn state(&self) -> ProcessState {
        self.lock_inner().state
    }

    pub fn pid(&self) -> Option<u32> {
        self.lock_inner().pid
    }

    pub fn exit_info(&self) -> Option<ExitInfo> {
        self.lock_inner().exit.clone()
    }

    /// Takes the state-change stream of this handle. Only the first caller
    /// gets it; the stream ends after the terminal transition.
    pub fn observe(&self) -> Option<StateChanges> {
        let mut slot = match self.stream.lock() {
            Ok(guard) => guard,
            Err(error) => error.into_inner(),
        };
        slot.take().map(|receiver| StateChanges { receiver })
    }

    fn lock_inner(&self) -> MutexGuard<'_, HandleInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(error) => {
                log::error!(target: "server", "{} state lock poisoned: {error}", self.id);
                error.into_inner()
            }
        }
    }

    /// Applies a transition if it is legal from the current state. Returns
    /// whether it was applied.
    fn transition(
        &self,
        inner: &mut HandleInner,
        to: ProcessState,
        exit: Option<ExitInfo>,
    ) -> bool {
        let from = inner.state;
        let legal = match (from, to) {
            (ProcessState::NotStarted, ProcessState::Starting)
            | (ProcessState::NotStarted, ProcessState::SpawnFailed)
            | (ProcessState::Starting, ProcessState::Running) => true,
            (from, to) if from.is_active() && to.is_terminal() => true,
            _ => false,
        };
        if !legal {
            log::debug!(
                target: "server",
                "{} ignored transition {from:?} -> {to:?}",
                self.id
            );
            return false;
        }

        inner.state = to;
        if exit.is_some() {
            inner.exit = exit.clone();
        }
        let change = StateChange {
            handle: self.id,
            pid: inner.pid,
            from,
            to,
            exit,
        };
        if let Some(sender) = &inner.changes {
            // The observer may have gone away; the state is still recorded.
            let _ = sender.send(change);
        }
        if to.is_terminal() {
            inner.child = None;
            inner.changes = None;
        }
        true
    }

    fn poll_exit(&self) -> bool {
        let mut inner = self.lock_inner();
        if inner.state.is_terminal() {
            return false;
        }
        let Some(child) = inner.child.as_mut() else {
            return false;
        };

        match child.try_wait() {
            Ok(None) => {
                if inner.state == ProcessState::Starting {
                    log::info!(
                        target: "server",
                        "{} confirmed running (pid {:?})",
                        self.id,
                        inner.pid
                    );
                    self.transition(&mut inner, ProcessState::Running, None);
                }
                true
            }
            Ok(Some(status)) => {
                let exit = ExitInfo::from_status(status, false);
                let to = if status.success() {
                    ProcessState::ExitedClean
                } else {
                    ProcessState::ExitedError
                };
                log::warn!(
                    target: "server",
                    "{} (pid {:?}) exited with {exit}",
                    self.id,
                    inner.pid
                );
                self.transition(&mut inner, to, Some(exit));
                false
            }
            Err(error) => {
                let message = format!("failed to poll server process status: {error}");
                log::error!(target: "server", "{} {message}", self.id);
                let to = if inner.state == ProcessState::Starting {
                    ProcessState::SpawnFailed
                } else {
                    ProcessState::ExitedError
                };
                if let Some(mut child) = inner.child.take() {
                    stop_child_process(&mut child);
                }
                self.transition(&mut inner, to, Some(ExitInfo::from_error(message)));
                false
            }
        }
    }

    /// Kills a child that cannot be supervised and records it as a failed
    /// spawn.
    fn abandon(&self, message: String) {
        let mut inner = self.lock_inner();
        if let Some(mut child) = inner.child.take() {
            stop_child_process(&mut child);
        }
        self.transition(
            &mut inner,
            ProcessState::SpawnFailed,
            Some(ExitInfo::from_error(message)),
        );
    }

    /// Sends the termination signal if the process is still live. Returns
    /// `true` only for the call that actually signalled the process.
    fn stop(&self) -> bool {
        let mut inner = self.lock_inner();
        if !inner.state.is_active() {
            return false;
        }
        let Some(mut child) = inner.child.take() else {
            return false;
        };

        log::info!(
            target: "shutdown",
            "stopping {} (pid {:?})",
            self.id,
            inner.pid
        );
        let exit = match stop_child_process(&mut child) {
            Some(status) => ExitInfo::from_status(status, true),
            None => ExitInfo {
                code: None,
                signal: None,
                requested: true,
                error: None,
            },
        };
        log::info!(target: "shutdown", "{} stopped with {exit}", self.id);
        self.transition(&mut inner, ProcessState::ExitedClean, Some(exit));
        true
    }
}

/// Lazy sequence of transitions of one handle.
#[derive(Debug)]
pub struct StateChanges {
    receiver: Receiver<StateChange>,
}

impl StateChanges {
    /// Non-blocking poll. `None` when nothing is pending or the stream ended.
    pub fn try_next(&self) -> Option<StateChange> {
        match self.receiver.try_recv() {
            Ok(change) => Some(change),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    pub fn next_timeout(&self, timeout: Duration) -> Option<StateChange> {
        match self.receiver.recv_timeout(timeout) {
            Ok(change) => Some(change),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }
}

impl Iterator for StateChanges {
    type Item = StateChange;

    fn next(&mut self) -> Option<Self::Item> {
        self.receiver.recv().ok()
    }
}

#[derive(Debug, Default)]
struct SupervisorShared {
    current: Mutex<Option<ServerProcessHandle>>,
    next_id: AtomicU64,
}

impl Drop for SupervisorShared {
    fn drop(&mut self) {
        let current = match self.current.get_mut() {
            Ok(current) => current.take(),
            Err(error) => error.into_inner().take(),
        };
        if let Some(handle) = current {
            handle.stop();
        }
    }
}

/// Owner of the backend child process. Cheap to clone; all clones share the
/// same current handle. The process is stopped when the last clone drops.
#[derive(Debug, Clone, Default)]
pub struct ProcessSupervisor {
    shared: Arc<SupervisorShared>,
}

impl ProcessSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<ServerProcessHandle> {
        self.lock_current().clone()
    }

    pub fn state(&self) -> ProcessState {
        self.current()
            .map(|handle| handle.state())
            .unwrap_or(ProcessState::NotStarted)
    }

    pub fn start(&self, plan: &LaunchPlan) -> Result<ServerProcessHandle, SpawnError> {
        let mut current = self.lock_current();
        if let Some(existing) = current.as_ref() {
            let inner = existing.lock_inner();
            if !inner.state.is_terminal() {
                return Err(SpawnError::AlreadyRunning {
                    pid: inner.pid.unwrap_or_default(),
                });
            }
        }

        let id = HandleId(self.shared.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let command_line = plan.debug_command();
        let handle = ServerProcessHandle::new(id);
        *current = Some(handle.clone());

        if !plan.cwd.exists() {
            if let Err(error) = fs::create_dir_all(&plan.cwd) {
                log::warn!(
                    target: "server",
                    "failed to create server cwd {}: {error}",
                    plan.cwd.display()
                );
            }
        }

        let mut command = Command::new(&plan.cmd);
        command
            .args(&plan.args)
            .current_dir(&plan.cwd)
            .envs(plan.envs.iter().map(|(key, value)| (key, value)))
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());

        log::info!(target: "server", "starting {id}: {command_line:?}");
        let child = match command.spawn() {
            Ok(child) => child,
            Err(source) => {
                let message = format!("{source}");
                let mut inner = handle.lock_inner();
                handle.transition(
                    &mut inner,
                    ProcessState::SpawnFailed,
                    Some(ExitInfo::from_error(message)),
                );
                log::error!(
                    target: "server",
                    "failed to spawn {id} with {command_line:?}: {source}"
                );
                return Err(SpawnError::Os {
                    command: command_line,
                    source,
                });
            }
        };

        {
            let mut inner = handle.lock_inner();
            inner.pid = Some(child.id());
            inner.child = Some(child);
            handle.transition(&mut inner, ProcessState::Starting, None);
        }
        log::info!(target: "server", "{id} spawned (pid {:?})", handle.pid());

        let watched = handle.clone();
        let spawned = thread::Builder::new()
            .name(format!("server-watch-{}", id.0))
            .spawn(move || {
                thread::sleep(EXIT_POLL_INTERVAL);
                while watched.poll_exit() {
                    thread::sleep(EXIT_POLL_INTERVAL);
                }
            });
        if let Err(source) = spawned {
            log::error!(target: "server", "failed to start watcher for {id}: {source}");
            handle.abandon(format!("failed to start process watcher: {source}"));
            return Err(SpawnError::Unwatched {
                command: command_line,
                source,
            });
        }

        Ok(handle)
    }

    /// Idempotent; safe to call from every shutdown path.
    pub fn stop(&self) -> bool {
        match self.current() {
            Some(handle) => handle.stop(),
            None => false,
        }
    }

    fn lock_current(&self) -> MutexGuard<'_, Option<ServerProcessHandle>> {
        match self.shared.current.lock() {
            Ok(guard) => guard,
            Err(error) => {
                log::error!(target: "server", "supervisor lock poisoned: {error}");
                error.into_inner()
            }
        }
    }
}

fn stop_child_process(child: &mut Child) -> Option<ExitStatus> {
    #[cfg(target_os = "windows")]
    {
        let _ = Command::new("taskkill")
            .args(["/pid", &child.id().to_string(), "/t", "/f"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .stdin(Stdio::null())
            .status();
    }

    #[cfg(not(target_os = "windows"))]
    {
        if let Err(error) = child.kill() {
            log::warn!(target: "shutdown", "failed to signal pid {}: {error}", child.id());
        }
    }

    child.wait().ok()
}

#[cfg(unix)]
fn exit_signal_name(status: &ExitStatus) -> Option<String> {
    use std::os::unix::process::ExitStatusExt;

    status.signal().map(|signal| {
        match signal {
            1 => "SIGHUP",
            2 => "SIGINT",
            6 => "SIGABRT",
            9 => "SIGKILL",
            11 => "SIGSEGV",
            15 => "SIGTERM",
            _ => return format!("signal {signal}"),
        }
        .to_string()
    })
}

#[cfg(not(unix))]
fn exit_signal_name(_status: &ExitStatus) -> Option<String> {
    None
}

#[cfg(all(test, unix))]
mod tests {
    use std::sync::Barrier;

    use super::*;

    const WAIT: Duration = Duration::from_secs(10);

    fn shell(script: &str) -> LaunchPlan {
        LaunchPlan::new("/bin/sh").arg("-c").arg(script)
    }

    fn next_terminal(changes: &StateChanges) -> StateChange {
        loop {
            let change = changes
                .next_timeout(WAIT)
                .expect("terminal transition before timeout");
            if change.to.is_terminal() {
                return change;
            }
        }
    }

    #[test]
    fn start_reports_running_then_unexpected_exit_code() {
        let supervisor = ProcessSupervisor::new();
        let handle = supervisor
            .start(&shell("sleep 0.5; exit 1"))
            .expect("spawn should succeed");
        assert!(handle.pid().is_some());
        let changes = handle.observe().expect("first observer gets the stream");
        assert!(handle.observe().is_none());

        let starting = changes.next_timeout(WAIT).expect("starting transition");
        assert_eq!(
            (starting.from, starting.to),
            (ProcessState::NotStarted, ProcessState::Starting)
        );
        let running = changes.next_timeout(WAIT).expect("running transition");
        assert_eq!(
            (running.from, running.to),
            (ProcessState::Starting, ProcessState::Running)
        );

        let exited = next_terminal(&changes);
        assert_eq!(exited.to, ProcessState::ExitedError);
        assert!(exited.is_unexpected_exit());
        assert_eq!(exited.exit.as_ref().and_then(|exit| exit.code), Some(1));
        assert_eq!(handle.state(), ProcessState::ExitedError);
        assert!(changes.next_timeout(Duration::from_millis(50)).is_none());
    }

    #[test]
    fn clean_exit_is_reported_as_exited_clean() {
        let supervisor = ProcessSupervisor::new();
        let handle = supervisor.start(&shell("exit 0")).expect("spawn");
        let changes = handle.observe().expect("stream");
        let exited = next_terminal(&changes);
        assert_eq!(exited.to, ProcessState::ExitedClean);
        assert_eq!(exited.exit.and_then(|exit| exit.code), Some(0));
    }

    #[test]
    fn missing_executable_fails_fast_and_records_spawn_failed() {
        let supervisor = ProcessSupervisor::new();
        let error = supervisor
            .start(&LaunchPlan::new("/nonexistent/desktop-host-server"))
            .unwrap_err();
        assert!(matches!(error, SpawnError::Os { .. }));
        assert_eq!(supervisor.state(), ProcessState::SpawnFailed);

        let handle = supervisor.current().expect("failed handle is kept");
        let changes = handle.observe().expect("stream");
        let change = changes.try_next().expect("spawn failure is observable");
        assert_eq!(change.to, ProcessState::SpawnFailed);
    }

    #[test]
    fn abandoned_child_is_killed_and_marked_spawn_failed() {
        let supervisor = ProcessSupervisor::new();
        let handle = supervisor.start(&shell("sleep 30")).expect("spawn");
        let changes = handle.observe().expect("stream");

        handle.abandon("failed to start process watcher: boom".to_string());

        let failed = next_terminal(&changes);
        assert_eq!(failed.to, ProcessState::SpawnFailed);
        assert!(failed.is_unexpected_exit());
        assert!(failed
            .exit
            .and_then(|exit| exit.error)
            .is_some_and(|error| error.contains("watcher")));
        assert!(!supervisor.stop());
    }

    #[test]
    fn second_start_is_refused_while_first_is_live() {
        let supervisor = ProcessSupervisor::new();
        let first = supervisor.start(&shell("sleep 30")).expect("spawn");
        let error = supervisor.start(&shell("sleep 30")).unwrap_err();
        assert!(matches!(
            error,
            SpawnError::AlreadyRunning { pid } if Some(pid) == first.pid()
        ));

        assert!(supervisor.stop());
        let second = supervisor.start(&shell("sleep 30")).expect("respawn after stop");
        assert_ne!(first.id(), second.id());
        supervisor.stop();
    }

    #[test]
    fn stop_is_idempotent_and_signals_once() {
        let supervisor = ProcessSupervisor::new();
        let handle = supervisor.start(&shell("sleep 30")).expect("spawn");
        let changes = handle.observe().expect("stream");

        let callers = 6;
        let barrier = Arc::new(Barrier::new(callers));
        let threads: Vec<_> = (0..callers)
            .map(|_| {
                let supervisor = supervisor.clone();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    supervisor.stop()
                })
            })
            .collect();
        let signalled = threads
            .into_iter()
            .map(|thread| thread.join().expect("stop thread"))
            .filter(|sent| *sent)
            .count();
        assert_eq!(signalled, 1);
        assert!(!supervisor.stop());

        let exited = next_terminal(&changes);
        assert_eq!(exited.to, ProcessState::ExitedClean);
        assert!(!exited.is_unexpected_exit());
        assert_eq!(exited.exit.and_then(|exit| exit.signal).as_deref(), Some("SIGKILL"));
    }

    #[test]
    fn stop_after_exit_is_a_noop() {
        let supervisor = ProcessSupervisor::new();
        let handle = supervisor.start(&shell("exit 3")).expect("spawn");
        let changes = handle.observe().expect("stream");
        let exited = next_terminal(&changes);
        assert_eq!(exited.to, ProcessState::ExitedError);
        assert!(!supervisor.stop());
        assert_eq!(handle.state(), ProcessState::ExitedError);
    }

    #[test]
    fn dropping_last_supervisor_stops_the_child() {
        let supervisor = ProcessSupervisor::new();
        let handle = supervisor.start(&shell("sleep 30")).expect("spawn");
        drop(supervisor);
        assert_eq!(handle.state(), ProcessState::ExitedClean);
        assert!(handle.exit_info().is_some_and(|exit| exit.requested));
    }
}
