//! Host lifecycle state machine.
//!
//! Every platform callback, process transition and readiness result is turned
//! into a [`HostEvent`] and handled one at a time on the coordinator thread.
//! Worker threads (server watchers, readiness probes) only ever post events.

use std::{
    collections::VecDeque,
    sync::{
        mpsc::{self, Receiver, Sender},
        Arc,
    },
    thread,
};

use serde::Serialize;

use crate::{
    config::WindowClosePolicy,
    error::{ConfigError, FailureKind, HostExitCode},
    fallback::FallbackContent,
    instance_lock::{InstanceLock, SecondInstanceAttempt},
    launch_plan::LaunchPlan,
    readiness::{CancelToken, ReadinessProbe, CANCELLED},
    supervisor::{HandleId, ProcessState, ProcessSupervisor, ServerProcessHandle, StateChange},
    target::WindowTarget,
    window::{LoadOutcome, WindowHandle, WindowId, WindowManager},
};

const ACTION_LOG_LIMIT: usize = 256;

#[derive(Debug, Clone)]
pub enum HostEvent {
    /// The platform event loop is up; starts the whole sequence.
    Ready,
    SecondInstance(SecondInstanceAttempt),
    ServerStateChanged(StateChange),
    ReadinessResolved {
        window: WindowId,
        result: Result<(), String>,
    },
    WindowClosed(WindowId),
    AllWindowsClosed,
    Activate,
    QuitRequested,
}

/// Cloneable producer side of the coordinator queue.
#[derive(Debug, Clone)]
pub struct HostSender(Sender<HostEvent>);

impl HostSender {
    /// Returns `false` once the coordinator is gone.
    pub fn send(&self, event: HostEvent) -> bool {
        self.0.send(event).is_ok()
    }
}

pub fn host_channel() -> (HostSender, Receiver<HostEvent>) {
    let (sender, receiver) = mpsc::channel();
    (HostSender(sender), receiver)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LifecycleState {
    Init,
    LockFailed,
    LockAcquired,
    ServerStarting,
    WindowCreating,
    Running,
    ShuttingDown,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopControl {
    Continue,
    Exit(HostExitCode),
}

/// Ordered journal of the side effects the coordinator performed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum LifecycleAction {
    LockAcquired,
    LockRefused,
    ServerStarted(HandleId),
    ServerStartFailed,
    WindowCreated(WindowId),
    LoadScheduled(WindowId),
    LoadCompleted(WindowId),
    FallbackShown { window: WindowId, kind: FailureKind },
    WindowFocused(WindowId),
    WindowClosed(WindowId),
    ServerStopSignalled(HandleId),
    Exit(HostExitCode),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleSnapshot {
    pub state: LifecycleState,
    pub degraded: bool,
    pub server_state: ProcessState,
    pub server_pid: Option<u32>,
    pub window: Option<WindowHandle>,
    pub last_failure: Option<FallbackContent>,
}

pub struct CoordinatorOptions {
    pub target: WindowTarget,
    pub launch_plan: Result<LaunchPlan, ConfigError>,
    pub window_close_policy: WindowClosePolicy,
}

struct PendingLoad {
    window: WindowId,
    cancel: CancelToken,
}

pub struct LifecycleCoordinator {
    state: LifecycleState,
    degraded: bool,
    exit_code: HostExitCode,
    lock: InstanceLock,
    supervisor: ProcessSupervisor,
    windows: WindowManager,
    probe: Arc<dyn ReadinessProbe>,
    target: WindowTarget,
    launch_plan: Result<LaunchPlan, ConfigError>,
    close_policy: WindowClosePolicy,
    events: HostSender,
    pending_load: Option<PendingLoad>,
    /// Last server failure; windows opened while the server is dead show it.
    server_failure: Option<FallbackContent>,
    lock_failure: Option<FallbackContent>,
    actions: VecDeque<LifecycleAction>,
}

impl LifecycleCoordinator {
    pub fn new(
        options: CoordinatorOptions,
        lock: InstanceLock,
        windows: WindowManager,
        probe: Arc<dyn ReadinessProbe>,
        events: HostSender,
    ) -> Self {
        Self {
            state: LifecycleState::Init,
            degraded: false,
            exit_code: HostExitCode::Normal,
            lock,
            supervisor: ProcessSupervisor::new(),
            windows,
            probe,
            target: options.target,
            launch_plan: options.launch_plan,
            close_policy: options.window_close_policy,
            events,
            pending_load: None,
            server_failure: None,
            lock_failure: None,
            actions: VecDeque::new(),
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn degraded(&self) -> bool {
        self.degraded
    }

    /// Shared handle for platform shutdown hooks. `stop` is idempotent.
    pub fn supervisor(&self) -> ProcessSupervisor {
        self.supervisor.clone()
    }

    pub fn windows(&self) -> &WindowManager {
        &self.windows
    }

    pub fn actions(&self) -> &VecDeque<LifecycleAction> {
        &self.actions
    }

    pub fn snapshot(&self) -> LifecycleSnapshot {
        let server = self.supervisor.current();
        LifecycleSnapshot {
            state: self.state,
            degraded: self.degraded,
            server_state: server
                .as_ref()
                .map(ServerProcessHandle::state)
                .unwrap_or(ProcessState::NotStarted),
            server_pid: server.as_ref().and_then(ServerProcessHandle::pid),
            window: self.windows.current().cloned(),
            last_failure: self
                .server_failure
                .clone()
                .or_else(|| self.lock_failure.clone()),
        }
    }

    /// Drains the queue until a transition asks the host to exit.
    pub fn run(mut self, receiver: Receiver<HostEvent>) -> HostExitCode {
        for event in receiver.iter() {
            if let LoopControl::Exit(code) = self.handle_event(event) {
                return code;
            }
        }
        log::warn!(target: "runtime", "host event queue closed; shutting down");
        match self.begin_shutdown(self.exit_code) {
            LoopControl::Exit(code) => code,
            LoopControl::Continue => self.exit_code,
        }
    }

    pub fn handle_event(&mut self, event: HostEvent) -> LoopControl {
        if matches!(
            self.state,
            LifecycleState::LockFailed | LifecycleState::Terminated
        ) {
            log::debug!(target: "runtime", "ignoring {event:?} after exit");
            return LoopControl::Exit(self.exit_code);
        }

        log::debug!(target: "runtime", "handling {event:?} in {:?}", self.state);
        match event {
            HostEvent::Ready => self.on_ready(),
            HostEvent::SecondInstance(attempt) => {
                self.on_second_instance(attempt);
                LoopControl::Continue
            }
            HostEvent::ServerStateChanged(change) => self.on_server_state_changed(change),
            HostEvent::ReadinessResolved { window, result } => {
                self.on_readiness_resolved(window, result);
                LoopControl::Continue
            }
            HostEvent::WindowClosed(window) => {
                self.on_window_closed(window);
                LoopControl::Continue
            }
            HostEvent::AllWindowsClosed => self.on_all_windows_closed(),
            HostEvent::Activate => self.on_activate(),
            HostEvent::QuitRequested => {
                log::info!(target: "shutdown", "quit requested");
                self.begin_shutdown(self.exit_code)
            }
        }
    }

    fn on_ready(&mut self) -> LoopControl {
        if self.state != LifecycleState::Init {
            log::debug!(target: "startup", "host already started; ignoring ready");
            return LoopControl::Continue;
        }

        if !self.lock.acquire() {
            let failure = FallbackContent::new(
                FailureKind::LockAcquisitionFailure,
                self.lock.path().display().to_string(),
                "the instance lock could not be acquired",
            );
            log::warn!(target: "startup", "{}; exiting", failure.summary());
            self.lock_failure = Some(failure);
            self.record(LifecycleAction::LockRefused);
            self.exit_code = HostExitCode::LockUnavailable;
            self.state = LifecycleState::LockFailed;
            return LoopControl::Exit(self.exit_code);
        }
        log::info!(
            target: "startup",
            "instance lock acquired at {}",
            self.lock.path().display()
        );
        self.record(LifecycleAction::LockAcquired);
        self.state = LifecycleState::LockAcquired;

        self.start_server();
        self.open_window(true)
    }

    fn start_server(&mut self) -> bool {
        self.state = LifecycleState::ServerStarting;
        let started = match &self.launch_plan {
            Ok(plan) => self
                .supervisor
                .start(plan)
                .map_err(|error| error.to_string()),
            Err(error) => Err(error.to_string()),
        };

        match started {
            Ok(handle) => {
                self.server_failure = None;
                self.record(LifecycleAction::ServerStarted(handle.id()));
                self.forward_state_changes(&handle);
                true
            }
            Err(error) => {
                log::error!(target: "startup", "server failed to start: {error}");
                self.record(LifecycleAction::ServerStartFailed);
                self.server_failure = Some(FallbackContent::new(
                    FailureKind::SpawnFailure,
                    self.target.to_string(),
                    error,
                ));
                false
            }
        }
    }

    fn forward_state_changes(&self, handle: &ServerProcessHandle) {
        let Some(changes) = handle.observe() else {
            log::warn!(target: "server", "{} is already observed", handle.id());
            return;
        };
        let events = self.events.clone();
        let spawned = thread::Builder::new()
            .name(format!("server-events-{}", handle.id().0))
            .spawn(move || {
                for change in changes {
                    if !events.send(HostEvent::ServerStateChanged(change)) {
                        break;
                    }
                }
            });
        if let Err(error) = spawned {
            log::error!(
                target: "server",
                "failed to forward state changes of {}: {error}",
                handle.id()
            );
        }
    }

    /// Opens the primary window. A window opened while the server is known
    /// dead shows the failure straight away instead of probing.
    fn open_window(&mut self, at_startup: bool) -> LoopControl {
        if self.windows.has_window() {
            return LoopControl::Continue;
        }

        self.state = LifecycleState::WindowCreating;
        let handle = match self.windows.create(self.target.clone()) {
            Ok(handle) => handle,
            Err(error) => {
                log::error!(target: "window", "failed to create primary window: {error}");
                if !at_startup {
                    self.state = LifecycleState::Running;
                    return LoopControl::Continue;
                }
                let code = if self.server_failure.is_some() {
                    HostExitCode::ServerSpawnFailed
                } else {
                    HostExitCode::WindowUnavailable
                };
                return self.begin_shutdown(code);
            }
        };
        self.record(LifecycleAction::WindowCreated(handle.id));

        match self.server_failure.clone() {
            Some(failure) => self.present_failure(handle.id, failure),
            None => self.schedule_load(handle.id),
        }
        LoopControl::Continue
    }

    fn schedule_load(&mut self, window: WindowId) {
        self.cancel_pending_load();
        if !self.windows.begin_load(window) {
            return;
        }

        let cancel = CancelToken::new();
        let token = cancel.clone();
        let probe = Arc::clone(&self.probe);
        let target = self.target.clone();
        let events = self.events.clone();
        self.record(LifecycleAction::LoadScheduled(window));
        let spawned = thread::Builder::new()
            .name(format!("window-load-{}", window.0))
            .spawn(move || {
                let result = probe.wait_ready(&target, &token);
                if !token.is_cancelled() {
                    events.send(HostEvent::ReadinessResolved { window, result });
                }
            });

        match spawned {
            Ok(_) => self.pending_load = Some(PendingLoad { window, cancel }),
            Err(error) => {
                self.pending_load = Some(PendingLoad { window, cancel });
                self.on_readiness_resolved(
                    window,
                    Err(format!("failed to start readiness probe: {error}")),
                );
            }
        }
    }

    fn cancel_pending_load(&mut self) {
        if let Some(pending) = self.pending_load.take() {
            log::debug!(target: "window", "cancelling pending load of {}", pending.window);
            pending.cancel.cancel();
        }
    }

    fn on_readiness_resolved(&mut self, window: WindowId, result: Result<(), String>) {
        if self.pending_load.as_ref().map(|pending| pending.window) != Some(window) {
            log::debug!(target: "window", "dropping stale readiness result for {window}");
            return;
        }
        self.pending_load = None;
        if matches!(&result, Err(error) if error == CANCELLED) {
            return;
        }

        match self.windows.load(window, result) {
            LoadOutcome::Loaded => {
                self.record(LifecycleAction::LoadCompleted(window));
                self.degraded = false;
                self.state = LifecycleState::Running;
            }
            LoadOutcome::Failed(_) => {
                self.record(LifecycleAction::FallbackShown {
                    window,
                    kind: FailureKind::LoadFailure,
                });
                self.degraded = true;
                self.state = LifecycleState::Running;
            }
            LoadOutcome::Ignored => {}
        }
    }

    fn present_failure(&mut self, window: WindowId, content: FallbackContent) {
        let kind = content.kind;
        if self.windows.show_fallback(window, content) {
            self.record(LifecycleAction::FallbackShown { window, kind });
        }
        self.degraded = true;
        self.state = LifecycleState::Running;
    }

    fn on_server_state_changed(&mut self, change: StateChange) -> LoopControl {
        let current = self.supervisor.current().map(|handle| handle.id());
        if current != Some(change.handle) {
            log::debug!(target: "server", "dropping stale transition of {}", change.handle);
            return LoopControl::Continue;
        }
        log::debug!(
            target: "server",
            "{} {:?} -> {:?}",
            change.handle,
            change.from,
            change.to
        );

        if !change.to.is_terminal() {
            if change.to == ProcessState::Running {
                log::info!(
                    target: "server",
                    "{} running (pid {:?})",
                    change.handle,
                    change.pid
                );
            }
            return LoopControl::Continue;
        }
        if !change.is_unexpected_exit() {
            log::info!(target: "server", "{} stopped on request", change.handle);
            return LoopControl::Continue;
        }
        let content = FallbackContent::new(
            failure_kind(&change),
            self.target.to_string(),
            describe_exit(&change),
        );
        log::error!(target: "server", "{}", content.summary());
        self.cancel_pending_load();
        self.server_failure = Some(content.clone());
        match self.windows.current().map(|window| window.id) {
            Some(window) => self.present_failure(window, content),
            None => {
                log::warn!(target: "window", "no window to show server failure");
                self.degraded = true;
                self.state = LifecycleState::Running;
            }
        }
        LoopControl::Continue
    }

    fn on_second_instance(&mut self, attempt: SecondInstanceAttempt) {
        log::info!(
            target: "runtime",
            "second instance launched with {:?} from {}",
            attempt.args,
            attempt.cwd
        );
        if !self.focus_window() {
            log::info!(target: "runtime", "no window to focus for second instance");
        }
    }

    fn focus_window(&mut self) -> bool {
        let Some(window) = self.windows.current().map(|handle| handle.id) else {
            return false;
        };
        if !self.windows.focus() {
            return false;
        }
        self.record(LifecycleAction::WindowFocused(window));
        true
    }

    fn on_window_closed(&mut self, window: WindowId) {
        if self
            .pending_load
            .as_ref()
            .is_some_and(|pending| pending.window == window)
        {
            self.cancel_pending_load();
        }
        if self.windows.on_closed(window).is_none() {
            return;
        }
        self.record(LifecycleAction::WindowClosed(window));
        if self.state == LifecycleState::WindowCreating {
            self.state = LifecycleState::Running;
        }
    }

    fn on_all_windows_closed(&mut self) -> LoopControl {
        if let Some(window) = self.windows.current().map(|handle| handle.id) {
            self.on_window_closed(window);
        }
        match self.close_policy {
            WindowClosePolicy::QuitWhenAllClosed => {
                log::info!(target: "shutdown", "all windows closed; quitting");
                self.begin_shutdown(self.exit_code)
            }
            WindowClosePolicy::KeepRunning => {
                log::info!(target: "runtime", "all windows closed; host stays alive");
                LoopControl::Continue
            }
        }
    }

    fn on_activate(&mut self) -> LoopControl {
        if matches!(
            self.state,
            LifecycleState::Init | LifecycleState::ShuttingDown
        ) {
            log::debug!(target: "runtime", "ignoring activation in {:?}", self.state);
            return LoopControl::Continue;
        }
        if self.windows.has_window() {
            self.focus_window();
            return LoopControl::Continue;
        }

        if !self.supervisor.state().is_active() {
            log::info!(target: "runtime", "server is not running; starting it on activation");
            self.start_server();
        }
        self.open_window(false)
    }

    fn begin_shutdown(&mut self, code: HostExitCode) -> LoopControl {
        if self.state != LifecycleState::ShuttingDown {
            log::info!(target: "shutdown", "shutting down with {code:?}");
            self.exit_code = code;
            self.state = LifecycleState::ShuttingDown;
            self.cancel_pending_load();
            self.windows.close_all();
        }

        if let Some(handle) = self.supervisor.current() {
            if self.supervisor.stop() {
                self.record(LifecycleAction::ServerStopSignalled(handle.id()));
            }
        }
        let server_state = self.supervisor.state();
        if server_state.is_active() {
            log::warn!(
                target: "shutdown",
                "server still reported {server_state:?} after stop"
            );
        }

        self.state = LifecycleState::Terminated;
        self.record(LifecycleAction::Exit(self.exit_code));
        log::info!(target: "shutdown", "host terminated with {:?}", self.exit_code);
        LoopControl::Exit(self.exit_code)
    }

    fn record(&mut self, action: LifecycleAction) {
        if self.actions.len() == ACTION_LOG_LIMIT {
            self.actions.pop_front();
        }
        self.actions.push_back(action);
    }
}

impl Drop for LifecycleCoordinator {
    fn drop(&mut self) {
        self.cancel_pending_load();
    }
}

fn failure_kind(change: &StateChange) -> FailureKind {
    if change.to == ProcessState::SpawnFailed {
        return FailureKind::SpawnFailure;
    }
    match &change.exit {
        Some(exit) if exit.error.is_some() => FailureKind::RuntimeSpawnError,
        _ => FailureKind::UnexpectedExit,
    }
}

fn describe_exit(change: &StateChange) -> String {
    let pid = change
        .pid
        .map(|pid| format!(" (pid {pid})"))
        .unwrap_or_default();
    match &change.exit {
        Some(exit) => format!("{}{pid} exited with {exit}", change.handle),
        None => format!("{}{pid} exited with unknown status", change.handle),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::{
        process::Command,
        sync::mpsc::RecvTimeoutError,
        time::{Duration, Instant},
    };

    use super::*;
    use crate::{
        fallback::render_fallback_page,
        supervisor::ExitInfo,
        window::{
            testing::{CallLog, FakeFactory},
            WindowContent, WindowState,
        },
    };

    const WAIT: Duration = Duration::from_secs(10);

    struct FakeProbe {
        result: Result<(), String>,
        hold_until_cancelled: bool,
    }

    impl FakeProbe {
        fn ready() -> Self {
            Self {
                result: Ok(()),
                hold_until_cancelled: false,
            }
        }

        fn failing(error: &str) -> Self {
            Self {
                result: Err(error.to_string()),
                hold_until_cancelled: false,
            }
        }

        fn held() -> Self {
            Self {
                result: Ok(()),
                hold_until_cancelled: true,
            }
        }
    }

    impl ReadinessProbe for FakeProbe {
        fn wait_ready(&self, _target: &WindowTarget, cancel: &CancelToken) -> Result<(), String> {
            if self.hold_until_cancelled {
                while cancel.sleep(Duration::from_millis(10)) {}
                return Err(CANCELLED.to_string());
            }
            self.result.clone()
        }
    }

    struct Harness {
        coordinator: LifecycleCoordinator,
        receiver: Receiver<HostEvent>,
        log: CallLog,
        dir: tempfile::TempDir,
    }

    fn shell(script: &str) -> Result<LaunchPlan, ConfigError> {
        Ok(LaunchPlan::new("/bin/sh").arg("-c").arg(script))
    }

    fn harness_with(
        plan: Result<LaunchPlan, ConfigError>,
        probe: FakeProbe,
        policy: WindowClosePolicy,
        factory: FakeFactory,
    ) -> Harness {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = factory.log.clone();
        let (events, receiver) = host_channel();
        let coordinator = LifecycleCoordinator::new(
            CoordinatorOptions {
                target: WindowTarget::parse("http://localhost:3000"),
                launch_plan: plan,
                window_close_policy: policy,
            },
            InstanceLock::new(dir.path().join("host.lock")),
            WindowManager::new(Box::new(factory)),
            Arc::new(probe),
            events,
        );
        Harness {
            coordinator,
            receiver,
            log,
            dir,
        }
    }

    fn harness(
        plan: Result<LaunchPlan, ConfigError>,
        probe: FakeProbe,
        policy: WindowClosePolicy,
    ) -> Harness {
        harness_with(plan, probe, policy, FakeFactory::default())
    }

    fn pump_until(harness: &mut Harness, what: &str, done: impl Fn(&LifecycleCoordinator) -> bool) {
        let deadline = Instant::now() + WAIT;
        while !done(&harness.coordinator) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match harness.receiver.recv_timeout(remaining) {
                Ok(event) => {
                    harness.coordinator.handle_event(event);
                }
                Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => {
                    panic!("timed out waiting for {what}")
                }
            }
        }
    }

    fn target_loaded(coordinator: &LifecycleCoordinator) -> bool {
        coordinator
            .windows()
            .current()
            .is_some_and(|window| window.content == WindowContent::Target)
    }

    fn server_running(coordinator: &LifecycleCoordinator) -> bool {
        coordinator.snapshot().server_state == ProcessState::Running
    }

    fn position(
        coordinator: &LifecycleCoordinator,
        wanted: impl Fn(&LifecycleAction) -> bool,
    ) -> Option<usize> {
        coordinator.actions().iter().position(wanted)
    }

    fn count(
        coordinator: &LifecycleCoordinator,
        wanted: impl Fn(&LifecycleAction) -> bool,
    ) -> usize {
        coordinator.actions().iter().filter(|action| wanted(*action)).count()
    }

    fn server_started(action: &LifecycleAction) -> bool {
        matches!(action, LifecycleAction::ServerStarted(_))
    }

    fn stop_signalled(action: &LifecycleAction) -> bool {
        matches!(action, LifecycleAction::ServerStopSignalled(_))
    }

    fn load_scheduled(action: &LifecycleAction) -> bool {
        matches!(action, LifecycleAction::LoadScheduled(_))
    }

    fn load_completed(action: &LifecycleAction) -> bool {
        matches!(action, LifecycleAction::LoadCompleted(_))
    }

    #[test]
    fn server_crash_after_load_shows_stopped_fallback_with_exit_code() {
        let mut h = harness(
            shell("sleep 1; exit 1"),
            FakeProbe::ready(),
            WindowClosePolicy::QuitWhenAllClosed,
        );

        assert_eq!(h.coordinator.handle_event(HostEvent::Ready), LoopControl::Continue);
        let handle = h.coordinator.supervisor().current().expect("server handle");
        assert!(handle.state().is_active());

        pump_until(&mut h, "target loaded", target_loaded);
        assert_eq!(h.coordinator.state(), LifecycleState::Running);
        assert!(!h.coordinator.degraded());

        pump_until(&mut h, "degraded after crash", LifecycleCoordinator::degraded);
        assert_eq!(handle.state(), ProcessState::ExitedError);
        assert_eq!(h.coordinator.state(), LifecycleState::Running);

        let window = h.coordinator.windows().current().expect("window stays open");
        assert_eq!(window.state, WindowState::Loaded);
        let fallback = window.fallback().expect("fallback content");
        assert_eq!(fallback.kind, FailureKind::UnexpectedExit);
        assert!(fallback.detail.contains("code 1"), "{}", fallback.detail);
        assert!(render_fallback_page(fallback).contains("stopped unexpectedly"));
        assert!(h.log.position("render main-1").is_some());
        assert_eq!(count(&h.coordinator, server_started), 1);
    }

    #[test]
    fn clean_exit_without_stop_request_is_still_unexpected() {
        let mut h = harness(
            shell("sleep 0.3; exit 0"),
            FakeProbe::ready(),
            WindowClosePolicy::QuitWhenAllClosed,
        );
        h.coordinator.handle_event(HostEvent::Ready);
        pump_until(&mut h, "degraded after clean exit", LifecycleCoordinator::degraded);

        assert_eq!(h.coordinator.snapshot().server_state, ProcessState::ExitedClean);
        let window = h.coordinator.windows().current().expect("window stays open");
        let fallback = window.fallback().expect("fallback content");
        assert_eq!(fallback.kind, FailureKind::UnexpectedExit);
        assert!(fallback.detail.contains("code 0"), "{}", fallback.detail);
        assert!(render_fallback_page(fallback).contains("stopped unexpectedly"));
    }

    #[test]
    fn os_error_while_watching_shows_process_error() {
        let mut h = harness(
            shell("exec sleep 30"),
            FakeProbe::ready(),
            WindowClosePolicy::QuitWhenAllClosed,
        );
        h.coordinator.handle_event(HostEvent::Ready);
        pump_until(&mut h, "server running", server_running);
        pump_until(&mut h, "target loaded", target_loaded);

        let handle = h.coordinator.supervisor().current().expect("server handle");
        let change = StateChange {
            handle: handle.id(),
            pid: handle.pid(),
            from: ProcessState::Running,
            to: ProcessState::ExitedError,
            exit: Some(ExitInfo {
                code: None,
                signal: None,
                requested: false,
                error: Some("failed to poll server process status: EIO".to_string()),
            }),
        };
        assert_eq!(
            h.coordinator.handle_event(HostEvent::ServerStateChanged(change)),
            LoopControl::Continue
        );

        assert!(h.coordinator.degraded());
        let window = h.coordinator.windows().current().expect("window stays open");
        let fallback = window.fallback().expect("fallback content");
        assert_eq!(fallback.kind, FailureKind::RuntimeSpawnError);
        assert!(fallback.detail.contains("EIO"), "{}", fallback.detail);
        assert_eq!(count(&h.coordinator, server_started), 1);
        h.coordinator.handle_event(HostEvent::QuitRequested);
    }

    #[test]
    fn externally_killed_server_degrades_without_restart() {
        let mut h = harness(
            shell("exec sleep 30"),
            FakeProbe::ready(),
            WindowClosePolicy::QuitWhenAllClosed,
        );
        h.coordinator.handle_event(HostEvent::Ready);
        pump_until(&mut h, "server running", server_running);
        pump_until(&mut h, "target loaded", target_loaded);

        let pid = h.coordinator.snapshot().server_pid.expect("pid");
        let status = Command::new("kill")
            .arg("-9")
            .arg(pid.to_string())
            .status()
            .expect("run kill");
        assert!(status.success());

        pump_until(&mut h, "degraded after kill", LifecycleCoordinator::degraded);
        let snapshot = h.coordinator.snapshot();
        assert_eq!(snapshot.server_state, ProcessState::ExitedError);
        let failure = snapshot.last_failure.expect("recorded failure");
        assert_eq!(failure.kind, FailureKind::UnexpectedExit);
        assert!(failure.detail.contains("SIGKILL"), "{}", failure.detail);
        assert_eq!(count(&h.coordinator, server_started), 1);

        assert_eq!(
            h.coordinator.handle_event(HostEvent::QuitRequested),
            LoopControl::Exit(HostExitCode::Normal)
        );
        assert_eq!(count(&h.coordinator, stop_signalled), 0);
    }

    #[test]
    fn server_start_is_issued_before_window_load() {
        let mut h = harness(
            shell("exec sleep 30"),
            FakeProbe::ready(),
            WindowClosePolicy::QuitWhenAllClosed,
        );
        h.coordinator.handle_event(HostEvent::Ready);
        pump_until(&mut h, "target loaded", target_loaded);

        let started = position(&h.coordinator, server_started).expect("server started");
        let scheduled = position(&h.coordinator, load_scheduled).expect("load scheduled");
        let completed = position(&h.coordinator, load_completed).expect("load completed");
        assert_eq!(h.coordinator.actions()[0], LifecycleAction::LockAcquired);
        assert!(started < scheduled && scheduled < completed);
        assert_eq!(
            h.log.entries(),
            vec!["open main-1", "navigate main-1 http://localhost:3000/"]
        );
    }

    #[test]
    fn held_lock_exits_without_spawning_or_opening_windows() {
        let mut h = harness(
            shell("exec sleep 30"),
            FakeProbe::ready(),
            WindowClosePolicy::QuitWhenAllClosed,
        );
        let mut other = InstanceLock::new(h.dir.path().join("host.lock"));
        assert!(other.acquire());

        assert_eq!(
            h.coordinator.handle_event(HostEvent::Ready),
            LoopControl::Exit(HostExitCode::LockUnavailable)
        );
        assert_eq!(h.coordinator.state(), LifecycleState::LockFailed);
        assert_eq!(
            h.coordinator.snapshot().last_failure.map(|failure| failure.kind),
            Some(FailureKind::LockAcquisitionFailure)
        );
        assert!(h.coordinator.supervisor().current().is_none());
        assert!(h.log.entries().is_empty());
        assert_eq!(
            h.coordinator.handle_event(HostEvent::Activate),
            LoopControl::Exit(HostExitCode::LockUnavailable)
        );
        assert!(h.log.entries().is_empty());
    }

    #[test]
    fn spawn_failure_is_shown_in_the_window() {
        let mut h = harness(
            Ok(LaunchPlan::new("/nonexistent/desktop-host-server")),
            FakeProbe::ready(),
            WindowClosePolicy::QuitWhenAllClosed,
        );
        assert_eq!(h.coordinator.handle_event(HostEvent::Ready), LoopControl::Continue);

        assert_eq!(h.coordinator.state(), LifecycleState::Running);
        assert!(h.coordinator.degraded());
        assert_eq!(h.coordinator.snapshot().server_state, ProcessState::SpawnFailed);
        let window = h.coordinator.windows().current().expect("window");
        assert_eq!(window.state, WindowState::Loaded);
        let fallback = window.fallback().expect("fallback");
        assert_eq!(fallback.kind, FailureKind::SpawnFailure);
        assert!(fallback.detail.contains("desktop-host-server"), "{}", fallback.detail);
        assert!(h.log.position("navigate").is_none());
        assert!(position(&h.coordinator, load_scheduled).is_none());
    }

    #[test]
    fn unresolvable_launch_plan_counts_as_spawn_failure() {
        let mut h = harness(
            Err(ConfigError::EmptyCommand),
            FakeProbe::ready(),
            WindowClosePolicy::QuitWhenAllClosed,
        );
        h.coordinator.handle_event(HostEvent::Ready);

        let window = h.coordinator.windows().current().expect("window");
        let fallback = window.fallback().expect("fallback");
        assert_eq!(fallback.kind, FailureKind::SpawnFailure);
        assert_eq!(fallback.detail, "server command is empty");
    }

    #[test]
    fn spawn_failure_without_a_window_is_fatal() {
        let factory = FakeFactory {
            fail_open: true,
            ..FakeFactory::default()
        };
        let mut h = harness_with(
            Ok(LaunchPlan::new("/nonexistent/desktop-host-server")),
            FakeProbe::ready(),
            WindowClosePolicy::QuitWhenAllClosed,
            factory,
        );
        assert_eq!(
            h.coordinator.handle_event(HostEvent::Ready),
            LoopControl::Exit(HostExitCode::ServerSpawnFailed)
        );
        assert_eq!(h.coordinator.state(), LifecycleState::Terminated);
    }

    #[test]
    fn load_failure_shows_fallback_and_keeps_server() {
        let mut h = harness(
            shell("exec sleep 30"),
            FakeProbe::failing("connection refused"),
            WindowClosePolicy::QuitWhenAllClosed,
        );
        h.coordinator.handle_event(HostEvent::Ready);
        pump_until(&mut h, "load failure", LifecycleCoordinator::degraded);

        let window = h.coordinator.windows().current().expect("window");
        assert_eq!(window.state, WindowState::Loaded);
        let fallback = window.fallback().expect("fallback");
        assert_eq!(fallback.kind, FailureKind::LoadFailure);
        assert_eq!(fallback.detail, "connection refused");
        assert!(h.coordinator.snapshot().server_state.is_active());

        assert_eq!(
            h.coordinator.handle_event(HostEvent::QuitRequested),
            LoopControl::Exit(HostExitCode::Normal)
        );
        assert_eq!(h.coordinator.snapshot().server_state, ProcessState::ExitedClean);
    }

    #[test]
    fn repeated_quit_signals_the_server_once() {
        let mut h = harness(
            shell("exec sleep 30"),
            FakeProbe::ready(),
            WindowClosePolicy::QuitWhenAllClosed,
        );
        h.coordinator.handle_event(HostEvent::Ready);
        pump_until(&mut h, "target loaded", target_loaded);
        let handle = h.coordinator.supervisor().current().expect("handle");

        for event in [
            HostEvent::QuitRequested,
            HostEvent::QuitRequested,
            HostEvent::AllWindowsClosed,
            HostEvent::QuitRequested,
        ] {
            assert_eq!(
                h.coordinator.handle_event(event),
                LoopControl::Exit(HostExitCode::Normal)
            );
        }
        assert!(!h.coordinator.supervisor().stop());
        assert!(h.log.position("close main-1").is_some());

        assert_eq!(count(&h.coordinator, stop_signalled), 1);
        assert_eq!(handle.state(), ProcessState::ExitedClean);
        assert!(handle.exit_info().is_some_and(|exit| exit.requested));
        assert_eq!(h.coordinator.state(), LifecycleState::Terminated);
    }

    #[test]
    fn closing_the_window_leaves_the_server_alone() {
        let mut h = harness(
            shell("exec sleep 30"),
            FakeProbe::ready(),
            WindowClosePolicy::KeepRunning,
        );
        h.coordinator.handle_event(HostEvent::Ready);
        pump_until(&mut h, "server running", server_running);
        pump_until(&mut h, "target loaded", target_loaded);
        let pid = h.coordinator.snapshot().server_pid;

        assert_eq!(
            h.coordinator.handle_event(HostEvent::WindowClosed(WindowId(1))),
            LoopControl::Continue
        );
        assert_eq!(
            h.coordinator.handle_event(HostEvent::AllWindowsClosed),
            LoopControl::Continue
        );

        let snapshot = h.coordinator.snapshot();
        assert!(snapshot.window.is_none());
        assert_eq!(snapshot.server_state, ProcessState::Running);
        assert_eq!(snapshot.server_pid, pid);
        assert_eq!(h.coordinator.state(), LifecycleState::Running);
    }

    #[test]
    fn activation_reuses_the_running_server() {
        let mut h = harness(
            shell("exec sleep 30"),
            FakeProbe::ready(),
            WindowClosePolicy::KeepRunning,
        );
        h.coordinator.handle_event(HostEvent::Ready);
        pump_until(&mut h, "server running", server_running);
        pump_until(&mut h, "target loaded", target_loaded);
        let pid = h.coordinator.snapshot().server_pid;

        h.coordinator.handle_event(HostEvent::WindowClosed(WindowId(1)));
        assert_eq!(h.coordinator.handle_event(HostEvent::Activate), LoopControl::Continue);
        pump_until(&mut h, "second window loaded", target_loaded);

        let window = h.coordinator.windows().current().expect("new window");
        assert_eq!(window.id, WindowId(2));
        assert_eq!(h.coordinator.snapshot().server_pid, pid);
        assert_eq!(count(&h.coordinator, server_started), 1);
        assert!(h.log.position("open main-2").is_some());
    }

    #[test]
    fn activation_after_server_death_starts_a_fresh_server() {
        let mut h = harness(
            shell("exit 3"),
            FakeProbe::held(),
            WindowClosePolicy::KeepRunning,
        );
        h.coordinator.handle_event(HostEvent::Ready);
        pump_until(&mut h, "first crash", LifecycleCoordinator::degraded);

        h.coordinator.handle_event(HostEvent::WindowClosed(WindowId(1)));
        h.coordinator.handle_event(HostEvent::Activate);
        assert_eq!(count(&h.coordinator, server_started), 2);
        assert_eq!(
            h.coordinator.windows().current().map(|window| window.id),
            Some(WindowId(2))
        );
    }

    #[test]
    fn closing_window_cancels_pending_load() {
        let mut h = harness(
            shell("exec sleep 30"),
            FakeProbe::held(),
            WindowClosePolicy::KeepRunning,
        );
        h.coordinator.handle_event(HostEvent::Ready);
        h.coordinator.handle_event(HostEvent::WindowClosed(WindowId(1)));

        let quiet_until = Instant::now() + Duration::from_millis(300);
        while let Some(remaining) = quiet_until.checked_duration_since(Instant::now()) {
            match h.receiver.recv_timeout(remaining) {
                Ok(event) => {
                    assert!(!matches!(event, HostEvent::ReadinessResolved { .. }));
                    h.coordinator.handle_event(event);
                }
                Err(_) => break,
            }
        }
        assert!(h.log.position("navigate").is_none());
        assert!(h.coordinator.windows().current().is_none());
    }

    #[test]
    fn second_instance_focuses_existing_window_only() {
        let mut h = harness(
            shell("exec sleep 30"),
            FakeProbe::ready(),
            WindowClosePolicy::QuitWhenAllClosed,
        );
        h.coordinator.handle_event(HostEvent::Ready);
        pump_until(&mut h, "target loaded", target_loaded);

        h.coordinator.handle_event(HostEvent::SecondInstance(SecondInstanceAttempt {
            args: vec!["desktop-host".to_string()],
            cwd: "/tmp".to_string(),
        }));

        assert!(h.log.position("focus main-1").is_some());
        assert_eq!(
            h.log
                .entries()
                .iter()
                .filter(|entry| entry.starts_with("open"))
                .count(),
            1
        );
        assert_eq!(count(&h.coordinator, server_started), 1);
    }

    #[test]
    fn quitting_when_all_windows_close_stops_the_server() {
        let mut h = harness(
            shell("exec sleep 30"),
            FakeProbe::ready(),
            WindowClosePolicy::QuitWhenAllClosed,
        );
        h.coordinator.handle_event(HostEvent::Ready);
        pump_until(&mut h, "target loaded", target_loaded);

        h.coordinator.handle_event(HostEvent::WindowClosed(WindowId(1)));
        assert_eq!(
            h.coordinator.handle_event(HostEvent::AllWindowsClosed),
            LoopControl::Exit(HostExitCode::Normal)
        );
        assert_eq!(h.coordinator.snapshot().server_state, ProcessState::ExitedClean);
    }

    #[test]
    fn snapshot_serializes_for_diagnostics() {
        let h = harness(
            shell("exec sleep 30"),
            FakeProbe::ready(),
            WindowClosePolicy::QuitWhenAllClosed,
        );
        let json = serde_json::to_value(h.coordinator.snapshot()).expect("serialize");
        assert_eq!(json["state"], "Init");
        assert_eq!(json["serverState"], "NotStarted");
        assert_eq!(json["degraded"], false);
    }
}
