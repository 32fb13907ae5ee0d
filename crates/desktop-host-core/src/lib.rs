//! Core of the desktop host: single-instance gate, backend server
//! supervision, window lifecycle and the coordinator that ties them
//! together. The Tauri shell in `src-tauri` only adapts platform events.

mod app_constants;

pub mod config;
pub mod coordinator;
pub mod error;
pub mod fallback;
pub mod instance_lock;
pub mod launch_plan;
pub mod logging;
pub mod readiness;
pub mod supervisor;
pub mod target;
pub mod window;

pub use app_constants::*;
pub use config::{HostConfig, ReadinessConfig, WindowClosePolicy};
pub use coordinator::{
    host_channel, CoordinatorOptions, HostEvent, HostSender, LifecycleCoordinator,
    LifecycleSnapshot, LifecycleState, LoopControl,
};
pub use error::{ConfigError, FailureKind, HostExitCode, LockError, SpawnError};
pub use instance_lock::{InstanceLock, SecondInstanceAttempt};
pub use launch_plan::{resolve_launch_plan, LaunchPlan};
pub use logging::DesktopLogger;
pub use readiness::{CancelToken, ReadinessProbe, TcpReadinessProbe};
pub use supervisor::{ProcessState, ProcessSupervisor, ServerProcessHandle};
pub use target::WindowTarget;
pub use window::{ShellWindow, WindowFactory, WindowId, WindowManager};
