use std::{sync::Arc, thread};

use desktop_host_core::{
    host_channel, logging::resolve_desktop_log_path, resolve_launch_plan, CoordinatorOptions,
    DesktopLogger, HostConfig, HostEvent, InstanceLock, LifecycleCoordinator,
    SecondInstanceAttempt, TcpReadinessProbe, WindowId, WindowManager, DESKTOP_LOG_FILE,
    DESKTOP_LOG_MAX_BYTES, INSTANCE_LOCK_FILE, LOG_BACKUP_COUNT,
};
use tauri::{AppHandle, Manager, RunEvent, WindowEvent};

use crate::tauri_window::TauriWindowFactory;

pub(crate) fn run() {
    let config = HostConfig::from_env();
    install_logger(&config);
    log::info!(target: "startup", "desktop host starting with {}", config.describe());

    let launch_plan = resolve_launch_plan(&config.target);
    match &launch_plan {
        Ok(plan) => log::info!(target: "startup", "server command: {:?}", plan.debug_command()),
        Err(error) => log::error!(target: "startup", "failed to resolve server command: {error}"),
    }

    let (events, receiver) = host_channel();
    let second_instance_events = events.clone();
    let window_events = events.clone();

    let app = tauri::Builder::default()
        .plugin(tauri_plugin_single_instance::init(move |_app, args, cwd| {
            second_instance_events.send(HostEvent::SecondInstance(SecondInstanceAttempt {
                args,
                cwd,
            }));
        }))
        .on_window_event(move |window, event| {
            if let WindowEvent::Destroyed = event {
                if let Some(id) = WindowId::from_label(window.label()) {
                    window_events.send(HostEvent::WindowClosed(id));
                }
            }
        })
        .build(tauri::generate_context!())
        .expect("error while building tauri application");

    let coordinator = LifecycleCoordinator::new(
        CoordinatorOptions {
            target: config.target.clone(),
            launch_plan,
            window_close_policy: config.window_close_policy,
        },
        InstanceLock::new(config.lock_path(INSTANCE_LOCK_FILE)),
        WindowManager::new(Box::new(TauriWindowFactory::new(app.handle().clone()))),
        Arc::new(TcpReadinessProbe::new(config.readiness.clone())),
        events.clone(),
    );
    let supervisor = coordinator.supervisor();

    let app_handle = app.handle().clone();
    thread::Builder::new()
        .name("host-coordinator".to_string())
        .spawn(move || {
            let code = coordinator.run(receiver);
            log::info!(target: "shutdown", "desktop host exiting with code {}", code.code());
            app_handle.exit(code.code());
        })
        .expect("failed to start host coordinator thread");

    app.run(move |app_handle, event| match event {
        RunEvent::Ready => {
            events.send(HostEvent::Ready);
        }
        RunEvent::ExitRequested { code: None, api, .. } => {
            api.prevent_exit();
            events.send(exit_request_event(app_handle));
        }
        #[cfg(target_os = "macos")]
        RunEvent::Reopen { .. } => {
            events.send(HostEvent::Activate);
        }
        RunEvent::Exit => {
            if supervisor.stop() {
                log::warn!(target: "shutdown", "server was still running at exit; stopped it");
            }
        }
        _ => {}
    });
}

/// A platform exit request with windows still open is a quit command;
/// without windows it is the last window going away.
fn exit_request_event(app_handle: &AppHandle) -> HostEvent {
    if app_handle.webview_windows().is_empty() {
        HostEvent::AllWindowsClosed
    } else {
        HostEvent::QuitRequested
    }
}

fn install_logger(config: &HostConfig) {
    let log_path = resolve_desktop_log_path(config.log_dir(), DESKTOP_LOG_FILE);
    let logger = DesktopLogger::new(config.log_level).with_file(
        &log_path,
        DESKTOP_LOG_MAX_BYTES,
        LOG_BACKUP_COUNT,
    );
    if let Err(error) = logger.install() {
        eprintln!("failed to install desktop logger: {error}");
        return;
    }
    log::info!(target: "startup", "desktop log path: {}", log_path.display());
}

