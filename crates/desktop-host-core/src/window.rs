use std::fmt;

use serde::Serialize;

use crate::{
    error::FailureKind,
    fallback::{render_fallback_page, FallbackContent},
    target::WindowTarget,
    MAIN_WINDOW_LABEL_PREFIX, MAIN_WINDOW_TITLE,
};

/// Native window as seen by the manager. Implemented by the platform shell.
pub trait ShellWindow: Send {
    fn navigate(&mut self, target: &WindowTarget) -> Result<(), String>;
    fn render_html(&mut self, html: &str) -> Result<(), String>;
    /// Restores from minimized and brings the window to the foreground.
    fn focus(&mut self) -> Result<(), String>;
    fn close(&mut self) -> Result<(), String>;
}

pub trait WindowFactory: Send {
    fn open(&mut self, label: &str, title: &str) -> Result<Box<dyn ShellWindow>, String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct WindowId(pub u64);

impl WindowId {
    pub fn label(self) -> String {
        format!("{MAIN_WINDOW_LABEL_PREFIX}-{}", self.0)
    }

    pub fn from_label(label: &str) -> Option<Self> {
        label
            .strip_prefix(MAIN_WINDOW_LABEL_PREFIX)?
            .strip_prefix('-')?
            .parse()
            .ok()
            .map(Self)
    }
}

impl fmt::Display for WindowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WindowState {
    Creating,
    LoadPending,
    Loaded,
    LoadFailed,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WindowContent {
    Blank,
    Target,
    Fallback(FallbackContent),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowHandle {
    pub id: WindowId,
    pub state: WindowState,
    pub target: WindowTarget,
    pub content: WindowContent,
}

impl WindowHandle {
    pub fn fallback(&self) -> Option<&FallbackContent> {
        match &self.content {
            WindowContent::Fallback(content) => Some(content),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    Loaded,
    Failed(String),
    /// The load was for a window that no longer exists.
    Ignored,
}

struct ManagedWindow {
    handle: WindowHandle,
    native: Box<dyn ShellWindow>,
}

/// Owner of the single primary window.
pub struct WindowManager {
    factory: Box<dyn WindowFactory>,
    next_id: u64,
    current: Option<ManagedWindow>,
}

impl WindowManager {
    pub fn new(factory: Box<dyn WindowFactory>) -> Self {
        Self {
            factory,
            next_id: 0,
            current: None,
        }
    }

    pub fn current(&self) -> Option<&WindowHandle> {
        self.current.as_ref().map(|window| &window.handle)
    }

    pub fn has_window(&self) -> bool {
        self.current.is_some()
    }

    /// Opens a new shell window in `Creating`. Content is loaded later.
    pub fn create(&mut self, target: WindowTarget) -> Result<WindowHandle, String> {
        if let Some(existing) = self.current() {
            return Err(format!("primary window {} already exists", existing.id));
        }

        self.next_id += 1;
        let id = WindowId(self.next_id);
        let native = self.factory.open(&id.label(), MAIN_WINDOW_TITLE)?;
        let handle = WindowHandle {
            id,
            state: WindowState::Creating,
            target,
            content: WindowContent::Blank,
        };
        log::info!(target: "window", "created {id} for {}", handle.target);
        self.current = Some(ManagedWindow {
            handle: handle.clone(),
            native,
        });
        Ok(handle)
    }

    pub fn begin_load(&mut self, id: WindowId) -> bool {
        match self.window_mut(id) {
            Some(window) if window.handle.state == WindowState::Creating => {
                window.handle.state = WindowState::LoadPending;
                true
            }
            _ => false,
        }
    }

    /// Completes a load once readiness is known. Failures are replaced in
    /// place with a fallback page so the window is never blank.
    pub fn load(&mut self, id: WindowId, readiness: Result<(), String>) -> LoadOutcome {
        let Some(window) = self.window_mut(id) else {
            return LoadOutcome::Ignored;
        };
        if !matches!(
            window.handle.state,
            WindowState::Creating | WindowState::LoadPending
        ) {
            return LoadOutcome::Ignored;
        }

        let result = match readiness {
            Ok(()) => window.native.navigate(&window.handle.target),
            Err(error) => Err(error),
        };
        match result {
            Ok(()) => {
                window.handle.state = WindowState::Loaded;
                window.handle.content = WindowContent::Target;
                log::info!(target: "window", "{id} loaded {}", window.handle.target);
                LoadOutcome::Loaded
            }
            Err(error) => {
                window.handle.state = WindowState::LoadFailed;
                log::error!(
                    target: "window",
                    "{id} failed to load {}: {error}",
                    window.handle.target
                );
                let content = FallbackContent::new(
                    FailureKind::LoadFailure,
                    window.handle.target.to_string(),
                    error.clone(),
                );
                self.show_fallback(id, content);
                LoadOutcome::Failed(error)
            }
        }
    }

    /// Replaces the window content with a diagnostic page. Returns `false`
    /// when there is no such window or rendering failed.
    pub fn show_fallback(&mut self, id: WindowId, content: FallbackContent) -> bool {
        let Some(window) = self.window_mut(id) else {
            log::warn!(
                target: "window",
                "no window {id} to show fallback: {}",
                content.summary()
            );
            return false;
        };

        let page = render_fallback_page(&content);
        match window.native.render_html(&page) {
            Ok(()) => {
                log::info!(target: "window", "{id} showing fallback: {}", content.summary());
                window.handle.state = WindowState::Loaded;
                window.handle.content = WindowContent::Fallback(content);
                true
            }
            Err(error) => {
                log::error!(target: "window", "{id} failed to render fallback page: {error}");
                window.handle.state = WindowState::LoadFailed;
                false
            }
        }
    }

    pub fn focus(&mut self) -> bool {
        let Some(window) = self.current.as_mut() else {
            return false;
        };
        match window.native.focus() {
            Ok(()) => true,
            Err(error) => {
                log::warn!(target: "window", "failed to focus {}: {error}", window.handle.id);
                false
            }
        }
    }

    /// Records a native close. Only touches window state.
    pub fn on_closed(&mut self, id: WindowId) -> Option<WindowHandle> {
        if self.current.as_ref().map(|window| window.handle.id) != Some(id) {
            return None;
        }
        let mut window = self.current.take()?;
        window.handle.state = WindowState::Closed;
        log::info!(target: "window", "{id} closed");
        Some(window.handle)
    }

    pub fn close_all(&mut self) {
        if let Some(mut window) = self.current.take() {
            if let Err(error) = window.native.close() {
                log::warn!(target: "window", "failed to close {}: {error}", window.handle.id);
            }
            window.handle.state = WindowState::Closed;
        }
    }

    fn window_mut(&mut self, id: WindowId) -> Option<&mut ManagedWindow> {
        self.current
            .as_mut()
            .filter(|window| window.handle.id == id)
    }
}
