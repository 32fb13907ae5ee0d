use desktop_host_core::{ShellWindow, WindowFactory, WindowTarget};
use tauri::{AppHandle, WebviewUrl, WebviewWindow, WebviewWindowBuilder};

/// Bundled page shown until the target finishes loading.
const STARTUP_PAGE: &str = "index.html";

pub(crate) struct TauriWindowFactory {
    app_handle: AppHandle,
}

impl TauriWindowFactory {
    pub(crate) fn new(app_handle: AppHandle) -> Self {
        Self { app_handle }
    }
}

impl WindowFactory for TauriWindowFactory {
    fn open(&mut self, label: &str, title: &str) -> Result<Box<dyn ShellWindow>, String> {
        let window = WebviewWindowBuilder::new(
            &self.app_handle,
            label,
            WebviewUrl::App(STARTUP_PAGE.into()),
        )
        .title(title)
        .inner_size(1280.0, 800.0)
        .min_inner_size(800.0, 600.0)
        .build()
        .map_err(|error| format!("failed to create window {label}: {error}"))?;

        if let Err(error) = window.set_focus() {
            log::warn!(target: "window", "failed to focus new window {label}: {error}");
        }
        Ok(Box::new(TauriWindow { window }))
    }
}

struct TauriWindow {
    window: WebviewWindow,
}

impl ShellWindow for TauriWindow {
    fn navigate(&mut self, target: &WindowTarget) -> Result<(), String> {
        let url = target
            .as_url()
            .ok_or_else(|| format!("cannot express {target} as a URL"))?;
        self.window
            .navigate(url)
            .map_err(|error| format!("failed to navigate to {target}: {error}"))
    }

    fn render_html(&mut self, html: &str) -> Result<(), String> {
        let script = replace_document_script(html)?;
        self.window
            .eval(&script)
            .map_err(|error| format!("failed to render page: {error}"))
    }

    fn focus(&mut self) -> Result<(), String> {
        self.window
            .unminimize()
            .and_then(|_| self.window.show())
            .and_then(|_| self.window.set_focus())
            .map_err(|error| error.to_string())
    }

    fn close(&mut self) -> Result<(), String> {
        self.window.close().map_err(|error| error.to_string())
    }
}

/// Script that swaps the whole document for `html`, whatever page the
/// webview currently shows.
fn replace_document_script(html: &str) -> Result<String, String> {
    let literal = serde_json::to_string(html)
        .map_err(|error| format!("failed to encode page: {error}"))?;
    Ok(format!(
        "document.open();document.write({literal});document.close();"
    ))
}
