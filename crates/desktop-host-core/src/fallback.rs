use serde::Serialize;

use crate::error::FailureKind;

/// What a fallback page tells the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FallbackContent {
    pub kind: FailureKind,
    pub address: String,
    pub detail: String,
}

impl FallbackContent {
    pub fn new(kind: FailureKind, address: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            kind,
            address: address.into(),
            detail: detail.into(),
        }
    }

    pub fn headline(&self) -> &'static str {
        match self.kind {
            FailureKind::UnexpectedExit => "Server stopped unexpectedly",
            FailureKind::SpawnFailure => "Server failed to start",
            FailureKind::RuntimeSpawnError => "Server process error",
            FailureKind::LoadFailure => "Could not load the application",
            FailureKind::LockAcquisitionFailure => "Application is already running",
        }
    }

    pub fn explanation(&self) -> &'static str {
        match self.kind {
            FailureKind::UnexpectedExit => {
                "The backend server stopped unexpectedly and was not restarted. \
                 Quit and reopen the application to try again."
            }
            FailureKind::SpawnFailure => {
                "The backend server could not be launched. Check that it is installed \
                 and that the configured path is correct."
            }
            FailureKind::RuntimeSpawnError => {
                "The operating system reported an error for the backend server process."
            }
            FailureKind::LoadFailure => {
                "The application window could not load its content."
            }
            FailureKind::LockAcquisitionFailure => {
                "Another instance already holds the application lock."
            }
        }
    }

    /// One-line summary used for logs and window titles.
    pub fn summary(&self) -> String {
        format!("{}: {} ({})", self.headline(), self.detail, self.address)
    }
}

/// Renders a self-contained page: inline styles only, no scripts and no
/// external resources, so it displays with the server unreachable.
pub fn render_fallback_page(content: &FallbackContent) -> String {
    let headline = escape_html(content.headline());
    let explanation = escape_html(content.explanation());
    let address = escape_html(&content.address);
    let detail = escape_html(&content.detail);

    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<title>{headline}</title>
<style>
body {{ font-family: -apple-system, "Segoe UI", Roboto, sans-serif; margin: 0; padding: 48px; background: #f6f7f9; color: #1f2328; }}
main {{ max-width: 640px; margin: 0 auto; background: #fff; border: 1px solid #d0d7de; border-radius: 8px; padding: 32px; }}
h1 {{ font-size: 22px; margin: 0 0 12px; color: #b42318; }}
dt {{ font-weight: 600; margin-top: 16px; }}
dd {{ margin: 4px 0 0; }}
code, pre {{ font-family: ui-monospace, Menlo, Consolas, monospace; font-size: 13px; }}
pre {{ white-space: pre-wrap; word-break: break-word; background: #f6f8fa; padding: 12px; border-radius: 6px; }}
</style>
</head>
<body>
<main>
<h1>{headline}</h1>
<p>{explanation}</p>
<dl>
<dt>Address</dt>
<dd><code>{address}</code></dd>
<dt>Error</dt>
<dd><pre>{detail}</pre></dd>
</dl>
</main>
</body>
</html>
"#
    )
}

pub fn escape_html(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}
