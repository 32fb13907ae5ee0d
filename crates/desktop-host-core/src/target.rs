use std::{
    env, fmt,
    path::{Path, PathBuf},
};

use serde::Serialize;
use url::Url;

use crate::DEFAULT_TARGET_URL;

/// Address a shell window is pointed at. Fixed for the life of the window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "camelCase")]
pub enum WindowTarget {
    Http(Url),
    File(PathBuf),
}

impl WindowTarget {
    /// Parses an http(s) origin, a `file://` URL or a plain path. Malformed
    /// http addresses fall back to [`DEFAULT_TARGET_URL`]; relative paths are
    /// anchored to the current directory.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Self::Http(default_target_url());
        }

        let lowered = trimmed.to_ascii_lowercase();
        if lowered.starts_with("http://") || lowered.starts_with("https://") {
            return Self::Http(normalize_http_url(trimmed));
        }
        if lowered.starts_with("file://") {
            if let Some(path) = Url::parse(trimmed)
                .ok()
                .and_then(|url| url.to_file_path().ok())
            {
                return Self::File(path);
            }
        }

        let path = PathBuf::from(trimmed);
        if path.is_relative() {
            if let Ok(current_dir) = env::current_dir() {
                return Self::File(current_dir.join(path));
            }
        }
        Self::File(path)
    }

    pub fn scheme(&self) -> Option<&str> {
        match self {
            Self::Http(url) => Some(url.scheme()),
            Self::File(_) => None,
        }
    }

    pub fn as_url(&self) -> Option<Url> {
        match self {
            Self::Http(url) => Some(url.clone()),
            Self::File(path) => Url::from_file_path(path).ok(),
        }
    }

    pub fn file_path(&self) -> Option<&Path> {
        match self {
            Self::File(path) => Some(path),
            Self::Http(_) => None,
        }
    }

    pub fn host_and_port(&self) -> Option<(String, u16)> {
        let Self::Http(url) = self else {
            return None;
        };
        let host = url.host_str()?.to_string();
        let port = url.port_or_known_default()?;
        Some((host, port))
    }
}

impl fmt::Display for WindowTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http(url) => write!(f, "{url}"),
            Self::File(path) => write!(f, "{}", path.display()),
        }
    }
}

fn normalize_http_url(raw: &str) -> Url {
    let mut url = Url::parse(raw.trim())
        .ok()
        .filter(|url| url.host_str().is_some())
        .unwrap_or_else(default_target_url);
    if url.path().is_empty() {
        url.set_path("/");
    }
    url
}

pub fn default_target_url() -> Url {
    Url::parse(DEFAULT_TARGET_URL).expect("DEFAULT_TARGET_URL is a valid constant URL")
}
