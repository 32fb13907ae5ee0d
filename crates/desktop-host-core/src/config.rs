use std::{
    env,
    path::PathBuf,
    time::Duration,
};

use serde::Serialize;

use crate::{
    target::WindowTarget, DEFAULT_LOAD_GRACE_MS, DEFAULT_PING_TIMEOUT_MS,
    DEFAULT_READY_POLL_INTERVAL_MS, DEFAULT_READY_TIMEOUT_MS, DEFAULT_ROOT_DIR_NAME,
    KEEP_ALIVE_ENV, LOAD_GRACE_ENV, LOAD_GRACE_MAX_MS, LOG_LEVEL_ENV, PING_TIMEOUT_ENV,
    PING_TIMEOUT_MAX_MS, PING_TIMEOUT_MIN_MS, READY_HTTP_PATH_ENV, READY_POLL_INTERVAL_ENV,
    READY_POLL_INTERVAL_MAX_MS, READY_POLL_INTERVAL_MIN_MS, READY_TIMEOUT_ENV,
    READY_TIMEOUT_MAX_MS, READY_TIMEOUT_MIN_MS, ROOT_DIR_ENV, TARGET_URL_ENV,
};

/// What happens to the host once its last window is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum WindowClosePolicy {
    QuitWhenAllClosed,
    KeepRunning,
}

impl WindowClosePolicy {
    /// Conventional behaviour of the OS the binary was built for.
    pub fn platform_default() -> Self {
        if cfg!(target_os = "macos") {
            Self::KeepRunning
        } else {
            Self::QuitWhenAllClosed
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadinessConfig {
    pub load_grace: Duration,
    pub timeout: Duration,
    pub poll_interval: Duration,
    pub ping_timeout: Duration,
    pub http_path: Option<String>,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            load_grace: Duration::from_millis(DEFAULT_LOAD_GRACE_MS),
            timeout: Duration::from_millis(DEFAULT_READY_TIMEOUT_MS),
            poll_interval: Duration::from_millis(DEFAULT_READY_POLL_INTERVAL_MS),
            ping_timeout: Duration::from_millis(DEFAULT_PING_TIMEOUT_MS),
            http_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HostConfig {
    pub root_dir: Option<PathBuf>,
    pub target: WindowTarget,
    pub readiness: ReadinessConfig,
    pub window_close_policy: WindowClosePolicy,
    pub log_level: log::LevelFilter,
}

impl HostConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let root_dir = lookup(ROOT_DIR_ENV)
            .map(|value| PathBuf::from(value.trim()))
            .filter(|path| !path.as_os_str().is_empty())
            .or_else(default_root_dir);
        let target = WindowTarget::parse(&lookup(TARGET_URL_ENV).unwrap_or_default());
        let readiness = ReadinessConfig {
            load_grace: Duration::from_millis(parse_clamped_ms(
                lookup(LOAD_GRACE_ENV),
                DEFAULT_LOAD_GRACE_MS,
                0,
                LOAD_GRACE_MAX_MS,
            )),
            timeout: Duration::from_millis(parse_clamped_ms(
                lookup(READY_TIMEOUT_ENV),
                DEFAULT_READY_TIMEOUT_MS,
                READY_TIMEOUT_MIN_MS,
                READY_TIMEOUT_MAX_MS,
            )),
            poll_interval: Duration::from_millis(parse_clamped_ms(
                lookup(READY_POLL_INTERVAL_ENV),
                DEFAULT_READY_POLL_INTERVAL_MS,
                READY_POLL_INTERVAL_MIN_MS,
                READY_POLL_INTERVAL_MAX_MS,
            )),
            ping_timeout: Duration::from_millis(parse_clamped_ms(
                lookup(PING_TIMEOUT_ENV),
                DEFAULT_PING_TIMEOUT_MS,
                PING_TIMEOUT_MIN_MS,
                PING_TIMEOUT_MAX_MS,
            )),
            http_path: lookup(READY_HTTP_PATH_ENV).and_then(|value| normalize_http_path(&value)),
        };
        let window_close_policy = match lookup(KEEP_ALIVE_ENV).as_deref().and_then(parse_flag) {
            Some(true) => WindowClosePolicy::KeepRunning,
            Some(false) => WindowClosePolicy::QuitWhenAllClosed,
            None => WindowClosePolicy::platform_default(),
        };
        let log_level = lookup(LOG_LEVEL_ENV)
            .and_then(|value| value.trim().parse().ok())
            .unwrap_or(log::LevelFilter::Info);

        Self {
            root_dir,
            target,
            readiness,
            window_close_policy,
            log_level,
        }
    }

    pub fn log_dir(&self) -> Option<PathBuf> {
        self.root_dir.as_ref().map(|root| root.join("logs"))
    }

    /// Falls back to the temp directory so the lock stays machine-wide.
    pub fn lock_path(&self, file_name: &str) -> PathBuf {
        self.root_dir
            .clone()
            .unwrap_or_else(env::temp_dir)
            .join(file_name)
    }

    pub fn describe(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|error| format!("<unserializable: {error}>"))
    }
}

pub fn default_root_dir() -> Option<PathBuf> {
    home::home_dir().map(|home| home.join(DEFAULT_ROOT_DIR_NAME))
}

pub(crate) fn parse_clamped_ms(
    raw: Option<String>,
    default_ms: u64,
    min_ms: u64,
    max_ms: u64,
) -> u64 {
    raw.and_then(|value| value.trim().parse::<u64>().ok())
        .map(|value| value.clamp(min_ms, max_ms))
        .unwrap_or(default_ms)
}

pub(crate) fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn normalize_http_path(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.starts_with('/') {
        Some(trimmed.to_string())
    } else {
        Some(format!("/{trimmed}"))
    }
}
