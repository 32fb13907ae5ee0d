use std::time::Duration;

pub const DEFAULT_TARGET_URL: &str = "http://127.0.0.1:3000/";
pub const DEFAULT_SERVER_SCRIPT: &str = "packages/server/dist/main.js";
pub const DEFAULT_NODE_BIN: &str = "node";
pub const DEFAULT_ROOT_DIR_NAME: &str = ".desktop-host";

pub const SERVER_CMD_ENV: &str = "DESKTOP_HOST_SERVER_CMD";
pub const SERVER_PATH_ENV: &str = "DESKTOP_HOST_SERVER_PATH";
pub const SERVER_CWD_ENV: &str = "DESKTOP_HOST_SERVER_CWD";
pub const NODE_BIN_ENV: &str = "DESKTOP_HOST_NODE_BIN";
pub const TARGET_URL_ENV: &str = "DESKTOP_HOST_URL";
pub const ROOT_DIR_ENV: &str = "DESKTOP_HOST_ROOT";
pub const LOAD_GRACE_ENV: &str = "DESKTOP_HOST_LOAD_GRACE_MS";
pub const READY_TIMEOUT_ENV: &str = "DESKTOP_HOST_READY_TIMEOUT_MS";
pub const READY_POLL_INTERVAL_ENV: &str = "DESKTOP_HOST_READY_POLL_INTERVAL_MS";
pub const PING_TIMEOUT_ENV: &str = "DESKTOP_HOST_PING_TIMEOUT_MS";
pub const READY_HTTP_PATH_ENV: &str = "DESKTOP_HOST_READY_HTTP_PATH";
pub const KEEP_ALIVE_ENV: &str = "DESKTOP_HOST_KEEP_ALIVE_WITHOUT_WINDOWS";
pub const LOG_LEVEL_ENV: &str = "DESKTOP_HOST_LOG_LEVEL";
pub const CLIENT_MARKER_ENV: &str = "DESKTOP_HOST_CLIENT";

pub const DEFAULT_LOAD_GRACE_MS: u64 = 0;
pub const LOAD_GRACE_MAX_MS: u64 = 30_000;
pub const DEFAULT_READY_TIMEOUT_MS: u64 = 20_000;
pub const READY_TIMEOUT_MIN_MS: u64 = 100;
pub const READY_TIMEOUT_MAX_MS: u64 = 10 * 60 * 1000;
pub const DEFAULT_READY_POLL_INTERVAL_MS: u64 = 300;
pub const READY_POLL_INTERVAL_MIN_MS: u64 = 50;
pub const READY_POLL_INTERVAL_MAX_MS: u64 = 10_000;
pub const READY_BACKOFF_MAX_FACTOR: u32 = 8;
pub const DEFAULT_PING_TIMEOUT_MS: u64 = 800;
pub const PING_TIMEOUT_MIN_MS: u64 = 50;
pub const PING_TIMEOUT_MAX_MS: u64 = 30_000;

pub const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub const DESKTOP_LOG_FILE: &str = "desktop.log";
pub const DESKTOP_LOG_MAX_BYTES: u64 = 5 * 1024 * 1024;
pub const LOG_BACKUP_COUNT: usize = 5;
pub const INSTANCE_LOCK_FILE: &str = "desktop-host.lock";

pub const MAIN_WINDOW_LABEL_PREFIX: &str = "main";
pub const MAIN_WINDOW_TITLE: &str = "Desktop Host";
