use std::{
    env,
    ffi::OsStr,
    path::{Path, PathBuf},
};

use serde::Serialize;

use crate::{
    error::ConfigError, target::WindowTarget, CLIENT_MARKER_ENV, DEFAULT_NODE_BIN,
    DEFAULT_SERVER_SCRIPT, NODE_BIN_ENV, SERVER_CMD_ENV, SERVER_CWD_ENV, SERVER_PATH_ENV,
};

/// Fully resolved invocation of the backend server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchPlan {
    pub cmd: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    /// Added on top of the inherited parent environment.
    pub envs: Vec<(String, String)>,
}

impl LaunchPlan {
    pub fn new(cmd: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            args: Vec::new(),
            cwd: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            envs: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = cwd.into();
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn debug_command(&self) -> Vec<String> {
        let mut parts = vec![self.cmd.clone()];
        parts.extend(self.args.clone());
        parts
    }
}

pub fn resolve_launch_plan(target: &WindowTarget) -> Result<LaunchPlan, ConfigError> {
    let exe_dir = env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf));
    let current_dir = env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    resolve_launch_plan_with(
        |key| env::var(key).ok(),
        exe_dir.as_deref(),
        &current_dir,
        target,
    )
}

/// Precedence: explicit command line, explicit server path, then the
/// bundled server script next to the executable. Relative explicit paths
/// are taken from `current_dir`.
pub fn resolve_launch_plan_with<F>(
    lookup: F,
    exe_dir: Option<&Path>,
    current_dir: &Path,
    target: &WindowTarget,
) -> Result<LaunchPlan, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let base_dir = exe_dir
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let explicit_cwd = lookup(SERVER_CWD_ENV)
        .map(|value| PathBuf::from(value.trim()))
        .filter(|path| !path.as_os_str().is_empty())
        .map(|path| current_dir.join(path));

    let mut plan = if let Some(custom_cmd) = lookup(SERVER_CMD_ENV)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
    {
        let mut pieces = shlex::split(&custom_cmd)
            .ok_or_else(|| ConfigError::InvalidCommand(custom_cmd.clone()))?;
        if pieces.is_empty() {
            return Err(ConfigError::EmptyCommand);
        }
        let cmd = pieces.remove(0);
        LaunchPlan {
            cmd,
            args: pieces,
            cwd: explicit_cwd.clone().unwrap_or_else(|| base_dir.clone()),
            envs: Vec::new(),
        }
    } else {
        let server_path = lookup(SERVER_PATH_ENV)
            .map(|value| PathBuf::from(value.trim()))
            .filter(|path| !path.as_os_str().is_empty())
            .map(|path| current_dir.join(path))
            .unwrap_or_else(|| base_dir.join("..").join(DEFAULT_SERVER_SCRIPT));
        let cwd = explicit_cwd.clone().unwrap_or_else(|| {
            server_path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| base_dir.clone())
        });

        if is_script(&server_path) {
            let node = lookup(NODE_BIN_ENV)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| DEFAULT_NODE_BIN.to_string());
            LaunchPlan::new(node)
                .arg(server_path.to_string_lossy().to_string())
                .cwd(cwd)
        } else {
            LaunchPlan::new(server_path.to_string_lossy().to_string()).cwd(cwd)
        }
    };

    plan.envs.push((CLIENT_MARKER_ENV.to_string(), "1".to_string()));
    if let Some((host, port)) = target.host_and_port() {
        if lookup("HOST").is_none() {
            plan.envs.push(("HOST".to_string(), host));
        }
        if lookup("PORT").is_none() {
            plan.envs.push(("PORT".to_string(), port.to_string()));
        }
    }

    Ok(plan)
}

fn is_script(path: &Path) -> bool {
    matches!(
        path.extension().and_then(OsStr::to_str),
        Some("js" | "mjs" | "cjs")
    )
}
