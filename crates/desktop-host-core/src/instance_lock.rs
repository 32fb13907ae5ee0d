use std::{
    fs::{self, File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

use fs2::FileExt;

use crate::error::LockError;

/// Machine-wide exclusivity gate backed by an advisory lock on a well-known
/// file. The lock lives as long as this value, so it is released by the OS
/// when the host process exits.
#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
    file: Option<File>,
}

/// Invocation details of a launch that lost the race for the lock.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct SecondInstanceAttempt {
    pub args: Vec<String>,
    pub cwd: String,
}

impl InstanceLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn held(&self) -> bool {
        self.file.is_some()
    }

    /// Returns `true` when this process owns the lock. I/O failures count as
    /// not acquired so a broken lock directory never yields two hosts.
    pub fn acquire(&mut self) -> bool {
        match self.try_acquire() {
            Ok(acquired) => acquired,
            Err(error) => {
                log::error!(target: "startup", "{error}");
                false
            }
        }
    }

    pub fn try_acquire(&mut self) -> Result<bool, LockError> {
        if self.held() {
            return Ok(true);
        }

        if let Some(parent) = self.path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| LockError::Io {
                path: self.path.clone(),
                source,
            })?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.path)
            .map_err(|source| LockError::Io {
                path: self.path.clone(),
                source,
            })?;

        if file.try_lock_exclusive().is_err() {
            log::warn!(
                target: "startup",
                "instance lock {} is held by another process",
                self.path.display()
            );
            return Ok(false);
        }

        if let Err(error) = file
            .set_len(0)
            .and_then(|_| writeln!(file, "{}", std::process::id()))
        {
            log::debug!(target: "startup", "failed to record pid in instance lock: {error}");
        }

        log::info!(target: "startup", "instance lock acquired: {}", self.path.display());
        self.file = Some(file);
        Ok(true)
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            let _ = FileExt::unlock(&file);
        }
    }
}
