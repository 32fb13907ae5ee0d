//! Desktop log sink: every record goes to stderr and to a size-rotated file
//! under the host root. Log targets double as categories (`startup`,
//! `runtime`, `server`, `window`, `shutdown`).

use std::{
    fs::{self, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    },
};

use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

#[derive(Debug)]
struct RotatingFile {
    path: PathBuf,
    max_bytes: u64,
    backup_count: usize,
    write_lock: Mutex<()>,
    failure_reported: AtomicBool,
}

impl RotatingFile {
    fn append(&self, line: &str) {
        let _guard = match self.write_lock.lock() {
            Ok(guard) => guard,
            Err(error) => error.into_inner(),
        };
        if let Err(error) = self.append_locked(line) {
            if !self.failure_reported.swap(true, Ordering::Relaxed) {
                eprintln!(
                    "failed to write desktop log {}: {error}",
                    self.path.display()
                );
            }
        }
    }

    fn append_locked(&self, line: &str) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let current_len = fs::metadata(&self.path).map(|meta| meta.len()).unwrap_or(0);
        if current_len > 0 && current_len + line.len() as u64 > self.max_bytes {
            rotate_log_files(&self.path, self.backup_count)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())
    }
}

#[derive(Debug)]
pub struct DesktopLogger {
    level: LevelFilter,
    file: Option<RotatingFile>,
    echo_stderr: bool,
}

impl DesktopLogger {
    pub fn new(level: LevelFilter) -> Self {
        Self {
            level,
            file: None,
            echo_stderr: true,
        }
    }

    pub fn with_file(
        mut self,
        path: impl Into<PathBuf>,
        max_bytes: u64,
        backup_count: usize,
    ) -> Self {
        self.file = Some(RotatingFile {
            path: path.into(),
            max_bytes,
            backup_count,
            write_lock: Mutex::new(()),
            failure_reported: AtomicBool::new(false),
        });
        self
    }

    pub fn echo_stderr(mut self, enabled: bool) -> Self {
        self.echo_stderr = enabled;
        self
    }

    /// Installs this logger as the global `log` sink.
    pub fn install(self) -> Result<(), SetLoggerError> {
        let level = self.level;
        log::set_boxed_logger(Box::new(self))?;
        log::set_max_level(level);
        Ok(())
    }
}

impl Log for DesktopLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = format_log_line(record.level(), record.target(), &record.args().to_string());
        if self.echo_stderr {
            eprint!("{line}");
        }
        if let Some(file) = &self.file {
            file.append(&line);
        }
    }

    fn flush(&self) {
        let _ = io::stderr().flush();
    }
}

pub fn format_log_line(level: log::Level, category: &str, message: &str) -> String {
    let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
    format!("[{timestamp}] [{level}] [{category}] {message}\n")
}

pub fn resolve_desktop_log_path(log_dir: Option<PathBuf>, file_name: &str) -> PathBuf {
    log_dir
        .unwrap_or_else(|| std::env::temp_dir().join("desktop-host"))
        .join(file_name)
}

fn backup_path(path: &Path, index: usize) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(format!(".{index}"));
    PathBuf::from(name)
}

/// Shifts `log`, `log.1`, ... one slot up, dropping the oldest backup.
fn rotate_log_files(path: &Path, backup_count: usize) -> io::Result<()> {
    if backup_count == 0 {
        return fs::remove_file(path).or_else(ignore_not_found);
    }

    fs::remove_file(backup_path(path, backup_count)).or_else(ignore_not_found)?;
    for index in (1..backup_count).rev() {
        let from = backup_path(path, index);
        if from.exists() {
            fs::rename(&from, backup_path(path, index + 1))?;
        }
    }
    fs::rename(path, backup_path(path, 1))
}

fn ignore_not_found(error: io::Error) -> io::Result<()> {
    if error.kind() == io::ErrorKind::NotFound {
        Ok(())
    } else {
        Err(error)
    }
}
