use std::{
    io::{Read, Write},
    net::{SocketAddr, TcpStream, ToSocketAddrs},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use crate::{config::ReadinessConfig, target::WindowTarget, READY_BACKOFF_MAX_FACTOR};

const CANCEL_CHECK_SLICE: Duration = Duration::from_millis(25);
const STATUS_LINE_LIMIT: usize = 1024;

/// Shared cancellation flag for a pending window load.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Sleeps up to `duration`; returns `false` if cancelled meanwhile.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep(CANCEL_CHECK_SLICE.min(deadline - now));
        }
    }
}

pub const CANCELLED: &str = "cancelled";

pub trait ReadinessProbe: Send + Sync {
    /// Blocks until `target` can be loaded, the budget runs out, or `cancel`
    /// fires.
    fn wait_ready(&self, target: &WindowTarget, cancel: &CancelToken) -> Result<(), String>;
}

/// Polls the server with TCP connects (and optionally an HTTP GET) using
/// bounded exponential backoff.
#[derive(Debug, Clone)]
pub struct TcpReadinessProbe {
    config: ReadinessConfig,
}

impl TcpReadinessProbe {
    pub fn new(config: ReadinessConfig) -> Self {
        Self { config }
    }

    fn probe_once(&self, host: &str, port: u16, http_check: bool) -> Result<(), String> {
        let addrs = (host, port)
            .to_socket_addrs()
            .map_err(|error| format!("failed to resolve {host}:{port}: {error}"))?
            .collect::<Vec<_>>();
        if addrs.is_empty() {
            return Err(format!("no addresses for {host}:{port}"));
        }

        let mut last_error = String::new();
        for address in &addrs {
            match self.probe_address(host, address, http_check) {
                Ok(()) => return Ok(()),
                Err(error) => last_error = error,
            }
        }
        Err(last_error)
    }

    fn probe_address(
        &self,
        host: &str,
        address: &SocketAddr,
        http_check: bool,
    ) -> Result<(), String> {
        let timeout = self.config.ping_timeout;
        let mut stream = TcpStream::connect_timeout(address, timeout)
            .map_err(|error| format!("connect to {address} failed: {error}"))?;
        let Some(path) = self.config.http_path.as_deref().filter(|_| http_check) else {
            return Ok(());
        };

        stream
            .set_read_timeout(Some(timeout))
            .and_then(|_| stream.set_write_timeout(Some(timeout)))
            .map_err(|error| format!("failed to configure probe socket: {error}"))?;
        let request =
            format!("GET {path} HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n");
        stream
            .write_all(request.as_bytes())
            .map_err(|error| format!("liveness request to {address} failed: {error}"))?;

        let status_line = read_status_line(&mut stream)
            .map_err(|error| format!("liveness response from {address} failed: {error}"))?;
        let status = parse_status_code(&status_line)
            .ok_or_else(|| format!("malformed liveness response from {address}"))?;
        if status >= 500 {
            return Err(format!("liveness endpoint {path} answered {status}"));
        }
        Ok(())
    }
}

impl ReadinessProbe for TcpReadinessProbe {
    fn wait_ready(&self, target: &WindowTarget, cancel: &CancelToken) -> Result<(), String> {
        if !cancel.sleep(self.config.load_grace) {
            return Err(CANCELLED.to_string());
        }

        if let Some(path) = target.file_path() {
            return if path.is_file() {
                Ok(())
            } else {
                Err(format!("file not found: {}", path.display()))
            };
        }

        let Some((host, port)) = target.host_and_port() else {
            return Err(format!("unsupported target address: {target}"));
        };

        // Plain GET only works against http; https targets stay TCP-only.
        let http_check = target.scheme() == Some("http");
        let started = Instant::now();
        let mut delays = backoff_delays(self.config.poll_interval);
        let mut attempts = 0_u32;
        loop {
            if cancel.is_cancelled() {
                return Err(CANCELLED.to_string());
            }
            attempts += 1;
            let last_error = match self.probe_once(&host, port, http_check) {
                Ok(()) => {
                    log::info!(
                        target: "window",
                        "{target} ready after {attempts} attempt(s) in {}ms",
                        started.elapsed().as_millis()
                    );
                    return Ok(());
                }
                Err(error) => error,
            };

            let elapsed = started.elapsed();
            if elapsed >= self.config.timeout {
                return Err(format!(
                    "timed out after {}ms waiting for {target}: {last_error}",
                    self.config.timeout.as_millis()
                ));
            }
            let delay = delays
                .next()
                .unwrap_or(self.config.poll_interval)
                .min(self.config.timeout - elapsed);
            log::debug!(
                target: "window",
                "{target} not ready ({last_error}); retrying in {}ms",
                delay.as_millis()
            );
            if !cancel.sleep(delay) {
                return Err(CANCELLED.to_string());
            }
        }
    }
}

/// Doubling delays starting at `initial`, capped at
/// `initial * READY_BACKOFF_MAX_FACTOR`.
pub fn backoff_delays(initial: Duration) -> impl Iterator<Item = Duration> {
    let cap = initial * READY_BACKOFF_MAX_FACTOR;
    std::iter::successors(Some(initial), move |previous| Some((*previous * 2).min(cap)))
}

/// Reads up to the end of the first response line.
fn read_status_line(stream: &mut impl Read) -> std::io::Result<Vec<u8>> {
    let mut line = Vec::new();
    let mut chunk = [0_u8; 128];
    while !line.windows(2).any(|pair| pair == b"\r\n") && line.len() < STATUS_LINE_LIMIT {
        let read = stream.read(&mut chunk)?;
        if read == 0 {
            break;
        }
        line.extend_from_slice(&chunk[..read]);
    }
    Ok(line)
}

fn parse_status_code(response: &[u8]) -> Option<u16> {
    let text = std::str::from_utf8(response).ok()?;
    let mut parts = text.split_whitespace();
    let version = parts.next()?;
    if !version.starts_with("HTTP/") {
        return None;
    }
    parts.next()?.parse().ok()
}
