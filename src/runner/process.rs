//! Runner process lifecycle.
//!
//! Spawns the runner executable with a fresh socket path inside a private
//! temporary directory, waits for the socket to appear, and tears the child
//! down again (SIGINT, bounded wait, then SIGKILL).

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use tempfile::TempDir;
use tracing::{debug, info, warn};

use super::config::RunnerConfig;
use super::error::EimError;

const SOCKET_NAME: &str = "runner.sock";

/// A spawned runner and the temporary directory holding its endpoint.
#[derive(Debug)]
pub struct RunnerProcess {
    child: Option<Child>,
    tempdir: Option<TempDir>,
    endpoint: PathBuf,
    stop_grace: Duration,
}

impl RunnerProcess {
    /// Spawn `executable` and wait until it has created its socket.
    pub fn start(executable: &Path, config: &RunnerConfig) -> Result<Self, EimError> {
        check_executable(executable)?;

        let tempdir = tempfile::Builder::new().prefix("eim-runner-").tempdir()?;
        let endpoint = tempdir.path().join(SOCKET_NAME);

        let (stdout, stderr) = if config.debug {
            (Stdio::inherit(), Stdio::inherit())
        } else {
            (Stdio::null(), Stdio::null())
        };

        let child = Command::new(executable)
            .arg(&endpoint)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .spawn()?;

        info!(
            pid = child.id(),
            executable = %executable.display(),
            endpoint = %endpoint.display(),
            "Spawned runner process"
        );

        let mut process = Self {
            child: Some(child),
            tempdir: Some(tempdir),
            endpoint,
            stop_grace: config.stop_grace,
        };
        // On error `process` is dropped here, which kills the child and
        // removes the temp dir.
        process.wait_for_endpoint(config.startup_timeout, config.poll_interval)?;
        Ok(process)
    }

    fn wait_for_endpoint(&mut self, timeout: Duration, interval: Duration) -> Result<(), EimError> {
        let started = Instant::now();
        loop {
            if let Some(status) = self.try_wait()? {
                warn!(status = %status, "Runner exited before creating its socket");
                return Err(EimError::RunnerStartupFailed {
                    code: status.code(),
                });
            }

            if self.endpoint.exists() {
                debug!(
                    endpoint = %self.endpoint.display(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Runner socket is ready"
                );
                return Ok(());
            }

            if started.elapsed() >= timeout {
                warn!(timeout_ms = timeout.as_millis() as u64, "Runner startup timed out");
                return Err(EimError::StartupTimeout(timeout));
            }

            std::thread::sleep(interval);
        }
    }

    fn try_wait(&mut self) -> Result<Option<ExitStatus>, EimError> {
        match self.child.as_mut() {
            Some(child) => Ok(child.try_wait()?),
            None => Ok(None),
        }
    }

    /// Path of the socket the runner listens on.
    pub fn endpoint(&self) -> &Path {
        &self.endpoint
    }

    /// Directory holding the endpoint, while it still exists.
    pub fn workdir(&self) -> Option<&Path> {
        self.tempdir.as_ref().map(TempDir::path)
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    /// Whether the child is still running.
    pub fn is_alive(&mut self) -> bool {
        matches!(self.try_wait(), Ok(None)) && self.child.is_some()
    }

    /// Stop the runner and remove its temp directory. Idempotent.
    pub fn terminate(&mut self) {
        if let Some(mut child) = self.child.take() {
            let pid = child.id();
            match child.try_wait() {
                Ok(Some(status)) => debug!(pid, status = %status, "Runner already exited"),
                _ => stop_child(&mut child, self.stop_grace),
            }
        }

        if let Some(tempdir) = self.tempdir.take() {
            let path = tempdir.path().to_path_buf();
            if let Err(e) = tempdir.close() {
                warn!(dir = %path.display(), error = %e, "Failed to remove runner temp dir");
            }
        }
    }
}

impl Drop for RunnerProcess {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn check_executable(path: &Path) -> Result<(), EimError> {
    let meta = match fs::metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(EimError::NotFound(path.to_path_buf()));
        }
        Err(e) => return Err(e.into()),
    };

    if !meta.is_file() || !is_executable(path) {
        return Err(EimError::NotExecutable(path.to_path_buf()));
    }
    Ok(())
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let Ok(c_path) = CString::new(path.as_os_str().as_bytes()) else {
        return false;
    };
    // access(2) checks against the caller's real uid, like os.access.
    unsafe { libc::access(c_path.as_ptr(), libc::X_OK) == 0 }
}

#[cfg(not(unix))]
fn is_executable(_path: &Path) -> bool {
    true
}

/// SIGINT, wait up to `grace`, then SIGKILL. Always reaps the child.
fn stop_child(child: &mut Child, grace: Duration) {
    let pid = child.id();
    send_interrupt(pid);

    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        match child.try_wait() {
            Ok(Some(status)) => {
                info!(pid, status = %status, "Runner stopped");
                return;
            }
            Ok(None) => std::thread::sleep(Duration::from_millis(10)),
            Err(e) => {
                warn!(pid, error = %e, "Failed to poll runner status");
                break;
            }
        }
    }

    warn!(
        pid,
        grace_ms = grace.as_millis() as u64,
        "Runner ignored SIGINT, killing"
    );
    if let Err(e) = child.kill() {
        warn!(pid, error = %e, "Failed to kill runner");
    }
    match child.wait() {
        Ok(status) => info!(pid, status = %status, "Runner killed"),
        Err(e) => warn!(pid, error = %e, "Failed to reap runner"),
    }
}

#[cfg(unix)]
fn send_interrupt(pid: u32) {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return;
    };
    unsafe {
        if libc::kill(pid, libc::SIGINT) != 0 {
            debug!(pid, "SIGINT delivery failed");
        }
    }
}

#[cfg(not(unix))]
fn send_interrupt(_pid: u32) {}
