//! Byte stream between the client and the runner.
//!
//! The client only needs an ordered, reliable, blocking stream plus a way to
//! shut it down from another thread. [`RunnerTransport`] captures that so
//! tests can replay canned responses without spawning a runner.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::{Duration, Instant};

use tracing::debug;

use super::error::EimError;

/// A bidirectional stream to a runner.
pub trait RunnerTransport: Read + Write + Send {
    /// A handle that can shut the stream down while a read is blocked on it.
    fn shutdown_handle(&self) -> io::Result<ShutdownHandle>;

    /// Bound the next blocking read. Transports that never block ignore it.
    fn set_read_timeout(&mut self, _timeout: Option<Duration>) -> io::Result<()> {
        Ok(())
    }
}

/// Closes a transport from another thread, unblocking pending reads.
pub struct ShutdownHandle(Box<dyn Fn() + Send + Sync>);

impl ShutdownHandle {
    pub fn new(f: impl Fn() + Send + Sync + 'static) -> Self {
        Self(Box::new(f))
    }

    /// Handle for transports with nothing to interrupt.
    pub fn noop() -> Self {
        Self::new(|| {})
    }

    pub fn shutdown(&self) {
        (self.0)();
    }
}

impl fmt::Debug for ShutdownHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ShutdownHandle")
    }
}

impl RunnerTransport for UnixStream {
    fn shutdown_handle(&self) -> io::Result<ShutdownHandle> {
        let clone = self.try_clone()?;
        Ok(ShutdownHandle::new(move || {
            let _ = clone.shutdown(Shutdown::Both);
        }))
    }

    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        UnixStream::set_read_timeout(self, timeout)
    }
}

/// Connect to the runner's socket.
///
/// The runner may have created the socket file before it starts accepting,
/// so refused connections are retried until `connect_timeout` elapses.
pub fn connect_unix(
    path: &Path,
    connect_timeout: Duration,
    request_timeout: Duration,
) -> Result<UnixStream, EimError> {
    let started = Instant::now();
    let mut attempts = 0u32;

    let stream = loop {
        attempts += 1;
        match UnixStream::connect(path) {
            Ok(stream) => break stream,
            Err(e) if is_retryable(&e) && started.elapsed() < connect_timeout => {
                std::thread::sleep(Duration::from_millis(20));
            }
            Err(e) if is_retryable(&e) => {
                return Err(EimError::Timeout(format!(
                    "connect to {} after {attempts} attempts: {e}",
                    path.display()
                )));
            }
            Err(e) => {
                return Err(EimError::ConnectFailed {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                });
            }
        }
    };

    let request_timeout = Some(request_timeout).filter(|d| !d.is_zero());
    stream.set_read_timeout(request_timeout)?;
    stream.set_write_timeout(request_timeout)?;

    debug!(
        socket = %path.display(),
        attempts,
        "Connected to runner"
    );
    Ok(stream)
}

fn is_retryable(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionRefused | io::ErrorKind::NotFound | io::ErrorKind::WouldBlock
    )
}
