#![allow(dead_code)]

use eim_runner::runner::{RunnerConfig, RunnerTransport, ShutdownHandle};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::io::{self, Cursor, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tempfile::TempDir;

/// Captures tracing output for tests.
pub struct TestTracing {
    buffer: Arc<std::sync::Mutex<Vec<u8>>>,
}

impl TestTracing {
    pub fn new() -> Self {
        Self {
            buffer: Arc::new(std::sync::Mutex::new(Vec::new())),
        }
    }

    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        let writer = self.buffer.clone();
        let make_writer = move || TestWriter(writer.clone());
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .without_time()
            .with_max_level(tracing::Level::DEBUG)
            .with_writer(make_writer)
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub fn output(&self) -> String {
        let buf = self.buffer.lock().unwrap();
        String::from_utf8_lossy(&buf).to_string()
    }

    /// Assert that the captured log output contains the provided substring.
    pub fn assert_contains(&self, needle: &str) {
        let out = self.output();
        assert!(
            out.contains(needle),
            "expected logs to contain `{needle}`, got:\n{out}"
        );
    }
}

struct TestWriter(Arc<std::sync::Mutex<Vec<u8>>>);

impl Write for TestWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut guard = self.0.lock().unwrap();
        guard.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// What a [`FakeTransport`] saw, readable after the transport moved into
/// the client.
#[derive(Clone, Default)]
pub struct FakeTap {
    written: Arc<Mutex<Vec<u8>>>,
    shut: Arc<AtomicBool>,
}

impl FakeTap {
    /// Raw bytes written by the client.
    pub fn written(&self) -> String {
        String::from_utf8_lossy(&self.written.lock()).to_string()
    }

    /// Requests written by the client, decoded in order.
    pub fn requests(&self) -> Vec<Value> {
        let bytes = self.written.lock().clone();
        serde_json::Deserializer::from_slice(&bytes)
            .into_iter::<Value>()
            .map(|v| v.unwrap())
            .collect()
    }

    pub fn was_shut_down(&self) -> bool {
        self.shut.load(Ordering::SeqCst)
    }
}

/// Answers each request with the next canned response and records what the
/// client wrote.
pub struct FakeTransport {
    pending: VecDeque<Vec<u8>>,
    current: Cursor<Vec<u8>>,
    stall_when_drained: bool,
    tap: FakeTap,
}

impl FakeTransport {
    pub fn new<S: AsRef<[u8]>>(responses: &[S]) -> Self {
        Self {
            pending: responses.iter().map(|r| r.as_ref().to_vec()).collect(),
            current: Cursor::new(Vec::new()),
            stall_when_drained: false,
            tap: FakeTap::default(),
        }
    }

    /// Report a read timeout instead of EOF once a response is used up.
    pub fn stall_when_drained(mut self) -> Self {
        self.stall_when_drained = true;
        self
    }

    pub fn tap(&self) -> FakeTap {
        self.tap.clone()
    }
}

impl Read for FakeTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.current.read(buf)?;
        if n == 0 && self.stall_when_drained {
            return Err(io::Error::new(io::ErrorKind::WouldBlock, "fake runner is silent"));
        }
        Ok(n)
    }
}

impl Write for FakeTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tap.written.lock().extend_from_slice(buf);
        if let Some(next) = self.pending.pop_front() {
            self.current = Cursor::new(next);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl RunnerTransport for FakeTransport {
    fn shutdown_handle(&self) -> io::Result<ShutdownHandle> {
        let shut = self.tap.shut.clone();
        Ok(ShutdownHandle::new(move || shut.store(true, Ordering::SeqCst)))
    }
}

/// Sets an environment variable for the lifetime of the guard.
pub struct EnvGuard {
    key: String,
    prev: Option<String>,
}

impl EnvGuard {
    pub fn set(key: &str, val: impl AsRef<std::ffi::OsStr>) -> Self {
        let prev = std::env::var(key).ok();
        unsafe { std::env::set_var(key, val) };
        Self {
            key: key.to_string(),
            prev,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        match &self.prev {
            Some(v) => unsafe { std::env::set_var(&self.key, v) },
            None => unsafe { std::env::remove_var(&self.key) },
        }
    }
}

/// Write an executable `/bin/sh` script standing in for a runner.
pub fn script(dir: &TempDir, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.path().join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Short timeouts so failing tests fail quickly.
pub fn fast_config() -> RunnerConfig {
    RunnerConfig {
        connect_timeout: Duration::from_secs(2),
        request_timeout: Duration::from_secs(2),
        startup_timeout: Duration::from_secs(10),
        poll_interval: Duration::from_millis(10),
        stop_grace: Duration::from_millis(200),
        ..RunnerConfig::default()
    }
}
