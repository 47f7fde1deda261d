//! Runner client configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Configuration for spawning and talking to a runner.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// How long to keep retrying the socket connect once the endpoint exists.
    pub connect_timeout: Duration,
    /// Read/write timeout for a single request/response round trip.
    pub request_timeout: Duration,
    /// Upper bound on waiting for the runner to create its endpoint.
    pub startup_timeout: Duration,
    /// Interval between endpoint existence checks during startup.
    pub poll_interval: Duration,
    /// Time the runner gets to exit after SIGINT before it is killed.
    pub stop_grace: Duration,
    /// Directory holding named shared-memory segments.
    pub shm_root: PathBuf,
    /// Inherit the runner's stdout/stderr and request debug output.
    pub debug: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(5),
            startup_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(100),
            stop_grace: Duration::from_millis(500),
            shm_root: PathBuf::from("/dev/shm"),
            debug: false,
        }
    }
}

impl RunnerConfig {
    /// Load config from environment variables.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Some(d) = env_millis("EIM_CONNECT_TIMEOUT_MS") {
            cfg.connect_timeout = d;
        }
        if let Some(d) = env_millis("EIM_REQUEST_TIMEOUT_MS") {
            cfg.request_timeout = d;
        }
        if let Some(d) = env_millis("EIM_STARTUP_TIMEOUT_MS") {
            cfg.startup_timeout = d;
        }
        if let Some(d) = env_millis("EIM_POLL_INTERVAL_MS") {
            cfg.poll_interval = d;
        }
        if let Some(d) = env_millis("EIM_STOP_GRACE_MS") {
            cfg.stop_grace = d;
        }

        if let Ok(path) = dotenvy::var("EIM_SHM_ROOT") {
            cfg.shm_root = PathBuf::from(path);
        }

        if let Ok(val) = dotenvy::var("EIM_RUNNER_DEBUG") {
            cfg.debug = val.eq_ignore_ascii_case("true") || val == "1";
        }

        cfg
    }

    /// Builder-style toggle for debug mode.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }
}

fn env_millis(key: &str) -> Option<Duration> {
    let val = dotenvy::var(key).ok()?;
    val.trim().parse::<u64>().ok().map(Duration::from_millis)
}
