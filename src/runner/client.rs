//! Runner client: spawn, handshake, classify, stop.
//!
//! The protocol is strictly request/response over one socket, so every call
//! holds the session lock for its whole round trip. Teardown can run from any
//! thread through a [`StopHandle`]; it shuts the socket down first so a call
//! blocked on a read returns promptly instead of holding the lock.

use std::fmt;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::config::RunnerConfig;
use super::error::EimError;
use super::model_info::ModelInfo;
use super::process::RunnerProcess;
use super::protocol::{Framing, Payload, Request, decode_response, encode_request, read_frame};
use super::shm::SharedFeatureBuffer;
use super::transport::{RunnerTransport, ShutdownHandle, connect_unix};

/// Lifecycle of a [`ImpulseRunner`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Uninitialized,
    Initializing,
    Ready,
    Stopped,
}

/// Connection state owned by one client: the stream, the negotiated framing
/// and the optional shared feature buffer.
struct Session {
    transport: Box<dyn RunnerTransport>,
    framing: Framing,
    shm: Option<SharedFeatureBuffer>,
    next_id: u64,
    /// Bound on a whole round trip; zero means unbounded.
    request_timeout: Duration,
}

impl Session {
    fn new(transport: Box<dyn RunnerTransport>, request_timeout: Duration) -> Self {
        Self {
            transport,
            framing: Framing::BraceBalanced,
            shm: None,
            next_id: 0,
            request_timeout,
        }
    }

    /// One request/response round trip.
    fn call(&mut self, request: &Request<'_>, debug: bool) -> Result<Payload, EimError> {
        self.next_id += 1;
        let id = self.next_id;

        let started = Instant::now();
        let encoded = encode_request(request, id, debug.then_some(true))?;
        self.transport
            .write_all(&encoded)
            .and_then(|()| self.transport.flush())
            .map_err(|e| EimError::from_transport(e, "sending request"))?;
        let sent = started.elapsed();

        let deadline = Some(self.request_timeout)
            .filter(|d| !d.is_zero())
            .map(|d| started + d);
        let mut reader = DeadlineReader {
            transport: &mut *self.transport,
            deadline,
        };
        let frame = read_frame(&mut reader, self.framing)?;
        let received = started.elapsed();

        let payload = decode_response(&frame, id)?;
        debug!(
            id,
            kind = request.kind(),
            request_bytes = encoded.len(),
            response_bytes = frame.len(),
            sent_us = sent.as_micros() as u64,
            received_us = received.as_micros() as u64,
            parsed_us = started.elapsed().as_micros() as u64,
            "Runner round trip"
        );
        Ok(payload)
    }

    /// Detach shared memory, then drop the stream.
    fn close(self) {
        if let Some(shm) = self.shm {
            shm.detach();
        }
        drop(self.transport);
    }
}

/// Reads from the transport until the round-trip deadline passes, narrowing
/// the socket timeout to the time left before every read.
struct DeadlineReader<'a> {
    transport: &'a mut dyn RunnerTransport,
    deadline: Option<Instant>,
}

impl Read for DeadlineReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if let Some(deadline) = self.deadline {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "request deadline elapsed",
                ));
            }
            self.transport.set_read_timeout(Some(remaining))?;
        }
        self.transport.read(buf)
    }
}

struct Shared {
    state: Mutex<RunnerState>,
    stopped: AtomicBool,
    session: Mutex<Option<Session>>,
    process: Mutex<Option<RunnerProcess>>,
    closer: Mutex<Option<ShutdownHandle>>,
    info: Mutex<Option<ModelInfo>>,
}

impl Shared {
    fn new() -> Self {
        Self {
            state: Mutex::new(RunnerState::Uninitialized),
            stopped: AtomicBool::new(false),
            session: Mutex::new(None),
            process: Mutex::new(None),
            closer: Mutex::new(None),
            info: Mutex::new(None),
        }
    }

    fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            let previous = std::mem::replace(&mut *self.state.lock(), RunnerState::Stopped);
            info!(previous = ?previous, "Stopping runner");
        }
        self.release();
    }

    /// Release whatever is still held. Each resource is taken exactly once,
    /// so repeated or concurrent calls are harmless.
    fn release(&self) {
        if let Some(closer) = self.closer.lock().take() {
            closer.shutdown();
        }
        if let Some(session) = self.session.lock().take() {
            session.close();
        }
        if let Some(mut process) = self.process.lock().take() {
            process.terminate();
        }
    }

    fn ensure_not_stopped(&self) -> Result<(), EimError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(EimError::InvalidState(
                "runner was stopped during init".to_string(),
            ));
        }
        Ok(())
    }
}

/// Client for a runner executable.
///
/// ```ignore
/// use eim_runner::ImpulseRunner;
///
/// let runner = ImpulseRunner::new("./model.eim");
/// let info = runner.init()?;
/// let result = runner.classify(&features)?;
/// runner.stop();
/// ```
pub struct ImpulseRunner {
    model_path: PathBuf,
    config: RunnerConfig,
    shared: Arc<Shared>,
}

impl ImpulseRunner {
    /// Create a client with configuration from the environment.
    pub fn new(model_path: impl Into<PathBuf>) -> Self {
        Self::with_config(model_path, RunnerConfig::from_env())
    }

    pub fn with_config(model_path: impl Into<PathBuf>, config: RunnerConfig) -> Self {
        Self {
            model_path: model_path.into(),
            config,
            shared: Arc::new(Shared::new()),
        }
    }

    pub fn model_path(&self) -> &Path {
        &self.model_path
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn state(&self) -> RunnerState {
        *self.shared.state.lock()
    }

    /// Handshake result, once `init` has succeeded.
    pub fn model_info(&self) -> Option<ModelInfo> {
        self.shared.info.lock().clone()
    }

    /// A cloneable handle that stops this client from another thread.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Spawn the runner, connect to it and perform the handshake.
    ///
    /// On failure everything acquired so far is released and the client
    /// ends up `Stopped`.
    pub fn init(&self) -> Result<ModelInfo, EimError> {
        self.begin_init()?;
        let result = self.spawn_and_handshake();
        self.finish_init(result)
    }

    /// Handshake over an already-connected transport instead of spawning.
    pub fn attach<T: RunnerTransport + 'static>(&self, transport: T) -> Result<ModelInfo, EimError> {
        self.begin_init()?;
        let result = self.handshake(Box::new(transport));
        self.finish_init(result)
    }

    fn begin_init(&self) -> Result<(), EimError> {
        let mut state = self.shared.state.lock();
        if *state != RunnerState::Uninitialized {
            return Err(EimError::InvalidState(format!(
                "init requires an uninitialized runner (state: {:?})",
                *state
            )));
        }
        *state = RunnerState::Initializing;
        Ok(())
    }

    fn spawn_and_handshake(&self) -> Result<ModelInfo, EimError> {
        let process = RunnerProcess::start(&self.model_path, &self.config)?;
        let endpoint = process.endpoint().to_path_buf();
        *self.shared.process.lock() = Some(process);
        self.shared.ensure_not_stopped()?;

        let stream = connect_unix(
            &endpoint,
            self.config.connect_timeout,
            self.config.request_timeout,
        )?;
        self.handshake(Box::new(stream))
    }

    fn handshake(&self, transport: Box<dyn RunnerTransport>) -> Result<ModelInfo, EimError> {
        *self.shared.closer.lock() = Some(transport.shutdown_handle()?);
        self.shared.ensure_not_stopped()?;

        let mut session = Session::new(transport, self.config.request_timeout);
        let payload = session.call(&Request::Hello(1), false)?;
        let info = ModelInfo::from_payload(payload)?;

        if let Some(desc) = info.features_shm() {
            session.shm = Some(SharedFeatureBuffer::attach(&self.config.shm_root, desc)?);
            session.framing = Framing::Terminated;
        }

        *self.shared.session.lock() = Some(session);
        self.shared.ensure_not_stopped()?;
        Ok(info)
    }

    fn finish_init(&self, result: Result<ModelInfo, EimError>) -> Result<ModelInfo, EimError> {
        let info = match result {
            Ok(info) => info,
            Err(e) => {
                // A concurrent stop() closes the socket under the handshake;
                // report the stop rather than the I/O fallout.
                let e = match self.shared.ensure_not_stopped() {
                    Err(stopped) => stopped,
                    Ok(()) => e,
                };
                warn!(model = %self.model_path.display(), error = %e, "Runner init failed");
                self.shared.stop();
                return Err(e);
            }
        };

        let mut state = self.shared.state.lock();
        if self.shared.stopped.load(Ordering::SeqCst) {
            drop(state);
            self.shared.release();
            return Err(EimError::InvalidState(
                "runner was stopped during init".to_string(),
            ));
        }
        *state = RunnerState::Ready;
        *self.shared.info.lock() = Some(info.clone());

        info!(
            model = %self.model_path.display(),
            labels = info.labels().len(),
            shared_memory = info.features_shm().is_some(),
            "Runner ready"
        );
        Ok(info)
    }

    /// Classify one feature vector.
    pub fn classify(&self, features: &[f32]) -> Result<Payload, EimError> {
        self.classify_with(features, self.config.debug)
    }

    /// Classify, asking the runner for debug output when `debug` is set.
    pub fn classify_with(&self, features: &[f32], debug: bool) -> Result<Payload, EimError> {
        self.with_session("classify", |session| {
            let shm_elements = match session.shm.as_mut() {
                Some(shm) => Some(shm.write(features)?),
                None => None,
            };
            match shm_elements {
                Some(elements) => session.call(&Request::ClassifyShm { elements }, debug),
                None => session.call(&Request::Classify(features), debug),
            }
        })
    }

    /// Override a model threshold. `update` must be an object naming the
    /// threshold `id`, e.g. `{"id": 3, "min_score": 0.5}`.
    pub fn set_threshold(&self, update: &Value) -> Result<Payload, EimError> {
        self.with_session("set_threshold", |session| {
            let obj = update.as_object().ok_or_else(|| {
                EimError::InvalidInput("threshold update must be a JSON object".to_string())
            })?;
            if !obj.get("id").is_some_and(|id| id.is_u64() || id.is_i64()) {
                return Err(EimError::InvalidInput(
                    "threshold update must name a target id".to_string(),
                ));
            }
            session.call(&Request::SetThreshold(obj), false)
        })
    }

    fn with_session<T>(
        &self,
        op: &str,
        f: impl FnOnce(&mut Session) -> Result<T, EimError>,
    ) -> Result<T, EimError> {
        let state = self.state();
        if state != RunnerState::Ready {
            return Err(EimError::InvalidState(format!(
                "{op} requires a ready runner (state: {state:?})"
            )));
        }

        let result = {
            let mut guard = self.shared.session.lock();
            let session = guard.as_mut().ok_or_else(|| {
                EimError::InvalidState(format!("{op} called on a stopped runner"))
            })?;
            f(session)
        };

        if let Err(e) = &result
            && e.is_fatal()
        {
            warn!(op, error = %e, "Connection to runner is unusable, stopping");
            self.shared.stop();
        }
        result
    }

    /// Release the connection, shared memory, process and temp dir.
    /// Safe to call any number of times, from any state.
    pub fn stop(&self) {
        self.shared.stop();
    }
}

impl Drop for ImpulseRunner {
    fn drop(&mut self) {
        self.shared.stop();
    }
}

impl fmt::Debug for ImpulseRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImpulseRunner")
            .field("model_path", &self.model_path)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Stops the owning [`ImpulseRunner`] from another thread or task.
#[derive(Clone)]
pub struct StopHandle {
    shared: Arc<Shared>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.shared.stop();
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for StopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StopHandle")
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::{self, Cursor, Read, Write};

    /// Answers each request with the next canned response.
    struct Replay {
        pending: std::collections::VecDeque<Vec<u8>>,
        current: Cursor<Vec<u8>>,
        written: Arc<parking_lot::Mutex<Vec<u8>>>,
    }

    impl Replay {
        fn new(responses: &[&str]) -> (Self, Arc<parking_lot::Mutex<Vec<u8>>>) {
            let written = Arc::new(parking_lot::Mutex::new(Vec::new()));
            let replay = Self {
                pending: responses.iter().map(|r| r.as_bytes().to_vec()).collect(),
                current: Cursor::new(Vec::new()),
                written: Arc::clone(&written),
            };
            (replay, written)
        }
    }

    impl Read for Replay {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.current.read(buf)
        }
    }

    impl Write for Replay {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.written.lock().extend_from_slice(buf);
            if let Some(next) = self.pending.pop_front() {
                self.current = Cursor::new(next);
            }
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl RunnerTransport for Replay {
        fn shutdown_handle(&self) -> io::Result<ShutdownHandle> {
            Ok(ShutdownHandle::noop())
        }
    }

    const HELLO: &str = r#"{"id":1,"success":true,"model_parameters":{"frequency":16000,"input_features_count":4,"labels":["a","b"]}}"#;

    #[test]
    fn test_state_transitions() {
        let runner = ImpulseRunner::with_config("/unused", RunnerConfig::default());
        assert_eq!(runner.state(), RunnerState::Uninitialized);

        let (replay, _) = Replay::new(&[HELLO]);
        runner.attach(replay).unwrap();
        assert_eq!(runner.state(), RunnerState::Ready);

        runner.stop();
        assert_eq!(runner.state(), RunnerState::Stopped);
    }

    #[test]
    fn test_init_twice_is_invalid() {
        let runner = ImpulseRunner::with_config("/unused", RunnerConfig::default());
        let (replay, _) = Replay::new(&[HELLO]);
        runner.attach(replay).unwrap();

        let (again, _) = Replay::new(&[HELLO]);
        assert!(matches!(runner.attach(again), Err(EimError::InvalidState(_))));
        assert_eq!(runner.state(), RunnerState::Ready);
    }

    #[test]
    fn test_classify_before_init_is_invalid() {
        let runner = ImpulseRunner::with_config("/unused", RunnerConfig::default());
        let err = runner.classify(&[1.0]).unwrap_err();
        assert!(matches!(err, EimError::InvalidState(_)));
    }

    #[test]
    fn test_handshake_failure_stops_runner() {
        let runner = ImpulseRunner::with_config("/unused", RunnerConfig::default());
        let (replay, _) = Replay::new(&[r#"{"id":1,"success":false,"error":"no model"}"#]);
        let err = runner.attach(replay).unwrap_err();
        assert!(matches!(err, EimError::Runner(ref msg) if msg == "no model"));
        assert_eq!(runner.state(), RunnerState::Stopped);
        assert!(runner.model_info().is_none());
    }

    #[test]
    fn test_debug_flag_is_sent() {
        let runner = ImpulseRunner::with_config("/unused", RunnerConfig::default().with_debug(true));
        let (replay, written) =
            Replay::new(&[HELLO, r#"{"id":2,"success":true,"result":{}}"#]);
        runner.attach(replay).unwrap();
        runner.classify(&[0.5]).unwrap();

        let written = String::from_utf8(written.lock().clone()).unwrap();
        assert!(written.ends_with(r#"{"classify":[0.5],"id":2,"debug":true}"#));
    }

    #[test]
    fn test_stop_handle_stops_owner() {
        let runner = ImpulseRunner::with_config("/unused", RunnerConfig::default());
        let (replay, _) = Replay::new(&[HELLO]);
        runner.attach(replay).unwrap();

        let handle = runner.stop_handle();
        let other = handle.clone();
        std::thread::spawn(move || other.stop()).join().unwrap();

        assert!(handle.is_stopped());
        assert_eq!(runner.state(), RunnerState::Stopped);
        assert!(matches!(runner.classify(&[1.0]), Err(EimError::InvalidState(_))));
    }

    #[test]
    fn test_threshold_value_must_be_object() {
        let runner = ImpulseRunner::with_config("/unused", RunnerConfig::default());
        let (replay, _) = Replay::new(&[HELLO]);
        runner.attach(replay).unwrap();

        let err = runner.set_threshold(&json!([1, 2])).unwrap_err();
        assert!(matches!(err, EimError::InvalidInput(_)));
        assert_eq!(runner.state(), RunnerState::Ready);
    }

    /// Answers the handshake, then drips noise bytes that never form a frame.
    struct Drip {
        hello: Cursor<Vec<u8>>,
        requests: usize,
    }

    impl Read for Drip {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.requests < 2 {
                return self.hello.read(buf);
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
            buf[0] = b'x';
            Ok(1)
        }
    }

    impl Write for Drip {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.requests += 1;
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl RunnerTransport for Drip {
        fn shutdown_handle(&self) -> io::Result<ShutdownHandle> {
            Ok(ShutdownHandle::noop())
        }
    }

    #[test]
    fn test_noise_stream_hits_request_deadline() {
        let config = RunnerConfig {
            request_timeout: std::time::Duration::from_millis(100),
            ..RunnerConfig::default()
        };
        let runner = ImpulseRunner::with_config("/unused", config);
        runner
            .attach(Drip {
                hello: Cursor::new(HELLO.as_bytes().to_vec()),
                requests: 0,
            })
            .unwrap();

        let started = Instant::now();
        let err = runner.classify(&[1.0]).unwrap_err();
        assert!(matches!(err, EimError::Timeout(_)));
        assert!(started.elapsed() < std::time::Duration::from_secs(2));
        assert_eq!(runner.state(), RunnerState::Stopped);
    }

    /// Blocks every read until its shutdown handle fires, then reports EOF.
    struct Hang {
        shut: Arc<AtomicBool>,
    }

    impl Read for Hang {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            while !self.shut.load(Ordering::SeqCst) {
                std::thread::sleep(std::time::Duration::from_millis(5));
            }
            Ok(0)
        }
    }

    impl Write for Hang {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl RunnerTransport for Hang {
        fn shutdown_handle(&self) -> io::Result<ShutdownHandle> {
            let shut = Arc::clone(&self.shut);
            Ok(ShutdownHandle::new(move || shut.store(true, Ordering::SeqCst)))
        }
    }

    #[test]
    fn test_stop_during_handshake_wins() {
        let runner = ImpulseRunner::with_config("/unused", RunnerConfig::default());
        let shut = Arc::new(AtomicBool::new(false));
        let handle = runner.stop_handle();
        let stopper = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(100));
            handle.stop();
        });

        let err = runner
            .attach(Hang {
                shut: Arc::clone(&shut),
            })
            .unwrap_err();
        stopper.join().unwrap();

        assert!(matches!(err, EimError::InvalidState(_)));
        assert_eq!(runner.state(), RunnerState::Stopped);
        assert!(shut.load(Ordering::SeqCst));
        assert!(runner.model_info().is_none());
        assert!(runner.shared.session.lock().is_none());
        assert!(runner.shared.closer.lock().is_none());
    }
}
