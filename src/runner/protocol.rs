//! Wire protocol spoken with the runner executable.
//!
//! Requests are single JSON objects carrying a numeric `id`. Responses echo
//! that id plus a `success` flag. Two framings are in use:
//!
//! - **Brace-balanced** (socket-only mode): a response ends the moment the
//!   outermost `{` is closed. Bytes before the opening brace are ignored.
//! - **Terminated** (shared-memory mode): a response ends with a single
//!   trailing zero byte.

use std::collections::BTreeMap;
use std::io::Read;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::error::EimError;

/// Upper bound on a single response frame.
pub const MAX_FRAME_BYTES: usize = 100 * 1024 * 1024;

const READ_CHUNK: usize = 64 * 1024;

/// Response fields with bookkeeping (`id`, `success`) removed.
pub type Payload = Map<String, Value>;

/// How response frames are delimited on the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    BraceBalanced,
    Terminated,
}

/// Request bodies understood by the runner.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Request<'a> {
    /// Handshake; the value is always `1`.
    Hello(u32),
    /// Feature vector sent inline.
    Classify(&'a [f32]),
    /// Feature vector already written to the shared segment.
    ClassifyShm { elements: usize },
    /// Threshold override; the object must carry the target `id`.
    SetThreshold(&'a Map<String, Value>),
}

impl Request<'_> {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Hello(_) => "hello",
            Self::Classify(_) => "classify",
            Self::ClassifyShm { .. } => "classify_shm",
            Self::SetThreshold(_) => "set_threshold",
        }
    }
}

#[derive(Serialize)]
struct Envelope<'a, 'b> {
    #[serde(flatten)]
    request: &'b Request<'a>,
    id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    debug: Option<bool>,
}

/// Encode a request with its sequence id.
pub fn encode_request(request: &Request<'_>, id: u64, debug: Option<bool>) -> Result<Vec<u8>, EimError> {
    let envelope = Envelope { request, id, debug };
    serde_json::to_vec(&envelope)
        .map_err(|e| EimError::InvalidInput(format!("failed to encode {}: {e}", request.kind())))
}

/// Incremental scanner for brace-balanced frames.
///
/// Tracks string and escape state so braces inside JSON strings do not
/// affect the nesting depth.
#[derive(Debug, Default)]
pub struct BraceScanner {
    depth: usize,
    in_string: bool,
    escaped: bool,
    frame: Vec<u8>,
}

impl BraceScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes. Returns how many bytes of `bytes` were consumed once the
    /// frame is complete, `None` if more input is needed.
    pub fn feed(&mut self, bytes: &[u8]) -> Option<usize> {
        for (i, &b) in bytes.iter().enumerate() {
            if self.depth == 0 {
                if b == b'{' {
                    self.depth = 1;
                    self.frame.push(b);
                }
                continue;
            }

            self.frame.push(b);

            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if b == b'\\' {
                    self.escaped = true;
                } else if b == b'"' {
                    self.in_string = false;
                }
                continue;
            }

            match b {
                b'"' => self.in_string = true,
                b'{' => self.depth += 1,
                b'}' => {
                    self.depth -= 1;
                    if self.depth == 0 {
                        return Some(i + 1);
                    }
                }
                _ => {}
            }
        }
        None
    }

    /// Bytes collected for the current frame so far.
    pub fn buffered(&self) -> usize {
        self.frame.len()
    }

    /// Take the collected frame and reset the scanner.
    pub fn take_frame(&mut self) -> Vec<u8> {
        self.depth = 0;
        self.in_string = false;
        self.escaped = false;
        std::mem::take(&mut self.frame)
    }
}

/// Read one complete response frame.
pub fn read_frame<R: Read + ?Sized>(reader: &mut R, framing: Framing) -> Result<Vec<u8>, EimError> {
    match framing {
        Framing::BraceBalanced => read_brace_frame(reader),
        Framing::Terminated => read_terminated_frame(reader),
    }
}

fn read_brace_frame<R: Read + ?Sized>(reader: &mut R) -> Result<Vec<u8>, EimError> {
    let mut scanner = BraceScanner::new();
    let mut chunk = vec![0u8; READ_CHUNK];

    loop {
        let n = read_chunk(reader, &mut chunk)?;
        if let Some(used) = scanner.feed(&chunk[..n]) {
            if used < n {
                tracing::debug!(
                    trailing = n - used,
                    "Discarding bytes after end of response frame"
                );
            }
            return Ok(scanner.take_frame());
        }
        if scanner.buffered() > MAX_FRAME_BYTES {
            return Err(too_large(scanner.buffered()));
        }
    }
}

fn read_terminated_frame<R: Read + ?Sized>(reader: &mut R) -> Result<Vec<u8>, EimError> {
    let mut frame = Vec::new();
    let mut chunk = vec![0u8; READ_CHUNK];

    loop {
        let n = read_chunk(reader, &mut chunk)?;
        frame.extend_from_slice(&chunk[..n]);
        if chunk[n - 1] == 0 {
            frame.pop();
            // A terminator left over from an earlier frame may lead the buffer.
            let start = frame.iter().position(|&b| b != 0).unwrap_or(frame.len());
            frame.drain(..start);
            return Ok(frame);
        }
        if frame.len() > MAX_FRAME_BYTES {
            return Err(too_large(frame.len()));
        }
    }
}

/// Read at least one byte; EOF before a frame completes is a closed connection.
fn read_chunk<R: Read + ?Sized>(reader: &mut R, chunk: &mut [u8]) -> Result<usize, EimError> {
    loop {
        match reader.read(chunk) {
            Ok(0) => return Err(EimError::ConnectionClosed),
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(EimError::from_transport(e, "runner response")),
        }
    }
}

fn too_large(len: usize) -> EimError {
    EimError::Protocol(format!("response too large: {len} bytes"))
}

/// Decode a frame, check it answers request `expected_id`, and strip the
/// bookkeeping fields.
pub fn decode_response(frame: &[u8], expected_id: u64) -> Result<Payload, EimError> {
    let value: Value = serde_json::from_slice(frame)
        .map_err(|e| EimError::Protocol(format!("malformed response: {e}")))?;

    let Value::Object(mut resp) = value else {
        return Err(EimError::Protocol("response is not a JSON object".to_string()));
    };

    match resp.get("id").and_then(Value::as_u64) {
        Some(id) if id == expected_id => {}
        Some(id) => {
            return Err(EimError::Protocol(format!(
                "unexpected id: expected {expected_id} but got {id}"
            )));
        }
        None => {
            return Err(EimError::Protocol(format!(
                "unexpected id: expected {expected_id} but response has none"
            )));
        }
    }

    let success = resp
        .get("success")
        .and_then(Value::as_bool)
        .ok_or_else(|| EimError::Protocol("response is missing the success flag".to_string()))?;

    if !success {
        let message = match resp.remove("error") {
            Some(Value::String(s)) => s,
            Some(other) => other.to_string(),
            None => "runner reported failure without an error message".to_string(),
        };
        return Err(EimError::Runner(message));
    }

    resp.remove("id");
    resp.remove("success");
    Ok(resp)
}

/// Per-stage timings reported by the runner, in the runner's units.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timing {
    pub dsp: i64,
    pub classification: i64,
    pub anomaly: i64,
}

/// One detected object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoundingBox {
    pub label: String,
    pub value: f64,
    pub x: i64,
    pub y: i64,
    pub width: i64,
    pub height: i64,
}

/// The `result` object of a classify response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InferenceResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classification: Option<BTreeMap<String, f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounding_boxes: Option<Vec<BoundingBox>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anomaly: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Typed view over a classify payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClassifyResponse {
    #[serde(default)]
    pub result: InferenceResult,
    #[serde(default)]
    pub timing: Timing,
}

impl ClassifyResponse {
    pub fn from_payload(payload: &Payload) -> Result<Self, EimError> {
        serde_json::from_value(Value::Object(payload.clone()))
            .map_err(|e| EimError::Protocol(format!("unexpected classify payload: {e}")))
    }

    /// Label with the highest score, if the model is a classifier.
    pub fn top_label(&self) -> Option<(&str, f64)> {
        self.result
            .classification
            .as_ref()?
            .iter()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(label, score)| (label.as_str(), *score))
    }
}

/// Body of a `set_threshold` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdUpdate {
    /// Threshold id as listed in `model_parameters.thresholds`.
    pub id: i64,
    #[serde(flatten)]
    pub values: Map<String, Value>,
}

impl ThresholdUpdate {
    pub fn new(id: i64) -> Self {
        Self {
            id,
            values: Map::new(),
        }
    }

    pub fn min_score(id: i64, min_score: f64) -> Self {
        Self::new(id).with("min_score", Value::from(min_score))
    }

    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        self.values.insert(key.into(), value);
        self
    }
}

impl From<ThresholdUpdate> for Value {
    fn from(update: ThresholdUpdate) -> Self {
        let mut obj = Map::new();
        obj.insert("id".to_string(), Value::from(update.id));
        obj.extend(update.values);
        Value::Object(obj)
    }
}
