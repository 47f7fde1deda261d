//! Model metadata returned by the `hello` handshake.
//!
//! The raw payload is relayed unchanged; typed accessors cover the fields
//! that sensor front-ends need (labels, input size, sampling rate).

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use super::error::EimError;
use super::protocol::Payload;

/// Element type of a shared feature segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShmElementType {
    Float32,
    Float64,
}

impl ShmElementType {
    pub fn size_bytes(self) -> usize {
        match self {
            Self::Float32 => 4,
            Self::Float64 => 8,
        }
    }
}

/// Shared-memory segment advertised by the runner (`features_shm`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShmDescriptor {
    pub name: String,
    #[serde(rename = "type")]
    pub element_type: ShmElementType,
    pub elements: usize,
}

/// Fall back to the default when a field has an unexpected type. The raw
/// payload still carries the value as sent.
fn lenient<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + Default,
{
    let value = Value::deserialize(deserializer)?;
    Ok(T::deserialize(value).unwrap_or_default())
}

/// Project the model was exported from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectInfo {
    #[serde(default, deserialize_with = "lenient")]
    pub id: i64,
    #[serde(default, deserialize_with = "lenient")]
    pub owner: String,
    #[serde(default, deserialize_with = "lenient")]
    pub name: String,
    #[serde(default, deserialize_with = "lenient")]
    pub deploy_version: i64,
}

/// `model_parameters` section of the handshake.
///
/// A typed view only: fields with an unexpected type read as their default.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelParameters {
    #[serde(default, deserialize_with = "lenient")]
    pub sensor: i64,
    #[serde(default, deserialize_with = "lenient")]
    pub frequency: f64,
    #[serde(default, deserialize_with = "lenient")]
    pub input_features_count: usize,
    #[serde(default, deserialize_with = "lenient")]
    pub interval_ms: f64,
    #[serde(default, deserialize_with = "lenient")]
    pub axis_count: usize,
    #[serde(default, deserialize_with = "lenient")]
    pub image_input_width: u32,
    #[serde(default, deserialize_with = "lenient")]
    pub image_input_height: u32,
    #[serde(default, deserialize_with = "lenient")]
    pub image_channel_count: u32,
    #[serde(default, deserialize_with = "lenient")]
    pub label_count: usize,
    #[serde(default, deserialize_with = "lenient")]
    pub labels: Vec<String>,
    #[serde(default)]
    pub has_anomaly: Value,
    #[serde(default, deserialize_with = "lenient")]
    pub model_type: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub thresholds: Vec<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Decoded handshake response.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelInfo {
    raw: Payload,
    parameters: ModelParameters,
    project: Option<ProjectInfo>,
    features_shm: Option<ShmDescriptor>,
}

impl ModelInfo {
    /// Build from a handshake payload (bookkeeping fields already stripped).
    pub fn from_payload(raw: Payload) -> Result<Self, EimError> {
        let parameters = match raw.get("model_parameters") {
            Some(v) => serde_json::from_value(v.clone()).unwrap_or_else(|e| {
                warn!(error = %e, "Ignoring malformed model_parameters in handshake");
                ModelParameters::default()
            }),
            None => ModelParameters::default(),
        };

        let project = match raw.get("project") {
            None | Some(Value::Null) => None,
            Some(v) => serde_json::from_value(v.clone())
                .inspect_err(|e| warn!(error = %e, "Ignoring malformed project in handshake"))
                .ok(),
        };

        let features_shm = match raw.get("features_shm") {
            None | Some(Value::Null) => None,
            Some(v) => Some(serde_json::from_value(v.clone()).map_err(|e| {
                EimError::Protocol(format!("invalid features_shm in handshake: {e}"))
            })?),
        };

        Ok(Self {
            raw,
            parameters,
            project,
            features_shm,
        })
    }

    /// The handshake payload as received.
    pub fn raw(&self) -> &Payload {
        &self.raw
    }

    pub fn parameters(&self) -> &ModelParameters {
        &self.parameters
    }

    pub fn project(&self) -> Option<&ProjectInfo> {
        self.project.as_ref()
    }

    pub fn features_shm(&self) -> Option<&ShmDescriptor> {
        self.features_shm.as_ref()
    }

    pub fn labels(&self) -> &[String] {
        &self.parameters.labels
    }

    /// Sampling frequency in Hz; 0 for non time-series models.
    pub fn sampling_frequency(&self) -> f64 {
        self.parameters.frequency
    }

    pub fn input_features_count(&self) -> usize {
        self.parameters.input_features_count
    }

    /// `(width, height)` of the image input.
    pub fn image_dimensions(&self) -> (u32, u32) {
        (
            self.parameters.image_input_width,
            self.parameters.image_input_height,
        )
    }

    pub fn image_channel_count(&self) -> u32 {
        self.parameters.image_channel_count
    }

    pub fn is_grayscale(&self) -> bool {
        self.parameters.image_channel_count == 1
    }

    /// Configurable thresholds, each carrying at least an `id`.
    pub fn thresholds(&self) -> &[Value] {
        &self.parameters.thresholds
    }

    /// Fails unless the model consumes a sampled time series.
    pub fn ensure_audio(&self) -> Result<(), EimError> {
        if self.parameters.frequency == 0.0 {
            return Err(EimError::UnsuitableModel(
                "model is not suitable for audio recognition (frequency is 0)".to_string(),
            ));
        }
        Ok(())
    }

    /// Fails unless the model consumes images.
    pub fn ensure_image(&self) -> Result<(), EimError> {
        let (width, height) = self.image_dimensions();
        if width == 0 || height == 0 {
            return Err(EimError::UnsuitableModel(
                "model is not suitable for image recognition (input size is 0)".to_string(),
            ));
        }
        Ok(())
    }
}
