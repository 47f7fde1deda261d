//! Sliding window over streamed sensor samples.

use std::collections::VecDeque;

use super::error::EimError;
use super::model_info::ModelInfo;

/// Fraction of a window the stream advances between classifications.
pub const WINDOW_ADVANCE: f32 = 0.25;

/// Buffers samples and hands out overlapping windows of a fixed size.
#[derive(Debug, Clone)]
pub struct SlidingWindow {
    size: usize,
    step: usize,
    samples: VecDeque<f32>,
}

impl SlidingWindow {
    pub fn new(size: usize) -> Result<Self, EimError> {
        if size == 0 {
            return Err(EimError::InvalidInput(
                "window size must be positive".to_string(),
            ));
        }
        let step = ((size as f32 * WINDOW_ADVANCE) as usize).max(1);
        Ok(Self {
            size,
            step,
            samples: VecDeque::with_capacity(size * 2),
        })
    }

    /// Window sized to the model's `input_features_count`.
    pub fn for_model(info: &ModelInfo) -> Result<Self, EimError> {
        info.ensure_audio()?;
        Self::new(info.input_features_count())
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Samples dropped from the front after each window.
    pub fn step(&self) -> usize {
        self.step
    }

    pub fn buffered(&self) -> usize {
        self.samples.len()
    }

    pub fn push(&mut self, samples: &[f32]) {
        self.samples.extend(samples);
    }

    /// Push raw 16-bit PCM, kept at its integer scale.
    pub fn push_pcm16(&mut self, samples: &[i16]) {
        self.samples.extend(samples.iter().map(|&s| f32::from(s)));
    }

    /// Next full window, if enough samples are buffered.
    pub fn next_window(&mut self) -> Option<Vec<f32>> {
        if self.samples.len() < self.size {
            return None;
        }
        let window: Vec<f32> = self.samples.range(..self.size).copied().collect();
        self.samples.drain(..self.step);
        Some(window)
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}
