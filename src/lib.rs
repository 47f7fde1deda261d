//! Drive pre-built inference runner executables from Rust.
//!
//! See [`runner`] for the architecture; the common types are re-exported
//! here.

pub mod runner;

pub use runner::{
    ClassifyResponse, EimError, ImpulseRunner, ModelInfo, RunnerConfig, RunnerState,
    SlidingWindow, StopHandle, ThresholdUpdate,
};
