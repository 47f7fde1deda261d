//! Client for pre-built inference runner executables.
//!
//! A runner is a self-contained program that loads one model and serves it
//! over a local stream socket. This module:
//! - Spawns the runner with a private socket path and waits for it
//! - Performs the `hello` handshake and exposes the model metadata
//! - Sends feature vectors inline, or through shared memory when offered
//! - Tears everything down on `stop()`, drop, or an interrupt
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────┐   spawn(argv[1] = socket)  ┌──────────────┐
//! │ ImpulseRunner            │ ─────────────────────────▶ │ runner exe   │
//! │  ├─ RunnerProcess        │                            │              │
//! │  ├─ Session              │ ◀──── JSON over UDS ─────▶ │  socket      │
//! │  │   └─ SharedFeature-   │                            │              │
//! │  │      Buffer (mmap) ───┼──── /dev/shm/<name> ─────▶ │  shm segment │
//! │  └─ StopHandle           │                            └──────────────┘
//! └──────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use eim_runner::runner::{ImpulseRunner, signal::stop_on_ctrl_c};
//!
//! let runner = ImpulseRunner::new("./model.eim");
//! tokio::spawn(stop_on_ctrl_c(runner.stop_handle()));
//! let info = runner.init()?;
//! let result = runner.classify(&vec![0.0; info.input_features_count()])?;
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod model_info;
pub mod process;
pub mod protocol;
pub mod shm;
pub mod signal;
pub mod transport;
pub mod window;

pub use client::{ImpulseRunner, RunnerState, StopHandle};
pub use config::RunnerConfig;
pub use error::EimError;
pub use model_info::{ModelInfo, ModelParameters, ProjectInfo, ShmDescriptor, ShmElementType};
pub use protocol::{ClassifyResponse, Payload, ThresholdUpdate};
pub use transport::{RunnerTransport, ShutdownHandle};
pub use window::SlidingWindow;
