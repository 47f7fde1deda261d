//! Interrupt-driven shutdown.
//!
//! Whoever owns an [`ImpulseRunner`](super::ImpulseRunner) passes a
//! [`StopHandle`] to one of these futures; there is no process-wide
//! "current runner".

use std::future::Future;
use std::io;

use tracing::{info, warn};

use super::client::StopHandle;

/// Wait for `trigger`, then stop the runner behind `handle`.
///
/// Teardown blocks while the child is reaped, so it runs on the blocking
/// pool instead of the async worker.
pub async fn stop_when<F: Future>(handle: StopHandle, trigger: F) -> F::Output {
    let output = trigger.await;
    if let Err(e) = tokio::task::spawn_blocking(move || handle.stop()).await {
        warn!(error = %e, "Runner stop task failed");
    }
    output
}

/// Stop the runner on the first Ctrl-C.
pub async fn stop_on_ctrl_c(handle: StopHandle) -> io::Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("Interrupt received, stopping runner");
    stop_when(handle, std::future::ready(())).await;
    Ok(())
}
