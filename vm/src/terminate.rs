use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::signal::{SignalKind, Signaller};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TerminateError {
    #[error("failed to kill process {pid}")]
    Failed { pid: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Exited within the grace period after SIGTERM.
    Graceful,
    /// SIGTERM could not be delivered and the liveness check found nothing left to stop.
    AlreadyExited,
    /// Needed SIGKILL.
    Forced,
}

/// SIGTERM, then after `grace` a liveness check, then SIGKILL if still alive.
///
/// When SIGTERM cannot be delivered the grace period is skipped and the liveness check
/// runs straight away.
pub async fn terminate<G: Signaller + ?Sized>(
    signaller: &G,
    pid: u32,
    elevated: bool,
    grace: Duration,
) -> Result<Termination, TerminateError> {
    let delivered = signaller.send(pid, SignalKind::Terminate, elevated).await;
    if delivered {
        debug!("Sent SIGTERM to {pid}, waiting {grace:?}");
        tokio::time::sleep(grace).await;
    } else {
        debug!("SIGTERM to {pid} was not delivered");
    }

    if !signaller.is_alive(pid).await {
        return Ok(if delivered {
            Termination::Graceful
        } else {
            Termination::AlreadyExited
        });
    }

    warn!("Process {pid} still alive, sending SIGKILL");
    if signaller.send(pid, SignalKind::Kill, elevated).await {
        Ok(Termination::Forced)
    } else {
        Err(TerminateError::Failed { pid })
    }
}
