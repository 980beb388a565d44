//! Delegate contract through which readiness notifications reach application code.

use std::sync::Arc;

use thiserror::Error;

use crate::socket::Socket;

/// Receives readiness callbacks for a single socket.
///
/// Callbacks run on the monitor thread, so implementations must be safe to
/// invoke concurrently with the owning application thread. The socket is
/// passed back so a delegate can re-arm a direction from within the callback;
/// re-arming never deadlocks because dispatch happens outside the monitor
/// lock. A delegate must not block the monitor thread for long and must not
/// drop the last strong reference to a monitored socket from inside a
/// callback.
///
/// Read and write readiness are one-shot: once reported, the direction stays
/// disarmed until the delegate calls [`Socket::monitor_read`] or
/// [`Socket::monitor_write`] again.
pub trait SocketDelegate: Send + Sync {
    fn on_read_ready(&self, socket: &Arc<Socket>) -> Result<(), NotifyError> {
        let _ = socket;
        Ok(())
    }

    fn on_write_ready(&self, socket: &Arc<Socket>) -> Result<(), NotifyError> {
        let _ = socket;
        Ok(())
    }

    fn on_exception(&self, socket: &Arc<Socket>) -> Result<(), NotifyError> {
        let _ = socket;
        Ok(())
    }
}

/// Failure raised by a notification attempt.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyError {
    /// The delegate no longer exists. The affected socket is quietly
    /// deregistered; other sockets in the same dispatch batch are unaffected.
    #[error("the delegate is gone")]
    DelegateGone,
    /// The queue the delegate dispatches into is gone. The owning monitor
    /// shuts down in an orderly fashion.
    #[error("the delegate message queue is gone")]
    QueueGone,
}
