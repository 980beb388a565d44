//! Platform wait primitive, wakeup channel and thread priority plumbing.
//!
//! Both backends expose the same surface: a `SysHandle` alias for the native
//! socket identifier, a `PollEntry` carrying (handle, desired mask, fired
//! mask), a `Waiter` that blocks until readiness changes or a timeout elapses,
//! and a `Wakeup` channel whose sole purpose is to interrupt an in-flight
//! wait. POSIX maps onto `poll(2)` with a loopback UDP pair as the wakeup;
//! Windows maps onto `WSAEventSelect`/`WSAWaitForMultipleEvents` with a
//! manual-reset event object.

#[cfg(unix)]
mod unix;
#[cfg(unix)]
pub(crate) use unix::*;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub(crate) use windows::*;
