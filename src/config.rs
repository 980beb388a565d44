//! Monitor configuration and the string keyed settings surface.

use std::str::FromStr;
use std::time::Duration;

use log::warn;
use thiserror::Error;

use crate::sys;

/// Settings key consulted for the monitor thread priority.
pub const THREAD_PRIORITY_KEY: &str = "socket monitor thread priority";

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_WAKEUP_RETRY_LIMIT: u32 = 8;

/// OS priority applied to a monitor thread when it starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThreadPriority {
    Lowest,
    Low,
    #[default]
    Normal,
    High,
    Highest,
}

#[derive(Error, Debug)]
#[error("unknown thread priority: {0}")]
pub struct UnknownThreadPriority(String);

impl FromStr for ThreadPriority {
    type Err = UnknownThreadPriority;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "lowest" => Ok(ThreadPriority::Lowest),
            "low" => Ok(ThreadPriority::Low),
            "normal" => Ok(ThreadPriority::Normal),
            "high" => Ok(ThreadPriority::High),
            "highest" => Ok(ThreadPriority::Highest),
            other => Err(UnknownThreadPriority(other.to_owned())),
        }
    }
}

/// Tuning knobs shared by every monitor a load balancer creates.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Priority applied to each monitor thread at startup.
    pub thread_priority: ThreadPriority,
    /// Upper bound on one blocking wait, so a lost wakeup signal cannot stall
    /// shutdown indefinitely.
    pub poll_interval: Duration,
    /// Sockets one monitor may hold: the platform wait set capacity minus the
    /// slot reserved for the wakeup channel.
    pub max_sockets_per_monitor: usize,
    /// Attempts at establishing a wakeup channel before giving up.
    pub wakeup_retry_limit: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            thread_priority: ThreadPriority::Normal,
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_sockets_per_monitor: sys::MAX_WAIT_HANDLES - 1,
            wakeup_retry_limit: DEFAULT_WAKEUP_RETRY_LIMIT,
        }
    }
}

impl MonitorConfig {
    /// Builds a config from a settings lookup. Only the thread priority is
    /// read from settings; a missing key falls back to `normal` and an
    /// unparsable value is logged and ignored.
    pub fn from_settings<F>(lookup: F) -> MonitorConfig
    where
        F: Fn(&str) -> Option<String>,
    {
        let thread_priority = match lookup(THREAD_PRIORITY_KEY) {
            Some(value) => match value.parse() {
                Ok(priority) => priority,
                Err(err) => {
                    warn!("{err}, falling back to normal");
                    ThreadPriority::Normal
                }
            },
            None => ThreadPriority::Normal,
        };
        MonitorConfig {
            thread_priority,
            ..MonitorConfig::default()
        }
    }
}
