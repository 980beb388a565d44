//! Capacity-aware router of monitoring requests across monitor instances.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use log::debug;

use crate::config::MonitorConfig;
use crate::error::Error;
use crate::monitor::{MonitorId, SocketMonitor};

struct Slot {
    monitor: Arc<SocketMonitor>,
    count: usize,
}

/// Routes each monitoring request to the least-loaded existing
/// [`SocketMonitor`] with spare capacity, creating a new instance when none
/// qualifies. Capacity is the platform wait-set limit minus the wakeup slot,
/// so no monitor ever exceeds what one wait call can carry.
///
/// One instance serves the whole process: construct it once at startup and
/// hand it to every [`Socket`](crate::socket::Socket) that needs monitoring.
pub struct SocketMonitorLoadBalancer {
    config: MonitorConfig,
    slots: Mutex<Vec<Slot>>,
    next_id: AtomicUsize,
}

impl SocketMonitorLoadBalancer {
    pub fn new(config: MonitorConfig) -> Arc<SocketMonitorLoadBalancer> {
        Arc::new(SocketMonitorLoadBalancer {
            config,
            slots: Mutex::new(Vec::new()),
            next_id: AtomicUsize::new(0),
        })
    }

    /// Attaches one socket's worth of capacity and returns the monitor to
    /// register with. Ties in load are broken by scan order; counts are
    /// coarse capacity guards, not fine load metrics.
    pub fn link(self: &Arc<Self>) -> Result<Arc<SocketMonitor>, Error> {
        let mut slots = self.slots.lock().unwrap();

        let mut best: Option<(usize, usize)> = None;
        for (at, slot) in slots.iter().enumerate() {
            if slot.count < self.config.max_sockets_per_monitor
                && best.is_none_or(|(_, count)| slot.count < count)
            {
                best = Some((at, slot.count));
            }
        }
        if let Some((at, _)) = best {
            slots[at].count += 1;
            return Ok(Arc::clone(&slots[at].monitor));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let monitor = SocketMonitor::new(id, self.config.clone(), Arc::downgrade(self))?;
        debug!("load balancer: created monitor {id}");
        slots.push(Slot {
            monitor: Arc::clone(&monitor),
            count: 1,
        });
        Ok(monitor)
    }

    /// Releases one socket's worth of capacity from the named monitor. A
    /// monitor whose count reaches zero is removed from the registry and shut
    /// down outside the registry lock, so other callers never block on a
    /// thread join.
    pub(crate) fn unlink(&self, id: MonitorId) {
        let retired = {
            let mut slots = self.slots.lock().unwrap();
            let Some(at) = slots.iter().position(|slot| slot.monitor.id() == id) else {
                return;
            };
            debug_assert!(slots[at].count > 0, "unlink of an unlinked monitor {id}");
            slots[at].count = slots[at].count.saturating_sub(1);
            if slots[at].count == 0 {
                Some(slots.remove(at).monitor)
            } else {
                None
            }
        };
        if let Some(monitor) = retired {
            debug!("load balancer: retiring monitor {id}");
            monitor.cancel();
        }
    }

    pub fn monitor_count(&self) -> usize {
        self.slots.lock().unwrap().len()
    }

    /// Attached-socket count per monitor, in registry order.
    pub fn loads(&self) -> Vec<usize> {
        self.slots.lock().unwrap().iter().map(|slot| slot.count).collect()
    }

    /// Process teardown hook: cancels every remaining monitor.
    pub fn shutdown(&self) {
        let drained: Vec<Arc<SocketMonitor>> = {
            let mut slots = self.slots.lock().unwrap();
            slots.drain(..).map(|slot| slot.monitor).collect()
        };
        for monitor in drained {
            monitor.cancel();
        }
    }
}

impl Drop for SocketMonitorLoadBalancer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
