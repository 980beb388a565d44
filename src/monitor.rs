//! Single-threaded wait/dispatch engine behind each monitor instance.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;
use std::thread::JoinHandle;

use log::{debug, warn};
use smallvec::SmallVec;

use crate::balancer::SocketMonitorLoadBalancer;
use crate::config::MonitorConfig;
use crate::delegate::NotifyError;
use crate::error::Error;
use crate::events::EventMask;
use crate::set::SocketSet;
use crate::socket::Socket;
use crate::sys::{self, PollEntry, SysHandle, Waiter, Wakeup};

pub type MonitorId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Created,
    Running,
    ShuttingDown,
    Joined,
}

/// One-shot event a registering thread blocks on until the monitor thread has
/// rebuilt its polling snapshot. The handshake is what makes handle reuse
/// safe: once it completes, no stale snapshot can reference the handle.
struct RebuildWaiter {
    done: Mutex<bool>,
    cv: Condvar,
}

impl RebuildWaiter {
    fn new() -> RebuildWaiter {
        RebuildWaiter {
            done: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    fn signal(&self) {
        *self.done.lock().unwrap() = true;
        self.cv.notify_all();
    }

    fn wait(&self) {
        let mut done = self.done.lock().unwrap();
        while !*done {
            done = self.cv.wait(done).unwrap();
        }
    }
}

struct MonitorState {
    set: SocketSet,
    sockets: HashMap<SysHandle, Weak<Socket>>,
    waiters: Vec<Arc<RebuildWaiter>>,
    lifecycle: Lifecycle,
}

/// Watches a set of non-blocking sockets for readiness on one dedicated
/// thread and dispatches notifications to their delegates.
///
/// Instances are created and retired by [`SocketMonitorLoadBalancer`]; the
/// thread starts lazily on the first [`SocketMonitor::begin`] and runs until
/// [`SocketMonitor::cancel`]. All registration changes are linearized through
/// the monitor lock and acknowledged with a rebuild handshake, while delegate
/// dispatch happens strictly outside the lock so callbacks may re-arm without
/// deadlocking.
pub struct SocketMonitor {
    id: MonitorId,
    config: MonitorConfig,
    state: Mutex<MonitorState>,
    wakeup: Wakeup,
    shutdown: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
    balancer: Weak<SocketMonitorLoadBalancer>,
}

impl SocketMonitor {
    pub(crate) fn new(
        id: MonitorId,
        config: MonitorConfig,
        balancer: Weak<SocketMonitorLoadBalancer>,
    ) -> Result<Arc<SocketMonitor>, Error> {
        let wakeup = Wakeup::new(config.wakeup_retry_limit)?;
        let mut set = SocketSet::new();
        set.append_entry(wakeup.entry());
        Ok(Arc::new(SocketMonitor {
            id,
            config,
            state: Mutex::new(MonitorState {
                set,
                sockets: HashMap::new(),
                waiters: Vec::new(),
                lifecycle: Lifecycle::Created,
            }),
            wakeup,
            shutdown: AtomicBool::new(false),
            thread: Mutex::new(None),
            balancer,
        }))
    }

    pub fn id(&self) -> MonitorId {
        self.id
    }

    /// Number of sockets currently attached to this monitor.
    pub fn monitored_count(&self) -> usize {
        self.state.lock().unwrap().sockets.len()
    }

    /// Registers `socket` for the given directions, starting the dispatch
    /// thread if this is the first registration. Returns once the monitor
    /// thread has produced a snapshot that includes the change, so the next
    /// wait cycle is guaranteed to observe it.
    pub fn begin(
        self: &Arc<Self>,
        socket: &Arc<Socket>,
        read: bool,
        write: bool,
        exception: bool,
    ) -> Result<(), Error> {
        let mask = EventMask::from_flags(read, write, exception);
        let on_monitor_thread = self.on_monitor_thread();
        let waiter = {
            let mut state = self.state.lock().unwrap();
            match state.lifecycle {
                Lifecycle::ShuttingDown | Lifecycle::Joined => return Err(Error::ShuttingDown),
                Lifecycle::Created => self.start_thread(&mut state)?,
                Lifecycle::Running => {}
            }
            state.sockets.insert(socket.handle(), Arc::downgrade(socket));
            state.set.reset_mask(socket.handle(), mask)?;
            if on_monitor_thread {
                // the loop rebuilds before its next wait anyway
                None
            } else {
                Some(Self::enqueue_waiter(&mut state))
            }
        };
        if let Some(waiter) = waiter {
            self.signal_wakeup();
            waiter.wait();
        }
        Ok(())
    }

    /// Deregisters `socket` with the same rebuild handshake, then releases
    /// this monitor's share in the load balancer.
    pub fn end(&self, socket: &Socket) -> Result<(), Error> {
        let on_monitor_thread = self.on_monitor_thread();
        let waiter = {
            let mut state = self.state.lock().unwrap();
            state.sockets.remove(&socket.handle());
            state.set.reset(socket.handle());
            if state.lifecycle == Lifecycle::Running && !on_monitor_thread {
                Some(Self::enqueue_waiter(&mut state))
            } else {
                None
            }
        };
        if let Some(waiter) = waiter {
            self.signal_wakeup();
            waiter.wait();
        }
        if let Some(balancer) = self.balancer.upgrade() {
            balancer.unlink(self.id);
        }
        Ok(())
    }

    /// Re-arms read readiness after a one-shot fire.
    pub fn monitor_read(&self, socket: &Socket) -> Result<(), Error> {
        self.re_arm(socket, EventMask::READABLE)
    }

    /// Re-arms write readiness after a one-shot fire.
    pub fn monitor_write(&self, socket: &Socket) -> Result<(), Error> {
        self.re_arm(socket, EventMask::WRITABLE)
    }

    /// Re-arms exception interest after an exception fire deregistered the
    /// handle.
    pub fn monitor_exception(&self, socket: &Socket) -> Result<(), Error> {
        self.re_arm(socket, EventMask::EXCEPTION)
    }

    fn re_arm(&self, socket: &Socket, mask: EventMask) -> Result<(), Error> {
        let became_dirty = {
            let mut state = self.state.lock().unwrap();
            if matches!(state.lifecycle, Lifecycle::ShuttingDown | Lifecycle::Joined) {
                return Err(Error::ShuttingDown);
            }
            assert!(
                state.sockets.contains_key(&socket.handle()),
                "socket {:?} is not monitored",
                socket.handle()
            );
            state.set.add_events(socket.handle(), mask)?
        };
        if became_dirty {
            self.signal_wakeup();
        }
        Ok(())
    }

    /// Idempotent, callable from any thread. Requests an orderly shutdown of
    /// the dispatch loop and joins the thread unless invoked from the
    /// dispatch thread itself.
    pub fn cancel(&self) {
        self.shutdown.store(true, Ordering::Release);
        {
            let mut state = self.state.lock().unwrap();
            match state.lifecycle {
                // the thread never started, nothing will drain waiters
                Lifecycle::Created => state.lifecycle = Lifecycle::Joined,
                Lifecycle::Running => state.lifecycle = Lifecycle::ShuttingDown,
                Lifecycle::ShuttingDown | Lifecycle::Joined => {}
            }
        }
        self.signal_wakeup();
        let handle = self.thread.lock().unwrap().take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                // self-cancel from a delegate callback, the loop exits on its own
                return;
            }
            let _ = handle.join();
        }
    }

    pub fn shutdown(&self) {
        self.cancel();
    }

    fn on_monitor_thread(&self) -> bool {
        self.thread
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|handle| handle.thread().id() == thread::current().id())
    }

    fn enqueue_waiter(state: &mut MonitorState) -> Arc<RebuildWaiter> {
        let waiter = Arc::new(RebuildWaiter::new());
        state.waiters.push(Arc::clone(&waiter));
        waiter
    }

    fn signal_wakeup(&self) {
        if let Err(err) = self.wakeup.signal() {
            // the bounded poll interval still guarantees progress
            warn!("monitor {}: wakeup signal failed: {err}", self.id);
        }
    }

    fn start_thread(self: &Arc<Self>, state: &mut MonitorState) -> Result<(), Error> {
        // the thread keeps its own strong reference so it can safely outlive
        // the last external owner during its shutdown sequence
        let monitor = Arc::clone(self);
        let handle = thread::Builder::new()
            .name(format!("socket-monitor-{}", self.id))
            .spawn(move || monitor.run())?;
        *self.thread.lock().unwrap() = Some(handle);
        state.lifecycle = Lifecycle::Running;
        Ok(())
    }

    /// Dispatch loop, runs on the dedicated monitor thread.
    fn run(self: Arc<Self>) {
        sys::set_thread_priority(self.config.thread_priority);
        debug!("monitor {}: thread started", self.id);

        let mut waiter = Waiter::new();
        let mut polling: Vec<PollEntry> = Vec::new();

        loop {
            // refresh the snapshot, then release registration callers; by the
            // time they resume, no stale snapshot references their handle
            {
                let mut state = self.state.lock().unwrap();
                state.set.prepare_polling(&mut polling);
                for pending in state.waiters.drain(..) {
                    pending.signal();
                }
            }
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }

            let fired_count = match waiter.wait(&mut polling, self.config.poll_interval) {
                Ok(n) => n,
                Err(err) => {
                    // anything but a timeout is absorbed as an empty cycle
                    warn!("monitor {}: wait failed: {err}", self.id);
                    0
                }
            };
            if fired_count == 0 {
                continue;
            }

            let fired_events = self.resolve_fired(&polling);
            if fired_events.is_empty() {
                continue;
            }

            // delegate dispatch happens strictly outside the lock
            let mut gone: SmallVec<[SysHandle; 4]> = SmallVec::new();
            let mut queue_gone = false;
            for (socket, fired) in &fired_events {
                match Self::dispatch(socket, *fired) {
                    Ok(()) => {}
                    Err(NotifyError::DelegateGone) => gone.push(socket.handle()),
                    Err(NotifyError::QueueGone) => {
                        queue_gone = true;
                        break;
                    }
                }
            }

            if !gone.is_empty() {
                let mut state = self.state.lock().unwrap();
                for handle in gone {
                    state.set.delegate_gone(handle);
                }
                for handle in state.set.take_gone() {
                    debug!("monitor {}: delegate gone for {handle:?}, deregistering", self.id);
                    state.sockets.remove(&handle);
                    state.set.reset(handle);
                }
            }

            if queue_gone {
                warn!("monitor {}: delegate message queue gone, shutting down", self.id);
                self.shutdown.store(true, Ordering::Release);
                self.state.lock().unwrap().lifecycle = Lifecycle::ShuttingDown;
                break;
            }
        }

        self.cleanup();
        debug!("monitor {}: thread stopped", self.id);
    }

    /// Walks the snapshot under the lock, pruning dead sockets and applying
    /// one-shot semantics: fired read/write bits are cleared from the desired
    /// mask until re-armed, fired exception bits deregister the handle.
    fn resolve_fired(&self, polling: &[PollEntry]) -> crate::set::FiredEvents {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        for entry in polling.iter().filter(|entry| !entry.fired().is_empty()) {
            let handle = entry.handle();
            if handle == self.wakeup.handle() {
                self.wakeup.drain();
                continue;
            }
            let fired = entry.fired();
            match state.sockets.get(&handle).and_then(Weak::upgrade) {
                None => {
                    // owner dropped the socket; prune lazily
                    debug!("monitor {}: socket {handle:?} gone, pruning", self.id);
                    state.sockets.remove(&handle);
                    state.set.reset(handle);
                }
                Some(socket) => {
                    if fired.intersects(EventMask::EXCEPTION) {
                        state.set.reset(handle);
                    } else {
                        let one_shot = fired & (EventMask::READABLE | EventMask::WRITABLE);
                        if let Err(err) = state.set.remove_events(handle, one_shot) {
                            // a direction left armed at the OS level re-fires
                            // spuriously until the owner resets the socket
                            warn!("monitor {}: unable to disarm {handle:?}: {err}", self.id);
                        }
                    }
                    state.set.fired_event(socket, fired);
                }
            }
        }
        state.set.take_fired()
    }

    fn dispatch(socket: &Arc<Socket>, fired: EventMask) -> Result<(), NotifyError> {
        if fired.contains(EventMask::READABLE) {
            socket.notify_read_ready()?;
        }
        if fired.contains(EventMask::WRITABLE) {
            socket.notify_write_ready()?;
        }
        if fired.intersects(EventMask::EXCEPTION) {
            socket.notify_exception()?;
        }
        Ok(())
    }

    fn cleanup(&self) {
        let mut state = self.state.lock().unwrap();
        for pending in state.waiters.drain(..) {
            pending.signal();
        }
        state.sockets.clear();
        state.set.clear();
        state.lifecycle = Lifecycle::Joined;
    }
}

impl Drop for SocketMonitor {
    fn drop(&mut self) {
        self.cancel();
    }
}
