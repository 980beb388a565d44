use std::io;
use std::os::windows::io::{AsRawSocket, RawSocket};
use std::time::Duration;

use log::warn;
use socket2::Socket;
use windows_sys::Win32::Foundation::{HANDLE, WAIT_OBJECT_0};
use windows_sys::Win32::Networking::WinSock::{
    FD_ACCEPT, FD_CLOSE, FD_CONNECT, FD_OOB, FD_READ, FD_WRITE, SOCKET, SOCKET_ERROR,
    WSACloseEvent, WSACreateEvent, WSAEnumNetworkEvents, WSAEventSelect, WSANETWORKEVENTS,
    WSAResetEvent, WSASetEvent, WSAWaitForMultipleEvents, WSA_MAXIMUM_WAIT_EVENTS,
    WSA_WAIT_FAILED, WSA_WAIT_TIMEOUT,
};
use windows_sys::Win32::System::Threading::{
    GetCurrentThread, SetThreadPriority, THREAD_PRIORITY_ABOVE_NORMAL, THREAD_PRIORITY_BELOW_NORMAL,
    THREAD_PRIORITY_HIGHEST, THREAD_PRIORITY_LOWEST, THREAD_PRIORITY_NORMAL, WaitForSingleObject,
};

use crate::config::ThreadPriority;
use crate::error::Error;
use crate::events::EventMask;

pub(crate) type SysHandle = RawSocket;

/// Upper bound on handles one wait call may carry, `WSA_MAXIMUM_WAIT_EVENTS`.
pub(crate) const MAX_WAIT_HANDLES: usize = WSA_MAXIMUM_WAIT_EVENTS as usize;

pub(crate) fn handle_of(socket: &Socket) -> SysHandle {
    socket.as_raw_socket()
}

/// One slot of the registration table: a socket handle, the dedicated event
/// object associated with it, and the desired and fired masks. The official
/// entry owns the event object and releases it through [`PollEntry::release`];
/// snapshot copies borrow the raw value and never close it.
#[derive(Clone, Copy)]
pub(crate) struct PollEntry {
    handle: SysHandle,
    event: usize,
    event_only: bool,
    interest: EventMask,
    fired: EventMask,
}

impl PollEntry {
    /// Creates a per-socket event object and associates it with `handle` for
    /// the translated `interest`.
    pub fn new(handle: SysHandle, interest: EventMask) -> io::Result<PollEntry> {
        let event = unsafe { WSACreateEvent() };
        if event.is_null() {
            return Err(io::Error::last_os_error());
        }
        let mut entry = PollEntry {
            handle,
            event: event as usize,
            event_only: false,
            interest: EventMask::NONE,
            fired: EventMask::NONE,
        };
        if let Err(err) = entry.set_interest(interest) {
            unsafe { WSACloseEvent(event) };
            return Err(err);
        }
        Ok(entry)
    }

    #[inline]
    pub fn handle(&self) -> SysHandle {
        self.handle
    }

    #[inline]
    pub fn interest(&self) -> EventMask {
        self.interest
    }

    /// Re-issues the event association with the translated mask.
    pub fn set_interest(&mut self, interest: EventMask) -> io::Result<()> {
        let rc = unsafe {
            WSAEventSelect(
                self.handle as SOCKET,
                self.event as HANDLE,
                interest_bits(interest),
            )
        };
        if rc == SOCKET_ERROR {
            return Err(io::Error::last_os_error());
        }
        self.interest = interest;
        Ok(())
    }

    #[inline]
    pub fn fired(&self) -> EventMask {
        self.fired
    }

    #[inline]
    pub fn clear_fired(&mut self) {
        self.fired = EventMask::NONE;
    }

    /// Closes the owned event object. Wakeup entries borrow their event from
    /// the [`Wakeup`] and are skipped.
    pub fn release(&mut self) {
        if !self.event_only {
            unsafe { WSACloseEvent(self.event as HANDLE) };
        }
    }
}

fn interest_bits(mask: EventMask) -> i32 {
    let mut bits = 0u32;
    if mask.contains(EventMask::READABLE) {
        bits |= FD_READ | FD_ACCEPT;
    }
    if mask.contains(EventMask::WRITABLE) {
        bits |= FD_WRITE | FD_CONNECT;
    }
    if mask.intersects(EventMask::EXCEPTION) {
        bits |= FD_OOB | FD_CLOSE;
    }
    bits as i32
}

fn mask_from_network_events(ne: &WSANETWORKEVENTS) -> EventMask {
    let bits = ne.lNetworkEvents as u32;
    let mut mask = EventMask::NONE;
    if bits & (FD_READ | FD_ACCEPT) != 0 {
        mask |= EventMask::READABLE;
    }
    if bits & (FD_WRITE | FD_CONNECT) != 0 {
        mask |= EventMask::WRITABLE;
    }
    if bits & FD_OOB != 0 {
        mask |= EventMask::ERROR;
    }
    if bits & FD_CLOSE != 0 {
        mask |= EventMask::HANG_UP;
    }
    for code in ne.iErrorCode {
        if code != 0 {
            mask |= EventMask::ERROR;
            break;
        }
    }
    mask
}

/// Blocking wait over a polling snapshot via event object multi-wait. After
/// the wait returns, every socket entry's network events are enumerated so one
/// wakeup can report multiple fired handles, mirroring `poll`.
pub(crate) struct Waiter {
    handles: Vec<usize>,
}

impl Waiter {
    pub fn new() -> Waiter {
        Waiter { handles: Vec::new() }
    }

    pub fn wait(&mut self, entries: &mut [PollEntry], timeout: Duration) -> io::Result<usize> {
        assert!(
            entries.len() <= MAX_WAIT_HANDLES,
            "wait set exceeds WSA_MAXIMUM_WAIT_EVENTS"
        );
        self.handles.clear();
        self.handles.extend(entries.iter().map(|entry| entry.event));

        let millis = timeout.as_millis().min(u32::MAX as u128 - 1) as u32;
        let rc = unsafe {
            WSAWaitForMultipleEvents(
                self.handles.len() as u32,
                self.handles.as_ptr() as *const HANDLE,
                0,
                millis,
                0,
            )
        };
        if rc == WSA_WAIT_FAILED {
            return Err(io::Error::last_os_error());
        }
        if rc == WSA_WAIT_TIMEOUT {
            for entry in entries.iter_mut() {
                entry.clear_fired();
            }
            return Ok(0);
        }

        let mut fired = 0;
        for entry in entries.iter_mut() {
            entry.fired = EventMask::NONE;
            if entry.event_only {
                // manual-reset event, the signaled state is checked directly
                let state = unsafe { WaitForSingleObject(entry.event as HANDLE, 0) };
                if state == WAIT_OBJECT_0 {
                    entry.fired = EventMask::READABLE;
                }
            } else {
                let mut ne: WSANETWORKEVENTS = unsafe { std::mem::zeroed() };
                let rc = unsafe {
                    WSAEnumNetworkEvents(entry.handle as SOCKET, entry.event as HANDLE, &mut ne)
                };
                entry.fired = if rc == SOCKET_ERROR {
                    EventMask::INVALID
                } else {
                    mask_from_network_events(&ne)
                };
            }
            if !entry.fired.is_empty() {
                fired += 1;
            }
        }
        Ok(fired)
    }
}

/// Manual-reset event object used to interrupt an in-flight multi-wait.
pub(crate) struct Wakeup {
    event: usize,
}

// the raw event handle is only ever passed to thread-safe WSA calls
unsafe impl Send for Wakeup {}
unsafe impl Sync for Wakeup {}

impl Wakeup {
    pub fn new(retry_limit: u32) -> Result<Wakeup, Error> {
        let event = unsafe { WSACreateEvent() };
        if event.is_null() {
            warn!(
                "unable to create wakeup event object: {}",
                io::Error::last_os_error()
            );
            return Err(Error::WakeupChannel {
                attempts: retry_limit.min(1),
            });
        }
        Ok(Wakeup {
            event: event as usize,
        })
    }

    /// The event handle doubles as the set key; it can never collide with a
    /// socket handle.
    pub fn handle(&self) -> SysHandle {
        self.event as SysHandle
    }

    pub fn entry(&self) -> PollEntry {
        PollEntry {
            handle: self.handle(),
            event: self.event,
            event_only: true,
            interest: EventMask::READABLE,
            fired: EventMask::NONE,
        }
    }

    pub fn signal(&self) -> io::Result<()> {
        if unsafe { WSASetEvent(self.event as HANDLE) } == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn drain(&self) {
        unsafe { WSAResetEvent(self.event as HANDLE) };
    }
}

impl Drop for Wakeup {
    fn drop(&mut self) {
        unsafe { WSACloseEvent(self.event as HANDLE) };
    }
}

pub(crate) fn set_thread_priority(priority: ThreadPriority) {
    let level = match priority {
        ThreadPriority::Lowest => THREAD_PRIORITY_LOWEST,
        ThreadPriority::Low => THREAD_PRIORITY_BELOW_NORMAL,
        ThreadPriority::Normal => THREAD_PRIORITY_NORMAL,
        ThreadPriority::High => THREAD_PRIORITY_ABOVE_NORMAL,
        ThreadPriority::Highest => THREAD_PRIORITY_HIGHEST,
    };
    if level == THREAD_PRIORITY_NORMAL {
        return;
    }
    if unsafe { SetThreadPriority(GetCurrentThread(), level) } == 0 {
        warn!(
            "unable to apply thread priority {priority:?}: {}",
            io::Error::last_os_error()
        );
    }
}
