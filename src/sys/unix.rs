use std::io;
use std::mem::MaybeUninit;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::fd::{AsRawFd, RawFd};
use std::time::Duration;

use log::warn;
use rand::Rng;
use socket2::{Domain, Protocol, Socket, Type};

use crate::config::ThreadPriority;
use crate::error::Error;
use crate::events::EventMask;

pub(crate) type SysHandle = RawFd;

/// Upper bound on handles one wait call may carry, `FD_SETSIZE` discipline.
pub(crate) const MAX_WAIT_HANDLES: usize = 1024;

const WAKEUP_PORT_RANGE: std::ops::RangeInclusive<u16> = 49152..=65535;

pub(crate) fn handle_of(socket: &Socket) -> SysHandle {
    socket.as_raw_fd()
}

/// One slot of the registration table: native handle plus desired and fired
/// masks. Plain `Copy` data on POSIX; snapshot copies share nothing with the
/// official entry.
#[derive(Clone, Copy)]
pub(crate) struct PollEntry {
    handle: SysHandle,
    interest: EventMask,
    fired: EventMask,
}

impl PollEntry {
    pub fn new(handle: SysHandle, interest: EventMask) -> io::Result<PollEntry> {
        Ok(PollEntry {
            handle,
            interest,
            fired: EventMask::NONE,
        })
    }

    #[inline]
    pub fn handle(&self) -> SysHandle {
        self.handle
    }

    #[inline]
    pub fn interest(&self) -> EventMask {
        self.interest
    }

    pub fn set_interest(&mut self, interest: EventMask) -> io::Result<()> {
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

    /// Releases per-entry OS resources. Event objects only exist on Windows,
    /// so this is a no-op here.
    pub fn release(&mut self) {}
}

fn interest_bits(mask: EventMask) -> libc::c_short {
    let mut bits = 0;
    if mask.contains(EventMask::READABLE) {
        bits |= libc::POLLIN;
    }
    if mask.contains(EventMask::WRITABLE) {
        bits |= libc::POLLOUT;
    }
    if mask.intersects(EventMask::EXCEPTION) {
        bits |= libc::POLLPRI;
    }
    bits
}

fn mask_from_revents(bits: libc::c_short) -> EventMask {
    let mut mask = EventMask::NONE;
    if bits & libc::POLLIN != 0 {
        mask |= EventMask::READABLE;
    }
    if bits & libc::POLLOUT != 0 {
        mask |= EventMask::WRITABLE;
    }
    if bits & (libc::POLLERR | libc::POLLPRI) != 0 {
        mask |= EventMask::ERROR;
    }
    if bits & libc::POLLHUP != 0 {
        mask |= EventMask::HANG_UP;
    }
    if bits & libc::POLLNVAL != 0 {
        mask |= EventMask::INVALID;
    }
    mask
}

/// Blocking wait over a polling snapshot. Owns the `pollfd` scratch array
/// handed to the kernel so the snapshot itself stays platform independent.
pub(crate) struct Waiter {
    scratch: Vec<libc::pollfd>,
}

impl Waiter {
    pub fn new() -> Waiter {
        Waiter { scratch: Vec::new() }
    }

    /// Blocks until readiness changes on any entry or the timeout elapses.
    /// Fired masks are written back into `entries`; the return value is the
    /// number of entries that fired (0 on timeout).
    pub fn wait(&mut self, entries: &mut [PollEntry], timeout: Duration) -> io::Result<usize> {
        self.scratch.clear();
        self.scratch.extend(entries.iter().map(|entry| libc::pollfd {
            fd: entry.handle,
            events: interest_bits(entry.interest),
            revents: 0,
        }));

        let millis = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
        let rc = unsafe {
            libc::poll(
                self.scratch.as_mut_ptr(),
                self.scratch.len() as libc::nfds_t,
                millis,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }

        let mut fired = 0;
        for (entry, raw) in entries.iter_mut().zip(&self.scratch) {
            entry.fired = mask_from_revents(raw.revents);
            if !entry.fired.is_empty() {
                fired += 1;
            }
        }
        Ok(fired)
    }
}

/// Connected loopback UDP pair used to interrupt an in-flight `poll`. The
/// receiving end lives in the socket set with read interest; a one byte send
/// on the other end wakes the monitor thread.
pub(crate) struct Wakeup {
    tx: Socket,
    rx: Socket,
}

impl Wakeup {
    /// The first attempt binds to an ephemeral port; later attempts probe
    /// randomized high ports, alternating between IPv4 and IPv6 loopback.
    pub fn new(retry_limit: u32) -> Result<Wakeup, Error> {
        for attempt in 0..retry_limit {
            let addr: SocketAddr = if attempt == 0 {
                (Ipv4Addr::LOCALHOST, 0).into()
            } else if attempt % 2 == 1 {
                (Ipv6Addr::LOCALHOST, rand::rng().random_range(WAKEUP_PORT_RANGE)).into()
            } else {
                (Ipv4Addr::LOCALHOST, rand::rng().random_range(WAKEUP_PORT_RANGE)).into()
            };
            match Wakeup::try_pair(addr) {
                Ok(wakeup) => return Ok(wakeup),
                Err(err) => warn!("wakeup channel attempt {attempt} on {addr} failed: {err}"),
            }
        }
        Err(Error::WakeupChannel {
            attempts: retry_limit,
        })
    }

    fn try_pair(addr: SocketAddr) -> io::Result<Wakeup> {
        let domain = Domain::for_address(addr);
        let rx = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        rx.bind(&addr.into())?;
        rx.set_nonblocking(true)?;
        let local = rx.local_addr()?;
        let tx = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        tx.connect(&local)?;
        tx.set_nonblocking(true)?;
        Ok(Wakeup { tx, rx })
    }

    pub fn handle(&self) -> SysHandle {
        self.rx.as_raw_fd()
    }

    /// The always-registered extra entry through which signals reach the wait
    /// call.
    pub fn entry(&self) -> PollEntry {
        PollEntry {
            handle: self.handle(),
            interest: EventMask::READABLE,
            fired: EventMask::NONE,
        }
    }

    pub fn signal(&self) -> io::Result<()> {
        match self.tx.send(&[1]) {
            Ok(_) => Ok(()),
            // a full socket buffer still wakes the other side
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(err) => Err(err),
        }
    }

    pub fn drain(&self) {
        let mut buf = [MaybeUninit::<u8>::uninit(); 64];
        while let Ok(n) = self.rx.recv(&mut buf) {
            if n == 0 {
                break;
            }
        }
    }
}

pub(crate) fn set_thread_priority(priority: ThreadPriority) {
    let nice = match priority {
        ThreadPriority::Lowest => 19,
        ThreadPriority::Low => 10,
        ThreadPriority::Normal => 0,
        ThreadPriority::High => -10,
        ThreadPriority::Highest => -20,
    };
    if nice == 0 {
        return;
    }
    // PRIO_PROCESS with a tid targets only the calling thread on Linux;
    // other POSIX systems have no per-thread nice value, so the whole
    // process is reniced there
    #[cfg(target_os = "linux")]
    let who = unsafe { libc::syscall(libc::SYS_gettid) } as libc::id_t;
    #[cfg(not(target_os = "linux"))]
    let who: libc::id_t = 0;
    // raising priority needs privileges, failure is non-fatal
    let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS as _, who, nice) };
    if rc != 0 {
        warn!(
            "unable to apply thread priority {priority:?}: {}",
            io::Error::last_os_error()
        );
    }
}
