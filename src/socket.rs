//! Non-blocking socket wrapper exposing the readiness-facing surface.

use std::io;
use std::mem::MaybeUninit;
use std::net::{Shutdown, SocketAddr};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use socket2::{Domain, Protocol, Type};

use crate::balancer::SocketMonitorLoadBalancer;
use crate::delegate::{NotifyError, SocketDelegate};
use crate::error::Error;
use crate::monitor::SocketMonitor;
use crate::sys::{self, SysHandle};

/// Thin wrapper around a native socket handle with the hooks the monitor
/// needs: creation, bind/listen/accept/connect, send/receive, option
/// plumbing, and the three notification triggers the monitor thread invokes.
///
/// A socket links to a monitor (through the injected load balancer) only
/// while monitoring is active; ending monitoring or dropping the socket
/// releases the link. The monitor itself only ever holds a weak reference
/// back, so it never keeps a socket alive past its owner's interest.
pub struct Socket {
    inner: socket2::Socket,
    handle: SysHandle,
    balancer: Arc<SocketMonitorLoadBalancer>,
    delegate: Mutex<Option<Weak<dyn SocketDelegate>>>,
    link: Mutex<Option<Arc<SocketMonitor>>>,
}

impl Socket {
    /// Creates a non-blocking TCP socket with `TCP_NODELAY` enabled.
    pub fn tcp(balancer: &Arc<SocketMonitorLoadBalancer>, domain: Domain) -> io::Result<Arc<Socket>> {
        let inner = socket2::Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        inner.set_nonblocking(true)?;
        inner.set_nodelay(true)?;
        Ok(Self::wrap(inner, Arc::clone(balancer)))
    }

    /// Creates a non-blocking UDP socket.
    pub fn udp(balancer: &Arc<SocketMonitorLoadBalancer>, domain: Domain) -> io::Result<Arc<Socket>> {
        let inner = socket2::Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        inner.set_nonblocking(true)?;
        Ok(Self::wrap(inner, Arc::clone(balancer)))
    }

    /// Adopts an already created socket, e.g. one returned by an external
    /// acceptor. The socket is switched to non-blocking mode.
    pub fn adopt(
        socket: socket2::Socket,
        balancer: &Arc<SocketMonitorLoadBalancer>,
    ) -> io::Result<Arc<Socket>> {
        socket.set_nonblocking(true)?;
        Ok(Self::wrap(socket, Arc::clone(balancer)))
    }

    fn wrap(inner: socket2::Socket, balancer: Arc<SocketMonitorLoadBalancer>) -> Arc<Socket> {
        let handle = sys::handle_of(&inner);
        Arc::new(Socket {
            inner,
            handle,
            balancer,
            delegate: Mutex::new(None),
            link: Mutex::new(None),
        })
    }

    #[inline]
    pub fn handle(&self) -> SysHandle {
        self.handle
    }

    pub fn bind(&self, addr: SocketAddr) -> io::Result<()> {
        self.inner.bind(&addr.into())
    }

    pub fn listen(&self, backlog: i32) -> io::Result<()> {
        self.inner.listen(backlog)
    }

    /// Accepts a pending connection as a new non-blocking [`Socket`] attached
    /// to the same load balancer.
    pub fn accept(&self) -> io::Result<Arc<Socket>> {
        let (accepted, _addr) = self.inner.accept()?;
        accepted.set_nonblocking(true)?;
        let _ = accepted.set_nodelay(true);
        Ok(Self::wrap(accepted, Arc::clone(&self.balancer)))
    }

    /// Starts a non-blocking connect; completion is observed through write
    /// readiness.
    pub fn connect(&self, addr: SocketAddr) -> io::Result<()> {
        match self.inner.connect(&addr.into()) {
            Ok(()) => Ok(()),
            Err(err) if connect_in_progress(&err) => Ok(()),
            Err(err) => Err(err),
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner
            .local_addr()?
            .as_socket()
            .ok_or_else(|| io::Error::other("not an inet address"))
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.inner
            .peer_addr()?
            .as_socket()
            .ok_or_else(|| io::Error::other("not an inet address"))
    }

    pub fn send(&self, buf: &[u8]) -> io::Result<usize> {
        self.inner.send(buf)
    }

    pub fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        self.inner.send_to(buf, &addr.into())
    }

    pub fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.recv(as_uninit(buf))
    }

    pub fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, Option<SocketAddr>)> {
        let (n, addr) = self.inner.recv_from(as_uninit(buf))?;
        Ok((n, addr.as_socket()))
    }

    pub fn peek(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.peek(as_uninit(buf))
    }

    pub fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        self.inner.shutdown(how)
    }

    // option passthrough

    pub fn set_nodelay(&self, nodelay: bool) -> io::Result<()> {
        self.inner.set_nodelay(nodelay)
    }

    pub fn nodelay(&self) -> io::Result<bool> {
        self.inner.nodelay()
    }

    pub fn set_reuse_address(&self, reuse: bool) -> io::Result<()> {
        self.inner.set_reuse_address(reuse)
    }

    pub fn reuse_address(&self) -> io::Result<bool> {
        self.inner.reuse_address()
    }

    pub fn set_recv_buffer_size(&self, size: usize) -> io::Result<()> {
        self.inner.set_recv_buffer_size(size)
    }

    pub fn recv_buffer_size(&self) -> io::Result<usize> {
        self.inner.recv_buffer_size()
    }

    pub fn set_send_buffer_size(&self, size: usize) -> io::Result<()> {
        self.inner.set_send_buffer_size(size)
    }

    pub fn send_buffer_size(&self) -> io::Result<usize> {
        self.inner.send_buffer_size()
    }

    pub fn set_linger(&self, linger: Option<Duration>) -> io::Result<()> {
        self.inner.set_linger(linger)
    }

    pub fn linger(&self) -> io::Result<Option<Duration>> {
        self.inner.linger()
    }

    // delegate and monitoring surface

    /// Installs or removes the delegate. Removing the delegate ends
    /// monitoring; installing one does not by itself arm any direction, call
    /// [`Socket::begin_monitoring`] for that.
    pub fn set_delegate(&self, delegate: Option<Weak<dyn SocketDelegate>>) -> Result<(), Error> {
        let removing = delegate.is_none();
        *self.delegate.lock().unwrap() = delegate;
        if removing {
            self.end_monitoring()?;
        }
        Ok(())
    }

    /// Registers this socket with a monitor (linking through the load
    /// balancer on first use) for the given directions. Requires a delegate.
    /// Returns once the monitor's next wait cycle is guaranteed to observe
    /// the registration.
    pub fn begin_monitoring(
        self: &Arc<Self>,
        read: bool,
        write: bool,
        exception: bool,
    ) -> Result<(), Error> {
        assert!(
            self.delegate.lock().unwrap().is_some(),
            "begin_monitoring requires a delegate"
        );
        let monitor = {
            let mut link = self.link.lock().unwrap();
            match &*link {
                Some(monitor) => Arc::clone(monitor),
                None => {
                    let monitor = self.balancer.link()?;
                    *link = Some(Arc::clone(&monitor));
                    monitor
                }
            }
        };
        if let Err(err) = monitor.begin(self, read, write, exception) {
            // do not leak the balancer share on a monitor that refused us
            *self.link.lock().unwrap() = None;
            self.balancer.unlink(monitor.id());
            return Err(err);
        }
        Ok(())
    }

    /// Re-arms read readiness after a one-shot fire.
    pub fn monitor_read(&self) -> Result<(), Error> {
        self.monitor().monitor_read(self)
    }

    /// Re-arms write readiness after a one-shot fire.
    pub fn monitor_write(&self) -> Result<(), Error> {
        self.monitor().monitor_write(self)
    }

    /// Re-arms exception interest.
    pub fn monitor_exception(&self) -> Result<(), Error> {
        self.monitor().monitor_exception(self)
    }

    /// Deregisters from the linked monitor. Returns only once the monitor
    /// thread can no longer observe this handle, so the OS may reuse it
    /// safely. Idempotent.
    pub fn end_monitoring(&self) -> Result<(), Error> {
        let link = self.link.lock().unwrap().take();
        if let Some(monitor) = link {
            monitor.end(self)?;
        }
        Ok(())
    }

    /// The monitor this socket is currently linked to, if any.
    pub fn linked_monitor(&self) -> Option<Arc<SocketMonitor>> {
        self.link.lock().unwrap().clone()
    }

    fn monitor(&self) -> Arc<SocketMonitor> {
        self.link
            .lock()
            .unwrap()
            .clone()
            .expect("socket is not monitored")
    }

    // notification triggers, invoked by the monitor thread

    pub(crate) fn notify_read_ready(self: &Arc<Self>) -> Result<(), NotifyError> {
        self.resolve_delegate()?.on_read_ready(self)
    }

    pub(crate) fn notify_write_ready(self: &Arc<Self>) -> Result<(), NotifyError> {
        self.resolve_delegate()?.on_write_ready(self)
    }

    pub(crate) fn notify_exception(self: &Arc<Self>) -> Result<(), NotifyError> {
        self.resolve_delegate()?.on_exception(self)
    }

    fn resolve_delegate(&self) -> Result<Arc<dyn SocketDelegate>, NotifyError> {
        self.delegate
            .lock()
            .unwrap()
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or(NotifyError::DelegateGone)
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        let link = self.link.get_mut().unwrap().take();
        if let Some(monitor) = link {
            let _ = monitor.end(self);
        }
    }
}

// socket2 never de-initializes the buffer, the cast is its documented pattern
fn as_uninit(buf: &mut [u8]) -> &mut [MaybeUninit<u8>] {
    unsafe { &mut *(std::ptr::from_mut::<[u8]>(buf) as *mut [MaybeUninit<u8>]) }
}

#[cfg(unix)]
fn connect_in_progress(err: &io::Error) -> bool {
    // non-blocking connect reports EINPROGRESS, not WouldBlock
    err.raw_os_error() == Some(libc::EINPROGRESS)
}

#[cfg(windows)]
fn connect_in_progress(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
}
