use std::io::Write;
use std::net::TcpListener;
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{Arc, Mutex, Weak, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use socket2::Domain;
use sockmon::balancer::SocketMonitorLoadBalancer;
use sockmon::config::MonitorConfig;
use sockmon::delegate::{NotifyError, SocketDelegate};
use sockmon::socket::Socket;

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);
const QUIET_WINDOW: Duration = Duration::from_millis(500);

fn balancer() -> Arc<SocketMonitorLoadBalancer> {
    balancer_with_capacity(MonitorConfig::default().max_sockets_per_monitor)
}

fn balancer_with_capacity(max_sockets_per_monitor: usize) -> Arc<SocketMonitorLoadBalancer> {
    SocketMonitorLoadBalancer::new(MonitorConfig {
        poll_interval: Duration::from_millis(200),
        max_sockets_per_monitor,
        ..MonitorConfig::default()
    })
}

/// Forwards every notification into an mpsc channel, tagged with a label.
struct Recorder {
    label: &'static str,
    tx: Mutex<Sender<(&'static str, &'static str)>>,
}

impl Recorder {
    fn new(label: &'static str, tx: Sender<(&'static str, &'static str)>) -> Arc<Recorder> {
        Arc::new(Recorder {
            label,
            tx: Mutex::new(tx),
        })
    }

    fn record(&self, direction: &'static str) {
        self.tx.lock().unwrap().send((self.label, direction)).ok();
    }
}

impl SocketDelegate for Recorder {
    fn on_read_ready(&self, _socket: &Arc<Socket>) -> Result<(), NotifyError> {
        self.record("read");
        Ok(())
    }

    fn on_write_ready(&self, _socket: &Arc<Socket>) -> Result<(), NotifyError> {
        self.record("write");
        Ok(())
    }

    fn on_exception(&self, _socket: &Arc<Socket>) -> Result<(), NotifyError> {
        self.record("exception");
        Ok(())
    }
}

fn delegate_of(recorder: &Arc<Recorder>) -> Weak<dyn SocketDelegate> {
    let weak = Arc::downgrade(recorder);
    let weak: Weak<dyn SocketDelegate> = weak;
    weak
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

#[test]
fn read_readiness_fires_exactly_once_until_rearmed() -> anyhow::Result<()> {
    let balancer = balancer();
    let listener = TcpListener::bind("127.0.0.1:0")?;

    let client = Socket::tcp(&balancer, Domain::IPV4)?;
    client.connect(listener.local_addr()?)?;
    let (mut server, _) = listener.accept()?;

    let (tx, rx) = mpsc::channel();
    let recorder = Recorder::new("a", tx);
    client.set_delegate(Some(delegate_of(&recorder)))?;
    client.begin_monitoring(true, false, false)?;

    server.write_all(b"ping")?;
    assert_eq!(("a", "read"), rx.recv_timeout(EVENT_TIMEOUT)?);

    // one-shot: the data is still unread, but without a re-arm there must be
    // no second notification
    assert!(rx.recv_timeout(QUIET_WINDOW).is_err());

    client.monitor_read()?;
    assert_eq!(("a", "read"), rx.recv_timeout(EVENT_TIMEOUT)?);

    client.end_monitoring()?;
    Ok(())
}

#[test]
fn write_readiness_fires_for_connected_socket() -> anyhow::Result<()> {
    let balancer = balancer();
    let listener = TcpListener::bind("127.0.0.1:0")?;

    let client = Socket::tcp(&balancer, Domain::IPV4)?;
    let (tx, rx) = mpsc::channel();
    let recorder = Recorder::new("b", tx);
    client.set_delegate(Some(delegate_of(&recorder)))?;
    client.connect(listener.local_addr()?)?;
    let _server = listener.accept()?;

    // an established socket with an empty send buffer is promptly writable
    client.begin_monitoring(false, true, false)?;
    assert_eq!(("b", "write"), rx.recv_timeout(EVENT_TIMEOUT)?);

    client.end_monitoring()?;
    Ok(())
}

#[test]
fn one_socket_read_does_not_notify_the_other() -> anyhow::Result<()> {
    let balancer = balancer();
    let listener = TcpListener::bind("127.0.0.1:0")?;

    let a = Socket::tcp(&balancer, Domain::IPV4)?;
    a.connect(listener.local_addr()?)?;
    let (mut peer_a, _) = listener.accept()?;

    let b = Socket::tcp(&balancer, Domain::IPV4)?;
    b.connect(listener.local_addr()?)?;
    let (_peer_b, _) = listener.accept()?;

    let (tx, rx) = mpsc::channel();
    let recorder_a = Recorder::new("a", tx.clone());
    let recorder_b = Recorder::new("b", tx);
    a.set_delegate(Some(delegate_of(&recorder_a)))?;
    b.set_delegate(Some(delegate_of(&recorder_b)))?;
    a.begin_monitoring(true, false, false)?;
    b.begin_monitoring(true, false, false)?;

    peer_a.write_all(b"only for a")?;
    assert_eq!(("a", "read"), rx.recv_timeout(EVENT_TIMEOUT)?);
    assert!(rx.recv_timeout(QUIET_WINDOW).is_err(), "b must stay silent");

    a.end_monitoring()?;
    b.end_monitoring()?;
    Ok(())
}

#[test]
fn delegate_gone_does_not_disturb_the_rest_of_the_batch() -> anyhow::Result<()> {
    let balancer = balancer();
    let listener = TcpListener::bind("127.0.0.1:0")?;

    let a = Socket::tcp(&balancer, Domain::IPV4)?;
    a.connect(listener.local_addr()?)?;
    let (mut peer_a, _) = listener.accept()?;

    let b = Socket::tcp(&balancer, Domain::IPV4)?;
    b.connect(listener.local_addr()?)?;
    let (mut peer_b, _) = listener.accept()?;

    let (tx, rx) = mpsc::channel();
    let recorder_a = Recorder::new("a", tx.clone());
    let recorder_b = Recorder::new("b", tx);
    a.set_delegate(Some(delegate_of(&recorder_a)))?;
    b.set_delegate(Some(delegate_of(&recorder_b)))?;
    a.begin_monitoring(true, false, false)?;
    b.begin_monitoring(true, false, false)?;

    // reclaim a's delegate before anything fires
    drop(recorder_a);

    peer_a.write_all(b"into the void")?;
    peer_b.write_all(b"for b")?;

    assert_eq!(("b", "read"), rx.recv_timeout(EVENT_TIMEOUT)?);
    assert!(rx.recv_timeout(QUIET_WINDOW).is_err(), "a's delegate is gone");

    // the monitor deregisters the socket whose delegate vanished
    let monitor = a.linked_monitor().unwrap();
    assert!(wait_until(EVENT_TIMEOUT, || monitor.monitored_count() == 1));

    a.end_monitoring()?;
    b.end_monitoring()?;
    Ok(())
}

#[test]
fn no_events_after_end_monitoring_and_rearming_works() -> anyhow::Result<()> {
    let balancer = balancer();
    let listener = TcpListener::bind("127.0.0.1:0")?;

    let client = Socket::tcp(&balancer, Domain::IPV4)?;
    client.connect(listener.local_addr()?)?;
    let (mut server, _) = listener.accept()?;

    let (tx, rx) = mpsc::channel();
    let recorder = Recorder::new("a", tx);
    client.set_delegate(Some(delegate_of(&recorder)))?;
    client.begin_monitoring(true, false, false)?;
    client.end_monitoring()?;

    // once end_monitoring returns, the monitor can no longer observe the
    // handle; traffic must produce nothing
    server.write_all(b"too late")?;
    assert!(rx.recv_timeout(QUIET_WINDOW).is_err());

    // the same handle can be registered again immediately, pending data fires
    client.begin_monitoring(true, false, false)?;
    assert_eq!(("a", "read"), rx.recv_timeout(EVENT_TIMEOUT)?);

    client.end_monitoring()?;
    Ok(())
}

#[test]
fn peer_reset_delivers_exception_and_deregisters() -> anyhow::Result<()> {
    let balancer = balancer();
    let listener = TcpListener::bind("127.0.0.1:0")?;

    let client = Socket::tcp(&balancer, Domain::IPV4)?;
    client.connect(listener.local_addr()?)?;
    let (server, _) = listener.accept()?;

    let (tx, rx) = mpsc::channel();
    let recorder = Recorder::new("a", tx);
    client.set_delegate(Some(delegate_of(&recorder)))?;
    client.begin_monitoring(true, false, true)?;

    // linger 0 turns the close into a hard reset
    let server = socket2::Socket::from(server);
    server.set_linger(Some(Duration::ZERO))?;
    drop(server);

    // a read notification may precede the exception in the same cycle
    let deadline = Instant::now() + EVENT_TIMEOUT;
    loop {
        match rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
            Ok((_, "exception")) => break,
            Ok(_) => {}
            Err(err) => anyhow::bail!("no exception notification: {err}"),
        }
    }

    // an exception fire removes the handle from the wait set entirely, so
    // the still-broken socket must stay silent without a re-arm
    assert!(rx.recv_timeout(QUIET_WINDOW).is_err());

    // re-arming exception interest reports the persistent condition again
    client.monitor_exception()?;
    assert!(wait_until(EVENT_TIMEOUT, || matches!(
        rx.try_recv(),
        Ok((_, "exception"))
    )));

    client.end_monitoring()?;
    Ok(())
}

#[test]
fn sockets_shard_across_monitors_and_still_dispatch() -> anyhow::Result<()> {
    let balancer = balancer_with_capacity(1);
    let listener = TcpListener::bind("127.0.0.1:0")?;

    let a = Socket::tcp(&balancer, Domain::IPV4)?;
    a.connect(listener.local_addr()?)?;
    let (mut peer_a, _) = listener.accept()?;

    let b = Socket::tcp(&balancer, Domain::IPV4)?;
    b.connect(listener.local_addr()?)?;
    let (mut peer_b, _) = listener.accept()?;

    let (tx, rx) = mpsc::channel();
    let recorder_a = Recorder::new("a", tx.clone());
    let recorder_b = Recorder::new("b", tx);
    a.set_delegate(Some(delegate_of(&recorder_a)))?;
    b.set_delegate(Some(delegate_of(&recorder_b)))?;
    a.begin_monitoring(true, false, false)?;
    b.begin_monitoring(true, false, false)?;

    assert_eq!(2, balancer.monitor_count());
    assert_ne!(
        a.linked_monitor().unwrap().id(),
        b.linked_monitor().unwrap().id()
    );

    peer_a.write_all(b"for a")?;
    peer_b.write_all(b"for b")?;
    let mut seen = vec![rx.recv_timeout(EVENT_TIMEOUT)?, rx.recv_timeout(EVENT_TIMEOUT)?];
    seen.sort_unstable();
    assert_eq!(vec![("a", "read"), ("b", "read")], seen);

    // empty monitors are retired as sockets detach
    a.end_monitoring()?;
    b.end_monitoring()?;
    assert_eq!(0, balancer.monitor_count());
    Ok(())
}

#[test]
fn dropping_a_socket_retires_its_monitor() -> anyhow::Result<()> {
    let balancer = balancer();
    let listener = TcpListener::bind("127.0.0.1:0")?;

    let client = Socket::tcp(&balancer, Domain::IPV4)?;
    client.connect(listener.local_addr()?)?;
    let _server = listener.accept()?;

    let (tx, _rx) = mpsc::channel();
    let recorder = Recorder::new("a", tx);
    client.set_delegate(Some(delegate_of(&recorder)))?;
    client.begin_monitoring(true, false, false)?;
    assert_eq!(1, balancer.monitor_count());

    drop(client);
    assert_eq!(0, balancer.monitor_count());
    Ok(())
}

/// Reports a dead dispatch queue on the first read notification.
struct DeadQueue;

impl SocketDelegate for DeadQueue {
    fn on_read_ready(&self, _socket: &Arc<Socket>) -> Result<(), NotifyError> {
        Err(NotifyError::QueueGone)
    }
}

#[test]
fn queue_gone_shuts_down_the_monitor() -> anyhow::Result<()> {
    let balancer = balancer();
    let listener = TcpListener::bind("127.0.0.1:0")?;

    let client = Socket::tcp(&balancer, Domain::IPV4)?;
    client.connect(listener.local_addr()?)?;
    let (mut server, _) = listener.accept()?;

    let delegate = Arc::new(DeadQueue);
    let weak = Arc::downgrade(&delegate);
    let weak: Weak<dyn SocketDelegate> = weak;
    client.set_delegate(Some(weak))?;
    client.begin_monitoring(true, false, false)?;

    let monitor = client.linked_monitor().unwrap();
    server.write_all(b"boom")?;

    // the monitor shuts down in an orderly fashion and clears its set
    assert!(wait_until(EVENT_TIMEOUT, || monitor.monitored_count() == 0));

    // later registrations are refused by the dead monitor
    let other = Socket::tcp(&balancer, Domain::IPV4)?;
    other.connect(listener.local_addr()?)?;
    let _peer = listener.accept()?;
    let (tx, _rx2): (Sender<(&'static str, &'static str)>, Receiver<_>) = mpsc::channel();
    let recorder = Recorder::new("b", tx);
    other.set_delegate(Some(delegate_of(&recorder)))?;
    // the balancer may route to the dead monitor once; the share is returned
    // and a retry lands on a fresh monitor
    if other.begin_monitoring(true, false, false).is_err() {
        other.begin_monitoring(true, false, false)?;
    }
    assert!(other.linked_monitor().is_some());

    other.end_monitoring()?;
    client.end_monitoring()?;
    Ok(())
}
