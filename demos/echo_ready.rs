use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::mpsc::{Sender, channel};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use socket2::Domain;
use sockmon::balancer::SocketMonitorLoadBalancer;
use sockmon::config::MonitorConfig;
use sockmon::delegate::{NotifyError, SocketDelegate};
use sockmon::socket::Socket;

/// Reads whatever arrived, prints it, echoes it back and re-arms.
struct EchoDelegate {
    done: Mutex<Sender<()>>,
}

impl SocketDelegate for EchoDelegate {
    fn on_read_ready(&self, socket: &Arc<Socket>) -> Result<(), NotifyError> {
        let mut buf = [0u8; 256];
        if let Ok(n) = socket.recv(&mut buf) {
            println!("delegate received: {}", String::from_utf8_lossy(&buf[..n]));
            socket.send(&buf[..n]).ok();
            self.done.lock().unwrap().send(()).ok();
        }
        // read readiness is one-shot, arm it again for the next message
        socket.monitor_read().map_err(|_| NotifyError::QueueGone)
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let balancer = SocketMonitorLoadBalancer::new(MonitorConfig::from_settings(|key| {
        println!("settings lookup: {key}");
        None
    }));

    let listener = TcpListener::bind("127.0.0.1:0")?;
    let client = Socket::tcp(&balancer, Domain::IPV4)?;
    client.connect(listener.local_addr()?)?;
    let (mut peer, _) = listener.accept()?;

    let (tx, rx) = channel();
    let delegate = Arc::new(EchoDelegate { done: Mutex::new(tx) });
    let weak = Arc::downgrade(&delegate);
    let weak: Weak<dyn SocketDelegate> = weak;
    client.set_delegate(Some(weak))?;
    client.begin_monitoring(true, false, false)?;

    peer.write_all(b"hello, monitor")?;
    rx.recv_timeout(Duration::from_secs(5))?;

    let mut echoed = [0u8; 256];
    let n = peer.read(&mut echoed)?;
    println!("peer received echo: {}", String::from_utf8_lossy(&echoed[..n]));

    client.end_monitoring()?;
    Ok(())
}
