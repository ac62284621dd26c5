//! Tokio-backed transport and scheduler.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use jfk_crypto::{DatagramTransport, Scheduler, Task};
use tokio::net::UdpSocket;
use tokio::runtime::Handle;

/// Largest handshake datagram we send.
pub const MAX_PACKET_SIZE: usize = 1280;

/// IPv4 + UDP headers.
pub const UDP_HEADER_OVERHEAD: usize = 28;

pub struct UdpTransport {
    socket: Arc<UdpSocket>,
}

impl UdpTransport {
    pub fn new(socket: Arc<UdpSocket>) -> Self {
        Self { socket }
    }
}

impl DatagramTransport for UdpTransport {
    fn send_datagram(&self, data: &[u8], destination: SocketAddr) -> io::Result<()> {
        self.socket.try_send_to(data, destination).map(|_| ())
    }

    fn max_packet_size(&self) -> usize {
        MAX_PACKET_SIZE
    }

    fn header_overhead(&self) -> usize {
        UDP_HEADER_OVERHEAD
    }
}

/// Runs handshake tasks on the blocking pool so that context generation
/// never stalls the receive loop.
pub struct TokioScheduler {
    handle: Handle,
}

impl TokioScheduler {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }
}

impl Scheduler for TokioScheduler {
    fn execute(&self, task: Task) {
        self.handle.spawn_blocking(task);
    }

    fn schedule(&self, delay: Duration, task: Task) {
        self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tokio::task::spawn_blocking(task).await;
        });
    }
}
