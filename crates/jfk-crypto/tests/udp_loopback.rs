//! Full handshake over real UDP sockets on the loopback interface.

mod support;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use jfk_crypto::collaborators::Task;
use jfk_crypto::{
    DatagramTransport, Handshaker, IdentityKeypair, LocalNode, NodeSigner, PeerSession, Scheduler,
};
use support::{test_config, TestPeer, TestRegistry};
use tokio::net::UdpSocket;
use tokio::runtime::Handle;
use tokio::time::{sleep, timeout};

struct UdpTransport(Arc<UdpSocket>);

impl DatagramTransport for UdpTransport {
    fn send_datagram(&self, data: &[u8], destination: SocketAddr) -> io::Result<()> {
        self.0.try_send_to(data, destination).map(|_| ())
    }

    fn max_packet_size(&self) -> usize {
        1280
    }

    fn header_overhead(&self) -> usize {
        28
    }
}

struct TokioScheduler(Handle);

impl Scheduler for TokioScheduler {
    fn execute(&self, task: Task) {
        self.0.spawn_blocking(task);
    }

    fn schedule(&self, delay: Duration, task: Task) {
        self.0.spawn(async move {
            sleep(delay).await;
            let _ = tokio::task::spawn_blocking(task).await;
        });
    }
}

fn handshaker(
    keypair: Arc<IdentityKeypair>,
    socket: Arc<UdpSocket>,
    peer: Arc<TestPeer>,
) -> Arc<Handshaker> {
    let local = LocalNode {
        reference: Bytes::copy_from_slice(&keypair.identity()),
        signer: keypair,
        open: false,
    };
    let handshaker = Handshaker::new(
        test_config(),
        local,
        Arc::new(UdpTransport(socket)),
        Arc::new(TestRegistry::new(vec![peer])),
        Arc::new(TokioScheduler(Handle::current())),
        Instant::now(),
    )
    .unwrap();
    handshaker.start(Instant::now());
    Arc::new(handshaker)
}

fn spawn_receiver(socket: Arc<UdpSocket>, handshaker: Arc<Handshaker>) {
    tokio::spawn(async move {
        let mut buf = vec![0u8; 2048];
        while let Ok((len, from)) = socket.recv_from(&mut buf).await {
            handshaker.handle_incoming(&buf[..len], from, Instant::now());
        }
    });
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_handshake_over_udp() {
    jfk_common::try_init_test_tracing();

    let socket_a = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let socket_b = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let (addr_a, addr_b) = (socket_a.local_addr().unwrap(), socket_b.local_addr().unwrap());

    let key_a = Arc::new(IdentityKeypair::generate());
    let key_b = Arc::new(IdentityKeypair::generate());
    let b_at_a = Arc::new(TestPeer::new(key_b.identity(), addr_b, &[7, 8]));
    let a_at_b = Arc::new(TestPeer::new(key_a.identity(), addr_a, &[7, 8]));

    let a = handshaker(key_a, socket_a.clone(), b_at_a.clone());
    let b = handshaker(key_b, socket_b.clone(), a_at_b.clone());
    spawn_receiver(socket_a, a.clone());
    spawn_receiver(socket_b, b.clone());

    let b_session = b_at_a.clone() as Arc<dyn PeerSession>;
    a.send_handshake(&b_session, Instant::now()).unwrap();

    timeout(Duration::from_secs(5), async {
        while b_at_a.completion_count() == 0 || a_at_b.completion_count() == 0 {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("handshake timed out");

    let initiator = b_at_a.completions.lock().unwrap();
    let responder = a_at_b.completions.lock().unwrap();
    assert_eq!(initiator[0].keys.outgoing_key, responder[0].keys.incoming_key);
    assert_eq!(initiator[0].negotiation_type as u8, 8);

    a.shutdown();
    b.shutdown();
}
