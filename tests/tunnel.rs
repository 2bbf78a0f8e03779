//! End-to-end tests for the tunnel core, driven over an in-process mock
//! transport. Two linked mock transports simulate the bidirectional channel:
//! packets sent by one side reach the other side's handler after a random
//! delay below 200 ms, so packets routinely arrive out of order and the
//! reassembly path is exercised for real.

use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use rand::Rng;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    time::{sleep, timeout},
};
use tokio_util::sync::CancellationToken;

use burrow::{
    protocol::{Packet, PacketKind},
    tunnel::{self, Transport},
};

struct MockTransport {
    handler: Mutex<Option<Arc<dyn Fn(Packet) + Send + Sync>>>,
    peer: Mutex<Option<Arc<MockTransport>>>,
    token: CancellationToken,
    sent: Mutex<Vec<(PacketKind, u32)>>,
}

impl MockTransport {
    /// Creates a linked pair of mock transports.
    fn pair() -> (Arc<Self>, Arc<Self>) {
        let a = Arc::new(Self::new());
        let b = Arc::new(Self::new());
        *a.peer.lock().unwrap() = Some(Arc::clone(&b));
        *b.peer.lock().unwrap() = Some(Arc::clone(&a));
        (a, b)
    }

    fn new() -> Self {
        Self {
            handler: Mutex::new(None),
            peer: Mutex::new(None),
            token: CancellationToken::new(),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Schedules asynchronous delivery to the peer's handler with a random
    /// delay in [0, 200 ms). Dropped silently if either side has closed.
    fn deliver_to_peer(&self, pkt: Packet) {
        self.sent.lock().unwrap().push((pkt.kind, pkt.socket_id));

        let peer = match self.peer.lock().unwrap().as_ref() {
            Some(peer) => Arc::clone(peer),
            None => return,
        };
        let own_token = self.token.clone();

        tokio::spawn(async move {
            let delay = Duration::from_millis(rand::thread_rng().gen_range(0..200));
            tokio::select! {
                _ = sleep(delay) => {}
                _ = own_token.cancelled() => return,
                _ = peer.token.cancelled() => return,
            }

            let handler = peer.handler.lock().unwrap().clone();
            if let Some(handler) = handler {
                handler(pkt);
            }
        });
    }

    /// Every packet this side has submitted, in submission order.
    fn sent_kinds(&self) -> Vec<(PacketKind, u32)> {
        self.sent.lock().unwrap().clone()
    }
}

impl Transport for MockTransport {
    async fn send_connect(&self, socket_id: u32, seq_num: u32) {
        self.deliver_to_peer(Packet::connect(socket_id, seq_num));
    }

    async fn send_data(&self, socket_id: u32, seq_num: u32, payload: Vec<u8>) {
        self.deliver_to_peer(Packet::data(socket_id, seq_num, payload));
    }

    async fn send_close(&self, socket_id: u32, seq_num: u32) {
        self.deliver_to_peer(Packet::close(socket_id, seq_num));
    }

    fn on_packet(&self, handler: Arc<dyn Fn(Packet) + Send + Sync>) {
        *self.handler.lock().unwrap() = Some(handler);
    }

    fn done(&self) -> CancellationToken {
        self.token.clone()
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Starts a TCP echo server that copies everything back to the sender.
async fn start_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let (mut stream, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => return,
            };
            tokio::spawn(async move {
                let (mut rd, mut wr) = stream.split();
                let _ = tokio::io::copy(&mut rd, &mut wr).await;
            });
        }
    });

    addr
}

/// Finds a free TCP port on loopback.
async fn free_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

/// Dials the virtual service, retrying until its listener is up. The
/// returned stream is the only probe made, so each call corresponds to
/// exactly one tunnel socket.
async fn connect_with_retry(addr: SocketAddr) -> TcpStream {
    timeout(Duration::from_secs(5), async {
        loop {
            match TcpStream::connect(addr).await {
                Ok(stream) => return stream,
                Err(_) => sleep(Duration::from_millis(50)).await,
            }
        }
    })
    .await
    .expect("listener did not come up in time")
}

/// Deterministic test data: each byte derives from its index XOR-ed with the
/// seed, so different connections produce distinguishable payloads.
fn make_test_data(size: usize, seed: u8) -> Vec<u8> {
    (0..size).map(|i| (i % 251) as u8 ^ seed).collect()
}

fn start_tunnel_pair(echo_addr: SocketAddr, client_addr: SocketAddr) -> (Arc<MockTransport>, Arc<MockTransport>) {
    let (client_tr, host_tr) = MockTransport::pair();

    let host_run = Arc::clone(&host_tr);
    tokio::spawn(async move {
        tunnel::run_as_host(host_run, echo_addr).await.unwrap();
    });

    let client_run = Arc::clone(&client_tr);
    tokio::spawn(async move {
        tunnel::run_as_client(client_run, client_addr).await.unwrap();
    });

    (client_tr, host_tr)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn echo_single_small_message() {
    let echo_addr = start_echo_server().await;
    let client_addr = free_addr().await;
    let (_client_tr, _host_tr) = start_tunnel_pair(echo_addr, client_addr);

    let mut stream = connect_with_retry(client_addr).await;
    stream.write_all(b"hello").await.expect("write");

    let mut got = [0u8; 5];
    timeout(Duration::from_secs(10), stream.read_exact(&mut got))
        .await
        .expect("echo deadline")
        .expect("read echo");

    assert_eq!(&got, b"hello");
}

/// Ten concurrent connections each push 10 MiB through the tunnel (far above
/// the 16 KiB per-packet payload limit, forcing multi-packet splitting) and
/// must read their exact bytes back while the mock transport reorders
/// deliveries.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn echo_many_concurrent_connections() {
    const NUM_CONNS: usize = 10;
    const DATA_SIZE: usize = 10 * 1024 * 1024;

    let echo_addr = start_echo_server().await;
    let client_addr = free_addr().await;
    let (_client_tr, _host_tr) = start_tunnel_pair(echo_addr, client_addr);

    let mut handles = Vec::new();
    for index in 0..NUM_CONNS {
        handles.push(tokio::spawn(async move {
            let stream = connect_with_retry(client_addr).await;
            let sent = make_test_data(DATA_SIZE, index as u8);

            let (mut rd, mut wr) = stream.into_split();

            // Write and read concurrently to avoid TCP buffer deadlock; the
            // write half must stay open until the echo has been read back.
            let to_write = sent.clone();
            let writer = tokio::spawn(async move {
                wr.write_all(&to_write).await.expect("write");
                wr
            });

            let mut got = vec![0u8; DATA_SIZE];
            timeout(Duration::from_secs(15), rd.read_exact(&mut got))
                .await
                .expect("echo deadline")
                .expect("read echo");

            drop(writer.await.expect("writer task"));
            assert_eq!(sent, got, "echoed data mismatch on connection {index}");
        }));
    }

    for handle in handles {
        handle.await.expect("connection task");
    }
}

/// When the host's dial target is closed, the client's TCP connection must be
/// closed shortly after, and nothing but CONNECT and CLOSE may appear on the
/// wire for that socket id.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn host_dial_failure_closes_client_connection() {
    let closed_addr = free_addr().await;
    let client_addr = free_addr().await;
    let (client_tr, host_tr) = start_tunnel_pair(closed_addr, client_addr);

    let mut stream = connect_with_retry(client_addr).await;

    let mut buf = [0u8; 1];
    let read_result = timeout(Duration::from_secs(5), stream.read(&mut buf))
        .await
        .expect("connection was not closed in time");
    assert!(!matches!(read_result, Ok(n) if n > 0), "unexpected data from a failed tunnel");

    // Let in-flight packets settle past the maximum delivery delay.
    sleep(Duration::from_millis(400)).await;

    let client_kinds: Vec<PacketKind> = client_tr.sent_kinds().into_iter().map(|(kind, _)| kind).collect();
    assert_eq!(client_kinds, vec![PacketKind::Connect, PacketKind::Close]);

    let host_kinds: Vec<PacketKind> = host_tr.sent_kinds().into_iter().map(|(kind, _)| kind).collect();
    assert_eq!(host_kinds, vec![PacketKind::Close]);
}

/// A CLOSE for a socket id the host has never seen is silently dropped: no
/// socket is created and no reply traffic is generated.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stale_close_for_unknown_socket_is_dropped() {
    let echo_addr = start_echo_server().await;
    let (client_tr, host_tr) = MockTransport::pair();

    let host_run = Arc::clone(&host_tr);
    tokio::spawn(async move {
        tunnel::run_as_host(host_run, echo_addr).await.unwrap();
    });
    sleep(Duration::from_millis(50)).await;

    client_tr.send_close(0xDEAD_BEEF, 7).await;

    // Past the maximum delivery delay plus slack.
    sleep(Duration::from_millis(400)).await;
    assert!(host_tr.sent_kinds().is_empty(), "stale CLOSE must not provoke a response");
}

/// DATA packets delivered with sequence numbers [2, 4, 1, 3, 5] must reach
/// the local TCP connection in sequence order.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reordered_data_is_written_in_sequence_order() {
    let client_addr = free_addr().await;
    let (client_tr, host_tr) = MockTransport::pair();

    let client_run = Arc::clone(&client_tr);
    tokio::spawn(async move {
        tunnel::run_as_client(client_run, client_addr).await.unwrap();
    });

    let mut stream = connect_with_retry(client_addr).await;

    // Learn the socket id from the CONNECT the client announces.
    let socket_id = timeout(Duration::from_secs(5), async {
        loop {
            if let Some((PacketKind::Connect, id)) = client_tr.sent_kinds().first().copied() {
                return id;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("no CONNECT observed");

    for (seq_num, payload) in [(2, "b"), (4, "d"), (1, "a"), (3, "c"), (5, "e")] {
        host_tr.send_data(socket_id, seq_num, payload.as_bytes().to_vec()).await;
    }

    let mut got = [0u8; 5];
    timeout(Duration::from_secs(5), stream.read_exact(&mut got))
        .await
        .expect("data deadline")
        .expect("read");

    assert_eq!(&got, b"abcde");
}

/// Feeding DATA whose payload sum exceeds the reassembly cap while sequence
/// number 1 is withheld must terminate the socket with exactly one outbound
/// CLOSE and no write to the local TCP connection.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reassembler_overflow_closes_socket_without_writing() {
    const CHUNK_SIZE: usize = 64 * 1024 * 1024;
    const NUM_CHUNKS: u32 = 8; // 512 MiB total, past the 500 MiB cap

    let client_addr = free_addr().await;
    let (client_tr, host_tr) = MockTransport::pair();

    let client_run = Arc::clone(&client_tr);
    tokio::spawn(async move {
        tunnel::run_as_client(client_run, client_addr).await.unwrap();
    });

    let mut stream = connect_with_retry(client_addr).await;

    // Learn the socket id from the CONNECT the client announces.
    let socket_id = timeout(Duration::from_secs(5), async {
        loop {
            if let Some((PacketKind::Connect, id)) = client_tr.sent_kinds().first().copied() {
                return id;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("no CONNECT observed");

    // Sequence number 1 is withheld, so nothing ever becomes deliverable and
    // every chunk stays buffered.
    for seq_num in 2..2 + NUM_CHUNKS {
        host_tr.send_data(socket_id, seq_num, vec![0u8; CHUNK_SIZE]).await;
    }

    // The overflow must close the local connection without writing anything.
    let mut buf = [0u8; 1];
    let read_result = timeout(Duration::from_secs(10), stream.read(&mut buf))
        .await
        .expect("connection was not closed in time");
    assert!(
        !matches!(read_result, Ok(n) if n > 0),
        "no local TCP write may happen for an overflowed socket"
    );

    // Let in-flight packets settle past the maximum delivery delay.
    sleep(Duration::from_millis(400)).await;

    let client_kinds: Vec<PacketKind> = client_tr.sent_kinds().into_iter().map(|(kind, _)| kind).collect();
    assert_eq!(client_kinds, vec![PacketKind::Connect, PacketKind::Close]);
}
