use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    protocol::{Packet, PacketKind, MAX_PAYLOAD_SIZE},
    stats,
    tunnel::{
        reassembler::{Reassembler, MAX_BUFFERED_BYTES},
        seq::SeqGen,
        Transport,
    },
};

/// Capacity of the inbox between the dispatcher and `push_loop`. Sized so a
/// full inbox indicates a stalled socket rather than a normal burst.
const INBOX_CAPACITY: usize = 256;

/// The complete lifecycle state for one logical connection.
///
/// Up to three cooperating loops run per socket, all sharing one cancellation
/// token: `push_loop` feeds the reassembler from the inbox, the drain loop
/// (`run_host` / `run_client`) bridges in-order packets to the local TCP
/// write half, and `read_loop` frames local TCP reads as DATA packets.
pub(crate) struct Socket<T> {
    id: u32,
    token: CancellationToken,
    inbox: mpsc::Sender<Packet>,
    tr: Arc<T>,
    seq: SeqGen,
    reasm: Reassembler,
    closed: AtomicBool,
}

impl<T: Transport> Socket<T> {
    /// Creates a socket under a child of `parent`. The returned receiver is
    /// the inbox end consumed by `push_loop` and must be handed to one of the
    /// `run_*` entry points.
    pub(crate) fn new(parent: &CancellationToken, id: u32, tr: Arc<T>) -> (Arc<Self>, mpsc::Receiver<Packet>) {
        let (inbox, inbox_rx) = mpsc::channel(INBOX_CAPACITY);

        let socket = Arc::new(Self {
            id,
            token: parent.child_token(),
            inbox,
            tr,
            seq: SeqGen::new(),
            reasm: Reassembler::new(),
            closed: AtomicBool::new(false),
        });

        (socket, inbox_rx)
    }

    pub(crate) fn id(&self) -> u32 {
        self.id
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Queues an inbound packet without blocking. Returns false when the
    /// inbox is full; a packet offered to a socket that is already tearing
    /// down is swallowed so its own queued traffic can't resurrect the id.
    pub(crate) fn offer(&self, pkt: Packet) -> bool {
        match self.inbox.try_send(pkt) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => false,
            Err(mpsc::error::TrySendError::Closed(_)) => true,
        }
    }

    /// Host-side lifecycle: the first CONNECT triggers a dial to
    /// `target_addr`, after which DATA is bridged to the dialed connection
    /// until CLOSE, a TCP error, or cancellation.
    pub(crate) async fn run_host(self: Arc<Self>, inbox_rx: mpsc::Receiver<Packet>, target_addr: SocketAddr) {
        tokio::spawn(Arc::clone(&self).push_loop(inbox_rx));

        let mut tcp_write: Option<OwnedWriteHalf> = None;

        'drain: loop {
            tokio::select! {
                _ = self.reasm.ready() => {
                    for pkt in self.reasm.drain() {
                        match pkt.kind {
                            PacketKind::Connect => {
                                if tcp_write.is_some() {
                                    // Duplicate CONNECT on a connected socket.
                                    continue;
                                }

                                let stream = match TcpStream::connect(target_addr).await {
                                    Ok(stream) => stream,
                                    Err(error) => {
                                        warn!("[{:08x}] TCP dial failed: {error}", self.id);
                                        break 'drain;
                                    }
                                };

                                debug!("[{:08x}] TCP connected to {target_addr}", self.id);
                                let (tcp_read, write_half) = stream.into_split();
                                tcp_write = Some(write_half);
                                tokio::spawn(Arc::clone(&self).read_loop(tcp_read));
                            }
                            PacketKind::Data => {
                                // DATA before CONNECT cannot pass the reassembler's
                                // ordering guarantee; dropped if it ever does.
                                let writer = match tcp_write.as_mut() {
                                    Some(writer) => writer,
                                    None => continue,
                                };
                                if let Err(error) = writer.write_all(&pkt.payload).await {
                                    warn!("[{:08x}] TCP write error: {error}", self.id);
                                    break 'drain;
                                }
                            }
                            PacketKind::Close => {
                                debug!("[{:08x}] received CLOSE", self.id);
                                break 'drain;
                            }
                        }
                    }
                }
                _ = self.token.cancelled() => break,
            }
        }

        self.cleanup().await;
    }

    /// Client-side lifecycle: announces the accepted connection with a
    /// CONNECT (sequence number 1), then bridges both directions until CLOSE,
    /// a TCP error, or cancellation.
    pub(crate) async fn run_client(self: Arc<Self>, inbox_rx: mpsc::Receiver<Packet>, stream: TcpStream) {
        self.tr.send_connect(self.id, self.seq.next()).await;

        let (tcp_read, mut tcp_write) = stream.into_split();
        tokio::spawn(Arc::clone(&self).read_loop(tcp_read));
        tokio::spawn(Arc::clone(&self).push_loop(inbox_rx));

        'drain: loop {
            tokio::select! {
                _ = self.reasm.ready() => {
                    for pkt in self.reasm.drain() {
                        match pkt.kind {
                            PacketKind::Data => {
                                if let Err(error) = tcp_write.write_all(&pkt.payload).await {
                                    warn!("[{:08x}] TCP write error: {error}", self.id);
                                    break 'drain;
                                }
                            }
                            PacketKind::Close => {
                                debug!("[{:08x}] received CLOSE", self.id);
                                break 'drain;
                            }
                            PacketKind::Connect => {
                                warn!("[{:08x}] unexpected CONNECT on client socket", self.id);
                                break 'drain;
                            }
                        }
                    }
                }
                _ = self.token.cancelled() => break,
            }
        }

        self.cleanup().await;
    }

    /// Feeds the reassembler from the inbox. Runs on its own task so the push
    /// (a fast heap insert) is never blocked behind TCP writes in the drain
    /// loop.
    async fn push_loop(self: Arc<Self>, mut inbox_rx: mpsc::Receiver<Packet>) {
        loop {
            tokio::select! {
                maybe_pkt = inbox_rx.recv() => {
                    let pkt = match maybe_pkt {
                        Some(pkt) => pkt,
                        None => return,
                    };

                    if self.reasm.push(pkt) {
                        warn!(
                            "[{:08x}] reassembly buffer exceeded {} MiB, treating as disconnection",
                            self.id,
                            MAX_BUFFERED_BYTES / (1024 * 1024)
                        );
                        self.cleanup().await;
                        return;
                    }
                }
                _ = self.token.cancelled() => return,
            }
        }
    }

    /// Reads from the local TCP connection and frames every non-empty read as
    /// a DATA packet with the next sequence number. EOF ends the loop quietly.
    async fn read_loop(self: Arc<Self>, mut tcp_read: OwnedReadHalf) {
        let mut buf = vec![0u8; MAX_PAYLOAD_SIZE];

        loop {
            tokio::select! {
                result = tcp_read.read(&mut buf) => match result {
                    Ok(0) => break,
                    Ok(n) => self.tr.send_data(self.id, self.seq.next(), buf[..n].to_vec()).await,
                    Err(error) => {
                        if !self.token.is_cancelled() {
                            warn!("[{:08x}] TCP read error: {error}", self.id);
                        }
                        break;
                    }
                },
                _ = self.token.cancelled() => break,
            }
        }

        self.cleanup().await;
    }

    /// Consolidated shutdown. Whichever loop gets here first runs the side
    /// effects exactly once: cancel the token (which stops the other loops
    /// and releases both TCP halves), then notify the peer with a single
    /// CLOSE. The peer drops the CLOSE if it has already torn down.
    pub(crate) async fn cleanup(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.token.cancel();
        self.tr.send_close(self.id, self.seq.next()).await;
        stats::global().remove_conn();
        debug!("[{:08x}] socket cleanup complete", self.id);
    }
}
