//! Adapts a QUIC connection to the typed packet channel the tunnel core
//! consumes.
//!
//! Each protocol packet rides in its own unidirectional stream, giving the
//! core the unordered, message-oriented transport it is written against. The
//! wrapper owns the single-writer sender with its backpressure state, a
//! receive loop that decodes inbound streams, and the session token that
//! fires when the connection closes.

mod sender;

use std::sync::Arc;

use quinn::{Connection, VarInt};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    protocol::{Packet, HEADER_SIZE, MAX_PAYLOAD_SIZE},
    stats, tunnel,
};
use sender::{FlowControl, Sender};

/// Upper bound for a single inbound transport message.
const MAX_PACKET_SIZE: usize = HEADER_SIZE + MAX_PAYLOAD_SIZE;

/// The shared end-to-end channel between the two peers.
pub struct Transport {
    conn: Connection,
    sender: Sender,
    token: CancellationToken,
    // Keeps the sender's open gate alive for the session's lifetime.
    _open: watch::Sender<bool>,
}

impl Transport {
    /// Wraps an established connection. The returned transport is alive until
    /// the connection closes or `parent` is cancelled.
    pub fn new(conn: Connection, parent: &CancellationToken) -> Arc<Self> {
        let token = parent.child_token();

        // The connection is handed over already established, so the open gate
        // starts released.
        let (open, open_rx) = watch::channel(true);

        let flow = Arc::new(FlowControl::new());
        let sender = Sender::new(conn.clone(), token.clone(), open_rx, flow);

        let closed_conn = conn.clone();
        let closed_token = token.clone();
        tokio::spawn(async move {
            let reason = closed_conn.closed().await;
            debug!("transport closed: {reason}");
            closed_token.cancel();
        });

        Arc::new(Self {
            conn,
            sender,
            token,
            _open: open,
        })
    }

    /// Returns the session token, cancelled when the transport has closed or
    /// failed.
    pub fn done(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Closes the connection and ends the session.
    pub fn close(&self) {
        self.token.cancel();
        self.conn.close(VarInt::from_u32(0), b"tunnel closed");
    }
}

impl tunnel::Transport for Transport {
    async fn send_connect(&self, socket_id: u32, seq_num: u32) {
        self.sender.send(&self.token, Packet::connect(socket_id, seq_num)).await;
    }

    async fn send_data(&self, socket_id: u32, seq_num: u32, payload: Vec<u8>) {
        self.sender.send(&self.token, Packet::data(socket_id, seq_num, payload)).await;
    }

    async fn send_close(&self, socket_id: u32, seq_num: u32) {
        self.sender.send(&self.token, Packet::close(socket_id, seq_num)).await;
    }

    fn on_packet(&self, handler: Arc<dyn Fn(Packet) + Send + Sync>) {
        let conn = self.conn.clone();
        let token = self.token.clone();

        tokio::spawn(async move {
            loop {
                let mut stream = tokio::select! {
                    result = conn.accept_uni() => match result {
                        Ok(stream) => stream,
                        Err(error) => {
                            debug!("transport receive ended: {error}");
                            token.cancel();
                            return;
                        }
                    },
                    _ = token.cancelled() => return,
                };

                // Streams can finish out of order; read each one on its own
                // task so a stalled message never blocks the others.
                let handler = Arc::clone(&handler);
                tokio::spawn(async move {
                    let data = match stream.read_to_end(MAX_PACKET_SIZE).await {
                        Ok(data) => data,
                        Err(error) => {
                            debug!("failed to read transport message: {error}");
                            return;
                        }
                    };

                    match Packet::decode(&data) {
                        Ok(pkt) => {
                            stats::global().add_recv(data.len());
                            handler(pkt);
                        }
                        Err(error) => warn!("failed to decode inbound packet: {error}"),
                    }
                });
            }
        });
    }

    fn done(&self) -> CancellationToken {
        self.token.clone()
    }
}
