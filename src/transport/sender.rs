use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use quinn::Connection;
use tokio::sync::{mpsc, watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::{protocol::Packet, stats};

/// Pause submitting when outstanding bytes exceed this.
const HIGH_WATER_MARK: usize = 256 * 1024;

/// Resume submitting once outstanding bytes drop below this.
const LOW_WATER_MARK: usize = 64 * 1024;

/// Outgoing packet queue capacity.
const SEND_QUEUE_SIZE: usize = 64;

/// Tracks bytes handed to the connection but not yet fully written, standing
/// in for the buffered-amount counter the transport itself does not expose.
/// The low-water signal is coalesced: crossing below the mark stores at most
/// one pending notification.
pub(super) struct FlowControl {
    outstanding: AtomicUsize,
    low_water: Notify,
}

impl FlowControl {
    pub(super) fn new() -> Self {
        Self {
            outstanding: AtomicUsize::new(0),
            low_water: Notify::new(),
        }
    }

    fn buffered_amount(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    fn add(&self, n: usize) {
        self.outstanding.fetch_add(n, Ordering::AcqRel);
    }

    fn sub(&self, n: usize) {
        let before = self.outstanding.fetch_sub(n, Ordering::AcqRel);
        if before >= LOW_WATER_MARK && before - n < LOW_WATER_MARK {
            self.low_water.notify_one();
        }
    }

    async fn below_low_water(&self) {
        self.low_water.notified().await;
    }
}

/// The single writer serializing all outbound packets onto the shared
/// connection, with an open gate and high/low-water backpressure. All sockets
/// share one sender; fairness is the FIFO order of its queue.
pub(super) struct Sender {
    queue: mpsc::Sender<Packet>,
}

impl Sender {
    /// Wires the backpressure state and starts the writer task. The task
    /// exits when `token` is cancelled or a submission fails.
    pub(super) fn new(
        conn: Connection,
        token: CancellationToken,
        open: watch::Receiver<bool>,
        flow: Arc<FlowControl>,
    ) -> Self {
        let (queue, queue_rx) = mpsc::channel(SEND_QUEUE_SIZE);
        tokio::spawn(run(conn, token, open, flow, queue_rx));
        Self { queue }
    }

    /// Enqueues a packet for transmission. Blocks while the queue is full and
    /// gives up silently once the session is over.
    pub(super) async fn send(&self, token: &CancellationToken, pkt: Packet) {
        tokio::select! {
            result = self.queue.send(pkt) => {
                // A dropped receiver means the writer has already exited.
                let _ = result;
            }
            _ = token.cancelled() => {}
        }
    }
}

async fn run(
    conn: Connection,
    token: CancellationToken,
    mut open: watch::Receiver<bool>,
    flow: Arc<FlowControl>,
    mut queue_rx: mpsc::Receiver<Packet>,
) {
    // Phase 1: wait until the channel can carry payload.
    loop {
        if *open.borrow() {
            break;
        }
        tokio::select! {
            changed = open.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            _ = token.cancelled() => return,
        }
    }

    // Write completions come back from the per-packet stream tasks; any send
    // failure is fatal for the session, the transport is unrecoverable at
    // that point.
    let (fail_tx, mut fail_rx) = mpsc::unbounded_channel::<()>();

    // Phase 2: drain the queue with backpressure.
    loop {
        let pkt = tokio::select! {
            maybe_pkt = queue_rx.recv() => match maybe_pkt {
                Some(pkt) => pkt,
                None => return,
            },
            _ = fail_rx.recv() => {
                token.cancel();
                return;
            }
            _ = token.cancelled() => return,
        };

        if flow.buffered_amount() > HIGH_WATER_MARK {
            tokio::select! {
                _ = flow.below_low_water() => {}
                _ = fail_rx.recv() => {
                    token.cancel();
                    return;
                }
                _ = token.cancelled() => return,
            }
        }

        let data = pkt.encode();

        // One unidirectional stream per packet keeps the channel
        // message-oriented; delivery order across streams is not preserved.
        let stream = match conn.open_uni().await {
            Ok(stream) => stream,
            Err(error) => {
                error!(
                    "failed to submit packet (socket id {:08x}, kind {:?}): {error}",
                    pkt.socket_id, pkt.kind
                );
                token.cancel();
                return;
            }
        };

        let socket_id = pkt.socket_id;
        let kind = pkt.kind;
        let len = data.len();
        flow.add(len);

        let task_flow = Arc::clone(&flow);
        let task_fail_tx = fail_tx.clone();
        tokio::spawn(async move {
            match write_packet(stream, data).await {
                Ok(()) => stats::global().add_sent(len),
                Err(error) => {
                    error!("failed to submit packet (socket id {socket_id:08x}, kind {kind:?}): {error}");
                    let _ = task_fail_tx.send(());
                }
            }
            task_flow.sub(len);
        });
    }
}

async fn write_packet(mut stream: quinn::SendStream, data: Vec<u8>) -> Result<(), quinn::WriteError> {
    stream.write_all(&data).await?;
    stream.finish().await
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn low_water_fires_only_on_downward_crossing() {
        let flow = FlowControl::new();

        flow.add(LOW_WATER_MARK + 1000);
        flow.sub(500);

        // Still above the mark: no notification may be stored.
        let waited = tokio::time::timeout(Duration::from_millis(50), flow.below_low_water()).await;
        assert!(waited.is_err());

        // Crossing below stores exactly one notification.
        flow.sub(1000);
        tokio::time::timeout(Duration::from_millis(50), flow.below_low_water())
            .await
            .expect("low-water notification missing");

        let waited = tokio::time::timeout(Duration::from_millis(50), flow.below_low_water()).await;
        assert!(waited.is_err(), "notification must be coalesced, not repeated");
    }

    #[test]
    fn buffered_amount_tracks_outstanding_bytes() {
        let flow = FlowControl::new();
        assert_eq!(flow.buffered_amount(), 0);

        flow.add(4096);
        flow.add(1024);
        assert_eq!(flow.buffered_amount(), 5120);

        flow.sub(4096);
        assert_eq!(flow.buffered_amount(), 1024);
    }
}

