use std::{cmp::Ordering, collections::BinaryHeap};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

use crate::protocol::Packet;

/// Per-socket cap on buffered-but-not-yet-deliverable payload bytes.
/// Exceeding it is fatal for the socket.
pub(crate) const MAX_BUFFERED_BYTES: usize = 500 * 1024 * 1024;

/// Reorders out-of-order packets within a single socket's inbound stream.
///
/// `push` and `drain` run on different tasks: `push` is called by the
/// inbox-consuming loop (a fast mutex-guarded heap insert), `drain` by the
/// TCP-writing loop. `ready` is the coalesced signal between them — at most
/// one pending notification, re-armed by every push that makes the head of
/// the stream deliverable.
pub(crate) struct Reassembler {
    state: Mutex<State>,
    notify: Notify,
    limit: usize,
}

struct State {
    expected_seq: u32,
    heap: BinaryHeap<Pending>,
    buffered_bytes: usize,
}

impl Reassembler {
    /// Creates a reassembler expecting sequence numbers starting at 1.
    pub(crate) fn new() -> Self {
        Self::with_limit(MAX_BUFFERED_BYTES)
    }

    fn with_limit(limit: usize) -> Self {
        Self {
            state: Mutex::new(State {
                expected_seq: 1,
                heap: BinaryHeap::new(),
                buffered_bytes: 0,
            }),
            notify: Notify::new(),
            limit,
        }
    }

    /// Inserts a packet into the reorder buffer. Packets below the next
    /// expected sequence number (duplicates, late arrivals) are discarded.
    /// Returns true when the buffer has exceeded its size limit; the caller
    /// must treat that as fatal and tear the socket down.
    pub(crate) fn push(&self, pkt: Packet) -> bool {
        let mut state = self.state.lock();

        if pkt.seq_num < state.expected_seq {
            debug!(
                "[{:08x}] stale packet with seq {} (expected {}), ignoring",
                pkt.socket_id, pkt.seq_num, state.expected_seq
            );
            return false;
        }

        state.buffered_bytes += pkt.payload.len();
        state.heap.push(Pending(pkt));

        let overflow = state.buffered_bytes > self.limit;

        if state.heap.peek().map(|p| p.0.seq_num) == Some(state.expected_seq) {
            self.notify.notify_one();
        }

        overflow
    }

    /// Pops every consecutive in-order packet starting at the expected
    /// sequence number. Buffered duplicates of already-delivered packets are
    /// discarded along the way, so a duplicate queued ahead of time can never
    /// wedge the stream. Returns an empty list when nothing is deliverable.
    pub(crate) fn drain(&self) -> Vec<Packet> {
        let mut state = self.state.lock();
        let mut drained = Vec::new();

        loop {
            let seq = match state.heap.peek() {
                Some(pending) => pending.0.seq_num,
                None => break,
            };

            if seq > state.expected_seq {
                break;
            }

            if let Some(pending) = state.heap.pop() {
                state.buffered_bytes -= pending.0.payload.len();
                if seq == state.expected_seq {
                    state.expected_seq += 1;
                    drained.push(pending.0);
                }
            }
        }

        drained
    }

    /// Waits until one or more packets become drainable. The signal is
    /// edge-triggered and coalesced; the caller drains to exhaustion after
    /// each wakeup.
    pub(crate) async fn ready(&self) {
        self.notify.notified().await;
    }
}

// Min-heap ordering by sequence number.
struct Pending(Packet);

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.0.seq_num == other.0.seq_num
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> Ordering {
        other.0.seq_num.cmp(&self.0.seq_num)
    }
}
