//! Process-wide traffic and connection counters with a periodic reporter.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use tokio_util::sync::CancellationToken;
use tracing::info;

/// Interval between stats reports.
const REPORT_INTERVAL: Duration = Duration::from_secs(10);

/// Cumulative counters since process start.
pub struct Stats {
    total_conns: AtomicU64,
    closed_conns: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_recv: AtomicU64,
}

static STATS: Stats = Stats {
    total_conns: AtomicU64::new(0),
    closed_conns: AtomicU64::new(0),
    bytes_sent: AtomicU64::new(0),
    bytes_recv: AtomicU64::new(0),
};

/// Returns the process-wide counter set.
pub fn global() -> &'static Stats {
    &STATS
}

impl Stats {
    pub fn add_conn(&self) {
        self.total_conns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn remove_conn(&self) {
        self.closed_conns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_sent(&self, n: usize) {
        self.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn add_recv(&self, n: usize) {
        self.bytes_recv.fetch_add(n as u64, Ordering::Relaxed);
    }
}

/// Starts a task that logs a traffic summary every 10 seconds while there is
/// activity. Stops when `token` fires.
pub fn start_reporter(token: CancellationToken) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(REPORT_INTERVAL);
        // The first tick completes immediately; skip it.
        ticker.tick().await;

        let (mut prev_sent, mut prev_recv, mut prev_total, mut prev_closed) = (0u64, 0u64, 0u64, 0u64);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let total = STATS.total_conns.load(Ordering::Relaxed);
                    let closed = STATS.closed_conns.load(Ordering::Relaxed);
                    let sent = STATS.bytes_sent.load(Ordering::Relaxed);
                    let recv = STATS.bytes_recv.load(Ordering::Relaxed);

                    let sent_rate = (sent - prev_sent) as f64 / REPORT_INTERVAL.as_secs_f64();
                    let recv_rate = (recv - prev_recv) as f64 / REPORT_INTERVAL.as_secs_f64();
                    let opened = total - prev_total;
                    let ended = closed - prev_closed;

                    if opened > 0 || ended > 0 || sent_rate > 10.0 || recv_rate > 10.0 {
                        info!(
                            "In: {}/s | Out: {}/s | Conn: {opened:2}↑ {ended:2}↓",
                            format_bytes(sent_rate),
                            format_bytes(recv_rate),
                        );
                    }

                    prev_sent = sent;
                    prev_recv = recv;
                    prev_total = total;
                    prev_closed = closed;
                }
                _ = token.cancelled() => return,
            }
        }
    });
}

const BYTE_UNITS: [&str; 6] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB"];

/// Formats a byte count into a fixed-width (8 character) human-readable
/// string, e.g. `"99.0   B"`, `" 1.5 KiB"`.
fn format_bytes(mut value: f64) -> String {
    let mut unit = 0;

    // Stay under three integer digits so the width never exceeds 8 chars.
    while value > 99.0 && unit < BYTE_UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    format!("{value:4.1} {:>3}", BYTE_UNITS[unit])
}
