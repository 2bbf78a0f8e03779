use std::sync::atomic::{AtomicU32, Ordering};

/// Per-socket sequence number generator. It is shared between the TCP read
/// loop (outbound DATA) and the cleanup path (outbound CLOSE), so advancing
/// it must be atomic.
pub(crate) struct SeqGen {
    val: AtomicU32,
}

impl SeqGen {
    pub(crate) const fn new() -> Self {
        Self { val: AtomicU32::new(0) }
    }

    /// Returns the next sequence number, monotonically increasing from 1.
    pub(crate) fn next(&self) -> u32 {
        self.val.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn starts_at_one_and_increases() {
        let seq = SeqGen::new();
        assert_eq!(seq.next(), 1);
        assert_eq!(seq.next(), 2);
        assert_eq!(seq.next(), 3);
    }

    #[test]
    fn concurrent_callers_never_repeat() {
        let seq = Arc::new(SeqGen::new());

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let seq = Arc::clone(&seq);
                std::thread::spawn(move || (0..1000).map(|_| seq.next()).collect::<Vec<u32>>())
            })
            .collect();

        let mut all: Vec<u32> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        all.sort_unstable();
        let expected: Vec<u32> = (1..=4000).collect();
        assert_eq!(all, expected);
    }
}
