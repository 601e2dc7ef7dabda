//! Correlation identifiers: one process-wide monotone counter shared by RPC
//! seqnos, stream indices, and validator handshakes.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct SeqGen(AtomicU64);

impl SeqGen {
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Returns the next identifier. Safe to call from any number of tasks.
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn starts_at_zero_and_increments() {
        let seq = SeqGen::new();
        assert_eq!(seq.next(), 0);
        assert_eq!(seq.next(), 1);
        assert_eq!(seq.next(), 2);
    }

    #[test]
    fn concurrent_takers_never_collide() {
        let seq = Arc::new(SeqGen::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let seq = seq.clone();
            handles.push(std::thread::spawn(move || {
                (0..1000).map(|_| seq.next()).collect::<Vec<_>>()
            }));
        }
        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|handle| handle.join().unwrap())
            .collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 8 * 1000);
        assert_eq!(*all.last().unwrap(), 8 * 1000 - 1);
    }
}
