use std::sync::atomic::{AtomicU32, Ordering};

/// Hands out process-unique, non-zero ids. Safe to share across tasks.
#[derive(Debug)]
pub struct Counter(AtomicU32);

impl Counter {
    /// `start` is the first value `next` returns (zero is bumped to one).
    pub const fn new(start: u32) -> Self {
        Self(AtomicU32::new(start))
    }

    pub fn next(&self) -> u32 {
        loop {
            // zero means "no id" on the wire, so it is skipped on wrap-around
            let id = self.0.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new(1)
    }
}
