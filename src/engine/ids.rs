use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

/// Message ids taken from a free-running 32-bit nanosecond counter.
///
/// Ids are tags, not sequence numbers: they only need to be distinct among
/// the messages in flight at one time. Two calls landing on the same tick
/// (or a clock that has not moved) still get distinct values.
#[derive(Debug)]
pub struct MessageIdSource {
    origin: Instant,
    last: AtomicU32,
}

impl MessageIdSource {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            last: AtomicU32::new(0),
        }
    }

    pub fn next_id(&self) -> u32 {
        // Truncation is intended: the counter wraps like a cycle counter.
        let now = self.origin.elapsed().as_nanos() as u32;
        let mut last = self.last.load(Ordering::Relaxed);
        loop {
            let candidate = if (now.wrapping_sub(last) as i32) > 0 {
                now
            } else {
                last.wrapping_add(1)
            };
            match self
                .last
                .compare_exchange_weak(last, candidate, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return candidate,
                Err(current) => last = current,
            }
        }
    }
}

impl Default for MessageIdSource {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_ids_are_distinct_in_a_burst() {
        let ids = MessageIdSource::new();
        let burst: HashSet<u32> = (0..10_000).map(|_| ids.next_id()).collect();
        assert_eq!(burst.len(), 10_000);
    }

    #[test]
    fn test_ids_are_distinct_across_threads() {
        let ids = Arc::new(MessageIdSource::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let ids = ids.clone();
                std::thread::spawn(move || (0..1_000).map(|_| ids.next_id()).collect::<Vec<_>>())
            })
            .collect();
        let mut all = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(all.insert(id), "duplicate id {}", id);
            }
        }
    }
}
