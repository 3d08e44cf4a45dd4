//! Append-only storage addressed by index.
//!
//! Slots are grouped into segments of doubling size (32, 64, 128, ...), so a
//! slot never moves once written and a published index stays valid for the
//! arena's whole life. Allocation is a single `fetch_add`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;

const BASE: usize = 32;
const SEGMENTS: usize = 40;

pub(crate) struct Arena<T> {
    segments: [OnceLock<Box<[OnceLock<T>]>>; SEGMENTS],
    next: AtomicUsize,
}

/// Segment number and offset of `index`.
fn locate(index: usize) -> (usize, usize) {
    let bucket = index / BASE + 1;
    let segment = (usize::BITS - 1 - bucket.leading_zeros()) as usize;
    let offset = index - BASE * ((1 << segment) - 1);
    (segment, offset)
}

impl<T> Arena<T> {
    pub fn new() -> Self {
        Self {
            segments: std::array::from_fn(|_| OnceLock::new()),
            next: AtomicUsize::new(0),
        }
    }

    /// Store `value` and return its index.
    ///
    /// # Panics
    ///
    /// When every segment is full (about 3.5e13 slots).
    pub fn push(&self, value: T) -> usize {
        let index = self.next.fetch_add(1, Ordering::Relaxed);
        let (segment, offset) = locate(index);
        assert!(segment < SEGMENTS, "arena capacity exhausted");

        let slots = self.segments[segment].get_or_init(|| {
            (0..BASE << segment)
                .map(|_| OnceLock::new())
                .collect::<Vec<_>>()
                .into_boxed_slice()
        });
        // Each index is handed out once, so the slot is always empty here.
        let _ = slots[offset].set(value);
        index
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        let (segment, offset) = locate(index);
        self.segments.get(segment)?.get()?.get(offset)?.get()
    }

    /// Number of indices handed out so far.
    pub fn len(&self) -> usize {
        self.next.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn segment_boundaries() {
        assert_eq!(locate(0), (0, 0));
        assert_eq!(locate(31), (0, 31));
        assert_eq!(locate(32), (1, 0));
        assert_eq!(locate(95), (1, 63));
        assert_eq!(locate(96), (2, 0));
        assert_eq!(locate(223), (2, 127));
        assert_eq!(locate(224), (3, 0));
    }

    #[test]
    fn values_stay_put_across_segments() {
        let arena = Arena::new();
        for i in 0..1_000usize {
            assert_eq!(arena.push(i * 3), i);
        }
        assert_eq!(arena.len(), 1_000);
        for i in 0..1_000usize {
            assert_eq!(arena.get(i), Some(&(i * 3)));
        }
        assert_eq!(arena.get(1_000), None);
    }

    #[test]
    fn concurrent_pushes_get_distinct_indices() {
        let arena = Arc::new(Arena::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let arena = Arc::clone(&arena);
                std::thread::spawn(move || {
                    (0..500).map(|i| arena.push(t * 1_000 + i)).collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all: Vec<usize> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 4_000);
    }
}
