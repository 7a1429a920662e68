//! ID allocation primitives.
//!
//! [`IdAllocator`] hands out monotonically increasing ids from an atomic
//! counter (alarm ids, vnode ids). [`IdSet`] is a bitmap-backed allocator
//! with reuse (pids, file descriptors), guarded by a spin lock.

use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::sync::SpinLock;

/// A monotonically increasing id allocator. Ids are never reused.
pub struct IdAllocator {
    next: AtomicU64,
}

impl IdAllocator {
    /// Creates an allocator whose first id is `first`.
    pub const fn new(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }

    /// Allocates the next id.
    #[inline]
    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

/// A bitmap-backed id set with reuse, for dense id spaces.
pub struct IdSet {
    inner: SpinLock<IdSetInner>,
}

struct IdSetInner {
    bitmap: Vec<u64>,
    capacity: u32,
    /// Search hint: the lowest word that may contain a free bit.
    hint: usize,
}

impl IdSet {
    /// Creates a set able to hold ids `0..capacity`.
    pub fn new(capacity: u32) -> Self {
        let words = (capacity as usize).div_ceil(64);
        Self {
            inner: SpinLock::new(IdSetInner {
                bitmap: vec![0; words],
                capacity,
                hint: 0,
            }),
        }
    }

    /// Allocates the lowest free id, or `None` if the set is full.
    pub fn alloc(&self) -> Option<u32> {
        let mut inner = self.inner.lock();
        let start = inner.hint;
        let words = inner.bitmap.len();
        for i in 0..words {
            let w = (start + i) % words;
            let word = inner.bitmap[w];
            if word != u64::MAX {
                let bit = (!word).trailing_zeros();
                let id = w as u32 * 64 + bit;
                if id >= inner.capacity {
                    continue;
                }
                inner.bitmap[w] |= 1 << bit;
                inner.hint = w;
                return Some(id);
            }
        }
        None
    }

    /// Marks a specific id as allocated. Returns `false` if already taken
    /// or out of range.
    pub fn reserve(&self, id: u32) -> bool {
        let mut inner = self.inner.lock();
        if id >= inner.capacity {
            return false;
        }
        let (w, bit) = (id as usize / 64, id % 64);
        if inner.bitmap[w] & (1 << bit) != 0 {
            return false;
        }
        inner.bitmap[w] |= 1 << bit;
        true
    }

    /// Frees an id for reuse.
    ///
    /// # Panics
    ///
    /// Panics if the id was not allocated (a double free is a refcounting
    /// bug somewhere above).
    pub fn free(&self, id: u32) {
        let mut inner = self.inner.lock();
        let (w, bit) = (id as usize / 64, id % 64);
        assert!(
            inner.bitmap[w] & (1 << bit) != 0,
            "freeing unallocated id {id}"
        );
        inner.bitmap[w] &= !(1 << bit);
        if w < inner.hint {
            inner.hint = w;
        }
    }

    /// Returns `true` if the id is currently allocated.
    pub fn contains(&self, id: u32) -> bool {
        let inner = self.inner.lock();
        if id >= inner.capacity {
            return false;
        }
        inner.bitmap[id as usize / 64] & (1 << (id % 64)) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_ids() {
        let ida = IdAllocator::new(1);
        assert_eq!(ida.next(), 1);
        assert_eq!(ida.next(), 2);
        assert_eq!(ida.next(), 3);
    }

    #[test]
    fn idset_alloc_lowest_free() {
        let set = IdSet::new(128);
        assert_eq!(set.alloc(), Some(0));
        assert_eq!(set.alloc(), Some(1));
        set.free(0);
        assert_eq!(set.alloc(), Some(0));
    }

    #[test]
    fn idset_reserve_and_exhaustion() {
        let set = IdSet::new(3);
        assert!(set.reserve(2));
        assert!(!set.reserve(2));
        assert_eq!(set.alloc(), Some(0));
        assert_eq!(set.alloc(), Some(1));
        assert_eq!(set.alloc(), None);
        assert!(set.contains(2));
    }

    #[test]
    #[should_panic(expected = "freeing unallocated id")]
    fn idset_double_free_panics() {
        let set = IdSet::new(8);
        let id = set.alloc().unwrap();
        set.free(id);
        set.free(id);
    }
}
