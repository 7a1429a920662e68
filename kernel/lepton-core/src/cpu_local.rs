//! Minimal per-CPU storage for host-testable primitives.
//!
//! Provides [`CpuLocal`] indexed by CPU ID. On kernel targets the CPU ID
//! comes from the per-CPU hook installed at boot; on host targets the
//! default hook always returns 0 (single-threaded test assumption).

use crate::cpu::{MAX_CPUS, current_cpu_id};

/// Per-CPU storage. Wraps `[T; MAX_CPUS]`, indexed by current CPU ID.
pub struct CpuLocal<T> {
    data: [T; MAX_CPUS],
}

impl<T> CpuLocal<T> {
    /// Creates a new `CpuLocal` wrapping the given array.
    pub const fn new(data: [T; MAX_CPUS]) -> Self {
        Self { data }
    }

    /// Returns a reference to the current CPU's instance.
    ///
    /// Falls back to CPU 0's slot if the hook reports an out-of-range ID
    /// (possible during early AP boot before the per-CPU area is set up).
    pub fn get(&self) -> &T {
        let id = current_cpu_id() as usize;
        if id < MAX_CPUS {
            &self.data[id]
        } else {
            &self.data[0]
        }
    }

    /// Returns a reference to a specific CPU's instance.
    ///
    /// # Panics
    ///
    /// Panics if `cpu_id >= MAX_CPUS`.
    pub fn get_for(&self, cpu_id: u32) -> &T {
        &self.data[cpu_id as usize]
    }

    /// Iterates over every CPU slot.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.data.iter()
    }
}

// SAFETY: CpuLocal<T> is designed for per-CPU access. Send/Sync are safe
// because each CPU only accesses its own slot; cross-slot access is
// limited to types that are themselves Sync.
unsafe impl<T: Send> Send for CpuLocal<T> {}
unsafe impl<T: Send> Sync for CpuLocal<T> {}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicU32, Ordering};

    static COUNTERS: CpuLocal<AtomicU32> =
        CpuLocal::new([const { AtomicU32::new(0) }; MAX_CPUS]);

    #[test]
    fn host_defaults_to_cpu_zero() {
        COUNTERS.get().store(7, Ordering::Relaxed);
        assert_eq!(COUNTERS.get_for(0).load(Ordering::Relaxed), 7);
    }

    #[test]
    fn per_cpu_slots_are_independent() {
        COUNTERS.get_for(3).store(1, Ordering::Relaxed);
        COUNTERS.get_for(4).store(2, Ordering::Relaxed);
        assert_eq!(COUNTERS.get_for(3).load(Ordering::Relaxed), 1);
        assert_eq!(COUNTERS.get_for(4).load(Ordering::Relaxed), 2);
    }
}
