//! Slab-backed object pool allocator with per-CPU caches.
//!
//! A [`Pool`] owns an ordered list of size classes. Each class keeps
//! full/partial/empty slab lists behind a short mutex and a pair of
//! per-CPU caches (loaded + previous) for lockless hot-path allocation,
//! refilled from a bounded reserve of full caches.
//!
//! Allocation order: loaded cache → previous cache (exchange) → reserve →
//! slab backend (partial → empty → new slab). Free order mirrors it:
//! loaded → previous → retire the full loaded cache to the reserve →
//! slab backend.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;
use lepton_core::cpu::{self, MAX_CPUS};
use lepton_core::cpu_local::CpuLocal;
use lepton_core::sync::{Mutex, SpinLock};
use lepton_core::{kerror, kwarn};

use crate::page::{PAGE_SIZE, PageRegion};

bitflags! {
    /// Pool behavior flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PoolFlags: u32 {
        /// Disable the per-CPU cache layer; every operation goes to the
        /// slab backend.
        const NOCACHE = 1 << 0;
        /// Skip statistics counters.
        const NOSTATS = 1 << 1;
        /// Do not preallocate an initial slab per size class.
        const LAZY = 1 << 2;
    }
}

/// Upper bound on size classes per pool.
pub const MAX_SIZE_CLASSES: usize = 64;
/// Default per-CPU cache capacity (objects).
pub const DEFAULT_CACHE_CAPACITY: usize = 64;
/// Default cap on reserve caches per size class.
pub const DEFAULT_RESERVE_MAX: usize = 16;

/// Snapshot of a pool's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Successful allocations.
    pub allocs: u64,
    /// Frees.
    pub frees: u64,
    /// Allocations served by a per-CPU cache.
    pub cache_allocs: u64,
    /// Frees absorbed by a per-CPU cache.
    pub cache_frees: u64,
    /// Slabs created.
    pub slab_creates: u64,
    /// Slabs destroyed.
    pub slab_destroys: u64,
}

// ---------------------------------------------------------------------------
// Slab
// ---------------------------------------------------------------------------

/// A contiguous run of pages carved into same-sized objects.
///
/// Free objects form an intrusive freelist threaded through their first
/// word; the bitmap tracks allocation so `free_count` can be cross-checked
/// against the popcount.
struct Slab {
    region: PageRegion,
    obj_size: usize,
    obj_count: u32,
    free_count: u32,
    freelist: *mut u8,
    bitmap: Vec<u64>,
}

// SAFETY: Slab owns its region; the raw freelist pointers only reference
// memory inside it and are only touched under the class lock.
unsafe impl Send for Slab {}

impl Slab {
    fn new(pages: usize, obj_size: usize) -> Option<Box<Slab>> {
        debug_assert!(obj_size >= core::mem::size_of::<*mut u8>());
        let region = PageRegion::alloc(pages)?;
        let obj_count = (region.len() / obj_size) as u32;
        let base = region.as_ptr();

        // Thread the freelist front-to-back so allocation order matches
        // memory order.
        let mut freelist: *mut u8 = core::ptr::null_mut();
        for i in (0..obj_count).rev() {
            // SAFETY: every object slot lies inside the region and is at
            // least pointer-sized.
            unsafe {
                let obj = base.add(i as usize * obj_size);
                (obj as *mut *mut u8).write(freelist);
                freelist = obj;
            }
        }

        let words = (obj_count as usize).div_ceil(64);
        Some(Box::new(Slab {
            region,
            obj_size,
            obj_count,
            free_count: obj_count,
            freelist,
            bitmap: alloc::vec![0u64; words],
        }))
    }

    #[inline]
    fn contains(&self, addr: usize) -> bool {
        self.region.contains(addr)
    }

    #[inline]
    fn index_of(&self, ptr: *mut u8) -> usize {
        (ptr as usize - self.region.base()) / self.obj_size
    }

    #[inline]
    fn bitmap_get(&self, idx: usize) -> bool {
        self.bitmap[idx / 64] >> (idx % 64) & 1 != 0
    }

    fn alloc(&mut self) -> Option<NonNull<u8>> {
        let obj = NonNull::new(self.freelist)?;
        // SAFETY: a non-null freelist head is a free object whose first
        // word holds the next pointer.
        self.freelist = unsafe { (obj.as_ptr() as *mut *mut u8).read() };
        self.free_count -= 1;

        let idx = self.index_of(obj.as_ptr());
        debug_assert!(!self.bitmap_get(idx));
        self.bitmap[idx / 64] |= 1 << (idx % 64);
        Some(obj)
    }

    fn free(&mut self, ptr: *mut u8) {
        let idx = self.index_of(ptr);
        assert!(self.bitmap_get(idx), "pool: double free of object {ptr:p}");
        self.bitmap[idx / 64] &= !(1 << (idx % 64));

        // SAFETY: the object belongs to this slab and is being returned,
        // so its first word is ours to reuse as the freelist link.
        unsafe { (ptr as *mut *mut u8).write(self.freelist) };
        self.freelist = ptr;
        self.free_count += 1;
    }

    #[cfg(test)]
    fn bitmap_popcount(&self) -> u32 {
        self.bitmap.iter().map(|w| w.count_ones()).sum()
    }
}

// ---------------------------------------------------------------------------
// Per-CPU caches
// ---------------------------------------------------------------------------

/// A bounded LIFO of free object pointers owned by one CPU.
struct PoolCache {
    objects: Vec<*mut u8>,
    capacity: usize,
}

// SAFETY: cached pointers reference pool-owned slab memory; the cache is
// only accessed under its CPU slot's lock.
unsafe impl Send for PoolCache {}

impl PoolCache {
    fn new(capacity: usize) -> Self {
        Self {
            objects: Vec::with_capacity(capacity),
            capacity,
        }
    }

    #[inline]
    fn get(&mut self) -> Option<*mut u8> {
        self.objects.pop()
    }

    #[inline]
    fn put(&mut self, obj: *mut u8) -> bool {
        if self.objects.len() >= self.capacity {
            return false;
        }
        self.objects.push(obj);
        true
    }

    #[inline]
    fn len(&self) -> usize {
        self.objects.len()
    }

    #[inline]
    fn is_full(&self) -> bool {
        self.objects.len() >= self.capacity
    }
}

#[derive(Default)]
struct CpuCaches {
    loaded: Option<PoolCache>,
    prev: Option<PoolCache>,
}

// ---------------------------------------------------------------------------
// Size class
// ---------------------------------------------------------------------------

struct ClassBackend {
    full: Vec<Box<Slab>>,
    partial: Vec<Box<Slab>>,
    empty: Vec<Box<Slab>>,
    reserve_full: Vec<PoolCache>,
    reserve_empty: Vec<PoolCache>,
    reserve_count: usize,
}

struct SizeClass {
    obj_size: usize,
    slab_pages: usize,
    backend: Mutex<ClassBackend>,
    cpu: CpuLocal<SpinLock<CpuCaches>>,
    allocs: AtomicU64,
    frees: AtomicU64,
    cache_allocs: AtomicU64,
    cache_frees: AtomicU64,
}

impl SizeClass {
    fn new(obj_size: usize) -> Self {
        Self {
            obj_size,
            slab_pages: calc_slab_pages(obj_size),
            backend: Mutex::new(ClassBackend {
                full: Vec::new(),
                partial: Vec::new(),
                empty: Vec::new(),
                reserve_full: Vec::new(),
                reserve_empty: Vec::new(),
                reserve_count: 0,
            }),
            cpu: CpuLocal::new(
                [const {
                    SpinLock::new(CpuCaches {
                        loaded: None,
                        prev: None,
                    })
                }; MAX_CPUS],
            ),
            allocs: AtomicU64::new(0),
            frees: AtomicU64::new(0),
            cache_allocs: AtomicU64::new(0),
            cache_frees: AtomicU64::new(0),
        }
    }
}

/// Slab size heuristic: small objects share a page, large objects get up
/// to 32 pages (128 KiB).
fn calc_slab_pages(obj_size: usize) -> usize {
    match obj_size {
        0..=64 => 1,
        65..=256 => 2,
        257..=1024 => 4,
        1025..=4096 => 8,
        4097..=16384 => 16,
        _ => 32,
    }
}

const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

// ---------------------------------------------------------------------------
// Pool
// ---------------------------------------------------------------------------

/// A fixed-size-class object pool.
pub struct Pool {
    name: &'static str,
    flags: PoolFlags,
    cache_capacity: usize,
    reserve_max: usize,
    classes: Vec<SizeClass>,
    allocs: AtomicU64,
    frees: AtomicU64,
    slab_creates: AtomicU64,
    slab_destroys: AtomicU64,
}

// SAFETY: all interior raw pointers are guarded by the class backend
// mutex or a per-CPU cache lock.
unsafe impl Send for Pool {}
unsafe impl Sync for Pool {}

impl Pool {
    /// Creates a pool with default tuning (8-byte alignment, cache
    /// capacity 64, reserve max 16).
    pub fn new(name: &'static str, sizes: &[usize], flags: PoolFlags) -> Option<Pool> {
        Self::with_tuning(
            name,
            sizes,
            flags,
            0,
            DEFAULT_CACHE_CAPACITY,
            DEFAULT_RESERVE_MAX,
        )
    }

    /// Creates a pool with explicit tuning.
    ///
    /// `alignment` of 0 means the default of 8 bytes. Object sizes are
    /// rounded up to the alignment; duplicate or zero entries and more
    /// than [`MAX_SIZE_CLASSES`] classes are rejected.
    pub fn with_tuning(
        name: &'static str,
        sizes: &[usize],
        flags: PoolFlags,
        alignment: usize,
        cache_capacity: usize,
        reserve_max: usize,
    ) -> Option<Pool> {
        if sizes.is_empty() || sizes.len() > MAX_SIZE_CLASSES {
            kerror!("pool: invalid number of size classes: {}", sizes.len());
            return None;
        }
        let alignment = if alignment == 0 { 8 } else { alignment };
        if !alignment.is_power_of_two() || alignment > PAGE_SIZE {
            kerror!("pool: invalid alignment: {alignment}");
            return None;
        }

        let mut classes: Vec<SizeClass> = Vec::with_capacity(sizes.len());
        for &size in sizes {
            if size == 0 {
                kerror!("pool '{name}': zero-sized class");
                return None;
            }
            let obj_size = align_up(size, alignment).max(8);
            classes.push(SizeClass::new(obj_size));
        }
        classes.sort_by_key(|c| c.obj_size);
        classes.dedup_by_key(|c| c.obj_size);

        let pool = Pool {
            name,
            flags,
            cache_capacity,
            reserve_max,
            classes,
            allocs: AtomicU64::new(0),
            frees: AtomicU64::new(0),
            slab_creates: AtomicU64::new(0),
            slab_destroys: AtomicU64::new(0),
        };

        if !flags.contains(PoolFlags::LAZY) {
            for class in &pool.classes {
                if let Some(slab) = Slab::new(class.slab_pages, class.obj_size) {
                    class.backend.lock().empty.push(slab);
                    pool.count(&pool.slab_creates);
                }
            }
        }

        Some(pool)
    }

    /// Returns the pool's name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[inline]
    fn count(&self, counter: &AtomicU64) {
        if !self.flags.contains(PoolFlags::NOSTATS) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn class_for(&self, size: usize) -> Option<&SizeClass> {
        self.classes.iter().find(|c| c.obj_size >= size)
    }

    /// Allocates an object of at least `size` bytes.
    ///
    /// Returns `None` if no size class fits or the backend is out of
    /// memory.
    pub fn alloc(&self, size: usize) -> Option<NonNull<u8>> {
        let class = match self.class_for(size) {
            Some(c) => c,
            None => {
                kerror!("pool '{}': invalid allocation size: {size}", self.name);
                return None;
            }
        };

        if !self.flags.contains(PoolFlags::NOCACHE) {
            if let Some(obj) = self.cache_alloc(class) {
                self.count(&self.allocs);
                return Some(obj);
            }
        }

        let obj = self.backend_alloc(class)?;
        self.count(&self.allocs);
        Some(obj)
    }

    /// Returns an object to the pool.
    ///
    /// A pointer not owned by any slab is logged and dropped.
    pub fn free(&self, obj: NonNull<u8>) {
        let class = match self.find_obj_class(obj.as_ptr()) {
            Some(c) => c,
            None => {
                kerror!(
                    "pool '{}': object {:p} not found in any size class",
                    self.name,
                    obj.as_ptr()
                );
                return;
            }
        };

        if !self.flags.contains(PoolFlags::NOCACHE) && self.cache_free(class, obj.as_ptr()) {
            self.count(&self.frees);
            return;
        }

        self.backend_free(class, obj.as_ptr());
        self.count(&self.frees);
    }

    // -- per-CPU cache paths --------------------------------------------

    fn cache_alloc(&self, class: &SizeClass) -> Option<NonNull<u8>> {
        cpu::critical_enter();
        let obj = self.cache_alloc_inner(class);
        cpu::critical_exit();
        obj
    }

    fn cache_alloc_inner(&self, class: &SizeClass) -> Option<NonNull<u8>> {
        // Loaded, then exchange with previous.
        {
            let mut slot = class.cpu.get().lock();
            if let Some(loaded) = slot.loaded.as_mut() {
                if let Some(obj) = loaded.get() {
                    self.count(&class.cache_allocs);
                    return NonNull::new(obj);
                }
            }
            if slot.prev.as_ref().is_some_and(|p| p.len() > 0) {
                let caches = &mut *slot;
                core::mem::swap(&mut caches.loaded, &mut caches.prev);
                let obj = slot.loaded.as_mut().and_then(|c| c.get());
                if let Some(obj) = obj {
                    self.count(&class.cache_allocs);
                    return NonNull::new(obj);
                }
            }
        }

        // Pull a full cache from the reserve.
        let full = {
            let mut backend = class.backend.lock();
            match backend.reserve_full.pop() {
                Some(c) => {
                    backend.reserve_count -= 1;
                    c
                }
                None => return None,
            }
        };

        let (obj, retired) = {
            let mut slot = class.cpu.get().lock();
            let mut full = full;
            let obj = full.get();
            let retired = slot.loaded.replace(full);
            (obj, retired)
        };

        // Retire the exhausted loaded cache into the empty reserve.
        if let Some(retired) = retired {
            if retired.len() == 0 {
                let mut backend = class.backend.lock();
                if backend.reserve_count < self.reserve_max {
                    backend.reserve_empty.push(retired);
                    backend.reserve_count += 1;
                }
            } else {
                // Still held objects (racing free); spill them to the backend.
                let mut retired = retired;
                while let Some(o) = retired.get() {
                    self.backend_free(class, o);
                }
            }
        }

        if obj.is_some() {
            self.count(&class.cache_allocs);
        }
        obj.and_then(NonNull::new)
    }

    fn cache_free(&self, class: &SizeClass, obj: *mut u8) -> bool {
        cpu::critical_enter();
        let absorbed = self.cache_free_inner(class, obj);
        cpu::critical_exit();
        absorbed
    }

    fn cache_free_inner(&self, class: &SizeClass, obj: *mut u8) -> bool {
        // Fast path: room in loaded or previous.
        let loaded_full = {
            let mut slot = class.cpu.get().lock();
            if let Some(loaded) = slot.loaded.as_mut() {
                if loaded.put(obj) {
                    self.count(&class.cache_frees);
                    return true;
                }
            }
            if let Some(prev) = slot.prev.as_mut() {
                if prev.put(obj) {
                    self.count(&class.cache_frees);
                    return true;
                }
            }
            slot.loaded.as_ref().is_some_and(|c| c.is_full())
        };

        if !loaded_full {
            return false;
        }

        // Loaded is full: retire it to the reserve and install an empty
        // cache in its place.
        let retired = class.cpu.get().lock().loaded.take();
        let Some(retired) = retired else {
            return false;
        };

        let empty = {
            let mut backend = class.backend.lock();
            if backend.reserve_count >= self.reserve_max {
                // No room: put loaded back and fall through to the backend.
                drop(backend);
                let mut slot = class.cpu.get().lock();
                if slot.loaded.is_none() {
                    slot.loaded = Some(retired);
                } else {
                    // Another free installed a cache meanwhile; spill.
                    drop(slot);
                    let mut retired = retired;
                    while let Some(o) = retired.get() {
                        self.backend_free(class, o);
                    }
                }
                return false;
            }
            backend.reserve_full.push(retired);
            backend.reserve_count += 1;
            match backend.reserve_empty.pop() {
                Some(c) => {
                    backend.reserve_count -= 1;
                    Some(c)
                }
                None => None,
            }
        };

        let mut fresh = empty.unwrap_or_else(|| PoolCache::new(self.cache_capacity));
        fresh.put(obj);
        class.cpu.get().lock().loaded = Some(fresh);
        self.count(&class.cache_frees);
        true
    }

    // -- slab backend ----------------------------------------------------

    fn backend_alloc(&self, class: &SizeClass) -> Option<NonNull<u8>> {
        {
            let mut backend = class.backend.lock();
            if let Some(mut slab) = backend.partial.pop() {
                let obj = slab.alloc().expect("partial slab has free objects");
                if slab.free_count == 0 {
                    backend.full.push(slab);
                } else {
                    backend.partial.push(slab);
                }
                self.count(&class.allocs);
                return Some(obj);
            }
            if let Some(mut slab) = backend.empty.pop() {
                let obj = slab.alloc().expect("empty slab has free objects");
                backend.partial.push(slab);
                self.count(&class.allocs);
                return Some(obj);
            }
        }

        // Grow: create a slab outside the lock.
        let mut slab = Slab::new(class.slab_pages, class.obj_size)?;
        self.count(&self.slab_creates);
        let obj = slab.alloc().expect("new slab has free objects");

        let mut backend = class.backend.lock();
        backend.partial.push(slab);
        self.count(&class.allocs);
        Some(obj)
    }

    fn backend_free(&self, class: &SizeClass, obj: *mut u8) {
        let mut backend = class.backend.lock();
        let addr = obj as usize;

        if let Some(pos) = backend.full.iter().position(|s| s.contains(addr)) {
            let mut slab = backend.full.remove(pos);
            slab.free(obj);
            backend.partial.push(slab);
        } else if let Some(pos) = backend.partial.iter().position(|s| s.contains(addr)) {
            let mut slab = backend.partial.remove(pos);
            slab.free(obj);
            if slab.free_count == slab.obj_count {
                backend.empty.push(slab);
            } else {
                backend.partial.push(slab);
            }
        } else {
            kerror!("pool '{}': object {obj:p} not found in any slab", self.name);
            return;
        }

        self.count(&class.frees);
    }

    fn find_obj_class(&self, obj: *mut u8) -> Option<&SizeClass> {
        let addr = obj as usize;
        self.classes.iter().find(|class| {
            let backend = class.backend.lock();
            backend
                .full
                .iter()
                .chain(backend.partial.iter())
                .any(|s| s.contains(addr))
        })
    }

    // -- tuning ----------------------------------------------------------

    /// Fills one reserve cache of the matching size class with `count`
    /// backend objects. Returns the number preloaded (0 on any
    /// precondition failure).
    pub fn preload_cache(&self, size: usize, count: usize) -> usize {
        if self.flags.contains(PoolFlags::NOCACHE) {
            return 0;
        }
        if count > self.cache_capacity {
            kwarn!(
                "pool '{}': preload count {count} exceeds cache capacity {}",
                self.name,
                self.cache_capacity
            );
            return 0;
        }
        let Some(class) = self.class_for(size) else {
            kwarn!("pool '{}': invalid preload size: {size}", self.name);
            return 0;
        };

        if class.backend.lock().reserve_count >= self.reserve_max {
            return 0;
        }

        let mut cache = PoolCache::new(self.cache_capacity);
        let mut preloaded = 0;
        for _ in 0..count {
            match self.backend_alloc(class) {
                Some(obj) => {
                    cache.put(obj.as_ptr());
                    preloaded += 1;
                }
                None => break,
            }
        }
        if preloaded == 0 {
            return 0;
        }

        let mut backend = class.backend.lock();
        if backend.reserve_count < self.reserve_max {
            backend.reserve_full.push(cache);
            backend.reserve_count += 1;
            preloaded
        } else {
            // The reserve filled up concurrently; return the objects.
            drop(backend);
            while let Some(o) = cache.get() {
                self.backend_free(class, o);
            }
            0
        }
    }

    /// Returns a snapshot of the pool counters.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            allocs: self.allocs.load(Ordering::Relaxed),
            frees: self.frees.load(Ordering::Relaxed),
            cache_allocs: self
                .classes
                .iter()
                .map(|c| c.cache_allocs.load(Ordering::Relaxed))
                .sum(),
            cache_frees: self
                .classes
                .iter()
                .map(|c| c.cache_frees.load(Ordering::Relaxed))
                .sum(),
            slab_creates: self.slab_creates.load(Ordering::Relaxed),
            slab_destroys: self.slab_destroys.load(Ordering::Relaxed),
        }
    }

    /// Tears the pool down, releasing every slab, and returns the final
    /// counter snapshot (with `slab_destroys` accounted).
    pub fn destroy(self) -> PoolStats {
        for class in &self.classes {
            // Objects sitting in CPU caches or the reserve are already
            // tracked allocated in their slabs; dropping the caches only
            // discards pointers.
            for slot in class.cpu.iter() {
                let mut slot = slot.lock();
                slot.loaded = None;
                slot.prev = None;
            }
            let mut backend = class.backend.lock();
            let slabs = backend.full.len() + backend.partial.len() + backend.empty.len();
            backend.full.clear();
            backend.partial.clear();
            backend.empty.clear();
            backend.reserve_full.clear();
            backend.reserve_empty.clear();
            if !self.flags.contains(PoolFlags::NOSTATS) {
                self.slab_destroys
                    .fetch_add(slabs as u64, Ordering::Relaxed);
            }
        }
        self.stats()
    }

    /// Verifies the per-slab accounting invariant: for every slab,
    /// `free_count == obj_count - popcount(bitmap)`.
    #[cfg(test)]
    fn check_invariants(&self) {
        for class in &self.classes {
            let backend = class.backend.lock();
            for slab in backend
                .full
                .iter()
                .chain(backend.partial.iter())
                .chain(backend.empty.iter())
            {
                assert_eq!(
                    slab.free_count,
                    slab.obj_count - slab.bitmap_popcount(),
                    "slab accounting mismatch in class {}",
                    class.obj_size
                );
            }
            for slab in backend.full.iter() {
                assert_eq!(slab.free_count, 0);
            }
            for slab in backend.empty.iter() {
                assert_eq!(slab.free_count, slab.obj_count);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn class_selection_rounds_up() {
        let pool = Pool::new("t", &[32, 128, 4096], PoolFlags::empty()).unwrap();
        assert_eq!(pool.class_for(1).unwrap().obj_size, 32);
        assert_eq!(pool.class_for(32).unwrap().obj_size, 32);
        assert_eq!(pool.class_for(33).unwrap().obj_size, 128);
        assert_eq!(pool.class_for(4096).unwrap().obj_size, 4096);
        assert!(pool.class_for(4097).is_none());
        pool.destroy();
    }

    #[test]
    fn sizes_are_aligned_to_eight() {
        let pool = Pool::new("t", &[4], PoolFlags::empty()).unwrap();
        assert_eq!(pool.classes[0].obj_size, 8);
        pool.destroy();
    }

    #[test]
    fn slab_size_heuristic() {
        assert_eq!(calc_slab_pages(64), 1);
        assert_eq!(calc_slab_pages(256), 2);
        assert_eq!(calc_slab_pages(1024), 4);
        assert_eq!(calc_slab_pages(4096), 8);
        assert_eq!(calc_slab_pages(16384), 16);
        assert_eq!(calc_slab_pages(32768), 32);
    }

    #[test]
    fn alloc_free_roundtrip() {
        let pool = Pool::new("t", &[32], PoolFlags::empty()).unwrap();
        let obj = pool.alloc(32).unwrap();
        pool.check_invariants();
        pool.free(obj);
        pool.check_invariants();
        let stats = pool.destroy();
        assert_eq!(stats.allocs, 1);
        assert_eq!(stats.frees, 1);
        assert_eq!(stats.slab_creates, stats.slab_destroys);
    }

    #[test]
    fn invalid_size_returns_none() {
        let pool = Pool::new("t", &[64], PoolFlags::empty()).unwrap();
        assert!(pool.alloc(65).is_none());
        pool.destroy();
    }

    #[test]
    fn cache_is_lifo() {
        let pool = Pool::new("t", &[64], PoolFlags::empty()).unwrap();
        let a = pool.alloc(64).unwrap();
        pool.free(a);
        let b = pool.alloc(64).unwrap();
        // The freed object sits on top of the loaded cache.
        assert_eq!(a.as_ptr(), b.as_ptr());
        pool.free(b);
        pool.destroy();
    }

    #[test]
    fn nocache_pool_never_caches() {
        let pool = Pool::new("t", &[64], PoolFlags::NOCACHE).unwrap();
        let a = pool.alloc(64).unwrap();
        pool.free(a);
        let stats = pool.destroy();
        assert_eq!(stats.cache_allocs, 0);
        assert_eq!(stats.cache_frees, 0);
        assert_eq!(stats.allocs, 1);
        assert_eq!(stats.frees, 1);
    }

    #[test]
    fn slab_promotion_cycle() {
        // 4096-byte objects in 8-page slabs: exactly 8 objects per slab.
        let pool = Pool::new("t", &[4096], PoolFlags::NOCACHE).unwrap();
        let objs: Vec<_> = (0..8).map(|_| pool.alloc(4096).unwrap()).collect();
        {
            let backend = pool.classes[0].backend.lock();
            assert_eq!(backend.full.len(), 1);
            assert_eq!(backend.partial.len(), 0);
        }
        pool.free(objs[0]);
        {
            let backend = pool.classes[0].backend.lock();
            assert_eq!(backend.full.len(), 0);
            assert_eq!(backend.partial.len(), 1);
        }
        for obj in &objs[1..] {
            pool.free(*obj);
        }
        {
            let backend = pool.classes[0].backend.lock();
            assert_eq!(backend.partial.len(), 0);
            // Original preallocated empty slab plus the drained one.
            assert_eq!(backend.empty.len(), 2);
        }
        pool.check_invariants();
        pool.destroy();
    }

    #[test]
    fn lazy_pool_creates_no_initial_slabs() {
        let pool = Pool::new("t", &[64], PoolFlags::LAZY | PoolFlags::NOCACHE).unwrap();
        assert_eq!(pool.stats().slab_creates, 0);
        let obj = pool.alloc(64).unwrap();
        assert_eq!(pool.stats().slab_creates, 1);
        pool.free(obj);
        pool.destroy();
    }

    #[test]
    fn preload_fills_reserve() {
        let pool = Pool::with_tuning("t", &[32], PoolFlags::empty(), 0, 16, 4).unwrap();
        assert_eq!(pool.preload_cache(32, 10), 10);
        {
            let backend = pool.classes[0].backend.lock();
            assert_eq!(backend.reserve_count, 1);
            assert_eq!(backend.reserve_full.len(), 1);
        }
        // Preload beyond capacity is rejected.
        assert_eq!(pool.preload_cache(32, 17), 0);
        pool.destroy();
    }

    #[test]
    fn free_of_foreign_pointer_is_dropped() {
        let pool = Pool::new("t", &[64], PoolFlags::empty()).unwrap();
        let bogus = Box::into_raw(Box::new(0u64)) as *mut u8;
        pool.free(NonNull::new(bogus).unwrap());
        // No counters moved, no crash.
        assert_eq!(pool.stats().frees, 0);
        unsafe { drop(Box::from_raw(bogus as *mut u64)) };
        pool.destroy();
    }

    #[test]
    fn churn_balances_counters() {
        let pool = Arc::new(
            Pool::with_tuning("churn", &[32, 128, 4096], PoolFlags::empty(), 0, 64, 16)
                .unwrap(),
        );
        let mut handles = Vec::new();
        for seed in 0..4u64 {
            let pool = pool.clone();
            handles.push(std::thread::spawn(move || {
                let mut rng = seed.wrapping_mul(0x9E37_79B9_7F4A_7C15).wrapping_add(1);
                let sizes = [32usize, 128, 4096];
                for _ in 0..20_000 {
                    rng = rng.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                    let size = sizes[(rng >> 33) as usize % 3];
                    let obj = pool.alloc(size).unwrap();
                    pool.free(obj);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        pool.check_invariants();
        let pool = Arc::try_unwrap(pool).ok().expect("sole owner");
        let stats = pool.destroy();
        assert_eq!(stats.allocs, stats.frees);
        assert_eq!(stats.allocs, 80_000);
        assert_eq!(stats.slab_creates - stats.slab_destroys, 0);
    }
}
