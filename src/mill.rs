//! Per-class mill: the shared middle end between thread caches and chunks.
//!
//! Each class owns one mill. It keeps two lock-free stacks of magazine
//! storages — `full` (populated, waiting to satisfy refills) and
//! `partial_empty` (drained, waiting to accept returns) — plus a
//! mutex-guarded bump allocator over the class's current span. Threads only
//! touch the mill from the slow path: a refill hands back a populated
//! magazine (and the triggering allocation), a drain swaps a full release
//! magazine for an empty one.
//!
//! The mill never reconciles individual objects and never detects duplicate
//! frees; that is left to higher-level tooling.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::chunk::Chunk;
use crate::class::Mapper;
use crate::config::{MAGAZINE_SIZE, SPANS_PER_CHUNK, SPAN_ALIGNMENT};
use crate::magazine::{MagazineStorage, PopMagazine, PushMagazine};
use crate::map;
use crate::stack::MagazineStack;

/// Immutable per-class parameters the mill needs.
pub struct MillConfig {
    pub class_id: u32,
    /// Size the caller asked for.
    pub object_size: usize,
    /// Allocation stride: `object_size` rounded up to 8 bytes.
    pub stride: usize,
    pub zero_init: bool,
    pub mapper: Mapper,
}

/// Slow-path event counters. Relaxed; never touched on the fast path.
#[derive(Default)]
pub struct MillCounters {
    pub refills: AtomicU64,
    pub drains: AtomicU64,
    pub spans_carved: AtomicU64,
    pub chunks_reserved: AtomicU64,
    pub storages_created: AtomicU64,
}

/// Bump-allocation state, guarded by the mill lock. The critical section is
/// short: advance the cursor, occasionally carve a span or reserve a chunk.
struct MillState {
    /// Next object address in the current span.
    bump_ptr: usize,
    /// End of the current span.
    bump_limit: usize,
    /// Next uncarved span slot in the newest chunk.
    next_span: usize,
    /// Every chunk this class has reserved. Never shrinks.
    chunks: Vec<Chunk>,
    /// Next backing-file offset, for file-backed classes. Advances in span
    /// units, so the file contents are exactly the committed spans in carve
    /// order.
    file_offset: u64,
}

pub struct Mill {
    config: MillConfig,
    /// Populated magazines awaiting refills.
    full: MagazineStack,
    /// Drained storages awaiting reuse.
    partial_empty: MagazineStack,
    state: Mutex<MillState>,
    counters: MillCounters,
}

impl Mill {
    pub fn new(config: MillConfig) -> Self {
        debug_assert!(config.class_id != 0);
        debug_assert!(config.stride >= config.object_size);
        debug_assert!(config.stride % 8 == 0);
        debug_assert!(config.stride <= SPAN_ALIGNMENT);

        Self {
            config,
            full: MagazineStack::new(),
            partial_empty: MagazineStack::new(),
            state: Mutex::new(MillState {
                bump_ptr: 0,
                bump_limit: 0,
                // Forces a chunk reservation on the first carve.
                next_span: SPANS_PER_CHUNK,
                chunks: Vec::new(),
                file_offset: 0,
            }),
            counters: MillCounters::default(),
        }
    }

    pub fn counters(&self) -> &MillCounters {
        &self.counters
    }

    /// Supplies the triggering allocation plus a populated alloc magazine.
    ///
    /// Recycled magazines come off the `full` stack (re-zeroed here when the
    /// class is `zero_init` — the contract callers rely on). Otherwise a
    /// drained storage is filled by bump allocation: one object for the
    /// caller, `MAGAZINE_SIZE` into the magazine.
    pub fn refill(&self) -> (NonNull<u8>, PopMagazine) {
        self.counters.refills.fetch_add(1, Ordering::Relaxed);

        if let Some(storage) = self.full.try_pop() {
            if self.config.zero_init {
                unsafe { self.zero_recycled(storage) };
            }
            // Storages on `full` always hold at least one allocation.
            let mut mag = unsafe { PopMagazine::new(storage) };
            debug_assert!(!mag.is_exhausted());
            let alloc = unsafe { mag.get_non_empty() };
            return (alloc, mag);
        }

        let storage = self.empty_storage();
        let mut state = self.state.lock();

        let alloc = self.allocate_from_span(&mut state);
        unsafe {
            let slots = &mut (*storage).allocations;
            for slot in slots.iter_mut() {
                *slot = self.allocate_from_span(&mut state).as_ptr();
            }
            (*storage).num_allocated = MAGAZINE_SIZE as u32;
        }
        drop(state);

        (alloc, unsafe { PopMagazine::new(storage) })
    }

    /// Accepts a full release magazine's storage and hands back an empty
    /// push magazine.
    pub fn drain(&self, storage: Option<*mut MagazineStorage>) -> PushMagazine {
        self.counters.drains.fetch_add(1, Ordering::Relaxed);

        if let Some(storage) = storage {
            debug_assert!(unsafe { (*storage).num_allocated } > 0);
            unsafe { self.full.push(storage) };
        }

        unsafe { PushMagazine::new_empty(self.empty_storage()) }
    }

    /// Returns a detached storage to the right stack: `full` if it still
    /// holds allocations, `partial_empty` otherwise. Used at thread exit and
    /// by the direct path.
    pub fn retire(&self, storage: *mut MagazineStorage) {
        unsafe {
            if (*storage).num_allocated > 0 {
                self.full.push(storage);
            } else {
                self.partial_empty.push(storage);
            }
        }
    }

    /// Cache-less allocation, for threads whose local cache is gone.
    pub fn allocate_direct(&self) -> NonNull<u8> {
        let (alloc, mag) = self.refill();
        if let Some(storage) = mag.into_storage() {
            self.retire(storage);
        }
        alloc
    }

    /// Cache-less release: wraps the pointer in a one-entry magazine on the
    /// `full` stack.
    pub fn release_direct(&self, alloc: NonNull<u8>) {
        let storage = self.empty_storage();
        unsafe {
            (*storage).allocations[0] = alloc.as_ptr();
            (*storage).num_allocated = 1;
            self.full.push(storage);
        }
    }

    /// Grabs a drained storage, or mints a fresh (immortal) one.
    fn empty_storage(&self) -> *mut MagazineStorage {
        if let Some(storage) = self.partial_empty.try_pop() {
            debug_assert_eq!(unsafe { (*storage).num_allocated }, 0);
            return storage;
        }

        self.counters.storages_created.fetch_add(1, Ordering::Relaxed);
        Box::leak(Box::new(MagazineStorage::new()))
    }

    /// Re-zeroes every recorded allocation in a recycled storage.
    ///
    /// # Safety
    ///
    /// `storage` must be exclusively owned, with `num_allocated` valid
    /// entries pointing at live objects of this class.
    unsafe fn zero_recycled(&self, storage: *mut MagazineStorage) {
        unsafe {
            let count = (*storage).num_allocated as usize;
            for &alloc in (&(*storage).allocations)[..count].iter() {
                core::ptr::write_bytes(alloc, 0, self.config.object_size);
            }
        }
    }

    /// Bump-allocates one object, carving spans (and reserving chunks) as
    /// needed. Aborts on OS failure: with no backing memory the process has
    /// no path forward.
    fn allocate_from_span(&self, state: &mut MillState) -> NonNull<u8> {
        loop {
            if state.bump_ptr + self.config.stride <= state.bump_limit {
                let alloc = state.bump_ptr;
                state.bump_ptr += self.config.stride;
                // Data regions are span-aligned and the stride is a multiple
                // of 8, so every object is at least 8-aligned.
                debug_assert_eq!(alloc % 8, 0);
                return unsafe { NonNull::new_unchecked(alloc as *mut u8) };
            }

            self.carve_span(state);
        }
    }

    /// Commits the next span slot for this class and publishes its
    /// metadata. Takes a fresh chunk when the current one is exhausted.
    fn carve_span(&self, state: &mut MillState) {
        if state.next_span == SPANS_PER_CHUNK {
            let chunk = Chunk::reserve().unwrap_or_else(|e| {
                log::error!("class {}: chunk reservation failed: {}", self.config.class_id, e);
                panic!("out of address space: {}", e);
            });
            self.counters.chunks_reserved.fetch_add(1, Ordering::Relaxed);
            state.chunks.push(chunk);
            state.next_span = 0;
        }

        let chunk = state.chunks.last().expect("carve without a chunk");
        let index = state.next_span;
        let span_begin = chunk.span_begin(index);

        let committed = match self.config.mapper {
            Mapper::Anonymous => unsafe {
                map::allocate_region(span_begin as *mut u8, SPAN_ALIGNMENT)
            },
            Mapper::File(fd) => {
                let offset = state.file_offset;
                state.file_offset += SPAN_ALIGNMENT as u64;
                unsafe { map::allocate_fd_region(fd, offset, span_begin as *mut u8, SPAN_ALIGNMENT) }
            }
        };
        if let Err(e) = committed {
            log::error!("class {}: span commit failed: {}", self.config.class_id, e);
            panic!("out of memory: {}", e);
        }

        // Fresh anonymous mappings are zero pages; file contents are
        // arbitrary, so zero_init classes scrub file-backed spans here.
        if self.config.zero_init && matches!(self.config.mapper, Mapper::File(_)) {
            unsafe { core::ptr::write_bytes(span_begin as *mut u8, 0, SPAN_ALIGNMENT) };
        }

        // Metadata goes out before any object from the span does.
        unsafe { chunk.install_metadata(index, self.config.class_id) };

        state.next_span = index + 1;
        state.bump_ptr = span_begin;
        state.bump_limit = span_begin + SPAN_ALIGNMENT;
        self.counters.spans_carved.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::metadata_for;

    fn test_mill(class_id: u32, object_size: usize, zero_init: bool) -> Mill {
        let stride = (object_size.max(1) + 7) & !7;
        Mill::new(MillConfig {
            class_id,
            object_size,
            stride,
            zero_init,
            mapper: Mapper::Anonymous,
        })
    }

    #[test]
    fn fresh_refill_fills_a_whole_magazine() {
        let mill = test_mill(801, 16, false);

        let (alloc, mag) = mill.refill();
        assert_eq!(mag.num_allocated(), MAGAZINE_SIZE);
        assert_eq!(alloc.as_ptr() as usize % 8, 0);
        assert_eq!(mill.counters().refills.load(Ordering::Relaxed), 1);
        assert_eq!(mill.counters().chunks_reserved.load(Ordering::Relaxed), 1);

        // Every object in the magazine carries this class's metadata.
        unsafe {
            assert_eq!((*metadata_for(alloc)).class_id, 801);
            let storage = mag.into_storage().unwrap();
            for &ptr in (*storage).allocations.iter() {
                let meta = &*metadata_for(NonNull::new(ptr).unwrap());
                assert_eq!(meta.class_id, 801);
                assert!(meta.span_begin <= ptr as usize);
                assert!((ptr as usize) < meta.bump_limit);
            }
        }
    }

    #[test]
    fn sequential_refills_yield_distinct_objects() {
        let mill = test_mill(802, 32, false);

        let mut seen = std::collections::HashSet::new();
        for _ in 0..4 {
            let (alloc, mag) = mill.refill();
            assert!(seen.insert(alloc.as_ptr() as usize));
            let storage = mag.into_storage().unwrap();
            unsafe {
                for &ptr in (*storage).allocations.iter() {
                    assert!(seen.insert(ptr as usize), "duplicate allocation");
                }
            }
        }
    }

    #[test]
    fn drain_feeds_the_next_refill() {
        let mill = test_mill(803, 8, false);

        let (_alloc, mag) = mill.refill();
        let storage = mag.into_storage().unwrap();

        // Pretend a thread filled a release magazine and drained it.
        let fresh = mill.drain(Some(storage));
        assert!(!fresh.is_exhausted());
        assert_eq!(mill.counters().drains.load(Ordering::Relaxed), 1);

        // The next refill is served from the stash, not from a new span.
        let spans_before = mill.counters().spans_carved.load(Ordering::Relaxed);
        let (_alloc2, mag2) = mill.refill();
        assert_eq!(
            mill.counters().spans_carved.load(Ordering::Relaxed),
            spans_before
        );
        assert_eq!(mag2.num_allocated(), MAGAZINE_SIZE - 1);
    }

    #[test]
    fn zero_init_scrubs_recycled_objects() {
        let mill = test_mill(804, 24, true);

        let (alloc, mag) = mill.refill();
        if let Some(storage) = mag.into_storage() {
            mill.retire(storage);
        }

        // Dirty the object, hand it back, and take it out again.
        unsafe { core::ptr::write_bytes(alloc.as_ptr(), 0xFF, 24) };
        mill.release_direct(alloc);

        let recycled = mill.allocate_direct();
        assert_eq!(recycled, alloc, "LIFO stash returns the same object");
        let bytes = unsafe { core::slice::from_raw_parts(recycled.as_ptr(), 24) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn bump_allocation_crosses_spans() {
        let mill = test_mill(805, 512, false);

        // Keep every magazine checked out so each refill bump-allocates;
        // enough of them exhausts the first span.
        let per_span = SPAN_ALIGNMENT / 512;
        let refills = per_span / (MAGAZINE_SIZE + 1) + 2;
        let mut held = Vec::new();
        for _ in 0..refills {
            let (alloc, mag) = mill.refill();
            unsafe {
                assert_eq!((*metadata_for(alloc)).class_id, 805);
                let storage = mag.into_storage().unwrap();
                for &ptr in (*storage).allocations.iter() {
                    assert_eq!((*metadata_for(NonNull::new(ptr).unwrap())).class_id, 805);
                }
                held.push(storage);
            }
        }
        assert!(mill.counters().spans_carved.load(Ordering::Relaxed) >= 2);

        for storage in held {
            mill.retire(storage);
        }
    }
}
