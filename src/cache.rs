//! Thread-local cache: the allocation and release fast paths.
//!
//! Each thread keeps a pair of magazines per class it has observed — a pop
//! magazine serving `allocate` and a push magazine absorbing `release` —
//! indexed by class id. The fast paths touch nothing but this thread-local
//! state; the cold halves swap magazines with the class's mill.
//!
//! The first `CACHE_PREALLOC` classes live in an inline region directly in
//! thread-local storage, so the common case pays no pointer chase to reach
//! its magazines. Growth past the inline region moves the pairs into a
//! boxed slice.
//!
//! On thread exit the cache drains every magazine back to the mills. If an
//! operation arrives after the cache is torn down (another destructor
//! allocating during thread shutdown), it falls through to the mill's
//! direct path.

use core::cell::UnsafeCell;
use core::ptr;
use core::ptr::NonNull;

use crate::chunk;
use crate::class::{self, Class};
use crate::config::CACHE_INLINE_SLOTS;
use crate::magazine::{PopMagazine, PushMagazine};

/// The per-class magazine pair.
#[derive(Clone, Copy)]
struct Magazines {
    alloc: PopMagazine,
    release: PushMagazine,
}

impl Magazines {
    const fn dummy() -> Self {
        Self {
            alloc: PopMagazine::dummy(),
            release: PushMagazine::dummy(),
        }
    }
}

struct ThreadCache {
    /// Class ids below `n` have slots behind `mags`. Starts at 0 so the
    /// first operation of any class takes the slow path.
    n: usize,
    mags: *mut Magazines,
    /// Preallocated slots for the dummy class 0 plus the first
    /// `CACHE_PREALLOC` classes; the first growth step points `mags` here.
    inline: [Magazines; CACHE_INLINE_SLOTS],
    /// Heap backing once the cache outgrows the inline region.
    spill: Option<Box<[Magazines]>>,
}

thread_local! {
    static CACHE: UnsafeCell<ThreadCache> = const { UnsafeCell::new(ThreadCache::new()) };
}

/// Returns a fresh allocation of `class`. Aborts on OS mapping failure.
///
/// The returned pointer addresses at least `size` bytes (per the class
/// config), aligned to at least 8.
#[inline]
pub fn allocate(class: Class) -> NonNull<u8> {
    CACHE
        .try_with(|cell| unsafe { (*cell.get()).allocate(class) })
        // TLS already destroyed: serve straight from the mill.
        .unwrap_or_else(|_| class.info().mill.allocate_direct())
}

/// Passes ownership of `ptr` back to `class`. Null is a safe no-op.
///
/// `ptr` must otherwise have been returned by [`allocate`] for this same
/// class: the span metadata check aborts on a class mismatch.
#[inline]
pub fn release(class: Class, ptr: *mut u8) {
    let Some(alloc) = NonNull::new(ptr) else {
        return;
    };

    // The integrity check. One mask, one shift, one load: the chunk layout
    // names the owning class of any object pointer.
    let meta_class = unsafe { (*chunk::metadata_for(alloc)).class_id };
    assert!(
        meta_class == class.id().get(),
        "class mismatch: pointer belongs to class {}, released as class {}",
        meta_class,
        class.id()
    );

    if CACHE
        .try_with(|cell| unsafe { (*cell.get()).release(class, alloc) })
        .is_err()
    {
        class.info().mill.release_direct(alloc);
    }
}

impl ThreadCache {
    const fn new() -> Self {
        Self {
            n: 0,
            mags: ptr::null_mut(),
            inline: [Magazines::dummy(); CACHE_INLINE_SLOTS],
            spill: None,
        }
    }

    #[inline]
    fn allocate(&mut self, class: Class) -> NonNull<u8> {
        let id = class.id().get() as usize;
        if id < self.n {
            let mags = unsafe { &mut *self.mags.add(id) };
            if let Some(alloc) = mags.alloc.get() {
                return alloc;
            }
        }

        self.allocate_slow(class)
    }

    #[cold]
    #[inline(never)]
    fn allocate_slow(&mut self, class: Class) -> NonNull<u8> {
        let id = class.id().get() as usize;
        if id >= self.n {
            self.grow(id);
        }

        let info = class.info();
        let mags = unsafe { &mut *self.mags.add(id) };

        // Swap the exhausted magazine for a populated one; the refill also
        // yields the allocation that triggered the miss.
        if let Some(storage) = mags.alloc.into_storage() {
            info.mill.retire(storage);
        }
        let (alloc, mag) = info.mill.refill();
        mags.alloc = mag;
        alloc
    }

    #[inline]
    fn release(&mut self, class: Class, alloc: NonNull<u8>) {
        let id = class.id().get() as usize;
        if id < self.n {
            let mags = unsafe { &mut *self.mags.add(id) };
            if mags.release.put(alloc).is_none() {
                return;
            }
        }

        self.release_slow(class, alloc);
    }

    #[cold]
    #[inline(never)]
    fn release_slow(&mut self, class: Class, alloc: NonNull<u8>) {
        let id = class.id().get() as usize;
        if id >= self.n {
            self.grow(id);
        }

        let info = class.info();
        let mags = unsafe { &mut *self.mags.add(id) };

        // Hand the full magazine to the mill, take an empty one, and land
        // the pending release in it.
        let full = mags.release.into_storage();
        let mut fresh = info.mill.drain(full);
        unsafe { fresh.put_non_full(alloc) };
        mags.release = fresh;
    }

    /// Extends the cache to cover class id `id`, installing dummy magazines
    /// in every new slot. The first growth step claims the inline region;
    /// later steps move the pairs to the heap.
    #[cold]
    fn grow(&mut self, id: usize) {
        debug_assert!(id >= self.n);

        if self.n == 0 {
            self.mags = self.inline.as_mut_ptr();
            self.n = CACHE_INLINE_SLOTS;
        }

        if id >= self.n {
            let new_n = (id + 1).max(2 * self.n);
            let mut slots = vec![Magazines::dummy(); new_n].into_boxed_slice();
            // Move the live pairs over before the old backing goes away.
            unsafe { ptr::copy_nonoverlapping(self.mags, slots.as_mut_ptr(), self.n) };
            self.mags = slots.as_mut_ptr();
            self.n = new_n;
            self.spill = Some(slots);
        }
    }
}

impl Drop for ThreadCache {
    fn drop(&mut self) {
        // Thread exit: every cached magazine flows back to its mill. A
        // non-dummy magazine implies the class was registered.
        for id in 1..self.n {
            let mags = unsafe { &mut *self.mags.add(id) };

            if let Some(storage) = mags.alloc.into_storage() {
                let info = class::lookup_id(id as u32).expect("magazine for unregistered class");
                info.mill.retire(storage);
                mags.alloc = PopMagazine::dummy();
            }
            if let Some(storage) = mags.release.into_storage() {
                let info = class::lookup_id(id as u32).expect("magazine for unregistered class");
                info.mill.retire(storage);
                mags.release = PushMagazine::dummy();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::ClassConfig;
    use crate::config::{CACHE_PREALLOC, MAGAZINE_SIZE};
    use core::sync::atomic::Ordering;

    fn new_class(size: usize, zero_init: bool) -> Class {
        Class::register(ClassConfig {
            size,
            zero_init,
            ..Default::default()
        })
    }

    #[test]
    fn allocate_release_round_trip() {
        let class = new_class(40, false);

        let p = allocate(class);
        assert_eq!(p.as_ptr() as usize % 8, 0);
        unsafe { core::ptr::write_bytes(p.as_ptr(), 0xAB, 40) };
        release(class, p.as_ptr());

        // The release magazine absorbed it; the next allocation is a
        // different (still-cached) object.
        let q = allocate(class);
        assert_ne!(p, q);
        release(class, q.as_ptr());
    }

    #[test]
    fn null_release_is_a_noop() {
        let class = new_class(8, false);
        release(class, ptr::null_mut());
    }

    #[test]
    fn sequential_allocations_are_distinct() {
        let class = new_class(16, false);

        let mut seen = std::collections::HashSet::new();
        let mut live = Vec::new();
        for _ in 0..4 * MAGAZINE_SIZE {
            let p = allocate(class);
            assert!(seen.insert(p.as_ptr() as usize), "duplicate live allocation");
            live.push(p);
        }
        for p in live {
            release(class, p.as_ptr());
        }
    }

    #[test]
    fn refill_and_drain_batch_counts() {
        // A fresh refill covers MAGAZINE_SIZE + 1 allocations (the trigger
        // plus a full magazine); a drain covers MAGAZINE_SIZE releases (the
        // trigger push plus the remaining slots). 2 * MAGAZINE_SIZE + 1
        // operations therefore cost exactly 2 refills and 3 drains.
        let class = new_class(16, false);
        let counters = class.info().mill.counters();
        let count = 2 * MAGAZINE_SIZE + 1;

        let refills_before = counters.refills.load(Ordering::Relaxed);
        let ptrs: Vec<_> = (0..count).map(|_| allocate(class)).collect();
        assert_eq!(counters.refills.load(Ordering::Relaxed) - refills_before, 2);

        let drains_before = counters.drains.load(Ordering::Relaxed);
        for p in ptrs.iter().rev() {
            release(class, p.as_ptr());
        }
        assert_eq!(counters.drains.load(Ordering::Relaxed) - drains_before, 3);
    }

    #[test]
    fn cache_grows_past_the_inline_region() {
        let classes: Vec<_> = (0..CACHE_PREALLOC + 4).map(|_| new_class(8, false)).collect();

        let ptrs: Vec<_> = classes.iter().map(|&c| (c, allocate(c))).collect();
        for (c, p) in &ptrs {
            unsafe {
                assert_eq!(
                    (*chunk::metadata_for(*p)).class_id,
                    c.id().get(),
                    "allocation landed in the wrong class's span"
                );
            }
        }
        for (c, p) in ptrs {
            release(c, p.as_ptr());
        }
    }

    #[test]
    fn zero_init_objects_are_zero_after_recycling() {
        let class = new_class(32, true);

        // Dirty a few magazines' worth and hand everything back.
        let ptrs: Vec<_> = (0..3 * MAGAZINE_SIZE).map(|_| allocate(class)).collect();
        for p in &ptrs {
            unsafe { core::ptr::write_bytes(p.as_ptr(), 0xFF, 32) };
        }
        for p in &ptrs {
            release(class, p.as_ptr());
        }

        // Anything we get back — recycled or fresh — reads as zero.
        for _ in 0..4 * MAGAZINE_SIZE {
            let p = allocate(class);
            let bytes = unsafe { core::slice::from_raw_parts(p.as_ptr(), 32) };
            assert!(bytes.iter().all(|&b| b == 0), "recycled object not re-zeroed");
            release(class, p.as_ptr());
        }
    }

    #[test]
    fn concurrent_alternating_traffic_has_bounded_footprint() {
        // Threads alternating a single allocate/release pair hold at most a
        // couple of magazines' worth of objects each; the rest recycles
        // through the mill's stash, so fresh span carving stays small.
        let class = new_class(64, false);
        let nthreads = 4;
        let ops = 10_000;

        let handles: Vec<_> = (0..nthreads)
            .map(|_| {
                std::thread::spawn(move || {
                    for i in 0..ops {
                        let p = allocate(class);
                        unsafe { *p.as_ptr() = i as u8 };
                        release(class, p.as_ptr());
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let counters = class.info().mill.counters();
        assert_eq!(counters.chunks_reserved.load(Ordering::Relaxed), 1);
        assert!(
            counters.spans_carved.load(Ordering::Relaxed) <= 16,
            "steady-state traffic kept carving fresh spans"
        );
    }

    #[test]
    fn thread_exit_drains_magazines_to_the_mill() {
        let class = new_class(48, false);

        let addr = std::thread::spawn(move || {
            let p = allocate(class);
            release(class, p.as_ptr());
            p.as_ptr() as usize
        })
        .join()
        .unwrap();

        // The exiting thread retired its release magazine (holding the one
        // object) onto the mill's stash; the stash is LIFO, so the next
        // refill hands that object back.
        let p = allocate(class);
        assert_eq!(p.as_ptr() as usize, addr);
        release(class, p.as_ptr());
    }
}
