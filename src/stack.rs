//! Lock-free stack of magazine storages.
//!
//! The header packs `{top pointer, generation}` into one 128-bit word
//! updated with a double-wide compare-and-swap. Every successful update
//! increments the generation, which is what defeats ABA: a stale snapshot
//! can never win the exchange even if the same storage returns to the top.
//! 64 bits of generation do not wrap within a process lifetime.
//!
//! There is no reclamation problem to solve: storages are immortal
//! ([`crate::magazine`]), so a popped pointer is always safe to
//! dereference. Between a pop and the next push a storage is exclusively
//! owned by one thread.
//!
//! The one cross-thread ordering guarantee the allocator needs lives here:
//! the pusher's release store of `link` (and release exchange) paired with
//! the popper's acquire fence means a popped storage's contents are fully
//! visible to the new owner.

use core::ptr;
use core::sync::atomic::{Ordering, fence};

use portable_atomic::AtomicU128;

use crate::magazine::MagazineStorage;

#[inline]
fn pack(top: *mut MagazineStorage, generation: u64) -> u128 {
    (top as usize as u128) | ((generation as u128) << 64)
}

#[inline]
fn unpack(bits: u128) -> (*mut MagazineStorage, u64) {
    (bits as u64 as usize as *mut MagazineStorage, (bits >> 64) as u64)
}

/// ABA-safe stack of detached [`MagazineStorage`]s, linked through their
/// `link` fields.
pub struct MagazineStack {
    header: AtomicU128,
}

impl MagazineStack {
    pub const fn new() -> Self {
        Self {
            header: AtomicU128::new(0),
        }
    }

    /// Pushes `mag` onto the stack.
    ///
    /// # Safety
    ///
    /// `mag` must be exclusively owned by the caller, with a null `link`,
    /// and must not be accessed again until popped.
    pub unsafe fn push(&self, mag: *mut MagazineStorage) {
        debug_assert!(!mag.is_null());
        debug_assert!(unsafe { (*mag).link.load(Ordering::Relaxed).is_null() });

        let mut curr = self.header.load(Ordering::Acquire);
        loop {
            let (top, generation) = unpack(curr);

            // The release ordering of the exchange publishes this store
            // (and every earlier write to *mag) to the eventual popper.
            unsafe { (*mag).link.store(top, Ordering::Release) };

            match self.header.compare_exchange_weak(
                curr,
                pack(mag, generation.wrapping_add(1)),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                // The failed exchange returns an atomic snapshot; reuse it.
                Err(actual) => curr = actual,
            }
        }
    }

    /// Pops the top storage, or returns `None` if the stack is empty.
    ///
    /// The returned storage's `link` is null.
    pub fn pop(&self) -> Option<*mut MagazineStorage> {
        let mut curr = self.header.load(Ordering::Acquire);
        loop {
            let (top, generation) = unpack(curr);
            if top.is_null() {
                return None;
            }

            // Order the `link` load (and all later reads of *top) after the
            // header read that observed `top`, including snapshots returned
            // by a failed exchange.
            fence(Ordering::Acquire);
            let next = unsafe { (*top).link.load(Ordering::Acquire) };

            match self.header.compare_exchange_weak(
                curr,
                pack(next, generation.wrapping_add(1)),
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    unsafe { (*top).link.store(ptr::null_mut(), Ordering::Relaxed) };
                    return Some(top);
                }
                Err(actual) => curr = actual,
            }
        }
    }

    /// Attempts one pop. Returns `None` on an empty stack or on any
    /// contention; callers use this where dropping to a slower path beats
    /// spinning.
    pub fn try_pop(&self) -> Option<*mut MagazineStorage> {
        let curr = self.header.load(Ordering::Acquire);
        let (top, generation) = unpack(curr);
        if top.is_null() {
            return None;
        }

        fence(Ordering::Acquire);
        let next = unsafe { (*top).link.load(Ordering::Acquire) };

        self.header
            .compare_exchange(
                curr,
                pack(next, generation.wrapping_add(1)),
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .ok()
            .map(|_| {
                unsafe { (*top).link.store(ptr::null_mut(), Ordering::Relaxed) };
                top
            })
    }

    pub fn is_empty(&self) -> bool {
        let (top, _) = unpack(self.header.load(Ordering::Acquire));
        top.is_null()
    }
}

impl Default for MagazineStack {
    fn default() -> Self {
        Self::new()
    }
}
