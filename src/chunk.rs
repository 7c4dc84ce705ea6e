//! Chunk layout: the address-space discipline behind O(1) class lookup.
//!
//! A chunk is a `DATA_ALIGNMENT`-aligned, `DATA_ALIGNMENT`-sized data region
//! prefixed (low to high) by a committed metadata page and an uncommitted
//! guard page:
//!
//! ```text
//! metadata page | guard page | data region (SPANS_PER_CHUNK spans)
//!               ^ faults     ^ chunk base, DATA_ALIGNMENT-aligned
//! ```
//!
//! Masking any object pointer with `-DATA_ALIGNMENT` recovers the data base;
//! the offset within the region, divided by `SPAN_ALIGNMENT`, indexes the
//! metadata array. The guard page sits between metadata and data so a stray
//! access running off the low end of the data region faults before it can
//! touch metadata.
//!
//! Reservations are over-sized and trimmed to alignment, and only the
//! metadata page is committed here; span data is committed as spans are
//! carved ([`crate::mill`]).

use core::mem;
use core::ptr::NonNull;

use crate::config::{
    CHUNK_PREFIX_SIZE, DATA_ALIGNMENT, GUARD_PAGE_SIZE, METADATA_PAGE_SIZE, SPANS_PER_CHUNK,
    SPAN_ALIGNMENT,
};
use crate::map::{self, MapError};

/// Per-span record, written once when the span is carved and read-only
/// afterwards. The release fast path loads `class_id`; the bump fields
/// record the span's initial state (the live cursor is in the mill).
#[repr(C)]
pub struct SpanMetadata {
    /// Owning class; 0 while the span slot is uncarved.
    pub class_id: u32,
    _reserved: u32,
    /// First object address in the span.
    pub bump_ptr: usize,
    /// One past the last usable byte of the span.
    pub bump_limit: usize,
    /// Span base address (equals the initial `bump_ptr`).
    pub span_begin: usize,
}

// The metadata page must hold one entry per span slot. build.rs enforces the
// same bound before the constants are generated.
const _: () = assert!(mem::size_of::<SpanMetadata>() == 32);
const _: () = assert!(SPANS_PER_CHUNK * mem::size_of::<SpanMetadata>() <= METADATA_PAGE_SIZE);

/// Locates the metadata entry for an object pointer.
///
/// Pure arithmetic plus one pointer offset; the load is the caller's. For a
/// pointer that did not come out of this allocator the result points at
/// whatever lives below the masked address, and dereferencing it is the
/// caller's (checked) risk.
#[inline(always)]
pub fn metadata_for(ptr: NonNull<u8>) -> *mut SpanMetadata {
    let addr = ptr.as_ptr() as usize;
    let chunk_base = addr & !(DATA_ALIGNMENT - 1);
    let span_index = (addr & (DATA_ALIGNMENT - 1)) / SPAN_ALIGNMENT;

    let meta_base = (chunk_base - CHUNK_PREFIX_SIZE) as *mut SpanMetadata;
    unsafe { meta_base.add(span_index) }
}

/// A reserved chunk. Chunks are never released; the struct only remembers
/// where the data region landed.
pub struct Chunk {
    data: usize,
}

impl Chunk {
    /// Reserves and trims a fresh chunk: claims
    /// `CHUNK_PREFIX_SIZE + 2 * DATA_ALIGNMENT` bytes of address space,
    /// keeps the aligned `[metadata | guard | data]` window, releases the
    /// slack, and commits the metadata page. The guard page and the data
    /// region stay uncommitted.
    pub fn reserve() -> Result<Self, MapError> {
        // Commits happen at metadata-page, guard-page, and span granularity;
        // all three must be multiples of the OS page size.
        debug_assert!(map::page_size().is_ok_and(|ps| {
            METADATA_PAGE_SIZE % ps == 0 && GUARD_PAGE_SIZE % ps == 0 && SPAN_ALIGNMENT % ps == 0
        }));

        let total = CHUNK_PREFIX_SIZE + 2 * DATA_ALIGNMENT;
        let base = map::reserve_region(total)?.as_ptr() as usize;

        let data = (base + CHUNK_PREFIX_SIZE + DATA_ALIGNMENT - 1) & !(DATA_ALIGNMENT - 1);
        let low = data - CHUNK_PREFIX_SIZE;
        let high = data + DATA_ALIGNMENT;

        unsafe {
            map::release_region(base as *mut u8, low - base)?;
            map::release_region(high as *mut u8, (base + total) - high)?;
            map::allocate_region(low as *mut u8, METADATA_PAGE_SIZE)?;
        }

        log::debug!(
            "reserved chunk: data {:#x}..{:#x}, metadata at {:#x}",
            data,
            high,
            low
        );
        Ok(Self { data })
    }

    /// Base of the data region.
    pub fn data_base(&self) -> usize {
        self.data
    }

    /// Base address of span slot `index`.
    pub fn span_begin(&self, index: usize) -> usize {
        debug_assert!(index < SPANS_PER_CHUNK);
        self.data + index * SPAN_ALIGNMENT
    }

    /// Metadata entry for span slot `index`.
    pub fn metadata(&self, index: usize) -> *mut SpanMetadata {
        debug_assert!(index < SPANS_PER_CHUNK);
        let meta_base = (self.data - CHUNK_PREFIX_SIZE) as *mut SpanMetadata;
        unsafe { meta_base.add(index) }
    }

    /// Publishes the metadata entry for a freshly carved span.
    ///
    /// # Safety
    ///
    /// Must run under the owning mill's lock, before any object from the
    /// span is handed out, and at most once per slot.
    pub unsafe fn install_metadata(&self, index: usize, class_id: u32) {
        let span_begin = self.span_begin(index);
        let entry = self.metadata(index);
        unsafe {
            entry.write(SpanMetadata {
                class_id,
                _reserved: 0,
                bump_ptr: span_begin,
                bump_limit: span_begin + SPAN_ALIGNMENT,
                span_begin,
            });
        }
    }
}
