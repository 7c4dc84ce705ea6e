//! Build-time constants.
//!
//! The six boundary constants are generated by `build.rs` from
//! `magalloc.toml` (or the file named by `MAGALLOC_CONFIG`); everything else
//! here is derived from them. The relations asserted below are load-bearing:
//! the release fast path recovers a chunk base and a span index from a raw
//! pointer with mask-and-shift arithmetic, which only works while data
//! regions are `DATA_ALIGNMENT`-aligned and spans are `SPAN_ALIGNMENT`-sized.

include!(concat!(env!("OUT_DIR"), "/config_gen.rs"));

/// Number of span slots carved out of one chunk's data region.
pub const SPANS_PER_CHUNK: usize = DATA_ALIGNMENT / SPAN_ALIGNMENT;

/// Bytes between a chunk's metadata page and its data region: the metadata
/// page itself plus the guard page above it.
pub const CHUNK_PREFIX_SIZE: usize = GUARD_PAGE_SIZE + METADATA_PAGE_SIZE;

/// Magazine-pair slots preallocated inline in thread-local storage.
/// Slot 0 is the reserved dummy class, hence the `1 +`.
pub const CACHE_INLINE_SLOTS: usize = 1 + CACHE_PREALLOC;

const _: () = assert!(DATA_ALIGNMENT.is_power_of_two());
const _: () = assert!(SPAN_ALIGNMENT.is_power_of_two());
const _: () = assert!(GUARD_PAGE_SIZE.is_power_of_two());
const _: () = assert!(METADATA_PAGE_SIZE.is_power_of_two());
const _: () = assert!(DATA_ALIGNMENT % SPAN_ALIGNMENT == 0);
const _: () = assert!(SPAN_ALIGNMENT < DATA_ALIGNMENT);
const _: () = assert!(MAGAZINE_SIZE >= 1);
const _: () = assert!(CACHE_PREALLOC >= 1);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_constants_are_consistent() {
        assert_eq!(SPANS_PER_CHUNK * SPAN_ALIGNMENT, DATA_ALIGNMENT);
        assert_eq!(CHUNK_PREFIX_SIZE, GUARD_PAGE_SIZE + METADATA_PAGE_SIZE);
        assert_eq!(CACHE_INLINE_SLOTS, 1 + CACHE_PREALLOC);
    }
}
