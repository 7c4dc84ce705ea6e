//! magalloc: a class-segregated object allocator.
//!
//! Callers register allocation classes — each fixing an object size and a
//! few flags — and allocate/release objects of a class through two hot-path
//! operations:
//!
//! - Thread-local magazine caches (fast path, no synchronization): one pop
//!   magazine serving allocations, one push magazine absorbing releases,
//!   per class.
//! - A lock-free, ABA-safe magazine pool shared across threads (DWCAS with
//!   a generation counter).
//! - Span-based address-space layout: the class owning any object pointer
//!   is recovered with a mask, a shift, and one load, which is how every
//!   `release` catches class mismatches.
//!
//! # Usage
//!
//! ```
//! use magalloc::{Class, ClassConfig};
//!
//! let class = Class::register(ClassConfig {
//!     name: Some("node".to_string()),
//!     size: 48,
//!     zero_init: true,
//!     ..Default::default()
//! });
//!
//! let p = magalloc::allocate(class);
//! magalloc::release(class, p.as_ptr());
//! ```
//!
//! Misuse and resource exhaustion abort rather than returning errors: the
//! hot path never branches on failure, and a class mismatch or a failed
//! mapping leaves the process nothing safe to continue with.

pub mod cache;
pub mod chunk;
pub mod class;
pub mod config;
pub mod magazine;
mod macros;
pub mod map;
pub mod mill;
pub mod stack;

pub use cache::{allocate, release};
pub use class::{Class, ClassConfig, Mapper};
pub use config::{
    CACHE_PREALLOC, DATA_ALIGNMENT, GUARD_PAGE_SIZE, MAGAZINE_SIZE, METADATA_PAGE_SIZE,
    SPAN_ALIGNMENT,
};
