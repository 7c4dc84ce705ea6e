//! Class registry: dense non-zero ids mapped to immortal class records.
//!
//! Registration is write-once-append: a slot in the fixed table is
//! published with a release store and read with acquire loads, so readers
//! on any thread see a fully initialized record. Classes live for the rest
//! of the process; id 0 is reserved as the dummy slot in thread caches.

use core::num::NonZeroU32;
use core::sync::atomic::{AtomicPtr, AtomicU32, Ordering};
use std::os::fd::RawFd;

use crate::config::SPAN_ALIGNMENT;
use crate::mill::{Mill, MillConfig};

/// Hard cap on registered classes. Registration aborts once the id space
/// is exhausted.
pub const MAX_CLASSES: usize = 4096;

/// Backing source for a class's spans, fixed at registration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Mapper {
    /// Anonymous private mappings (the default).
    #[default]
    Anonymous,
    /// Shared mappings from this descriptor; the file's byte contents are
    /// exactly the committed spans, in carve order, with no header.
    File(RawFd),
}

/// Configuration for [`Class::register`].
#[derive(Clone, Debug, Default)]
pub struct ClassConfig {
    /// Optional diagnostic name.
    pub name: Option<String>,
    /// Object size in bytes. Must be non-zero and at most `SPAN_ALIGNMENT`.
    pub size: usize,
    /// When set, every object is byte-wise zero on each return from
    /// `allocate` — including recycled objects.
    pub zero_init: bool,
    pub mapper: Mapper,
}

/// Immortal per-class record.
pub struct ClassInfo {
    pub id: NonZeroU32,
    pub name: Option<String>,
    /// Size the caller asked for.
    pub object_size: usize,
    /// Allocation stride: `object_size` rounded up to a multiple of 8.
    pub stride: usize,
    pub zero_init: bool,
    pub mill: Mill,
}

/// Opaque class handle. Only obtainable from [`Class::register`], so a
/// handle always names a live class.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Class {
    id: NonZeroU32,
}

static REGISTRY: [AtomicPtr<ClassInfo>; MAX_CLASSES] =
    [const { AtomicPtr::new(core::ptr::null_mut()) }; MAX_CLASSES];
static NEXT_ID: AtomicU32 = AtomicU32::new(1);

impl Class {
    /// Registers a new allocation class, or dies trying: zero or oversized
    /// object sizes and id exhaustion all abort, per the error policy —
    /// there is no recovering from a malformed allocator configuration.
    pub fn register(config: ClassConfig) -> Class {
        assert!(config.size > 0, "class size must be non-zero");
        assert!(
            config.size <= SPAN_ALIGNMENT,
            "class size {} exceeds the span size {}",
            config.size,
            SPAN_ALIGNMENT
        );

        let raw_id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        assert!(
            (raw_id as usize) < MAX_CLASSES,
            "class ids exhausted ({} registered)",
            MAX_CLASSES - 1
        );
        let id = NonZeroU32::new(raw_id).expect("class ids start at 1");

        let stride = (config.size + 7) & !7;
        let info = Box::leak(Box::new(ClassInfo {
            id,
            name: config.name.clone(),
            object_size: config.size,
            stride,
            zero_init: config.zero_init,
            mill: Mill::new(MillConfig {
                class_id: raw_id,
                object_size: config.size,
                stride,
                zero_init: config.zero_init,
                mapper: config.mapper,
            }),
        }));

        log::debug!(
            "registered class {} ({:?}): size {}, stride {}, zero_init {}",
            raw_id,
            info.name.as_deref().unwrap_or("unnamed"),
            info.object_size,
            info.stride,
            info.zero_init
        );

        REGISTRY[raw_id as usize].store(info, Ordering::Release);
        Class { id }
    }

    /// The class's dense, non-zero id.
    #[inline]
    pub fn id(self) -> NonZeroU32 {
        self.id
    }

    /// The registered record behind this handle.
    #[inline]
    pub(crate) fn info(self) -> &'static ClassInfo {
        let ptr = REGISTRY[self.id.get() as usize].load(Ordering::Acquire);
        debug_assert!(!ptr.is_null(), "handle for an unregistered class");
        unsafe { &*ptr }
    }
}

/// Looks up a class record by raw id. Used where only the id is at hand
/// (thread-cache teardown walks its slots by index).
pub(crate) fn lookup_id(id: u32) -> Option<&'static ClassInfo> {
    if id == 0 || id as usize >= MAX_CLASSES {
        return None;
    }

    let ptr = REGISTRY[id as usize].load(Ordering::Acquire);
    if ptr.is_null() { None } else { Some(unsafe { &*ptr }) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_publishes_the_record() {
        let class = Class::register(ClassConfig {
            name: Some("widgets".to_string()),
            size: 24,
            zero_init: true,
            ..Default::default()
        });

        let info = class.info();
        assert_eq!(info.id, class.id());
        assert_eq!(info.name.as_deref(), Some("widgets"));
        assert_eq!(info.object_size, 24);
        assert_eq!(info.stride, 24);
        assert!(info.zero_init);
    }

    #[test]
    fn ids_are_dense_and_increasing() {
        let a = Class::register(ClassConfig {
            size: 8,
            ..Default::default()
        });
        let b = Class::register(ClassConfig {
            size: 8,
            ..Default::default()
        });
        assert!(b.id().get() > a.id().get());
    }

    #[test]
    fn stride_rounds_up_to_eight() {
        let class = Class::register(ClassConfig {
            size: 5,
            ..Default::default()
        });
        assert_eq!(class.info().object_size, 5);
        assert_eq!(class.info().stride, 8);
    }

    #[test]
    #[should_panic(expected = "class size must be non-zero")]
    fn zero_size_aborts() {
        Class::register(ClassConfig::default());
    }

    #[test]
    #[should_panic(expected = "exceeds the span size")]
    fn oversized_class_aborts() {
        Class::register(ClassConfig {
            size: SPAN_ALIGNMENT + 1,
            ..Default::default()
        });
    }
}
