//! The release-path integrity check: returning a pointer to the wrong
//! class must die at the span-metadata comparison.

use magalloc::{Class, ClassConfig, allocate, release};

#[test]
#[should_panic(expected = "class mismatch")]
fn releasing_into_the_wrong_class_aborts() {
    let base = Class::register(ClassConfig {
        name: Some("mismatch_base".to_string()),
        size: 4,
        ..Default::default()
    });
    let derived = Class::register(ClassConfig {
        name: Some("mismatch_derived".to_string()),
        size: 8,
        ..Default::default()
    });

    let d = allocate(derived);
    release(base, d.as_ptr());
}

#[test]
fn releasing_into_the_right_class_does_not_abort() {
    let base = Class::register(ClassConfig {
        name: Some("match_base".to_string()),
        size: 4,
        ..Default::default()
    });
    let derived = Class::register(ClassConfig {
        name: Some("match_derived".to_string()),
        size: 8,
        ..Default::default()
    });

    let b = allocate(base);
    let d = allocate(derived);
    release(derived, d.as_ptr());
    release(base, b.as_ptr());
}
