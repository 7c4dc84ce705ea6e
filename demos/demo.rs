//! Demo: two related object classes, zero-initialization across recycling,
//! and (optionally, with `--mismatch`) the class-mismatch abort.

use std::time::Instant;

use magalloc::{ClassConfig, allocate, define_class, release};

#[repr(C)]
struct Base {
    x: u32,
}

#[repr(C)]
struct Derived {
    base: Base,
    y: u32,
}

define_class!(
    static BASE = ClassConfig {
        name: Some("base".to_string()),
        size: size_of::<Base>(),
        zero_init: true,
        ..Default::default()
    };
);

define_class!(
    static DERIVED = ClassConfig {
        name: Some("derived".to_string()),
        size: size_of::<Derived>(),
        zero_init: true,
        ..Default::default()
    };
);

fn main() {
    println!("magalloc demo");
    println!("=============\n");

    // Release is null-safe.
    release(*BASE, core::ptr::null_mut());

    // Allocate from our two class tags.
    let base = allocate(*BASE).as_ptr() as *mut Base;
    let derived = allocate(*DERIVED).as_ptr() as *mut Derived;

    unsafe {
        // We asked for zero-initialization.
        assert_eq!((*base).x, 0);
        assert_eq!((*derived).base.x, 0);
        assert_eq!((*derived).y, 0);

        (*base).x = 1;
        (*derived).y = 2;

        release(*BASE, base as *mut u8);
        release(*DERIVED, derived as *mut u8);

        // Allocate again: still zero-filled.
        let base = allocate(*BASE).as_ptr() as *mut Base;
        let derived = allocate(*DERIVED).as_ptr() as *mut Derived;
        assert_eq!((*base).x, 0);
        assert_eq!((*derived).base.x, 0);
        assert_eq!((*derived).y, 0);
        println!("zero-init holds across recycling");

        release(*BASE, base as *mut u8);
        release(*DERIVED, derived as *mut u8);
    }

    if std::env::args().any(|arg| arg == "--mismatch") {
        // Allocate from the "derived" tag and release its "base" member.
        // This dies at the span-metadata check with a class mismatch.
        let derived = allocate(*DERIVED).as_ptr() as *mut Derived;
        let base_member = unsafe { &raw mut (*derived).base };
        release(*BASE, base_member as *mut u8);
        unreachable!("the mismatched release must abort");
    }

    // Multi-threaded workload.
    println!("\nmulti-threaded benchmark (8 threads, 100k alloc/release each):");
    let start = Instant::now();
    let handles: Vec<_> = (0..8)
        .map(|_| {
            std::thread::spawn(|| {
                for i in 0u32..100_000 {
                    let p = allocate(*DERIVED).as_ptr() as *mut Derived;
                    unsafe {
                        (*p).y = i;
                        release(*DERIVED, p as *mut u8);
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
    println!("  completed in {:?}", start.elapsed());

    println!("\nexiting demo (run with --mismatch for the abort)");
}
