use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;

/// The six boundary constants, resolved from a profile plus overrides.
struct Constants {
    magazine_size: usize,
    data_alignment: usize,
    guard_page_size: usize,
    metadata_page_size: usize,
    span_alignment: usize,
    cache_prealloc: usize,
}

const DEFAULT: Constants = Constants {
    magazine_size: 30,
    data_alignment: 1 << 30,  // 1 GiB
    guard_page_size: 2 << 20, // 2 MiB
    metadata_page_size: 2 << 20,
    span_alignment: 16 << 10, // 16 KiB
    cache_prealloc: 15,
};

/// Halved-and-then-some profile for test machines that cannot afford
/// gigabyte address-space reservations per chunk.
const SMALL: Constants = Constants {
    magazine_size: 6,
    data_alignment: 2 << 20, // 2 MiB
    guard_page_size: 16 << 10,
    metadata_page_size: 16 << 10,
    span_alignment: 4 << 10, // 4 KiB
    cache_prealloc: 3,
};

/// Size of one span-metadata entry. Must match `SpanMetadata` in
/// `src/chunk.rs`, which re-asserts this with a const assertion.
const SPAN_METADATA_SIZE: usize = 32;

#[derive(Deserialize, Default)]
struct ConfigSection {
    profile: Option<String>,
    magazine_size: Option<usize>,
    data_alignment: Option<usize>,
    guard_page_size: Option<usize>,
    metadata_page_size: Option<usize>,
    span_alignment: Option<usize>,
    cache_prealloc: Option<usize>,
}

#[derive(Deserialize, Default)]
struct Config {
    #[serde(default)]
    config: ConfigSection,
}

fn resolve(cfg: &ConfigSection) -> Constants {
    let base = match cfg.profile.as_deref() {
        None | Some("default") => DEFAULT,
        Some("small") => SMALL,
        Some(other) => panic!("unknown profile {:?} (expected \"default\" or \"small\")", other),
    };

    Constants {
        magazine_size: cfg.magazine_size.unwrap_or(base.magazine_size),
        data_alignment: cfg.data_alignment.unwrap_or(base.data_alignment),
        guard_page_size: cfg.guard_page_size.unwrap_or(base.guard_page_size),
        metadata_page_size: cfg.metadata_page_size.unwrap_or(base.metadata_page_size),
        span_alignment: cfg.span_alignment.unwrap_or(base.span_alignment),
        cache_prealloc: cfg.cache_prealloc.unwrap_or(base.cache_prealloc),
    }
}

fn validate(c: &Constants) {
    assert!(c.magazine_size >= 1, "magazine_size must be >= 1");
    assert!(c.cache_prealloc >= 1, "cache_prealloc must be >= 1");

    for (name, v) in [
        ("data_alignment", c.data_alignment),
        ("guard_page_size", c.guard_page_size),
        ("metadata_page_size", c.metadata_page_size),
        ("span_alignment", c.span_alignment),
    ] {
        assert!(
            v > 0 && v.is_power_of_two(),
            "{} ({}) must be a power of 2",
            name,
            v
        );
    }

    assert!(
        c.data_alignment % c.span_alignment == 0,
        "data_alignment ({}) must be a multiple of span_alignment ({})",
        c.data_alignment,
        c.span_alignment
    );
    assert!(
        c.span_alignment < c.data_alignment,
        "span_alignment ({}) must be smaller than data_alignment ({})",
        c.span_alignment,
        c.data_alignment
    );

    // Every span in a chunk needs a metadata entry inside the metadata page.
    let spans_per_chunk = c.data_alignment / c.span_alignment;
    assert!(
        spans_per_chunk * SPAN_METADATA_SIZE <= c.metadata_page_size,
        "metadata page ({} bytes) cannot hold {} span entries of {} bytes",
        c.metadata_page_size,
        spans_per_chunk,
        SPAN_METADATA_SIZE
    );
}

fn generate(c: &Constants, out_path: &Path) {
    let code = format!(
        "// Auto-generated by build.rs. Do not edit.\n\n\
         /// Capacity, in object pointers, of one magazine.\n\
         pub const MAGAZINE_SIZE: usize = {};\n\
         /// Alignment and size of a chunk's data region.\n\
         pub const DATA_ALIGNMENT: usize = {};\n\
         /// Size of the uncommitted guard page below each data region.\n\
         pub const GUARD_PAGE_SIZE: usize = {};\n\
         /// Size of the committed span-metadata page below the guard page.\n\
         pub const METADATA_PAGE_SIZE: usize = {};\n\
         /// Alignment and size of one span.\n\
         pub const SPAN_ALIGNMENT: usize = {};\n\
         /// Class slots preallocated inline in thread-local storage.\n\
         pub const CACHE_PREALLOC: usize = {};\n",
        c.magazine_size,
        c.data_alignment,
        c.guard_page_size,
        c.metadata_page_size,
        c.span_alignment,
        c.cache_prealloc,
    );
    fs::write(out_path, code).expect("failed to write config_gen.rs");
}

fn default_config_path() -> String {
    let manifest_dir = env::var("CARGO_MANIFEST_DIR").unwrap();
    format!("{}/magalloc.toml", manifest_dir)
}

fn main() {
    println!("cargo:rerun-if-env-changed=MAGALLOC_CONFIG");

    let out_dir = env::var("OUT_DIR").unwrap();

    let config_path = env::var("MAGALLOC_CONFIG").unwrap_or_else(|_| default_config_path());
    println!("cargo:rerun-if-changed={}", config_path);
    let content = fs::read_to_string(&config_path)
        .unwrap_or_else(|e| panic!("failed to read {}: {}", config_path, e));

    let config: Config = toml::from_str(&content).expect("failed to parse TOML config");

    let resolved = resolve(&config.config);
    validate(&resolved);
    generate(&resolved, &Path::new(&out_dir).join("config_gen.rs"));
}
