use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;

#[derive(Deserialize, Default)]
struct ConfigSection {
    min_chunk_bits: Option<u32>,
    max_small_sizeclass_bits: Option<u32>,
    intermediate_bits: Option<u32>,
    remote_slots: Option<usize>,
    num_epochs: Option<usize>,
    max_cacheable_bits: Option<u32>,
    decay_period_ms: Option<u64>,
}

#[derive(Deserialize, Default)]
struct Config {
    #[serde(default)]
    config: ConfigSection,
}

struct Resolved {
    min_chunk_bits: u32,
    max_small_sizeclass_bits: u32,
    intermediate_bits: u32,
    remote_slots: usize,
    num_epochs: usize,
    max_cacheable_bits: u32,
    decay_period_ms: u64,
}

fn resolve(cfg: &ConfigSection) -> Resolved {
    let min_chunk_bits = cfg.min_chunk_bits.unwrap_or(14);
    let max_small_sizeclass_bits = cfg.max_small_sizeclass_bits.unwrap_or(16);
    let intermediate_bits = cfg.intermediate_bits.unwrap_or(2);
    let remote_slots = cfg.remote_slots.unwrap_or(256);
    let num_epochs = cfg.num_epochs.unwrap_or(4);
    let max_cacheable_bits = cfg.max_cacheable_bits.unwrap_or(22);
    let decay_period_ms = cfg.decay_period_ms.unwrap_or(500);

    assert!(
        min_chunk_bits >= 12 && min_chunk_bits < max_small_sizeclass_bits,
        "min_chunk_bits ({min_chunk_bits}) must be >= 12 and < max_small_sizeclass_bits"
    );
    assert!(
        max_small_sizeclass_bits < max_cacheable_bits,
        "max_small_sizeclass_bits must be < max_cacheable_bits"
    );
    assert!(intermediate_bits <= 4, "intermediate_bits unreasonably large");
    assert!(remote_slots.is_power_of_two(), "remote_slots must be a power of two");
    assert!(num_epochs >= 2, "num_epochs must be >= 2 (need a current + a flushing epoch)");
    assert!(decay_period_ms > 0, "decay_period_ms must be > 0");

    Resolved {
        min_chunk_bits,
        max_small_sizeclass_bits,
        intermediate_bits,
        remote_slots,
        num_epochs,
        max_cacheable_bits,
        decay_period_ms,
    }
}

fn default_config_path() -> String {
    let manifest_dir = env::var("CARGO_MANIFEST_DIR").unwrap();
    format!("{manifest_dir}/threadheap.toml")
}

fn main() {
    println!("cargo:rerun-if-env-changed=THREADHEAP_CONFIG");

    let out_dir = env::var("OUT_DIR").unwrap();
    let config_path = env::var("THREADHEAP_CONFIG").unwrap_or_else(|_| default_config_path());
    println!("cargo:rerun-if-changed={config_path}");

    let content = fs::read_to_string(&config_path)
        .unwrap_or_else(|e| panic!("failed to read {config_path}: {e}"));
    let config: Config = toml::from_str(&content).expect("failed to parse TOML config");
    let r = resolve(&config.config);

    let code = format!(
        "// Auto-generated by build.rs from {config_path}. Do not edit.\n\n\
         pub const MIN_CHUNK_BITS: u32 = {};\n\
         pub const MAX_SMALL_SIZECLASS_BITS: u32 = {};\n\
         pub const INTERMEDIATE_BITS: u32 = {};\n\
         pub const REMOTE_SLOTS: usize = {};\n\
         pub const NUM_EPOCHS: usize = {};\n\
         pub const MAX_CACHEABLE_BITS: u32 = {};\n\
         pub const DECAY_PERIOD_MS: u64 = {};\n",
        r.min_chunk_bits,
        r.max_small_sizeclass_bits,
        r.intermediate_bits,
        r.remote_slots,
        r.num_epochs,
        r.max_cacheable_bits,
        r.decay_period_ms,
    );
    fs::write(Path::new(&out_dir).join("config_gen.rs"), code).expect("write config_gen.rs");
}
