use std::{
    collections::hash_map::DefaultHasher,
    fmt::Write as _,
    hash::{Hash, Hasher},
    path::Path,
    sync::atomic::{AtomicU64, Ordering},
};

use sha2::{Digest, Sha256};
use tracing::debug;
use wasmtime::{Config, Engine, Module, OptLevel};

use crate::error::{Error, Result};

pub fn configure_engine(cfg: &mut Config, epoch_interruption: bool) {
    cfg.epoch_interruption(epoch_interruption);
    cfg.table_lazy_init(false);
    cfg.generate_address_map(false);
    cfg.native_unwind_info(false);
    cfg.cranelift_opt_level(OptLevel::Speed);
}

fn engine_fingerprint(engine: &Engine) -> u64 {
    let mut hasher = DefaultHasher::new();
    engine.precompile_compatibility_hash().hash(&mut hasher);
    hasher.finish()
}

pub fn cache_key(engine: &Engine, wasm_bytes: &[u8]) -> String {
    let mut wasm_h = Sha256::new();
    wasm_h.update(wasm_bytes);
    let wasm_digest = wasm_h.finalize();

    let mut h = Sha256::new();
    h.update(b"embed-bridge-cache-v1\0");
    h.update(wasm_digest);
    h.update(engine_fingerprint(engine).to_le_bytes());

    let digest = h.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        let _ = write!(&mut out, "{b:02x}");
    }
    out
}

pub fn write_cache_file_atomic(cache_path: &Path, bytes: &[u8]) -> Result<()> {
    static CACHE_WRITE_SEQUENCE: AtomicU64 = AtomicU64::new(0);

    let sequence = CACHE_WRITE_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let tmp_path =
        cache_path.with_extension(format!("cwasm.tmp-{}-{sequence}", std::process::id()));

    std::fs::write(&tmp_path, bytes)?;
    match std::fs::rename(&tmp_path, cache_path) {
        Ok(()) => Ok(()),
        // A concurrent writer got there first.
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            let _ = std::fs::remove_file(&tmp_path);
            Ok(())
        }
        Err(e) => {
            let _ = std::fs::remove_file(&tmp_path);
            Err(e.into())
        }
    }
}

/// Compile the package, going through the artifact cache when one is set.
pub fn load_or_compile_module(
    engine: &Engine,
    wasm_path: &Path,
    cache_dir: Option<&Path>,
) -> Result<Module> {
    let wasm_bytes = std::fs::read(wasm_path)?;

    let Some(cache_dir) = cache_dir else {
        return Module::new(engine, &wasm_bytes).map_err(Error::Wasm);
    };

    std::fs::create_dir_all(cache_dir)?;
    let key = cache_key(engine, &wasm_bytes);
    let cache_path = cache_dir.join(format!("{key}.cwasm"));

    // SAFETY: artifacts are keyed by the engine's compatibility hash, and
    // wasmtime rejects files it did not produce for this configuration.
    if let Ok(module) = unsafe { Module::deserialize_file(engine, &cache_path) } {
        debug!(path = %cache_path.display(), "loaded cached module");
        return Ok(module);
    }

    let bytes = engine.precompile_module(&wasm_bytes).map_err(Error::Wasm)?;
    write_cache_file_atomic(&cache_path, &bytes)?;
    debug!(path = %cache_path.display(), "wrote cached module");

    // SAFETY: the file was just produced by `precompile_module` on this engine.
    unsafe { Module::deserialize_file(engine, &cache_path) }.map_err(Error::Wasm)
}
