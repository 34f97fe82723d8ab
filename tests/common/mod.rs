use rand::{Rng, RngCore};
use shale::{StorageEngine, Tuple};
use std::path::Path;

/// Boots an engine over `dir`, recovering if a previous incarnation left a
/// log behind.
pub fn boot(dir: &Path) -> StorageEngine {
    StorageEngine::start(dir).expect("engine should start")
}

/// As [`boot`], with room for many concurrently latched paths.
#[allow(dead_code)]
pub fn boot_large(dir: &Path) -> StorageEngine {
    StorageEngine::start_with_pool_size(dir, 256).expect("engine should start")
}

/// A random opaque tuple between 16 and 64 bytes.
pub fn random_tuple() -> Tuple {
    let mut rng = rand::thread_rng();
    let len = rng.gen_range(16..=64);
    let mut data = vec![0u8; len];
    rng.fill_bytes(&mut data);
    Tuple::new(data)
}
