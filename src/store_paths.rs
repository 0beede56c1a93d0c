//! Purpose: Shared default store-directory resolution for the CLI, API and peer manager.
//! Exports: `default_store_dir`, `STORE_DIR_ENV`.
//! Role: Keep CLI and API-client path semantics aligned from one source.
//! Invariants: `SHMSTORE_DIR` wins; otherwise a tmpfs location when one exists.

use std::path::{Path, PathBuf};

pub const STORE_DIR_ENV: &str = "SHMSTORE_DIR";

pub fn default_store_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os(STORE_DIR_ENV).filter(|value| !value.is_empty()) {
        return PathBuf::from(dir);
    }
    default_store_dir_under(Path::new("/dev/shm"))
}

fn default_store_dir_under(shm_root: &Path) -> PathBuf {
    if shm_root.is_dir() {
        shm_root.join("shmstore")
    } else {
        std::env::temp_dir().join("shmstore")
    }
}
