//! Single-writer-per-session enforcement via advisory file locks.
//!
//! Every mutating run (discovery, capture, cache clear) holds an exclusive
//! lock on `locks/<session>.lock`. A second writer on the same session fails
//! fast with `DiscoveryError::Locked` instead of interleaving cache writes.
//! Different sessions never contend.

use fd_lock::RwLock;
use std::fs::OpenOptions;

use crate::core::error::DiscoveryError;
use crate::core::store::Store;

/// Run `f` while holding the exclusive lock for `session_id`.
pub fn with_session_lock<F, R>(store: &Store, session_id: &str, f: F) -> Result<R, DiscoveryError>
where
    F: FnOnce() -> Result<R, DiscoveryError>,
{
    std::fs::create_dir_all(store.locks_dir()).map_err(DiscoveryError::IoError)?;
    let lock_path = store.locks_dir().join(format!("{}.lock", session_id));
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&lock_path)
        .map_err(DiscoveryError::IoError)?;
    let mut lock = RwLock::new(file);
    let _guard = lock.try_write().map_err(|_| {
        DiscoveryError::Locked(format!(
            "another writer holds session {} ({})",
            session_id,
            lock_path.display()
        ))
    })?;
    tracing::debug!(session = session_id, "session lock acquired");
    f()
}
