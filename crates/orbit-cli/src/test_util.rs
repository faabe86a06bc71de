//! Test-only helpers shared across this crate's unit tests.

use std::sync::{Mutex, MutexGuard, OnceLock};

/// Serializes tests that mutate process environment variables, so two
/// tests racing on `ORBIT_*` or `XDG_CONFIG_HOME` don't observe each
/// other's writes.
pub fn lock_env() -> MutexGuard<'static, ()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
