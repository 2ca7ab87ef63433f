//! Test-only helpers shared across this crate's unit tests.

use std::sync::{Mutex, MutexGuard, OnceLock};

static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

/// Serializes tests that mutate process environment variables.
///
/// `std::env::set_var`/`remove_var` affect the whole process, so tests
/// running in parallel on the same binary would otherwise stomp on each
/// other's env vars.
pub fn lock_env() -> MutexGuard<'static, ()> {
    ENV_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
