//! Wall-clock abstraction for key-lifetime arithmetic.
//!
//! Rotation TTLs are measured against real wall time, so tests need to
//! control the clock. Production code injects [`SystemClock`]; the test
//! harness provides a manually advanced implementation.

use std::time::SystemTime;

/// Source of wall-clock time.
///
/// # Invariants
///
/// Implementations MUST be monotonic enough for TTL math: subsequent calls
/// must not return times earlier than previously observed ones within one
/// process.
pub trait Clock: Send + Sync + 'static {
    /// Current wall-clock time.
    fn now(&self) -> SystemTime;
}

/// Production clock backed by [`SystemTime::now`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}
