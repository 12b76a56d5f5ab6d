//! Clock abstractions used by the admission gate and token bucket engine.

use std::time::{SystemTime, UNIX_EPOCH};

/// Clock abstraction so timing can be faked in tests.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now_nanos(&self) -> u64;
}

/// Wall clock backed by `SystemTime`, reported as nanoseconds since the Unix epoch.
///
/// Notes: bucket timestamps are shared across every instance through the store, so the
/// clock must be meaningful fleet-wide; a process-local monotonic source would not be.
/// Backward jumps from NTP adjustments are tolerated by the engine, which clamps
/// negative elapsed time to zero.
#[derive(Debug, Clone, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_nanos(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
            .unwrap_or(0)
    }
}
