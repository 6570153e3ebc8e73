//! Wall-clock helpers.
//!
//! All engine timestamps are nanoseconds since the Unix epoch, stored as
//! `u64`. The store and audit trail never interpret them beyond ordering
//! and window arithmetic.

use std::time::{SystemTime, UNIX_EPOCH};

/// Returns the current time as nanoseconds since the Unix epoch.
///
/// Saturates at `u64::MAX` rather than panicking on a clock set far in
/// the future; a clock before the epoch reads as 0.
#[must_use]
pub fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX))
}
