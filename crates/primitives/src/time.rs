use std::time::Duration;

/// A UNIX timestamp in seconds.
pub type Timestamp = u64;

/// Returns `interval` scaled by `percent`, e.g. to derive a safety margin from a lease TTL.
pub fn percent_of(interval: Duration, percent: u32) -> Duration {
    interval * percent / 100
}
