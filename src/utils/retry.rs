//! Retry utilities: backoff builders.
//!
//! Uses `backon` for exponential backoff with jitter.

use std::time::Duration;

use backon::ExponentialBuilder;

/// Backoff for transient handler failures.
///
/// - Min delay: 50ms
/// - Max delay: 2s
/// - Max attempts: `max_times` (0 = no retry)
/// - Jitter enabled
pub fn handler_backoff(max_times: usize) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(50))
        .with_max_delay(Duration::from_secs(2))
        .with_max_times(max_times)
        .with_jitter()
}
