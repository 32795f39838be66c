//! Retry and refresh scheduling.
//!
//! [`RetryScheduler`] drives the exponential backoff used after a failed JWT-SVID fetch.
//! [`refresh_delay`] turns the expiry of a freshly issued credential into the delay until its
//! next refresh. The stream watchers use the jittered [`next_backoff`] policy instead.

use std::time::Duration;
use time::OffsetDateTime;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// First interval returned by a fresh [`RetryScheduler`].
pub const INITIAL_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Upper bound for any interval returned by [`RetryScheduler`].
pub const MAX_RETRY_INTERVAL: Duration = Duration::from_secs(60);

/// Margin added on top of half the remaining lifetime of a credential.
pub const REFRESH_MARGIN: Duration = Duration::from_secs(1);

const RETRY_MULTIPLIER: u32 = 2;

/// Stateful exponential backoff generator.
///
/// Each call to [`RetryScheduler::next_interval`] returns the current interval and then doubles
/// it, clamped to the maximum. The sequence is never reset in place: a failure streak broken by
/// a success is handled by constructing a new scheduler.
#[derive(Debug, Clone)]
pub struct RetryScheduler {
    current: Duration,
    max: Duration,
}

impl RetryScheduler {
    /// Creates a scheduler starting at one second and capped at sixty seconds.
    pub fn new() -> Self {
        Self::with_bounds(INITIAL_RETRY_INTERVAL, MAX_RETRY_INTERVAL)
    }

    /// Creates a scheduler with custom bounds. `initial` is clamped to `max`.
    pub fn with_bounds(initial: Duration, max: Duration) -> Self {
        RetryScheduler {
            current: initial.min(max),
            max,
        }
    }

    /// Returns the interval to wait before the next retry and advances the sequence.
    pub fn next_interval(&mut self) -> Duration {
        let interval = self.current;
        self.current = self
            .current
            .checked_mul(RETRY_MULTIPLIER)
            .unwrap_or(self.max)
            .min(self.max);
        interval
    }
}

impl Default for RetryScheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Returns the delay until a credential expiring at `expiry` should be refreshed, observed at
/// `now`: half the remaining lifetime plus [`REFRESH_MARGIN`].
///
/// An already expired credential yields just the margin.
pub fn refresh_delay(expiry: OffsetDateTime, now: OffsetDateTime) -> Duration {
    let half_remaining = Duration::try_from((expiry - now) / 2).unwrap_or(Duration::ZERO);
    half_remaining + REFRESH_MARGIN
}

/// Sleeps for `dur` unless `token` is cancelled first. Returns `true` on cancellation.
pub(crate) async fn sleep_or_cancel(token: &CancellationToken, dur: Duration) -> bool {
    tokio::select! {
        () = token.cancelled() => true,
        () = sleep(dur) => false,
    }
}

/// Exponential backoff with small jitter, used for stream reconnects.
///
/// Doubles `current`, clamps it to `max`, and adds 0-10% jitter so a fleet of sidecars started
/// together does not reconnect in lockstep.
#[allow(clippy::cast_possible_truncation)]
pub(crate) fn next_backoff(current: Duration, max: Duration) -> Duration {
    let cur = current.as_millis().min(u128::from(u64::MAX)) as u64;
    let max = max.as_millis().min(u128::from(u64::MAX)) as u64;

    let base = cur.saturating_mul(2).min(max);
    if base == 0 {
        return Duration::ZERO;
    }

    let jitter = base / 10;
    let add = if jitter > 0 {
        fastrand::u64(0..=jitter)
    } else {
        0
    };

    Duration::from_millis(base.saturating_add(add).min(max))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_scheduler_doubles_until_max() {
        let mut scheduler = RetryScheduler::new();
        let intervals: Vec<u64> = (0..9)
            .map(|_| scheduler.next_interval().as_secs())
            .collect();
        assert_eq!(intervals, vec![1, 2, 4, 8, 16, 32, 60, 60, 60]);
    }

    #[test]
    fn test_retry_scheduler_is_non_decreasing_and_bounded() {
        let mut scheduler = RetryScheduler::default();
        let mut previous = Duration::ZERO;
        for _ in 0..100 {
            let next = scheduler.next_interval();
            assert!(next >= previous);
            assert!(next <= MAX_RETRY_INTERVAL);
            previous = next;
        }
    }

    #[test]
    fn test_new_scheduler_starts_over() {
        let mut scheduler = RetryScheduler::new();
        scheduler.next_interval();
        scheduler.next_interval();
        let mut scheduler = RetryScheduler::new();
        assert_eq!(scheduler.next_interval(), INITIAL_RETRY_INTERVAL);
    }

    #[test]
    fn test_with_bounds_clamps_initial() {
        let mut scheduler =
            RetryScheduler::with_bounds(Duration::from_secs(10), Duration::from_secs(5));
        assert_eq!(scheduler.next_interval(), Duration::from_secs(5));
        assert_eq!(scheduler.next_interval(), Duration::from_secs(5));
    }

    #[test]
    fn test_refresh_delay_is_half_lifetime_plus_margin() {
        let now = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        let expiry = now + time::Duration::seconds(10);
        assert_eq!(refresh_delay(expiry, now), Duration::from_secs(6));

        let expiry = now + time::Duration::hours(1);
        assert_eq!(refresh_delay(expiry, now), Duration::from_secs(1801));
    }

    #[test]
    fn test_refresh_delay_for_expired_credential_is_margin() {
        let now = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        let expiry = now - time::Duration::seconds(30);
        assert_eq!(refresh_delay(expiry, now), REFRESH_MARGIN);
        assert_eq!(refresh_delay(now, now), REFRESH_MARGIN);
    }

    #[test]
    fn test_next_backoff_stays_within_bounds() {
        let max = Duration::from_secs(10);
        let next = next_backoff(Duration::from_millis(100), max);
        assert!(next >= Duration::from_millis(200));
        assert!(next <= Duration::from_millis(220));

        assert_eq!(next_backoff(Duration::from_secs(8), max), max);
        assert_eq!(next_backoff(Duration::ZERO, max), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_or_cancel() {
        let token = CancellationToken::new();
        assert!(!sleep_or_cancel(&token, Duration::from_secs(5)).await);

        token.cancel();
        assert!(sleep_or_cancel(&token, Duration::from_secs(3600)).await);
    }
}
