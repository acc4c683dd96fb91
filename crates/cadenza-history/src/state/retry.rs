// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Activity retry backoff.

use chrono::{DateTime, Duration, Utc};

use crate::types::RetryPolicy;

/// Longest delay between two attempts (100 years).
const MAX_BACKOFF_MILLIS: i64 = 100 * 365 * 24 * 60 * 60 * 1000;

/// Delay before retrying an activity whose attempt `attempt` just failed
/// with `reason`, or `None` when the failure is final.
pub fn next_backoff(
    policy: &RetryPolicy,
    attempt: i32,
    reason: &str,
    now: DateTime<Utc>,
    expiration_time: Option<DateTime<Utc>>,
) -> Option<Duration> {
    if policy.initial_interval_seconds <= 0 {
        return None;
    }
    if policy.maximum_attempts > 0 && attempt + 1 >= policy.maximum_attempts {
        return None;
    }
    if policy
        .non_retriable_error_reasons
        .iter()
        .any(|r| r == reason)
    {
        return None;
    }

    let coefficient = policy.backoff_coefficient.max(1.0);
    let mut seconds = f64::from(policy.initial_interval_seconds) * coefficient.powi(attempt.max(0));
    if policy.maximum_interval_seconds > 0 {
        seconds = seconds.min(f64::from(policy.maximum_interval_seconds));
    }
    // Clamp before converting; powi overflows to infinity for large attempts.
    let millis = (seconds * 1000.0).min(MAX_BACKOFF_MILLIS as f64) as i64;
    let backoff = Duration::milliseconds(millis);

    let retry_at = now.checked_add_signed(backoff)?;
    if let Some(expiration) = expiration_time
        && retry_at > expiration
    {
        return None;
    }
    Some(backoff)
}

/// Absolute retry deadline for a policy first scheduled at `scheduled`.
pub fn expiration_time(policy: &RetryPolicy, scheduled: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if policy.expiration_interval_seconds <= 0 {
        return None;
    }
    scheduled.checked_add_signed(Duration::seconds(i64::from(policy.expiration_interval_seconds)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            initial_interval_seconds: 1,
            backoff_coefficient: 2.0,
            maximum_interval_seconds: 10,
            maximum_attempts: 5,
            non_retriable_error_reasons: vec!["fatal".into()],
            expiration_interval_seconds: 0,
        }
    }

    #[test]
    fn test_exponential_backoff_capped() {
        let now = Utc::now();
        let p = policy();
        assert_eq!(next_backoff(&p, 0, "io", now, None), Some(Duration::seconds(1)));
        assert_eq!(next_backoff(&p, 1, "io", now, None), Some(Duration::seconds(2)));
        assert_eq!(next_backoff(&p, 3, "io", now, None), Some(Duration::seconds(8)));
        let mut unbounded = p.clone();
        unbounded.maximum_attempts = 0;
        assert_eq!(
            next_backoff(&unbounded, 6, "io", now, None),
            Some(Duration::seconds(10))
        );
    }

    #[test]
    fn test_final_failures() {
        let now = Utc::now();
        let p = policy();
        assert_eq!(next_backoff(&p, 4, "io", now, None), None);
        assert_eq!(next_backoff(&p, 0, "fatal", now, None), None);
        assert_eq!(
            next_backoff(&p, 0, "io", now, Some(now + Duration::milliseconds(500))),
            None
        );
        assert_eq!(next_backoff(&RetryPolicy::default(), 0, "io", now, None), None);
    }

    #[test]
    fn test_expiration_time() {
        let now = Utc::now();
        let mut p = policy();
        assert_eq!(expiration_time(&p, now), None);
        p.expiration_interval_seconds = 30;
        assert_eq!(expiration_time(&p, now), Some(now + Duration::seconds(30)));
    }

    #[test]
    fn test_backoff_is_bounded_for_uncapped_policies() {
        let now = Utc::now();
        let mut p = policy();
        p.maximum_attempts = 0;
        p.maximum_interval_seconds = 0;

        for attempt in [43, 60, 1_000, i32::MAX] {
            let backoff = next_backoff(&p, attempt, "io", now, None).unwrap();
            assert_eq!(backoff, Duration::milliseconds(MAX_BACKOFF_MILLIS));
            assert!(now.checked_add_signed(backoff).is_some());
        }

        let expiration = now + Duration::days(1);
        assert_eq!(next_backoff(&p, 60, "io", now, Some(expiration)), None);
    }

    #[test]
    fn test_unrepresentable_retry_time_is_final() {
        let p = policy();
        let latest = DateTime::<Utc>::MAX_UTC - Duration::milliseconds(500);
        assert_eq!(next_backoff(&p, 0, "io", latest, None), None);
    }
}
