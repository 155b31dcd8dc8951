use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, NaiveDateTime};

/// Locks `mutex`, carrying on with the data if a previous holder panicked.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub fn read<T>(rwlock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    rwlock.read().unwrap_or_else(PoisonError::into_inner)
}

pub fn write<T>(rwlock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    rwlock.write().unwrap_or_else(PoisonError::into_inner)
}

/// Replaces a NaN error rate with the worst possible one.
pub fn coerce_error_rate(error_rate: f64) -> f64 {
    if error_rate.is_nan() {
        1.0
    } else {
        error_rate
    }
}

/// Replaces a NaN latency (in seconds) with a value no healthy node could ever reach.
pub fn coerce_latency(latency: f64) -> f64 {
    if latency.is_nan() {
        1_000_000.0
    } else {
        latency
    }
}

/// Parses a node timestamp (`2024-01-01T00:00:03`, optionally with an offset), falling back to the
/// Unix epoch.
pub fn parse_timestamp(raw: &str) -> NaiveDateTime {
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S")
        .or_else(|_| DateTime::parse_from_rfc3339(raw).map(|time| time.naive_utc()))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;

    #[test]
    fn test_parse_timestamp() {
        let expected = NaiveDate::from_ymd_opt(2024, 1, 1)
            .and_then(|date| date.and_hms_opt(0, 0, 3))
            .unwrap();
        assert_eq!(parse_timestamp("2024-01-01T00:00:03"), expected);
        assert_eq!(parse_timestamp("2024-01-01T00:00:03Z"), expected);
        assert_eq!(parse_timestamp("yesterday"), NaiveDateTime::default());
    }

    #[test]
    fn test_nan_coercion() {
        assert_eq!(coerce_error_rate(f64::NAN), 1.0);
        assert_eq!(coerce_latency(f64::NAN), 1_000_000.0);
        assert_eq!(coerce_latency(0.25), 0.25);
    }
}
