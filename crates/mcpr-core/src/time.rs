//! Wall-clock timestamps.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A UTC wall-clock timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(pub DateTime<Utc>);

impl Timestamp {
    /// The current time.
    #[must_use]
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// A timestamp `ms` milliseconds in the future.
    #[must_use]
    pub fn in_millis(ms: i64) -> Self {
        Self(Utc::now() + Duration::milliseconds(ms))
    }

    /// Whether this timestamp lies in the past.
    #[must_use]
    pub fn is_past(&self) -> bool {
        self.0 < Utc::now()
    }

    /// Whether this timestamp lies in the future.
    #[must_use]
    pub fn is_future(&self) -> bool {
        self.0 > Utc::now()
    }

    /// Milliseconds elapsed since this timestamp (zero if in the future).
    #[must_use]
    pub fn elapsed_millis(&self) -> u64 {
        (Utc::now() - self.0).num_milliseconds().max(0) as u64
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_is_not_future() {
        assert!(!Timestamp::now().is_future());
    }

    #[test]
    fn test_in_millis() {
        assert!(Timestamp::in_millis(60_000).is_future());
        assert!(Timestamp::in_millis(-60_000).is_past());
    }

    #[test]
    fn test_elapsed() {
        let past = Timestamp::in_millis(-1_500);
        assert!(past.elapsed_millis() >= 1_500);
        assert_eq!(Timestamp::in_millis(60_000).elapsed_millis(), 0);
    }

    #[test]
    fn test_serde_roundtrip() {
        let ts = Timestamp::now();
        let json = serde_json::to_string(&ts).unwrap();
        let back: Timestamp = serde_json::from_str(&json).unwrap();
        assert_eq!(ts, back);
    }
}
