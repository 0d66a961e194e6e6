//! Small conversions shared by the storage components.
//!
//! Timestamps are bound to `sqlx::Any` as millisecond Unix epoch integers
//! rather than a driver-native timestamp type, because `Any` only
//! guarantees a narrow common type surface across Postgres/MySQL/SQLite
//! (see DESIGN.md). JSON payloads are likewise bound as TEXT.

use chrono::{DateTime, TimeZone, Utc};

pub fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub fn from_millis(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis).single().unwrap_or_else(Utc::now)
}

pub fn opt_from_millis(millis: Option<i64>) -> Option<DateTime<Utc>> {
    millis.map(from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips() {
        let now = Utc::now();
        let millis = to_millis(now);
        let back = from_millis(millis);
        assert_eq!(to_millis(back), millis);
    }
}
