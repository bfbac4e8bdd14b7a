#![forbid(unsafe_code)]

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, SecondsFormat, Utc};

/// Current Unix time in milliseconds.
#[inline]
pub fn unix_ms_now() -> i64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.unwrap_or(Duration::from_secs(0))
		.as_millis() as i64
}

/// Current time truncated to millisecond precision (what the store keeps).
pub fn now_ms_precision() -> DateTime<Utc> {
	from_unix_ms(unix_ms_now())
}

/// Unix milliseconds to UTC; out-of-range values clamp to the epoch.
pub fn from_unix_ms(ms: i64) -> DateTime<Utc> {
	DateTime::from_timestamp_millis(ms).unwrap_or(DateTime::UNIX_EPOCH)
}

/// Client-supplied RFC3339 timestamp, or now when missing or unparseable.
pub fn client_timestamp_or_now(raw: Option<&str>) -> DateTime<Utc> {
	raw.map(str::trim)
		.filter(|s| !s.is_empty())
		.and_then(|s| DateTime::parse_from_rfc3339(s).ok())
		.map(|ts| from_unix_ms(ts.with_timezone(&Utc).timestamp_millis()))
		.unwrap_or_else(now_ms_precision)
}

/// Canonical wire format: RFC3339, UTC, `Z` suffix.
pub fn to_rfc3339(ts: DateTime<Utc>) -> String {
	ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn client_timestamp_is_normalised_to_utc() {
		let ts = client_timestamp_or_now(Some("2024-05-01T12:00:00+02:00"));
		assert_eq!(to_rfc3339(ts), "2024-05-01T10:00:00Z");
	}

	#[test]
	fn sub_millisecond_precision_is_dropped() {
		let ts = client_timestamp_or_now(Some("2024-05-01T10:00:00.123456Z"));
		assert_eq!(to_rfc3339(ts), "2024-05-01T10:00:00.123Z");
	}

	#[test]
	fn garbage_falls_back_to_now() {
		let before = unix_ms_now();
		let ts = client_timestamp_or_now(Some("yesterday-ish"));
		assert!(ts.timestamp_millis() >= before);

		let ts = client_timestamp_or_now(None);
		assert!(ts.timestamp_millis() >= before);
	}
}
