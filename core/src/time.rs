//! Time related utils.

use chrono::Utc;

/// The UTC datetime used across signing.
pub type DateTime = chrono::DateTime<Utc>;

/// Take the current time.
pub fn now() -> DateTime {
    Utc::now()
}

/// Format a datetime as the credential-scope date: "20220313".
pub fn format_date(t: DateTime) -> String {
    t.format("%Y%m%d").to_string()
}

/// Format a datetime as compact ISO 8601: "20220313T072004Z".
pub fn format_iso8601(t: DateTime) -> String {
    t.format("%Y%m%dT%H%M%SZ").to_string()
}
