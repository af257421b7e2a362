//! HTTP-date (IMF-fixdate) formatting and parsing.
//!
//! Conditional GET compares at second granularity, so parsing drops any
//! sub-second component.

use time::format_description::FormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};

const IMF_FIXDATE: &[FormatItem<'_>] = format_description!(
    "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
);

/// Format a timestamp as an IMF-fixdate string, e.g.
/// `Mon, 20 Nov 2023 14:05:44 GMT`.
pub fn format_http_date(ts: OffsetDateTime) -> String {
    ts.to_offset(UtcOffset::UTC)
        .replace_nanosecond(0)
        .unwrap_or(ts)
        .format(IMF_FIXDATE)
        .unwrap_or_default()
}

/// Parse an IMF-fixdate string. Returns `None` for anything malformed.
pub fn parse_http_date(value: &str) -> Option<OffsetDateTime> {
    PrimitiveDateTime::parse(value.trim(), IMF_FIXDATE)
        .ok()
        .map(PrimitiveDateTime::assume_utc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_format_http_date() {
        let ts = datetime!(2023-11-20 14:05:44 UTC);
        assert_eq!(format_http_date(ts), "Mon, 20 Nov 2023 14:05:44 GMT");
    }

    #[test]
    fn test_parse_http_date_round_trip() {
        let raw = "Sat, 19 Dec 2023 11:25:44 GMT";
        let parsed = parse_http_date(raw).unwrap();
        assert_eq!(format_http_date(parsed), "Tue, 19 Dec 2023 11:25:44 GMT");
    }

    #[test]
    fn test_parse_http_date_rejects_garbage() {
        assert!(parse_http_date("not a date").is_none());
        assert!(parse_http_date("").is_none());
    }

    #[test]
    fn test_format_drops_subseconds() {
        let ts = datetime!(2023-11-20 14:05:44.987 UTC);
        assert_eq!(format_http_date(ts), "Mon, 20 Nov 2023 14:05:44 GMT");
    }
}
