//! Date-deferred tags.
//!
//! An item parked in the tickler carries its wake-up date in its stored tag
//! (`tickler:2024-05-01`, or just `2024-05-01`). Until that date it shows
//! under `tickler`; from that date on it shows under `inbox`.

use crate::document::{INBOX, TICKLER};
use time::{Date, Month, OffsetDateTime};

const DEFERRED_PREFIX: &str = "tickler:";

/// Encodes a deferred tag for `date`.
pub fn deferred_tag(date: Date) -> String {
    format!("{DEFERRED_PREFIX}{}", format_date(date))
}

/// Extracts the wake-up date from a stored tag, if it carries one.
pub fn deferral_date(stored: &str) -> Option<Date> {
    parse_date(stored.strip_prefix(DEFERRED_PREFIX).unwrap_or(stored))
}

/// Resolves a stored tag to the tag it is listed under on `today`.
///
/// Pure: count derivation and item listing must both go through here.
pub fn display_tag(stored: &str, today: Date) -> &str {
    match deferral_date(stored) {
        Some(date) if date <= today => INBOX,
        Some(_) => TICKLER,
        None => stored,
    }
}

/// Today's local calendar date, or the UTC date if the offset is unknown.
pub fn today() -> Date {
    OffsetDateTime::now_local()
        .unwrap_or_else(|_| OffsetDateTime::now_utc())
        .date()
}

/// Formats a date as `YYYY-MM-DD`.
pub fn format_date(date: Date) -> String {
    format!(
        "{:04}-{:02}-{:02}",
        date.year(),
        u8::from(date.month()),
        date.day()
    )
}

/// Parses a strict `YYYY-MM-DD` date.
pub fn parse_date(text: &str) -> Option<Date> {
    let bytes = text.as_bytes();
    if bytes.len() != 10 || bytes[4] != b'-' || bytes[7] != b'-' {
        return None;
    }
    let digits = |range: std::ops::Range<usize>| {
        let part = &text[range];
        part.bytes()
            .all(|b| b.is_ascii_digit())
            .then(|| part.parse::<u32>().ok())
            .flatten()
    };

    let year = i32::try_from(digits(0..4)?).ok()?;
    let month = Month::try_from(u8::try_from(digits(5..7)?).ok()?).ok()?;
    let day = u8::try_from(digits(8..10)?).ok()?;
    Date::from_calendar_date(year, month, day).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u8, d: u8) -> Date {
        Date::from_calendar_date(y, Month::try_from(m).unwrap(), d).unwrap()
    }

    #[test]
    fn deferred_before_due_shows_tickler() {
        let stored = deferred_tag(date(2099, 1, 1));
        assert_eq!(stored, "tickler:2099-01-01");
        assert_eq!(display_tag(&stored, date(2098, 12, 31)), "tickler");
    }

    #[test]
    fn deferred_on_or_after_due_shows_inbox() {
        let stored = "tickler:2099-01-01";
        assert_eq!(display_tag(stored, date(2099, 1, 1)), "inbox");
        assert_eq!(display_tag(stored, date(2100, 6, 1)), "inbox");
    }

    #[test]
    fn bare_date_is_deferred_too() {
        assert_eq!(display_tag("2030-02-03", date(2030, 2, 2)), "tickler");
        assert_eq!(display_tag("2030-02-03", date(2030, 2, 3)), "inbox");
    }

    #[test]
    fn plain_tags_pass_through() {
        let today = date(2024, 1, 1);
        for tag in ["todo", "ref", "tickler", "errands", "tickler:soon", "2024-13-01"] {
            assert_eq!(display_tag(tag, today), tag);
        }
    }

    #[test]
    fn parse_date_is_strict() {
        assert_eq!(parse_date("2024-02-29"), Some(date(2024, 2, 29)));
        assert_eq!(parse_date("2023-02-29"), None);
        assert_eq!(parse_date("2024-2-29"), None);
        assert_eq!(parse_date("+024-02-01"), None);
        assert_eq!(parse_date("2024/02/01"), None);
    }

    #[test]
    fn format_pads_fields() {
        assert_eq!(format_date(date(987, 3, 4)), "0987-03-04");
    }
}
