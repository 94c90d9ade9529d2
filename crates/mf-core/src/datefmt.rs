//! # Date-Format Translation
//!
//! Query models describe string timestamps with reference-time layouts
//! (`2006-01-02 15:04:05`). MongoDB's `$dateFromString` wants `%`-specifiers
//! instead, and only supports a subset of the layout tokens. This module owns
//! both directions the engine needs:
//!
//! - [`layout_to_mongo`] for the time-match stage sent to the database.
//! - [`parse_timestamp`] / [`format_timestamp`] for parsing and rendering
//!   timestamps locally, with `chrono` and the full token set.
//!
//! Tables are scanned in declared order at every position, so longer tokens
//! must precede their prefixes (`2006` before `06`, `January` before `Jan`).

use chrono::format::{Fixed, Item, Numeric, Pad, Parsed};
use chrono::{DateTime, NaiveTime, TimeZone, Utc};
use thiserror::Error;

/// Layout token to MongoDB specifier. `None` means MongoDB has no
/// equivalent and translating a layout containing it is an error.
pub const MONGO_DATE_SPECIFIERS: &[(&str, Option<&str>)] = &[
    ("%", Some("%%")),
    ("2006", Some("%Y")),
    ("06", None),
    ("January", Some("%B")),
    ("Jan", Some("%b")),
    ("15", Some("%H")),
    ("01", Some("%m")),
    ("1", None),
    ("Monday", None),
    ("Mon", None),
    ("__2", Some("%j")),
    ("002", Some("%j")),
    ("02", Some("%d")),
    ("_2", Some("%d")),
    ("2", None),
    ("03", None),
    ("3", None),
    ("04", Some("%M")),
    ("4", None),
    ("05", Some("%S")),
    ("5", None),
    ("PM", None),
    ("-0700", Some("%z")),
    ("-07", Some("%z")),
];

#[derive(Debug, Error, PartialEq)]
pub enum DateFormatError {
    #[error(
        "MongoDB does not have an equivalent for the following date specifiers: {}",
        unsupported.join(", ")
    )]
    Unsupported {
        /// Translation of everything else, unsupported tokens dropped.
        translated: String,
        unsupported: Vec<String>,
    },
}

#[derive(Debug, Error)]
pub enum TimestampParseError {
    #[error("Could not parse timestamp {value:?} with layout {layout:?}: {source}")]
    Parse {
        value: String,
        layout: String,
        source: chrono::format::ParseError,
    },
}

/// Translate a reference-time layout into a `$dateFromString` format.
pub fn layout_to_mongo(layout: &str) -> Result<String, DateFormatError> {
    let mut translated = String::with_capacity(layout.len() * 2);
    let mut unsupported = Vec::new();
    let mut rest = layout;

    while !rest.is_empty() {
        let matched = MONGO_DATE_SPECIFIERS
            .iter()
            .find(|(token, _)| rest.starts_with(token));
        match matched {
            Some((token, Some(specifier))) => {
                translated.push_str(specifier);
                rest = &rest[token.len()..];
            }
            Some((token, None)) => {
                unsupported.push((*token).to_string());
                rest = &rest[token.len()..];
            }
            None => {
                let ch = rest.chars().next().unwrap_or_default();
                translated.push(ch);
                rest = &rest[ch.len_utf8()..];
            }
        }
    }

    if unsupported.is_empty() {
        Ok(translated)
    } else {
        Err(DateFormatError::Unsupported {
            translated,
            unsupported,
        })
    }
}

// =============================================================================
// Local parsing / formatting
// =============================================================================

enum Token {
    Item(Item<'static>),
    Literal,
}

const fn num(n: Numeric, pad: Pad) -> Token {
    Token::Item(Item::Numeric(n, pad))
}

const fn fixed(f: Fixed) -> Token {
    Token::Item(Item::Fixed(f))
}

/// Layout token to chrono item, longest tokens first.
const CHRONO_ITEMS: &[(&str, Token)] = &[
    ("%", Token::Literal),
    ("2006", num(Numeric::Year, Pad::Zero)),
    ("06", num(Numeric::YearMod100, Pad::Zero)),
    ("January", fixed(Fixed::LongMonthName)),
    ("Jan", fixed(Fixed::ShortMonthName)),
    ("15", num(Numeric::Hour, Pad::Zero)),
    ("01", num(Numeric::Month, Pad::Zero)),
    ("1", num(Numeric::Month, Pad::None)),
    ("Monday", fixed(Fixed::LongWeekdayName)),
    ("Mon", fixed(Fixed::ShortWeekdayName)),
    ("MST", fixed(Fixed::TimezoneName)),
    ("__2", num(Numeric::Ordinal, Pad::Space)),
    ("002", num(Numeric::Ordinal, Pad::Zero)),
    ("02", num(Numeric::Day, Pad::Zero)),
    ("_2", num(Numeric::Day, Pad::Space)),
    ("2", num(Numeric::Day, Pad::None)),
    ("03", num(Numeric::Hour12, Pad::Zero)),
    ("3", num(Numeric::Hour12, Pad::None)),
    ("04", num(Numeric::Minute, Pad::Zero)),
    ("4", num(Numeric::Minute, Pad::None)),
    ("05", num(Numeric::Second, Pad::Zero)),
    ("5", num(Numeric::Second, Pad::None)),
    ("PM", fixed(Fixed::UpperAmPm)),
    ("pm", fixed(Fixed::LowerAmPm)),
    ("Z07:00", fixed(Fixed::TimezoneOffsetColonZ)),
    ("Z0700", fixed(Fixed::TimezoneOffsetZ)),
    ("Z07", fixed(Fixed::TimezoneOffsetZ)),
    ("-07:00", fixed(Fixed::TimezoneOffsetColon)),
    ("-0700", fixed(Fixed::TimezoneOffset)),
    ("-07", fixed(Fixed::TimezoneOffset)),
    (".000000000", fixed(Fixed::Nanosecond9)),
    (".000000", fixed(Fixed::Nanosecond6)),
    (".000", fixed(Fixed::Nanosecond3)),
    (".999999999", fixed(Fixed::Nanosecond)),
    (".999999", fixed(Fixed::Nanosecond)),
    (".999", fixed(Fixed::Nanosecond)),
];

/// Translate a layout into chrono format items. Literal text borrows from
/// the layout; whitespace runs become [`Item::Space`].
pub fn layout_to_chrono_items(layout: &str) -> Vec<Item<'_>> {
    let mut items = Vec::new();
    let mut rest = layout;

    while !rest.is_empty() {
        if let Some((token, kind)) = CHRONO_ITEMS.iter().find(|(t, _)| rest.starts_with(t)) {
            match kind {
                Token::Item(item) => items.push(item.clone()),
                Token::Literal => items.push(Item::Literal(&rest[..token.len()])),
            }
            rest = &rest[token.len()..];
            continue;
        }

        let ch = rest.chars().next().unwrap_or_default();
        if ch.is_whitespace() {
            let end = rest
                .find(|c: char| !c.is_whitespace())
                .unwrap_or(rest.len());
            items.push(Item::Space(&rest[..end]));
            rest = &rest[end..];
        } else {
            items.push(Item::Literal(&rest[..ch.len_utf8()]));
            rest = &rest[ch.len_utf8()..];
        }
    }
    items
}

/// Parse a timestamp string with a reference-time layout.
///
/// Layouts without a zone parse as UTC; layouts without a clock parse as
/// midnight; a 12-hour clock without `PM` is read as AM.
pub fn parse_timestamp(layout: &str, value: &str) -> Result<DateTime<Utc>, TimestampParseError> {
    let items = layout_to_chrono_items(layout);
    let wrap = |source| TimestampParseError::Parse {
        value: value.to_string(),
        layout: layout.to_string(),
        source,
    };

    let mut parsed = Parsed::new();
    let twelve_hour = items
        .iter()
        .any(|i| matches!(i, Item::Numeric(Numeric::Hour12, _)));
    let has_ampm = items
        .iter()
        .any(|i| matches!(i, Item::Fixed(Fixed::UpperAmPm | Fixed::LowerAmPm)));
    if twelve_hour && !has_ampm {
        parsed.set_ampm(false).map_err(wrap)?;
    }
    chrono::format::parse(&mut parsed, value, items.iter()).map_err(wrap)?;

    if let Ok(zoned) = parsed.to_datetime() {
        return Ok(zoned.with_timezone(&Utc));
    }
    let date = parsed.to_naive_date().map_err(wrap)?;
    let time = parsed.to_naive_time().unwrap_or_else(|_| NaiveTime::default());
    Ok(Utc.from_utc_datetime(&date.and_time(time)))
}

/// Render a timestamp with a reference-time layout.
pub fn format_timestamp(layout: &str, time: &DateTime<Utc>) -> String {
    let items = layout_to_chrono_items(layout);
    time.format_with_items(items.iter()).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn test_truncated_ruby_date() {
        // time.RubyDate without the weekday
        assert_eq!(
            layout_to_mongo("Jan 02 15:04:05 -0700 2006").unwrap(),
            "%b %d %H:%M:%S %z %Y"
        );
    }

    #[test]
    fn test_space_padded_day() {
        assert_eq!(
            layout_to_mongo("Jan _2 15:04:05 2006").unwrap(),
            "%b %d %H:%M:%S %Y"
        );
    }

    #[test]
    fn test_unsupported_tokens_are_all_named() {
        let err = layout_to_mongo("Mon Jan 2 2006").unwrap_err();
        let DateFormatError::Unsupported {
            translated,
            unsupported,
        } = &err;
        assert_eq!(unsupported, &vec!["Mon".to_string(), "2".to_string()]);
        assert_eq!(translated, " %b  %Y");
        let message = err.to_string();
        assert!(message.contains("Mon, 2"), "{}", message);
    }

    #[test]
    fn test_longest_tokens_win() {
        assert_eq!(layout_to_mongo("January 2006").unwrap(), "%B %Y");
        assert_eq!(layout_to_mongo("002").unwrap(), "%j");
        assert_eq!(layout_to_mongo("__2").unwrap(), "%j");
        assert_eq!(layout_to_mongo("-07").unwrap(), "%z");
        assert_eq!(
            layout_to_mongo("100%").unwrap_err(),
            DateFormatError::Unsupported {
                translated: "00%%".into(),
                unsupported: vec!["1".into()],
            }
        );
    }

    #[test]
    fn test_mapped_layouts_leave_no_native_tokens() {
        let layouts = [
            "2006-01-02T15:04:05-0700",
            "02/01/2006 15:04",
            "January 02, 2006",
            "2006.002",
        ];
        for layout in layouts {
            let translated = layout_to_mongo(layout).unwrap();
            for native in ["2006", "January", "Jan", "15", "01", "02", "04", "05", "-0700"] {
                assert!(!translated.contains(native), "{} -> {}", layout, translated);
            }
        }
    }

    #[test]
    fn test_literal_text_is_copied() {
        assert_eq!(layout_to_mongo("T: 2006 é").unwrap(), "T: %Y é");
    }

    #[test]
    fn test_parse_without_zone_is_utc() {
        let t = parse_timestamp("2006-01-02 15:04:05", "2023-11-14 22:13:20").unwrap();
        assert_eq!(t.timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_parse_with_offset() {
        let t = parse_timestamp("Jan 02 15:04:05 -0700 2006", "Nov 14 23:13:20 +0100 2023").unwrap();
        assert_eq!(t.timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_parse_date_only_is_midnight() {
        let t = parse_timestamp("2006-01-02", "2023-11-14").unwrap();
        assert_eq!((t.hour(), t.minute(), t.second()), (0, 0, 0));
    }

    #[test]
    fn test_parse_twelve_hour_clock() {
        let t = parse_timestamp("2006-01-02 03:04PM", "2023-11-14 10:13PM").unwrap();
        assert_eq!(t.hour(), 22);
        let t = parse_timestamp("2006-01-02 03:04", "2023-11-14 10:13").unwrap();
        assert_eq!(t.hour(), 10);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_timestamp("2006-01-02", "yesterday").is_err());
    }

    #[test]
    fn test_format_round_trips_parse() {
        let layout = "2006-01-02T15:04:05Z07:00";
        let t = parse_timestamp(layout, "2023-11-14T22:13:20Z").unwrap();
        assert_eq!(format_timestamp(layout, &t), "2023-11-14T22:13:20Z");
    }
}
