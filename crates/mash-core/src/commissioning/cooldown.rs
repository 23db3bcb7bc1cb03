//! Parses the device's cooldown error-string contract (spec.md §4.5.2,
//! §6 "Error-string contract", Property P6).
//!
//! Cooldown errors carry the literal substring
//! `cooldown active (<go-duration> remaining)`, where `<go-duration>` is a
//! Go-style duration like `"460.930083ms"` or `"1h2m3s"`.

use std::time::Duration;

const MARKER_PREFIX: &str = "cooldown active (";
const MARKER_SUFFIX: &str = " remaining)";

/// Extracts the remaining duration from a device error string, per the
/// wire contract. Returns `None` if the marker is absent or malformed.
pub fn extract_cooldown_duration(text: &str) -> Option<Duration> {
    let start = text.find(MARKER_PREFIX)? + MARKER_PREFIX.len();
    let rest = &text[start..];
    let end = rest.find(MARKER_SUFFIX)?;
    parse_go_duration(&rest[..end])
}

/// `cooldown_remaining(err)` from Property P6: zero for no marker,
/// `parsed + 200ms` for a well-formed one, monotone in the parsed value.
pub fn cooldown_remaining(text: &str) -> Duration {
    match extract_cooldown_duration(text) {
        Some(parsed) => parsed + Duration::from_millis(200),
        None => Duration::ZERO,
    }
}

/// Parses a Go-style duration string: a sequence of `<number><unit>` pairs
/// (`ns`, `us`/`µs`, `ms`, `s`, `m`, `h`), each number optionally fractional.
/// Go's own parser also accepts a leading sign and no separators between
/// components (`"1h2m3s"`); this covers the subset the cooldown contract
/// actually emits.
fn parse_go_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    let mut total = Duration::ZERO;
    let mut rest = s;
    let mut saw_component = false;

    while !rest.is_empty() {
        let digits_end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if digits_end == 0 {
            return None;
        }
        let (number_str, after_number) = rest.split_at(digits_end);
        let number: f64 = number_str.parse().ok()?;

        let (unit, after_unit) = parse_unit(after_number)?;
        let nanos = number * unit.nanos_per_unit();
        if nanos < 0.0 || !nanos.is_finite() {
            return None;
        }
        total += Duration::from_nanos(nanos.round() as u64);
        rest = after_unit;
        saw_component = true;
    }

    if saw_component {
        Some(total)
    } else {
        None
    }
}

#[derive(Clone, Copy)]
enum Unit {
    Nanos,
    Micros,
    Millis,
    Seconds,
    Minutes,
    Hours,
}

impl Unit {
    fn nanos_per_unit(self) -> f64 {
        match self {
            Unit::Nanos => 1.0,
            Unit::Micros => 1_000.0,
            Unit::Millis => 1_000_000.0,
            Unit::Seconds => 1_000_000_000.0,
            Unit::Minutes => 60.0 * 1_000_000_000.0,
            Unit::Hours => 3_600.0 * 1_000_000_000.0,
        }
    }
}

fn parse_unit(s: &str) -> Option<(Unit, &str)> {
    for (prefix, unit) in [
        ("ns", Unit::Nanos),
        ("us", Unit::Micros),
        ("\u{b5}s", Unit::Micros),
        ("ms", Unit::Millis),
        ("s", Unit::Seconds),
        ("m", Unit::Minutes),
        ("h", Unit::Hours),
    ] {
        if let Some(rest) = s.strip_prefix(prefix) {
            return Some((unit, rest));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_marker_means_zero() {
        assert_eq!(cooldown_remaining("some unrelated error"), Duration::ZERO);
    }

    #[test]
    fn well_formed_marker_adds_200ms_buffer() {
        let got = cooldown_remaining("device said: cooldown active (250ms remaining) try later");
        assert_eq!(got, Duration::from_millis(450));
    }

    #[test]
    fn fractional_milliseconds_parse() {
        let got = extract_cooldown_duration("cooldown active (460.930083ms remaining)").unwrap();
        assert_eq!(got, Duration::from_nanos(460_930_083));
    }

    #[test]
    fn compound_duration_parses() {
        let got = extract_cooldown_duration("cooldown active (1h2m3s remaining)").unwrap();
        assert_eq!(got, Duration::from_secs(3600 + 120 + 3));
    }

    #[test]
    fn is_monotone_in_parsed_duration() {
        let a = cooldown_remaining("cooldown active (100ms remaining)");
        let b = cooldown_remaining("cooldown active (200ms remaining)");
        assert!(a < b);
    }
}
