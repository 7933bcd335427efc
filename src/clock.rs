//
// Wall-clock <-> instant conversions with IANA zone support
//

use chrono::{DateTime, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

use crate::error::Error;

pub const DATE_FMT: &str = "%Y-%m-%d";
pub const TIME_FMT: &str = "%H:%M";

/// Resolves an optional IANA zone name. Absent or blank zones are interpreted
/// as UTC so conversions stay deterministic.
pub fn parse_zone(tz: Option<&str>) -> Result<Tz, Error> {
    match tz.map(str::trim) {
        None | Some("") => Ok(Tz::UTC),
        Some(name) => match name.parse::<Tz>() {
            Ok(zone) => Ok(zone),
            Err(_) => err_silent!(format!("Unknown IANA time zone: {name}")),
        },
    }
}

pub fn parse_date(date: &str) -> Result<NaiveDate, Error> {
    Ok(NaiveDate::parse_from_str(date.trim(), DATE_FMT)?)
}

pub fn parse_time(time: &str) -> Result<NaiveTime, Error> {
    Ok(NaiveTime::parse_from_str(time.trim(), TIME_FMT)?)
}

/// Converts a wall-clock date + time in the given zone to an instant.
///
/// Nonexistent wall times (spring-forward gap) are rounded forward to the
/// next representable minute in the zone. Ambiguous wall times (fall-back
/// overlap) resolve to the first, earlier instant.
pub fn to_instant(date: &str, time: &str, tz: Option<&str>) -> Result<DateTime<Utc>, Error> {
    let zone = parse_zone(tz)?;
    let wall = parse_date(date)?.and_time(parse_time(time)?);
    wall_to_instant(wall, zone)
}

pub fn wall_to_instant(wall: NaiveDateTime, zone: Tz) -> Result<DateTime<Utc>, Error> {
    let mut candidate = wall;
    // DST gaps are bounded (at most a few hours anywhere in the tz database),
    // so walking forward one minute at a time terminates quickly.
    for _ in 0..=180 {
        match zone.from_local_datetime(&candidate) {
            LocalResult::Single(dt) => return Ok(dt.with_timezone(&Utc)),
            LocalResult::Ambiguous(earliest, _) => return Ok(earliest.with_timezone(&Utc)),
            LocalResult::None => {
                candidate += chrono::TimeDelta::try_minutes(1).unwrap();
            }
        }
    }
    err_silent!(format!("Wall time {wall} cannot be mapped into zone {zone}"))
}

/// Converts an instant back to the wall-clock date and time in the zone.
pub fn from_instant(instant: DateTime<Utc>, tz: Option<&str>) -> Result<(String, String), Error> {
    let zone = parse_zone(tz)?;
    let local = instant.with_timezone(&zone);
    Ok((local.format(DATE_FMT).to_string(), local.format(TIME_FMT).to_string()))
}

/// Builds the `[start, end)` instant pair of an event span. A missing end
/// date falls back to the start date; a missing end time falls back to the
/// start time.
pub fn span_to_instants(
    date: &str,
    time: &str,
    end_date: Option<&str>,
    end_time: Option<&str>,
    tz: Option<&str>,
) -> Result<(DateTime<Utc>, DateTime<Utc>), Error> {
    let start = to_instant(date, time, tz)?;
    let end = to_instant(end_date.unwrap_or(date), end_time.unwrap_or(time), tz)?;
    Ok((start, end))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utc_roundtrip() {
        let instant = to_instant("2025-06-15", "14:30", None).unwrap();
        assert_eq!(instant.to_rfc3339(), "2025-06-15T14:30:00+00:00");

        let (date, time) = from_instant(instant, None).unwrap();
        assert_eq!(date, "2025-06-15");
        assert_eq!(time, "14:30");
    }

    #[test]
    fn blank_zone_is_utc() {
        let a = to_instant("2025-06-15", "09:00", None).unwrap();
        let b = to_instant("2025-06-15", "09:00", Some("  ")).unwrap();
        let c = to_instant("2025-06-15", "09:00", Some("UTC")).unwrap();
        assert_eq!(a, b);
        assert_eq!(a, c);
    }

    #[test]
    fn unknown_zone_is_rejected() {
        assert!(to_instant("2025-06-15", "09:00", Some("Mars/Olympus_Mons")).is_err());
    }

    #[test]
    fn spring_forward_rounds_to_next_representable_minute() {
        // 2025-03-09 02:30 does not exist in America/Los_Angeles; the clock
        // jumps from 02:00 PST to 03:00 PDT.
        let instant = to_instant("2025-03-09", "02:30", Some("America/Los_Angeles")).unwrap();
        assert_eq!(instant.to_rfc3339(), "2025-03-09T10:00:00+00:00");

        let (date, time) = from_instant(instant, Some("America/Los_Angeles")).unwrap();
        assert_eq!(date, "2025-03-09");
        assert_eq!(time, "03:00");
    }

    #[test]
    fn fall_back_resolves_to_earlier_instant() {
        // 2025-11-02 01:30 happens twice in America/Los_Angeles; the earlier
        // occurrence is still PDT (UTC-7).
        let instant = to_instant("2025-11-02", "01:30", Some("America/Los_Angeles")).unwrap();
        assert_eq!(instant.to_rfc3339(), "2025-11-02T08:30:00+00:00");
    }

    #[test]
    fn span_defaults_end_to_start() {
        let (start, end) = span_to_instants("2025-06-15", "14:30", None, None, None).unwrap();
        assert_eq!(start, end);

        let (start, end) = span_to_instants("2025-06-15", "14:30", None, Some("16:00"), None).unwrap();
        assert_eq!((end - start).num_minutes(), 90);
    }

    #[test]
    fn malformed_inputs_are_rejected() {
        assert!(to_instant("2025/06/15", "14:30", None).is_err());
        assert!(to_instant("2025-06-15", "2pm", None).is_err());
    }
}
