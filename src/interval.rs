//! Schedule expression parsing and next-run computation.
//!
//! Four textual forms are accepted, detected in this order:
//!
//! 1. numeric seconds (`"90"`)
//! 2. daily fixed time (`"AT 09:30"`, `"AT 09:30:15"`)
//! 3. cron, five or six fields (`"*/5 * * * *"`, `"30 4 2 * * *"`)
//! 4. human intervals (`"3 hours 15 minutes"`, `"2h"`, `"1 week"`)
//!
//! Cron and daily schedules are calendar-based: the computed duration is
//! "base → next occurrence" in the job's zone and can vary between runs.

use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

use crate::errors::Error;

/// A parsed schedule expression.
#[derive(Debug, Clone)]
pub enum Schedule {
    /// Fixed interval given as bare seconds.
    Seconds(u64),
    /// Once per day at a fixed wall-clock time.
    DailyAt(NaiveTime),
    /// Cron expression, normalized to six fields.
    Cron(Box<cron::Schedule>),
    /// Fixed interval given as human-readable text.
    Interval(Duration),
}

impl Schedule {
    /// Parse a schedule spec, applying the form precedence above.
    pub fn parse(spec: &str) -> Result<Schedule, Error> {
        let s = spec.trim();
        if s.is_empty() {
            return Err(Error::InvalidSchedule(
                "schedule spec must not be blank".into(),
            ));
        }

        if s.bytes().all(|b| b.is_ascii_digit()) {
            let seconds = s.parse::<u64>().map_err(|_| {
                Error::InvalidSchedule(format!("interval seconds out of range: {s}"))
            })?;
            if seconds == 0 {
                return Err(Error::InvalidSchedule(format!(
                    "interval seconds must be positive: {s}"
                )));
            }
            return Ok(Schedule::Seconds(seconds));
        }

        if let Some(time_of_day) = s.strip_prefix("AT ") {
            return Ok(Schedule::DailyAt(parse_time_of_day(time_of_day.trim())?));
        }

        if let Ok(schedule) = cron::Schedule::from_str(&normalize_cron(s)) {
            return Ok(Schedule::Cron(Box::new(schedule)));
        }

        parse_human_interval(s).map(Schedule::Interval)
    }

    /// The next instant strictly after `base`, evaluated in `zone`.
    pub fn next_after(&self, base: DateTime<Utc>, zone: Tz) -> Result<DateTime<Utc>, Error> {
        match self {
            Schedule::Seconds(seconds) => add_to(base, Duration::seconds(*seconds as i64)),
            Schedule::Interval(duration) => add_to(base, *duration),
            Schedule::Cron(schedule) => schedule
                .after(&base.with_timezone(&zone))
                .next()
                .map(|next| next.with_timezone(&Utc))
                .ok_or_else(|| {
                    Error::InvalidSchedule("cron expression has no future fire time".into())
                }),
            Schedule::DailyAt(time) => next_daily_occurrence(*time, base, zone),
        }
    }
}

/// Parse `spec` and compute the duration from `from` to the next occurrence.
pub fn parse_duration(spec: &str, zone: Tz, from: DateTime<Utc>) -> Result<Duration, Error> {
    let next = Schedule::parse(spec)?.next_after(from, zone)?;
    Ok(next - from)
}

/// Compute the next run time from persisted scheduling fields.
///
/// Returns `Ok(None)` for one-time jobs (absent or blank `interval`). The
/// base instant is the later of `previous_next_run_at` and `finished_at`
/// (now, if both are absent). An unparseable zone id falls back to UTC.
pub fn compute_next_run_at(
    interval: Option<&str>,
    timezone: Option<&str>,
    previous_next_run_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
) -> Result<Option<DateTime<Utc>>, Error> {
    let Some(spec) = interval.map(str::trim).filter(|s| !s.is_empty()) else {
        return Ok(None);
    };

    let base = match (previous_next_run_at, finished_at) {
        (Some(previous), Some(finished)) => previous.max(finished),
        (Some(previous), None) => previous,
        (None, Some(finished)) => finished,
        (None, None) => Utc::now(),
    };

    let zone = resolve_zone(timezone);
    Schedule::parse(spec)?.next_after(base, zone).map(Some)
}

/// Resolve an IANA zone id, falling back to UTC when absent or unparseable.
pub fn resolve_zone(timezone: Option<&str>) -> Tz {
    timezone.and_then(|id| id.parse().ok()).unwrap_or(Tz::UTC)
}

/// True if `spec` validates as a cron expression after normalization.
pub fn looks_like_cron(spec: &str) -> bool {
    cron::Schedule::from_str(&normalize_cron(spec.trim())).is_ok()
}

/// Normalize a cron spec to the six-field form with leading seconds.
///
/// Five fields get `"0"` prepended; when day-of-month and day-of-week are
/// both `*`, day-of-week becomes `?`. Anything else passes through and is
/// left to cron validation.
fn normalize_cron(spec: &str) -> String {
    let fields: Vec<&str> = spec.split_whitespace().collect();
    match fields.as_slice() {
        [minute, hour, dom, month, dow] => join_cron("0", minute, hour, dom, month, dow),
        [second, minute, hour, dom, month, dow] => {
            join_cron(second, minute, hour, dom, month, dow)
        }
        _ => spec.to_string(),
    }
}

fn join_cron(second: &str, minute: &str, hour: &str, dom: &str, month: &str, dow: &str) -> String {
    let dow = if dom == "*" && dow == "*" { "?" } else { dow };
    format!("{second} {minute} {hour} {dom} {month} {dow}")
}

pub(crate) fn parse_time_of_day(s: &str) -> Result<NaiveTime, Error> {
    NaiveTime::parse_from_str(s, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
        .map_err(|_| {
            Error::InvalidSchedule(format!("expected HH:mm or HH:mm:ss time of day: {s}"))
        })
}

/// The earliest instant whose wall clock in `zone` equals `time` and which
/// is strictly after `base`. Local times skipped by a DST gap roll forward.
pub(crate) fn next_daily_occurrence(
    time: NaiveTime,
    base: DateTime<Utc>,
    zone: Tz,
) -> Result<DateTime<Utc>, Error> {
    let mut date = base.with_timezone(&zone).date_naive();
    // Two iterations in the common case; a couple more across DST gaps.
    for _ in 0..4 {
        if let Some(candidate) = zone.from_local_datetime(&date.and_time(time)).earliest() {
            let candidate = candidate.with_timezone(&Utc);
            if candidate > base {
                return Ok(candidate);
            }
        }
        date = date.succ_opt().ok_or_else(|| {
            Error::InvalidSchedule("daily schedule overflows the calendar".into())
        })?;
    }
    Err(Error::InvalidSchedule(format!(
        "no next occurrence of {time} found in zone {zone}"
    )))
}

fn add_to(base: DateTime<Utc>, duration: Duration) -> Result<DateTime<Utc>, Error> {
    base.checked_add_signed(duration)
        .ok_or_else(|| Error::InvalidSchedule("interval overflows the calendar".into()))
}

/// Compact single-unit form: `"30s"`, `"5m"`, `"2h"`, `"7d"`, `"1w"`.
fn parse_compact(s: &str) -> Option<Duration> {
    let unit = s.chars().last()?;
    let seconds_per = match unit {
        's' => 1,
        'm' => 60,
        'h' => 3_600,
        'd' => 86_400,
        'w' => 7 * 86_400,
        _ => return None,
    };
    let digits = s[..s.len() - 1].trim();
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let count = digits.parse::<i64>().ok()?;
    count.checked_mul(seconds_per).map(Duration::seconds)
}

fn parse_human_interval(input: &str) -> Result<Duration, Error> {
    let s = input.trim().to_ascii_lowercase();

    if let Some(duration) = parse_compact(&s) {
        return Ok(duration);
    }

    let parts: Vec<&str> = s.split_whitespace().collect();
    if parts.is_empty() || parts.len() % 2 != 0 {
        return Err(Error::InvalidSchedule(format!(
            "expected '<count> <unit>' pairs like '3 minutes': {input}"
        )));
    }

    // month, week, day, hour, minute, second
    let mut seen = [false; 6];
    let mut total_seconds: i64 = 0;

    for pair in parts.chunks(2) {
        let count = pair[0].parse::<i64>().map_err(|_| {
            Error::InvalidSchedule(format!("invalid count in interval: {}", pair[0]))
        })?;
        if count < 0 {
            return Err(Error::InvalidSchedule(
                "interval counts must not be negative".into(),
            ));
        }

        let unit = pair[1].strip_suffix('s').unwrap_or(pair[1]);
        let (slot, seconds_per) = match unit {
            "month" => (0, 30 * 86_400),
            "week" => (1, 7 * 86_400),
            "day" => (2, 86_400),
            "hour" => (3, 3_600),
            "minute" => (4, 60),
            "second" => (5, 1),
            _ => {
                return Err(Error::InvalidSchedule(format!(
                    "unsupported interval unit: {}",
                    pair[1]
                )));
            }
        };

        if seen[slot] {
            return Err(Error::InvalidSchedule(format!("duplicate unit: {unit}")));
        }
        seen[slot] = true;

        total_seconds = count
            .checked_mul(seconds_per)
            .and_then(|component| total_seconds.checked_add(component))
            .ok_or_else(|| Error::InvalidSchedule(format!("interval out of range: {input}")))?;
    }

    Ok(Duration::seconds(total_seconds))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use claims::{assert_err, assert_none, assert_ok};

    fn utc(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[test]
    fn human_interval_five_minutes() {
        let duration = parse_duration("5 minutes", Tz::UTC, utc("2026-01-01T00:00:00Z")).unwrap();
        assert_eq!(duration, Duration::seconds(300));
    }

    #[test]
    fn human_interval_mixed_units() {
        let duration = parse_duration("1 day 3 hours", Tz::UTC, utc("2026-01-01T00:00:00Z"));
        assert_eq!(duration.unwrap(), Duration::seconds(97_200));
    }

    #[test]
    fn human_interval_month_is_thirty_days() {
        let duration = parse_duration("2 months", Tz::UTC, utc("2026-01-01T00:00:00Z"));
        assert_eq!(duration.unwrap(), Duration::days(60));
    }

    #[test]
    fn compact_forms() {
        let from = utc("2026-01-01T00:00:00Z");
        assert_eq!(
            parse_duration("30s", Tz::UTC, from).unwrap(),
            Duration::seconds(30)
        );
        assert_eq!(
            parse_duration("5m", Tz::UTC, from).unwrap(),
            Duration::minutes(5)
        );
        assert_eq!(
            parse_duration("2h", Tz::UTC, from).unwrap(),
            Duration::hours(2)
        );
        assert_eq!(
            parse_duration("7d", Tz::UTC, from).unwrap(),
            Duration::days(7)
        );
        assert_eq!(
            parse_duration("1w", Tz::UTC, from).unwrap(),
            Duration::weeks(1)
        );
    }

    #[test]
    fn numeric_seconds_take_precedence() {
        assert!(matches!(Schedule::parse("90"), Ok(Schedule::Seconds(90))));
        assert!(matches!(Schedule::parse("007"), Ok(Schedule::Seconds(7))));
        let duration = parse_duration("90", Tz::UTC, utc("2026-01-01T00:00:00Z"));
        assert_eq!(duration.unwrap(), Duration::seconds(90));
    }

    #[test]
    fn zero_and_overlong_numeric_seconds_fail() {
        assert_err!(Schedule::parse("0"));
        assert_err!(Schedule::parse("99999999999999999999999999"));
    }

    #[test]
    fn duplicate_units_fail() {
        assert_err!(Schedule::parse("3 hours 2 hours"));
        assert_err!(Schedule::parse("1 hour 1 hours"));
    }

    #[test]
    fn negative_and_malformed_intervals_fail() {
        assert_err!(Schedule::parse("-5 minutes"));
        assert_err!(Schedule::parse("five minutes"));
        assert_err!(Schedule::parse("3 fortnights"));
        assert_err!(Schedule::parse(""));
        assert_err!(Schedule::parse("   "));
    }

    #[test]
    fn five_field_cron_next_fire() {
        let duration = parse_duration("*/5 * * * *", Tz::UTC, utc("2026-01-01T00:01:00Z"));
        assert_eq!(duration.unwrap(), Duration::seconds(240));
    }

    #[test]
    fn six_field_cron_keeps_seconds() {
        let duration = parse_duration("30 4 2 * * *", Tz::UTC, utc("2026-01-01T00:00:00Z"));
        // next fire at 02:04:30Z
        assert_eq!(duration.unwrap(), Duration::seconds(2 * 3_600 + 4 * 60 + 30));
    }

    #[test]
    fn cron_is_strictly_after_base() {
        let duration = parse_duration("*/5 * * * *", Tz::UTC, utc("2026-01-01T00:05:00Z"));
        assert_eq!(duration.unwrap(), Duration::seconds(300));
    }

    #[test]
    fn cron_in_zone() {
        // 02:00 Taipei == 18:00 UTC the previous day
        let duration = parse_duration(
            "0 2 * * *",
            "Asia/Taipei".parse().unwrap(),
            utc("2026-01-01T00:00:00Z"),
        );
        assert_eq!(duration.unwrap(), Duration::hours(18));
    }

    #[test]
    fn wildcard_dom_dow_cron_parses() {
        assert!(looks_like_cron("* * * * *"));
        assert!(looks_like_cron("0 0 * * *"));
        assert!(looks_like_cron("0 0 2 * * *"));
        assert!(!looks_like_cron("once a day"));
    }

    #[test]
    fn compute_next_run_uses_later_of_previous_and_finished() {
        let next = compute_next_run_at(
            Some("*/5 * * * *"),
            Some("UTC"),
            Some(utc("2026-01-01T00:05:00Z")),
            Some(utc("2026-01-01T00:06:00Z")),
        );
        assert_eq!(next.unwrap(), Some(utc("2026-01-01T00:10:00Z")));
    }

    #[test]
    fn compute_next_run_absent_interval_is_none() {
        let finished = Some(utc("2026-01-01T00:00:00Z"));
        assert_none!(compute_next_run_at(None, None, None, finished).unwrap());
        assert_none!(compute_next_run_at(Some("  "), None, None, finished).unwrap());
    }

    #[test]
    fn daily_at_rolls_to_next_day() {
        let next = compute_next_run_at(
            Some("AT 10:00"),
            Some("UTC"),
            Some(utc("2026-01-01T10:00:00Z")),
            Some(utc("2026-01-01T10:01:00Z")),
        );
        assert_eq!(next.unwrap(), Some(utc("2026-01-02T10:00:00Z")));
    }

    #[test]
    fn daily_at_same_day_when_still_ahead() {
        let next = compute_next_run_at(
            Some("AT 23:30"),
            Some("UTC"),
            None,
            Some(utc("2026-01-01T10:00:00Z")),
        );
        assert_eq!(next.unwrap(), Some(utc("2026-01-01T23:30:00Z")));
    }

    #[test]
    fn daily_at_respects_zone() {
        // 09:00 Taipei on Jan 2 == 01:00 UTC on Jan 2
        let next = compute_next_run_at(
            Some("AT 09:00"),
            Some("Asia/Taipei"),
            None,
            Some(utc("2026-01-01T02:00:00Z")),
        );
        assert_eq!(next.unwrap(), Some(utc("2026-01-02T01:00:00Z")));
    }

    #[test]
    fn daily_at_with_seconds() {
        match assert_ok!(Schedule::parse("AT 09:30:15")) {
            Schedule::DailyAt(time) => {
                assert_eq!(time, NaiveTime::from_hms_opt(9, 30, 15).unwrap());
            }
            other => panic!("expected a daily schedule, got {other:?}"),
        }
    }

    #[test]
    fn invalid_time_of_day_fails() {
        assert_err!(Schedule::parse("AT 25:00"));
        assert_err!(Schedule::parse("AT noon"));
    }

    #[test]
    fn unparseable_zone_falls_back_to_utc() {
        assert_eq!(resolve_zone(Some("Not/AZone")), Tz::UTC);
        assert_eq!(resolve_zone(None), Tz::UTC);
        assert_eq!(
            resolve_zone(Some("Asia/Taipei")),
            "Asia/Taipei".parse::<Tz>().unwrap()
        );
    }

    #[test]
    fn interval_parse_precedence() {
        // all-digits is numeric seconds, not a one-field cron
        assert!(matches!(Schedule::parse("300"), Ok(Schedule::Seconds(300))));
        // five tokens that validate as cron stay cron
        assert!(matches!(Schedule::parse("*/5 * * * *"), Ok(Schedule::Cron(_))));
        // pairs that fail cron validation fall through to the human parser
        assert!(matches!(Schedule::parse("3 hours"), Ok(Schedule::Interval(_))));
    }
}
