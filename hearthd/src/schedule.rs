//! Schedule validation and next-run math.
//!
//! - `cron`: 5-field expressions get a seconds column prepended; evaluated
//!   in the configured IANA timezone, first occurrence strictly after now.
//! - `interval`: positive milliseconds from now.
//! - `once`: a local wall-clock timestamp without offset; no next run after it fires.

use std::str::FromStr;

use chrono::{DateTime, Duration as ChronoDuration, LocalResult, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use hearth_core::model::{ScheduleKind, format_ts};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("invalid cron expression {value:?}: {reason}")]
    InvalidCron { value: String, reason: String },
    #[error("interval must be a positive number of milliseconds, got {0:?}")]
    InvalidInterval(String),
    #[error("invalid timestamp {0:?}, expected YYYY-MM-DDTHH:MM:SS")]
    InvalidTimestamp(String),
    #[error("timestamp {0:?} must be local time without a Z or UTC offset")]
    OffsetNotAllowed(String),
    #[error("local time {value:?} does not exist in {timezone}")]
    NonexistentLocalTime { value: String, timezone: String },
    #[error("unknown schedule type {0:?}")]
    UnknownKind(String),
}

/// Parses an IANA zone name, falling back to UTC with a warning.
pub fn resolve_timezone(name: &str) -> Tz {
    match name.parse::<Tz>() {
        Ok(tz) => tz,
        Err(_) => {
            warn!(tz = name, "invalid timezone, falling back to UTC");
            Tz::UTC
        }
    }
}

pub fn parse_kind(raw: &str) -> Result<ScheduleKind, ScheduleError> {
    raw.parse()
        .map_err(|_| ScheduleError::UnknownKind(raw.to_string()))
}

fn parse_cron(value: &str) -> Result<cron::Schedule, ScheduleError> {
    let trimmed = value.trim();
    let expr = if trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    };
    cron::Schedule::from_str(&expr).map_err(|err| ScheduleError::InvalidCron {
        value: value.to_string(),
        reason: err.to_string(),
    })
}

fn parse_interval(value: &str) -> Result<ChronoDuration, ScheduleError> {
    match value.trim().parse::<i64>() {
        Ok(ms) if ms > 0 => Ok(ChronoDuration::milliseconds(ms)),
        _ => Err(ScheduleError::InvalidInterval(value.to_string())),
    }
}

fn has_offset_suffix(value: &str) -> bool {
    let time_part = value.split_once('T').map(|(_, t)| t).unwrap_or("");
    time_part.contains(['Z', 'z', '+', '-'])
}

/// Interprets a `once` value as wall-clock time in `tz`.
pub fn parse_local_timestamp(value: &str, tz: Tz) -> Result<DateTime<Utc>, ScheduleError> {
    let trimmed = value.trim();
    if has_offset_suffix(trimmed) {
        return Err(ScheduleError::OffsetNotAllowed(value.to_string()));
    }
    let naive = NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S%.f")
        .map_err(|_| ScheduleError::InvalidTimestamp(value.to_string()))?;
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => Ok(dt.with_timezone(&Utc)),
        // Repeated hour at a DST fall-back: take the first occurrence.
        LocalResult::Ambiguous(earliest, _) => Ok(earliest.with_timezone(&Utc)),
        LocalResult::None => Err(ScheduleError::NonexistentLocalTime {
            value: value.to_string(),
            timezone: tz.name().to_string(),
        }),
    }
}

pub fn validate(kind: ScheduleKind, value: &str, tz: Tz) -> Result<(), ScheduleError> {
    match kind {
        ScheduleKind::Cron => parse_cron(value).map(|_| ()),
        ScheduleKind::Interval => parse_interval(value).map(|_| ()),
        ScheduleKind::Once => parse_local_timestamp(value, tz).map(|_| ()),
    }
}

/// `next_run` for a newly created task.
pub fn initial_next_run(
    kind: ScheduleKind,
    value: &str,
    tz: Tz,
    now: DateTime<Utc>,
) -> Result<Option<String>, ScheduleError> {
    match kind {
        ScheduleKind::Once => parse_local_timestamp(value, tz).map(|at| Some(format_ts(at))),
        _ => next_run_after(kind, value, tz, now),
    }
}

/// `next_run` after a run finished at `now`. `None` for one-shot tasks.
pub fn next_run_after(
    kind: ScheduleKind,
    value: &str,
    tz: Tz,
    now: DateTime<Utc>,
) -> Result<Option<String>, ScheduleError> {
    match kind {
        ScheduleKind::Cron => {
            let schedule = parse_cron(value)?;
            Ok(schedule
                .after(&now.with_timezone(&tz))
                .next()
                .map(|at| format_ts(at.with_timezone(&Utc))))
        }
        ScheduleKind::Interval => Ok(Some(format_ts(now + parse_interval(value)?))),
        ScheduleKind::Once => Ok(None),
    }
}

/// `next_run` for a resumed task. A future value is kept; a stale or missing
/// one is recomputed. One-shot tasks keep their original time.
pub fn resumed_next_run(
    kind: ScheduleKind,
    value: &str,
    current: Option<&str>,
    tz: Tz,
    now: DateTime<Utc>,
) -> Result<Option<String>, ScheduleError> {
    let now_str = format_ts(now);
    match (kind, current) {
        (_, Some(next)) if next >= now_str.as_str() => Ok(Some(next.to_string())),
        (ScheduleKind::Once, _) => initial_next_run(kind, value, tz, now),
        _ => next_run_after(kind, value, tz, now),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn five_field_cron_gets_seconds_column() {
        let next = next_run_after(ScheduleKind::Cron, "*/15 * * * *", Tz::UTC, at("2026-05-01T10:07:30Z"))
            .unwrap();
        assert_eq!(next.as_deref(), Some("2026-05-01T10:15:00.000Z"));
    }

    #[test]
    fn cron_is_strictly_after_now() {
        let next = next_run_after(ScheduleKind::Cron, "0 0 10 * * *", Tz::UTC, at("2026-05-01T10:00:00Z"))
            .unwrap();
        assert_eq!(next.as_deref(), Some("2026-05-02T10:00:00.000Z"));
    }

    #[test]
    fn cron_uses_configured_timezone() {
        let tz: Tz = "Europe/Berlin".parse().unwrap();
        // 09:00 Berlin in summer is 07:00 UTC.
        let next = next_run_after(ScheduleKind::Cron, "0 9 * * *", tz, at("2026-07-01T06:00:00Z")).unwrap();
        assert_eq!(next.as_deref(), Some("2026-07-01T07:00:00.000Z"));
    }

    #[test]
    fn invalid_cron_is_rejected() {
        let err = validate(ScheduleKind::Cron, "not a cron", Tz::UTC).unwrap_err();
        assert!(matches!(err, ScheduleError::InvalidCron { .. }));
    }

    #[test]
    fn interval_must_be_positive_ms() {
        let now = at("2026-05-01T10:00:00Z");
        let next = next_run_after(ScheduleKind::Interval, "90000", Tz::UTC, now).unwrap();
        assert_eq!(next.as_deref(), Some("2026-05-01T10:01:30.000Z"));
        for bad in ["0", "-5", "abc", ""] {
            assert_eq!(
                validate(ScheduleKind::Interval, bad, Tz::UTC),
                Err(ScheduleError::InvalidInterval(bad.to_string()))
            );
        }
    }

    #[test]
    fn once_is_local_time() {
        let tz: Tz = "Europe/Berlin".parse().unwrap();
        let next = initial_next_run(ScheduleKind::Once, "2026-07-01T09:00:00", tz, Utc::now()).unwrap();
        assert_eq!(next.as_deref(), Some("2026-07-01T07:00:00.000Z"));
        let frac = initial_next_run(ScheduleKind::Once, "2026-07-01T09:00:00.250", tz, Utc::now()).unwrap();
        assert_eq!(frac.as_deref(), Some("2026-07-01T07:00:00.250Z"));
        assert_eq!(next_run_after(ScheduleKind::Once, "2026-07-01T09:00:00", tz, Utc::now()), Ok(None));
    }

    #[test]
    fn once_rejects_offsets() {
        for value in ["2026-07-01T09:00:00Z", "2026-07-01T09:00:00+02:00", "2026-07-01T09:00:00-0500"] {
            assert_eq!(
                validate(ScheduleKind::Once, value, Tz::UTC),
                Err(ScheduleError::OffsetNotAllowed(value.to_string()))
            );
        }
        assert!(matches!(
            validate(ScheduleKind::Once, "tomorrow", Tz::UTC),
            Err(ScheduleError::InvalidTimestamp(_))
        ));
    }

    #[test]
    fn once_rejects_dst_gap() {
        let tz: Tz = "Europe/Berlin".parse().unwrap();
        let err = validate(ScheduleKind::Once, "2026-03-29T02:30:00", tz).unwrap_err();
        assert!(matches!(err, ScheduleError::NonexistentLocalTime { .. }));
    }

    #[test]
    fn resume_keeps_future_and_recomputes_stale() {
        let now = at("2026-05-01T10:00:00Z");
        let future = "2026-05-01T11:00:00.000Z";
        assert_eq!(
            resumed_next_run(ScheduleKind::Interval, "60000", Some(future), Tz::UTC, now).unwrap().as_deref(),
            Some(future)
        );
        assert_eq!(
            resumed_next_run(ScheduleKind::Interval, "60000", Some("2026-04-01T00:00:00.000Z"), Tz::UTC, now)
                .unwrap()
                .as_deref(),
            Some("2026-05-01T10:01:00.000Z")
        );
        assert_eq!(
            resumed_next_run(ScheduleKind::Once, "2026-04-01T08:00:00", None, Tz::UTC, now).unwrap().as_deref(),
            Some("2026-04-01T08:00:00.000Z")
        );
    }

    #[test]
    fn unknown_kind_and_timezone() {
        assert_eq!(parse_kind("weekly"), Err(ScheduleError::UnknownKind("weekly".into())));
        assert_eq!(parse_kind("cron"), Ok(ScheduleKind::Cron));
        assert_eq!(resolve_timezone("Mars/Olympus"), Tz::UTC);
    }
}
