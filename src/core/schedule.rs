//! Period arithmetic for flow schedules.
//!
//! A [`ScheduleSpec`] turns a cadence, a timezone and a wall-clock anchor into
//! a grid of period start instants. Raw-seconds and hourly cadences step in
//! absolute seconds from the anchor; the daily cadence steps in local
//! calendar days at the anchor's wall-clock time, so DST transitions do not
//! drift the schedule.

use std::fmt;

use chrono::{DateTime, Days, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::core::SchedulerError;

const SECONDS_PER_HOUR: i64 = 3_600;
const SECONDS_PER_DAY: i64 = 86_400;
/// Upper bound for searching past a DST gap.
const MAX_GAP_MINUTES: i64 = 24 * 60;

/// Schedule cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "IntervalRepr", into = "IntervalRepr")]
pub enum Interval {
    /// Every `n` seconds.
    Seconds(u64),
    /// Every hour.
    Hourly,
    /// Every local calendar day.
    Daily,
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum IntervalRepr {
    Seconds(u64),
    Named(String),
}

impl TryFrom<IntervalRepr> for Interval {
    type Error = String;

    fn try_from(repr: IntervalRepr) -> Result<Self, Self::Error> {
        match repr {
            IntervalRepr::Seconds(0) => Err("interval must be greater than zero".to_string()),
            IntervalRepr::Seconds(n) => Ok(Self::Seconds(n)),
            IntervalRepr::Named(name) => match name.as_str() {
                "hourly" => Ok(Self::Hourly),
                "daily" => Ok(Self::Daily),
                other => other
                    .parse::<u64>()
                    .ok()
                    .filter(|n| *n > 0)
                    .map(Self::Seconds)
                    .ok_or_else(|| format!("unknown interval '{other}'")),
            },
        }
    }
}

impl From<Interval> for IntervalRepr {
    fn from(interval: Interval) -> Self {
        match interval {
            Interval::Seconds(n) => Self::Seconds(n),
            Interval::Hourly => Self::Named("hourly".to_string()),
            Interval::Daily => Self::Named("daily".to_string()),
        }
    }
}

impl Interval {
    /// Nominal length of one period.
    #[must_use]
    pub fn as_duration(self) -> chrono::Duration {
        chrono::Duration::seconds(self.as_seconds())
    }

    /// Nominal length of one period in seconds.
    #[must_use]
    pub fn as_seconds(self) -> i64 {
        match self {
            Self::Seconds(n) => i64::try_from(n).unwrap_or(i64::MAX),
            Self::Hourly => SECONDS_PER_HOUR,
            Self::Daily => SECONDS_PER_DAY,
        }
    }

    /// Whether this is a raw-seconds cadence rather than a named one.
    #[must_use]
    pub const fn is_raw_seconds(self) -> bool {
        matches!(self, Self::Seconds(_))
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Seconds(n) => write!(f, "{n}s"),
            Self::Hourly => f.write_str("hourly"),
            Self::Daily => f.write_str("daily"),
        }
    }
}

/// A consecutive run of periods executed as one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeriodWindow {
    /// First period of the window.
    pub start: DateTime<Utc>,
    /// Last period of the window.
    pub end: DateTime<Utc>,
    /// Every period in the window, ascending.
    pub periods: Vec<DateTime<Utc>>,
}

/// Immutable schedule definition with its derived anchor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleSpec {
    interval: Interval,
    timezone: Tz,
    anchor: DateTime<Utc>,
    anchor_time: NaiveTime,
    from_date: Option<NaiveDate>,
    period_length: usize,
    keep_sequence: bool,
}

impl ScheduleSpec {
    /// Build a schedule.
    ///
    /// `start_time` is either `HH:MM[:SS]` (anchored on 1970-01-01) or a local
    /// datetime `YYYY-MM-DD[T ]HH:MM:SS`. A `from_date` re-anchors the schedule
    /// on that date and turns on `keep_sequence`.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Schedule`] for unparsable times, a zero
    /// interval or period length, or `keep_sequence` without `from_date`.
    pub fn new(
        interval: Interval,
        timezone: Tz,
        start_time: &str,
        from_date: Option<NaiveDate>,
        period_length: usize,
        keep_sequence: bool,
    ) -> Result<Self, SchedulerError> {
        if interval == Interval::Seconds(0) {
            return Err(SchedulerError::Schedule("interval must be greater than zero".into()));
        }
        if period_length == 0 {
            return Err(SchedulerError::Schedule("period_length must be at least 1".into()));
        }
        if keep_sequence && from_date.is_none() {
            return Err(SchedulerError::Schedule("keep_sequence requires from_date".into()));
        }

        let start = parse_start_time(start_time)?;
        let anchor_time = start.time();
        let naive_anchor = from_date.map_or(start, |date| date.and_time(anchor_time));
        let anchor = localize(timezone, naive_anchor)?;

        Ok(Self {
            interval,
            timezone,
            anchor,
            anchor_time,
            from_date,
            period_length,
            keep_sequence: keep_sequence || from_date.is_some(),
        })
    }

    /// Cadence.
    #[must_use]
    pub const fn interval(&self) -> Interval {
        self.interval
    }

    /// Timezone used for calendar arithmetic.
    #[must_use]
    pub const fn timezone(&self) -> Tz {
        self.timezone
    }

    /// First instant of the period grid.
    #[must_use]
    pub const fn anchor(&self) -> DateTime<Utc> {
        self.anchor
    }

    /// Backfill anchor date, if configured.
    #[must_use]
    pub const fn from_date(&self) -> Option<NaiveDate> {
        self.from_date
    }

    /// Maximum number of periods batched into one window.
    #[must_use]
    pub const fn period_length(&self) -> usize {
        self.period_length
    }

    /// Whether gaps between the anchor and now are backfilled.
    #[must_use]
    pub const fn keep_sequence(&self) -> bool {
        self.keep_sequence
    }

    /// Move `period` by `n` periods (negative moves backwards).
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Schedule`] if the result is out of range.
    pub fn shift(&self, period: DateTime<Utc>, n: i64) -> Result<DateTime<Utc>, SchedulerError> {
        let out_of_range = || SchedulerError::Schedule(format!("cannot shift {period} by {n} periods"));
        match self.interval {
            Interval::Seconds(_) | Interval::Hourly => {
                let secs = self.interval.as_seconds().checked_mul(n).ok_or_else(out_of_range)?;
                period
                    .checked_add_signed(chrono::Duration::seconds(secs))
                    .ok_or_else(out_of_range)
            }
            Interval::Daily => {
                let date = period.with_timezone(&self.timezone).date_naive();
                let days = Days::new(n.unsigned_abs());
                let date = if n >= 0 {
                    date.checked_add_days(days)
                } else {
                    date.checked_sub_days(days)
                }
                .ok_or_else(out_of_range)?;
                localize(self.timezone, date.and_time(self.anchor_time))
            }
        }
    }

    /// The period following `period`.
    ///
    /// # Errors
    ///
    /// See [`Self::shift`].
    pub fn next_period(&self, period: DateTime<Utc>) -> Result<DateTime<Utc>, SchedulerError> {
        self.shift(period, 1)
    }

    /// Latest period boundary that is not after `now`.
    ///
    /// When `now` precedes the anchor by less than one interval the boundary
    /// before the anchor is returned.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Schedule`] when `now` is more than one
    /// interval before the anchor.
    pub fn current_period(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, SchedulerError> {
        let candidate = match self.interval {
            Interval::Seconds(_) | Interval::Hourly => {
                let step = self.interval.as_seconds();
                let offset = (now - self.anchor).num_seconds().div_euclid(step);
                self.shift(self.anchor, offset)?
            }
            Interval::Daily => {
                let today = now.with_timezone(&self.timezone).date_naive();
                let boundary = localize(self.timezone, today.and_time(self.anchor_time))?;
                if boundary > now {
                    self.shift(boundary, -1)?
                } else {
                    boundary
                }
            }
        };
        if candidate >= self.anchor {
            return Ok(candidate);
        }
        let previous = self.shift(self.anchor, -1)?;
        if now >= previous {
            Ok(previous)
        } else {
            Err(SchedulerError::Schedule(format!(
                "{now} is more than one interval before the schedule anchor {}",
                self.anchor
            )))
        }
    }

    /// Every period from `from` to `to`, both inclusive.
    ///
    /// # Errors
    ///
    /// See [`Self::shift`].
    pub fn periods_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>, SchedulerError> {
        let mut periods = Vec::new();
        let mut period = from;
        while period <= to {
            periods.push(period);
            period = self.shift(period, 1)?;
        }
        Ok(periods)
    }

    /// Group periods into windows of consecutive periods, at most
    /// `period_length` long. Input order and duplicates do not matter.
    ///
    /// # Errors
    ///
    /// See [`Self::shift`].
    pub fn group_periods(
        &self,
        mut periods: Vec<DateTime<Utc>>,
    ) -> Result<Vec<PeriodWindow>, SchedulerError> {
        periods.sort_unstable();
        periods.dedup();

        let mut windows: Vec<PeriodWindow> = Vec::new();
        for period in periods {
            if let Some(window) = windows.last_mut() {
                if window.periods.len() < self.period_length && self.shift(window.end, 1)? == period {
                    window.end = period;
                    window.periods.push(period);
                    continue;
                }
            }
            windows.push(PeriodWindow {
                start: period,
                end: period,
                periods: vec![period],
            });
        }
        Ok(windows)
    }
}

fn parse_start_time(value: &str) -> Result<NaiveDateTime, SchedulerError> {
    let value = value.trim();
    let epoch = NaiveDate::from_ymd_opt(1970, 1, 1)
        .ok_or_else(|| SchedulerError::Schedule("invalid epoch date".into()))?;

    for format in ["%H:%M:%S", "%H:%M"] {
        if let Ok(time) = NaiveTime::parse_from_str(value, format) {
            return Ok(epoch.and_time(time));
        }
    }
    for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M"] {
        if let Ok(datetime) = NaiveDateTime::parse_from_str(value, format) {
            return Ok(datetime);
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        return Ok(date.and_time(NaiveTime::MIN));
    }
    Err(SchedulerError::Schedule(format!("unparsable start_time '{value}'")))
}

/// Resolve a local wall-clock time to UTC.
///
/// Ambiguous times (DST fall-back) take the earlier instant; non-existent
/// times (DST spring-forward) move forward to the first valid instant.
///
/// # Errors
///
/// Returns [`SchedulerError::Schedule`] if no valid instant follows within a day.
pub fn localize(timezone: Tz, naive: NaiveDateTime) -> Result<DateTime<Utc>, SchedulerError> {
    for minutes in 0..=MAX_GAP_MINUTES {
        let candidate = naive + chrono::Duration::minutes(minutes);
        match timezone.from_local_datetime(&candidate) {
            LocalResult::Single(t) | LocalResult::Ambiguous(t, _) => return Ok(t.with_timezone(&Utc)),
            LocalResult::None => {}
        }
    }
    Err(SchedulerError::Schedule(format!(
        "no valid local time for {naive} in {timezone}"
    )))
}
