//! Calendar-aware period arithmetic.
//!
//! A period is `factor × unit` anchored at a fixed instant. Window boundaries
//! are always `anchor + k × step` for an integer `k`, computed from the anchor
//! rather than by repeated addition. Month and year steps add calendar months
//! on the wall clock of the period's timezone; every other unit is a fixed
//! duration.

use crate::core::windowing::Window;
use chrono::{DateTime, Datelike, Duration, LocalResult, Months, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Granularity of a period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeriodUnit {
    Second,
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Year,
}

impl PeriodUnit {
    /// Length in seconds for fixed-duration units, `None` for month and year.
    pub fn fixed_seconds(self) -> Option<i64> {
        match self {
            PeriodUnit::Second => Some(1),
            PeriodUnit::Minute => Some(60),
            PeriodUnit::Hour => Some(3_600),
            PeriodUnit::Day => Some(86_400),
            PeriodUnit::Week => Some(604_800),
            PeriodUnit::Month | PeriodUnit::Year => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            PeriodUnit::Second => "second",
            PeriodUnit::Minute => "minute",
            PeriodUnit::Hour => "hour",
            PeriodUnit::Day => "day",
            PeriodUnit::Week => "week",
            PeriodUnit::Month => "month",
            PeriodUnit::Year => "year",
        }
    }
}

impl fmt::Display for PeriodUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PeriodUnit {
    type Err = PeriodError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().trim_end_matches('s') {
            "second" => Ok(PeriodUnit::Second),
            "minute" => Ok(PeriodUnit::Minute),
            "hour" => Ok(PeriodUnit::Hour),
            "day" => Ok(PeriodUnit::Day),
            "week" => Ok(PeriodUnit::Week),
            "month" => Ok(PeriodUnit::Month),
            "year" => Ok(PeriodUnit::Year),
            _ => Err(PeriodError::UnknownUnit(s.to_string())),
        }
    }
}

/// Invalid period definitions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PeriodError {
    #[error("period factor must be a positive integer")]
    ZeroFactor,
    #[error("unknown period unit: {0}")]
    UnknownUnit(String),
}

fn default_timezone() -> Tz {
    Tz::UTC
}

/// Configured period: `factor × unit` from `anchor`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeriodSpec {
    /// First window boundary
    pub anchor: DateTime<Utc>,
    pub unit: PeriodUnit,
    pub factor: u32,
    /// Wall clock used for month and year arithmetic
    #[serde(default = "default_timezone")]
    pub timezone: Tz,
}

impl PeriodSpec {
    pub fn new(anchor: DateTime<Utc>, unit: PeriodUnit, factor: u32) -> Self {
        Self {
            anchor,
            unit,
            factor,
            timezone: Tz::UTC,
        }
    }

    pub fn with_timezone(mut self, timezone: Tz) -> Self {
        self.timezone = timezone;
        self
    }
}

impl fmt::Display for PeriodSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} from {}", self.factor, self.unit, self.anchor)
    }
}

/// One step of a period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Calendar months added on the wall clock
    Months(u32),
    /// Fixed elapsed duration
    Fixed(Duration),
}

/// Boundaries `[start, end)` snapped to the period grid, with their indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeriodRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Index `k` of `start`
    pub first: i64,
    /// Index `k` of `end`
    pub last: i64,
}

impl PeriodRange {
    /// Number of whole steps in the range.
    pub fn len(&self) -> i64 {
        self.last - self.first
    }

    pub fn is_empty(&self) -> bool {
        self.len() <= 0
    }
}

/// Window boundary arithmetic for one [`PeriodSpec`].
#[derive(Debug, Clone)]
pub struct PeriodWindower {
    anchor: DateTime<Utc>,
    unit: PeriodUnit,
    factor: u32,
    timezone: Tz,
}

impl PeriodWindower {
    pub fn new(spec: &PeriodSpec) -> Result<Self, PeriodError> {
        if spec.factor == 0 {
            return Err(PeriodError::ZeroFactor);
        }
        Ok(Self {
            anchor: spec.anchor,
            unit: spec.unit,
            factor: spec.factor,
            timezone: spec.timezone,
        })
    }

    pub fn anchor(&self) -> DateTime<Utc> {
        self.anchor
    }

    pub fn unit(&self) -> PeriodUnit {
        self.unit
    }

    pub fn factor(&self) -> u32 {
        self.factor
    }

    /// `factor × unit` as a calendar-correct delta.
    pub fn step(&self) -> Step {
        match self.unit {
            PeriodUnit::Month => Step::Months(self.factor),
            PeriodUnit::Year => Step::Months(self.factor.saturating_mul(12)),
            unit => {
                let secs = unit.fixed_seconds().unwrap_or(1) * i64::from(self.factor);
                Step::Fixed(Duration::seconds(secs))
            }
        }
    }

    /// Boundary `anchor + k × step`.
    pub fn boundary(&self, k: i64) -> Option<DateTime<Utc>> {
        match self.step() {
            Step::Months(months) => self.shift_months(self.anchor, i64::from(months).checked_mul(k)?),
            Step::Fixed(step) => {
                let delta = Duration::try_seconds(step.num_seconds().checked_mul(k)?)?;
                self.anchor.checked_add_signed(delta)
            }
        }
    }

    /// Window `[boundary(k), boundary(k + 1))`.
    pub fn window(&self, k: i64) -> Option<Window> {
        Some(Window::new(self.boundary(k)?, self.boundary(k.checked_add(1)?)?))
    }

    /// Windows covering a snapped range, in ascending order.
    pub fn windows<'a>(
        &'a self,
        range: &PeriodRange,
    ) -> impl DoubleEndedIterator<Item = Window> + 'a {
        (range.first..range.last).filter_map(move |k| self.window(k))
    }

    /// Whole units between `a` and `b`, or `None` when fewer than `factor`.
    ///
    /// Years and months count calendar months on the wall clock; other units
    /// divide the elapsed time by the unit length and may be fractional.
    pub fn periods_between(&self, a: DateTime<Utc>, b: DateTime<Utc>) -> Option<f64> {
        let count = match self.unit.fixed_seconds() {
            Some(secs) => (b - a).num_milliseconds() as f64 / (secs as f64 * 1000.0),
            None => {
                let months = self.full_months(a, b)?;
                if self.unit == PeriodUnit::Year {
                    (months / 12) as f64
                } else {
                    months as f64
                }
            }
        };

        if count < f64::from(self.factor) {
            None
        } else {
            Some(count)
        }
    }

    /// Maximal grid-aligned `[w1, w2)` inside `[d1, d2]`, without the
    /// minimum-length check of [`valid_range`](Self::valid_range).
    pub fn aligned_range(&self, d1: DateTime<Utc>, d2: DateTime<Utc>) -> Option<PeriodRange> {
        if d2 <= d1 {
            return None;
        }

        let mut first = self.steps_from_anchor(d1)?;
        while self.boundary(first)? < d1 {
            first += 1;
        }
        while self.boundary(first - 1)? >= d1 {
            first -= 1;
        }

        let mut last = self.steps_from_anchor(d2)?;
        while self.boundary(last)? > d2 {
            last -= 1;
        }
        while self.boundary(last + 1)? <= d2 {
            last += 1;
        }

        if last <= first {
            return None;
        }
        Some(PeriodRange {
            start: self.boundary(first)?,
            end: self.boundary(last)?,
            first,
            last,
        })
    }

    /// Maximal grid-aligned `[w1, w2)` inside `[d1, d2]` holding at least one
    /// full period.
    pub fn valid_range(&self, d1: DateTime<Utc>, d2: DateTime<Utc>) -> Option<PeriodRange> {
        let range = self.aligned_range(d1, d2)?;
        self.periods_between(range.start, range.end)?;
        Some(range)
    }

    /// Approximate step index of `at`; callers correct it against real boundaries.
    fn steps_from_anchor(&self, at: DateTime<Utc>) -> Option<i64> {
        let factor = i64::from(self.factor);
        let units = match self.unit.fixed_seconds() {
            Some(secs) => (at - self.anchor).num_seconds().div_euclid(secs),
            None => {
                let months = self.full_months(self.anchor, at)?;
                if self.unit == PeriodUnit::Year {
                    months.div_euclid(12)
                } else {
                    months
                }
            }
        };
        Some(units.div_euclid(factor))
    }

    /// Whole calendar months from `a` to `b` on the local wall clock (signed).
    fn full_months(&self, a: DateTime<Utc>, b: DateTime<Utc>) -> Option<i64> {
        let local_a = a.with_timezone(&self.timezone).naive_local();
        let local_b = b.with_timezone(&self.timezone).naive_local();

        let mut months = i64::from(local_b.year() - local_a.year()) * 12
            + i64::from(local_b.month()) - i64::from(local_a.month());
        if months > 0 && shift_naive_months(local_a, months)? > local_b {
            months -= 1;
        } else if months < 0 && shift_naive_months(local_a, months)? < local_b {
            months += 1;
        }
        Some(months)
    }

    fn shift_months(&self, at: DateTime<Utc>, months: i64) -> Option<DateTime<Utc>> {
        let local = at.with_timezone(&self.timezone).naive_local();
        resolve_local(&self.timezone, shift_naive_months(local, months)?)
    }
}

/// Calendar month addition; the day is clamped to the end of short months.
fn shift_naive_months(at: NaiveDateTime, months: i64) -> Option<NaiveDateTime> {
    let magnitude = Months::new(u32::try_from(months.unsigned_abs()).ok()?);
    if months >= 0 {
        at.checked_add_months(magnitude)
    } else {
        at.checked_sub_months(magnitude)
    }
}

/// Map a wall-clock time to an instant. Ambiguous times take the earliest
/// instant; times inside a DST gap are pushed forward past the gap.
fn resolve_local(timezone: &Tz, local: NaiveDateTime) -> Option<DateTime<Utc>> {
    match timezone.from_local_datetime(&local) {
        LocalResult::Single(at) => Some(at.with_timezone(&Utc)),
        LocalResult::Ambiguous(earliest, _) => Some(earliest.with_timezone(&Utc)),
        LocalResult::None => (1..=3).find_map(|hours| {
            timezone
                .from_local_datetime(&(local + Duration::hours(hours)))
                .earliest()
                .map(|at| at.with_timezone(&Utc))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, s).unwrap()
    }

    fn windower(anchor: DateTime<Utc>, unit: PeriodUnit, factor: u32) -> PeriodWindower {
        PeriodWindower::new(&PeriodSpec::new(anchor, unit, factor)).unwrap()
    }

    #[test]
    fn test_zero_factor_rejected() {
        let spec = PeriodSpec::new(utc(2024, 1, 1, 0, 0, 0), PeriodUnit::Day, 0);
        assert_eq!(PeriodWindower::new(&spec).unwrap_err(), PeriodError::ZeroFactor);
    }

    #[test]
    fn test_unit_parsing() {
        assert_eq!("month".parse::<PeriodUnit>().unwrap(), PeriodUnit::Month);
        assert_eq!("Weeks".parse::<PeriodUnit>().unwrap(), PeriodUnit::Week);
        assert!(matches!(
            "fortnight".parse::<PeriodUnit>(),
            Err(PeriodError::UnknownUnit(_))
        ));
    }

    #[test]
    fn test_quarterly_from_end_of_month() {
        let w = windower(utc(2024, 1, 31, 0, 0, 0), PeriodUnit::Month, 3);
        assert_eq!(w.step(), Step::Months(3));
        assert_eq!(w.boundary(1), Some(utc(2024, 4, 30, 0, 0, 0)));
        assert_eq!(w.boundary(2), Some(utc(2024, 7, 31, 0, 0, 0)));
        assert_eq!(w.boundary(3), Some(utc(2024, 10, 31, 0, 0, 0)));
        assert_eq!(w.boundary(4), Some(utc(2025, 1, 31, 0, 0, 0)));
        assert_eq!(w.boundary(-1), Some(utc(2023, 10, 31, 0, 0, 0)));
    }

    #[test]
    fn test_monthly_clamps_february() {
        let w = windower(utc(2024, 1, 31, 0, 0, 0), PeriodUnit::Month, 1);
        assert_eq!(w.boundary(1), Some(utc(2024, 2, 29, 0, 0, 0)));
        assert_eq!(w.boundary(2), Some(utc(2024, 3, 31, 0, 0, 0)));
    }

    #[test]
    fn test_fixed_steps() {
        let w = windower(utc(2024, 1, 1, 0, 0, 0), PeriodUnit::Week, 2);
        assert_eq!(w.step(), Step::Fixed(Duration::days(14)));
        assert_eq!(w.boundary(1), Some(utc(2024, 1, 15, 0, 0, 0)));
    }

    #[test]
    fn test_periods_between_short_interval() {
        let w = windower(utc(2024, 1, 1, 0, 0, 0), PeriodUnit::Day, 2);
        assert_eq!(
            w.periods_between(utc(2024, 1, 1, 0, 0, 0), utc(2024, 1, 2, 23, 0, 0)),
            None
        );
        assert_eq!(
            w.periods_between(utc(2024, 1, 1, 0, 0, 0), utc(2024, 1, 4, 12, 0, 0)),
            Some(3.5)
        );
    }

    #[test]
    fn test_periods_between_calendar_units() {
        let months = windower(utc(2024, 1, 31, 0, 0, 0), PeriodUnit::Month, 1);
        assert_eq!(
            months.periods_between(utc(2024, 1, 31, 0, 0, 0), utc(2024, 2, 29, 0, 0, 0)),
            Some(1.0)
        );
        assert_eq!(
            months.periods_between(utc(2024, 1, 15, 0, 0, 0), utc(2024, 2, 14, 0, 0, 0)),
            None
        );

        let years = windower(utc(2020, 1, 1, 0, 0, 0), PeriodUnit::Year, 1);
        assert_eq!(
            years.periods_between(utc(2020, 6, 1, 0, 0, 0), utc(2022, 5, 31, 0, 0, 0)),
            Some(1.0)
        );
        assert_eq!(
            years.periods_between(utc(2020, 6, 1, 0, 0, 0), utc(2021, 5, 31, 0, 0, 0)),
            None
        );
    }

    #[test]
    fn test_valid_range_alignment() {
        let w = windower(utc(2024, 1, 1, 6, 0, 0), PeriodUnit::Hour, 4);
        let range = w
            .valid_range(utc(2024, 1, 2, 7, 30, 0), utc(2024, 1, 3, 1, 0, 0))
            .unwrap();
        assert_eq!(range.start, utc(2024, 1, 2, 10, 0, 0));
        assert_eq!(range.end, utc(2024, 1, 2, 22, 0, 0));
        assert_eq!(range.len(), 3);
    }

    #[test]
    fn test_valid_range_on_boundaries_and_before_anchor() {
        let w = windower(utc(2024, 1, 1, 0, 0, 0), PeriodUnit::Day, 1);
        let range = w
            .valid_range(utc(2023, 12, 30, 0, 0, 0), utc(2024, 1, 2, 0, 0, 0))
            .unwrap();
        assert_eq!(range.start, utc(2023, 12, 30, 0, 0, 0));
        assert_eq!(range.end, utc(2024, 1, 2, 0, 0, 0));
        assert_eq!(range.first, -2);
        assert_eq!(w.windows(&range).count(), 3);
    }

    #[test]
    fn test_valid_range_collapses() {
        let w = windower(utc(2024, 1, 1, 0, 0, 0), PeriodUnit::Day, 1);
        assert!(w
            .valid_range(utc(2024, 1, 1, 1, 0, 0), utc(2024, 1, 2, 23, 0, 0))
            .is_none());
        assert!(w
            .valid_range(utc(2024, 1, 5, 0, 0, 0), utc(2024, 1, 1, 0, 0, 0))
            .is_none());
    }

    #[test]
    fn test_valid_range_months() {
        let w = windower(utc(2024, 1, 31, 0, 0, 0), PeriodUnit::Month, 1);
        let range = w
            .valid_range(utc(2024, 2, 10, 0, 0, 0), utc(2024, 6, 1, 0, 0, 0))
            .unwrap();
        assert_eq!(range.start, utc(2024, 2, 29, 0, 0, 0));
        assert_eq!(range.end, utc(2024, 5, 31, 0, 0, 0));
        let starts: Vec<_> = w.windows(&range).map(|window| window.start).collect();
        assert_eq!(
            starts,
            vec![
                utc(2024, 2, 29, 0, 0, 0),
                utc(2024, 3, 31, 0, 0, 0),
                utc(2024, 4, 30, 0, 0, 0)
            ]
        );
    }

    #[test]
    fn test_monthly_local_midnight_across_dst() {
        // 2024-01-01 00:00 Europe/Paris is 2023-12-31 23:00 UTC (UTC+1).
        let spec = PeriodSpec::new(utc(2023, 12, 31, 23, 0, 0), PeriodUnit::Month, 1)
            .with_timezone(chrono_tz::Europe::Paris);
        let w = PeriodWindower::new(&spec).unwrap();
        // 2024-04-01 00:00 Europe/Paris is 2024-03-31 22:00 UTC (UTC+2).
        assert_eq!(w.boundary(3), Some(utc(2024, 3, 31, 22, 0, 0)));
    }

    #[test]
    fn test_dst_gap_resolves_forward() {
        // 2024-03-31 02:30 does not exist in Europe/Paris.
        let local = NaiveDateTime::parse_from_str("2024-03-31 02:30:00", "%Y-%m-%d %H:%M:%S").unwrap();
        let resolved = resolve_local(&chrono_tz::Europe::Paris, local).unwrap();
        assert_eq!(resolved, utc(2024, 3, 31, 1, 30, 0));
    }
}
