//! Collaborator interfaces consumed by the engine.
//!
//! The engine never defines a storage or wire format of its own. It reads raw
//! samples and writes derived points through [`TimeSeriesStore`], keeps its
//! cursor in a [`CheckpointStore`], looks targets up through [`SeriesConfig`]
//! and asks a [`Clock`] what "now" is.
//!
//! [`MemoryStore`] implements both storage traits and is what the binary and
//! the test suite run against.

pub mod memory;

use crate::core::checkpoint::{AggregationTarget, CheckpointState};
use crate::core::evaluator::FormulaTarget;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use memory::MemoryStore;

/// Identifier of a time series (raw or derived).
pub type SeriesId = u32;

/// Unit of the raw timestamps exchanged with a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeUnit {
    Seconds,
    #[default]
    Milliseconds,
}

impl TimeUnit {
    /// Number of raw ticks in one second.
    pub fn ticks_per_second(self) -> i64 {
        match self {
            TimeUnit::Seconds => 1,
            TimeUnit::Milliseconds => 1000,
        }
    }

    /// Convert an instant to a raw timestamp in this unit (floored).
    pub fn to_raw(self, at: DateTime<Utc>) -> i64 {
        match self {
            TimeUnit::Seconds => at.timestamp(),
            TimeUnit::Milliseconds => at.timestamp_millis(),
        }
    }

    /// Convert a raw timestamp in this unit back to an instant.
    pub fn from_raw(self, raw: i64) -> Option<DateTime<Utc>> {
        match self {
            TimeUnit::Seconds => DateTime::from_timestamp(raw, 0),
            TimeUnit::Milliseconds => DateTime::from_timestamp_millis(raw),
        }
    }
}

/// A raw `(timestamp, value)` pair as exchanged with a store.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp: i64,
    pub value: f64,
}

impl Sample {
    pub fn new(timestamp: i64, value: f64) -> Self {
        Self { timestamp, value }
    }
}

/// A derived point produced by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeSeriesPoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

impl TimeSeriesPoint {
    pub fn new(timestamp: DateTime<Utc>, value: f64) -> Self {
        Self { timestamp, value }
    }

    pub fn to_sample(self, unit: TimeUnit) -> Sample {
        Sample::new(unit.to_raw(self.timestamp), self.value)
    }

    pub fn from_sample(sample: Sample, unit: TimeUnit) -> Option<Self> {
        unit.from_raw(sample.timestamp)
            .map(|timestamp| Self::new(timestamp, sample.value))
    }
}

/// Failures reported by store collaborators. These always propagate.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Raw sample storage.
pub trait TimeSeriesStore: Send + Sync {
    /// Samples of `series_id` in `[time_min, time_max)` (or `[time_min,
    /// time_max]` when `time_max_excluded` is false), ascending.
    fn read_samples(
        &self,
        series_id: SeriesId,
        time_min: i64,
        time_max: i64,
        time_max_excluded: bool,
        unit: TimeUnit,
    ) -> Result<Vec<Sample>, StoreError>;

    /// Write derived points. When `ignore_duplicate_conflicts` is true an
    /// existing point at the same timestamp is kept, otherwise it is replaced.
    /// Returns the number of points actually stored.
    fn write_points(
        &self,
        series_id: SeriesId,
        points: &[Sample],
        unit: TimeUnit,
        ignore_duplicate_conflicts: bool,
    ) -> Result<usize, StoreError>;

    /// Mark cached values derived from `series_id` as stale.
    fn invalidate_downstream_cache(&self, series_id: SeriesId) -> Result<(), StoreError>;

    /// Most recent sample at or before `bound`.
    fn latest_sample(
        &self,
        series_id: SeriesId,
        bound: i64,
        bound_excluded: bool,
        unit: TimeUnit,
    ) -> Result<Option<Sample>, StoreError> {
        let samples = self.read_samples(series_id, i64::MIN, bound, bound_excluded, unit)?;
        Ok(samples.last().copied())
    }
}

/// Per-target cursor persistence. `set` is the serialization point for a target.
pub trait CheckpointStore: Send + Sync {
    fn get(&self, series_id: SeriesId) -> Result<CheckpointState, StoreError>;
    fn set(&self, series_id: SeriesId, state: &CheckpointState) -> Result<(), StoreError>;
}

/// Read-only access to target definitions.
pub trait SeriesConfig: Send + Sync {
    fn aggregation(&self, target: SeriesId) -> Option<&AggregationTarget>;
    fn formula(&self, target: SeriesId) -> Option<&FormulaTarget>;
}

/// Source of the current instant.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock frozen at one instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_time_unit_conversion() {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        assert_eq!(TimeUnit::Seconds.to_raw(at), 1_709_294_400);
        assert_eq!(TimeUnit::Milliseconds.to_raw(at), 1_709_294_400_000);
        assert_eq!(TimeUnit::Milliseconds.from_raw(1_709_294_400_000), Some(at));
        assert_eq!(TimeUnit::Seconds.from_raw(1_709_294_400), Some(at));
    }

    #[test]
    fn test_point_sample_conversion() {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let point = TimeSeriesPoint::new(at, 4.5);
        let sample = point.to_sample(TimeUnit::Seconds);
        assert_eq!(sample.value, 4.5);
        assert_eq!(
            TimeSeriesPoint::from_sample(sample, TimeUnit::Seconds),
            Some(point)
        );
    }
}
