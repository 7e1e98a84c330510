//! Checkpointed periodic aggregation.
//!
//! A target series is derived from a source series by reducing every period
//! window to one point. The aggregator walks windows from a persisted cursor
//! up to "now", stages one point per complete window and writes the batch
//! before advancing the cursor. Re-running over the same range is a no-op.

use crate::core::aggregate::{aggregate, AggregationKind};
use crate::core::period::{PeriodError, PeriodSpec, PeriodWindower};
use crate::core::windowing::Window;
use crate::stats::SharedRunLog;
use crate::store::{
    CheckpointStore, Clock, Sample, SeriesId, StoreError, TimeSeriesPoint, TimeSeriesStore,
    TimeUnit,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Maximum length of a persisted status string, in characters.
pub const MAX_STATUS_LEN: usize = 100;

fn zero_offset() -> Duration {
    Duration::zero()
}

/// How a target is computed from its source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationSpec {
    pub kind: AggregationKind,
    /// Threshold (min/max) or counted value (count_value)
    #[serde(default)]
    pub property: Option<String>,
    pub period: PeriodSpec,
    /// Shift applied to the start of each aggregated window
    #[serde(default = "zero_offset", with = "crate::config::offset_serde")]
    pub calc_start_offset: Duration,
    /// Shift applied to the end of each aggregated window
    #[serde(default = "zero_offset", with = "crate::config::offset_serde")]
    pub calc_end_offset: Duration,
    /// Delay after a window ends before it is aggregated
    #[serde(default = "zero_offset", with = "crate::config::offset_serde")]
    pub calc_wait_offset: Duration,
    /// Shift from the window start to the stored point's timestamp
    #[serde(default = "zero_offset", with = "crate::config::offset_serde")]
    pub timestamp_offset: Duration,
}

impl AggregationSpec {
    pub fn new(kind: AggregationKind, period: PeriodSpec) -> Self {
        Self {
            kind,
            property: None,
            period,
            calc_start_offset: Duration::zero(),
            calc_end_offset: Duration::zero(),
            calc_wait_offset: Duration::zero(),
            timestamp_offset: Duration::zero(),
        }
    }

    pub fn with_property(mut self, property: impl Into<String>) -> Self {
        self.property = Some(property.into());
        self
    }
}

/// A derived series produced by aggregating a source series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationTarget {
    /// Series the points are written to
    pub id: SeriesId,
    /// Series the raw samples are read from
    pub source: SeriesId,
    #[serde(flatten)]
    pub spec: AggregationSpec,
}

/// Persisted cursor of one target.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointState {
    /// Start of the next check
    #[serde(default)]
    pub last_check: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: String,
    /// Timestamp of a stored partial point that must be recomputed
    #[serde(default)]
    pub partial_at: Option<DateTime<Utc>>,
}

impl CheckpointState {
    /// Set the status, truncated to [`MAX_STATUS_LEN`] characters.
    pub fn set_status(&mut self, status: impl Into<String>) {
        let mut status = status.into();
        if let Some((idx, _)) = status.char_indices().nth(MAX_STATUS_LEN) {
            status.truncate(idx);
        }
        self.status = status;
    }
}

/// Outcome of a check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckState {
    Idle,
    Checking,
    Checked,
    /// No grid-aligned range fits in the requested interval
    NoRange,
    /// The interval is shorter than one period
    BelowPeriod,
}

impl fmt::Display for CheckState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CheckState::Idle => "idle",
            CheckState::Checking => "checking",
            CheckState::Checked => "checked",
            CheckState::NoRange => "no range",
            CheckState::BelowPeriod => "below period",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckOptions {
    /// Recompute and overwrite windows that already have a point
    pub force_write: bool,
    /// Also stage the incomplete window after the last complete one
    pub include_partial: bool,
    /// Restart from the anchor instead of the stored cursor
    pub ignore_checkpoint: bool,
}

/// What a check did.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckReport {
    pub target: SeriesId,
    pub state: CheckState,
    /// Staged points, ascending, the partial point last
    pub points: Vec<TimeSeriesPoint>,
    /// Points the store reported as stored
    pub written: usize,
    /// Cursor after the check
    pub checkpoint: Option<DateTime<Utc>>,
    pub partial: Option<TimeSeriesPoint>,
}

impl CheckReport {
    fn empty(target: SeriesId, state: CheckState, checkpoint: Option<DateTime<Utc>>) -> Self {
        Self {
            target,
            state,
            points: Vec::new(),
            written: 0,
            checkpoint,
            partial: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum CheckError {
    #[error("invalid period: {0}")]
    Period(#[from] PeriodError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("offset moves {0} out of the representable range")]
    OffsetOutOfRange(DateTime<Utc>),
}

/// Drives windowed aggregation of targets against the store collaborators.
pub struct CheckpointedAggregator<'a> {
    store: &'a dyn TimeSeriesStore,
    checkpoints: &'a dyn CheckpointStore,
    clock: &'a dyn Clock,
    unit: TimeUnit,
    run_log: Option<SharedRunLog>,
}

impl<'a> CheckpointedAggregator<'a> {
    pub fn new(
        store: &'a dyn TimeSeriesStore,
        checkpoints: &'a dyn CheckpointStore,
        clock: &'a dyn Clock,
    ) -> Self {
        Self {
            store,
            checkpoints,
            clock,
            unit: TimeUnit::default(),
            run_log: None,
        }
    }

    /// Timestamp unit used when talking to the store.
    pub fn with_unit(mut self, unit: TimeUnit) -> Self {
        self.unit = unit;
        self
    }

    pub fn with_run_log(mut self, run_log: SharedRunLog) -> Self {
        self.run_log = Some(run_log);
        self
    }

    /// Check from the stored cursor (or the anchor) up to now.
    pub fn check_to_now(
        &self,
        target: &AggregationTarget,
        options: CheckOptions,
    ) -> Result<CheckReport, CheckError> {
        let state = self.checkpoints.get(target.id)?;
        let start = match state.last_check {
            Some(last_check) if !options.ignore_checkpoint => last_check,
            _ => target.spec.period.anchor,
        };
        self.check_period(target, start, self.clock.now(), options)
    }

    /// Check every complete window of `[d1, d2]`.
    pub fn check_period(
        &self,
        target: &AggregationTarget,
        d1: DateTime<Utc>,
        d2: DateTime<Utc>,
        options: CheckOptions,
    ) -> Result<CheckReport, CheckError> {
        let run_id = Uuid::new_v4();
        let span = tracing::info_span!("check", series = target.id, run_id = %run_id);
        let _enter = span.enter();

        if let Some(log) = &self.run_log {
            log.record_check();
        }

        let spec = &target.spec;
        let windower = PeriodWindower::new(&spec.period)?;
        let now = self.clock.now();

        self.store.invalidate_downstream_cache(target.id)?;

        let mut state = self.checkpoints.get(target.id)?;
        state.set_status(format!("Checking [{d1} to {d2}]"));
        self.checkpoints.set(target.id, &state)?;

        if windower.periods_between(d1, d2).is_none() {
            tracing::debug!("[{} to {}] shorter than {}", d1, d2, spec.period);
            return self.finish_empty(target.id, &mut state, CheckState::BelowPeriod, || {
                format!("[{d1} to {d2}] < {} {}", windower.factor(), windower.unit())
            });
        }

        let Some(range) = windower.aligned_range(d1, d2) else {
            tracing::debug!("No aligned window in [{} to {}]", d1, d2);
            return self.finish_empty(target.id, &mut state, CheckState::NoRange, || {
                format!("No time range found [{d1} to {d2}]")
            });
        };

        if windower.periods_between(range.start, range.end).is_none() {
            tracing::debug!(
                "Aligned range [{} to {}] shorter than {}",
                range.start,
                range.end,
                spec.period
            );
            return self.finish_empty(target.id, &mut state, CheckState::BelowPeriod, || {
                format!(
                    "[{} to {}] < {} {}",
                    range.start,
                    range.end,
                    windower.factor(),
                    windower.unit()
                )
            });
        }

        let mut staged: Vec<TimeSeriesPoint> = Vec::new();
        let mut replace = options.force_write;
        let mut last_walked: Option<(i64, DateTime<Utc>)> = None;

        for k in range.first..range.last {
            let Some(window) = windower.window(k) else {
                break;
            };
            let ready_at = shift(window.end, spec.calc_wait_offset)?;
            if ready_at > d2 || window.end > now {
                break;
            }
            last_walked = Some((k, window.start));

            let stamp = shift(window.start, spec.timestamp_offset)?;
            let replacing_partial = state.partial_at == Some(stamp);
            if replacing_partial {
                state.partial_at = None;
            }

            if !options.force_write && !replacing_partial && self.point_exists(target.id, stamp)? {
                tracing::debug!("Point at {} already stored, skipping", stamp);
                if let Some(log) = &self.run_log {
                    log.record_window_skipped();
                }
                continue;
            }

            let calc_window = window
                .shifted(spec.calc_start_offset, spec.calc_end_offset)
                .ok_or(CheckError::OffsetOutOfRange(window.start))?;
            match self.aggregate_window(target.source, spec, &calc_window)? {
                Some(value) => {
                    staged.push(TimeSeriesPoint::new(stamp, value));
                    replace |= replacing_partial;
                }
                None => {
                    tracing::debug!(
                        "No {} value for window [{} to {}), dropped",
                        spec.kind,
                        calc_window.start,
                        calc_window.end
                    );
                    if let Some(log) = &self.run_log {
                        log.record_window_without_value();
                    }
                }
            }
        }

        let walked_to = match last_walked {
            Some((_, start)) => start,
            None => range.start.min(d2).min(now),
        };
        // Only ignore_checkpoint may move the cursor backwards.
        let checkpoint = match state.last_check {
            Some(previous) if !options.ignore_checkpoint => walked_to.max(previous),
            _ => walked_to,
        };

        let mut partial = None;
        if options.include_partial {
            let next_k = last_walked.map_or(range.first, |(k, _)| k + 1);
            if let Some(point) = self.partial_point(target, &windower, next_k, d2.min(now))? {
                state.partial_at = Some(point.timestamp);
                staged.push(point);
                replace = true;
                partial = Some(point);
            }
        }

        let mut written = 0;
        if !staged.is_empty() {
            let samples: Vec<Sample> = staged.iter().map(|p| p.to_sample(self.unit)).collect();
            written = self
                .store
                .write_points(target.id, &samples, self.unit, !replace)?;
            if let Some(log) = &self.run_log {
                log.record_points_written(written as u64);
            }
        }

        state.last_check = Some(checkpoint);
        state.set_status(format!("Checked [{d1} to {d2}]"));
        self.checkpoints.set(target.id, &state)?;

        tracing::info!(
            "Checked [{} to {}]: {} staged, {} written, checkpoint {}",
            d1,
            d2,
            staged.len(),
            written,
            checkpoint
        );

        Ok(CheckReport {
            target: target.id,
            state: CheckState::Checked,
            points: staged,
            written,
            checkpoint: Some(checkpoint),
            partial,
        })
    }

    /// Forget the cursor so the next check restarts at the anchor.
    pub fn reset(&self, target: SeriesId) -> Result<(), CheckError> {
        let mut state = self.checkpoints.get(target)?;
        state.last_check = None;
        state.partial_at = None;
        state.set_status("Reset");
        self.checkpoints.set(target, &state)?;
        tracing::info!(series = target, "Checkpoint reset");
        Ok(())
    }

    /// Reduce the source samples of one window.
    pub fn aggregate_window(
        &self,
        source: SeriesId,
        spec: &AggregationSpec,
        window: &Window,
    ) -> Result<Option<f64>, StoreError> {
        let samples = self.store.read_samples(
            source,
            self.unit.to_raw(window.start),
            self.unit.to_raw(window.end),
            !window.end_included,
            self.unit,
        )?;
        let values: Vec<f64> = samples.iter().map(|s| s.value).collect();
        Ok(aggregate(spec.kind, spec.property.as_deref(), &values))
    }

    /// Whether `target` already holds a point at exactly `at`.
    pub fn point_exists(&self, target: SeriesId, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let unit = TimeUnit::Milliseconds;
        let ms = unit.to_raw(at);
        let samples = self
            .store
            .read_samples(target, ms, ms.saturating_add(1), true, unit)?;
        Ok(!samples.is_empty())
    }

    /// Aggregate the incomplete window starting at boundary `k`, cut at `until`.
    fn partial_point(
        &self,
        target: &AggregationTarget,
        windower: &PeriodWindower,
        k: i64,
        until: DateTime<Utc>,
    ) -> Result<Option<TimeSeriesPoint>, CheckError> {
        let spec = &target.spec;
        let (Some(start), Some(next)) = (windower.boundary(k), windower.boundary(k + 1)) else {
            return Ok(None);
        };
        let end = next.min(until);
        if end <= start {
            return Ok(None);
        }

        let calc_window = Window::new(start, end)
            .shifted(spec.calc_start_offset, spec.calc_end_offset)
            .ok_or(CheckError::OffsetOutOfRange(start))?;
        let stamp = shift(start, spec.timestamp_offset)?;
        match self.aggregate_window(target.source, spec, &calc_window)? {
            Some(value) => {
                tracing::debug!("Staging partial point at {} = {}", stamp, value);
                Ok(Some(TimeSeriesPoint::new(stamp, value)))
            }
            None => {
                tracing::debug!("No value for partial window [{} to {})", start, end);
                Ok(None)
            }
        }
    }

    fn finish_empty(
        &self,
        target: SeriesId,
        state: &mut CheckpointState,
        outcome: CheckState,
        status: impl FnOnce() -> String,
    ) -> Result<CheckReport, CheckError> {
        state.set_status(status());
        self.checkpoints.set(target, state)?;
        tracing::info!("{}: {}", outcome, state.status);
        Ok(CheckReport::empty(target, outcome, state.last_check))
    }
}

fn shift(at: DateTime<Utc>, offset: Duration) -> Result<DateTime<Utc>, CheckError> {
    at.checked_add_signed(offset)
        .ok_or(CheckError::OffsetOutOfRange(at))
}
