//! Periodic Series - derived time series for process data.
//!
//! This library computes derived series from raw sensor or process samples:
//! statistical aggregates over calendar-aligned windows ("monthly minimum",
//! "daily delta") and formulas over other series, re-evaluated per window.
//! Aggregation is checkpointed so each run resumes where the previous one
//! stopped.
//!
//! # Guarantees
//!
//! - **Calendar-correct**: month and year windows follow the calendar, not a
//!   fixed duration, and stay aligned to their anchor
//! - **Idempotent**: checking the same range twice stores nothing new
//! - **Window-scoped formulas**: a formula only sees samples of its window
//! - **Storage-agnostic**: samples and checkpoints live behind traits
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Periodic Series                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ┌─────────────┐   ┌─────────────┐   ┌─────────────┐       │
//! │  │   Period    │──▶│ Aggregation │──▶│ Checkpointed│       │
//! │  │  Windower   │   │  Functions  │   │ Aggregator  │       │
//! │  └─────────────┘   └─────────────┘   └─────────────┘       │
//! │         │                                    │              │
//! │         ▼                                    ▼              │
//! │  ┌─────────────┐                     ┌─────────────┐       │
//! │  │ Expression  │◀───────────────────▶│ TimeSeries  │       │
//! │  │  Evaluator  │                     │   Store     │       │
//! │  └─────────────┘                     └─────────────┘       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use periodic_series::core::{
//!     AggregationKind, AggregationSpec, AggregationTarget, CheckOptions, CheckpointedAggregator,
//!     PeriodSpec, PeriodUnit,
//! };
//! use periodic_series::store::{MemoryStore, SystemClock};
//! use chrono::{TimeZone, Utc};
//!
//! let store = MemoryStore::new();
//! let clock = SystemClock;
//! let target = AggregationTarget {
//!     id: 10,
//!     source: 1,
//!     spec: AggregationSpec::new(
//!         AggregationKind::Mean,
//!         PeriodSpec::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(), PeriodUnit::Day, 1),
//!     ),
//! };
//!
//! let aggregator = CheckpointedAggregator::new(&store, &store, &clock);
//! let report = aggregator.check_to_now(&target, CheckOptions::default()).unwrap();
//! println!("{} points written", report.written);
//! ```

pub mod config;
pub mod core;
pub mod stats;
pub mod store;

// Re-export key types at crate root for convenience
pub use config::{Config, ConfigError};
pub use crate::core::{
    AggregationKind, AggregationTarget, CheckOptions, CheckpointedAggregator, ExpressionEvaluator,
    FormulaTarget, PeriodSpec, PeriodUnit, PeriodWindower, QueryOptions,
};
pub use stats::{RunLog, RunStats, SharedRunLog};
pub use store::{
    CheckpointStore, Clock, MemoryStore, Sample, SeriesConfig, SeriesId, StoreError,
    TimeSeriesPoint, TimeSeriesStore, TimeUnit,
};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
