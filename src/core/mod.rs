//! Core functionality for the periodic series engine.
//!
//! This module contains:
//! - Calendar period arithmetic and evaluation windows
//! - The aggregation function library
//! - Checkpointed aggregation of target series
//! - The formula language and its windowed evaluator

pub mod aggregate;
pub mod checkpoint;
pub mod evaluator;
pub mod expr;
pub mod period;
pub mod windowing;

// Re-export commonly used types
pub use aggregate::{aggregate, AggregationKind, Threshold};
pub use checkpoint::{
    AggregationSpec, AggregationTarget, CheckError, CheckOptions, CheckReport, CheckState,
    CheckpointState, CheckpointedAggregator,
};
pub use evaluator::{
    ExpressionEvaluator, FormulaSpec, FormulaTarget, Order, QueryOptions, QueryResult,
    Synchronization, WindowContext,
};
pub use expr::{EvalError, Formula, Lookup};
pub use period::{PeriodError, PeriodRange, PeriodSpec, PeriodUnit, PeriodWindower, Step};
pub use windowing::{trigger_windows, Window};
