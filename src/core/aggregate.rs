//! Aggregation functions over the samples of one window.
//!
//! Every function takes the window's values in ascending time order and
//! returns `None` when the window does not define a result. An empty window
//! never defines a result.

use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// The fifteen supported reductions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationKind {
    Min,
    Max,
    Total,
    Difference,
    DifferencePercent,
    Delta,
    Mean,
    First,
    Last,
    Count,
    CountValue,
    Range,
    Step,
    ChangeCount,
    DistinctCount,
}

impl AggregationKind {
    pub const ALL: [AggregationKind; 15] = [
        AggregationKind::Min,
        AggregationKind::Max,
        AggregationKind::Total,
        AggregationKind::Difference,
        AggregationKind::DifferencePercent,
        AggregationKind::Delta,
        AggregationKind::Mean,
        AggregationKind::First,
        AggregationKind::Last,
        AggregationKind::Count,
        AggregationKind::CountValue,
        AggregationKind::Range,
        AggregationKind::Step,
        AggregationKind::ChangeCount,
        AggregationKind::DistinctCount,
    ];

    pub fn name(self) -> &'static str {
        match self {
            AggregationKind::Min => "min",
            AggregationKind::Max => "max",
            AggregationKind::Total => "total",
            AggregationKind::Difference => "difference",
            AggregationKind::DifferencePercent => "difference_percent",
            AggregationKind::Delta => "delta",
            AggregationKind::Mean => "mean",
            AggregationKind::First => "first",
            AggregationKind::Last => "last",
            AggregationKind::Count => "count",
            AggregationKind::CountValue => "count_value",
            AggregationKind::Range => "range",
            AggregationKind::Step => "step",
            AggregationKind::ChangeCount => "change_count",
            AggregationKind::DistinctCount => "distinct_count",
        }
    }

    /// Whether the `property` field changes the result of this kind.
    pub fn uses_property(self) -> bool {
        matches!(
            self,
            AggregationKind::Min | AggregationKind::Max | AggregationKind::CountValue
        )
    }
}

impl fmt::Display for AggregationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for AggregationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace([' ', '-'], "_");
        Self::ALL
            .into_iter()
            .find(|kind| kind.name() == normalized)
            .ok_or_else(|| format!("unknown aggregation kind: {s}"))
    }
}

/// Value filter applied before `min` / `max`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Threshold {
    Unrestricted,
    /// Keep values strictly beyond the bound (`>` for min, `<` for max)
    Strict(f64),
    /// Keep values at or beyond the bound (`>=` for min, `<=` for max)
    Inclusive(f64),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ThresholdError {
    #[error("property {0:?} is not a number")]
    NotANumber(String),
}

fn is_unset(property: Option<&str>) -> bool {
    match property {
        None => true,
        Some(p) => {
            let p = p.trim();
            p.is_empty() || p == "None"
        }
    }
}

fn parse_number(text: &str, property: &str) -> Result<f64, ThresholdError> {
    text.trim()
        .parse::<f64>()
        .map_err(|_| ThresholdError::NotANumber(property.to_string()))
}

/// Parse a min/max property.
///
/// Empty means unrestricted. A leading `<` (min) or `>` (max) selects the
/// strict filter, a bare number the inclusive one.
pub fn parse_threshold(
    kind: AggregationKind,
    property: Option<&str>,
) -> Result<Threshold, ThresholdError> {
    if is_unset(property) {
        return Ok(Threshold::Unrestricted);
    }
    let raw = property.unwrap_or_default();
    let trimmed = raw.trim();

    let strict_marker = match kind {
        AggregationKind::Max => '>',
        _ => '<',
    };
    match trimmed.strip_prefix(strict_marker) {
        Some(rest) => parse_number(rest, raw).map(Threshold::Strict),
        None => parse_number(trimmed, raw).map(Threshold::Inclusive),
    }
}

/// Parse the value counted by `count_value`.
pub fn parse_target(property: Option<&str>) -> Result<f64, ThresholdError> {
    let raw = property.unwrap_or_default();
    parse_number(raw, raw)
}

/// Check a property against its aggregation kind without evaluating anything.
pub fn validate_property(
    kind: AggregationKind,
    property: Option<&str>,
) -> Result<(), ThresholdError> {
    match kind {
        AggregationKind::Min | AggregationKind::Max => parse_threshold(kind, property).map(|_| ()),
        AggregationKind::CountValue => parse_target(property).map(|_| ()),
        _ => Ok(()),
    }
}

/// Reduce one window to a scalar.
pub fn aggregate(kind: AggregationKind, property: Option<&str>, values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }

    match kind {
        AggregationKind::Min | AggregationKind::Max => match parse_threshold(kind, property) {
            Ok(threshold) if kind == AggregationKind::Min => min(values, threshold),
            Ok(threshold) => max(values, threshold),
            Err(e) => {
                tracing::warn!("{} aggregation skipped: {}", kind, e);
                None
            }
        },
        AggregationKind::Total => total(values),
        AggregationKind::Difference => difference(values),
        AggregationKind::DifferencePercent => difference_percent(values),
        AggregationKind::Delta => delta(values),
        AggregationKind::Mean => mean(values),
        AggregationKind::First => values.first().copied(),
        AggregationKind::Last => values.last().copied(),
        AggregationKind::Count => Some(values.len() as f64),
        AggregationKind::CountValue => match parse_target(property) {
            Ok(target) => count_value(values, target),
            Err(e) => {
                tracing::warn!("{} aggregation skipped: {}", kind, e);
                None
            }
        },
        AggregationKind::Range => range(values),
        AggregationKind::Step => step(values),
        AggregationKind::ChangeCount => change_count(values),
        AggregationKind::DistinctCount => distinct_count(values),
    }
}

/// Minimum of the values passing the threshold.
pub fn min(values: &[f64], threshold: Threshold) -> Option<f64> {
    let passing: Vec<f64> = values
        .iter()
        .copied()
        .filter(|&v| match threshold {
            Threshold::Unrestricted => true,
            Threshold::Strict(bound) => v > bound,
            Threshold::Inclusive(bound) => v >= bound,
        })
        .collect();
    if passing.is_empty() {
        return None;
    }
    Some(Statistics::min(&passing))
}

/// Maximum of the values passing the threshold.
pub fn max(values: &[f64], threshold: Threshold) -> Option<f64> {
    let passing: Vec<f64> = values
        .iter()
        .copied()
        .filter(|&v| match threshold {
            Threshold::Unrestricted => true,
            Threshold::Strict(bound) => v < bound,
            Threshold::Inclusive(bound) => v <= bound,
        })
        .collect();
    if passing.is_empty() {
        return None;
    }
    Some(Statistics::max(&passing))
}

pub fn total(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum())
}

/// Last minus first.
pub fn difference(values: &[f64]) -> Option<f64> {
    Some(values.last()? - values.first()?)
}

/// `(last - first) / (first * 100)`; undefined when the first value is zero.
pub fn difference_percent(values: &[f64]) -> Option<f64> {
    let first = *values.first()?;
    let last = *values.last()?;
    if first == 0.0 {
        return None;
    }
    Some((last - first) / (first * 100.0))
}

/// Sum of the positive increments between consecutive values.
pub fn delta(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(
        values
            .windows(2)
            .map(|pair| pair[1] - pair[0])
            .filter(|&increment| increment > 0.0)
            .sum(),
    )
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.mean())
}

/// Number of values equal to `target`.
pub fn count_value(values: &[f64], target: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().filter(|&&v| v == target).count() as f64)
}

/// Max minus min.
pub fn range(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(Statistics::max(values) - Statistics::min(values))
}

/// Smallest absolute difference between consecutive values.
pub fn step(values: &[f64]) -> Option<f64> {
    values
        .windows(2)
        .map(|pair| (pair[1] - pair[0]).abs())
        .reduce(f64::min)
}

/// Number of consecutive pairs whose values differ.
pub fn change_count(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    Some(values.windows(2).filter(|pair| pair[0] != pair[1]).count() as f64)
}

/// Number of unique values.
pub fn distinct_count(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    // -0.0 and 0.0 compare equal, so they must hash equal too.
    let distinct: HashSet<u64> = values
        .iter()
        .map(|&v| if v == 0.0 { 0.0f64.to_bits() } else { v.to_bits() })
        .collect();
    Some(distinct.len() as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_values() {
        assert_eq!(total(&[1.0, 2.0, 3.0]), Some(6.0));
        assert_eq!(difference(&[5.0, 9.0]), Some(4.0));
        assert_eq!(difference_percent(&[0.0, 5.0]), None);
        assert_eq!(delta(&[3.0, 1.0, 4.0, 1.0, 5.0]), Some(7.0));
        assert_eq!(step(&[1.0, 1.0, 1.0]), Some(0.0));
        assert_eq!(step(&[5.0]), None);
        assert_eq!(change_count(&[1.0, 1.0, 2.0, 2.0, 3.0]), Some(2.0));
        assert_eq!(distinct_count(&[1.0, 1.0, 2.0, 3.0]), Some(3.0));
    }

    #[test]
    fn test_difference_percent() {
        assert_eq!(difference_percent(&[2.0, 4.0]), Some(0.01));
    }

    #[test]
    fn test_step_is_smallest_gap() {
        assert_eq!(step(&[1.0, 4.0, 6.0, 13.0]), Some(2.0));
    }

    #[test]
    fn test_change_count_needs_two_values() {
        assert_eq!(change_count(&[4.0]), None);
    }

    #[test]
    fn test_mean_range_first_last_count() {
        let values = [2.0, 4.0, 9.0];
        assert_eq!(aggregate(AggregationKind::Mean, None, &values), Some(5.0));
        assert_eq!(aggregate(AggregationKind::Range, None, &values), Some(7.0));
        assert_eq!(aggregate(AggregationKind::First, None, &values), Some(2.0));
        assert_eq!(aggregate(AggregationKind::Last, None, &values), Some(9.0));
        assert_eq!(aggregate(AggregationKind::Count, None, &values), Some(3.0));
    }

    #[test]
    fn test_empty_window_is_undefined_for_every_kind() {
        for kind in AggregationKind::ALL {
            assert_eq!(aggregate(kind, Some("1"), &[]), None, "{kind}");
        }
    }

    #[test]
    fn test_min_thresholds() {
        let values = [3.0, 5.0, 7.0];
        assert_eq!(aggregate(AggregationKind::Min, None, &values), Some(3.0));
        assert_eq!(aggregate(AggregationKind::Min, Some(""), &values), Some(3.0));
        assert_eq!(aggregate(AggregationKind::Min, Some("5"), &values), Some(5.0));
        assert_eq!(aggregate(AggregationKind::Min, Some("<5"), &values), Some(7.0));
        assert_eq!(aggregate(AggregationKind::Min, Some("8"), &values), None);
        assert_eq!(aggregate(AggregationKind::Min, Some("abc"), &values), None);
    }

    #[test]
    fn test_max_thresholds() {
        let values = [3.0, 5.0, 7.0];
        assert_eq!(aggregate(AggregationKind::Max, Some("5"), &values), Some(5.0));
        assert_eq!(aggregate(AggregationKind::Max, Some(">5"), &values), Some(3.0));
        assert_eq!(aggregate(AggregationKind::Max, Some(">3"), &values), None);
        assert_eq!(aggregate(AggregationKind::Max, Some("<5"), &values), None);
    }

    #[test]
    fn test_count_value() {
        let values = [1.0, 2.0, 2.0, 3.0];
        assert_eq!(aggregate(AggregationKind::CountValue, Some("2"), &values), Some(2.0));
        assert_eq!(aggregate(AggregationKind::CountValue, Some(" 4 "), &values), Some(0.0));
        assert_eq!(aggregate(AggregationKind::CountValue, None, &values), None);
    }

    #[test]
    fn test_threshold_parsing() {
        assert_eq!(
            parse_threshold(AggregationKind::Min, Some("None")),
            Ok(Threshold::Unrestricted)
        );
        assert_eq!(
            parse_threshold(AggregationKind::Min, Some("<53.5")),
            Ok(Threshold::Strict(53.5))
        );
        assert_eq!(
            parse_threshold(AggregationKind::Max, Some("53.5")),
            Ok(Threshold::Inclusive(53.5))
        );
        assert!(validate_property(AggregationKind::Max, Some("<1")).is_err());
        assert!(validate_property(AggregationKind::Total, Some("whatever")).is_ok());
    }

    #[test]
    fn test_kind_names_round_trip() {
        for kind in AggregationKind::ALL {
            assert_eq!(kind.name().parse::<AggregationKind>(), Ok(kind));
        }
        assert_eq!(
            "difference percent".parse::<AggregationKind>(),
            Ok(AggregationKind::DifferencePercent)
        );
    }
}
