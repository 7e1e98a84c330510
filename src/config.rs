//! Configuration for the periodic series engine.

use crate::core::aggregate::{validate_property, ThresholdError};
use crate::core::checkpoint::AggregationTarget;
use crate::core::evaluator::{FormulaTarget, Synchronization};
use crate::core::expr::{EvalError, Formula, DEVICE_VALUE};
use crate::core::period::{PeriodError, PeriodSpec, PeriodWindower};
use crate::store::{SeriesConfig, SeriesId, TimeUnit};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Largest accepted magnitude of an aggregation offset, in days.
pub const MAX_OFFSET_DAYS: i64 = 36_525;

/// Main configuration: where state lives and which series are derived.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Path for the store snapshot and run statistics
    pub data_path: PathBuf,

    /// Interval between scheduled checks
    #[serde(with = "duration_serde")]
    pub check_interval: Duration,

    /// Unit of raw timestamps exchanged with the store
    #[serde(default)]
    pub timestamp_unit: TimeUnit,

    /// Series computed by windowed aggregation
    #[serde(default)]
    pub aggregations: Vec<AggregationTarget>,

    /// Series computed by formulas
    #[serde(default)]
    pub formulas: Vec<FormulaTarget>,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("periodic-series");

        Self {
            data_path: data_dir,
            check_interval: Duration::from_secs(5),
            timestamp_unit: TimeUnit::default(),
            aggregations: Vec::new(),
            formulas: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from the default location.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration from `path`, or the defaults when it does not exist.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&content).map_err(ConfigError::Parse)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to the default location.
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(self).map_err(ConfigError::Serialize)?;
        std::fs::write(path, content)?;

        Ok(())
    }

    /// Get the path to the configuration file.
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("periodic-series")
            .join("config.json")
    }

    /// Ensure all required directories exist.
    pub fn ensure_directories(&self) -> Result<(), ConfigError> {
        std::fs::create_dir_all(&self.data_path)?;
        Ok(())
    }

    /// Snapshot file of the host store.
    pub fn store_path(&self) -> PathBuf {
        self.data_path.join("store.json")
    }

    pub fn stats_path(&self) -> PathBuf {
        self.data_path.join("run_stats.json")
    }

    /// Check every target definition. Stops at the first problem.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut ids = HashSet::new();
        let all_ids = self
            .aggregations
            .iter()
            .map(|t| t.id)
            .chain(self.formulas.iter().map(|t| t.id));
        for id in all_ids {
            if !ids.insert(id) {
                return Err(ConfigError::DuplicateTarget(id));
            }
        }

        for (i, target) in self.aggregations.iter().enumerate() {
            validate_period(target.id, &target.spec.period)?;
            validate_property(target.spec.kind, target.spec.property.as_deref()).map_err(
                |source| ConfigError::InvalidProperty {
                    target: target.id,
                    source,
                },
            )?;
            if target.spec.property.is_some() && !target.spec.kind.uses_property() {
                tracing::warn!(
                    "Series {}: property is ignored by {} aggregation",
                    target.id,
                    target.spec.kind
                );
            }
            if target.spec.calc_wait_offset < chrono::Duration::zero() {
                return Err(ConfigError::NegativeWaitOffset(target.id));
            }
            let max_offset = chrono::Duration::days(MAX_OFFSET_DAYS);
            let offsets = [
                target.spec.calc_start_offset,
                target.spec.calc_end_offset,
                target.spec.calc_wait_offset,
                target.spec.timestamp_offset,
            ];
            if offsets
                .iter()
                .any(|&offset| offset > max_offset || offset < -max_offset)
            {
                return Err(ConfigError::OffsetOutOfRange(target.id));
            }
            if let Some(other) = self.aggregations[..i]
                .iter()
                .find(|other| other.source == target.source && other.spec == target.spec)
            {
                return Err(ConfigError::DuplicateAggregation {
                    first: other.id,
                    second: target.id,
                });
            }
        }

        for target in &self.formulas {
            let formula_error = |source| ConfigError::Formula {
                target: target.id,
                source,
            };
            let formula = Formula::parse(&target.spec.expression).map_err(formula_error)?;
            if formula.uses_device_value() {
                return Err(formula_error(EvalError::UnknownName(DEVICE_VALUE.to_string())));
            }
            if let Some(post) = target.spec.post_expression() {
                Formula::parse(post).map_err(formula_error)?;
            }
            if formula.referenced_series().contains(&target.id) {
                tracing::warn!(
                    "Formula {} reads its own series; it only sees values stored before each window ends",
                    target.id
                );
            }
            match target.spec.synchronization {
                Synchronization::Calendar => match &target.spec.period {
                    Some(period) => validate_period(target.id, period)?,
                    None => return Err(ConfigError::MissingPeriod(target.id)),
                },
                Synchronization::Trigger => {
                    if target.spec.trigger.is_none() {
                        return Err(ConfigError::MissingTrigger(target.id));
                    }
                }
            }
        }

        Ok(())
    }
}

fn validate_period(target: SeriesId, period: &PeriodSpec) -> Result<(), ConfigError> {
    PeriodWindower::new(period)
        .map(|_| ())
        .map_err(|source| ConfigError::Period { target, source })
}

impl SeriesConfig for Config {
    fn aggregation(&self, target: SeriesId) -> Option<&AggregationTarget> {
        self.aggregations.iter().find(|t| t.id == target)
    }

    fn formula(&self, target: SeriesId) -> Option<&FormulaTarget> {
        self.formulas.iter().find(|t| t.id == target)
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(serde_json::Error),
    #[error("Serialize error: {0}")]
    Serialize(serde_json::Error),
    #[error("series {0} is defined more than once")]
    DuplicateTarget(SeriesId),
    #[error("series {second} duplicates the aggregation of series {first}")]
    DuplicateAggregation { first: SeriesId, second: SeriesId },
    #[error("series {target}: {source}")]
    Period {
        target: SeriesId,
        source: PeriodError,
    },
    #[error("series {target}: {source}")]
    InvalidProperty {
        target: SeriesId,
        source: ThresholdError,
    },
    #[error("series {0}: calc_wait_offset must not be negative")]
    NegativeWaitOffset(SeriesId),
    #[error("series {0}: offsets are limited to {MAX_OFFSET_DAYS} days")]
    OffsetOutOfRange(SeriesId),
    #[error("series {0}: calendar formula needs a period")]
    MissingPeriod(SeriesId),
    #[error("series {0}: trigger formula needs a trigger series")]
    MissingTrigger(SeriesId),
    #[error("series {target}: malformed formula: {source}")]
    Formula { target: SeriesId, source: EvalError },
}

/// Serde support for Duration.
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

/// Serde support for signed offsets, as (fractional) seconds.
pub(crate) mod offset_serde {
    use chrono::Duration;
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(offset: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = offset.num_milliseconds();
        if millis % 1000 == 0 {
            (millis / 1000).serialize(serializer)
        } else {
            (millis as f64 / 1000.0).serialize(serializer)
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        let millis = (secs * 1000.0).round();
        if !millis.is_finite() || millis.abs() > i64::MAX as f64 / 2.0 {
            return Err(D::Error::custom(format!("offset out of range: {secs}")));
        }
        Duration::try_milliseconds(millis as i64)
            .ok_or_else(|| D::Error::custom(format!("offset out of range: {secs}")))
    }
}
