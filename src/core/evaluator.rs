//! Windowed formula evaluation.
//!
//! A formula target is evaluated once per window. Calendar targets take their
//! windows from a [`PeriodWindower`]; trigger targets take them from the
//! samples of another series. Each evaluation sees only the samples of its
//! own window through a [`WindowContext`].

use crate::core::expr::{EvalError, Formula, Lookup, DEVICE_VALUE};
use crate::core::period::{PeriodSpec, PeriodWindower};
use crate::core::windowing::{trigger_windows, Window};
use crate::stats::SharedRunLog;
use crate::store::{
    Clock, Sample, SeriesConfig, SeriesId, StoreError, TimeSeriesPoint, TimeSeriesStore, TimeUnit,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

/// Where evaluation windows come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Synchronization {
    /// Period windows anchored at the period's anchor
    #[default]
    Calendar,
    /// Windows between consecutive samples of a trigger series
    Trigger,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormulaSpec {
    pub expression: String,
    #[serde(default)]
    pub synchronization: Synchronization,
    /// Required for calendar synchronization
    #[serde(default)]
    pub period: Option<PeriodSpec>,
    /// Required for trigger synchronization
    #[serde(default)]
    pub trigger: Option<SeriesId>,
    /// Applied to every result of `expression`, which it reads as `device_value`
    #[serde(default)]
    pub post_expression: Option<String>,
}

impl FormulaSpec {
    pub fn calendar(expression: impl Into<String>, period: PeriodSpec) -> Self {
        Self {
            expression: expression.into(),
            synchronization: Synchronization::Calendar,
            period: Some(period),
            trigger: None,
            post_expression: None,
        }
    }

    pub fn triggered_by(expression: impl Into<String>, trigger: SeriesId) -> Self {
        Self {
            expression: expression.into(),
            synchronization: Synchronization::Trigger,
            period: None,
            trigger: Some(trigger),
            post_expression: None,
        }
    }

    pub fn with_post_expression(mut self, post_expression: impl Into<String>) -> Self {
        self.post_expression = Some(post_expression.into());
        self
    }

    /// Post expression text, `None` when absent or blank.
    pub fn post_expression(&self) -> Option<&str> {
        self.post_expression
            .as_deref()
            .filter(|text| !text.trim().is_empty())
    }
}

/// A series computed by a formula.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormulaTarget {
    pub id: SeriesId,
    #[serde(flatten)]
    pub spec: FormulaSpec,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Order {
    #[default]
    Asc,
    Desc,
}

impl FromStr for Order {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "asc" => Ok(Order::Asc),
            "desc" => Ok(Order::Desc),
            other => Err(format!("unknown order: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct QueryOptions {
    pub order: Order,
    /// Stop after this many values per target
    pub quantity: Option<usize>,
    /// Stop evaluating once this much time has passed
    pub timeout: Option<Duration>,
    /// Add the target's latest stored value at or before the first window start
    pub query_first_value: bool,
    /// Unit of the range bounds and of the returned timestamps
    pub unit: TimeUnit,
}

/// Evaluated values per target, in the requested order.
pub type QueryResult = BTreeMap<SeriesId, Vec<Sample>>;

/// Series lookups restricted to one window.
pub struct WindowContext<'a> {
    store: &'a dyn TimeSeriesStore,
    window: Window,
}

impl<'a> WindowContext<'a> {
    pub fn new(store: &'a dyn TimeSeriesStore, window: Window) -> Self {
        Self { store, window }
    }
}

impl Lookup for WindowContext<'_> {
    fn latest(&self, series: SeriesId) -> Result<Option<TimeSeriesPoint>, StoreError> {
        let unit = TimeUnit::Milliseconds;
        let end = unit.to_raw(self.window.end);
        let sample = self
            .store
            .latest_sample(series, end, !self.window.end_included, unit)?;
        Ok(sample
            .and_then(|s| TimeSeriesPoint::from_sample(s, unit))
            .filter(|point| self.window.contains(point.timestamp)))
    }
}

/// Window lookups with the main result bound as `device_value`.
struct PostContext<'a> {
    window: &'a WindowContext<'a>,
    device_value: f64,
}

impl Lookup for PostContext<'_> {
    fn latest(&self, series: SeriesId) -> Result<Option<TimeSeriesPoint>, StoreError> {
        self.window.latest(series)
    }

    fn device_value(&self) -> Option<f64> {
        Some(self.device_value)
    }
}

/// Main formula of a target and its optional post expression.
#[derive(Debug)]
struct CompiledFormula {
    main: Formula,
    post: Option<Formula>,
}

impl CompiledFormula {
    fn parse(spec: &FormulaSpec) -> Result<Self, EvalError> {
        let main = Formula::parse(&spec.expression)?;
        if main.uses_device_value() {
            return Err(EvalError::UnknownName(DEVICE_VALUE.to_string()));
        }
        let post = spec.post_expression().map(Formula::parse).transpose()?;
        Ok(Self { main, post })
    }

    fn matches(&self, spec: &FormulaSpec) -> bool {
        self.main.source() == spec.expression
            && self.post.as_ref().map(Formula::source) == spec.post_expression()
    }

    fn evaluate(&self, ctx: &WindowContext<'_>) -> Result<f64, EvalError> {
        let device_value = self.main.evaluate(ctx)?;
        match &self.post {
            Some(post) => post.evaluate(&PostContext {
                window: ctx,
                device_value,
            }),
            None => Ok(device_value),
        }
    }
}

/// Evaluates formula targets over windows of a time range.
pub struct ExpressionEvaluator<'a> {
    store: &'a dyn TimeSeriesStore,
    config: &'a dyn SeriesConfig,
    clock: &'a dyn Clock,
    cache: RwLock<HashMap<SeriesId, Arc<CompiledFormula>>>,
    run_log: Option<SharedRunLog>,
}

impl<'a> ExpressionEvaluator<'a> {
    pub fn new(
        store: &'a dyn TimeSeriesStore,
        config: &'a dyn SeriesConfig,
        clock: &'a dyn Clock,
    ) -> Self {
        Self {
            store,
            config,
            clock,
            cache: RwLock::new(HashMap::new()),
            run_log: None,
        }
    }

    pub fn with_run_log(mut self, run_log: SharedRunLog) -> Self {
        self.run_log = Some(run_log);
        self
    }

    /// Number of parsed formulas held in the cache.
    pub fn cached_formula_count(&self) -> usize {
        self.cache.read().map(|cache| cache.len()).unwrap_or(0)
    }

    /// Evaluate every formula target of `variable_ids` over `[time_min, time_max)`.
    ///
    /// Ids that are not formula targets are ignored. Evaluation failures drop
    /// the affected window; store failures abort the query.
    pub fn query(
        &self,
        variable_ids: &[SeriesId],
        time_min: i64,
        time_max: i64,
        options: &QueryOptions,
    ) -> Result<QueryResult, StoreError> {
        let started = Instant::now();
        let mut result = QueryResult::new();

        let (Some(from), Some(to)) = (options.unit.from_raw(time_min), options.unit.from_raw(time_max))
        else {
            tracing::warn!("Query range [{} to {}] out of bounds", time_min, time_max);
            return Ok(result);
        };

        for &id in variable_ids {
            let Some(target) = self.config.formula(id) else {
                tracing::debug!("Series {} is not a formula target, skipping", id);
                continue;
            };
            let span = tracing::info_span!("query", series = id);
            let _enter = span.enter();

            let values = self.query_target(target, from, to, options, started)?;
            result.insert(id, values);
        }

        Ok(result)
    }

    fn query_target(
        &self,
        target: &FormulaTarget,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        options: &QueryOptions,
        started: Instant,
    ) -> Result<Vec<Sample>, StoreError> {
        let Some(formula) = self.formula(target) else {
            return Ok(Vec::new());
        };

        let mut windows = self.windows(target, from, to)?;
        if options.order == Order::Desc {
            windows.reverse();
        }

        let mut values = Vec::new();
        for window in windows {
            if options.quantity.is_some_and(|quantity| values.len() >= quantity) {
                break;
            }
            if options.timeout.is_some_and(|timeout| started.elapsed() >= timeout) {
                tracing::info!("Query timed out after {} values", values.len());
                break;
            }

            if let Some(log) = &self.run_log {
                log.record_formula_window();
            }
            match formula.evaluate(&WindowContext::new(self.store, window)) {
                Ok(value) => values.push(Sample::new(options.unit.to_raw(window.start), value)),
                Err(EvalError::Store(e)) => return Err(e),
                Err(e) => {
                    tracing::debug!(
                        "No value for window [{} to {}]: {}",
                        window.start,
                        window.end,
                        e
                    );
                    if let Some(log) = &self.run_log {
                        log.record_formula_failure();
                    }
                }
            }
        }

        if options.query_first_value && !values.is_empty() {
            let earliest = values.iter().map(|s| s.timestamp).min().unwrap_or(i64::MIN);
            if let Some(first) = self
                .store
                .latest_sample(target.id, earliest, false, options.unit)?
            {
                match options.order {
                    Order::Asc => values.insert(0, first),
                    Order::Desc => values.push(first),
                }
            }
        }

        Ok(values)
    }

    /// Evaluation windows of a target inside `[from, to)`, ascending.
    pub fn windows(
        &self,
        target: &FormulaTarget,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Window>, StoreError> {
        match target.spec.synchronization {
            Synchronization::Calendar => Ok(self.calendar_windows(target, from, to)),
            Synchronization::Trigger => self.trigger_windows(target, from, to),
        }
    }

    fn calendar_windows(
        &self,
        target: &FormulaTarget,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Vec<Window> {
        let Some(period) = &target.spec.period else {
            tracing::warn!("Calendar formula {} has no period", target.id);
            return Vec::new();
        };
        let windower = match PeriodWindower::new(period) {
            Ok(windower) => windower,
            Err(e) => {
                tracing::warn!("Calendar formula {}: {}", target.id, e);
                return Vec::new();
            }
        };

        let now = self.clock.now();
        let d1 = from.max(windower.anchor());
        if windower.periods_between(d1, to).is_none() {
            tracing::debug!("[{} to {}] shorter than {}", d1, to, period);
            return Vec::new();
        }
        let Some(range) = windower.aligned_range(d1, to) else {
            tracing::debug!("No aligned window in [{} to {}]", d1, to);
            return Vec::new();
        };
        if windower.periods_between(range.start, range.end).is_none() {
            return Vec::new();
        }

        windower
            .windows(&range)
            .take_while(|window| window.end <= now)
            .collect()
    }

    fn trigger_windows(
        &self,
        target: &FormulaTarget,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Window>, StoreError> {
        let Some(trigger) = target.spec.trigger else {
            tracing::warn!("Trigger formula {} has no trigger series", target.id);
            return Ok(Vec::new());
        };
        if self.config.formula(trigger).is_some() {
            tracing::warn!(
                "Trigger series {} of formula {} is itself a formula target, rejected",
                trigger,
                target.id
            );
            return Ok(Vec::new());
        }

        let unit = TimeUnit::Milliseconds;
        let triggers: Vec<DateTime<Utc>> = self
            .store
            .read_samples(trigger, unit.to_raw(from), unit.to_raw(to), true, unit)?
            .into_iter()
            .filter_map(|s| unit.from_raw(s.timestamp))
            .collect();

        Ok(trigger_windows(&triggers, to))
    }

    /// Parsed formula of a target, from the cache when its text is unchanged.
    fn formula(&self, target: &FormulaTarget) -> Option<Arc<CompiledFormula>> {
        if let Ok(cache) = self.cache.read() {
            if let Some(formula) = cache.get(&target.id) {
                if formula.matches(&target.spec) {
                    return Some(Arc::clone(formula));
                }
            }
        }

        match CompiledFormula::parse(&target.spec) {
            Ok(formula) => {
                let formula = Arc::new(formula);
                let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
                cache.insert(target.id, Arc::clone(&formula));
                Some(formula)
            }
            Err(e) => {
                tracing::warn!(
                    "Formula {} ({:?}) rejected: {}",
                    target.id,
                    target.spec.expression,
                    e
                );
                if let Some(log) = &self.run_log {
                    log.record_formula_failure();
                }
                None
            }
        }
    }
}
