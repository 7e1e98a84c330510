//! Run statistics.
//!
//! Counts what the engine did across checks and queries. Only counters are
//! kept, never values, so the log can be shared freely between targets.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Engine counters for the current process.
#[derive(Debug)]
pub struct RunLog {
    /// Number of aggregation checks run
    checks_run: AtomicU64,
    /// Number of derived points stored
    points_written: AtomicU64,
    /// Windows skipped because their point already existed
    windows_skipped: AtomicU64,
    /// Windows whose aggregate was undefined
    windows_without_value: AtomicU64,
    /// Formula windows evaluated
    formula_windows: AtomicU64,
    /// Formula windows that failed to evaluate
    formula_failures: AtomicU64,
    /// Session start time
    session_start: DateTime<Utc>,
    /// Path for persisting stats
    persist_path: Option<PathBuf>,
}

impl RunLog {
    pub fn new() -> Self {
        Self {
            checks_run: AtomicU64::new(0),
            points_written: AtomicU64::new(0),
            windows_skipped: AtomicU64::new(0),
            windows_without_value: AtomicU64::new(0),
            formula_windows: AtomicU64::new(0),
            formula_failures: AtomicU64::new(0),
            session_start: Utc::now(),
            persist_path: None,
        }
    }

    /// Create a run log that continues from the counters stored at `path`.
    pub fn with_persistence(path: PathBuf) -> Self {
        let mut log = Self::new();
        log.persist_path = Some(path);

        if let Err(e) = log.load() {
            tracing::warn!("Could not load previous run stats: {}", e);
        }

        log
    }

    pub fn record_check(&self) {
        self.checks_run.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_points_written(&self, count: u64) {
        self.points_written.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_window_skipped(&self) {
        self.windows_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_window_without_value(&self) {
        self.windows_without_value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_formula_window(&self) {
        self.formula_windows.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_formula_failure(&self) {
        self.formula_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Get the current statistics.
    pub fn stats(&self) -> RunStats {
        RunStats {
            checks_run: self.checks_run.load(Ordering::Relaxed),
            points_written: self.points_written.load(Ordering::Relaxed),
            windows_skipped: self.windows_skipped.load(Ordering::Relaxed),
            windows_without_value: self.windows_without_value.load(Ordering::Relaxed),
            formula_windows: self.formula_windows.load(Ordering::Relaxed),
            formula_failures: self.formula_failures.load(Ordering::Relaxed),
            session_start: self.session_start,
            session_duration_secs: (Utc::now() - self.session_start).num_seconds().max(0) as u64,
        }
    }

    /// Get a summary string for display.
    pub fn summary(&self) -> String {
        let stats = self.stats();
        format!(
            "Run Statistics:\n\
             - Checks run: {}\n\
             - Points written: {}\n\
             - Windows skipped (already stored): {}\n\
             - Windows without value: {}\n\
             - Formula windows evaluated: {}\n\
             - Formula failures: {}\n\
             - Session duration: {} seconds",
            stats.checks_run,
            stats.points_written,
            stats.windows_skipped,
            stats.windows_without_value,
            stats.formula_windows,
            stats.formula_failures,
            stats.session_duration_secs
        )
    }

    /// Save stats to disk.
    pub fn save(&self) -> Result<(), std::io::Error> {
        if let Some(ref path) = self.persist_path {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }

            let stats = self.stats();
            let persisted = PersistedStats {
                checks_run: stats.checks_run,
                points_written: stats.points_written,
                windows_skipped: stats.windows_skipped,
                windows_without_value: stats.windows_without_value,
                formula_windows: stats.formula_windows,
                formula_failures: stats.formula_failures,
                last_updated: Utc::now(),
            };

            let json = serde_json::to_string_pretty(&persisted).map_err(std::io::Error::other)?;
            std::fs::write(path, json)?;
        }
        Ok(())
    }

    fn load(&mut self) -> Result<(), std::io::Error> {
        if let Some(ref path) = self.persist_path {
            if path.exists() {
                let content = std::fs::read_to_string(path)?;
                let persisted: PersistedStats =
                    serde_json::from_str(&content).map_err(std::io::Error::other)?;

                self.checks_run.store(persisted.checks_run, Ordering::Relaxed);
                self.points_written
                    .store(persisted.points_written, Ordering::Relaxed);
                self.windows_skipped
                    .store(persisted.windows_skipped, Ordering::Relaxed);
                self.windows_without_value
                    .store(persisted.windows_without_value, Ordering::Relaxed);
                self.formula_windows
                    .store(persisted.formula_windows, Ordering::Relaxed);
                self.formula_failures
                    .store(persisted.formula_failures, Ordering::Relaxed);
            }
        }
        Ok(())
    }
}

impl Default for RunLog {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of run statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStats {
    pub checks_run: u64,
    pub points_written: u64,
    pub windows_skipped: u64,
    pub windows_without_value: u64,
    pub formula_windows: u64,
    pub formula_failures: u64,
    pub session_start: DateTime<Utc>,
    pub session_duration_secs: u64,
}

/// Stats format for persistence.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedStats {
    checks_run: u64,
    points_written: u64,
    windows_skipped: u64,
    windows_without_value: u64,
    #[serde(default)]
    formula_windows: u64,
    #[serde(default)]
    formula_failures: u64,
    last_updated: DateTime<Utc>,
}

/// Thread-safe shared run log.
pub type SharedRunLog = Arc<RunLog>;

pub fn create_shared_log() -> SharedRunLog {
    Arc::new(RunLog::new())
}

/// Create a shared run log persisted at `path`.
pub fn create_shared_log_with_persistence(path: PathBuf) -> SharedRunLog {
    Arc::new(RunLog::with_persistence(path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_log_counting() {
        let log = RunLog::new();

        log.record_check();
        log.record_check();
        log.record_points_written(5);
        log.record_window_skipped();

        let stats = log.stats();
        assert_eq!(stats.checks_run, 2);
        assert_eq!(stats.points_written, 5);
        assert_eq!(stats.windows_skipped, 1);
        assert_eq!(stats.formula_failures, 0);
    }

    #[test]
    fn test_persistence_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run_stats.json");

        let log = RunLog::with_persistence(path.clone());
        log.record_formula_window();
        log.record_window_without_value();
        log.save().unwrap();

        let reloaded = RunLog::with_persistence(path);
        let stats = reloaded.stats();
        assert_eq!(stats.formula_windows, 1);
        assert_eq!(stats.windows_without_value, 1);
    }

    #[test]
    fn test_summary_format() {
        let summary = RunLog::new().summary();
        assert!(summary.contains("Checks run"));
        assert!(summary.contains("Formula failures"));
    }
}
