//! In-memory implementation of the store collaborators.
//!
//! Timestamps are kept in milliseconds regardless of the unit a caller
//! negotiates. The whole store can be snapshotted to a JSON file, which is how
//! the binary keeps state between runs.

use crate::core::checkpoint::CheckpointState;
use crate::store::{
    CheckpointStore, Sample, SeriesId, StoreError, TimeSeriesStore, TimeUnit,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

type SeriesData = HashMap<SeriesId, BTreeMap<i64, f64>>;

/// Thread-safe in-memory sample and checkpoint store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    series: RwLock<SeriesData>,
    checkpoints: RwLock<HashMap<SeriesId, CheckpointState>>,
    invalidations: RwLock<HashMap<SeriesId, u64>>,
    /// Number of points stored through `write_points` since creation
    points_written: AtomicU64,
}

/// On-disk snapshot format.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreSnapshot {
    #[serde(default)]
    series: SeriesData,
    #[serde(default)]
    checkpoints: HashMap<SeriesId, CheckpointState>,
}

fn read<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>, StoreError> {
    lock.read()
        .map_err(|_| StoreError::Unavailable("store lock poisoned".to_string()))
}

fn write<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>, StoreError> {
    lock.write()
        .map_err(|_| StoreError::Unavailable("store lock poisoned".to_string()))
}

/// Millisecond key for a raw timestamp.
fn to_millis(raw: i64, unit: TimeUnit) -> i64 {
    raw.saturating_mul(1000 / unit.ticks_per_second())
}

/// Raw timestamp (floored) for a millisecond key.
fn from_millis(millis: i64, unit: TimeUnit) -> i64 {
    millis.div_euclid(1000 / unit.ticks_per_second())
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a snapshot, or start empty when the file does not exist.
    pub fn load(path: &Path) -> Result<Self, StoreError> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let content = std::fs::read_to_string(path)?;
        let snapshot: StoreSnapshot = serde_json::from_str(&content)?;
        Ok(Self {
            series: RwLock::new(snapshot.series),
            checkpoints: RwLock::new(snapshot.checkpoints),
            ..Self::default()
        })
    }

    /// Write a snapshot of samples and checkpoints.
    pub fn save(&self, path: &Path) -> Result<(), StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let snapshot = StoreSnapshot {
            series: read(&self.series)?.clone(),
            checkpoints: read(&self.checkpoints)?.clone(),
        };
        std::fs::write(path, serde_json::to_string_pretty(&snapshot)?)?;
        Ok(())
    }

    /// Append raw samples, replacing any sample at the same timestamp.
    pub fn insert_samples(
        &self,
        series_id: SeriesId,
        samples: &[Sample],
        unit: TimeUnit,
    ) -> Result<(), StoreError> {
        let mut series = write(&self.series)?;
        let data = series.entry(series_id).or_default();
        for sample in samples {
            data.insert(to_millis(sample.timestamp, unit), sample.value);
        }
        Ok(())
    }

    /// Every sample of a series, ascending.
    pub fn samples(&self, series_id: SeriesId, unit: TimeUnit) -> Result<Vec<Sample>, StoreError> {
        let series = read(&self.series)?;
        Ok(series
            .get(&series_id)
            .map(|data| {
                data.iter()
                    .map(|(&ms, &value)| Sample::new(from_millis(ms, unit), value))
                    .collect()
            })
            .unwrap_or_default())
    }

    /// How many times downstream caches of a series were invalidated.
    pub fn invalidation_count(&self, series_id: SeriesId) -> u64 {
        read(&self.invalidations)
            .map(|counts| counts.get(&series_id).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Total points stored through `write_points`.
    pub fn points_written(&self) -> u64 {
        self.points_written.load(Ordering::Relaxed)
    }

    /// Ids of every series holding data, ascending.
    pub fn series_ids(&self) -> Result<Vec<SeriesId>, StoreError> {
        let mut ids: Vec<SeriesId> = read(&self.series)?.keys().copied().collect();
        ids.sort_unstable();
        Ok(ids)
    }
}

impl TimeSeriesStore for MemoryStore {
    fn read_samples(
        &self,
        series_id: SeriesId,
        time_min: i64,
        time_max: i64,
        time_max_excluded: bool,
        unit: TimeUnit,
    ) -> Result<Vec<Sample>, StoreError> {
        let lower = to_millis(time_min, unit);
        // An included upper bound covers the whole tick of `time_max`.
        let upper = if time_max_excluded {
            to_millis(time_max, unit)
        } else {
            to_millis(time_max.saturating_add(1), unit)
        };
        if upper <= lower {
            return Ok(Vec::new());
        }

        let series = read(&self.series)?;
        Ok(series
            .get(&series_id)
            .map(|data| {
                data.range(lower..upper)
                    .map(|(&ms, &value)| Sample::new(from_millis(ms, unit), value))
                    .collect()
            })
            .unwrap_or_default())
    }

    fn write_points(
        &self,
        series_id: SeriesId,
        points: &[Sample],
        unit: TimeUnit,
        ignore_duplicate_conflicts: bool,
    ) -> Result<usize, StoreError> {
        let mut series = write(&self.series)?;
        let data = series.entry(series_id).or_default();
        let mut stored = 0;
        for point in points {
            let key = to_millis(point.timestamp, unit);
            if ignore_duplicate_conflicts && data.contains_key(&key) {
                continue;
            }
            data.insert(key, point.value);
            stored += 1;
        }
        self.points_written
            .fetch_add(stored as u64, Ordering::Relaxed);
        Ok(stored)
    }

    fn invalidate_downstream_cache(&self, series_id: SeriesId) -> Result<(), StoreError> {
        *write(&self.invalidations)?.entry(series_id).or_insert(0) += 1;
        Ok(())
    }

    fn latest_sample(
        &self,
        series_id: SeriesId,
        bound: i64,
        bound_excluded: bool,
        unit: TimeUnit,
    ) -> Result<Option<Sample>, StoreError> {
        let upper = if bound_excluded {
            to_millis(bound, unit)
        } else {
            to_millis(bound.saturating_add(1), unit)
        };
        let series = read(&self.series)?;
        Ok(series.get(&series_id).and_then(|data| {
            data.range(..upper)
                .next_back()
                .map(|(&ms, &value)| Sample::new(from_millis(ms, unit), value))
        }))
    }
}

impl CheckpointStore for MemoryStore {
    fn get(&self, series_id: SeriesId) -> Result<CheckpointState, StoreError> {
        Ok(read(&self.checkpoints)?
            .get(&series_id)
            .cloned()
            .unwrap_or_default())
    }

    fn set(&self, series_id: SeriesId, state: &CheckpointState) -> Result<(), StoreError> {
        write(&self.checkpoints)?.insert(series_id, state.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with(series_id: SeriesId, samples: &[(i64, f64)]) -> MemoryStore {
        let store = MemoryStore::new();
        let samples: Vec<Sample> = samples.iter().map(|&(t, v)| Sample::new(t, v)).collect();
        store
            .insert_samples(series_id, &samples, TimeUnit::Seconds)
            .unwrap();
        store
    }

    #[test]
    fn test_read_excluded_and_included_bounds() {
        let store = store_with(1, &[(10, 1.0), (20, 2.0), (30, 3.0)]);

        let excluded = store.read_samples(1, 10, 30, true, TimeUnit::Seconds).unwrap();
        assert_eq!(excluded.len(), 2);

        let included = store.read_samples(1, 10, 30, false, TimeUnit::Seconds).unwrap();
        assert_eq!(included.len(), 3);
        assert_eq!(included[2], Sample::new(30, 3.0));
    }

    #[test]
    fn test_read_in_other_unit() {
        let store = store_with(1, &[(10, 1.0)]);
        let samples = store
            .read_samples(1, 9_000, 11_000, true, TimeUnit::Milliseconds)
            .unwrap();
        assert_eq!(samples, vec![Sample::new(10_000, 1.0)]);
    }

    #[test]
    fn test_write_ignores_or_replaces_duplicates() {
        let store = store_with(2, &[(10, 1.0)]);

        let kept = store
            .write_points(2, &[Sample::new(10, 9.0), Sample::new(20, 2.0)], TimeUnit::Seconds, true)
            .unwrap();
        assert_eq!(kept, 1);
        assert_eq!(store.samples(2, TimeUnit::Seconds).unwrap()[0].value, 1.0);

        let replaced = store
            .write_points(2, &[Sample::new(10, 9.0)], TimeUnit::Seconds, false)
            .unwrap();
        assert_eq!(replaced, 1);
        assert_eq!(store.samples(2, TimeUnit::Seconds).unwrap()[0].value, 9.0);
        assert_eq!(store.points_written(), 2);
    }

    #[test]
    fn test_latest_sample() {
        let store = store_with(3, &[(10, 1.0), (20, 2.0)]);
        let latest = store.latest_sample(3, 20, true, TimeUnit::Seconds).unwrap();
        assert_eq!(latest, Some(Sample::new(10, 1.0)));
        let latest = store.latest_sample(3, 20, false, TimeUnit::Seconds).unwrap();
        assert_eq!(latest, Some(Sample::new(20, 2.0)));
        assert_eq!(store.latest_sample(3, 5, false, TimeUnit::Seconds).unwrap(), None);
    }

    #[test]
    fn test_snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");

        let store = store_with(4, &[(10, 1.5)]);
        let mut state = CheckpointState::default();
        state.set_status("Checked");
        store.set(4, &state).unwrap();
        store.save(&path).unwrap();

        let loaded = MemoryStore::load(&path).unwrap();
        assert_eq!(
            loaded.samples(4, TimeUnit::Seconds).unwrap(),
            vec![Sample::new(10, 1.5)]
        );
        assert_eq!(loaded.get(4).unwrap().status, "Checked");
    }

    #[test]
    fn test_invalidation_counter() {
        let store = MemoryStore::new();
        store.invalidate_downstream_cache(7).unwrap();
        store.invalidate_downstream_cache(7).unwrap();
        assert_eq!(store.invalidation_count(7), 2);
        assert_eq!(store.invalidation_count(8), 0);
    }
}
