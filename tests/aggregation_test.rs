//! Integration tests for checkpointed aggregation against the in-memory store.

use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use periodic_series::core::{
    AggregationKind, AggregationSpec, AggregationTarget, CheckOptions, CheckState,
    CheckpointedAggregator, PeriodSpec, PeriodUnit,
};
use periodic_series::stats::create_shared_log;
use periodic_series::store::{
    CheckpointStore, FixedClock, MemoryStore, Sample, SeriesId, TimeUnit,
};

const SOURCE: SeriesId = 1;
const TARGET: SeriesId = 50;

fn utc(y: i32, m: u32, d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
}

/// Daily samples at noon, valued with the day of the year.
fn daily_samples(from: DateTime<Utc>, to: DateTime<Utc>) -> MemoryStore {
    let store = MemoryStore::new();
    let mut samples = Vec::new();
    let mut day = from;
    while day < to {
        let at = day + Duration::hours(12);
        samples.push(Sample::new(at.timestamp(), f64::from(at.ordinal())));
        day += Duration::days(1);
    }
    store
        .insert_samples(SOURCE, &samples, TimeUnit::Seconds)
        .unwrap();
    store
}

fn target(kind: AggregationKind, period: PeriodSpec) -> AggregationTarget {
    AggregationTarget {
        id: TARGET,
        source: SOURCE,
        spec: AggregationSpec::new(kind, period),
    }
}

fn stored(store: &MemoryStore) -> Vec<Sample> {
    store.samples(TARGET, TimeUnit::Seconds).unwrap()
}

#[test]
fn test_quarterly_windows_follow_calendar() {
    let store = daily_samples(utc(2024, 1, 1), utc(2024, 12, 31));
    let clock = FixedClock(utc(2024, 11, 15));
    let aggregator = CheckpointedAggregator::new(&store, &store, &clock);
    let quarterly = target(
        AggregationKind::Max,
        PeriodSpec::new(utc(2024, 1, 31), PeriodUnit::Month, 3),
    );

    let report = aggregator
        .check_to_now(&quarterly, CheckOptions::default())
        .unwrap();

    let stamps: Vec<DateTime<Utc>> = report.points.iter().map(|p| p.timestamp).collect();
    assert_eq!(
        stamps,
        vec![utc(2024, 1, 31), utc(2024, 4, 30), utc(2024, 7, 31)]
    );
    // Apr 29 is the last day before the Apr 30 boundary.
    assert_eq!(report.points[0].value, 120.0);
    assert_eq!(report.checkpoint, Some(utc(2024, 7, 31)));
}

#[test]
fn test_repeated_check_is_idempotent() {
    let store = daily_samples(utc(2024, 1, 1), utc(2024, 3, 1));
    let clock = FixedClock(utc(2024, 2, 20));
    let run_log = create_shared_log();
    let aggregator = CheckpointedAggregator::new(&store, &store, &clock)
        .with_unit(TimeUnit::Seconds)
        .with_run_log(run_log.clone());
    let weekly = target(
        AggregationKind::Mean,
        PeriodSpec::new(utc(2024, 1, 1), PeriodUnit::Week, 1),
    );

    let first = aggregator
        .check_period(&weekly, utc(2024, 1, 1), utc(2024, 2, 20), CheckOptions::default())
        .unwrap();
    let points_after_first = stored(&store);
    let state_after_first = store.get(TARGET).unwrap();

    let second = aggregator
        .check_period(&weekly, utc(2024, 1, 1), utc(2024, 2, 20), CheckOptions::default())
        .unwrap();

    assert_eq!(first.written, 7);
    assert_eq!(second.written, 0);
    assert_eq!(stored(&store), points_after_first);
    assert_eq!(store.get(TARGET).unwrap().last_check, state_after_first.last_check);

    let stats = run_log.stats();
    assert_eq!(stats.checks_run, 2);
    assert_eq!(stats.points_written, 7);
    assert_eq!(stats.windows_skipped, 7);
}

#[test]
fn test_partial_never_moves_checkpoint_past_its_start() {
    let store = daily_samples(utc(2024, 1, 1), utc(2024, 3, 1));
    let monthly = target(
        AggregationKind::Count,
        PeriodSpec::new(utc(2024, 1, 1), PeriodUnit::Month, 1),
    );
    let options = CheckOptions {
        include_partial: true,
        ..CheckOptions::default()
    };

    for day in [10, 20, 28] {
        let clock = FixedClock(utc(2024, 2, day));
        let aggregator = CheckpointedAggregator::new(&store, &store, &clock);
        let report = aggregator.check_to_now(&monthly, options).unwrap();

        let partial = report.partial.expect("partial point staged");
        assert_eq!(partial.timestamp, utc(2024, 2, 1));
        assert_eq!(partial.value, f64::from(day - 1));
        assert!(report.checkpoint.unwrap() <= partial.timestamp);
    }

    // Once February is over the partial point is replaced by the full count.
    let clock = FixedClock(utc(2024, 3, 1));
    let aggregator = CheckpointedAggregator::new(&store, &store, &clock);
    let report = aggregator
        .check_to_now(&monthly, CheckOptions::default())
        .unwrap();
    assert_eq!(report.state, CheckState::Checked);
    assert_eq!(
        stored(&store),
        vec![
            Sample::new(utc(2024, 1, 1).timestamp(), 31.0),
            Sample::new(utc(2024, 2, 1).timestamp(), 29.0),
        ]
    );
    assert_eq!(store.get(TARGET).unwrap().partial_at, None);
}

#[test]
fn test_checkpoint_survives_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.json");
    let daily = target(
        AggregationKind::Total,
        PeriodSpec::new(utc(2024, 1, 1), PeriodUnit::Day, 1),
    );
    let clock = FixedClock(utc(2024, 1, 10));

    {
        let store = daily_samples(utc(2024, 1, 1), utc(2024, 1, 31));
        let aggregator = CheckpointedAggregator::new(&store, &store, &clock);
        let report = aggregator
            .check_to_now(&daily, CheckOptions::default())
            .unwrap();
        assert_eq!(report.written, 9);
        store.save(&path).unwrap();
    }

    let store = MemoryStore::load(&path).unwrap();
    assert_eq!(store.get(TARGET).unwrap().last_check, Some(utc(2024, 1, 9)));

    let aggregator = CheckpointedAggregator::new(&store, &store, &clock);
    let report = aggregator
        .check_to_now(&daily, CheckOptions::default())
        .unwrap();
    assert_eq!(report.written, 0);
    assert_eq!(stored(&store).len(), 9);
}

#[test]
fn test_ignore_checkpoint_restarts_at_anchor() {
    let store = daily_samples(utc(2024, 1, 1), utc(2024, 1, 31));
    let clock = FixedClock(utc(2024, 1, 5));
    let aggregator = CheckpointedAggregator::new(&store, &store, &clock);
    let mut daily = target(
        AggregationKind::Last,
        PeriodSpec::new(utc(2024, 1, 1), PeriodUnit::Day, 1),
    );

    aggregator
        .check_to_now(&daily, CheckOptions::default())
        .unwrap();

    daily.spec.timestamp_offset = Duration::hours(23);
    let report = aggregator
        .check_to_now(
            &daily,
            CheckOptions {
                ignore_checkpoint: true,
                ..CheckOptions::default()
            },
        )
        .unwrap();

    assert_eq!(report.points.len(), 4);
    assert_eq!(report.points[0].timestamp, utc(2024, 1, 1) + Duration::hours(23));
}
