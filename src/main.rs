//! Periodic series CLI
//!
//! Derives aggregate and formula series from raw samples on a schedule.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use crossbeam_channel::RecvTimeoutError;
use periodic_series::{
    config::Config,
    core::{
        CheckOptions, CheckpointedAggregator, ExpressionEvaluator, Formula, Order, QueryOptions,
    },
    stats::{create_shared_log_with_persistence, SharedRunLog},
    store::{CheckpointStore, MemoryStore, Sample, SeriesConfig, SeriesId, SystemClock, TimeUnit},
    VERSION,
};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "periodic-series")]
#[command(version = VERSION)]
#[command(about = "Calendar-aligned aggregation and formula engine", long_about = None)]
struct Cli {
    /// Configuration file (defaults to the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Aggregate every target (or the selected ones) up to now
    Check {
        /// Aggregation target ids (all when omitted)
        #[arg(long = "target")]
        targets: Vec<SeriesId>,

        /// Recompute windows that already have a point
        #[arg(long)]
        force_write: bool,

        /// Also store the current, incomplete window
        #[arg(long)]
        include_partial: bool,

        /// Restart from the period anchor
        #[arg(long)]
        ignore_checkpoint: bool,
    },

    /// Aggregate one target over an explicit range
    CheckPeriod {
        target: SeriesId,

        /// Range start (RFC 3339)
        from: String,

        /// Range end (RFC 3339)
        to: String,

        #[arg(long)]
        force_write: bool,

        #[arg(long)]
        include_partial: bool,
    },

    /// Check all targets at the configured interval until Ctrl+C
    Run,

    /// Evaluate formula targets and print the values as JSON
    Query {
        /// Formula target ids
        #[arg(required = true)]
        ids: Vec<SeriesId>,

        /// Range start (RFC 3339)
        #[arg(long)]
        from: String,

        /// Range end (RFC 3339, defaults to now)
        #[arg(long)]
        to: Option<String>,

        /// Window order (asc or desc)
        #[arg(long, default_value = "asc")]
        order: Order,

        /// Maximum number of values per target
        #[arg(long)]
        quantity: Option<usize>,

        /// Stop evaluating after this many milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Prepend the latest stored value before the first window
        #[arg(long)]
        first_value: bool,

        /// Print timestamps in milliseconds instead of seconds
        #[arg(long)]
        ms: bool,
    },

    /// Store a raw sample
    Ingest {
        series: SeriesId,

        value: f64,

        /// Sample time (RFC 3339, defaults to now)
        #[arg(long)]
        at: Option<String>,
    },

    /// Forget the checkpoint of a target
    Reset { target: SeriesId },

    /// Show targets, checkpoints and run statistics
    Status,

    /// Show configuration
    Config,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(Config::config_path);
    let config = Config::load_from(&config_path)
        .with_context(|| format!("loading configuration from {config_path:?}"))?;

    match cli.command {
        Commands::Check {
            targets,
            force_write,
            include_partial,
            ignore_checkpoint,
        } => cmd_check(
            &config,
            &targets,
            CheckOptions {
                force_write,
                include_partial,
                ignore_checkpoint,
            },
        ),
        Commands::CheckPeriod {
            target,
            from,
            to,
            force_write,
            include_partial,
        } => cmd_check_period(
            &config,
            target,
            parse_time(&from)?,
            parse_time(&to)?,
            CheckOptions {
                force_write,
                include_partial,
                ignore_checkpoint: false,
            },
        ),
        Commands::Run => cmd_run(&config),
        Commands::Query {
            ids,
            from,
            to,
            order,
            quantity,
            timeout_ms,
            first_value,
            ms,
        } => {
            let to = match to {
                Some(to) => parse_time(&to)?,
                None => Utc::now(),
            };
            let options = QueryOptions {
                order,
                quantity,
                timeout: timeout_ms.map(Duration::from_millis),
                query_first_value: first_value,
                unit: if ms {
                    TimeUnit::Milliseconds
                } else {
                    TimeUnit::Seconds
                },
            };
            cmd_query(&config, &ids, parse_time(&from)?, to, &options)
        }
        Commands::Ingest { series, value, at } => {
            let at = match at {
                Some(at) => parse_time(&at)?,
                None => Utc::now(),
            };
            cmd_ingest(&config, series, value, at)
        }
        Commands::Reset { target } => cmd_reset(&config, target),
        Commands::Status => cmd_status(&config),
        Commands::Config => cmd_config(&config, &config_path),
    }
}

fn parse_time(text: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(text)
        .with_context(|| format!("invalid RFC 3339 time {text:?}"))?
        .with_timezone(&Utc))
}

/// Validated configuration plus the host store and run log.
struct Host<'a> {
    config: &'a Config,
    store: MemoryStore,
    run_log: SharedRunLog,
}

impl<'a> Host<'a> {
    fn open(config: &'a Config) -> Result<Self> {
        config.validate().context("invalid configuration")?;
        config
            .ensure_directories()
            .context("creating data directory")?;
        let store = MemoryStore::load(&config.store_path())
            .with_context(|| format!("loading store from {:?}", config.store_path()))?;
        let run_log = create_shared_log_with_persistence(config.stats_path());
        Ok(Self {
            config,
            store,
            run_log,
        })
    }

    fn aggregator<'b>(&'b self, clock: &'b SystemClock) -> CheckpointedAggregator<'b> {
        CheckpointedAggregator::new(&self.store, &self.store, clock)
            .with_unit(self.config.timestamp_unit)
            .with_run_log(self.run_log.clone())
    }

    /// Check the selected aggregation targets, all of them when `ids` is empty.
    fn check(&self, ids: &[SeriesId], options: CheckOptions) -> Result<()> {
        let clock = SystemClock;
        let aggregator = self.aggregator(&clock);

        let targets: Vec<_> = if ids.is_empty() {
            self.config.aggregations.iter().collect()
        } else {
            ids.iter()
                .map(|&id| {
                    self.config
                        .aggregation(id)
                        .with_context(|| format!("series {id} is not an aggregation target"))
                })
                .collect::<Result<Vec<_>>>()?
        };

        for target in targets {
            let report = aggregator
                .check_to_now(target, options)
                .with_context(|| format!("checking series {}", target.id))?;
            println!(
                "[{}] series {}: {} ({} written)",
                Utc::now().format("%H:%M:%S"),
                target.id,
                report.state,
                report.written
            );
        }
        Ok(())
    }

    fn persist(&self) -> Result<()> {
        self.store
            .save(&self.config.store_path())
            .context("saving store")?;
        if let Err(e) = self.run_log.save() {
            eprintln!("Warning: Could not save run statistics: {e}");
        }
        Ok(())
    }
}

fn cmd_check(config: &Config, ids: &[SeriesId], options: CheckOptions) -> Result<()> {
    let host = Host::open(config)?;
    host.check(ids, options)?;
    host.persist()
}

fn cmd_check_period(
    config: &Config,
    target: SeriesId,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    options: CheckOptions,
) -> Result<()> {
    let host = Host::open(config)?;
    let Some(aggregation) = config.aggregation(target) else {
        bail!("series {target} is not an aggregation target");
    };

    let clock = SystemClock;
    let report = host
        .aggregator(&clock)
        .check_period(aggregation, from, to, options)?;
    println!("Series {}: {}", target, report.state);
    for point in &report.points {
        println!("  {} = {}", point.timestamp, point.value);
    }
    println!("Written: {}", report.written);
    host.persist()
}

fn cmd_run(config: &Config) -> Result<()> {
    let host = Host::open(config)?;

    println!("Periodic Series v{VERSION}");
    println!("  Aggregation targets: {}", config.aggregations.len());
    println!("  Check interval: {}s", config.check_interval.as_secs());
    println!();
    println!("Press Ctrl+C to stop");
    println!();

    let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(1);
    ctrlc::set_handler(move || {
        let _ = shutdown_tx.try_send(());
    })
    .context("setting Ctrl+C handler")?;

    loop {
        if let Err(e) = host.check(&[], CheckOptions::default()) {
            eprintln!("Check failed: {e:#}");
        }
        host.persist()?;

        match shutdown_rx.recv_timeout(config.check_interval) {
            Err(RecvTimeoutError::Timeout) => continue,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    println!();
    println!("Stopping...");
    host.persist()?;
    println!();
    println!("{}", host.run_log.summary());
    Ok(())
}

fn cmd_query(
    config: &Config,
    ids: &[SeriesId],
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    options: &QueryOptions,
) -> Result<()> {
    let host = Host::open(config)?;
    let clock = SystemClock;
    let evaluator =
        ExpressionEvaluator::new(&host.store, config, &clock).with_run_log(host.run_log.clone());

    let result = evaluator.query(
        ids,
        options.unit.to_raw(from),
        options.unit.to_raw(to),
        options,
    )?;
    println!("{}", serde_json::to_string_pretty(&result)?);

    if let Err(e) = host.run_log.save() {
        eprintln!("Warning: Could not save run statistics: {e}");
    }
    Ok(())
}

fn cmd_ingest(config: &Config, series: SeriesId, value: f64, at: DateTime<Utc>) -> Result<()> {
    let host = Host::open(config)?;
    let unit = TimeUnit::Milliseconds;
    host.store
        .insert_samples(series, &[Sample::new(unit.to_raw(at), value)], unit)?;
    host.store.save(&config.store_path())?;
    println!("Stored series {series} @ {at} = {value}");
    Ok(())
}

fn cmd_reset(config: &Config, target: SeriesId) -> Result<()> {
    let host = Host::open(config)?;
    if config.aggregation(target).is_none() {
        bail!("series {target} is not an aggregation target");
    }
    let clock = SystemClock;
    host.aggregator(&clock).reset(target)?;
    host.persist()?;
    println!("Checkpoint of series {target} reset.");
    Ok(())
}

fn cmd_status(config: &Config) -> Result<()> {
    let host = Host::open(config)?;

    println!("Periodic Series Status");
    println!("======================");
    println!();

    println!("Aggregation targets:");
    if config.aggregations.is_empty() {
        println!("  (none)");
    }
    for target in &config.aggregations {
        let state = host.store.get(target.id)?;
        println!(
            "  {} <- {} {} every {}",
            target.id, target.spec.kind, target.source, target.spec.period
        );
        match state.last_check {
            Some(at) => println!("    checkpoint: {at}"),
            None => println!("    checkpoint: (none)"),
        }
        if !state.status.is_empty() {
            println!("    status: {}", state.status);
        }
    }
    println!();

    println!("Formula targets:");
    if config.formulas.is_empty() {
        println!("  (none)");
    }
    for target in &config.formulas {
        println!("  {} = {}", target.id, target.spec.expression);
        if let Ok(formula) = Formula::parse(&target.spec.expression) {
            println!("    reads: {:?}", formula.referenced_series());
        }
        if let Some(post) = target.spec.post_expression() {
            println!("    then: {post}");
        }
    }
    println!();

    println!("Stored series: {:?}", host.store.series_ids()?);
    println!();
    println!("{}", host.run_log.summary());
    Ok(())
}

fn cmd_config(config: &Config, path: &std::path::Path) -> Result<()> {
    println!("Configuration");
    println!("=============");
    println!();
    println!("Config file: {path:?}");
    println!();
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}
