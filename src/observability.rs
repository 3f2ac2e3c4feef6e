// In: src/observability.rs

//! Logging setup and stage timing for the pipeline.
//!
//! All diagnostics go through the `log` facade. Binaries call [`init_logging`]
//! once; library code only emits. The `log_metric!` macro produces structured
//! key/value lines at debug level and is compiled out of release builds.

use std::fs::OpenOptions;
use std::sync::Once;
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use log::LevelFilter;

use crate::error::Result;

/// Logs a structured key-value metric line at debug level, only in debug builds.
///
/// # Example
/// ```
/// use firehose::log_metric;
/// let rows = 4;
/// log_metric!("event"="flush", "job"="demo", "rows"=&rows);
/// ```
#[macro_export]
macro_rules! log_metric {
    ($($key:literal = $value:expr),+ $(,)?) => {
        #[cfg(debug_assertions)]
        {
            let mut parts = Vec::new();
            $(
                parts.push(format!("\"{}\": \"{}\"", $key, $value));
            )+
            ::log::debug!("FIREHOSE_METRIC: {{ {} }}", parts.join(", "));
        }
    };
}

//==================================================================================
// I. Logger Initialization
//==================================================================================

static INIT_LOGGER: Once = Once::new();

/// Configures `env_logger` with a `[LEVEL] message` format. Info level unless
/// `RUST_LOG` says otherwise. When `log_file` is given, output is appended to
/// it instead of stderr. Only the first call has any effect.
pub fn init_logging(log_file: Option<&str>) -> Result<()> {
    let mut outcome = Ok(());
    INIT_LOGGER.call_once(|| {
        let mut builder = env_logger::Builder::new();

        builder.is_test(false);
        builder.filter_level(LevelFilter::Info);
        builder.parse_default_env();

        builder.format(|buf, record| {
            use std::io::Write;
            writeln!(buf, "[{}] {}", record.level(), record.args())?;
            buf.flush()?;
            Ok(())
        });

        if let Some(filename) = log_file {
            match OpenOptions::new().append(true).create(true).open(filename) {
                Ok(file) => {
                    builder.target(env_logger::Target::Pipe(Box::new(file)));
                }
                Err(e) => {
                    outcome = Err(e.into());
                    return;
                }
            }
        }

        let _ = builder.try_init();
    });
    outcome
}

//==================================================================================
// II. Stage Timing
//==================================================================================

/// Cumulative figures for one named stage.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StageStats {
    pub calls: u64,
    pub rows: u64,
    pub elapsed: Duration,
}

impl StageStats {
    pub fn rows_per_sec(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.rows as f64 / secs
        } else {
            0.0
        }
    }
}

/// Accumulates wall-clock time and row throughput per pipeline stage.
#[derive(Debug, Default)]
pub struct StageTimer {
    stages: HashMap<&'static str, StageStats>,
    order: Vec<&'static str>,
}

impl StageTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `f`, charging its duration and `rows` to `stage`.
    pub fn time<T>(&mut self, stage: &'static str, rows: usize, f: impl FnOnce() -> T) -> T {
        let start = Instant::now();
        let out = f();
        self.record(stage, start.elapsed(), rows);
        out
    }

    pub fn record(&mut self, stage: &'static str, elapsed: Duration, rows: usize) {
        if !self.stages.contains_key(stage) {
            self.order.push(stage);
        }
        let entry = self.stages.entry(stage).or_default();
        entry.calls += 1;
        entry.rows += rows as u64;
        entry.elapsed += elapsed;
    }

    pub fn get(&self, stage: &str) -> Option<StageStats> {
        self.stages.get(stage).copied()
    }

    /// Stages in the order they were first recorded.
    pub fn summary(&self) -> Vec<(&'static str, StageStats)> {
        self.order
            .iter()
            .filter_map(|s| self.stages.get(s).map(|st| (*s, *st)))
            .collect()
    }

    /// Emits one debug line per stage.
    pub fn report(&self) {
        for (stage, st) in self.summary() {
            log::debug!(
                "stage {:<10} calls={} rows={} elapsed={:.3}s ({:.0} rows/s)",
                stage,
                st.calls,
                st.rows,
                st.elapsed.as_secs_f64(),
                st.rows_per_sec()
            );
        }
    }
}
