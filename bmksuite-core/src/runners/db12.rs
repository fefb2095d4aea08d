//! DB12 CPU normalization benchmark.
//!
//! One calibration worker per core draws gaussian samples for a fixed number
//! of iterations and converts the thread CPU time spent into a score in
//! reference units. The suite result is the mean over all workers.

use rand::Rng;
use serde_json::json;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::config::SuiteConfig;

/// Samples drawn per calibration iteration; 360 HS06 seconds of work.
pub const SAMPLES_PER_ITERATION: u64 = 12_500_000;

/// Reference unit for the normalized score.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Db12Unit {
    Hs06,
    Si00,
}

impl Db12Unit {
    pub fn scale(&self) -> f64 {
        match self {
            Db12Unit::Hs06 => 1.0,
            Db12Unit::Si00 => 1.0 / 344.0,
        }
    }

    /// Unit label written next to the value in the result file.
    pub fn label(&self) -> &'static str {
        match self {
            Db12Unit::Hs06 => "est. HS06",
            Db12Unit::Si00 => "est. SI00",
        }
    }

    /// Parse a unit name, falling back to HS06 for anything unknown.
    pub fn parse_or_default(name: &str) -> Self {
        match name.to_ascii_uppercase().as_str() {
            "HS06" => Db12Unit::Hs06,
            "SI00" => Db12Unit::Si00,
            other => {
                warn!(unit = other, "Unknown normalization unit, using HS06");
                Db12Unit::Hs06
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct Db12Options {
    pub iterations: u32,
    pub unit: Db12Unit,
    pub workers: usize,
    pub samples_per_iteration: u64,
}

impl Db12Options {
    pub fn from_config(config: &SuiteConfig) -> Self {
        Self {
            iterations: config.db12.iterations.clamp(1, 10),
            unit: Db12Unit::parse_or_default(&config.db12.unit),
            workers: config.global.mp_num_or_cores(),
            samples_per_iteration: SAMPLES_PER_ITERATION,
        }
    }
}

/// Timing of one calibration worker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WorkerScore {
    pub score: f64,
    pub cpu_seconds: f64,
    pub wall_seconds: f64,
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("worker measured zero CPU time")]
    ZeroCpuTime,

    #[error("failed to read thread CPU clock: {0}")]
    Clock(#[from] std::io::Error),
}

/// Aggregate over every worker.
#[derive(Debug, Clone, PartialEq)]
pub struct Db12Outcome {
    pub scores: Vec<f64>,
    pub failed_workers: usize,
}

impl Db12Outcome {
    /// Mean worker score. Zero when any worker failed or none ran.
    pub fn value(&self) -> f64 {
        if self.failed_workers > 0 || self.scores.is_empty() {
            return 0.0;
        }
        self.scores.iter().sum::<f64>() / self.scores.len() as f64
    }
}

fn thread_cpu_time() -> Result<Duration, WorkerError> {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: ts is a valid, writable timespec.
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_THREAD_CPUTIME_ID, &mut ts) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(Duration::new(ts.tv_sec as u64, ts.tv_nsec as u32))
}

/// Box-Muller draw from N(mean, sd).
fn normal_sample(rng: &mut impl Rng, mean: f64, sd: f64) -> f64 {
    // u1 in (0, 1] keeps ln() finite
    let u1: f64 = 1.0 - rng.gen_range(0.0..1.0);
    let u2: f64 = rng.gen_range(0.0..1.0);
    mean + sd * (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

fn draw_samples(rng: &mut impl Rng, samples: u64) {
    let (mut sum, mut sum_sq) = (0.0f64, 0.0f64);
    for _ in 0..samples {
        let t = normal_sample(rng, 10.0, 1.0);
        sum += t;
        sum_sq += t * t;
    }
    std::hint::black_box((sum, sum_sq));
}

/// Run one calibration worker on the current thread.
///
/// The first iteration warms up CPUs with variable clock speed and is not
/// timed.
pub fn calibrate(options: &Db12Options) -> Result<WorkerScore, WorkerError> {
    let iterations = options.iterations.clamp(1, 10);
    let calib = 360.0 / options.unit.scale();
    let mut rng = rand::thread_rng();

    draw_samples(&mut rng, options.samples_per_iteration);

    let start_cpu = thread_cpu_time()?;
    let start_wall = Instant::now();
    for _ in 0..iterations {
        draw_samples(&mut rng, options.samples_per_iteration);
    }
    let cpu_seconds = (thread_cpu_time()? - start_cpu).as_secs_f64();
    let wall_seconds = start_wall.elapsed().as_secs_f64();

    if cpu_seconds <= 0.0 {
        return Err(WorkerError::ZeroCpuTime);
    }

    Ok(WorkerScore {
        score: calib * f64::from(iterations) / cpu_seconds,
        cpu_seconds,
        wall_seconds,
    })
}

/// Fan out one worker per configured core and join them all.
pub async fn run_workers(options: &Db12Options) -> Db12Outcome {
    info!(
        workers = options.workers,
        iterations = options.iterations,
        "Running DB12"
    );

    let handles = (0..options.workers.max(1))
        .map(|_| {
            let options = options.clone();
            tokio::task::spawn_blocking(move || calibrate(&options))
        })
        .collect::<Vec<_>>();

    let mut outcome = Db12Outcome {
        scores: Vec::with_capacity(handles.len()),
        failed_workers: 0,
    };
    for (worker, handle) in handles.into_iter().enumerate() {
        match handle.await {
            Ok(Ok(score)) => {
                debug!(
                    worker,
                    score = score.score,
                    cpu = score.cpu_seconds,
                    wall = score.wall_seconds,
                    "DB12 worker finished"
                );
                outcome.scores.push(score.score);
            }
            Ok(Err(e)) => {
                error!(worker, error = %e, "DB12 worker failed");
                outcome.failed_workers += 1;
            }
            Err(e) => {
                error!(worker, error = %e, "DB12 worker died");
                outcome.failed_workers += 1;
            }
        }
    }
    outcome
}

/// Write `{"DB12": {"value": .., "unit": ..}}` to `db12_result.json`.
pub fn write_result(path: &Path, value: f64, unit: Db12Unit) -> std::io::Result<()> {
    let payload = json!({ "DB12": { "value": value, "unit": unit.label() } });
    let body = serde_json::to_string_pretty(&payload).map_err(std::io::Error::other)?;
    std::fs::write(path, body)?;
    debug!(path = %path.display(), value, "Wrote DB12 result");
    Ok(())
}
