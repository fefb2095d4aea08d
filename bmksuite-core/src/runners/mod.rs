//! Per-benchmark runners.
//!
//! Each benchmark family has its own runner and its own notion of success,
//! captured by [`RunOutcome`]. The orchestrator only sees the
//! [`BenchmarkRunners`] trait.

pub mod db12;
pub mod hepscore;
pub mod hepspec;

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{error, info};

use crate::benchmark::{Benchmark, BenchmarkFamily};
use crate::command::CommandRunner;
use crate::config::SuiteConfig;

pub use db12::{Db12Options, Db12Unit};
pub use hepscore::{PythonScorer, Scorer, ScorerError};

/// What a runner reports back, one variant per benchmark family.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// Mean normalization score; `failed_workers` counts dead calibration workers.
    Normalization { value: f64, failed_workers: usize },
    /// Exit code of the hep-spec harness.
    HepSpec { exit_code: i32 },
    /// Return value of the delegated scorer.
    Scorer { return_code: i32 },
    /// The benchmark could not be set up (e.g. scorer install failure).
    PreparationFailed { reason: String },
}

impl RunOutcome {
    /// Family-specific failure predicate.
    pub fn is_failure(&self) -> bool {
        match self {
            RunOutcome::Normalization {
                value,
                failed_workers,
            } => *failed_workers > 0 || *value == 0.0 || !value.is_finite(),
            RunOutcome::HepSpec { exit_code } => *exit_code > 0,
            RunOutcome::Scorer { return_code } => *return_code <= 0,
            RunOutcome::PreparationFailed { .. } => true,
        }
    }
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunOutcome::Normalization {
                value,
                failed_workers,
            } => write!(f, "value {value:.3} ({failed_workers} failed workers)"),
            RunOutcome::HepSpec { exit_code } => write!(f, "exit code {exit_code}"),
            RunOutcome::Scorer { return_code } => write!(f, "return code {return_code}"),
            RunOutcome::PreparationFailed { reason } => write!(f, "preparation failed: {reason}"),
        }
    }
}

/// Dispatches a benchmark to its runner.
#[async_trait]
pub trait BenchmarkRunners: Send + Sync {
    async fn run(&self, bench: Benchmark, config: &SuiteConfig) -> RunOutcome;
}

/// Runners backed by real processes.
pub struct SystemRunners {
    commands: Arc<dyn CommandRunner>,
    scorer: Arc<dyn Scorer>,
}

impl SystemRunners {
    pub fn new(commands: Arc<dyn CommandRunner>, scorer: Arc<dyn Scorer>) -> Self {
        Self { commands, scorer }
    }

    /// Runners with the python-backed scorer sharing the same command runner.
    pub fn with_python_scorer(commands: Arc<dyn CommandRunner>) -> Self {
        let scorer = Arc::new(PythonScorer::new(commands.clone()));
        Self::new(commands, scorer)
    }

    async fn run_db12(&self, config: &SuiteConfig) -> RunOutcome {
        let options = Db12Options::from_config(config);
        let outcome = db12::run_workers(&options).await;
        let value = outcome.value();

        if outcome.failed_workers == 0 && value.is_finite() && value > 0.0 {
            let path = config.global.rundir.join(Benchmark::Db12.result_path());
            if let Err(e) = db12::write_result(&path, value, options.unit) {
                error!(path = %path.display(), error = %e, "Failed to write DB12 result");
            }
            info!(value, "DB12 finished");
        }

        RunOutcome::Normalization {
            value,
            failed_workers: outcome.failed_workers,
        }
    }
}

#[async_trait]
impl BenchmarkRunners for SystemRunners {
    async fn run(&self, bench: Benchmark, config: &SuiteConfig) -> RunOutcome {
        match bench.family() {
            BenchmarkFamily::Normalization => self.run_db12(config).await,
            BenchmarkFamily::HepSpec => RunOutcome::HepSpec {
                exit_code: hepspec::run_hepspec(self.commands.as_ref(), config, bench).await,
            },
            BenchmarkFamily::Scorer => {
                hepscore::run_hepscore(self.commands.as_ref(), self.scorer.as_ref(), config).await
            }
        }
    }
}
