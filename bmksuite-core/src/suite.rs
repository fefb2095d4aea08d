//! The benchmark suite orchestrator.
//!
//! A run moves through `Pending -> Preflight -> Running -> Cleanup` and ends
//! in `Done` or `Failed`. Benchmarks run strictly one after another; a failing
//! benchmark is recorded and the queue keeps draining.

use chrono::Utc;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::benchmark::Benchmark;
use crate::command::CommandRunner;
use crate::config::SuiteConfig;
use crate::error::{Result, SuiteError};
use crate::metadata::Extractor;
use crate::probe::HostProbe;
use crate::report::{FinalReport, HostIdentity, ReportInputs, collect_profiles, merge_tags};
use crate::runners::{BenchmarkRunners, RunOutcome};

/// Minimum free space in the run directory for disk-bound benchmarks.
pub const DISK_THRESHOLD_BYTES: u64 = 20 * 1024 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuiteState {
    Pending,
    Preflight,
    Running,
    Cleanup,
    Done,
    Failed,
}

impl std::fmt::Display for SuiteState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SuiteState::Pending => write!(f, "pending"),
            SuiteState::Preflight => write!(f, "preflight"),
            SuiteState::Running => write!(f, "running"),
            SuiteState::Cleanup => write!(f, "cleanup"),
            SuiteState::Done => write!(f, "done"),
            SuiteState::Failed => write!(f, "failed"),
        }
    }
}

/// Outcome of the pre-flight checks. Every check runs; each failure is one entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreflightReport {
    pub failures: Vec<String>,
}

impl PreflightReport {
    pub fn passed(&self) -> bool {
        self.failures.is_empty()
    }

    fn fail(&mut self, message: String) {
        error!(check = %message, "Pre-flight check failed");
        self.failures.push(message);
    }
}

pub struct BenchmarkSuite {
    config: SuiteConfig,
    runners: Arc<dyn BenchmarkRunners>,
    probe: Arc<dyn HostProbe>,
    commands: Arc<dyn CommandRunner>,
    cli_tags: Option<String>,
    state: SuiteState,
    selected: Vec<Benchmark>,
    queue: VecDeque<Benchmark>,
    executed: Vec<Benchmark>,
    failures: Vec<Benchmark>,
    report: Option<FinalReport>,
}

impl BenchmarkSuite {
    pub fn new(
        config: SuiteConfig,
        runners: Arc<dyn BenchmarkRunners>,
        probe: Arc<dyn HostProbe>,
        commands: Arc<dyn CommandRunner>,
    ) -> Self {
        let mut selected: Vec<Benchmark> = Vec::with_capacity(config.global.benchmarks.len());
        for bench in &config.global.benchmarks {
            if selected.contains(bench) {
                warn!(benchmark = %bench, "Benchmark selected twice, running it once");
            } else {
                selected.push(*bench);
            }
        }

        Self {
            queue: selected.iter().copied().collect(),
            selected,
            config,
            runners,
            probe,
            commands,
            cli_tags: None,
            state: SuiteState::Pending,
            executed: Vec::new(),
            failures: Vec::new(),
            report: None,
        }
    }

    /// Tags given on the command line as a JSON object.
    pub fn with_cli_tags(mut self, tags: Option<String>) -> Self {
        self.cli_tags = tags;
        self
    }

    pub fn state(&self) -> SuiteState {
        self.state
    }

    pub fn selected(&self) -> &[Benchmark] {
        &self.selected
    }

    /// Benchmarks in the order they were executed.
    pub fn executed(&self) -> &[Benchmark] {
        &self.executed
    }

    pub fn failures(&self) -> &[Benchmark] {
        &self.failures
    }

    /// The report, once cleanup has written it.
    pub fn report(&self) -> Option<&FinalReport> {
        self.report.as_ref()
    }

    /// Run every environment check and collect all failures.
    pub fn preflight(&mut self) -> PreflightReport {
        self.state = SuiteState::Preflight;
        info!("Running pre-flight checks");
        let mut report = PreflightReport::default();

        if self.selected.is_empty() {
            report.fail("no benchmarks selected".to_string());
        }

        if self.selected.iter().any(Benchmark::requires_container) {
            let executable = self.config.global.mode.executable();
            if self.probe.executable_exists(executable) {
                info!(executable, "Run mode executable found");
            } else {
                report.fail(format!("{executable} is not installed in the system"));
            }
        }

        for bench in &self.selected {
            if let Err(e) = self.config.validate_benchmark(*bench) {
                report.fail(e.to_string());
            }
        }

        let rundir = &self.config.global.rundir;
        let dirs = std::iter::once(rundir.clone()).chain(
            self.selected
                .iter()
                .filter_map(Benchmark::work_dir)
                .map(|dir| rundir.join(dir)),
        );
        for dir in dirs {
            if let Err(e) = std::fs::create_dir_all(&dir) {
                report.fail(format!("cannot create directory {}: {e}", dir.display()));
            }
        }

        if self.selected.iter().any(Benchmark::requires_disk) {
            match self.probe.free_disk_bytes(rundir) {
                Ok(free) if free >= DISK_THRESHOLD_BYTES => {
                    info!(free_bytes = free, "Enough disk space available");
                }
                Ok(free) => report.fail(format!(
                    "not enough disk space in {}: {:.1} GiB free, {} GiB required",
                    rundir.display(),
                    free as f64 / (1024.0 * 1024.0 * 1024.0),
                    DISK_THRESHOLD_BYTES / (1024 * 1024 * 1024)
                )),
                Err(e) => report.fail(format!(
                    "cannot determine free disk space in {}: {e}",
                    rundir.display()
                )),
            }
        } else {
            info!("No selected benchmark requires disk, skipping disk space check");
        }

        report
    }

    /// Pre-flight, run the queue, then clean up.
    ///
    /// The report is written even when benchmarks fail; the error carries the
    /// aggregate outcome.
    pub async fn start(&mut self) -> Result<()> {
        if self.state != SuiteState::Pending {
            warn!(state = %self.state, "Suite already started");
            return Ok(());
        }
        info!("Starting benchmark suite");
        let started = Utc::now();

        let preflight = self.preflight();
        if !preflight.passed() {
            self.state = SuiteState::Failed;
            return Err(SuiteError::Preflight {
                failed_checks: preflight.failures,
            });
        }

        self.state = SuiteState::Running;
        while let Some(bench) = self.queue.pop_front() {
            info!(
                benchmark = %bench,
                remaining = ?self.queue,
                "Running benchmark"
            );
            let outcome = self.runners.run(bench, &self.config).await;
            self.record(bench, &outcome);
        }

        self.cleanup(started).await
    }

    fn record(&mut self, bench: Benchmark, outcome: &RunOutcome) {
        self.executed.push(bench);
        if outcome.is_failure() {
            error!(benchmark = %bench, outcome = %outcome, "Benchmark failed");
            self.failures.push(bench);
        } else {
            info!(benchmark = %bench, outcome = %outcome, "Benchmark completed");
        }
    }

    async fn cleanup(&mut self, started: chrono::DateTime<Utc>) -> Result<()> {
        self.state = SuiteState::Cleanup;
        info!("Collecting results");

        let extractor = Extractor::new(self.commands.clone(), self.probe.as_ref());
        let metadata = extractor.collect().await;
        let host = HostIdentity::detect(self.commands.as_ref()).await;
        let tags = merge_tags(
            &self.config.global.tags,
            std::env::vars(),
            self.cli_tags.as_deref(),
        );
        let profiles = collect_profiles(&self.config.global.rundir, &self.selected);

        let report = FinalReport::assemble(
            &self.config,
            ReportInputs {
                host,
                metadata,
                tags,
                profiles,
                started,
                ended: Utc::now(),
            },
        );
        let written = report.write(&self.config.global.report_path());
        self.report = Some(report);
        if let Err(e) = written {
            self.state = SuiteState::Failed;
            return Err(e);
        }

        let failed = self
            .failures
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>();
        if failed.is_empty() {
            self.state = SuiteState::Done;
            info!("Successfully completed all requested benchmarks");
            Ok(())
        } else if self.failures.len() == self.selected.len() {
            self.state = SuiteState::Failed;
            Err(SuiteError::BenchmarkFullFailure { failed })
        } else {
            self.state = SuiteState::Failed;
            Err(SuiteError::BenchmarkFailure { failed })
        }
    }
}
