//! # bmksuite core
//!
//! Benchmark orchestration library: runs the selected CPU benchmarks one at a
//! time, accounts for failures, collects host hardware and software metadata
//! and writes a single consolidated report.

pub mod benchmark;
pub mod command;
pub mod config;
pub mod error;
pub mod export;
pub mod metadata;
pub mod probe;
pub mod report;
pub mod runners;
pub mod suite;
pub mod transport;

// Re-export commonly used types at the crate root.
pub use benchmark::{Benchmark, BenchmarkFamily};
pub use command::{CommandOutput, CommandRunner, NOT_AVAILABLE, ShellRunner};
pub use config::{ConfigOverrides, RunMode, SuiteConfig, load_config, parse_config};
pub use error::{ConfigError, ExportError, InstallError, Result, SuiteError, TransportError};
pub use metadata::{Extractor, HostMetadata, MetaValue};
pub use probe::{HostProbe, SystemProbe};
pub use report::FinalReport;
pub use runners::{BenchmarkRunners, RunOutcome, SystemRunners};
pub use suite::{BenchmarkSuite, PreflightReport, SuiteState};
