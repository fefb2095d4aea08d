//! Catalogue of supported benchmarks and their static capabilities.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A benchmark the suite knows how to run.
///
/// Every per-benchmark decision (config section, result location, disk and
/// container requirements) is answered here through exhaustive matches so a
/// new benchmark cannot be added without deciding each of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Benchmark {
    /// CPU normalization micro-benchmark, run in-process.
    Db12,
    /// HEP-SPEC06, both 32 and 64 bit builds.
    Hs06,
    #[serde(rename = "hs06_32")]
    Hs0632,
    #[serde(rename = "hs06_64")]
    Hs0664,
    /// SPEC CPU2017 run through the hep-spec harness.
    Spec2017,
    /// Delegated scorer.
    Hepscore,
}

/// The family a benchmark belongs to; decides which runner executes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BenchmarkFamily {
    Normalization,
    HepSpec,
    Scorer,
}

impl Benchmark {
    pub const ALL: [Benchmark; 6] = [
        Benchmark::Db12,
        Benchmark::Hs06,
        Benchmark::Hs0632,
        Benchmark::Hs0664,
        Benchmark::Spec2017,
        Benchmark::Hepscore,
    ];

    /// The identifier used in configuration files and in the report.
    pub fn id(&self) -> &'static str {
        match self {
            Benchmark::Db12 => "db12",
            Benchmark::Hs06 => "hs06",
            Benchmark::Hs0632 => "hs06_32",
            Benchmark::Hs0664 => "hs06_64",
            Benchmark::Spec2017 => "spec2017",
            Benchmark::Hepscore => "hepscore",
        }
    }

    pub fn family(&self) -> BenchmarkFamily {
        match self {
            Benchmark::Db12 => BenchmarkFamily::Normalization,
            Benchmark::Hs06 | Benchmark::Hs0632 | Benchmark::Hs0664 | Benchmark::Spec2017 => {
                BenchmarkFamily::HepSpec
            }
            Benchmark::Hepscore => BenchmarkFamily::Scorer,
        }
    }

    /// Name of the configuration section this benchmark reads, if any.
    pub fn config_section(&self) -> Option<&'static str> {
        match self {
            Benchmark::Db12 => None,
            Benchmark::Hs06 | Benchmark::Hs0632 | Benchmark::Hs0664 => Some("hepspec06"),
            Benchmark::Spec2017 => Some("spec2017"),
            Benchmark::Hepscore => Some("hepscore"),
        }
    }

    /// Result file location relative to the run directory.
    pub fn result_path(&self) -> PathBuf {
        match self {
            Benchmark::Db12 => PathBuf::from("db12_result.json"),
            Benchmark::Hs06 | Benchmark::Hs0632 | Benchmark::Hs0664 => {
                PathBuf::from("HS06").join(format!("{}_result.json", self.id()))
            }
            Benchmark::Spec2017 => PathBuf::from("SPEC2017").join("spec2017_result.json"),
            Benchmark::Hepscore => PathBuf::from("HEPSCORE").join("hepscore_result.json"),
        }
    }

    /// Subdirectory of the run directory that must exist before the run.
    pub fn work_dir(&self) -> Option<&'static str> {
        match self {
            Benchmark::Db12 => None,
            Benchmark::Hs06 | Benchmark::Hs0632 | Benchmark::Hs0664 => Some("HS06"),
            Benchmark::Spec2017 => Some("SPEC2017"),
            Benchmark::Hepscore => Some("HEPSCORE"),
        }
    }

    /// Whether the benchmark needs the free disk space threshold.
    pub fn requires_disk(&self) -> bool {
        !matches!(self, Benchmark::Db12)
    }

    /// Whether the benchmark is executed through the container run mode.
    pub fn requires_container(&self) -> bool {
        !matches!(self, Benchmark::Db12)
    }
}

impl std::fmt::Display for Benchmark {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id())
    }
}

impl std::str::FromStr for Benchmark {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Benchmark::ALL
            .iter()
            .copied()
            .find(|b| b.id() == s)
            .ok_or_else(|| format!("Unknown benchmark: {s}"))
    }
}
