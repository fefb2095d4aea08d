//! Final report: assembly, persistence and the human-readable summary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::benchmark::Benchmark;
use crate::command::{CommandRunner, NOT_AVAILABLE};
use crate::config::{RunMode, SuiteConfig};
use crate::error::Result;
use crate::metadata::{HardwareMetadata, HostMetadata, MetaRecord, MetaValue};

/// Schema version of the report document.
pub const JSON_VERSION: &str = "v2.1";

/// Prefix of environment variables turned into report tags.
pub const TAG_ENV_PREFIX: &str = "BMKSUITE_TAG_";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalReport {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_timestamp")]
    pub timestamp: String,
    #[serde(rename = "_timestamp_end")]
    pub timestamp_end: String,
    pub json_version: String,
    pub host: HostSection,
    pub suite: SuiteSection,
    /// Raw result payload per benchmark id.
    pub profiles: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostSection {
    pub hostname: String,
    pub ip: String,
    pub tags: BTreeMap<String, Value>,
    #[serde(rename = "SW")]
    pub software: MetaRecord,
    #[serde(rename = "HW")]
    pub hardware: HardwareMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuiteSection {
    pub version: String,
    pub flags: SuiteFlags,
    pub benchmark_version: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuiteFlags {
    pub mp_num: usize,
    pub run_mode: RunMode,
}

/// Hostname and address of the machine running the suite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostIdentity {
    pub hostname: String,
    pub ip: String,
}

impl HostIdentity {
    /// Fully qualified hostname, resolved to its first address (IPv4 preferred).
    pub async fn detect(runner: &dyn CommandRunner) -> Self {
        let mut hostname = runner.run("hostname -f").await.stdout;
        if hostname == NOT_AVAILABLE || hostname.is_empty() {
            hostname = runner.run("hostname").await.stdout;
        }

        let ip = if hostname == NOT_AVAILABLE {
            NOT_AVAILABLE.to_string()
        } else {
            match tokio::net::lookup_host((hostname.as_str(), 0)).await {
                Ok(addrs) => {
                    let addrs = addrs.map(|a| a.ip()).collect::<Vec<_>>();
                    addrs
                        .iter()
                        .find(|ip| ip.is_ipv4())
                        .or_else(|| addrs.first())
                        .map(|ip| ip.to_string())
                        .unwrap_or_else(|| NOT_AVAILABLE.to_string())
                }
                Err(e) => {
                    warn!(hostname = %hostname, error = %e, "Could not resolve host address");
                    NOT_AVAILABLE.to_string()
                }
            }
        };
        Self { hostname, ip }
    }
}

/// Merge tags from configuration, `BMKSUITE_TAG_*` variables and the CLI.
///
/// Later sources win. Invalid CLI JSON is logged and ignored.
pub fn merge_tags(
    configured: &BTreeMap<String, String>,
    env: impl IntoIterator<Item = (String, String)>,
    cli_json: Option<&str>,
) -> BTreeMap<String, Value> {
    let mut tags: BTreeMap<String, Value> = configured
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect();

    for (key, value) in env {
        if let Some(name) = key.strip_prefix(TAG_ENV_PREFIX) {
            if !name.is_empty() {
                tags.insert(name.to_lowercase(), Value::String(value));
            }
        }
    }

    if let Some(raw) = cli_json {
        info!(tags = raw, "User specified tags");
        match serde_json::from_str::<serde_json::Map<String, Value>>(raw) {
            Ok(cli) => tags.extend(cli),
            Err(e) => warn!(error = %e, "Not a valid tag JSON object, ignoring CLI tags"),
        }
    }
    tags
}

/// Read every selected benchmark's result file. Missing or unparsable files
/// are logged and left out.
pub fn collect_profiles(rundir: &Path, benchmarks: &[Benchmark]) -> BTreeMap<String, Value> {
    let mut profiles = BTreeMap::new();
    for bench in benchmarks {
        let path = rundir.join(bench.result_path());
        let payload = std::fs::read_to_string(&path)
            .map_err(|e| e.to_string())
            .and_then(|text| serde_json::from_str::<Value>(&text).map_err(|e| e.to_string()));
        match payload {
            Ok(payload) => {
                profiles.insert(bench.id().to_string(), payload);
            }
            Err(e) => warn!(benchmark = %bench, path = %path.display(), error = %e, "Skipping result"),
        }
    }
    profiles
}

/// Everything collected during a run, assembled into the final document.
pub struct ReportInputs {
    pub host: HostIdentity,
    pub metadata: HostMetadata,
    pub tags: BTreeMap<String, Value>,
    pub profiles: BTreeMap<String, Value>,
    pub started: DateTime<Utc>,
    pub ended: DateTime<Utc>,
}

impl FinalReport {
    pub fn assemble(config: &SuiteConfig, inputs: ReportInputs) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: format_timestamp(inputs.started),
            timestamp_end: format_timestamp(inputs.ended),
            json_version: JSON_VERSION.to_string(),
            host: HostSection {
                hostname: inputs.host.hostname,
                ip: inputs.host.ip,
                tags: inputs.tags,
                software: inputs.metadata.software,
                hardware: inputs.metadata.hardware,
            },
            suite: SuiteSection {
                version: env!("CARGO_PKG_VERSION").to_string(),
                flags: SuiteFlags {
                    mp_num: config.global.mp_num_or_cores(),
                    run_mode: config.global.mode,
                },
                benchmark_version: config.benchmark_versions(),
            },
            profiles: inputs.profiles,
        }
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        info!(path = %path.display(), "Report written");
        Ok(())
    }

    pub fn read(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Human-readable summary, one line per profile after a short header.
    pub fn summary_lines(&self) -> Vec<String> {
        let cpu_model = self
            .host
            .hardware
            .cpu
            .get("CPU_Model")
            .map(MetaValue::to_string)
            .unwrap_or_else(|| NOT_AVAILABLE.to_string());

        let rule = "=".repeat(57);
        let mut lines = vec![
            rule.clone(),
            format!("BENCHMARK RESULTS FOR {}", self.host.hostname),
            rule,
            format!("Suite start: {}", self.timestamp),
            format!("Suite end:   {}", self.timestamp_end),
            format!("Machine CPU Model: {cpu_model}"),
        ];

        for (key, payload) in &self.profiles {
            let line = key
                .parse::<Benchmark>()
                .ok()
                .and_then(|bench| profile_line(bench, payload));
            match line {
                Some(line) => lines.push(line),
                None => {
                    debug!(profile = %key, "No formatted summary for profile");
                    lines.push(format!("{key} : {payload}"));
                }
            }
        }
        lines
    }

    pub fn print_summary(&self) {
        println!();
        for line in self.summary_lines() {
            println!("{line}");
        }
    }
}

fn score_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn profile_line(bench: Benchmark, payload: &Value) -> Option<String> {
    match bench {
        Benchmark::Db12 => {
            let db12 = payload.get("DB12").unwrap_or(payload);
            let value = db12.get("value")?.as_f64()?;
            let unit = db12
                .get("unit")
                .and_then(Value::as_str)
                .unwrap_or("est. HS06");
            Some(format!("DIRAC Benchmark = {value:.3} ({unit})"))
        }
        Benchmark::Hs06 => Some(format!("HS06 Benchmark = {}", score_text(payload.get("score")?))),
        Benchmark::Hs0632 => Some(format!(
            "HS06 32 bit Benchmark = {}",
            score_text(payload.get("score")?)
        )),
        Benchmark::Hs0664 => Some(format!(
            "HS06 64 bit Benchmark = {}",
            score_text(payload.get("score")?)
        )),
        Benchmark::Spec2017 => Some(format!(
            "SPEC2017 64 bit Benchmark = {}",
            score_text(payload.get("score")?)
        )),
        Benchmark::Hepscore => {
            let score = payload
                .pointer("/report/score")
                .or_else(|| payload.get("score"))?
                .as_f64()?;
            let workloads = payload
                .get("benchmarks")
                .and_then(Value::as_object)
                .map(|b| b.keys().cloned().collect::<Vec<_>>().join(", "))
                .unwrap_or_default();
            Some(format!(
                "HEPSCORE Benchmark = {score:.2} over benchmarks [{workloads}]"
            ))
        }
    }
}
