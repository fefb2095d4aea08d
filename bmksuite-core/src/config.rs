//! Configuration system for the benchmark suite.
//!
//! Uses `figment` for layered configuration: defaults -> YAML file ->
//! environment (`BMKSUITE_` prefix, `__` as section separator) -> CLI overrides.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Yaml},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::benchmark::{Benchmark, BenchmarkFamily};
use crate::error::ConfigError;

/// Container technology used to execute delegated benchmark images.
///
/// Commands are composed as shell strings, so the set is closed: anything
/// else is rejected when the configuration is loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Docker,
    #[default]
    Singularity,
}

impl RunMode {
    /// Name of the executable that must be present for this mode.
    pub fn executable(&self) -> &'static str {
        match self {
            RunMode::Docker => "docker",
            RunMode::Singularity => "singularity",
        }
    }
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.executable())
    }
}

impl std::str::FromStr for RunMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "docker" => Ok(RunMode::Docker),
            "singularity" => Ok(RunMode::Singularity),
            other => Err(format!(
                "Unsupported run mode '{other}', expected docker or singularity"
            )),
        }
    }
}

/// Top-level suite configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SuiteConfig {
    pub global: GlobalConfig,
    #[serde(default)]
    pub db12: Db12Config,
    /// Section shared by the hs06 family.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hepspec06: Option<HepSpecConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec2017: Option<HepSpecConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hepscore: Option<HepscoreConfig>,
    /// Message queue used by `publish`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activemq: Option<ActiveMqConfig>,
}

/// The `global` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalConfig {
    /// Benchmarks to run, in order.
    #[serde(default)]
    pub benchmarks: Vec<Benchmark>,
    #[serde(default)]
    pub mode: RunMode,
    /// Root directory for every benchmark's working files and results.
    pub rundir: PathBuf,
    /// Directory holding the singularity cache. Defaults to the parent of `rundir`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_dir: Option<PathBuf>,
    /// Number of concurrent copies each benchmark runs. Defaults to all cores.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mp_num: Option<usize>,
    /// Report filename, written inside `rundir`.
    #[serde(default = "default_report_file")]
    pub file: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    /// Publish the report to the message queue when the run completes.
    #[serde(default)]
    pub publish: bool,
    /// Archive result and log files when the run completes.
    #[serde(default)]
    pub export: bool,
}

fn default_report_file() -> String {
    "bmkrun_report.json".to_string()
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            benchmarks: Vec::new(),
            mode: RunMode::default(),
            rundir: std::env::temp_dir().join("bmksuite_results"),
            parent_dir: None,
            mp_num: None,
            file: default_report_file(),
            tags: BTreeMap::new(),
            publish: false,
            export: false,
        }
    }
}

impl GlobalConfig {
    pub fn parent_dir(&self) -> PathBuf {
        self.parent_dir.clone().unwrap_or_else(|| {
            self.rundir
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."))
        })
    }

    /// Number of workers to use, falling back to the available cores.
    pub fn mp_num_or_cores(&self) -> usize {
        self.mp_num.filter(|n| *n > 0).unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }

    pub fn report_path(&self) -> PathBuf {
        self.rundir.join(&self.file)
    }
}

/// Section for the CPU normalization benchmark. Every key is optional.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Db12Config {
    /// Timed calibration iterations, clamped to 1..=10 at run time.
    #[serde(default = "default_db12_iterations")]
    pub iterations: u32,
    /// Reference unit, `HS06` or `SI00`.
    #[serde(default = "default_db12_unit")]
    pub unit: String,
}

fn default_db12_iterations() -> u32 {
    1
}

fn default_db12_unit() -> String {
    "HS06".to_string()
}

impl Default for Db12Config {
    fn default() -> Self {
        Self {
            iterations: default_db12_iterations(),
            unit: default_db12_unit(),
        }
    }
}

/// Section for the hep-spec harness (`hepspec06`, `spec2017`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HepSpecConfig {
    /// Container image. Must start with `docker://` in docker mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Host path holding the SPEC installation, shared into the container.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hepspec_volume: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iterations: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bmk_set: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_tarball: Option<String>,
    /// Keys the harness does not understand; logged and skipped at run time.
    #[serde(flatten, default)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl HepSpecConfig {
    pub const REQUIRED: [&'static str; 2] = ["image", "hepspec_volume"];

    fn missing_fields(&self) -> Vec<String> {
        let mut missing = Vec::new();
        if self.image.as_deref().is_none_or(str::is_empty) {
            missing.push("image".to_string());
        }
        if self.hepspec_volume.as_deref().is_none_or(str::is_empty) {
            missing.push("hepspec_volume".to_string());
        }
        missing
    }

    /// Image tag, used as the benchmark version. Only a `:` after the last
    /// `/` starts a tag, so scheme and registry port colons are skipped.
    pub fn image_tag(&self) -> Option<&str> {
        let (_, tag) = self.image.as_deref()?.rsplit_once(':')?;
        (!tag.is_empty() && !tag.contains('/')).then_some(tag)
    }
}

/// Section for the delegated scorer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HepscoreConfig {
    /// Exact package version to install (e.g. `v1.5`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// `default`, an http(s) URL, or a local path.
    #[serde(default = "default_scorer_config")]
    pub config: String,
    /// Replaces `hepscore_benchmark.options` in the loaded scorer config.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<serde_json::Value>,
}

fn default_scorer_config() -> String {
    "default".to_string()
}

impl Default for HepscoreConfig {
    fn default() -> Self {
        Self {
            version: None,
            config: default_scorer_config(),
            options: None,
        }
    }
}

/// Connection details for the report message queue.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActiveMqConfig {
    pub server: String,
    pub port: u16,
    pub topic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Client private key (PEM, PKCS#8) for certificate authentication.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<PathBuf>,
    /// Client certificate (PEM) for certificate authentication.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert: Option<PathBuf>,
}

/// Values passed on the command line, applied last.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub benchmarks: Option<Vec<Benchmark>>,
    pub rundir: Option<PathBuf>,
    pub mode: Option<RunMode>,
    pub mp_num: Option<usize>,
    pub publish: Option<bool>,
    pub export: Option<bool>,
}

impl ConfigOverrides {
    fn to_layer(&self) -> serde_json::Value {
        let mut global = serde_json::Map::new();
        if let Some(benchmarks) = &self.benchmarks {
            global.insert("benchmarks".into(), serde_json::json!(benchmarks));
        }
        if let Some(rundir) = &self.rundir {
            global.insert("rundir".into(), serde_json::json!(rundir));
        }
        if let Some(mode) = &self.mode {
            global.insert("mode".into(), serde_json::json!(mode));
        }
        if let Some(mp_num) = self.mp_num {
            global.insert("mp_num".into(), serde_json::json!(mp_num));
        }
        if let Some(publish) = self.publish {
            global.insert("publish".into(), serde_json::json!(publish));
        }
        if let Some(export) = self.export {
            global.insert("export".into(), serde_json::json!(export));
        }
        serde_json::json!({ "global": global })
    }
}

impl SuiteConfig {
    /// Section used by a hep-spec family benchmark.
    pub fn hepspec_section(&self, bench: Benchmark) -> Option<&HepSpecConfig> {
        match bench.config_section() {
            Some("hepspec06") => self.hepspec06.as_ref(),
            Some("spec2017") => self.spec2017.as_ref(),
            _ => None,
        }
    }

    /// Check that a selected benchmark has every key it needs.
    pub fn validate_benchmark(&self, bench: Benchmark) -> Result<(), ConfigError> {
        let Some(section) = bench.config_section() else {
            return Ok(());
        };
        let missing_section = || ConfigError::MissingSection {
            benchmark: bench.to_string(),
            section: section.to_string(),
        };

        let missing = match bench {
            Benchmark::Db12 => Vec::new(),
            Benchmark::Hs06
            | Benchmark::Hs0632
            | Benchmark::Hs0664
            | Benchmark::Spec2017 => self
                .hepspec_section(bench)
                .ok_or_else(missing_section)?
                .missing_fields(),
            Benchmark::Hepscore => {
                let scorer = self.hepscore.as_ref().ok_or_else(missing_section)?;
                let mut missing = Vec::new();
                if scorer.version.as_deref().is_none_or(str::is_empty) {
                    missing.push("version".to_string());
                }
                if scorer.config.is_empty() {
                    missing.push("config".to_string());
                }
                missing
            }
        };

        if missing.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::MissingFields {
                benchmark: bench.to_string(),
                fields: missing,
            })
        }
    }

    /// Version string reported for each selected benchmark.
    pub fn benchmark_versions(&self) -> BTreeMap<String, String> {
        self.global
            .benchmarks
            .iter()
            .map(|bench| {
                let version = match bench.family() {
                    BenchmarkFamily::Normalization => Some("v0.1".to_string()),
                    BenchmarkFamily::HepSpec => self
                        .hepspec_section(*bench)
                        .and_then(HepSpecConfig::image_tag)
                        .map(str::to_string),
                    BenchmarkFamily::Scorer => {
                        self.hepscore.as_ref().and_then(|h| h.version.clone())
                    }
                };
                let version = version.unwrap_or_else(|| {
                    tracing::warn!(benchmark = %bench, "No version found for benchmark");
                    crate::command::NOT_AVAILABLE.to_string()
                });
                (bench.to_string(), version)
            })
            .collect()
    }
}

/// Load configuration from the given YAML file with environment and CLI layers.
pub fn load_config(
    path: Option<&Path>,
    overrides: Option<&ConfigOverrides>,
) -> Result<SuiteConfig, ConfigError> {
    let mut figment = Figment::from(Serialized::defaults(SuiteConfig::default()));

    if let Some(path) = path {
        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        figment = figment.merge(Yaml::file(path));
    }

    figment = figment.merge(Env::prefixed("BMKSUITE_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides.to_layer()));
    }

    figment.extract().map_err(|e| ConfigError::ParseError {
        message: e.to_string(),
    })
}

/// Parse a configuration directly from a YAML string, without env layers.
pub fn parse_config(yaml: &str) -> Result<SuiteConfig, ConfigError> {
    Figment::from(Serialized::defaults(SuiteConfig::default()))
        .merge(Yaml::string(yaml))
        .extract()
        .map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
global:
  benchmarks: [db12, hs06, spec2017, hepscore]
  mode: singularity
  rundir: /tmp/hep-spec_wd3
  parent_dir: "."
  mp_num: 4
  tags:
    site: CERN
hepspec06:
  image: docker://gitlab-registry.cern.ch/hep-benchmarks/hep-spec/hepspec-cc7:v1.0
  hepspec_volume: /tmp/SPEC
  iterations: 1
  bmk_set: 453.povray
spec2017:
  image: docker://gitlab-registry.cern.ch/hep-benchmarks/hep-spec/hepspec-cc7:v1.0
  hepspec_volume: /tmp/SPEC
hepscore:
  version: v1.5
  config: default
"#;

    #[test]
    fn test_parse_sample_config() {
        let config = parse_config(SAMPLE).unwrap();
        assert_eq!(
            config.global.benchmarks,
            vec![
                Benchmark::Db12,
                Benchmark::Hs06,
                Benchmark::Spec2017,
                Benchmark::Hepscore
            ]
        );
        assert_eq!(config.global.mode, RunMode::Singularity);
        assert_eq!(config.global.mp_num, Some(4));
        assert_eq!(config.global.file, "bmkrun_report.json");
        assert_eq!(config.global.tags.get("site").map(String::as_str), Some("CERN"));
        let hs06 = config.hepspec06.as_ref().unwrap();
        assert_eq!(hs06.iterations, Some(1));
        assert_eq!(hs06.image_tag(), Some("v1.0"));
        assert_eq!(config.db12.iterations, 1);
        assert_eq!(config.db12.unit, "HS06");
    }

    #[test]
    fn test_unknown_run_mode_rejected() {
        let yaml = "global:\n  mode: podman\n  rundir: /tmp/x\n";
        let err = parse_config(yaml).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    #[test]
    fn test_unknown_benchmark_rejected() {
        let yaml = "global:\n  benchmarks: [db12, hs99]\n  rundir: /tmp/x\n";
        assert!(parse_config(yaml).is_err());
    }

    #[test]
    fn test_shipped_sample_is_valid() {
        let config = parse_config(include_str!("../../config/bmksuite.yml")).unwrap();
        for bench in &config.global.benchmarks {
            config.validate_benchmark(*bench).unwrap();
        }
        assert!(config.global.export);
        assert_eq!(config.activemq.as_ref().map(|mq| mq.port), Some(61123));
    }

    #[test]
    fn test_validate_missing_image() {
        let mut config = parse_config(SAMPLE).unwrap();
        config.spec2017.as_mut().unwrap().image = None;

        let err = config.validate_benchmark(Benchmark::Spec2017).unwrap_err();
        match err {
            ConfigError::MissingFields { benchmark, fields } => {
                assert_eq!(benchmark, "spec2017");
                assert_eq!(fields, vec!["image".to_string()]);
            }
            other => panic!("Expected MissingFields, got: {other:?}"),
        }
        // The other benchmarks stay valid
        assert!(config.validate_benchmark(Benchmark::Hs06).is_ok());
        assert!(config.validate_benchmark(Benchmark::Db12).is_ok());
    }

    #[test]
    fn test_validate_missing_section() {
        let mut config = parse_config(SAMPLE).unwrap();
        config.hepscore = None;
        assert!(matches!(
            config.validate_benchmark(Benchmark::Hepscore),
            Err(ConfigError::MissingSection { .. })
        ));
    }

    #[test]
    fn test_extra_keys_are_preserved() {
        let yaml = "global:\n  rundir: /tmp/x\nspec2017:\n  image: docker://a:b\n  hepspec_volume: /s\n  flavour: extra\n";
        let config = parse_config(yaml).unwrap();
        let spec = config.spec2017.unwrap();
        assert!(spec.extra.contains_key("flavour"));
    }

    #[test]
    fn test_benchmark_versions() {
        let config = parse_config(SAMPLE).unwrap();
        let versions = config.benchmark_versions();
        assert_eq!(versions["db12"], "v0.1");
        assert_eq!(versions["hs06"], "v1.0");
        assert_eq!(versions["spec2017"], "v1.0");
        assert_eq!(versions["hepscore"], "v1.5");
    }

    #[test]
    fn test_untagged_images_have_no_version() {
        let tag_of = |image: &str| {
            HepSpecConfig {
                image: Some(image.to_string()),
                ..Default::default()
            }
            .image_tag()
            .map(str::to_string)
        };
        assert_eq!(tag_of("docker://registry.cern.ch/hep-spec:v2.1").as_deref(), Some("v2.1"));
        assert_eq!(tag_of("docker://registry.cern.ch/hep-spec"), None);
        assert_eq!(tag_of("registry.cern.ch:5000/hep-spec"), None);
        assert_eq!(tag_of("registry.cern.ch:5000/hep-spec:v3").as_deref(), Some("v3"));
        assert_eq!(tag_of("hep-spec:"), None);

        let mut config = parse_config(SAMPLE).unwrap();
        config.spec2017.as_mut().unwrap().image = Some("docker://registry.cern.ch/hep-spec".into());
        assert_eq!(config.benchmark_versions()["spec2017"], crate::command::NOT_AVAILABLE);
    }

    #[test]
    fn test_parent_dir_defaults_to_rundir_parent() {
        let global = GlobalConfig {
            rundir: PathBuf::from("/scratch/runs/today"),
            ..GlobalConfig::default()
        };
        assert_eq!(global.parent_dir(), PathBuf::from("/scratch/runs"));
    }

    #[test]
    fn test_load_config_with_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let overrides = ConfigOverrides {
            benchmarks: Some(vec![Benchmark::Db12]),
            mode: Some(RunMode::Docker),
            ..Default::default()
        };
        let config = load_config(Some(file.path()), Some(&overrides)).unwrap();
        assert_eq!(config.global.benchmarks, vec![Benchmark::Db12]);
        assert_eq!(config.global.mode, RunMode::Docker);
        assert_eq!(config.global.mp_num, Some(4));
    }

    #[test]
    fn test_load_config_missing_file() {
        let err = load_config(Some(Path::new("/nonexistent/benchmarks.yml")), None).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }
}
