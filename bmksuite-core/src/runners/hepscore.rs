//! Delegated scorer (hep-score): installation, configuration and execution.
//!
//! The scorer is a python package. This module makes sure the configured
//! version is installed, resolves and patches its configuration document, and
//! drives it through the [`Scorer`] trait.

use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

use crate::benchmark::Benchmark;
use crate::command::CommandRunner;
use crate::config::{RunMode, SuiteConfig};
use crate::error::InstallError;
use crate::metadata::find_label;

use super::RunOutcome;

pub const HEPSCORE_PACKAGE: &str = "hep-score";
pub const HEPSCORE_REPO: &str = "git+https://gitlab.cern.ch/hep-benchmarks/hep-score.git";

/// Errors raised while resolving or driving the scorer.
#[derive(Debug, thiserror::Error)]
pub enum ScorerError {
    #[error("Scorer configuration error: {message}")]
    Config { message: String },

    #[error("Failed to download scorer configuration: {0}")]
    Download(#[from] reqwest::Error),

    #[error("Invalid scorer configuration document: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Scorer bridge failed: {message}")]
    Bridge { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// The scorer API the suite depends on.
#[async_trait]
pub trait Scorer: Send + Sync {
    /// The configuration document shipped with the scorer, as YAML text.
    async fn default_config(&self) -> Result<String, ScorerError>;

    /// Run every workload. Negative values signal failure.
    async fn run(&self, config: &Value, results_dir: &Path) -> i32;

    /// Compute the final score from the last run.
    async fn gen_score(&self) -> Result<(), ScorerError>;

    /// Write the JSON result document of the last run to `path`.
    async fn write_output(&self, path: &Path) -> Result<(), ScorerError>;
}

/// Where the scorer configuration document comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    Packaged,
    Remote(String),
    Local(PathBuf),
}

impl ConfigSource {
    /// `default` wins over a URL, which wins over a local path.
    pub fn from_setting(setting: &str) -> Self {
        if setting == "default" {
            ConfigSource::Packaged
        } else if setting.contains("http") {
            ConfigSource::Remote(setting.to_string())
        } else {
            ConfigSource::Local(PathBuf::from(setting))
        }
    }
}

fn normalize_version(version: &str) -> &str {
    let version = version.trim();
    version.strip_prefix('v').unwrap_or(version)
}

/// Installed scorer version according to pip, if any.
pub async fn installed_version(runner: &dyn CommandRunner) -> Option<String> {
    let output = runner
        .run(&format!("python3 -m pip show {HEPSCORE_PACKAGE}"))
        .await;
    if !output.success() {
        return None;
    }
    find_label(&output.stdout, "Version")
}

/// pip command installing `version` from the scorer repository.
pub fn install_command(version: &str, force: bool, in_virtualenv: bool) -> String {
    let mut command = String::from("python3 -m pip install");
    if !in_virtualenv {
        command.push_str(" --user");
    }
    if force {
        command.push_str(" --force-reinstall");
    }
    command.push_str(&format!(" {HEPSCORE_REPO}@{version}"));
    command
}

fn in_virtualenv() -> bool {
    std::env::var("VIRTUAL_ENV").is_ok_and(|v| !v.is_empty())
}

/// Make sure the requested scorer version is installed.
///
/// At most one install runs; its result is checked exactly once more.
pub async fn prepare(runner: &dyn CommandRunner, requested: &str) -> Result<(), InstallError> {
    info!("Checking if hep-score is installed");
    let mut installed_once = false;

    loop {
        let found = installed_version(runner).await;
        match &found {
            Some(installed) if normalize_version(installed) == normalize_version(requested) => {
                info!(version = %installed, "Installation matches requested version");
                return Ok(());
            }
            Some(installed) if installed_once => {
                return Err(InstallError::VersionMismatch {
                    installed: installed.clone(),
                    requested: requested.to_string(),
                });
            }
            None if installed_once => {
                return Err(InstallError::StillMissing {
                    package: HEPSCORE_PACKAGE.to_string(),
                });
            }
            Some(installed) => {
                warn!(installed = %installed, requested, "Installed hep-score differs, forcing reinstall");
            }
            None => info!("Installation of hep-score not found in the system"),
        }

        let venv = in_virtualenv();
        if venv {
            info!("Virtual environment detected, installing hep-score there");
        }
        let command = install_command(requested, found.is_some(), venv);
        let exit_code = runner.run_streaming(&command).await;
        if exit_code != 0 {
            error!(exit_code, "Failed to install hep-score");
            return Err(InstallError::InstallFailed {
                package: HEPSCORE_PACKAGE.to_string(),
                exit_code,
            });
        }
        info!("Installation of hep-score succeeded");
        installed_once = true;
    }
}

/// Load the scorer configuration document from its source.
pub async fn load_config(
    source: &ConfigSource,
    scorer: &dyn Scorer,
    rundir: &Path,
) -> Result<Value, ScorerError> {
    let text = match source {
        ConfigSource::Packaged => {
            info!("Using default config provided by hep-score");
            scorer.default_config().await?
        }
        ConfigSource::Remote(url) => {
            info!(url = %url, "Loading hep-score config from remote");
            let body = reqwest::get(url).await?.error_for_status()?.bytes().await?;
            let dest = rundir.join("hepscore.yaml");
            tokio::fs::write(&dest, &body).await?;
            debug!(path = %dest.display(), "Saved remote hep-score config");
            String::from_utf8_lossy(&body).into_owned()
        }
        ConfigSource::Local(path) => {
            info!(path = %path.display(), "Loading user provided hep-score config");
            tokio::fs::read_to_string(path)
                .await
                .map_err(|e| ScorerError::Config {
                    message: format!("cannot read {}: {e}", path.display()),
                })?
        }
    };
    Ok(serde_yaml::from_str(&text)?)
}

/// Align the scorer document with the suite: same container runtime and,
/// when given, the suite's workload options.
pub fn apply_suite_settings(
    document: &mut Value,
    mode: RunMode,
    options: Option<&Value>,
) -> Result<(), ScorerError> {
    let benchmark = document
        .get_mut("hepscore_benchmark")
        .and_then(Value::as_object_mut)
        .ok_or_else(|| ScorerError::Config {
            message: "missing hepscore_benchmark section".into(),
        })?;

    let settings = benchmark
        .entry("settings")
        .or_insert_with(|| Value::Object(Default::default()));
    let settings = settings.as_object_mut().ok_or_else(|| ScorerError::Config {
        message: "hepscore_benchmark.settings is not a mapping".into(),
    })?;
    settings.insert("container_exec".into(), Value::String(mode.to_string()));

    if let Some(options) = options {
        benchmark.insert("options".into(), options.clone());
    }
    Ok(())
}

/// Prepare, configure and run the scorer.
pub async fn run_hepscore(
    runner: &dyn CommandRunner,
    scorer: &dyn Scorer,
    config: &SuiteConfig,
) -> RunOutcome {
    let Some(section) = config.hepscore.as_ref() else {
        return RunOutcome::PreparationFailed {
            reason: "hepscore section not found in configuration".into(),
        };
    };
    let Some(version) = section.version.as_deref() else {
        return RunOutcome::PreparationFailed {
            reason: "hepscore version not configured".into(),
        };
    };

    if let Err(e) = prepare(runner, version).await {
        return RunOutcome::PreparationFailed {
            reason: e.to_string(),
        };
    }

    let rundir = &config.global.rundir;
    let source = ConfigSource::from_setting(&section.config);
    let mut document = match load_config(&source, scorer, rundir).await {
        Ok(document) => document,
        Err(e) => {
            error!(error = %e, "Unable to load hep-score config");
            return RunOutcome::Scorer { return_code: -1 };
        }
    };
    if let Err(e) = apply_suite_settings(&mut document, config.global.mode, section.options.as_ref()) {
        error!(error = %e, "Unable to apply suite settings to hep-score config");
        return RunOutcome::Scorer { return_code: -1 };
    }

    let results_dir = rundir.join("HEPSCORE");
    info!("Starting hep-score");
    debug!(config = %document, "hep-score config in use");

    let return_code = scorer.run(&document, &results_dir).await;
    if return_code >= 0 {
        if let Err(e) = scorer.gen_score().await {
            error!(error = %e, "hep-score failed to compute the score");
        }
    }
    let output = rundir.join(Benchmark::Hepscore.result_path());
    if let Err(e) = scorer.write_output(&output).await {
        error!(error = %e, "hep-score failed to write its result");
    }

    RunOutcome::Scorer { return_code }
}

/// Script executed by [`PythonScorer`]. Arguments: config json, results dir,
/// output file, return-code file.
const BRIDGE_SCRIPT: &str = r#"
import json, sys
import hepscore
with open(sys.argv[1]) as f:
    conf = json.load(f)
hs = hepscore.HEPscore(conf, sys.argv[2])
rc = hs.run()
if rc >= 0:
    hs.gen_score()
hs.write_output("json", sys.argv[3])
with open(sys.argv[4], "w") as f:
    f.write(repr(rc))
"#;

const DEFAULT_CONFIG_SCRIPT: &str = "import hepscore, importlib.resources as r; \
print(r.files(hepscore).joinpath('etc/hepscore-default.yaml').read_text())";

/// Map the scorer's numeric return value onto a signed status.
fn scorer_return_code(raw: &str) -> i32 {
    match raw.trim().parse::<f64>() {
        Ok(x) if x.is_finite() && x > 0.0 => x.ceil().min(f64::from(i32::MAX)) as i32,
        Ok(x) if x.is_finite() => x.floor().max(f64::from(i32::MIN)) as i32,
        _ => {
            warn!(raw, "Unreadable hep-score return value");
            -1
        }
    }
}

/// Drives the installed python package in a child interpreter.
///
/// One interpreter does the whole run, so the score and output are staged in
/// the results directory and handed over by `gen_score` and `write_output`.
pub struct PythonScorer {
    runner: std::sync::Arc<dyn CommandRunner>,
    staged: tokio::sync::Mutex<Option<PathBuf>>,
}

impl PythonScorer {
    pub fn new(runner: std::sync::Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            staged: tokio::sync::Mutex::new(None),
        }
    }
}

fn quoted(path: &Path) -> String {
    format!("'{}'", path.display().to_string().replace('\'', r"'\''"))
}

#[async_trait]
impl Scorer for PythonScorer {
    async fn default_config(&self) -> Result<String, ScorerError> {
        let output = self
            .runner
            .run(&format!("python3 -c \"{DEFAULT_CONFIG_SCRIPT}\""))
            .await;
        if output.success() {
            Ok(output.stdout)
        } else {
            Err(ScorerError::Bridge {
                message: "unable to read the packaged default config".into(),
            })
        }
    }

    async fn run(&self, config: &Value, results_dir: &Path) -> i32 {
        let prepare = async {
            tokio::fs::create_dir_all(results_dir).await?;
            let script = results_dir.join("hepscore_bridge.py");
            let conf = results_dir.join("hepscore_conf.json");
            tokio::fs::write(&script, BRIDGE_SCRIPT).await?;
            tokio::fs::write(&conf, serde_json::to_vec_pretty(config).map_err(std::io::Error::other)?)
                .await?;
            Ok::<_, std::io::Error>((script, conf))
        };
        let (script, conf) = match prepare.await {
            Ok(paths) => paths,
            Err(e) => {
                error!(error = %e, "Failed to stage hep-score bridge");
                return -1;
            }
        };

        let staged = results_dir.join("hepscore_staged.json");
        let rc_file = results_dir.join("hepscore_rc");
        let command = format!(
            "python3 {} {} {} {} {}",
            quoted(&script),
            quoted(&conf),
            quoted(results_dir),
            quoted(&staged),
            quoted(&rc_file)
        );

        let exit_code = self.runner.run_streaming(&command).await;
        if exit_code != 0 {
            error!(exit_code, "hep-score bridge exited abnormally");
            return -1;
        }
        *self.staged.lock().await = Some(staged);

        match tokio::fs::read_to_string(&rc_file).await {
            Ok(raw) => scorer_return_code(&raw),
            Err(e) => {
                error!(error = %e, "hep-score did not report a return value");
                -1
            }
        }
    }

    async fn gen_score(&self) -> Result<(), ScorerError> {
        match self.staged.lock().await.as_ref() {
            Some(path) if path.exists() => Ok(()),
            _ => Err(ScorerError::Bridge {
                message: "no scored output staged".into(),
            }),
        }
    }

    async fn write_output(&self, path: &Path) -> Result<(), ScorerError> {
        let staged = self.staged.lock().await.clone().ok_or(ScorerError::Bridge {
            message: "scorer has not run".into(),
        })?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(&staged, path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandOutput;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays canned `pip show` outputs and install exit codes.
    struct PipRunner {
        shows: Mutex<VecDeque<Option<&'static str>>>,
        install_code: i32,
        installs: Mutex<Vec<String>>,
    }

    impl PipRunner {
        fn new(shows: Vec<Option<&'static str>>, install_code: i32) -> Self {
            Self {
                shows: Mutex::new(shows.into()),
                install_code,
                installs: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl CommandRunner for PipRunner {
        async fn run(&self, _command: &str) -> CommandOutput {
            match self.shows.lock().unwrap().pop_front().flatten() {
                Some(version) => CommandOutput {
                    stdout: format!("Name: hep-score\nVersion: {version}\nSummary: x"),
                    exit_code: 0,
                },
                None => CommandOutput {
                    stdout: "not_available".into(),
                    exit_code: 1,
                },
            }
        }

        async fn run_pipeline(&self, _stages: &[Vec<String>]) -> CommandOutput {
            unreachable!()
        }

        async fn run_streaming(&self, command: &str) -> i32 {
            self.installs.lock().unwrap().push(command.to_string());
            self.install_code
        }
    }

    #[tokio::test]
    async fn test_prepare_already_installed() {
        let runner = PipRunner::new(vec![Some("1.5")], 0);
        prepare(&runner, "v1.5").await.unwrap();
        assert!(runner.installs.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_prepare_installs_missing_then_rechecks() {
        let runner = PipRunner::new(vec![None, Some("1.5")], 0);
        prepare(&runner, "v1.5").await.unwrap();
        let installs = runner.installs.lock().unwrap();
        assert_eq!(installs.len(), 1);
        assert!(!installs[0].contains("--force-reinstall"));
        assert!(installs[0].ends_with("hep-score.git@v1.5"));
    }

    #[tokio::test]
    async fn test_prepare_mismatch_forces_reinstall_once() {
        let runner = PipRunner::new(vec![Some("1.4"), Some("1.4")], 0);
        let err = prepare(&runner, "v1.5").await.unwrap_err();
        assert!(matches!(err, InstallError::VersionMismatch { .. }));
        let installs = runner.installs.lock().unwrap();
        assert_eq!(installs.len(), 1);
        assert!(installs[0].contains("--force-reinstall"));
    }

    #[tokio::test]
    async fn test_prepare_install_failure() {
        let runner = PipRunner::new(vec![None], 1);
        let err = prepare(&runner, "v1.5").await.unwrap_err();
        assert!(matches!(err, InstallError::InstallFailed { exit_code: 1, .. }));
    }

    #[test]
    fn test_install_command_flags() {
        assert_eq!(
            install_command("v1.5", true, false),
            "python3 -m pip install --user --force-reinstall git+https://gitlab.cern.ch/hep-benchmarks/hep-score.git@v1.5"
        );
        assert_eq!(
            install_command("v1.5", false, true),
            "python3 -m pip install git+https://gitlab.cern.ch/hep-benchmarks/hep-score.git@v1.5"
        );
    }

    #[test]
    fn test_config_source_priority() {
        assert_eq!(ConfigSource::from_setting("default"), ConfigSource::Packaged);
        assert_eq!(
            ConfigSource::from_setting("https://example.org/hs.yaml"),
            ConfigSource::Remote("https://example.org/hs.yaml".into())
        );
        assert_eq!(
            ConfigSource::from_setting("/etc/hs.yaml"),
            ConfigSource::Local(PathBuf::from("/etc/hs.yaml"))
        );
    }

    #[test]
    fn test_apply_suite_settings() {
        let mut doc = serde_json::json!({
            "hepscore_benchmark": {
                "settings": { "container_exec": "docker", "name": "HEPscore20" },
                "options": { "level": "INFO" }
            }
        });
        let options = serde_json::json!({ "clean": true });
        apply_suite_settings(&mut doc, RunMode::Singularity, Some(&options)).unwrap();
        assert_eq!(
            doc["hepscore_benchmark"]["settings"]["container_exec"],
            "singularity"
        );
        assert_eq!(doc["hepscore_benchmark"]["settings"]["name"], "HEPscore20");
        assert_eq!(doc["hepscore_benchmark"]["options"], options);
    }

    #[test]
    fn test_apply_suite_settings_requires_section() {
        let mut doc = serde_json::json!({ "other": {} });
        assert!(apply_suite_settings(&mut doc, RunMode::Docker, None).is_err());
    }

    #[test]
    fn test_scorer_return_code() {
        assert_eq!(scorer_return_code("0"), 0);
        assert_eq!(scorer_return_code("-1"), -1);
        assert_eq!(scorer_return_code("0.4"), 1);
        assert_eq!(scorer_return_code("12.7"), 13);
        assert_eq!(scorer_return_code("None"), -1);
    }

    #[tokio::test]
    async fn test_load_local_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hs.yaml");
        std::fs::write(
            &path,
            "hepscore_benchmark:\n  settings:\n    container_exec: docker\n",
        )
        .unwrap();
        let scorer = PythonScorer::new(std::sync::Arc::new(PipRunner::new(vec![], 0)));
        let doc = load_config(&ConfigSource::Local(path), &scorer, dir.path())
            .await
            .unwrap();
        assert_eq!(doc["hepscore_benchmark"]["settings"]["container_exec"], "docker");
    }
}
