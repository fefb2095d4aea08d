//! Command construction for the containerized hep-spec harness
//! (hs06 family and spec2017).

use std::borrow::Cow;
use tracing::{debug, error, info};

use crate::benchmark::Benchmark;
use crate::command::CommandRunner;
use crate::config::{HepSpecConfig, RunMode, SuiteConfig};

/// Scheme every docker-mode image reference must carry.
pub const DOCKER_PREFIX: &str = "docker://";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum HepSpecCommandError {
    #[error("Invalid docker image specified. Image should start with docker://")]
    InvalidDockerImage,

    #[error("No configuration section for {0}")]
    MissingSection(Benchmark),

    #[error("Required key '{0}' missing from configuration")]
    MissingKey(&'static str),
}

/// Quote a value for `sh` unless it only holds characters that need none.
fn shell_quote(value: &str) -> Cow<'_, str> {
    let safe = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./:@=,+%".contains(c));
    if safe {
        Cow::Borrowed(value)
    } else {
        Cow::Owned(format!("'{}'", value.replace('\'', r"'\''")))
    }
}

/// Harness arguments: global flags first, then allow-listed section keys.
pub fn build_arguments(config: &SuiteConfig, bench: Benchmark, section: &HepSpecConfig) -> String {
    let rundir = config.global.rundir.display().to_string();
    let mut args = vec![
        format!("-b {}", bench.id()),
        format!("-w {}", shell_quote(&rundir)),
        format!("-n {}", config.global.mp_num_or_cores()),
    ];

    let flags = [
        ("-i", section.iterations.map(|i| i.to_string())),
        ("-p", section.hepspec_volume.clone()),
        ("-s", section.bmk_set.clone()),
        ("-m", section.mode.clone()),
        ("-u", section.url_tarball.clone()),
    ];
    for (flag, value) in flags {
        if let Some(value) = value {
            args.push(format!("{flag} {}", shell_quote(&value)));
        }
    }

    for key in section.extra.keys() {
        error!(benchmark = %bench, key = %key, "Not a valid HEPSPEC06 key, skipping");
    }

    args.join(" ")
}

/// Full shell command for the configured run mode.
pub fn build_command(config: &SuiteConfig, bench: Benchmark) -> Result<String, HepSpecCommandError> {
    let section = config
        .hepspec_section(bench)
        .ok_or(HepSpecCommandError::MissingSection(bench))?;
    let image = section
        .image
        .as_deref()
        .ok_or(HepSpecCommandError::MissingKey("image"))?;
    let volume = section
        .hepspec_volume
        .as_deref()
        .ok_or(HepSpecCommandError::MissingKey("hepspec_volume"))?;

    let rundir = config.global.rundir.display().to_string();
    let rundir = shell_quote(&rundir);
    let volume = shell_quote(volume);
    let args = build_arguments(config, bench, section);

    let command = match config.global.mode {
        RunMode::Docker => {
            let image = image
                .strip_prefix(DOCKER_PREFIX)
                .ok_or(HepSpecCommandError::InvalidDockerImage)?;
            format!(
                "docker run --rm --network=host -v {rundir}:{rundir}:Z -v {volume}:{volume}:Z {} {args}",
                shell_quote(image)
            )
        }
        RunMode::Singularity => {
            let cache = config.global.parent_dir().join("singularity_cachedir");
            format!(
                "SINGULARITY_CACHEDIR={} singularity run -B {rundir}:{rundir} -B {volume}:{volume} {} {args}",
                shell_quote(&cache.display().to_string()),
                shell_quote(image)
            )
        }
    };
    Ok(command)
}

/// Run a hep-spec benchmark, returning the harness exit code.
///
/// Returns 1 without running anything when the command cannot be built.
pub async fn run_hepspec(runner: &dyn CommandRunner, config: &SuiteConfig, bench: Benchmark) -> i32 {
    let command = match build_command(config, bench) {
        Ok(command) => command,
        Err(e) => {
            error!(benchmark = %bench, error = %e, "Cannot start benchmark");
            return 1;
        }
    };

    info!(benchmark = %bench, mode = %config.global.mode, "Starting hep-spec benchmark");
    debug!(command = %command, "hep-spec command");
    runner.run_streaming(&command).await
}
