//! CLI subcommand handlers.

use anyhow::Context;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

use bmksuite_core::config::{ConfigOverrides, SuiteConfig, load_config};
use bmksuite_core::{
    BenchmarkSuite, CommandRunner, Extractor, FinalReport, ShellRunner, SuiteError, SystemProbe,
    SystemRunners, export, transport,
};

use crate::{Commands, RunArgs};

/// Handle a CLI subcommand.
pub async fn handle_command(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Run(args) => handle_run(args).await,
        Commands::Metadata { output } => handle_metadata(output.as_deref()).await,
        Commands::Show { report } => handle_show(&report),
        Commands::Publish { report, config } => handle_publish(&report, &config).await,
    }
}

/// Process exit code for an error bubbled up to `main`.
pub fn exit_code(err: &anyhow::Error) -> u8 {
    err.downcast_ref::<SuiteError>()
        .map(SuiteError::exit_code)
        .and_then(|code| u8::try_from(code).ok())
        .unwrap_or(1)
}

fn overrides(args: &RunArgs) -> ConfigOverrides {
    ConfigOverrides {
        benchmarks: (!args.benchmarks.is_empty()).then(|| args.benchmarks.clone()),
        rundir: args.rundir.clone(),
        mode: args.mode,
        mp_num: args.mp_num,
        publish: args.publish.then_some(true),
        export: args.export.then_some(true),
    }
}

async fn handle_run(args: RunArgs) -> anyhow::Result<()> {
    let config = load_config(Some(&args.config), Some(&overrides(&args)))
        .map_err(SuiteError::from)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;

    let commands: Arc<dyn CommandRunner> = Arc::new(ShellRunner::new());
    let runners = Arc::new(SystemRunners::with_python_scorer(commands.clone()));
    let mut suite = BenchmarkSuite::new(config.clone(), runners, Arc::new(SystemProbe), commands)
        .with_cli_tags(args.tags);

    let outcome = suite.start().await;

    // Post-run steps only make sense once a report exists
    let post_run = match suite.report() {
        Some(report) => {
            report.print_summary();
            after_run(&config, report).await
        }
        None => Ok(()),
    };

    outcome?;
    post_run
}

async fn after_run(config: &SuiteConfig, report: &FinalReport) -> anyhow::Result<()> {
    let rundir = &config.global.rundir;

    if config.global.export {
        let archive = archive_path(config, &report.id);
        let entries = export::export_results(rundir, &archive).map_err(SuiteError::from)?;
        println!("Exported {} files to {}", entries.len(), archive.display());
    }

    if config.global.publish {
        let Some(activemq) = &config.activemq else {
            warn!("Publishing requested but no activemq section is configured");
            return Ok(());
        };
        transport::send_report(activemq, &config.global.report_path())
            .await
            .map_err(SuiteError::from)?;
        info!(topic = %activemq.topic, "Report published");
    }
    Ok(())
}

/// `<parent of rundir>/<rundir name>_<report id>.zip`
fn archive_path(config: &SuiteConfig, report_id: &str) -> PathBuf {
    let name = config
        .global
        .rundir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "bmkrun".to_string());
    config
        .global
        .parent_dir()
        .join(format!("{name}_{report_id}.zip"))
}

async fn handle_metadata(output: Option<&Path>) -> anyhow::Result<()> {
    let commands: Arc<dyn CommandRunner> = Arc::new(ShellRunner::new());
    let extractor = Extractor::new(commands, &SystemProbe);
    let metadata = extractor.collect().await;
    let json = serde_json::to_string_pretty(&metadata)?;

    match output {
        Some(path) => {
            std::fs::write(path, json)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Metadata written to {}", path.display());
        }
        None => println!("{json}"),
    }
    Ok(())
}

fn handle_show(report: &Path) -> anyhow::Result<()> {
    let report = FinalReport::read(report)
        .with_context(|| format!("Failed to read report {}", report.display()))?;
    println!("Report {} ({} to {})", report.id, report.timestamp, report.timestamp_end);
    report.print_summary();
    Ok(())
}

async fn handle_publish(report: &Path, config: &Path) -> anyhow::Result<()> {
    let config = load_config(Some(config), None).map_err(SuiteError::from)?;
    let Some(activemq) = &config.activemq else {
        error!("No activemq section in the configuration");
        anyhow::bail!("Cannot publish without an activemq configuration");
    };
    transport::send_report(activemq, report)
        .await
        .map_err(SuiteError::from)?;
    println!("Report {} sent to {}", report.display(), activemq.topic);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bmksuite_core::Benchmark;
    use pretty_assertions::assert_eq;

    fn run_args() -> RunArgs {
        RunArgs {
            config: PathBuf::from("bmksuite.yml"),
            benchmarks: Vec::new(),
            rundir: None,
            mode: None,
            mp_num: None,
            tags: None,
            publish: false,
            export: false,
        }
    }

    #[test]
    fn test_exit_codes() {
        let preflight = anyhow::Error::from(SuiteError::Preflight {
            failed_checks: vec!["x".into()],
        });
        assert_eq!(exit_code(&preflight), 2);

        let partial = anyhow::Error::from(SuiteError::BenchmarkFailure {
            failed: vec!["db12".into()],
        })
        .context("while running");
        assert_eq!(exit_code(&partial), 3);

        assert_eq!(exit_code(&anyhow::anyhow!("other")), 1);
    }

    #[test]
    fn test_unset_flags_do_not_override() {
        let layer = overrides(&run_args());
        assert!(layer.benchmarks.is_none());
        assert!(layer.publish.is_none());
        assert!(layer.export.is_none());
    }

    #[test]
    fn test_flags_override() {
        let mut args = run_args();
        args.benchmarks = vec![Benchmark::Db12, Benchmark::Hs0664];
        args.export = true;
        let layer = overrides(&args);
        assert_eq!(
            layer.benchmarks,
            Some(vec![Benchmark::Db12, Benchmark::Hs0664])
        );
        assert_eq!(layer.export, Some(true));
    }

    #[test]
    fn test_archive_next_to_rundir() {
        let mut config = SuiteConfig::default();
        config.global.rundir = PathBuf::from("/scratch/bench/run1");
        assert_eq!(
            archive_path(&config, "abc"),
            PathBuf::from("/scratch/bench/run1_abc.zip")
        );
    }
}
