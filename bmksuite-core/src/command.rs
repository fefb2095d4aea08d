//! Shell command execution with buffered, piped and streaming variants.
//!
//! Command failures never surface as errors: a failing or missing command
//! yields [`NOT_AVAILABLE`] and a nonzero exit code so callers can degrade
//! instead of aborting.

use async_trait::async_trait;
use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, error, warn};

/// Placeholder used whenever a value cannot be determined.
pub const NOT_AVAILABLE: &str = "not_available";

/// Exit code reported when a command could not be started at all.
pub const SPAWN_FAILURE_CODE: i32 = 127;

/// Captured result of a buffered command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Decoded stdout with trailing whitespace removed, or [`NOT_AVAILABLE`].
    pub stdout: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    fn unavailable(exit_code: i32) -> Self {
        Self {
            stdout: NOT_AVAILABLE.to_string(),
            exit_code,
        }
    }
}

/// Executes commands on behalf of the metadata extractor and the runners.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a shell command line and capture its output.
    async fn run(&self, command: &str) -> CommandOutput;

    /// Run a pipeline of argv stages, feeding each stage's stdout into the next.
    async fn run_pipeline(&self, stages: &[Vec<String>]) -> CommandOutput;

    /// Run a shell command line forwarding its output live, returning the exit code.
    async fn run_streaming(&self, command: &str) -> i32;
}

/// Default runner that executes commands through `bash -c`.
#[derive(Debug, Clone)]
pub struct ShellRunner {
    shell: String,
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self {
            shell: "/bin/bash".to_string(),
        }
    }
}

impl ShellRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a different shell binary, e.g. `/bin/sh` on minimal hosts.
    pub fn with_shell(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }

    fn shell_command(&self, command: &str) -> Command {
        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c").arg(command);
        cmd
    }
}

/// Turn raw stdout bytes into trimmed text. Invalid UTF-8 becomes empty output.
pub fn decode_output(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) => text.trim_end().to_string(),
        Err(e) => {
            error!(error = %e, "Failed to decode command output as utf-8");
            String::new()
        }
    }
}

/// Exit code of a finished child. A signal death is reported as `128 + signal`
/// the way the shell does, so it always counts as a failure.
fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => -1,
    }
}

/// Copy a child pipe to our stdout as raw bytes until EOF.
///
/// The pipe keeps draining after a write failure so the child never
/// writes into a closed pipe.
async fn forward_output<R: AsyncRead + Unpin>(pipe: R, stream: &'static str) {
    let mut reader = BufReader::new(pipe);
    let mut out = tokio::io::stdout();
    let mut chunk = Vec::with_capacity(4096);
    let mut forwarding = true;

    loop {
        chunk.clear();
        match reader.read_until(b'\n', &mut chunk).await {
            Ok(0) => break,
            Ok(_) if forwarding => {
                if let Err(e) = out.write_all(&chunk).await {
                    warn!(stream, error = %e, "Cannot forward benchmark output, discarding the rest");
                    forwarding = false;
                } else {
                    let _ = out.flush().await;
                }
            }
            Ok(_) => {}
            Err(e) => {
                error!(stream, error = %e, "Failed to read benchmark output");
                break;
            }
        }
    }
}

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run(&self, command: &str) -> CommandOutput {
        debug!(command = command, "Executing command");

        let output = match self
            .shell_command(command)
            .stdin(Stdio::null())
            .output()
            .await
        {
            Ok(output) => output,
            Err(e) => {
                error!(command = command, error = %e, "Failed to spawn command");
                return CommandOutput::unavailable(SPAWN_FAILURE_CODE);
            }
        };

        let exit_code = exit_code_of(output.status);
        let result = if exit_code != 0 {
            error!(
                command = command,
                exit_code,
                stderr = %decode_output(&output.stderr),
                "Command failed"
            );
            CommandOutput::unavailable(exit_code)
        } else {
            CommandOutput {
                stdout: decode_output(&output.stdout),
                exit_code,
            }
        };

        debug!(command = command, exit_code, output = %result.stdout, "Command finished");
        result
    }

    async fn run_pipeline(&self, stages: &[Vec<String>]) -> CommandOutput {
        let rendered = stages
            .iter()
            .map(|argv| argv.join(" "))
            .collect::<Vec<_>>()
            .join(" | ");
        debug!(pipeline = %rendered, "Executing pipeline");

        if stages.is_empty() || stages.iter().any(Vec::is_empty) {
            warn!(pipeline = %rendered, "Refusing to run an empty pipeline stage");
            return CommandOutput::unavailable(SPAWN_FAILURE_CODE);
        }

        let mut children: Vec<Child> = Vec::with_capacity(stages.len());
        let mut upstream: Option<Stdio> = None;

        for (index, argv) in stages.iter().enumerate() {
            let mut cmd = Command::new(&argv[0]);
            cmd.args(&argv[1..])
                .stdin(upstream.take().unwrap_or_else(Stdio::null))
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);

            let mut child = match cmd.spawn() {
                Ok(child) => child,
                Err(e) => {
                    error!(stage = index, program = %argv[0], error = %e, "Failed to spawn pipeline stage");
                    return CommandOutput::unavailable(SPAWN_FAILURE_CODE);
                }
            };

            if index + 1 < stages.len() {
                let Some(stdout) = child.stdout.take() else {
                    error!(stage = index, "Pipeline stage has no stdout");
                    return CommandOutput::unavailable(SPAWN_FAILURE_CODE);
                };
                match TryInto::<Stdio>::try_into(stdout) {
                    Ok(stdio) => upstream = Some(stdio),
                    Err(e) => {
                        error!(stage = index, error = %e, "Failed to connect pipeline stages");
                        return CommandOutput::unavailable(SPAWN_FAILURE_CODE);
                    }
                }
            }
            children.push(child);
        }

        let Some(last) = children.pop() else {
            return CommandOutput::unavailable(SPAWN_FAILURE_CODE);
        };
        let output = match last.wait_with_output().await {
            Ok(output) => output,
            Err(e) => {
                error!(pipeline = %rendered, error = %e, "Failed to wait for pipeline");
                return CommandOutput::unavailable(SPAWN_FAILURE_CODE);
            }
        };

        // Earlier stages are reaped so a failure anywhere fails the pipeline
        let mut exit_code = exit_code_of(output.status);
        for mut child in children {
            match child.wait().await {
                Ok(status) if exit_code == 0 => exit_code = exit_code_of(status),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Failed to reap pipeline stage"),
            }
        }

        if exit_code != 0 {
            error!(pipeline = %rendered, exit_code, stderr = %decode_output(&output.stderr), "Pipeline failed");
            return CommandOutput::unavailable(exit_code);
        }

        let stdout = decode_output(&output.stdout);
        debug!(pipeline = %rendered, output = %stdout, "Pipeline finished");
        CommandOutput { stdout, exit_code }
    }

    async fn run_streaming(&self, command: &str) -> i32 {
        debug!(command = command, "Executing benchmark command");

        let mut child = match self
            .shell_command(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                error!(command = command, error = %e, "Failed to spawn benchmark command");
                return SPAWN_FAILURE_CODE;
            }
        };

        // stderr is merged into the parent's stdout like `2>&1`
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        tokio::join!(
            async {
                if let Some(pipe) = stdout {
                    forward_output(pipe, "stdout").await;
                }
            },
            async {
                if let Some(pipe) = stderr {
                    forward_output(pipe, "stderr").await;
                }
            }
        );

        let exit_code = match child.wait().await {
            Ok(status) => exit_code_of(status),
            Err(e) => {
                error!(command = command, error = %e, "Failed to wait for benchmark command");
                return SPAWN_FAILURE_CODE;
            }
        };

        if exit_code != 0 {
            error!(exit_code, "Benchmark execution failed");
        }
        exit_code
    }
}
