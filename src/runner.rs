//! Local and remote command execution
//!
//! [`CommandRunner`] executes exactly one attempt of a command, locally or on
//! a [`RemoteTarget`] over ssh. Retries are layered on top by
//! [`CommandRunnerExt::run`], so any runner (including test fakes) gets the
//! same retry semantics.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::PhaseName;
use crate::retry::RetryPolicy;
use crate::target::RemoteTarget;
use crate::{Error, Result};

/// Exit code reported for attempts killed by the per-attempt timeout or a signal
pub const EXIT_ABNORMAL: i32 = -1;

/// Seconds ssh waits for the TCP connection before giving up
const SSH_CONNECT_TIMEOUT_SECS: u32 = 10;

/// A command to execute.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CommandSpec {
    /// Program name or path
    pub program: String,
    /// Arguments
    pub args: Vec<String>,
    /// Extra environment variables
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    /// Create a command with no arguments
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    /// Append one argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set an environment variable
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Single shell-quoted line, used for logging and for remote execution
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .map(shell_quote)
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Remote command line: environment assignments prefixed with `env`
    fn remote_line(&self) -> String {
        if self.env.is_empty() {
            return self.display();
        }
        let assignments: Vec<String> = self
            .env
            .iter()
            .map(|(k, v)| shell_quote(&format!("{}={}", k, v)))
            .collect();
        format!("env {} {}", assignments.join(" "), self.display())
    }
}

/// Captured result of a command.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CommandOutput {
    /// Process exit code, [`EXIT_ABNORMAL`] if killed
    pub exit_code: i32,
    /// Captured stdout
    pub stdout: String,
    /// Captured stderr
    pub stderr: String,
    /// Whether the attempt hit the per-attempt timeout
    pub timed_out: bool,
    /// Attempts made to produce this output
    pub attempts: u32,
}

impl CommandOutput {
    /// Successful output with the given stdout
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            attempts: 1,
            ..Default::default()
        }
    }

    /// Failed output with the given exit code and stderr
    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stderr: stderr.into(),
            attempts: 1,
            ..Default::default()
        }
    }

    /// Whether the command exited 0
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }

    /// The collaborator's error text: stderr, or stdout when stderr is empty
    pub fn error_text(&self) -> String {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return stderr.to_string();
        }
        let stdout = self.stdout.trim();
        if !stdout.is_empty() {
            return stdout.to_string();
        }
        format!("exited with code {}", self.exit_code)
    }
}

/// Executes a single attempt of a command.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `command` once, locally or on `target`, killing it after `timeout`.
    ///
    /// A non-zero exit is an `Ok` output; `Err` means the command could not be
    /// started at all.
    async fn execute<'a>(
        &self,
        command: &CommandSpec,
        target: Option<&'a RemoteTarget>,
        timeout: Option<Duration>,
    ) -> Result<CommandOutput>;
}

/// Retry and error helpers for every [`CommandRunner`].
#[async_trait]
pub trait CommandRunnerExt: CommandRunner {
    /// Run `command` under `policy` (single attempt when `None`).
    ///
    /// Non-zero exits are retried up to `max_attempts`; the final failing
    /// output is returned as-is, never masked as success.
    async fn run(
        &self,
        command: &CommandSpec,
        target: Option<&RemoteTarget>,
        policy: Option<&RetryPolicy>,
    ) -> Result<CommandOutput> {
        let policy = policy.cloned().unwrap_or_else(RetryPolicy::once);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            debug!(
                command = %command.display(),
                target = target.map(|t| t.name.as_str()).unwrap_or("local"),
                attempt = attempt,
                "Running command"
            );

            let mut output = self
                .execute(command, target, policy.attempt_timeout())
                .await?;
            output.attempts = attempt;

            if output.success() {
                return Ok(output);
            }
            if attempt >= policy.max_attempts() {
                warn!(
                    program = %command.program,
                    attempts = attempt,
                    exit_code = output.exit_code,
                    "Command failed after max attempts"
                );
                return Ok(output);
            }

            let delay = policy.delay(attempt);
            warn!(
                program = %command.program,
                attempt = attempt,
                exit_code = output.exit_code,
                delay_ms = delay.as_millis(),
                "Command failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Like [`run`](Self::run), but a failing final output becomes
    /// [`Error::StepFailed`] carrying the command's raw error text.
    async fn run_step(
        &self,
        phase: PhaseName,
        step: &str,
        command: &CommandSpec,
        target: Option<&RemoteTarget>,
        policy: Option<&RetryPolicy>,
    ) -> Result<CommandOutput> {
        let output = self.run(command, target, policy).await?;
        if output.success() {
            return Ok(output);
        }
        Err(match target {
            Some(t) => Error::step_on(phase, step, t.name.clone(), output.error_text()),
            None => Error::step(phase, step, output.error_text()),
        })
    }
}

impl<T: CommandRunner + ?Sized> CommandRunnerExt for T {}

/// Runs commands as child processes; remote commands go through `ssh`.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner;

impl ProcessRunner {
    /// Create a process runner
    pub fn new() -> Self {
        Self
    }

    fn build(command: &CommandSpec, target: Option<&RemoteTarget>) -> Command {
        let mut cmd = match target {
            None => {
                let mut cmd = Command::new(&command.program);
                cmd.args(&command.args);
                cmd.envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
                cmd
            }
            Some(target) => {
                let mut cmd = Command::new("ssh");
                cmd.args(ssh_args(target));
                cmd.arg("--").arg(command.remote_line());
                cmd
            }
        };
        cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn execute<'a>(
        &self,
        command: &CommandSpec,
        target: Option<&'a RemoteTarget>,
        timeout: Option<Duration>,
    ) -> Result<CommandOutput> {
        let program = if target.is_some() {
            "ssh".to_string()
        } else {
            command.program.clone()
        };

        let mut child = Self::build(command, target)
            .spawn()
            .map_err(|source| Error::Spawn {
                program: program.clone(),
                source,
            })?;

        let waited = match timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait_with_output()).await {
                Ok(result) => result,
                Err(_) => {
                    // dropping the future kills the child (kill_on_drop)
                    return Ok(CommandOutput {
                        exit_code: EXIT_ABNORMAL,
                        stderr: format!("{} timed out after {:?}", program, limit),
                        timed_out: true,
                        attempts: 1,
                        ..Default::default()
                    });
                }
            },
            None => child.wait_with_output().await,
        };
        let output = waited?;

        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(EXIT_ABNORMAL),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            timed_out: false,
            attempts: 1,
        })
    }
}

/// ssh options for a non-interactive connection to `target`
pub fn ssh_args(target: &RemoteTarget) -> Vec<String> {
    let mut args = vec![
        "-o".to_string(),
        "BatchMode=yes".to_string(),
        "-o".to_string(),
        "StrictHostKeyChecking=accept-new".to_string(),
        "-o".to_string(),
        format!("ConnectTimeout={}", SSH_CONNECT_TIMEOUT_SECS),
        "-p".to_string(),
        target.port.to_string(),
    ];
    if let Some(identity) = &target.identity_file {
        args.push("-i".to_string());
        args.push(identity.to_string_lossy().into_owned());
    }
    args.push(target.destination());
    args
}

/// POSIX single-quote `s` unless it only holds safe characters
pub fn shell_quote(s: &str) -> String {
    let safe = !s.is_empty()
        && s.chars().all(|c| {
            c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | ':' | '=' | ',' | '@')
        });
    if safe {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}
