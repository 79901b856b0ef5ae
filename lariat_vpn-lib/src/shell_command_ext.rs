use thiserror::Error;
use tokio::process::Command;

use std::future::Future;
use std::io;
use std::process::Output;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Command execution failed")]
    CommandFailed,
    #[error("IO error: {0}")]
    IO(#[from] io::Error),
}

/// Controls whether command output ends up in the logs.
///
/// Teardown paths pass [`Logs::Suppress`] to avoid noise from commands
/// that are expected to fail (e.g. deleting a route that is already gone).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Logs {
    Print,
    Suppress,
}

/// Combined result of a command run that is inspected rather than
/// short-circuited, mirroring `CombinedOutput` style usage where the
/// caller needs the text even when the command failed.
#[derive(Debug)]
pub struct CommandOutput {
    pub success: bool,
    pub combined: String,
}

pub trait ShellCommandExt {
    fn run(&mut self, logs: Logs) -> impl Future<Output = Result<(), Error>> + Send;
    fn run_stdout(&mut self, logs: Logs) -> impl Future<Output = Result<String, Error>> + Send;
    fn run_combined(&mut self) -> impl Future<Output = Result<CommandOutput, Error>> + Send;
}

impl ShellCommandExt for Command {
    /// Run the command and print stderr with a warning on success.
    /// Unconditionally captures stdout and stderr regardless of command settings.
    /// See tokio's output behaviour: https://docs.rs/tokio/latest/tokio/process/struct.Command.html#method.output
    async fn run(&mut self, logs: Logs) -> Result<(), Error> {
        let output = self.output().await?;
        let cmd_debug = format!("{:?}", self);
        check_output(cmd_debug, output, logs).map(|_| ())
    }

    async fn run_stdout(&mut self, logs: Logs) -> Result<String, Error> {
        let output = self.output().await?;
        let cmd_debug = format!("{:?}", self);
        check_output(cmd_debug, output, logs)
    }

    /// Run the command and hand back status plus interleaved stdout/stderr.
    /// Only IO-level failures (command not found, etc.) surface as errors;
    /// a non-zero exit status is reported through [`CommandOutput::success`].
    async fn run_combined(&mut self) -> Result<CommandOutput, Error> {
        let output = self.output().await?;
        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.is_empty() {
            if !combined.is_empty() && !combined.ends_with('\n') {
                combined.push('\n');
            }
            combined.push_str(&stderr);
        }
        Ok(CommandOutput {
            success: output.status.success(),
            combined,
        })
    }
}

fn check_output(cmd: String, output: Output, logs: Logs) -> Result<String, Error> {
    let stderrempty = output.stderr.is_empty();
    let stdout = String::from_utf8_lossy(&output.stdout);
    match (stderrempty, output.status) {
        (true, status) if status.success() => Ok(stdout.trim().to_string()),
        (false, status) if status.success() => {
            if logs == Logs::Print {
                let stderr = String::from_utf8_lossy(&output.stderr);
                tracing::warn!(cmd, %stderr, "Non empty stderr on successful command");
            }
            Ok(stdout.trim().to_string())
        }
        (_, status) => {
            if logs == Logs::Print {
                let stderr = String::from_utf8_lossy(&output.stderr);
                tracing::error!(cmd, status_code = ?status.code(), %stdout, %stderr, "Error executing command");
            }
            Err(Error::CommandFailed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout() -> anyhow::Result<()> {
        let out = Command::new("echo").arg("hello").run_stdout(Logs::Print).await?;
        assert_eq!(out, "hello");
        Ok(())
    }

    #[tokio::test]
    async fn combined_reports_failure_without_erroring() -> anyhow::Result<()> {
        let out = Command::new("sh").arg("-c").arg("echo oops >&2; exit 2").run_combined().await?;
        assert!(!out.success);
        assert!(out.combined.contains("oops"));
        Ok(())
    }

    #[tokio::test]
    async fn failed_command_is_an_error() {
        let res = Command::new("false").run(Logs::Suppress).await;
        assert!(res.is_err());
    }
}
