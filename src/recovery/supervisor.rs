//! Control of the producer through an external process supervisor.

use async_trait::async_trait;
use snafu::prelude::*;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

use crate::config::RecoveryConfig;
use crate::error::{CommandFailedSnafu, EmptyCommandSnafu, SpawnSnafu, SupervisorError};

/// Restarts the producer and reports its state.
#[async_trait]
pub trait Supervisor: Send + Sync + 'static {
    /// Restart the producer. Returns the supervisor's output.
    async fn restart(&self) -> Result<String, SupervisorError>;

    /// Query the producer's state. Returns the supervisor's output, which
    /// is informational only.
    async fn status(&self) -> Result<String, SupervisorError>;
}

/// Runs `<command...> <action> <program>`, e.g. `sudo supervisorctl restart podpingd`.
#[derive(Debug, Clone)]
pub struct CommandSupervisor {
    command: Vec<String>,
    program: String,
}

impl CommandSupervisor {
    pub fn new(command: Vec<String>, program: impl Into<String>) -> Self {
        Self {
            command,
            program: program.into(),
        }
    }

    pub fn from_config(config: &RecoveryConfig) -> Self {
        Self::new(config.supervisor_command.clone(), &config.program)
    }

    async fn invoke(&self, action: &str, require_success: bool) -> Result<String, SupervisorError> {
        let (binary, args) = self.command.split_first().context(EmptyCommandSnafu)?;
        let command_line = format!("{} {action} {}", self.command.join(" "), self.program);
        debug!(command = %command_line, "Invoking supervisor");

        let output = Command::new(binary)
            .args(args)
            .arg(action)
            .arg(&self.program)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .context(SpawnSnafu { command: &command_line })?;

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if require_success && !output.status.success() {
            return CommandFailedSnafu {
                command: command_line,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }
            .fail();
        }
        Ok(stdout)
    }
}

#[async_trait]
impl Supervisor for CommandSupervisor {
    async fn restart(&self) -> Result<String, SupervisorError> {
        self.invoke("restart", true).await
    }

    /// `supervisorctl status` exits non-zero for stopped programs, so the
    /// output is returned regardless of exit code.
    async fn status(&self) -> Result<String, SupervisorError> {
        self.invoke("status", false).await
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn supervisor(command: &[&str]) -> CommandSupervisor {
        CommandSupervisor::new(
            command.iter().map(|s| s.to_string()).collect(),
            "podpingd",
        )
    }

    #[tokio::test]
    async fn test_appends_action_and_program() {
        let output = supervisor(&["echo", "ctl"]).restart().await.unwrap();
        assert_eq!(output, "ctl restart podpingd");

        let output = supervisor(&["echo"]).status().await.unwrap();
        assert_eq!(output, "status podpingd");
    }

    #[tokio::test]
    async fn test_failed_restart_is_an_error() {
        let err = supervisor(&["false"]).restart().await.unwrap_err();
        match err {
            SupervisorError::CommandFailed { command, .. } => {
                assert_eq!(command, "false restart podpingd")
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[tokio::test]
    async fn test_status_output_survives_nonzero_exit() {
        assert_eq!(supervisor(&["false"]).status().await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_missing_binary_is_a_spawn_error() {
        let err = supervisor(&["/nonexistent/supervisorctl"])
            .restart()
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_empty_command() {
        let err = supervisor(&[]).restart().await.unwrap_err();
        assert!(matches!(err, SupervisorError::EmptyCommand));
    }
}
