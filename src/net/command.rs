use std::process::{Command, Stdio};

use crate::error::{Result, VpcError};

#[derive(Debug, Clone)]
pub struct CommandResult {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

pub struct CommandExecutor;

impl CommandExecutor {
    /// Run a shell command to completion, capturing output. A non-zero exit
    /// is not an error at this layer; callers decide what converges.
    pub fn execute_shell(command: &str) -> Result<CommandResult> {
        tracing::debug!("executing: {}", command);
        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .output()
            .map_err(|e| VpcError::Driver {
                cmd: command.to_string(),
                stderr: e.to_string(),
            })?;

        Ok(CommandResult {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    /// Spawn a shell command detached from this process. Used only for
    /// workloads that must outlive the invocation.
    pub fn spawn_shell(command: &str) -> Result<()> {
        tracing::debug!("spawning: {}", command);
        Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| VpcError::Driver {
                cmd: command.to_string(),
                stderr: e.to_string(),
            })?;
        Ok(())
    }
}
