//! Shell port
//!
//! Commands run through `sh -c` with an explicit working directory; the process
//! working directory is never changed.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{run_process, CommandFilter, SandboxConfig, SandboxError};

/// Result of a shell command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShellOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub truncated: bool,
}

impl ShellOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0) && !self.timed_out
    }
}

/// Shell port. The collaborator owns the allow-list, not the caller.
#[async_trait]
pub trait ShellPort: Send + Sync {
    async fn execute(&self, command: &str, cwd: &Path) -> Result<ShellOutput>;
}

/// Filtered, time-boxed `sh -c` executor
#[derive(Debug, Clone)]
pub struct SandboxShell {
    config: SandboxConfig,
    filter: CommandFilter,
}

impl SandboxShell {
    pub fn new(config: SandboxConfig) -> Self {
        let filter = CommandFilter::new(config.clone());
        Self { config, filter }
    }

    pub fn filter(&self) -> &CommandFilter {
        &self.filter
    }
}

impl Default for SandboxShell {
    fn default() -> Self {
        Self::new(SandboxConfig::default())
    }
}

#[async_trait]
impl ShellPort for SandboxShell {
    async fn execute(&self, command: &str, cwd: &Path) -> Result<ShellOutput> {
        let verdict = self.filter.check(command);
        if !verdict.allowed {
            warn!("Blocked command '{}': {}", command, verdict.reasons.join("; "));
            return Err(SandboxError::Blocked(verdict.reasons.join("; ")).into());
        }

        if !cwd.is_dir() {
            return Err(SandboxError::MissingCwd(cwd.display().to_string()).into());
        }

        debug!("Executing '{}' in {}", command, cwd.display());

        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command).current_dir(cwd).env_clear();
        for (key, value) in self.config.child_env() {
            cmd.env(key, value);
        }

        let out = run_process(cmd, self.config.timeout(), self.config.max_output_bytes).await?;
        info!(
            "Command '{}' finished: exit={:?} timed_out={} ({}ms)",
            command, out.exit_code, out.timed_out, out.duration_ms
        );

        Ok(ShellOutput {
            stdout: out.stdout,
            stderr: out.stderr,
            exit_code: out.exit_code,
            timed_out: out.timed_out,
            truncated: out.truncated,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_execute_in_explicit_cwd() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "here").unwrap();

        let shell = SandboxShell::default();
        let out = shell.execute("cat marker.txt", dir.path()).await.unwrap();
        assert!(out.success());
        assert_eq!(out.stdout, "here");
    }

    #[tokio::test]
    async fn test_blocked_command_errors() {
        let dir = TempDir::new().unwrap();
        let shell = SandboxShell::default();

        let err = shell.execute("sudo ls", dir.path()).await.unwrap_err();
        assert!(err.to_string().contains("blocked"));
    }

    #[tokio::test]
    async fn test_environment_is_scrubbed() {
        let dir = TempDir::new().unwrap();
        let shell = SandboxShell::new(SandboxConfig {
            extra_env: vec![("CODEFORGE_PROBE".into(), "visible".into())],
            ..Default::default()
        });

        let out = shell.execute("env", dir.path()).await.unwrap();
        assert!(out.stdout.contains("CODEFORGE_PROBE=visible"));
        assert!(!out.stdout.contains("CARGO_PKG_NAME"));
    }

    #[tokio::test]
    async fn test_timeout_reported() {
        let dir = TempDir::new().unwrap();
        let shell = SandboxShell::new(SandboxConfig {
            timeout_secs: 1,
            ..Default::default()
        });

        let out = shell.execute("sleep 5", dir.path()).await.unwrap();
        assert!(out.timed_out);
        assert!(!out.success());
    }
}
