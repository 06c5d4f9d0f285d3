//! External command execution.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::debug;

use crate::domain::{Result, ShipyardError};

/// A command to run: argv, extra environment, working directory, timeout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Name used in logs and errors.
    pub name: String,
    /// Command line; the first element is the executable.
    pub argv: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Zero disables the timeout.
    #[serde(default)]
    pub timeout_secs: u64,
}

impl CommandSpec {
    pub fn new(name: impl Into<String>, argv: Vec<String>) -> Self {
        Self {
            name: name.into(),
            argv,
            env: BTreeMap::new(),
            working_dir: None,
            timeout_secs: 0,
        }
    }

    pub fn env(mut self, key: &str, value: impl Into<String>) -> Self {
        self.env.insert(key.to_string(), value.into());
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }
}

/// Result of a command execution.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub name: String,
    /// Exit code; -1 when killed by a signal or timed out.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn passed(&self) -> bool {
        !self.timed_out && self.exit_code == 0
    }

    /// Last non-empty stderr line, for short failure messages.
    pub fn stderr_tail(&self) -> &str {
        self.stderr
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("")
    }
}

pub struct CommandRunner;

impl CommandRunner {
    /// Run `spec` to completion. A non-zero exit or a timeout is reported in
    /// the output; only a command that cannot be started is an error. The
    /// child is killed when the returned future is dropped.
    pub async fn execute(spec: &CommandSpec) -> Result<CommandOutput> {
        let start = Instant::now();

        let (exe, args) = spec
            .argv
            .split_first()
            .ok_or_else(|| ShipyardError::Command {
                name: spec.name.clone(),
                reason: "empty command".to_string(),
            })?;

        let mut command = Command::new(exe);
        command
            .args(args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.working_dir {
            command.current_dir(dir);
        }

        let child = command.spawn().map_err(|e| ShipyardError::Command {
            name: spec.name.clone(),
            reason: e.to_string(),
        })?;
        debug!(command = %spec.name, exe = %exe, "command started");

        let waited = if spec.timeout_secs > 0 {
            tokio::time::timeout(
                Duration::from_secs(spec.timeout_secs),
                child.wait_with_output(),
            )
            .await
            .ok()
        } else {
            Some(child.wait_with_output().await)
        };

        let duration_ms = start.elapsed().as_millis() as u64;
        let output = match waited {
            Some(result) => result.map_err(|e| ShipyardError::Command {
                name: spec.name.clone(),
                reason: e.to_string(),
            })?,
            None => {
                return Ok(CommandOutput {
                    name: spec.name.clone(),
                    exit_code: -1,
                    stdout: String::new(),
                    stderr: format!("timed out after {} seconds", spec.timeout_secs),
                    duration_ms,
                    timed_out: true,
                })
            }
        };

        Ok(CommandOutput {
            name: spec.name.clone(),
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration_ms,
            timed_out: false,
        })
    }
}
