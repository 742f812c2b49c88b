//! Dedicated-process isolation.
//!
//! A job is serialized to JSON on the worker's stdin and the reply is read as
//! JSON from its stdout. The worker starts with fresh global runtime state,
//! which is the only way to reset state that a thread cannot.

use crate::config::ProcessConfig;
use crate::error::{OrchestratorError, OrchestratorResult};
use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::io::{Read, Write};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Spawns a worker process per job
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl ProcessRunner {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }

    pub fn from_config(config: &ProcessConfig) -> Self {
        Self::new(
            config.program.clone(),
            config.args.clone(),
            Duration::from_secs(config.timeout_secs),
        )
    }

    /// Send `job` to a fresh worker and decode its reply
    pub async fn run<I, O>(&self, job: &I) -> OrchestratorResult<O>
    where
        I: Serialize,
        O: DeserializeOwned,
    {
        let input = serde_json::to_vec(job)?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                OrchestratorError::Isolation(format!("failed to spawn {}: {}", self.program, e))
            })?;

        tracing::debug!(program = %self.program, pid = ?child.id(), "Worker process started");

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| OrchestratorError::Isolation("worker stdin unavailable".to_string()))?;
        // a worker that exits early closes the pipe; its exit status says why
        if let Err(e) = stdin.write_all(&input).await {
            if e.kind() != std::io::ErrorKind::BrokenPipe {
                return Err(OrchestratorError::Isolation(format!(
                    "failed to write job to worker: {}",
                    e
                )));
            }
        }
        drop(stdin);

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(output) => output.map_err(|e| {
                OrchestratorError::Isolation(format!("failed to wait for worker: {}", e))
            })?,
            Err(_) => {
                return Err(OrchestratorError::Isolation(format!(
                    "worker {} did not finish within {:?}",
                    self.program, self.timeout
                )))
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(OrchestratorError::Isolation(format!(
                "worker {} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }

        Ok(serde_json::from_slice(&output.stdout)?)
    }
}

/// Worker side of the protocol: read one job from stdin, handle it on a fresh
/// runtime and write the reply to stdout.
pub fn serve_stdio<I, O, F, Fut>(handler: F) -> anyhow::Result<()>
where
    I: DeserializeOwned,
    O: Serialize,
    F: FnOnce(I) -> Fut,
    Fut: Future<Output = O>,
{
    let mut input = Vec::new();
    std::io::stdin()
        .read_to_end(&mut input)
        .context("Failed to read job from stdin")?;
    let job: I = serde_json::from_slice(&input).context("Failed to decode job")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build worker runtime")?;
    let reply = runtime.block_on(handler(job));

    let output = serde_json::to_vec(&reply).context("Failed to encode reply")?;
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(&output).context("Failed to write reply")?;
    stdout.flush().context("Failed to flush reply")?;
    Ok(())
}
