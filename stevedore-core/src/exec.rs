//! Command execution for build and restart hooks.
//!
//! Hooks run either on the agent host or inside an already-running container;
//! the [`Executor`] trait abstracts over both. Remote executors advertise
//! themselves through [`Executor::is_remote`], since inheriting the agent's
//! own environment only makes sense when commands run locally.

use crate::appfiles::DEFAULT_PLATFORM_WORKING_DIR;
use crate::error::{Result, StevedoreError};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tracing::debug;

/// Ceiling on a single hook command.
const EXEC_WAIT_TIMEOUT: Duration = Duration::from_secs(60);

/// Completion poll interval.
const EXEC_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// One command execution.
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    pub cmd: String,
    pub args: Vec<String>,
    pub dir: Option<PathBuf>,
    /// Full environment, `KEY=VALUE` formatted. Nothing else is inherited.
    pub envs: Vec<String>,
}

impl ExecuteOptions {
    fn display(&self) -> String {
        let mut parts = vec![self.cmd.clone()];
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }
}

/// Runs commands on behalf of the hook runner.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Whether commands run somewhere other than the agent host.
    fn is_remote(&self) -> bool {
        false
    }

    /// Runs the command to completion, streaming its output into `out`.
    /// Non-zero exit status and the execution ceiling are both failures.
    async fn execute(
        &self,
        opts: ExecuteOptions,
        out: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<()>;
}

/// Executes commands as child processes of the agent.
#[derive(Debug, Default)]
pub struct LocalExecutor;

#[async_trait]
impl Executor for LocalExecutor {
    async fn execute(
        &self,
        opts: ExecuteOptions,
        out: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<()> {
        let display = opts.display();

        let mut command = tokio::process::Command::new(&opts.cmd);
        command.args(&opts.args).stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());
        command.env_clear();
        for pair in &opts.envs {
            if let Some((key, value)) = pair.split_once('=') {
                command.env(key, value);
            }
        }
        if let Some(dir) = &opts.dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|e| StevedoreError::Io {
            path: PathBuf::from(&opts.cmd),
            source: e,
        })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let drain = |pipe: Option<tokio::process::ChildStdout>| async move {
            let mut buf = Vec::new();
            if let Some(mut pipe) = pipe {
                pipe.read_to_end(&mut buf)
                    .await
                    .map_err(|e| StevedoreError::Internal(format!("hook output: {e}")))?;
            }
            Ok::<_, StevedoreError>(buf)
        };
        let drain_err = |pipe: Option<tokio::process::ChildStderr>| async move {
            let mut buf = Vec::new();
            if let Some(mut pipe) = pipe {
                pipe.read_to_end(&mut buf)
                    .await
                    .map_err(|e| StevedoreError::Internal(format!("hook output: {e}")))?;
            }
            Ok::<_, StevedoreError>(buf)
        };

        // Poll completion rather than blocking on wait, so the ceiling is
        // enforced even for commands that never exit.
        let wait = async {
            let deadline = Instant::now() + EXEC_WAIT_TIMEOUT;
            loop {
                if let Some(status) = child.try_wait().map_err(|e| StevedoreError::Io {
                    path: PathBuf::from(&opts.cmd),
                    source: e,
                })? {
                    return Ok(status);
                }
                if Instant::now() >= deadline {
                    child.start_kill().ok();
                    return Err(StevedoreError::HookTimeout { command: display.clone() });
                }
                tokio::time::sleep(EXEC_POLL_INTERVAL).await;
            }
        };

        let (status, out_buf, err_buf) = tokio::try_join!(wait, drain(stdout), drain_err(stderr))?;

        out.write_all(&out_buf)
            .await
            .map_err(|e| StevedoreError::Internal(format!("hook output sink: {e}")))?;
        out.write_all(&err_buf)
            .await
            .map_err(|e| StevedoreError::Internal(format!("hook output sink: {e}")))?;

        if !status.success() {
            return Err(StevedoreError::HookFailed {
                command: display,
                code: status.code().unwrap_or(-1),
            });
        }

        Ok(())
    }
}

/// Runs a list of hook commands through `executor` under the platform working
/// directory, with the app environment (plus the agent's own environment for
/// local executors).
pub async fn run_hook_commands(
    executor: &dyn Executor,
    commands: &[String],
    app_envs: &BTreeMap<String, String>,
    out: &mut (dyn AsyncWrite + Send + Unpin),
) -> Result<()> {
    let working_dir = if tokio::fs::metadata(DEFAULT_PLATFORM_WORKING_DIR).await.is_ok() {
        DEFAULT_PLATFORM_WORKING_DIR
    } else {
        "/"
    };

    let mut envs: Vec<String> =
        app_envs.iter().map(|(key, value)| format!("{key}={value}")).collect();
    if !executor.is_remote() {
        // Local environment variables do not make sense on a remote executor
        // since it runs commands in a different container.
        envs.extend(std::env::vars().map(|(key, value)| format!("{key}={value}")));
    }

    for command in commands {
        out.write_all(format!(" ---> Running {command:?}\n").as_bytes())
            .await
            .map_err(|e| StevedoreError::Internal(format!("hook output sink: {e}")))?;
        debug!(command, working_dir, "running hook command");

        executor
            .execute(
                ExecuteOptions {
                    cmd: "/bin/sh".to_string(),
                    args: vec!["-lc".to_string(), command.clone()],
                    dir: Some(PathBuf::from(working_dir)),
                    envs: envs.clone(),
                },
                out,
            )
            .await?;
    }

    Ok(())
}
