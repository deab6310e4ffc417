//! Worker executor that runs one process per job.
//!
//! - payload on stdin
//! - `JOBS_PIPELINE`, `JOBS_JOB_ID`, `JOBS_JOB_NAME`, `JOBS_ATTEMPT` and `JOBS_HEADER_<KEY>` in the environment
//! - exit 0: success / exit 65 (EX_DATAERR): fatal / anything else or timeout: retry

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use jobs_core::{Job, Outcome, WorkerExecutor};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::config::WorkerConfig;

/// sysexits.h EX_DATAERR
const EX_DATAERR: i32 = 65;

/// Keep at most this much of stderr in failure reasons.
const MAX_REASON: usize = 512;

pub struct CommandExecutor {
    config: WorkerConfig,
}

impl CommandExecutor {
    pub fn new(config: WorkerConfig) -> Self {
        Self { config }
    }

    fn command(&self, job: &Job) -> Option<Command> {
        let (program, args) = self.config.command.split_first()?;
        let mut command = Command::new(program);
        command
            .args(args)
            .envs(&self.config.env)
            .env("JOBS_PIPELINE", job.pipeline().as_str())
            .env("JOBS_JOB_ID", job.id().to_string())
            .env("JOBS_JOB_NAME", job.name())
            .env("JOBS_ATTEMPT", (job.attempts() + 1).to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in job.headers() {
            command.env(header_var(key), value);
        }
        Some(command)
    }

    async fn run(&self, mut command: Command, job: &Job) -> std::io::Result<std::process::Output> {
        let mut child = command.spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            // a worker may exit without reading its input
            if let Err(err) = stdin.write_all(job.payload()).await
                && err.kind() != std::io::ErrorKind::BrokenPipe
            {
                return Err(err);
            }
        }
        child.wait_with_output().await
    }
}

fn header_var(key: &str) -> String {
    let key: String = key
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    format!("JOBS_HEADER_{key}")
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();
    if text.len() <= MAX_REASON {
        return text.to_string();
    }
    let mut start = text.len() - MAX_REASON;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}

#[async_trait]
impl WorkerExecutor for CommandExecutor {
    async fn execute(&self, job: &Job) -> Outcome {
        let Some(command) = self.command(job) else {
            return Outcome::fatal("no worker command configured");
        };

        let timeout: Duration = self.config.timeout;
        let output = match tokio::time::timeout(timeout, self.run(command, job)).await {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => return Outcome::failure(format!("worker failed to run: {err}")),
            Err(_) => return Outcome::failure(format!("worker timed out after {timeout:?}")),
        };

        let stderr = stderr_tail(&output.stderr);
        match output.status.code() {
            Some(0) => Outcome::success(),
            Some(EX_DATAERR) => Outcome::fatal(format!("worker rejected the job: {stderr}")),
            Some(code) => Outcome::failure(format!("worker exited with {code}: {stderr}")),
            None => Outcome::failure(format!("worker killed by signal: {stderr}")),
        }
    }
}
