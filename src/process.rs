//! Child Process Runner
//!
//! External collaborators (task solver, replay driver, autoevaluator) run
//! as child processes bounded by a wall-clock timeout. On timeout the
//! child is killed and the run is reported as timed out, never retried.
//!
//! Commands are configured as templates such as
//! `python run_demo.py --task_name webarena.{task_id} --headless`. They are
//! split on whitespace and executed without a shell.

use anyhow::{bail, Context, Result};
use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Captured output per stream
const MAX_OUTPUT_BYTES: usize = 1024 * 1024;

/// Command line with `{name}` placeholders
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    template: String,
}

impl CommandTemplate {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.template
    }

    /// Program and arguments with every placeholder filled
    pub fn render(&self, vars: &BTreeMap<&str, String>) -> Result<Vec<String>> {
        let mut argv = Vec::new();
        for token in self.template.split_whitespace() {
            argv.push(fill(token, vars)?);
        }
        if argv.is_empty() {
            bail!("Empty command template");
        }
        Ok(argv)
    }
}

fn fill(token: &str, vars: &BTreeMap<&str, String>) -> Result<String> {
    let mut out = String::with_capacity(token.len());
    let mut rest = token;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let close = after
            .find('}')
            .with_context(|| format!("Unclosed placeholder in '{}'", token))?;
        let name = &after[..close];
        let value = vars
            .get(name)
            .with_context(|| format!("No value for placeholder '{{{}}}'", name))?;
        out.push_str(value);
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Result of one child process
#[derive(Debug, Clone, Default)]
pub struct ProcessOutput {
    /// Exit code (None if killed/timeout)
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub truncated: bool,
    pub timed_out: bool,
    pub duration_ms: u64,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    /// Last non-empty stdout line
    pub fn last_line(&self) -> Option<&str> {
        self.stdout.lines().rev().map(str::trim).find(|l| !l.is_empty())
    }
}

async fn read_limited<R: AsyncRead + Unpin>(reader: Option<R>, max_size: usize) -> (Vec<u8>, bool) {
    let mut buf = Vec::new();
    let Some(mut reader) = reader else {
        return (buf, false);
    };
    let mut truncated = false;
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                if buf.len() + n <= max_size {
                    buf.extend_from_slice(&chunk[..n]);
                } else {
                    // keep draining so the child never blocks on a full pipe
                    truncated = true;
                }
            }
            Err(_) => break,
        }
    }
    (buf, truncated)
}

/// Run `argv` to completion or until `timeout` elapses
pub async fn run_with_timeout(argv: &[String], timeout: Duration) -> Result<ProcessOutput> {
    let (program, args) = argv.split_first().context("Empty command")?;
    let start = Instant::now();
    debug!(command = %argv.join(" "), timeout_secs = timeout.as_secs(), "Spawning child process");

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("Failed to spawn {}", program))?;

    let result = tokio::time::timeout(timeout, async {
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let ((out, out_truncated), (err, err_truncated)) = tokio::join!(
            read_limited(stdout, MAX_OUTPUT_BYTES),
            read_limited(stderr, MAX_OUTPUT_BYTES / 4),
        );
        let status = child.wait().await?;
        Ok::<_, anyhow::Error>((out, err, status, out_truncated || err_truncated))
    })
    .await;

    let duration_ms = start.elapsed().as_millis() as u64;
    match result {
        Ok(Ok((out, err, status, truncated))) => {
            info!(command = %program, code = ?status.code(), duration_ms, "Child process finished");
            Ok(ProcessOutput {
                exit_code: status.code(),
                stdout: String::from_utf8_lossy(&out).to_string(),
                stderr: String::from_utf8_lossy(&err).to_string(),
                truncated,
                timed_out: false,
                duration_ms,
            })
        }
        Ok(Err(e)) => Err(e.context(format!("Failed to wait for {}", program))),
        Err(_) => {
            let _ = child.kill().await;
            warn!(command = %program, timeout_secs = timeout.as_secs(), "Child process timed out and was killed");
            Ok(ProcessOutput {
                stderr: format!("Process timed out after {} seconds", timeout.as_secs()),
                timed_out: true,
                duration_ms,
                ..Default::default()
            })
        }
    }
}

/// Render and run a template
pub async fn run_template(
    template: &CommandTemplate,
    vars: &BTreeMap<&str, String>,
    timeout: Duration,
) -> Result<ProcessOutput> {
    let argv = template.render(vars)?;
    run_with_timeout(&argv, timeout).await
}
