//! Child process execution with timeout and cancellation
//!
//! Output lines stream to `tracing` at debug level; the last
//! [`OUTPUT_TAIL_LINES`] are kept for diagnostics.

use crate::env::EnvOverlay;
use std::collections::VecDeque;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const OUTPUT_TAIL_LINES: usize = 20;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("failed to start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{program}' exited with {code}")]
    Failed {
        program: String,
        code: String,
        output_tail: Vec<String>,
    },

    #[error("'{program}' timed out after {}s", timeout.as_secs())]
    TimedOut {
        program: String,
        timeout: Duration,
        output_tail: Vec<String>,
    },

    #[error("'{program}' was cancelled")]
    Cancelled { program: String },

    #[error("failed waiting for '{program}': {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

impl ProcessError {
    pub fn output_tail(&self) -> &[String] {
        match self {
            ProcessError::Failed { output_tail, .. } | ProcessError::TimedOut { output_tail, .. } => {
                output_tail.as_slice()
            }
            _ => &[],
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ProcessError::Cancelled { .. })
    }
}

/// Output of a successful run
#[derive(Debug, Clone, Default)]
pub struct ProcessOutput {
    /// Trailing stdout and stderr lines, interleaved as read
    pub output_tail: Vec<String>,
}

impl ProcessOutput {
    pub fn text(&self) -> String {
        self.output_tail.join("\n")
    }
}

type Tail = Arc<Mutex<VecDeque<String>>>;

/// Runs programs with a timeout and a cancellation token
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    timeout: Duration,
    env: EnvOverlay,
}

impl ProcessRunner {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            env: EnvOverlay::new(),
        }
    }

    /// Children inherit `env` on top of the process environment
    pub fn with_env(mut self, env: EnvOverlay) -> Self {
        self.env = env;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn env(&self) -> &EnvOverlay {
        &self.env
    }

    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self {
            timeout,
            env: self.env.clone(),
        }
    }

    /// Run `program` to completion
    ///
    /// The child is killed when the timeout elapses or `cancel` fires.
    pub async fn run(
        &self,
        program: &str,
        args: &[String],
        cwd: Option<&Path>,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutput, ProcessError> {
        tracing::debug!("Running {} {}", program, args.join(" "));

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        self.env.apply(&mut cmd);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn {
            program: program.to_string(),
            source,
        })?;

        let tail: Tail = Arc::new(Mutex::new(VecDeque::with_capacity(OUTPUT_TAIL_LINES)));
        let mut readers: Vec<JoinHandle<()>> = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(stream_lines(stdout, program, Arc::clone(&tail)));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(stream_lines(stderr, program, Arc::clone(&tail)));
        }

        let status = tokio::select! {
            status = child.wait() => status.map_err(|source| ProcessError::Wait {
                program: program.to_string(),
                source,
            })?,
            _ = tokio::time::sleep(self.timeout) => {
                kill(&mut child, program).await;
                drain(readers).await;
                return Err(ProcessError::TimedOut {
                    program: program.to_string(),
                    timeout: self.timeout,
                    output_tail: snapshot(&tail),
                });
            }
            _ = cancel.cancelled() => {
                kill(&mut child, program).await;
                drain(readers).await;
                return Err(ProcessError::Cancelled {
                    program: program.to_string(),
                });
            }
        };

        drain(readers).await;
        let output_tail = snapshot(&tail);

        if status.success() {
            Ok(ProcessOutput { output_tail })
        } else {
            Err(ProcessError::Failed {
                program: program.to_string(),
                code: status
                    .code()
                    .map(|c| format!("exit code {}", c))
                    .unwrap_or_else(|| "a signal".to_string()),
                output_tail,
            })
        }
    }
}

fn stream_lines<R>(reader: R, program: &str, tail: Tail) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let label = Path::new(program)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| program.to_string());

    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!("{}: {}", label, line);
            let mut tail = tail.lock().unwrap_or_else(|e| e.into_inner());
            if tail.len() == OUTPUT_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }
    })
}

async fn kill(child: &mut tokio::process::Child, program: &str) {
    if let Err(e) = child.kill().await {
        tracing::warn!("Failed to kill '{}': {}", program, e);
    }
}

/// Grandchildren can hold the pipes open after a kill, so reading is bounded
async fn drain(readers: Vec<JoinHandle<()>>) {
    for mut reader in readers {
        if tokio::time::timeout(DRAIN_TIMEOUT, &mut reader).await.is_err() {
            reader.abort();
        }
    }
}

fn snapshot(tail: &Tail) -> Vec<String> {
    tail.lock()
        .unwrap_or_else(|e| e.into_inner())
        .iter()
        .cloned()
        .collect()
}
