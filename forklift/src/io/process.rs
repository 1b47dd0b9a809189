//! Streaming capture of child process output.
//!
//! stdout and stderr are drained concurrently so a chatty child can never
//! block on a full pipe. Every line is appended to a log file as it arrives,
//! and at most `limit` bytes per stream are kept in memory.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::Child;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::warn;

type SharedLog = Arc<Mutex<BufWriter<File>>>;

/// Output collected from a finished child.
#[derive(Debug, Default)]
pub struct CapturedOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    /// Readers were abandoned because the pipes stayed open past the drain timeout.
    pub drain_timed_out: bool,
}

impl CapturedOutput {
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).trim().to_string()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }
}

/// Reader tasks attached to a running child.
pub struct OutputCapture {
    stdout: JoinHandle<Result<(Vec<u8>, usize)>>,
    stderr: JoinHandle<Result<(Vec<u8>, usize)>>,
    log: SharedLog,
}

impl OutputCapture {
    /// Take the child's piped stdout/stderr and start teeing them into `log_path`.
    pub async fn attach(child: &mut Child, log_path: &Path, limit: usize) -> Result<Self> {
        if let Some(parent) = log_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create log dir {}", parent.display()))?;
        }
        let file = File::create(log_path)
            .await
            .with_context(|| format!("create log {}", log_path.display()))?;
        let log: SharedLog = Arc::new(Mutex::new(BufWriter::new(file)));

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("stdout was not piped"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("stderr was not piped"))?;

        Ok(Self {
            stdout: tokio::spawn(read_lines_with_tee(stdout, limit, log.clone(), "")),
            stderr: tokio::spawn(read_lines_with_tee(stderr, limit, log.clone(), "[stderr] ")),
            log,
        })
    }

    /// Wait for both readers, giving up after `drain_timeout`.
    ///
    /// A killed child can leave grandchildren holding the pipes open; the
    /// timeout keeps the supervisor from hanging on them.
    pub async fn finish(self, drain_timeout: Duration) -> CapturedOutput {
        let Self {
            mut stdout,
            mut stderr,
            log,
        } = self;
        let mut captured = CapturedOutput::default();

        let joined = tokio::time::timeout(drain_timeout, async {
            let out = (&mut stdout).await;
            let err = (&mut stderr).await;
            (out, err)
        })
        .await;

        match joined {
            Ok((out, err)) => {
                (captured.stdout, captured.stdout_truncated) = unpack(out, "stdout");
                (captured.stderr, captured.stderr_truncated) = unpack(err, "stderr");
            }
            Err(_) => {
                warn!(
                    drain_timeout_secs = drain_timeout.as_secs(),
                    "output pipes still open; abandoning readers"
                );
                stdout.abort();
                stderr.abort();
                captured.drain_timed_out = true;
            }
        }

        if captured.stdout_truncated > 0 || captured.stderr_truncated > 0 {
            warn!(
                stdout_truncated = captured.stdout_truncated,
                stderr_truncated = captured.stderr_truncated,
                "in-memory output truncated (log file is complete)"
            );
        }
        if let Err(err) = log.lock().await.flush().await {
            warn!(error = %err, "failed to flush output log");
        }
        captured
    }

    /// Append a line to the log outside of the child's own output.
    pub async fn note(&self, line: &str) {
        let mut writer = self.log.lock().await;
        let result = async {
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await
        }
        .await;
        if let Err(err) = result {
            warn!(error = %err, "failed to write output log");
        }
    }
}

fn unpack(
    joined: std::result::Result<Result<(Vec<u8>, usize)>, tokio::task::JoinError>,
    label: &str,
) -> (Vec<u8>, usize) {
    match joined {
        Ok(Ok(pair)) => pair,
        Ok(Err(err)) => {
            warn!(stream = label, error = %format!("{err:#}"), "output reader failed");
            (Vec::new(), 0)
        }
        Err(err) => {
            warn!(stream = label, error = %err, "output reader task panicked");
            (Vec::new(), 0)
        }
    }
}

/// Read `reader` line by line, tee-ing into `log`, keeping at most `limit` bytes.
async fn read_lines_with_tee<R: AsyncRead + Unpin>(
    reader: R,
    limit: usize,
    log: SharedLog,
    prefix: &'static str,
) -> Result<(Vec<u8>, usize)> {
    let mut buf_reader = BufReader::new(reader);
    let mut collected = Vec::new();
    let mut truncated = 0usize;

    loop {
        let mut line = Vec::new();
        let n = buf_reader
            .read_until(b'\n', &mut line)
            .await
            .context("read line")?;
        if n == 0 {
            break;
        }

        {
            let mut writer = log.lock().await;
            let written = async {
                writer.write_all(prefix.as_bytes()).await?;
                writer.write_all(&line).await?;
                writer.flush().await
            }
            .await;
            if let Err(err) = written {
                warn!(error = %err, "failed to write to output log");
            }
        }

        let remaining = limit.saturating_sub(collected.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            collected.extend_from_slice(&line[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((collected, truncated))
}
