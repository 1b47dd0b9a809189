//! Sandbox supervisor: one containerized agent session under a hard deadline.
//!
//! The [`ContainerRuntime`] trait decouples supervision from the container
//! CLI (currently `docker run`). Tests use a scripted runtime that runs a
//! shell script against the workspace instead of a container.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::core::naming::{UPSTREAM_PIN_REF, has_control_chars, is_sensitive_env_key};
use crate::io::config::SandboxConfig;
use crate::io::metadata::RunMetadata;
use crate::io::process::{CapturedOutput, OutputCapture};
use crate::io::workspace::Ownership;

pub const CONTAINER_WORKSPACE: &str = "/workspace";
pub const CONTAINER_HARNESS_STATE: &str = "/harness-state";
pub const SANDBOX_LOG_FILE: &str = "sandbox.log";

/// Parameters for one container launch.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub container_name: String,
    pub workspace: PathBuf,
    pub harness_state: PathBuf,
    pub user: Ownership,
    pub env: BTreeMap<String, String>,
}

/// Abstraction over container runtimes.
#[allow(async_fn_in_trait)]
pub trait ContainerRuntime {
    /// Command that runs one agent session to completion.
    ///
    /// The supervisor owns stdio wiring; implementations must not set it.
    fn command(&self, spec: &LaunchSpec) -> Command;

    /// Ask the container to stop (SIGTERM).
    async fn request_stop(&self, container_name: &str) -> Result<()>;

    /// Kill the container outright (SIGKILL).
    async fn force_stop(&self, container_name: &str) -> Result<()>;
}

/// Runtime that drives a docker-compatible CLI.
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    pub bin: String,
    pub image: String,
    pub entrypoint: String,
    pub extra_args: Vec<String>,
}

impl DockerRuntime {
    pub fn from_config(cfg: &SandboxConfig) -> Self {
        Self {
            bin: cfg.runtime.clone(),
            image: cfg.image.clone(),
            entrypoint: cfg.entrypoint.clone(),
            extra_args: cfg.extra_args.clone(),
        }
    }

    /// `run` arguments. Exactly two bind mounts; env values travel via the
    /// CLI's own environment so they never appear in argv.
    pub fn run_args(&self, spec: &LaunchSpec) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "--name".to_string(),
            spec.container_name.clone(),
            "--user".to_string(),
            format!("{}:{}", spec.user.uid, spec.user.gid),
            "-v".to_string(),
            format!("{}:{CONTAINER_WORKSPACE}", spec.workspace.display()),
            "-v".to_string(),
            format!("{}:{CONTAINER_HARNESS_STATE}", spec.harness_state.display()),
        ];
        args.extend(self.extra_args.iter().cloned());
        for key in spec.env.keys() {
            args.push("-e".to_string());
            args.push(key.clone());
        }
        args.push(self.image.clone());
        if !self.entrypoint.trim().is_empty() {
            args.push(self.entrypoint.clone());
        }
        args
    }

    async fn kill(&self, container_name: &str, signal: Option<&str>) -> Result<()> {
        let mut cmd = Command::new(&self.bin);
        cmd.arg("kill");
        if let Some(signal) = signal {
            cmd.arg("--signal").arg(signal);
        }
        let output = cmd
            .arg(container_name)
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("spawn {} kill", self.bin))?;
        if !output.status.success() {
            return Err(anyhow!(
                "{} kill {} failed: {}",
                self.bin,
                container_name,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(())
    }
}

impl ContainerRuntime for DockerRuntime {
    fn command(&self, spec: &LaunchSpec) -> Command {
        let mut cmd = Command::new(&self.bin);
        cmd.args(self.run_args(spec)).envs(&spec.env);
        cmd
    }

    async fn request_stop(&self, container_name: &str) -> Result<()> {
        self.kill(container_name, Some("TERM")).await
    }

    async fn force_stop(&self, container_name: &str) -> Result<()> {
        self.kill(container_name, None).await
    }
}

/// Time and size limits for one session.
#[derive(Debug, Clone, Copy)]
pub struct SupervisorSettings {
    pub budget: Duration,
    pub grace: Duration,
    pub output_limit_bytes: usize,
}

impl SupervisorSettings {
    pub fn from_config(cfg: &SandboxConfig) -> Self {
        Self {
            budget: Duration::from_secs(cfg.timeout_secs),
            grace: Duration::from_secs(cfg.grace_secs),
            output_limit_bytes: cfg.output_limit_bytes,
        }
    }
}

/// How the session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxExit {
    /// The process exited on its own; `None` when killed by a signal.
    Exited { code: Option<i32> },
    /// The deadline elapsed and the container was terminated.
    TimedOut,
    /// The operator cancelled the run and the container was terminated.
    Cancelled,
}

/// Transient record of one agent session.
#[derive(Debug)]
pub struct SandboxSession {
    pub container_name: String,
    pub started_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub exit: SandboxExit,
    pub elapsed: Duration,
    pub log_path: PathBuf,
    pub output: CapturedOutput,
}

impl SandboxSession {
    pub fn timed_out(&self) -> bool {
        self.exit == SandboxExit::TimedOut
    }
}

enum Race {
    Exited(std::io::Result<ExitStatus>),
    Deadline,
    Cancelled,
}

/// Run exactly one session, racing the process against the deadline and
/// operator cancellation.
#[instrument(skip_all, fields(container = %spec.container_name, budget_secs = settings.budget.as_secs()))]
pub async fn supervise<R: ContainerRuntime>(
    runtime: &R,
    spec: &LaunchSpec,
    settings: SupervisorSettings,
    cancel: &CancellationToken,
) -> Result<SandboxSession> {
    let log_path = sandbox_log_path(&spec.harness_state);
    debug!(env = ?masked_env(&spec.env), "sandbox environment");

    let mut cmd = runtime.command(spec);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let started = Instant::now();
    let started_at = Utc::now();
    let deadline_at = chrono::Duration::from_std(settings.budget)
        .ok()
        .and_then(|budget| started_at.checked_add_signed(budget))
        .unwrap_or(started_at);
    let now = tokio::time::Instant::now();
    let deadline = now
        .checked_add(settings.budget)
        .unwrap_or_else(|| now + Duration::from_secs(365 * 24 * 60 * 60));

    info!("launching sandbox container");
    let mut child = cmd.spawn().context("launch sandbox container")?;
    let capture = OutputCapture::attach(&mut child, &log_path, settings.output_limit_bytes).await?;
    capture
        .note(&format!(
            "=== forklift sandbox {} started {} (budget {}s) ===",
            spec.container_name,
            started_at.to_rfc3339(),
            settings.budget.as_secs()
        ))
        .await;

    let race = tokio::select! {
        status = child.wait() => Race::Exited(status),
        _ = tokio::time::sleep_until(deadline) => Race::Deadline,
        _ = cancel.cancelled() => Race::Cancelled,
    };

    let exit = match race {
        Race::Exited(status) => {
            let status = status.context("wait for sandbox container")?;
            SandboxExit::Exited {
                code: status.code(),
            }
        }
        Race::Deadline => {
            warn!(
                budget_secs = settings.budget.as_secs(),
                "sandbox exceeded its budget; terminating"
            );
            terminate(runtime, &spec.container_name, &mut child, settings.grace).await;
            SandboxExit::TimedOut
        }
        Race::Cancelled => {
            warn!("cancellation requested; terminating sandbox");
            terminate(runtime, &spec.container_name, &mut child, settings.grace).await;
            SandboxExit::Cancelled
        }
    };

    capture
        .note(&format!("=== forklift sandbox finished: {exit:?} ==="))
        .await;
    let output = capture
        .finish(settings.grace.max(Duration::from_secs(1)))
        .await;
    let elapsed = started.elapsed();

    let stdout = output.stdout_text();
    if !stdout.is_empty() {
        info!(stdout = %stdout, "container stdout");
    }
    let stderr = output.stderr_text();
    if !stderr.is_empty() {
        info!(stderr = %stderr, "container stderr");
    }
    info!(exit = ?exit, elapsed_secs = elapsed.as_secs(), log = %log_path.display(), "sandbox session ended");

    Ok(SandboxSession {
        container_name: spec.container_name.clone(),
        started_at,
        deadline: deadline_at,
        exit,
        elapsed,
        log_path,
        output,
    })
}

/// Stop politely, wait `grace`, then kill outright.
async fn terminate<R: ContainerRuntime>(
    runtime: &R,
    container_name: &str,
    child: &mut Child,
    grace: Duration,
) {
    match tokio::time::timeout(grace, runtime.request_stop(container_name)).await {
        Ok(Ok(())) => debug!("stop requested"),
        Ok(Err(err)) => warn!(error = %format!("{err:#}"), "stop request failed"),
        Err(_) => warn!("stop request timed out"),
    }
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            debug!(exit_code = ?status.code(), "sandbox stopped within grace period");
            return;
        }
        Ok(Err(err)) => warn!(error = %err, "wait after stop request failed"),
        Err(_) => warn!(
            grace_secs = grace.as_secs(),
            "sandbox ignored stop request; forcing kill"
        ),
    }

    match tokio::time::timeout(grace, runtime.force_stop(container_name)).await {
        Ok(Ok(())) => debug!("container killed"),
        Ok(Err(err)) => warn!(error = %format!("{err:#}"), "forced container kill failed"),
        Err(_) => warn!("forced container kill timed out"),
    }
    if let Err(err) = child.start_kill() {
        warn!(error = %err, "failed to kill sandbox client process");
    }
    match tokio::time::timeout(grace.max(Duration::from_secs(1)), child.wait()).await {
        Ok(Ok(status)) => debug!(status = ?status, "sandbox process reaped"),
        Ok(Err(err)) => warn!(error = %err, "wait after kill failed"),
        Err(_) => error!("sandbox process did not exit after forced kill"),
    }
}

/// Environment handed to the agent inside the container.
pub fn agent_env(
    cfg: &SandboxConfig,
    metadata: &RunMetadata,
    host_tz: Option<&str>,
) -> BTreeMap<String, String> {
    let mut env = cfg.env.clone();
    env.insert("FORKLIFT_MAIN_BRANCH".to_string(), metadata.main_branch.clone());
    env.insert("FORKLIFT_UPSTREAM_SHA".to_string(), metadata.upstream_sha.clone());
    env.insert("FORKLIFT_UPSTREAM_REF".to_string(), UPSTREAM_PIN_REF.to_string());
    env.insert("FORKLIFT_RUN_ID".to_string(), metadata.record.run_id.clone());
    if cfg.forward_tz {
        match host_tz {
            Some(tz) if !tz.is_empty() && !has_control_chars(tz) => {
                info!(tz, "forwarding host TZ into sandbox");
                env.insert("TZ".to_string(), tz.to_string());
            }
            Some(tz) if !tz.is_empty() => {
                warn!(tz = ?tz, "host TZ contains control characters; not forwarding");
            }
            _ => warn!("forward_tz enabled but host TZ is unset"),
        }
    }
    env
}

/// Copy of `env` with secret values replaced.
pub fn masked_env(env: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    env.iter()
        .map(|(key, value)| {
            let shown = if is_sensitive_env_key(key) {
                "***".to_string()
            } else {
                value.clone()
            };
            (key.clone(), shown)
        })
        .collect()
}

/// Path of the session log inside `harness_state`.
pub fn sandbox_log_path(harness_state: &Path) -> PathBuf {
    harness_state.join(SANDBOX_LOG_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Runs a shell script; stop requests are ignored like a wedged agent.
    struct ShellRuntime {
        script: String,
        stop_requests: AtomicUsize,
        force_stops: AtomicUsize,
    }

    impl ShellRuntime {
        fn new(script: &str) -> Self {
            Self {
                script: script.to_string(),
                stop_requests: AtomicUsize::new(0),
                force_stops: AtomicUsize::new(0),
            }
        }
    }

    impl ContainerRuntime for ShellRuntime {
        fn command(&self, spec: &LaunchSpec) -> Command {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(&self.script).current_dir(&spec.workspace);
            cmd
        }

        async fn request_stop(&self, _container_name: &str) -> Result<()> {
            self.stop_requests.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn force_stop(&self, _container_name: &str) -> Result<()> {
            self.force_stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn spec(root: &Path) -> LaunchSpec {
        let workspace = root.join("workspace");
        let harness_state = root.join("harness-state");
        std::fs::create_dir_all(&workspace).expect("workspace");
        std::fs::create_dir_all(&harness_state).expect("harness-state");
        LaunchSpec {
            container_name: "forklift-test-1-abc".to_string(),
            workspace,
            harness_state,
            user: Ownership { uid: 1000, gid: 1000 },
            env: BTreeMap::from([("OPENAI_API_KEY".to_string(), "sk-secret".to_string())]),
        }
    }

    fn settings(budget_ms: u64) -> SupervisorSettings {
        SupervisorSettings {
            budget: Duration::from_millis(budget_ms),
            grace: Duration::from_millis(200),
            output_limit_bytes: 10_000,
        }
    }

    #[tokio::test]
    async fn natural_exit_records_code_and_log() {
        let temp = tempfile::tempdir().expect("tempdir");
        let spec = spec(temp.path());
        let runtime = ShellRuntime::new("echo working; exit 3");

        let session = supervise(&runtime, &spec, settings(10_000), &CancellationToken::new())
            .await
            .expect("supervise");

        assert_eq!(session.exit, SandboxExit::Exited { code: Some(3) });
        assert!(!session.timed_out());
        assert_eq!(runtime.stop_requests.load(Ordering::SeqCst), 0);
        let log = std::fs::read_to_string(&session.log_path).expect("log");
        assert!(log.contains("working"));
        assert_eq!(session.log_path, sandbox_log_path(&spec.harness_state));
    }

    #[tokio::test]
    async fn deadline_escalates_to_kill_when_stop_is_ignored() {
        let temp = tempfile::tempdir().expect("tempdir");
        let spec = spec(temp.path());
        let runtime = ShellRuntime::new("trap '' TERM; exec sleep 30");

        let started = Instant::now();
        let session = supervise(&runtime, &spec, settings(300), &CancellationToken::new())
            .await
            .expect("supervise");

        assert!(session.timed_out());
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(runtime.stop_requests.load(Ordering::SeqCst), 1);
        assert_eq!(runtime.force_stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_stops_the_container() {
        let temp = tempfile::tempdir().expect("tempdir");
        let spec = spec(temp.path());
        let runtime = ShellRuntime::new("exec sleep 30");
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let session = supervise(&runtime, &spec, settings(20_000), &cancel)
            .await
            .expect("supervise");
        assert_eq!(session.exit, SandboxExit::Cancelled);
        assert_eq!(runtime.force_stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn docker_args_mount_exactly_two_paths() {
        let temp = tempfile::tempdir().expect("tempdir");
        let spec = spec(temp.path());
        let runtime = DockerRuntime::from_config(&SandboxConfig::default());
        let args = runtime.run_args(&spec);

        let mounts: Vec<&String> = args
            .iter()
            .zip(args.iter().skip(1))
            .filter(|(flag, _)| flag.as_str() == "-v")
            .map(|(_, value)| value)
            .collect();
        assert_eq!(mounts.len(), 2);
        assert!(mounts[0].ends_with(":/workspace"));
        assert!(mounts[1].ends_with(":/harness-state"));
        assert!(args.contains(&"1000:1000".to_string()));
        assert!(args.iter().all(|arg| !arg.contains("sk-secret")));
        assert_eq!(args.last().map(String::as_str), Some("/opt/opencode/entrypoint.sh"));
    }

    #[test]
    fn secrets_are_masked() {
        let env = BTreeMap::from([
            ("OPENAI_API_KEY".to_string(), "sk-secret".to_string()),
            ("FORKLIFT_MAIN_BRANCH".to_string(), "main".to_string()),
        ]);
        let masked = masked_env(&env);
        assert_eq!(masked["OPENAI_API_KEY"], "***");
        assert_eq!(masked["FORKLIFT_MAIN_BRANCH"], "main");
    }
}
