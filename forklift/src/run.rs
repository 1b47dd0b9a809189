//! Orchestration for one forklift run.
//!
//! Guard, workspace, sandbox, verifier and publish run strictly in sequence.
//! An explicit [`RunContext`] (paths plus metadata) is handed from stage to
//! stage; the [`RunMachine`] rejects any transition the lifecycle does not
//! allow. Every path out of [`run_forklift`] ends in exactly one terminal
//! [`RunStatus`], which `main` maps to the process exit code.

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Local;
use rand::distributions::Alphanumeric;
use rand::{Rng, thread_rng};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span, warn};

use crate::core::naming::{RUN_TIMESTAMP_FORMAT, container_name};
use crate::core::state::{RunMachine, RunStatus};
use crate::core::types::Verdict;
use crate::errors::{Cancelled, is_cancelled};
use crate::exit_codes;
use crate::io::config::ForkliftConfig;
use crate::io::git::Git;
use crate::io::guard::check_preconditions;
use crate::io::metadata::{RunMetadata, record_outcome};
use crate::io::publish::{HistoryRewriter, PublishReport, publish};
use crate::io::sandbox::{
    ContainerRuntime, LaunchSpec, SandboxExit, SupervisorSettings, agent_env, supervise,
};
use crate::io::verify::{STUCK_MARKER, verify_outcome};
use crate::io::workspace::{Ownership, RunPaths, WorkspaceRequest, prepare_workspace, restore_ownership};

/// Inputs for one invocation.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub source_repo: PathBuf,
    pub config: ForkliftConfig,
    /// Host `TZ`, forwarded only when the config asks for it.
    pub host_tz: Option<String>,
}

/// The current run, threaded explicitly through each stage.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub paths: RunPaths,
    pub metadata: RunMetadata,
}

/// Final result of [`run_forklift`].
#[derive(Debug)]
pub struct RunReport {
    pub run_id: String,
    pub status: RunStatus,
    pub history: Vec<RunStatus>,
    /// `None` when the run ended before a workspace existed.
    pub context: Option<RunContext>,
    pub detail: Option<String>,
    pub publish: Option<PublishReport>,
}

impl RunReport {
    pub fn exit_code(&self) -> i32 {
        self.status.exit_code().unwrap_or(exit_codes::FAILED)
    }

    pub fn run_dir(&self) -> Option<&PathBuf> {
        self.context.as_ref().map(|ctx| &ctx.paths.run_dir)
    }
}

/// Run the full pipeline once.
///
/// Never returns an error: failures become the `FAILED` or `CANCELLED`
/// terminal state with the cause in [`RunReport::detail`].
pub async fn run_forklift<R, H>(
    request: &RunRequest,
    runtime: &R,
    rewriter: &H,
    cancel: &CancellationToken,
) -> RunReport
where
    R: ContainerRuntime,
    H: HistoryRewriter,
{
    let run_id = generate_run_id();
    let span = info_span!("run", run = %run_id);
    let mut pipeline = Pipeline {
        request,
        runtime,
        rewriter,
        cancel,
        run_id,
        machine: RunMachine::new(),
        context: None,
        publish: None,
    };
    async move {
        info!(repo = %request.source_repo.display(), "starting forklift run");
        let detail = match pipeline.execute().await {
            Ok(detail) => detail,
            Err(err) => pipeline.abort(err),
        };
        pipeline.finish(detail)
    }
    .instrument(span)
    .await
}

struct Pipeline<'a, R, H> {
    request: &'a RunRequest,
    runtime: &'a R,
    rewriter: &'a H,
    cancel: &'a CancellationToken,
    run_id: String,
    machine: RunMachine,
    context: Option<RunContext>,
    publish: Option<PublishReport>,
}

impl<R: ContainerRuntime, H: HistoryRewriter> Pipeline<'_, R, H> {
    /// Drive the stages; `Ok` carries the terminal detail once a terminal state is reached.
    async fn execute(&mut self) -> Result<Option<String>> {
        let request = self.request;
        let cancel = self.cancel;
        let config = &request.config;
        config.validate().context("invalid configuration")?;
        self.checkpoint("guard")?;

        let source = Git::new(&request.source_repo).with_cancel(cancel.clone());
        let guard = check_preconditions(&source).await?;
        self.advance(RunStatus::GuardOk)?;

        let timestamp = Local::now().format(RUN_TIMESTAMP_FORMAT).to_string();
        let runs_root = config.runs_root()?;
        let run_id = self.run_id.clone();
        let sandbox_owner = Ownership {
            uid: config.sandbox.uid,
            gid: config.sandbox.gid,
        };
        let workspace_request = WorkspaceRequest {
            source_repo: &request.source_repo,
            guard: &guard,
            main_branch: &config.main_branch,
            runs_root: &runs_root,
            timestamp: &timestamp,
            run_id: &run_id,
            fork_context_file: &config.fork_context_file,
            sandbox_owner,
        };
        let (paths, metadata) = prepare_workspace(&workspace_request, cancel)
            .await
            .context("prepare workspace")?;
        let context = RunContext { paths, metadata };
        self.context = Some(context.clone());
        self.advance(RunStatus::WorkspaceReady)?;
        info!(run_dir = %context.paths.run_dir.display(), "workspace ready");

        self.checkpoint("sandbox")?;
        let compact = timestamp.replace('_', "");
        let suffix = format!("{:06x}", thread_rng().gen_range(0..0x0100_0000u32));
        let spec = LaunchSpec {
            container_name: container_name(&context.metadata.record.project_name, &compact, &suffix),
            workspace: context.paths.workspace.clone(),
            harness_state: context.paths.harness_state.clone(),
            user: sandbox_owner,
            env: agent_env(&config.sandbox, &context.metadata, request.host_tz.as_deref()),
        };
        self.advance(RunStatus::SandboxRunning)?;
        let session = supervise(
            self.runtime,
            &spec,
            SupervisorSettings::from_config(&config.sandbox),
            cancel,
        )
        .await;
        restore_ownership(&context.paths);
        let session = session.context("run sandbox")?;

        match session.exit {
            SandboxExit::TimedOut => {
                self.advance(RunStatus::SandboxTimeout)?;
                return Ok(Some(format!(
                    "sandbox exceeded its {}s budget; workspace left as-is",
                    config.sandbox.timeout_secs
                )));
            }
            SandboxExit::Cancelled => {
                return Err(Cancelled).context("sandbox stopped");
            }
            SandboxExit::Exited { code } => {
                if code != Some(0) {
                    warn!(exit_code = ?code, "agent exited non-zero; verifier decides the outcome");
                }
                self.advance(RunStatus::SandboxExited)?;
            }
        }

        self.advance(RunStatus::Verifying)?;
        let verdict = verify_outcome(
            &context.paths.workspace,
            &context.metadata,
            config.stuck_preview_lines,
        )
        .await;
        match verdict {
            Verdict::Stuck => {
                self.advance(RunStatus::Stuck)?;
                return Ok(Some(format!("agent wrote {STUCK_MARKER}")));
            }
            Verdict::Unverified => {
                self.advance(RunStatus::Unverified)?;
                return Ok(Some(format!(
                    "upstream {} is not an ancestor of {}",
                    context.metadata.upstream_sha, context.metadata.main_branch
                )));
            }
            Verdict::Verified => self.advance(RunStatus::Verified)?,
        }

        self.checkpoint("publish")?;
        self.advance(RunStatus::Publishing)?;
        match publish(&context.paths, &context.metadata, self.rewriter, cancel).await {
            Ok(report) => {
                self.advance(RunStatus::Published)?;
                let mut detail = if report.pushed {
                    format!("pushed {} with lease; backup tag {}", report.branch, report.plan.backup_tag)
                } else {
                    "branch already matched origin; nothing pushed".to_string()
                };
                if report.stash_conflict {
                    detail.push_str("; stash restore conflicted, stash kept");
                }
                self.publish = Some(report);
                Ok(Some(detail))
            }
            Err(err) if err.is_cancelled() => Err(anyhow::Error::new(Cancelled).context(err.to_string())),
            Err(err) => {
                self.advance(RunStatus::PublishFailed)?;
                Ok(Some(err.to_string()))
            }
        }
    }

    fn advance(&mut self, next: RunStatus) -> Result<()> {
        let from = self.machine.current();
        self.machine.advance(next)?;
        info!(from = ?from, to = ?next, "run state");
        Ok(())
    }

    /// Stop before `stage` if the operator has interrupted.
    fn checkpoint(&self, stage: &str) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Cancelled).with_context(|| format!("before {stage}"));
        }
        Ok(())
    }

    /// Move to `FAILED` or `CANCELLED` and return the detail.
    fn abort(&mut self, err: anyhow::Error) -> Option<String> {
        let status = if is_cancelled(&err) {
            RunStatus::Cancelled
        } else {
            RunStatus::Failed
        };
        let detail = format!("{err:#}");
        if status == RunStatus::Cancelled {
            warn!(detail = %detail, "run cancelled");
        } else {
            error!(detail = %detail, "run failed");
        }
        if let Err(advance_err) = self.advance(status) {
            error!(error = %advance_err, "cannot record abort state");
        }
        Some(detail)
    }

    fn finish(self, detail: Option<String>) -> RunReport {
        let status = self.machine.current();
        if let Some(context) = &self.context {
            if let Err(err) = record_outcome(&context.paths.metadata, status, detail.as_deref()) {
                warn!(error = %format!("{err:#}"), "failed to record final status in metadata");
            }
        }
        info!(
            status = ?status,
            outcome = status.outcome_label(),
            exit_code = status.exit_code().unwrap_or(exit_codes::FAILED),
            detail = detail.as_deref().unwrap_or(""),
            "run finished"
        );
        RunReport {
            run_id: self.run_id,
            status,
            history: self.machine.history().to_vec(),
            context: self.context,
            detail,
            publish: self.publish,
        }
    }
}

/// Six lowercase alphanumerics.
fn generate_run_id() -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(char::from)
        .collect::<String>()
        .to_ascii_lowercase()
}
