//! Authorship rewrite and lease-protected publish.
//!
//! Entered only for a verified workspace. Commits made under the fixed
//! sandbox identity are rewritten to the operator's identity, then the
//! branch is force-pushed to `origin` on the condition that the remote tip
//! still equals the baseline captured before the sandbox ran.
//!
//! Nothing the agent left behind is discarded: uncommitted files are
//! stashed first and restored last, and a local backup tag anchors the
//! pre-run fork tip.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::core::naming::{
    SANDBOX_EMAIL, STASH_MESSAGE, backup_tag_name, render_mailmap, sandbox_identity,
};
use crate::core::types::{Identity, RemoteUrls};
use crate::errors::{Cancelled, PublishError, PublishStep};
use crate::io::git::Git;
use crate::io::metadata::RunMetadata;
use crate::io::workspace::{RunPaths, short};

pub const MAILMAP_FILE: &str = "authorship.mailmap";

/// Inputs for one authorship rewrite.
#[derive(Debug, Clone)]
pub struct RewriteRequest<'a> {
    pub branch: &'a str,
    pub from: &'a Identity,
    pub to: &'a Identity,
    /// Host-side directory for temporary files; never inside the workspace.
    pub scratch_dir: &'a Path,
}

/// A tool that can rewrite commit identities on one branch.
#[allow(async_fn_in_trait)]
pub trait HistoryRewriter {
    /// Confirm the tool is installed; returns its version string.
    async fn ensure_available(&self, git: &Git) -> Result<String>;

    /// Map commits matching `request.from` onto `request.to`, on `request.branch` only.
    async fn rewrite(&self, git: &Git, request: &RewriteRequest<'_>) -> Result<()>;
}

/// `git filter-repo` with a mailmap.
#[derive(Debug, Clone, Copy, Default)]
pub struct FilterRepo;

const FILTER_REPO_HELP: &str = "git filter-repo is required to rewrite authorship. \
Install it with `pip install git-filter-repo`, `brew install git-filter-repo`, \
or `apt install git-filter-repo`, then re-run.";

fn filter_repo_missing(cause: &anyhow::Error) -> anyhow::Error {
    anyhow!("{FILTER_REPO_HELP} ({cause:#})")
}

impl HistoryRewriter for FilterRepo {
    async fn ensure_available(&self, git: &Git) -> Result<String> {
        let version = git
            .run_capture(&["filter-repo", "--version"])
            .await
            .map_err(|err| filter_repo_missing(&err))?;
        Ok(version.trim().to_string())
    }

    async fn rewrite(&self, git: &Git, request: &RewriteRequest<'_>) -> Result<()> {
        let mailmap = request.scratch_dir.join(MAILMAP_FILE);
        fs::write(&mailmap, render_mailmap(request.to, request.from))
            .with_context(|| format!("write mailmap {}", mailmap.display()))?;
        let mailmap_arg = mailmap.to_string_lossy().to_string();
        let refs = format!("refs/heads/{}", request.branch);

        let result = git
            .run_checked_with_env(
                &[
                    "filter-repo",
                    "--force",
                    "--mailmap",
                    &mailmap_arg,
                    "--refs",
                    &refs,
                ],
                &[],
            )
            .await;
        if let Err(err) = fs::remove_file(&mailmap) {
            warn!(path = %mailmap.display(), error = %err, "failed to remove mailmap");
        }
        result.map(|_| ())
    }
}

/// Safety nets computed for one publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewritePlan {
    /// Stash commit holding uncommitted workspace state, if any.
    pub stash_ref: Option<String>,
    pub backup_tag: String,
    pub lease_sha: String,
    pub rewritten_identity: Identity,
}

/// What the pipeline did.
#[derive(Debug, Clone)]
pub struct PublishReport {
    pub branch: String,
    /// `false` when the branch tip already equalled the baseline.
    pub pushed: bool,
    pub plan: RewritePlan,
    /// The stash could not be re-applied cleanly and is still on the stack.
    pub stash_conflict: bool,
    pub pr_hint: String,
}

trait AtStep<T> {
    fn at(self, step: PublishStep) -> Result<T, PublishError>;
}

impl<T> AtStep<T> for Result<T> {
    fn at(self, step: PublishStep) -> Result<T, PublishError> {
        self.map_err(|cause| {
            error!(step = %step, error = %format!("{cause:#}"), "publish step failed");
            PublishError::new(step, cause)
        })
    }
}

/// Rewrite authorship and push `main_branch` to `origin` under lease.
///
/// Failures name the step that failed. On failure the stash and any backup
/// tag are left in the workspace for manual recovery.
#[instrument(skip_all, fields(branch = %metadata.main_branch))]
pub async fn publish<H: HistoryRewriter>(
    paths: &RunPaths,
    metadata: &RunMetadata,
    rewriter: &H,
    cancel: &CancellationToken,
) -> Result<PublishReport, PublishError> {
    let branch = metadata.main_branch.as_str();
    let operator = &metadata.operator;
    let git = Git::new(&paths.workspace).with_cancel(cancel.clone());

    // 1. Snapshot uncommitted state.
    let stash_ref = snapshot(&git, operator).await.at(PublishStep::Stash)?;

    let tip = checkout_main(&git, branch).await.at(PublishStep::Checkout)?;
    let plan = RewritePlan {
        stash_ref,
        backup_tag: backup_tag_name(branch, &metadata.record.created_at),
        lease_sha: metadata.origin_baseline_sha.clone(),
        rewritten_identity: operator.clone(),
    };
    let pr_hint = format!("gh pr create --head {branch} --base {branch}");

    if tip == plan.lease_sha {
        info!(tip = %short(&tip), "branch tip equals origin baseline; nothing to publish");
        let stash_conflict = restore_snapshot(&git, &plan).await;
        return Ok(PublishReport {
            branch: branch.to_string(),
            pushed: false,
            plan,
            stash_conflict,
            pr_hint,
        });
    }

    // 2. Reattach remotes from metadata and refresh.
    reattach_remotes(&git, &metadata.remotes, true)
        .await
        .at(PublishStep::ReattachRemotes)?;

    // 3. Validate the rewriter.
    let version = rewriter
        .ensure_available(&git)
        .await
        .at(PublishStep::ValidateRewriteTool)?;
    debug!(version = %version, "history rewriter available");

    // 4. Rewrite sandbox-authored commits.
    let sandbox = sandbox_identity();
    let request = RewriteRequest {
        branch,
        from: &sandbox,
        to: operator,
        scratch_dir: &paths.run_dir,
    };
    rewrite_authorship(&git, rewriter, &request)
        .await
        .at(PublishStep::RewriteAuthorship)?;

    // History is rewritten from here on: remotes and the backup tag are
    // always written, even if cancellation arrives meanwhile.
    let anchor_git = Git::new(&paths.workspace);
    // The rewriter may drop remotes; no fetch needed this time.
    reattach_remotes(&anchor_git, &metadata.remotes, false)
        .await
        .at(PublishStep::ReattachRemotes)?;

    // 5. Local-only rollback anchor.
    anchor_git
        .tag_force(&plan.backup_tag, &plan.lease_sha)
        .await
        .with_context(|| format!("create backup tag {}", plan.backup_tag))
        .at(PublishStep::BackupTag)?;
    info!(tag = %plan.backup_tag, target = %short(&plan.lease_sha), "created backup tag");

    // 6. Lease-protected push. Never started once cancellation is observed,
    // never interrupted once started.
    if cancel.is_cancelled() {
        return Err::<PublishReport, _>(Cancelled)
            .context("push not started")
            .at(PublishStep::Push);
    }
    let output = anchor_git
        .push_with_lease("origin", branch, &plan.lease_sha)
        .await
        .context("force-with-lease push rejected or failed; the fork moved or is unreachable")
        .at(PublishStep::Push)?;
    info!(output = %output, lease = %short(&plan.lease_sha), "pushed with lease");
    info!(hint = %pr_hint, "open a pull request if the fork publishes via PRs");

    // 7. Restore the snapshot.
    let stash_conflict = restore_snapshot(&anchor_git, &plan).await;

    Ok(PublishReport {
        branch: branch.to_string(),
        pushed: true,
        plan,
        stash_conflict,
        pr_hint,
    })
}

/// Configure the operator identity locally and stash anything uncommitted.
async fn snapshot(git: &Git, operator: &Identity) -> Result<Option<String>> {
    git.config_set("user.name", &operator.name).await?;
    git.config_set("user.email", &operator.email).await?;

    let status = git.status_porcelain().await?;
    if status.is_empty() {
        debug!("workspace clean; no stash needed");
        return Ok(None);
    }
    info!(entries = status.len(), "stashing uncommitted workspace state");
    git.stash_push_all(STASH_MESSAGE).await?;
    let stash = git.rev_parse("refs/stash").await.context("resolve stash")?;
    Ok(Some(stash))
}

async fn checkout_main(git: &Git, branch: &str) -> Result<String> {
    let current = git.current_branch().await.ok();
    if current.as_deref() != Some(branch) {
        info!(from = ?current, "checking out main branch");
        git.checkout_branch(branch).await?;
    }
    git.rev_parse(&format!("refs/heads/{branch}"))
        .await
        .with_context(|| format!("resolve local {branch}"))
}

async fn reattach_remotes(git: &Git, remotes: &RemoteUrls, fetch: bool) -> Result<()> {
    git.ensure_remote("origin", &remotes.origin).await?;
    git.ensure_remote("upstream", &remotes.upstream).await?;
    if fetch {
        for remote in ["origin", "upstream"] {
            git.fetch(remote)
                .await
                .with_context(|| format!("fetch {remote}"))?;
        }
        info!("remotes reattached and fetched");
    }
    Ok(())
}

async fn rewrite_authorship<H: HistoryRewriter>(
    git: &Git,
    rewriter: &H,
    request: &RewriteRequest<'_>,
) -> Result<()> {
    info!(from = %request.from, to = %request.to, "rewriting sandbox authorship");
    rewriter.rewrite(git, request).await?;

    let tip = format!("refs/heads/{}", request.branch);
    let residual: Vec<String> = git
        .commit_identities(&tip)
        .await?
        .into_iter()
        .filter(|commit| commit.author_email == SANDBOX_EMAIL || commit.committer_email == SANDBOX_EMAIL)
        .map(|commit| commit.sha)
        .collect();
    if !residual.is_empty() {
        return Err(anyhow!(
            "{} commit(s) still carry the sandbox identity after rewrite (first: {})",
            residual.len(),
            short(&residual[0])
        ));
    }
    Ok(())
}

/// Re-apply the stash. Returns `true` when it conflicted and was kept.
async fn restore_snapshot(git: &Git, plan: &RewritePlan) -> bool {
    let Some(stash) = &plan.stash_ref else {
        return false;
    };
    match git.stash_pop().await {
        Ok(_) => {
            info!(stash = %short(stash), "restored stashed workspace state");
            false
        }
        Err(err) => {
            warn!(
                stash = %short(stash),
                error = %format!("{err:#}"),
                "STASH RESTORE CONFLICTED: publish succeeded but the stash was kept; resolve it by hand in the workspace"
            );
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_errors_carry_the_step() {
        let err = Err::<(), _>(anyhow!("lease rejected"))
            .at(PublishStep::Push)
            .unwrap_err();
        assert_eq!(err.step, PublishStep::Push);
        assert!(err.to_string().contains("`push`"));
    }

    #[test]
    fn missing_tool_message_carries_install_help_and_cause() {
        let err = filter_repo_missing(&anyhow!("git: 'filter-repo' is not a git command"));
        let message = err.to_string();
        assert!(message.starts_with("git filter-repo is required"), "{message}");
        assert!(message.contains("pip install git-filter-repo"));
        assert!(message.contains("brew install git-filter-repo"));
        assert!(message.ends_with("(git: 'filter-repo' is not a git command)"), "{message}");
    }

    #[tokio::test]
    async fn unusable_git_reports_install_help() {
        let temp = tempfile::tempdir().expect("tempdir");
        // git cannot start in a missing directory, so the version check always fails.
        let git = Git::new(temp.path().join("missing"));
        let err = FilterRepo.ensure_available(&git).await.unwrap_err();
        assert!(err.to_string().contains("pip install git-filter-repo"), "{err:#}");
    }
}
