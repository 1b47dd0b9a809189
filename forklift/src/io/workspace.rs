//! Run workspace preparation.
//!
//! Each run gets `<runs_root>/<project>_<timestamp>/` containing:
//!
//! - `workspace/`: an independent clone of the source repository with every
//!   remote stripped, handed read-write to the sandbox.
//! - `harness-state/`: scratch space for the agent harness and sandbox logs.
//! - `metadata.json`: written last; its presence marks the run as ready.
//!
//! Fetching happens inside the fresh clone rather than the source repository,
//! so the operator's refs are never touched.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

use crate::core::naming::{UPSTREAM_PIN_REF, run_dir_name};
use crate::errors::GuardError;
use crate::io::git::{Git, clone_isolated};
use crate::io::guard::GuardReport;
use crate::io::metadata::{METADATA_FILE, RunMetadata, RunRecord, write_metadata};

/// Filesystem layout of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPaths {
    pub run_dir: PathBuf,
    pub workspace: PathBuf,
    pub harness_state: PathBuf,
    pub metadata: PathBuf,
}

impl RunPaths {
    pub fn new(run_dir: impl Into<PathBuf>) -> Self {
        let run_dir = run_dir.into();
        Self {
            workspace: run_dir.join("workspace"),
            harness_state: run_dir.join("harness-state"),
            metadata: run_dir.join(METADATA_FILE),
            run_dir,
        }
    }
}

/// Numeric owner applied to the sandbox mounts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ownership {
    pub uid: u32,
    pub gid: u32,
}

/// Inputs for [`prepare_workspace`].
#[derive(Debug, Clone)]
pub struct WorkspaceRequest<'a> {
    pub source_repo: &'a Path,
    pub guard: &'a GuardReport,
    pub main_branch: &'a str,
    pub runs_root: &'a Path,
    /// `%Y%m%d_%H%M%S`; two runs with the same timestamp collide loudly.
    pub timestamp: &'a str,
    pub run_id: &'a str,
    pub fork_context_file: &'a str,
    pub sandbox_owner: Ownership,
}

/// Allocate a run directory and build a remote-less workspace in it.
///
/// On any failure (including cancellation) the run directory is removed, so a
/// surviving run directory always has complete metadata.
#[instrument(skip_all, fields(source = %request.source_repo.display()))]
pub async fn prepare_workspace(
    request: &WorkspaceRequest<'_>,
    cancel: &CancellationToken,
) -> Result<(RunPaths, RunMetadata)> {
    let project = project_name(request.source_repo)?;
    fs::create_dir_all(request.runs_root)
        .with_context(|| format!("create runs root {}", request.runs_root.display()))?;
    let paths = RunPaths::new(
        request
            .runs_root
            .join(run_dir_name(&project, request.timestamp)),
    );
    match fs::create_dir(&paths.run_dir) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::AlreadyExists => {
            return Err(anyhow!(
                "run directory {} already exists; refusing to overwrite",
                paths.run_dir.display()
            ));
        }
        Err(err) => {
            return Err(err)
                .with_context(|| format!("create run directory {}", paths.run_dir.display()));
        }
    }
    info!(run_dir = %paths.run_dir.display(), "created run directory");

    match populate(request, &project, &paths, cancel).await {
        Ok(metadata) => Ok((paths, metadata)),
        Err(err) => {
            discard_run_dir(&paths.run_dir);
            Err(err)
        }
    }
}

async fn populate(
    request: &WorkspaceRequest<'_>,
    project: &str,
    paths: &RunPaths,
    cancel: &CancellationToken,
) -> Result<RunMetadata> {
    let branch = request.main_branch;
    let remotes = &request.guard.remotes;

    clone_isolated(request.source_repo, &paths.workspace, Some(cancel)).await?;
    let git = Git::new(&paths.workspace).with_cancel(cancel.clone());

    // The clone's `origin` is the source repo, so this is the operator's local branch.
    let local_tip = git
        .rev_parse(&format!("refs/remotes/origin/{branch}"))
        .await
        .with_context(|| format!("source repository has no local branch '{branch}'"))?;
    git.checkout_reset(branch, &local_tip).await?;

    git.ensure_remote("origin", &remotes.origin).await?;
    git.ensure_remote("upstream", &remotes.upstream).await?;
    for remote in ["origin", "upstream"] {
        let output = git
            .fetch(remote)
            .await
            .with_context(|| format!("fetch {remote}"))?;
        if output.is_empty() {
            info!(remote, "fetch: up to date");
        } else {
            info!(remote, output = %output, "fetch complete");
        }
    }

    let upstream_sha = git
        .rev_parse(&format!("refs/remotes/upstream/{branch}"))
        .await
        .with_context(|| format!("resolve upstream/{branch}"))?;
    let origin_baseline_sha = git
        .rev_parse(&format!("refs/remotes/origin/{branch}"))
        .await
        .with_context(|| format!("resolve origin/{branch}"))?;
    // The lease only protects against pushes made during the run, so the
    // starting point must already contain everything on the fork.
    let contains_origin = git
        .is_ancestor(&origin_baseline_sha, &local_tip)
        .await
        .with_context(|| format!("compare local {branch} with origin/{branch}"))?;
    if !contains_origin {
        warn!(
            local = %short(&local_tip),
            origin = %short(&origin_baseline_sha),
            "local branch is missing commits from the fork"
        );
        return Err(GuardError::BranchBehindOrigin {
            branch: branch.to_string(),
        }
        .into());
    }
    git.update_ref(UPSTREAM_PIN_REF, &upstream_sha).await?;
    info!(
        upstream = %short(&upstream_sha),
        origin = %short(&origin_baseline_sha),
        "captured lease baseline"
    );

    strip_remotes(&git).await?;
    copy_fork_context(request.source_repo, &paths.workspace, request.fork_context_file)?;

    fs::create_dir_all(&paths.harness_state)
        .with_context(|| format!("create {}", paths.harness_state.display()))?;
    align_ownership(&[&paths.workspace, &paths.harness_state], request.sandbox_owner)?;

    let metadata = RunMetadata {
        record: RunRecord {
            run_id: request.run_id.to_string(),
            created_at: request.timestamp.to_string(),
            project_name: project.to_string(),
            source_repo: request.source_repo.display().to_string(),
            status: None,
        },
        operator: request.guard.operator.clone(),
        main_branch: branch.to_string(),
        upstream_sha,
        origin_baseline_sha,
        remotes: remotes.clone(),
        finished_at: None,
        detail: None,
    };
    if cancel.is_cancelled() {
        return Err(crate::errors::Cancelled).context("prepare workspace");
    }
    write_metadata(&paths.metadata, &metadata)?;
    Ok(metadata)
}

/// Remove every remote from the workspace and confirm none remain.
pub async fn strip_remotes(git: &Git) -> Result<()> {
    for remote in git.remote_names().await? {
        debug!(remote = %remote, "removing remote");
        git.remove_remote(&remote).await?;
    }
    let remaining = git.remote_names().await?;
    if !remaining.is_empty() {
        return Err(anyhow!(
            "workspace still has remotes after stripping: {}",
            remaining.join(", ")
        ));
    }
    info!(workspace = %git.workdir().display(), "all remotes removed");
    Ok(())
}

/// Copy the optional fork-context file verbatim. Absence is not an error.
pub fn copy_fork_context(source_repo: &Path, workspace: &Path, file_name: &str) -> Result<bool> {
    let source = source_repo.join(file_name);
    if !source.is_file() {
        debug!(path = %source.display(), "no fork context file");
        return Ok(false);
    }
    let destination = workspace.join(file_name);
    fs::copy(&source, &destination).with_context(|| {
        format!("copy {} -> {}", source.display(), destination.display())
    })?;
    debug!(path = %destination.display(), "copied fork context");
    Ok(true)
}

/// Owner of `path` as numeric ids.
pub fn owner_of(path: &Path) -> Result<Ownership> {
    use std::os::unix::fs::MetadataExt;

    let meta = fs::symlink_metadata(path).with_context(|| format!("stat {}", path.display()))?;
    Ok(Ownership {
        uid: meta.uid(),
        gid: meta.gid(),
    })
}

/// Recursively chown `roots` to `owner` without following symlinks.
pub fn align_ownership(roots: &[&Path], owner: Ownership) -> Result<()> {
    info!(uid = owner.uid, gid = owner.gid, "aligning sandbox mount ownership");
    for root in roots {
        chown_tree(root, owner)?;
    }
    Ok(())
}

/// Hand the sandbox mounts back to the owner of the run directory.
///
/// Best-effort: failures are logged and the run continues.
pub fn restore_ownership(paths: &RunPaths) {
    let owner = match owner_of(&paths.run_dir) {
        Ok(owner) => owner,
        Err(err) => {
            warn!(error = %format!("{err:#}"), "cannot stat run directory; ownership unchanged");
            return;
        }
    };
    for root in [&paths.workspace, &paths.harness_state] {
        if !root.exists() {
            continue;
        }
        if let Err(err) = chown_tree(root, owner) {
            warn!(path = %root.display(), error = %format!("{err:#}"), "unable to restore ownership");
        }
    }
}

fn chown_tree(root: &Path, owner: Ownership) -> Result<()> {
    use std::os::unix::fs::{MetadataExt, lchown};

    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.with_context(|| format!("walk {}", root.display()))?;
        let meta = entry
            .metadata()
            .with_context(|| format!("stat {}", entry.path().display()))?;
        if meta.uid() == owner.uid && meta.gid() == owner.gid {
            continue;
        }
        lchown(entry.path(), Some(owner.uid), Some(owner.gid)).with_context(|| {
            format!(
                "set ownership {}:{} on {}",
                owner.uid,
                owner.gid,
                entry.path().display()
            )
        })?;
    }
    Ok(())
}

fn project_name(source_repo: &Path) -> Result<String> {
    source_repo
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .filter(|name| !name.is_empty())
        .with_context(|| format!("cannot derive project name from {}", source_repo.display()))
}

fn discard_run_dir(run_dir: &Path) {
    match fs::remove_dir_all(run_dir) {
        Ok(()) => warn!(run_dir = %run_dir.display(), "removed incomplete run directory"),
        Err(err) => warn!(
            run_dir = %run_dir.display(),
            error = %err,
            "failed to remove incomplete run directory"
        ),
    }
}

pub(crate) fn short(sha: &str) -> &str {
    sha.get(..12).unwrap_or(sha)
}
