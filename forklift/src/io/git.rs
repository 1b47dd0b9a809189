//! Git adapter for forklift.
//!
//! Every history-sensitive operation goes through this small wrapper around
//! `git` subprocess calls so that each call is logged, cancelable, and scoped
//! to exactly one working directory.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};

use anyhow::{Context, Result, anyhow};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::errors::Cancelled;

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    /// Path for the changed file.
    pub path: String,
}

/// Author and committer emails of one commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitIdentity {
    pub sha: String,
    pub author_email: String,
    pub committer_email: String,
}

/// Wrapper for executing git commands in a working directory.
///
/// When a cancellation token is attached, any in-flight command is killed as
/// soon as the token fires and the call fails with [`Cancelled`].
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
    cancel: Option<CancellationToken>,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            cancel: None,
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Fail unless the workdir is inside a git repository.
    pub async fn ensure_repository(&self) -> Result<()> {
        self.run_checked(&["rev-parse", "--git-dir"]).await?;
        Ok(())
    }

    /// Read a config value; `None` when the key is unset.
    pub async fn config_get(&self, key: &str) -> Result<Option<String>> {
        let output = self.run(&["config", "--get", key]).await?;
        match output.status.code() {
            Some(0) => Ok(Some(String::from_utf8_lossy(&output.stdout).trim().to_string())),
            Some(1) => Ok(None),
            _ => Err(failure(&["config", "--get", key], &output)),
        }
    }

    /// Set a repository-local config value.
    pub async fn config_set(&self, key: &str, value: &str) -> Result<()> {
        self.run_checked(&["config", key, value]).await?;
        Ok(())
    }

    /// Fetch URL of every configured remote (first URL wins).
    pub async fn remotes(&self) -> Result<BTreeMap<String, String>> {
        let out = self.run_capture(&["remote", "-v"]).await?;
        Ok(parse_remote_lines(&out))
    }

    /// Names of every configured remote.
    pub async fn remote_names(&self) -> Result<Vec<String>> {
        let out = self.run_capture(&["remote"]).await?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    pub async fn remove_remote(&self, name: &str) -> Result<()> {
        self.run_checked(&["remote", "remove", name]).await?;
        Ok(())
    }

    /// Add `name` pointing at `url`, or repoint it if it already exists.
    #[instrument(skip_all, fields(remote = name))]
    pub async fn ensure_remote(&self, name: &str, url: &str) -> Result<()> {
        let current = self.run(&["remote", "get-url", name]).await?;
        if !current.status.success() {
            debug!(url, "adding remote");
            self.run_checked(&["remote", "add", name, url]).await?;
            return Ok(());
        }
        let current_url = String::from_utf8_lossy(&current.stdout).trim().to_string();
        if current_url != url {
            debug!(url, was = %current_url, "updating remote url");
            self.run_checked(&["remote", "set-url", name, url]).await?;
        }
        Ok(())
    }

    /// `git fetch <remote> --prune`, returning git's progress output.
    #[instrument(skip_all, fields(remote))]
    pub async fn fetch(&self, remote: &str) -> Result<String> {
        debug!("fetching remote");
        let output = self.run_checked(&["fetch", remote, "--prune"]).await?;
        Ok(combined_output(&output))
    }

    /// Resolve `rev` to a full commit SHA.
    pub async fn rev_parse(&self, rev: &str) -> Result<String> {
        let spec = format!("{rev}^{{commit}}");
        let out = self.run_capture(&["rev-parse", "--verify", "--quiet", &spec]).await?;
        Ok(out.trim().to_string())
    }

    /// Return the current branch name (errors on detached HEAD).
    #[instrument(skip_all)]
    pub async fn current_branch(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--abbrev-ref", "HEAD"]).await?;
        let name = out.trim().to_string();
        if name == "HEAD" {
            warn!("detached HEAD detected");
            return Err(anyhow!("detached HEAD in {}", self.workdir.display()));
        }
        debug!(branch = %name, "current branch");
        Ok(name)
    }

    /// Create or reset `branch` at `start_point` and check it out.
    #[instrument(skip_all, fields(branch))]
    pub async fn checkout_reset(&self, branch: &str, start_point: &str) -> Result<()> {
        debug!(start_point, "checking out branch");
        self.run_checked(&["checkout", "-B", branch, start_point]).await?;
        Ok(())
    }

    /// Checkout an existing branch.
    #[instrument(skip_all, fields(branch))]
    pub async fn checkout_branch(&self, branch: &str) -> Result<()> {
        debug!("checking out branch");
        self.run_checked(&["checkout", branch]).await?;
        Ok(())
    }

    /// Get status entries (including untracked) in porcelain format.
    pub async fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"]).await?;
        let mut entries = Vec::new();
        for line in out.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_status_line(line)?);
        }
        Ok(entries)
    }

    /// `git merge-base --is-ancestor`: `Ok(false)` only for a definite "no".
    pub async fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool> {
        let args = ["merge-base", "--is-ancestor", ancestor, descendant];
        let output = self.run(&args).await?;
        match output.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(failure(&args, &output)),
        }
    }

    /// Point `refname` at `sha`, creating it if needed.
    pub async fn update_ref(&self, refname: &str, sha: &str) -> Result<()> {
        self.run_checked(&["update-ref", refname, sha]).await?;
        Ok(())
    }

    /// Stash tracked and untracked changes under `message`.
    pub async fn stash_push_all(&self, message: &str) -> Result<()> {
        self.run_checked(&["stash", "push", "--include-untracked", "-m", message])
            .await?;
        Ok(())
    }

    /// Re-apply and drop the top stash entry. Git keeps the entry on conflict.
    pub async fn stash_pop(&self) -> Result<String> {
        let output = self.run_checked(&["stash", "pop"]).await?;
        Ok(combined_output(&output))
    }

    /// Create or move a lightweight tag.
    pub async fn tag_force(&self, name: &str, target: &str) -> Result<()> {
        self.run_checked(&["tag", "-f", name, target]).await?;
        Ok(())
    }

    /// Force-push `branch` to `remote`, but only if the remote tip is still `expected`.
    #[instrument(skip_all, fields(remote, branch))]
    pub async fn push_with_lease(&self, remote: &str, branch: &str, expected: &str) -> Result<String> {
        let refspec = format!("{branch}:{branch}");
        let lease = format!("--force-with-lease={branch}:{expected}");
        debug!(expected, "pushing with lease");
        let output = self.run_checked(&["push", remote, &refspec, &lease]).await?;
        Ok(combined_output(&output))
    }

    /// Author/committer emails for every commit reachable from `rev`.
    pub async fn commit_identities(&self, rev: &str) -> Result<Vec<CommitIdentity>> {
        let out = self
            .run_capture(&["log", "--format=%H%x00%ae%x00%ce", rev])
            .await?;
        out.lines()
            .filter(|line| !line.trim().is_empty())
            .map(parse_identity_line)
            .collect()
    }

    /// Run an arbitrary git command, failing on non-zero exit.
    pub async fn run_checked_with_env(&self, args: &[&str], env: &[(&str, &str)]) -> Result<Output> {
        let output = self.spawn(args, env).await?;
        if !output.status.success() {
            return Err(failure(args, &output));
        }
        Ok(output)
    }

    pub async fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args).await?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn run_checked(&self, args: &[&str]) -> Result<Output> {
        self.run_checked_with_env(args, &[]).await
    }

    async fn run(&self, args: &[&str]) -> Result<Output> {
        self.spawn(args, &[]).await
    }

    async fn spawn(&self, args: &[&str], env: &[(&str, &str)]) -> Result<Output> {
        debug!(command = %format!("git {}", args.join(" ")), "running git");
        let mut cmd = Command::new("git");
        cmd.args(args)
            .current_dir(&self.workdir)
            .envs(env.iter().copied())
            .stdin(Stdio::null())
            .kill_on_drop(true);
        let output = cmd.output();
        let result = match &self.cancel {
            Some(cancel) => {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        warn!(command = %args.join(" "), "git command cancelled");
                        return Err(Cancelled).with_context(|| format!("git {}", args.join(" ")));
                    }
                    result = output => result,
                }
            }
            None => output.await,
        };
        result.with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

/// `git clone --no-hardlinks`: a full, independent copy of `source`.
#[instrument(skip_all, fields(source = %source.display(), destination = %destination.display()))]
pub async fn clone_isolated(
    source: &Path,
    destination: &Path,
    cancel: Option<&CancellationToken>,
) -> Result<()> {
    if destination.exists() {
        return Err(anyhow!("clone destination {} already exists", destination.display()));
    }
    let parent = destination
        .parent()
        .with_context(|| format!("clone destination missing parent {}", destination.display()))?;
    let source_arg = source.to_string_lossy();
    let destination_arg = destination.to_string_lossy();
    let mut git = Git::new(parent);
    if let Some(cancel) = cancel {
        git = git.with_cancel(cancel.clone());
    }
    git.run_checked(&[
        "clone",
        "--no-hardlinks",
        "--quiet",
        "--",
        &source_arg,
        &destination_arg,
    ])
    .await
    .with_context(|| format!("clone {} -> {}", source.display(), destination.display()))?;
    Ok(())
}

fn combined_output(output: &Output) -> String {
    let mut text = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stderr = stderr.trim();
    if !stderr.is_empty() {
        if !text.is_empty() {
            text.push('\n');
        }
        text.push_str(stderr);
    }
    text
}

fn failure(args: &[&str], output: &Output) -> anyhow::Error {
    anyhow!(
        "git {} failed ({}): {}",
        args.join(" "),
        output
            .status
            .code()
            .map_or_else(|| "signal".to_string(), |c| format!("exit {c}")),
        combined_output(output)
    )
}

/// Parse `git remote -v` into `name -> fetch url`.
pub fn parse_remote_lines(raw: &str) -> BTreeMap<String, String> {
    let mut remotes = BTreeMap::new();
    for line in raw.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let [name, url, kind, ..] = parts.as_slice() else {
            continue;
        };
        if *kind != "(fetch)" || remotes.contains_key(*name) {
            continue;
        }
        remotes.insert((*name).to_string(), (*url).to_string());
    }
    remotes
}

fn parse_identity_line(line: &str) -> Result<CommitIdentity> {
    let mut parts = line.split('\0');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(sha), Some(author), Some(committer)) => Ok(CommitIdentity {
            sha: sha.to_string(),
            author_email: author.to_string(),
            committer_email: committer.to_string(),
        }),
        _ => Err(anyhow!("unexpected log line: '{line}'")),
    }
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry { code, path })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_untracked_line() {
        let e = parse_status_line("?? DONE.md").expect("parse");
        assert_eq!(
            e,
            StatusEntry {
                code: "??".to_string(),
                path: "DONE.md".to_string()
            }
        );
    }

    #[test]
    fn parses_rename_line_uses_new_path() {
        let e = parse_status_line("R  old.txt -> new.txt").expect("parse");
        assert_eq!(e.path, "new.txt");
    }

    #[test]
    fn remote_lines_keep_first_fetch_url() {
        let raw = "origin\tgit@github.com:me/fork.git (fetch)\n\
                   origin\tgit@github.com:me/fork.git (push)\n\
                   upstream\thttps://github.com/them/proj.git (fetch)\n\
                   upstream\tno_push (push)\n\
                   broken\n";
        let remotes = parse_remote_lines(raw);
        assert_eq!(remotes.len(), 2);
        assert_eq!(remotes["origin"], "git@github.com:me/fork.git");
        assert_eq!(remotes["upstream"], "https://github.com/them/proj.git");
    }

    #[test]
    fn identity_line_splits_on_nul() {
        let parsed = parse_identity_line("abc\0a@x\0c@y").expect("parse");
        assert_eq!(parsed.author_email, "a@x");
        assert_eq!(parsed.committer_email, "c@y");
        assert!(parse_identity_line("abc").is_err());
    }

    #[tokio::test]
    async fn cancelled_token_aborts_git() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let git = Git::new(temp.path()).with_cancel(cancel);
        let err = git.run_capture(&["--version"]).await.unwrap_err();
        assert!(crate::errors::is_cancelled(&err));
    }
}
