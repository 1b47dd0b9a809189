//! Test-only fixtures: real git forks in temp dirs, a scripted sandbox, and a
//! history rewriter that needs nothing beyond stock git.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command as StdCommand;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Result;
use tempfile::TempDir;
use tokio::process::Command;

use crate::core::naming::{SANDBOX_EMAIL, SANDBOX_NAME};
use crate::core::types::Identity;
use crate::io::config::ForkliftConfig;
use crate::io::git::Git;
use crate::io::publish::{HistoryRewriter, RewriteRequest};
use crate::io::sandbox::{ContainerRuntime, LaunchSpec};
use crate::io::workspace::owner_of;
use crate::run::RunRequest;

pub const OPERATOR_NAME: &str = "Ada Lovelace";
pub const OPERATOR_EMAIL: &str = "ada@example.com";
pub const HUMAN_NAME: &str = "Grace Hopper";
pub const HUMAN_EMAIL: &str = "grace@example.com";

/// Run git in `dir` with an isolated config and the human identity; panics on failure.
pub fn git(dir: &Path, args: &[&str]) -> String {
    let output = StdCommand::new("git")
        .args(args)
        .current_dir(dir)
        .env("GIT_CONFIG_GLOBAL", "/dev/null")
        .env("GIT_CONFIG_NOSYSTEM", "1")
        .env("GIT_AUTHOR_NAME", HUMAN_NAME)
        .env("GIT_AUTHOR_EMAIL", HUMAN_EMAIL)
        .env("GIT_COMMITTER_NAME", HUMAN_NAME)
        .env("GIT_COMMITTER_EMAIL", HUMAN_EMAIL)
        .output()
        .expect("spawn git");
    assert!(
        output.status.success(),
        "git {args:?} in {} failed: {}",
        dir.display(),
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// Write `file`, commit it, return the new HEAD.
pub fn commit_file(dir: &Path, file: &str, contents: &str) -> String {
    fs::write(dir.join(file), contents).expect("write file");
    git(dir, &["add", file]);
    git(dir, &["commit", "--quiet", "-m", &format!("add {file}")]);
    git(dir, &["rev-parse", "HEAD"])
}

/// An upstream project, a fork of it, and the operator's clone of the fork.
///
/// ```text
/// root/
///   upstream.git   bare, the project being tracked
///   origin.git     bare, the operator's fork
///   fork/          operator clone: remotes origin + upstream, identity set
///   runs/          runs root
/// ```
pub struct TestFork {
    _temp: TempDir,
    pub root: PathBuf,
    pub upstream: PathBuf,
    pub origin: PathBuf,
    pub repo: PathBuf,
    pub runs_root: PathBuf,
    scratch: AtomicUsize,
}

impl TestFork {
    pub fn new() -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path().to_path_buf();
        let upstream = root.join("upstream.git");
        let origin = root.join("origin.git");
        let repo = root.join("fork");
        let runs_root = root.join("runs");

        for bare in [&upstream, &origin] {
            git(&root, &["init", "--quiet", "--bare", "--initial-branch=main", &path_arg(bare)]);
        }

        let seed = root.join("seed");
        fs::create_dir_all(&seed).expect("seed dir");
        git(&seed, &["init", "--quiet", "--initial-branch=main"]);
        commit_file(&seed, "README.md", "project\n");
        git(&seed, &["push", "--quiet", &path_arg(&upstream), "main"]);
        git(&seed, &["push", "--quiet", &path_arg(&origin), "main"]);

        git(&root, &["clone", "--quiet", &path_arg(&origin), &path_arg(&repo)]);
        git(&repo, &["remote", "add", "upstream", &path_arg(&upstream)]);
        git(&repo, &["config", "user.name", OPERATOR_NAME]);
        git(&repo, &["config", "user.email", OPERATOR_EMAIL]);

        Self {
            _temp: temp,
            root,
            upstream,
            origin,
            repo,
            runs_root,
            scratch: AtomicUsize::new(0),
        }
    }

    pub fn operator(&self) -> Identity {
        Identity::new(OPERATOR_NAME, OPERATOR_EMAIL)
    }

    /// A human lands a commit on upstream `main`.
    pub fn upstream_commit(&self, file: &str) -> String {
        self.push_from_scratch(&self.upstream, file)
    }

    /// A human pushes directly to the fork, bypassing forklift.
    pub fn origin_commit(&self, file: &str) -> String {
        self.push_from_scratch(&self.origin, file)
    }

    /// The operator commits fork-only work and pushes it to origin.
    pub fn fork_commit(&self, file: &str) -> String {
        let sha = commit_file(&self.repo, file, &format!("{file}\n"));
        git(&self.repo, &["push", "--quiet", "origin", "main"]);
        sha
    }

    /// A clone of origin with one unpushed commit; `git push` from it races a run.
    pub fn pending_origin_push(&self, file: &str) -> (PathBuf, String) {
        let dir = self.scratch_dir();
        git(&self.root, &["clone", "--quiet", &path_arg(&self.origin), &path_arg(&dir)]);
        let sha = commit_file(&dir, file, &format!("{file}\n"));
        (dir, sha)
    }

    /// Tip of `main` in a bare remote.
    pub fn tip(&self, bare: &Path) -> String {
        git(bare, &["rev-parse", "refs/heads/main"])
    }

    /// Refs, HEAD, status and config of the operator repo, for byte comparison.
    pub fn source_snapshot(&self) -> String {
        let refs = git(&self.repo, &["for-each-ref", "--format=%(refname) %(objectname)"]);
        let head = git(&self.repo, &["rev-parse", "HEAD"]);
        let status = git(&self.repo, &["status", "--porcelain=v1", "-uall"]);
        let config = fs::read_to_string(self.repo.join(".git/config")).expect("read config");
        format!("{refs}\n--\n{head}\n--\n{status}\n--\n{config}")
    }

    /// Config tuned for tests: short budgets, mounts owned by the current user.
    pub fn config(&self) -> ForkliftConfig {
        let owner = owner_of(&self.root).expect("owner of temp dir");
        let mut config = ForkliftConfig {
            runs_root: Some(self.runs_root.clone()),
            ..ForkliftConfig::default()
        };
        config.sandbox.timeout_secs = 30;
        config.sandbox.grace_secs = 1;
        config.sandbox.uid = owner.uid;
        config.sandbox.gid = owner.gid;
        config
    }

    pub fn request(&self, config: ForkliftConfig) -> RunRequest {
        RunRequest {
            source_repo: self.repo.clone(),
            config,
            host_tz: None,
        }
    }

    fn push_from_scratch(&self, bare: &Path, file: &str) -> String {
        let dir = self.scratch_dir();
        git(&self.root, &["clone", "--quiet", &path_arg(bare), &path_arg(&dir)]);
        let sha = commit_file(&dir, file, &format!("{file}\n"));
        git(&dir, &["push", "--quiet", "origin", "main"]);
        sha
    }

    fn scratch_dir(&self) -> PathBuf {
        let n = self.scratch.fetch_add(1, Ordering::SeqCst);
        self.root.join(format!("scratch-{n}"))
    }
}

impl Default for TestFork {
    fn default() -> Self {
        Self::new()
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

/// Stands in for the container: runs a shell script in the workspace.
///
/// The script sees `$WORKSPACE`, `$HARNESS_STATE`, the launch env, and commits
/// as the sandbox identity. Stop requests are recorded but ignored, so a
/// long-running script exercises the forced-kill path.
pub struct ScriptedRuntime {
    script: String,
    launches: Mutex<Vec<LaunchSpec>>,
    stop_requests: AtomicUsize,
    force_stops: AtomicUsize,
}

impl ScriptedRuntime {
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            launches: Mutex::new(Vec::new()),
            stop_requests: AtomicUsize::new(0),
            force_stops: AtomicUsize::new(0),
        }
    }

    pub fn launches(&self) -> Vec<LaunchSpec> {
        self.launches.lock().expect("launches lock").clone()
    }

    pub fn stop_requests(&self) -> usize {
        self.stop_requests.load(Ordering::SeqCst)
    }

    pub fn force_stops(&self) -> usize {
        self.force_stops.load(Ordering::SeqCst)
    }
}

impl ContainerRuntime for ScriptedRuntime {
    fn command(&self, spec: &LaunchSpec) -> Command {
        self.launches
            .lock()
            .expect("launches lock")
            .push(spec.clone());
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&self.script)
            .current_dir(&spec.workspace)
            .envs(&spec.env)
            .env("WORKSPACE", &spec.workspace)
            .env("HARNESS_STATE", &spec.harness_state)
            .env("GIT_CONFIG_GLOBAL", "/dev/null")
            .env("GIT_CONFIG_NOSYSTEM", "1")
            .env("GIT_AUTHOR_NAME", SANDBOX_NAME)
            .env("GIT_AUTHOR_EMAIL", SANDBOX_EMAIL)
            .env("GIT_COMMITTER_NAME", SANDBOX_NAME)
            .env("GIT_COMMITTER_EMAIL", SANDBOX_EMAIL);
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

/// Rewrites identities with `git filter-branch --env-filter`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FilterBranchRewriter;

impl HistoryRewriter for FilterBranchRewriter {
    async fn ensure_available(&self, git: &Git) -> Result<String> {
        let version = git.run_capture(&["--version"]).await?;
        Ok(version.trim().to_string())
    }

    async fn rewrite(&self, git: &Git, request: &RewriteRequest<'_>) -> Result<()> {
        let script = env_filter(request.from, request.to);
        let refs = format!("refs/heads/{}", request.branch);
        git.run_checked_with_env(
            &["filter-branch", "-f", "--env-filter", &script, "--", &refs],
            &[("FILTER_BRANCH_SQUELCH_WARNING", "1")],
        )
        .await?;
        Ok(())
    }
}

fn env_filter(from: &Identity, to: &Identity) -> String {
    let mut script = String::new();
    for role in ["AUTHOR", "COMMITTER"] {
        script.push_str(&format!(
            "if [ \"$GIT_{role}_EMAIL\" = {from} ]; then \
             GIT_{role}_NAME={name}; GIT_{role}_EMAIL={email}; \
             export GIT_{role}_NAME GIT_{role}_EMAIL; fi\n",
            from = sh_quote(&from.email),
            name = sh_quote(&to.name),
            email = sh_quote(&to.email),
        ));
    }
    script
}

fn sh_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_filter_quotes_identities() {
        let script = env_filter(
            &Identity::new(SANDBOX_NAME, SANDBOX_EMAIL),
            &Identity::new("D'Arcy", "d@example.com"),
        );
        assert!(script.contains("= 'forklift@github.com' ]"));
        assert!(script.contains("GIT_AUTHOR_NAME='D'\\''Arcy'"));
        assert!(script.contains("GIT_COMMITTER_EMAIL='d@example.com'"));
    }

    #[test]
    fn fixture_has_both_remotes_and_identity() {
        let fork = TestFork::new();
        let remotes = git(&fork.repo, &["remote"]);
        assert!(remotes.contains("origin"));
        assert!(remotes.contains("upstream"));
        assert_eq!(fork.tip(&fork.origin), fork.tip(&fork.upstream));
    }
}
