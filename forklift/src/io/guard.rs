//! Identity and remote preconditions, checked before anything is mutated.

use anyhow::{Context, Result};
use tracing::{info, instrument};

use crate::core::types::{Identity, RemoteUrls};
use crate::errors::GuardError;
use crate::io::git::Git;

/// Everything the guard captured from the source repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardReport {
    pub operator: Identity,
    pub remotes: RemoteUrls,
}

/// Resolve the operator identity and the `origin`/`upstream` fetch URLs.
///
/// Read-only: only `git config --get` and `git remote -v` are issued.
#[instrument(skip_all, fields(repo = %git.workdir().display()))]
pub async fn check_preconditions(git: &Git) -> Result<GuardReport> {
    let repo = git.workdir().display().to_string();
    if git.ensure_repository().await.is_err() {
        return Err(GuardError::NotARepository(repo).into());
    }

    let name = git
        .config_get("user.name")
        .await
        .context("read user.name")?
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| GuardError::MissingUserName { repo: repo.clone() })?;
    let email = git
        .config_get("user.email")
        .await
        .context("read user.email")?
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| GuardError::MissingUserEmail { repo: repo.clone() })?;
    let operator = Identity::new(name, email);
    info!(operator = %operator, "captured operator identity");

    let mut remotes = git.remotes().await.context("list remotes")?;
    let mut missing: Vec<String> = ["origin", "upstream"]
        .into_iter()
        .filter(|name| !remotes.contains_key(*name))
        .map(str::to_string)
        .collect();
    if !missing.is_empty() {
        missing.sort();
        return Err(GuardError::MissingRemotes(missing).into());
    }
    let origin = remotes.remove("origin").unwrap_or_default();
    let upstream = remotes.remove("upstream").unwrap_or_default();
    info!(origin = %origin, upstream = %upstream, "detected remotes");

    Ok(GuardReport {
        operator,
        remotes: RemoteUrls { origin, upstream },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::process::Command;

    fn git(root: &Path, args: &[&str]) {
        let status = Command::new("git")
            .args(args)
            .current_dir(root)
            .env("GIT_CONFIG_GLOBAL", "/dev/null")
            .env("GIT_CONFIG_NOSYSTEM", "1")
            .status()
            .expect("spawn git");
        assert!(status.success(), "git {args:?} failed");
    }

    fn isolated(root: &Path) -> Git {
        git(root, &["init", "--quiet"]);
        Git::new(root)
    }

    #[tokio::test]
    async fn reports_missing_remotes_sorted() {
        let temp = tempfile::tempdir().expect("tempdir");
        let g = isolated(temp.path());
        git(temp.path(), &["config", "user.name", "Ada"]);
        git(temp.path(), &["config", "user.email", "ada@example.com"]);

        let err = check_preconditions(&g).await.unwrap_err();
        let guard = err.downcast_ref::<GuardError>().expect("guard error");
        assert_eq!(
            guard,
            &GuardError::MissingRemotes(vec!["origin".into(), "upstream".into()])
        );
    }

    #[tokio::test]
    async fn blank_identity_is_a_config_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let g = isolated(temp.path());
        git(temp.path(), &["config", "user.name", "   "]);
        git(temp.path(), &["config", "user.email", "ada@example.com"]);

        let err = check_preconditions(&g).await.unwrap_err();
        assert!(err.to_string().contains("user.name"), "{err:#}");
    }

    #[tokio::test]
    async fn captures_identity_and_urls() {
        let temp = tempfile::tempdir().expect("tempdir");
        let g = isolated(temp.path());
        git(temp.path(), &["config", "user.name", "Ada"]);
        git(temp.path(), &["config", "user.email", "ada@example.com"]);
        git(temp.path(), &["remote", "add", "origin", "https://example.com/me/fork.git"]);
        git(temp.path(), &["remote", "add", "upstream", "https://example.com/them/proj.git"]);

        let report = check_preconditions(&g).await.expect("guard ok");
        assert_eq!(report.operator, Identity::new("Ada", "ada@example.com"));
        assert_eq!(report.remotes.origin, "https://example.com/me/fork.git");
        assert_eq!(report.remotes.upstream, "https://example.com/them/proj.git");
    }
}
