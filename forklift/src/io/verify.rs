//! Outcome verifier: read-only classification of the post-sandbox workspace.

use std::fs;
use std::path::Path;

use tracing::{info, instrument, warn};

use crate::core::types::{Verdict, classify_verdict};
use crate::io::git::Git;
use crate::io::metadata::RunMetadata;

/// Marker the agent writes at the workspace root when it needs a human.
pub const STUCK_MARKER: &str = "STUCK.md";

/// Classify the workspace as stuck, verified, or unverified.
///
/// Never mutates the workspace. A failing ancestry check counts as
/// unverified, never as verified.
#[instrument(skip_all, fields(workspace = %workspace.display(), branch = %metadata.main_branch))]
pub async fn verify_outcome(workspace: &Path, metadata: &RunMetadata, preview_lines: usize) -> Verdict {
    let marker = workspace.join(STUCK_MARKER);
    if marker.is_file() {
        log_stuck_marker(&marker, preview_lines);
        return classify_verdict(true, false);
    }

    let git = Git::new(workspace);
    let tip = format!("refs/heads/{}", metadata.main_branch);
    let integrated = match git.is_ancestor(&metadata.upstream_sha, &tip).await {
        Ok(integrated) => integrated,
        Err(err) => {
            warn!(error = %format!("{err:#}"), "ancestry check failed; treating as unverified");
            false
        }
    };

    let verdict = classify_verdict(false, integrated);
    match verdict {
        Verdict::Verified => info!(upstream = %metadata.upstream_sha, "upstream is an ancestor of the local branch"),
        _ => warn!(
            upstream = %metadata.upstream_sha,
            "upstream is not reachable from the local branch; agent did not finish integrating"
        ),
    }
    verdict
}

fn log_stuck_marker(marker: &Path, preview_lines: usize) {
    match fs::read_to_string(marker) {
        Ok(contents) => {
            let total = contents.lines().count();
            let preview: Vec<&str> = contents.lines().take(preview_lines).collect();
            let mut shown = preview.join("\n");
            if total > preview_lines {
                shown.push_str(&format!("\n... ({} more lines)", total - preview_lines));
            }
            warn!(marker = %marker.display(), contents = %shown, "agent reported STUCK");
        }
        Err(err) => warn!(
            marker = %marker.display(),
            error = %err,
            "agent reported STUCK; marker unreadable"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Identity, RemoteUrls};
    use crate::io::metadata::RunRecord;
    use std::process::Command;

    fn git(root: &Path, args: &[&str]) -> String {
        let output = Command::new("git")
            .args(args)
            .current_dir(root)
            .env("GIT_CONFIG_GLOBAL", "/dev/null")
            .env("GIT_CONFIG_NOSYSTEM", "1")
            .env("GIT_AUTHOR_NAME", "Test")
            .env("GIT_AUTHOR_EMAIL", "test@example.com")
            .env("GIT_COMMITTER_NAME", "Test")
            .env("GIT_COMMITTER_EMAIL", "test@example.com")
            .output()
            .expect("spawn git");
        assert!(output.status.success(), "git {args:?}: {}", String::from_utf8_lossy(&output.stderr));
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }

    fn commit(root: &Path, file: &str) -> String {
        fs::write(root.join(file), file).expect("write");
        git(root, &["add", file]);
        git(root, &["commit", "--quiet", "-m", file]);
        git(root, &["rev-parse", "HEAD"])
    }

    fn metadata(upstream_sha: &str) -> RunMetadata {
        RunMetadata {
            record: RunRecord {
                run_id: "abc123".to_string(),
                created_at: "20240102_030405".to_string(),
                project_name: "fork".to_string(),
                source_repo: "/tmp/fork".to_string(),
                status: None,
            },
            operator: Identity::new("Ada", "ada@example.com"),
            main_branch: "main".to_string(),
            upstream_sha: upstream_sha.to_string(),
            origin_baseline_sha: String::new(),
            remotes: RemoteUrls {
                origin: String::new(),
                upstream: String::new(),
            },
            finished_at: None,
            detail: None,
        }
    }

    /// main: base -> fork ; upstream: base -> up
    fn diverged(root: &Path) -> String {
        git(root, &["init", "--quiet", "-b", "main"]);
        commit(root, "base.txt");
        git(root, &["checkout", "--quiet", "-b", "up"]);
        let upstream = commit(root, "up.txt");
        git(root, &["checkout", "--quiet", "main"]);
        commit(root, "fork.txt");
        upstream
    }

    #[tokio::test]
    async fn merge_history_verifies() {
        let temp = tempfile::tempdir().expect("tempdir");
        let upstream = diverged(temp.path());
        assert_eq!(verify_outcome(temp.path(), &metadata(&upstream), 5).await, Verdict::Unverified);

        git(temp.path(), &["merge", "--quiet", "--no-edit", "up"]);
        assert_eq!(verify_outcome(temp.path(), &metadata(&upstream), 5).await, Verdict::Verified);
    }

    #[tokio::test]
    async fn rebase_history_verifies() {
        let temp = tempfile::tempdir().expect("tempdir");
        let upstream = diverged(temp.path());
        git(temp.path(), &["rebase", "--quiet", "up"]);
        assert_eq!(verify_outcome(temp.path(), &metadata(&upstream), 5).await, Verdict::Verified);
    }

    #[tokio::test]
    async fn stuck_marker_wins_and_is_left_alone() {
        let temp = tempfile::tempdir().expect("tempdir");
        let upstream = diverged(temp.path());
        git(temp.path(), &["merge", "--quiet", "--no-edit", "up"]);
        fs::write(temp.path().join(STUCK_MARKER), "conflict in build.rs\n").expect("write");

        assert_eq!(verify_outcome(temp.path(), &metadata(&upstream), 5).await, Verdict::Stuck);
        let contents = fs::read_to_string(temp.path().join(STUCK_MARKER)).expect("read");
        assert_eq!(contents, "conflict in build.rs\n");
    }

    #[tokio::test]
    async fn missing_branch_is_unverified() {
        let temp = tempfile::tempdir().expect("tempdir");
        let upstream = diverged(temp.path());
        let mut meta = metadata(&upstream);
        meta.main_branch = "gone".to_string();
        assert_eq!(verify_outcome(temp.path(), &meta, 5).await, Verdict::Unverified);
    }
}
