//! Run metadata storage (`<run_dir>/metadata.json`).
//!
//! Written once when the workspace is ready. The only later write appends the
//! final status, finish time, and detail.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::state::RunStatus;
use crate::core::types::{Identity, RemoteUrls};

pub const METADATA_FILE: &str = "metadata.json";

/// One record per invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunRecord {
    /// Short random correlator, stable for the run's lifetime.
    pub run_id: String,
    /// Run timestamp (`%Y%m%d_%H%M%S`), also used in directory and tag names.
    pub created_at: String,
    pub project_name: String,
    /// Host repository the workspace was copied from. Never written to.
    pub source_repo: String,
    /// `None` until the run reaches a terminal state.
    pub status: Option<RunStatus>,
}

/// Persisted description of a prepared workspace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunMetadata {
    #[serde(flatten)]
    pub record: RunRecord,
    pub operator: Identity,
    pub main_branch: String,
    /// Tip of `upstream/<main_branch>` at fetch time.
    pub upstream_sha: String,
    /// Tip of `origin/<main_branch>` at fetch time; the push lease baseline.
    pub origin_baseline_sha: String,
    pub remotes: RemoteUrls,
    pub finished_at: Option<DateTime<Utc>>,
    /// Failing step or reason for the terminal status.
    pub detail: Option<String>,
}

/// Load metadata from disk.
pub fn load_metadata(path: &Path) -> Result<RunMetadata> {
    debug!(path = %path.display(), "loading run metadata");
    let contents =
        fs::read_to_string(path).with_context(|| format!("read metadata {}", path.display()))?;
    let metadata: RunMetadata = serde_json::from_str(&contents)
        .with_context(|| format!("parse metadata {}", path.display()))?;
    Ok(metadata)
}

/// Atomically write metadata to disk (temp file + rename).
pub fn write_metadata(path: &Path, metadata: &RunMetadata) -> Result<()> {
    debug!(path = %path.display(), run_id = %metadata.record.run_id, status = ?metadata.record.status, "writing run metadata");
    let mut buf = serde_json::to_string_pretty(metadata)?;
    buf.push('\n');
    write_atomic(path, &buf)
}

/// Append the terminal status to an existing metadata file.
pub fn record_outcome(path: &Path, status: RunStatus, detail: Option<&str>) -> Result<RunMetadata> {
    let mut metadata = load_metadata(path)?;
    metadata.record.status = Some(status);
    metadata.finished_at = Some(Utc::now());
    metadata.detail = detail.map(str::to_string);
    write_metadata(path, &metadata)?;
    Ok(metadata)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("metadata path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp metadata {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace metadata {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RunMetadata {
        RunMetadata {
            record: RunRecord {
                run_id: "k3x9qa".to_string(),
                created_at: "20240102_030405".to_string(),
                project_name: "fork".to_string(),
                source_repo: "/home/ada/fork".to_string(),
                status: None,
            },
            operator: Identity::new("Ada", "ada@example.com"),
            main_branch: "main".to_string(),
            upstream_sha: "a".repeat(40),
            origin_baseline_sha: "b".repeat(40),
            remotes: RemoteUrls {
                origin: "git@example.com:ada/fork.git".to_string(),
                upstream: "https://example.com/up/proj.git".to_string(),
            },
            finished_at: None,
            detail: None,
        }
    }

    /// The record is flattened so operators see one flat document.
    #[test]
    fn record_fields_are_flattened() {
        let json = serde_json::to_value(sample()).expect("json");
        assert_eq!(json["run_id"], "k3x9qa");
        assert_eq!(json["origin_baseline_sha"], "b".repeat(40));
        assert_eq!(json["remotes"]["upstream"], "https://example.com/up/proj.git");
        assert!(json.get("record").is_none());
    }

    #[test]
    fn record_outcome_appends_status_only() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join(METADATA_FILE);
        write_metadata(&path, &sample()).expect("write");

        let updated =
            record_outcome(&path, RunStatus::PublishFailed, Some("push")).expect("record");
        assert_eq!(updated.record.status, Some(RunStatus::PublishFailed));
        assert_eq!(updated.detail.as_deref(), Some("push"));
        assert!(updated.finished_at.is_some());

        let reloaded = load_metadata(&path).expect("load");
        assert_eq!(reloaded.upstream_sha, sample().upstream_sha);
        assert_eq!(reloaded.record.status, Some(RunStatus::PublishFailed));
        assert!(!path.with_extension("json.tmp").exists());
    }
}
