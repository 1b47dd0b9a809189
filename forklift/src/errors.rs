//! Errors callers need to branch on.
//!
//! Everything else travels as `anyhow::Error` with context.

use std::fmt;

use thiserror::Error;

/// The operator interrupted the run.
#[derive(Debug, Clone, Copy, Error)]
#[error("run cancelled by operator")]
pub struct Cancelled;

/// True if `err` (or anything it wraps) is a [`Cancelled`].
pub fn is_cancelled(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| cause.is::<Cancelled>())
}

/// A local precondition the guard refused to run without.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GuardError {
    #[error("missing required git remote(s): {}", .0.join(", "))]
    MissingRemotes(Vec<String>),
    #[error(
        "git user.name is not set in {repo}; set it via `git config --global user.name \"Your Name\"`"
    )]
    MissingUserName { repo: String },
    #[error(
        "git user.email is not set in {repo}; set it via `git config --global user.email you@example.com`"
    )]
    MissingUserEmail { repo: String },
    #[error("{0} is not a git repository")]
    NotARepository(String),
    #[error(
        "local {branch} does not contain origin/{branch}; pull the fork's new commits first so publishing cannot drop them"
    )]
    BranchBehindOrigin { branch: String },
}

/// Named stages of the rewrite/publish pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishStep {
    Stash,
    Checkout,
    ReattachRemotes,
    ValidateRewriteTool,
    RewriteAuthorship,
    BackupTag,
    Push,
}

impl PublishStep {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stash => "stash",
            Self::Checkout => "checkout",
            Self::ReattachRemotes => "reattach-remotes",
            Self::ValidateRewriteTool => "validate-rewrite-tool",
            Self::RewriteAuthorship => "rewrite-authorship",
            Self::BackupTag => "backup-tag",
            Self::Push => "push",
        }
    }
}

impl fmt::Display for PublishStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A publish pipeline failure, tagged with the step that failed.
#[derive(Debug, Error)]
#[error("publish failed at step `{step}`: {cause:#}")]
pub struct PublishError {
    pub step: PublishStep,
    pub cause: anyhow::Error,
}

impl PublishError {
    pub fn new(step: PublishStep, cause: anyhow::Error) -> Self {
        Self { step, cause }
    }

    pub fn is_cancelled(&self) -> bool {
        is_cancelled(&self.cause)
    }
}
