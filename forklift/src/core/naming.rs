//! Deterministic names and validators used across a run.
//!
//! Everything here is pure: callers pass in timestamps and random suffixes so
//! outputs are reproducible in tests.

use std::sync::LazyLock;

use anyhow::{Result, anyhow};
use regex::Regex;

use crate::core::types::Identity;

/// Identity every commit made inside the sandbox carries.
pub const SANDBOX_NAME: &str = "Forklift Agent";
pub const SANDBOX_EMAIL: &str = "forklift@github.com";

/// Timestamp layout for run directories and backup tags.
pub const RUN_TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Label attached to the pre-rewrite stash entry.
pub const STASH_MESSAGE: &str = "forklift-authorship-rewrite";

/// Local ref pinning the upstream tip inside a remote-less workspace.
pub const UPSTREAM_PIN_REF: &str = "refs/forklift/upstream";

static SAFE_VALUE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9._/-]+$").expect("static pattern compiles")
});

pub fn sandbox_identity() -> Identity {
    Identity::new(SANDBOX_NAME, SANDBOX_EMAIL)
}

/// Validate a value that ends up in git refspecs or container env.
pub fn validate_safe_value(label: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(anyhow!("{label} must not be empty"));
    }
    if !SAFE_VALUE.is_match(value) {
        return Err(anyhow!(
            "invalid {label} '{value}'; expected pattern {}",
            SAFE_VALUE.as_str()
        ));
    }
    Ok(())
}

/// `<project>_<timestamp>`
pub fn run_dir_name(project: &str, timestamp: &str) -> String {
    format!("{project}_{timestamp}")
}

/// Local-only tag anchoring the pre-run fork tip.
pub fn backup_tag_name(branch: &str, timestamp: &str) -> String {
    format!("forklift/{branch}/{timestamp}/pre-push")
}

/// Container name: `forklift-<project>-<timestamp>-<suffix>`, docker-safe.
pub fn container_name(project: &str, compact_timestamp: &str, suffix: &str) -> String {
    let raw = format!("forklift-{project}-{compact_timestamp}-{suffix}");
    let mut name = String::with_capacity(raw.len());
    for ch in raw.chars() {
        let ch = match ch {
            'a'..='z' | '0'..='9' | '-' | '.' => ch,
            'A'..='Z' => ch.to_ascii_lowercase(),
            _ => '-',
        };
        if ch == '-' && name.ends_with('-') {
            continue;
        }
        name.push(ch);
    }
    name
}

/// Single mailmap line mapping `from` onto `to`.
pub fn render_mailmap(to: &Identity, from: &Identity) -> String {
    format!("{} <{}> {} <{}>\n", to.name, to.email, from.name, from.email)
}

/// Environment keys whose values must never reach a log line.
pub fn is_sensitive_env_key(key: &str) -> bool {
    let upper = key.to_ascii_uppercase();
    ["KEY", "TOKEN", "SECRET", "PASSWORD"]
        .iter()
        .any(|needle| upper.contains(needle))
}

/// True when `value` contains ASCII control characters.
pub fn has_control_chars(value: &str) -> bool {
    value.chars().any(|c| (c as u32) < 32 || c as u32 == 127)
}
