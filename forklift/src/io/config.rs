//! Forklift configuration stored at `~/.config/forklift/config.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::naming::validate_safe_value;

/// Forklift configuration (TOML).
///
/// Intended to be edited by humans. Missing fields take the defaults below,
/// so an absent file is a valid configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ForkliftConfig {
    /// Parent directory for `<project>_<timestamp>` run directories.
    /// `None` means `~/forklift/runs`.
    pub runs_root: Option<PathBuf>,

    /// Branch the agent integrates upstream into and that gets published.
    pub main_branch: String,

    /// Optional fork-context file copied from the repo root into the workspace.
    pub fork_context_file: String,

    /// Lines of `STUCK.md` echoed to the log.
    pub stuck_preview_lines: usize,

    pub sandbox: SandboxConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SandboxConfig {
    /// Container runtime CLI (`docker`, `podman`).
    pub runtime: String,
    pub image: String,
    /// Command run inside the container.
    pub entrypoint: String,
    /// Wall-clock budget for the whole agent session.
    pub timeout_secs: u64,
    /// Time between the polite stop and the forced kill.
    pub grace_secs: u64,
    /// Unprivileged container user that must be able to write the mounts.
    pub uid: u32,
    pub gid: u32,
    /// Extra arguments inserted before the image name.
    pub extra_args: Vec<String>,
    /// Forward the host `TZ` variable.
    pub forward_tz: bool,
    /// Bytes of sandbox output kept in memory per stream (the log file is complete).
    pub output_limit_bytes: usize,
    /// Additional environment for the agent backend.
    pub env: BTreeMap<String, String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            runtime: "docker".to_string(),
            image: "forklift/kitchen-sink:latest".to_string(),
            entrypoint: "/opt/opencode/entrypoint.sh".to_string(),
            timeout_secs: 480,
            grace_secs: 10,
            uid: 1000,
            gid: 1000,
            extra_args: Vec::new(),
            forward_tz: false,
            output_limit_bytes: 200_000,
            env: BTreeMap::new(),
        }
    }
}

impl Default for ForkliftConfig {
    fn default() -> Self {
        Self {
            runs_root: None,
            main_branch: "main".to_string(),
            fork_context_file: "FORK.md".to_string(),
            stuck_preview_lines: 40,
            sandbox: SandboxConfig::default(),
        }
    }
}

impl ForkliftConfig {
    pub fn validate(&self) -> Result<()> {
        validate_safe_value("main_branch", &self.main_branch)?;
        if self.fork_context_file.trim().is_empty()
            || self.fork_context_file.contains(['/', '\\'])
        {
            return Err(anyhow!(
                "fork_context_file must be a bare file name, got '{}'",
                self.fork_context_file
            ));
        }
        if self.sandbox.timeout_secs == 0 {
            return Err(anyhow!("sandbox.timeout_secs must be > 0"));
        }
        if self.sandbox.output_limit_bytes == 0 {
            return Err(anyhow!("sandbox.output_limit_bytes must be > 0"));
        }
        if self.sandbox.image.trim().is_empty() {
            return Err(anyhow!("sandbox.image must not be empty"));
        }
        if self.sandbox.runtime.trim().is_empty() {
            return Err(anyhow!("sandbox.runtime must not be empty"));
        }
        if let Some(arg) = self.sandbox.extra_args.iter().find(|arg| is_mount_flag(arg)) {
            return Err(anyhow!(
                "sandbox.extra_args must not add mounts ('{arg}'); only the workspace and harness-state are mounted"
            ));
        }
        Ok(())
    }

    /// Resolved runs root, with a leading `~/` expanded.
    pub fn runs_root(&self) -> Result<PathBuf> {
        match &self.runs_root {
            Some(path) => expand_home(path),
            None => Ok(home_dir()?.join("forklift").join("runs")),
        }
    }
}

/// `~/.config/forklift/config.toml`
pub fn default_config_path() -> Result<PathBuf> {
    Ok(home_dir()?
        .join(".config")
        .join("forklift")
        .join("config.toml"))
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `ForkliftConfig::default()`.
pub fn load_config(path: &Path) -> Result<ForkliftConfig> {
    if !path.exists() {
        let cfg = ForkliftConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: ForkliftConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// `-v`, `--volume`, `--mount` and `--volumes-from`, in any spelling.
fn is_mount_flag(arg: &str) -> bool {
    let arg = arg.trim();
    if let Some(long) = arg.strip_prefix("--") {
        let name = long.split('=').next().unwrap_or(long);
        return matches!(name, "volume" | "mount" | "volumes-from");
    }
    // Short flags may be clustered (`-itv`) or carry the value inline (`-v/x:/y`).
    arg.strip_prefix('-')
        .is_some_and(|short| short.chars().take_while(char::is_ascii_alphabetic).any(|c| c == 'v'))
}

fn home_dir() -> Result<PathBuf> {
    dirs::home_dir().context("cannot determine home directory")
}

fn expand_home(path: &Path) -> Result<PathBuf> {
    match path.strip_prefix("~") {
        Ok(rest) => Ok(home_dir()?.join(rest)),
        Err(_) => Ok(path.to_path_buf()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, ForkliftConfig::default());
        assert_eq!(cfg.sandbox.timeout_secs, 480);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(
            &path,
            r#"
main_branch = "trunk"

[sandbox]
image = "ghcr.io/me/sandbox:1"
timeout_secs = 900

[sandbox.env]
OPENCODE_AGENT = "build"
"#,
        )
        .expect("write");

        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.main_branch, "trunk");
        assert_eq!(cfg.sandbox.image, "ghcr.io/me/sandbox:1");
        assert_eq!(cfg.sandbox.timeout_secs, 900);
        assert_eq!(cfg.sandbox.grace_secs, 10);
        assert_eq!(cfg.sandbox.env["OPENCODE_AGENT"], "build");
        assert_eq!(cfg.fork_context_file, "FORK.md");
    }

    #[test]
    fn invalid_values_are_rejected() {
        let mut cfg = ForkliftConfig::default();
        cfg.sandbox.timeout_secs = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = ForkliftConfig::default();
        cfg.main_branch = "main; rm -rf".to_string();
        assert!(cfg.validate().is_err());

        let mut cfg = ForkliftConfig::default();
        cfg.fork_context_file = "../FORK.md".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn extra_args_cannot_add_mounts() {
        for bad in [
            vec!["-v", "/etc:/host-etc"],
            vec!["-v/etc:/host-etc"],
            vec!["--volume", "/etc:/host-etc"],
            vec!["--volume=/etc:/host-etc"],
            vec!["--mount", "type=bind,src=/,dst=/host"],
            vec!["--volumes-from", "other"],
            vec!["-itv", "/etc:/x"],
        ] {
            let mut cfg = ForkliftConfig::default();
            cfg.sandbox.extra_args = bad.iter().map(|arg| arg.to_string()).collect();
            let err = cfg.validate().unwrap_err();
            assert!(err.to_string().contains("must not add mounts"), "{bad:?}: {err}");
        }

        let mut cfg = ForkliftConfig::default();
        cfg.sandbox.extra_args = ["--network", "host", "--memory=4g", "--cpus", "2", "-e", "X"]
            .iter()
            .map(|arg| arg.to_string())
            .collect();
        cfg.validate().expect("non-mount flags are allowed");
    }

    #[test]
    fn runs_root_expands_home() {
        let cfg = ForkliftConfig {
            runs_root: Some(PathBuf::from("~/tmp/runs")),
            ..ForkliftConfig::default()
        };
        let resolved = cfg.runs_root().expect("resolve");
        assert!(resolved.ends_with("tmp/runs"));
        assert!(!resolved.starts_with("~"));
    }
}
