//! Forklift: merge upstream into a fork with a sandboxed agent, then publish.
//!
//! Runs once against one repository and exits with a code that names the
//! outcome, so cron jobs and scripts can branch on it.

use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use forklift::exit_codes;
use forklift::io::config::{ForkliftConfig, default_config_path, load_config};
use forklift::io::publish::FilterRepo;
use forklift::io::sandbox::DockerRuntime;
use forklift::logging;
use forklift::run::{RunRequest, run_forklift};

#[derive(Parser, Debug)]
#[command(
    name = "forklift",
    version,
    about = "Merge upstream into a fork using a sandboxed coding agent"
)]
struct Cli {
    /// Fork repository to maintain (defaults to the current directory).
    repo: Option<PathBuf>,

    /// Branch to integrate upstream into and publish.
    #[arg(long)]
    main_branch: Option<String>,

    /// Sandbox wall-clock budget.
    #[arg(long, value_name = "SECS")]
    timeout: Option<u64>,

    /// Container image for the sandbox.
    #[arg(long)]
    image: Option<String>,

    /// Parent directory for run directories.
    #[arg(long)]
    runs_root: Option<PathBuf>,

    /// Forward the host TZ into the sandbox.
    #[arg(long)]
    forward_tz: bool,

    /// Verbose logging (overridden by RUST_LOG).
    #[arg(long)]
    debug: bool,

    /// Config file (default: ~/.config/forklift/config.toml).
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
}

impl Cli {
    fn apply_overrides(&self, config: &mut ForkliftConfig) {
        if let Some(branch) = &self.main_branch {
            config.main_branch = branch.clone();
        }
        if let Some(timeout) = self.timeout {
            config.sandbox.timeout_secs = timeout;
        }
        if let Some(image) = &self.image {
            config.sandbox.image = image.clone();
        }
        if let Some(runs_root) = &self.runs_root {
            config.runs_root = Some(runs_root.clone());
        }
        if self.forward_tz {
            config.sandbox.forward_tz = true;
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::init(cli.debug);
    let code = match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            exit_codes::FAILED
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32> {
    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => default_config_path()?,
    };
    let mut config = load_config(&config_path)?;
    cli.apply_overrides(&mut config);
    config.validate().context("invalid configuration after CLI overrides")?;

    let repo = match &cli.repo {
        Some(path) => path.clone(),
        None => env::current_dir().context("resolve current directory")?,
    };
    let source_repo = repo
        .canonicalize()
        .with_context(|| format!("resolve repository path {}", repo.display()))?;

    let cancel = CancellationToken::new();
    watch_signals(cancel.clone())?;

    let runtime = DockerRuntime::from_config(&config.sandbox);
    let request = RunRequest {
        source_repo,
        config,
        host_tz: env::var("TZ").ok(),
    };
    let report = run_forklift(&request, &runtime, &FilterRepo, &cancel).await;

    match report.run_dir() {
        Some(run_dir) => println!("{} {}", report.status.outcome_label(), run_dir.display()),
        None => println!("{}", report.status.outcome_label()),
    }
    if let Some(detail) = &report.detail {
        println!("{detail}");
    }
    Ok(report.exit_code())
}

/// Cancel the run on SIGINT or SIGTERM so the container is stopped before exit.
fn watch_signals(cancel: CancellationToken) -> Result<()> {
    let mut terminate = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
    tokio::spawn(async move {
        let first = tokio::select! {
            result = tokio::signal::ctrl_c() => result.map(|()| "SIGINT"),
            _ = terminate.recv() => Ok("SIGTERM"),
        };
        let received = match first {
            Ok(name) => name,
            Err(err) => {
                warn!(error = %err, "cannot listen for SIGINT");
                terminate.recv().await;
                "SIGTERM"
            }
        };
        warn!(signal = received, "signal received; cancelling run");
        cancel.cancel();
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sigterm_cancels_the_run() {
        let cancel = CancellationToken::new();
        watch_signals(cancel.clone()).expect("install handlers");

        let status = std::process::Command::new("kill")
            .args(["-TERM", &std::process::id().to_string()])
            .status()
            .expect("spawn kill");
        assert!(status.success());

        tokio::time::timeout(std::time::Duration::from_secs(5), cancel.cancelled())
            .await
            .expect("token cancelled after SIGTERM");
    }

    #[test]
    fn parse_defaults() {
        let cli = Cli::parse_from(["forklift"]);
        assert!(cli.repo.is_none());
        assert!(!cli.debug);
        assert!(!cli.forward_tz);
    }

    #[test]
    fn overrides_replace_config_values() {
        let cli = Cli::parse_from([
            "forklift",
            "../fork",
            "--main-branch",
            "trunk",
            "--timeout",
            "60",
            "--image",
            "ghcr.io/me/sandbox:2",
            "--forward-tz",
        ]);
        assert_eq!(cli.repo, Some(PathBuf::from("../fork")));

        let mut config = ForkliftConfig::default();
        cli.apply_overrides(&mut config);
        assert_eq!(config.main_branch, "trunk");
        assert_eq!(config.sandbox.timeout_secs, 60);
        assert_eq!(config.sandbox.image, "ghcr.io/me/sandbox:2");
        assert!(config.sandbox.forward_tz);
        assert!(config.runs_root.is_none());
    }
}
