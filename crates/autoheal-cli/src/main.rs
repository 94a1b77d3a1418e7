//! autoheal - unattended CI/CD failure remediation
//!
//! ## Commands
//!
//! - `run`: heal a batch of error reports (or print the plan with `--dry-run`)
//! - `history`: query recorded job outcomes
//! - `sweep`: remove abandoned workspaces
//! - `throttle`: show the throttle entry for a signature
//! - `signature`: compute the signature of a failure

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::{info, Level};

use autoheal_core::{
    compute_signature, ErrorReport, FsThrottleLedger, Healer, HealerConfig, HistoryQuery,
    HistoryStore, JsonlHistoryStore, Platform, SafetyThrottle, ThrottlePolicy, WorkspaceManager,
};

#[derive(Parser)]
#[command(name = "autoheal")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Unattended remediation of CI/CD failures", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// State directory (overrides `base_dir` from the config file)
    #[arg(long, global = true, env = "AUTOHEAL_BASE_DIR")]
    base_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Heal the failures in a JSON array of error reports
    Run {
        /// Path to the reports file
        #[arg(short, long)]
        reports: PathBuf,

        /// Print the dedup/throttle/batch plan without running any job
        #[arg(long)]
        dry_run: bool,
    },

    /// Show recorded job outcomes, newest first
    History {
        #[arg(long)]
        repo: Option<String>,

        #[arg(long)]
        signature: Option<String>,

        /// Only outcomes started within the last N hours
        #[arg(long)]
        since_hours: Option<u64>,

        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Remove workspaces older than the given age
    Sweep {
        /// Maximum age in minutes (default: workspace_max_age_ms from config)
        #[arg(long)]
        max_age_mins: Option<u64>,
    },

    /// Show the throttle ledger entry for a signature
    Throttle {
        #[arg(short, long)]
        signature: String,
    },

    /// Compute the signature of a failure
    Signature {
        #[arg(long, default_value = "other")]
        platform: Platform,

        #[arg(long)]
        repo: String,

        #[arg(long)]
        error_type: String,

        #[arg(long)]
        message: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    autoheal_core::init_tracing(cli.json, level);

    let config = load_config(cli.config.as_deref(), cli.base_dir)?;

    match cli.command {
        Commands::Run { reports, dry_run } => cmd_run(&config, &reports, dry_run).await,
        Commands::History {
            repo,
            signature,
            since_hours,
            limit,
        } => {
            let query = HistoryQuery {
                signature,
                repo_key: repo,
                since: since_hours.map(|h| Utc::now() - chrono::Duration::hours(h as i64)),
                until: None,
                limit: Some(limit),
            };
            cmd_history(&config, &query).await
        }
        Commands::Sweep { max_age_mins } => {
            let max_age = max_age_mins
                .map(|m| Duration::from_secs(m * 60))
                .unwrap_or_else(|| config.workspace_max_age());
            cmd_sweep(&config, max_age).await
        }
        Commands::Throttle { signature } => cmd_throttle(&config, &signature).await,
        Commands::Signature {
            platform,
            repo,
            error_type,
            message,
        } => {
            println!(
                "{}",
                compute_signature(platform, &repo, &error_type, &message)
            );
            Ok(())
        }
    }
}

/// Config file (or defaults) with the CLI's `--base-dir` applied on top.
fn load_config(path: Option<&Path>, base_dir: Option<PathBuf>) -> Result<HealerConfig> {
    let mut config = match path {
        Some(path) => HealerConfig::from_toml_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => HealerConfig::default(),
    };
    if let Some(base_dir) = base_dir {
        config.base_dir = base_dir;
    }
    config.validate()?;
    Ok(config)
}

fn load_reports(path: &Path) -> Result<Vec<ErrorReport>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read reports {}", path.display()))?;
    serde_json::from_str(&raw).context("Reports file must be a JSON array of error reports")
}

async fn cmd_run(config: &HealerConfig, reports: &Path, dry_run: bool) -> Result<()> {
    let reports = load_reports(reports)?;
    let healer = Healer::from_config(config)
        .await
        .context("Failed to initialise healer")?;

    if dry_run {
        let plan = healer.plan(reports).await;
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(());
    }

    info!(reports = reports.len(), "starting healing run");
    let summary = healer.run(reports).await;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    println!(
        "healed {} / failed {} / skipped {} of {}",
        summary.healed, summary.failed, summary.skipped, summary.total
    );
    Ok(())
}

async fn cmd_history(config: &HealerConfig, query: &HistoryQuery) -> Result<()> {
    let store = JsonlHistoryStore::open(config.history_path()).await?;
    let records = store.query(query).await?;

    if records.is_empty() {
        println!("No outcomes recorded");
        return Ok(());
    }

    for record in records {
        println!("job {}", record.job_id);
        println!("Repo:      {}", record.repo_key);
        println!("Signature: {}", record.signature);
        println!(
            "Started:   {}",
            record.started_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
        match (&record.reason, &record.result) {
            (Some(reason), _) => println!("Status:    {} ({})", record.status, reason),
            (None, Some(result)) => {
                println!("Status:    {} via {}", record.status, result.strategy);
                if let Some(url) = &result.pull_request_url {
                    println!("PR:        {url}");
                }
                if let Some(error) = &result.error {
                    println!("Error:     {error}");
                }
            }
            (None, None) => println!("Status:    {}", record.status),
        }
        println!();
    }
    Ok(())
}

async fn cmd_sweep(config: &HealerConfig, max_age: Duration) -> Result<()> {
    let removed = WorkspaceManager::from_config(config)
        .cleanup_stale(max_age)
        .await?;
    println!("Removed {removed} stale workspace(s)");
    Ok(())
}

async fn cmd_throttle(config: &HealerConfig, signature: &str) -> Result<()> {
    let history = JsonlHistoryStore::open(config.history_path()).await?;
    let throttle = SafetyThrottle::load(
        ThrottlePolicy::from_config(config),
        Arc::new(FsThrottleLedger::new(config.throttle_path())),
        Some(&history as &dyn HistoryStore),
    )
    .await?;

    match throttle.entry(signature).await {
        Some(entry) => println!("{}", serde_json::to_string_pretty(&entry)?),
        None => println!("No attempts recorded for {signature}"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_dir_flag_overrides_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("autoheal.toml");
        std::fs::write(&path, "base_dir = \"/var/lib/autoheal\"\nconcurrency = 5\n").unwrap();

        let config = load_config(Some(&path), None).unwrap();
        assert_eq!(config.base_dir, PathBuf::from("/var/lib/autoheal"));
        assert_eq!(config.concurrency, 5);

        let config = load_config(Some(&path), Some(dir.path().to_path_buf())).unwrap();
        assert_eq!(config.base_dir, dir.path());
        assert_eq!(config.concurrency, 5);
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_config(Some(&dir.path().join("absent.toml")), None).is_err());
    }

    #[test]
    fn reports_accept_detector_field_names() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reports.json");
        std::fs::write(
            &path,
            r#"[
                {"platform": "ci-actions", "repo": "a/b", "errorType": "build", "message": "boom"},
                {"platform": "deploy-platform", "project": "c/d", "errorType": "deploy", "message": "down"}
            ]"#,
        )
        .unwrap();

        let reports = load_reports(&path).unwrap();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].key(), Some("a/b"));
        assert_eq!(reports[1].key(), Some("c/d"));
        assert_eq!(
            reports[0].signature,
            compute_signature(Platform::CiActions, "a/b", "build", "boom")
        );
    }

    #[tokio::test]
    async fn dry_run_leaves_no_history() {
        let dir = tempfile::tempdir().unwrap();
        let reports = dir.path().join("reports.json");
        std::fs::write(
            &reports,
            r#"[{"platform": "ci-actions", "repo": "a/b", "errorType": "build", "message": "boom"}]"#,
        )
        .unwrap();
        let config = load_config(None, Some(dir.path().join("state"))).unwrap();

        cmd_run(&config, &reports, true).await.unwrap();

        let store = JsonlHistoryStore::open(config.history_path()).await.unwrap();
        assert_eq!(store.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn run_then_throttle_shows_the_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let reports = dir.path().join("reports.json");
        std::fs::write(
            &reports,
            r#"[{"platform": "ci-actions", "repo": "a/b", "errorType": "build", "message": "boom"}]"#,
        )
        .unwrap();
        let config = load_config(None, Some(dir.path().join("state"))).unwrap();

        cmd_run(&config, &reports, false).await.unwrap();

        let store = JsonlHistoryStore::open(config.history_path()).await.unwrap();
        assert_eq!(store.len().await.unwrap(), 1);
        cmd_throttle(&config, &compute_signature(Platform::CiActions, "a/b", "build", "boom"))
            .await
            .unwrap();
        cmd_sweep(&config, Duration::ZERO).await.unwrap();
    }
}
