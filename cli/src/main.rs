//! ghwalk command-line entrypoint.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use futures::future::join_all;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use ghwalk::checkpoint::{CheckpointStore, CorruptCheckpointPolicy, FileCheckpointStore};
use ghwalk::cursor::TraversalState;
use ghwalk::engine::{EngineState, JsonLinesSink, RunReport, RunStatus, TraversalEngine};
use ghwalk::entity::EntityKind;
use ghwalk::fetch::{GithubPageFetcher, HttpTransport};
use ghwalk::planner::PerEntityPolicy;
use ghwalk::settings::{OrganizationSettings, Settings};
use ghwalk::{BudgetTracker, SharedBudget};

#[derive(Parser)]
#[command(name = "ghwalk")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Resumable, budget-aware traversal of GitHub organizations")]
#[command(long_about = r#"
ghwalk pages through an organization's members and each member's
repositories, staying inside the hourly GraphQL node budget. Progress is
checkpointed so an interrupted or budget-paused run resumes where it left off.

Emitted entities are written to stdout as JSON lines; logs and the run
summary go to stderr.

ENVIRONMENT VARIABLES:
  GITHUB_TOKEN    Default bearer token (see organizations.token_env)
  GHWALK_*        Configuration overrides, e.g. GHWALK_BUDGET__NODE_CAP=1000
  RUST_LOG        Log filter (default: info)
"#)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Traverse organizations, resuming from checkpoints when present
    Run {
        /// Configuration file (TOML)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Organization to traverse; repeatable. Defaults to all configured
        #[arg(long = "org", value_name = "NAME")]
        orgs: Vec<String>,

        /// Start over when a stored checkpoint fails verification
        #[arg(long)]
        restart_corrupt: bool,

        /// Per-request timeout in seconds
        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,

        /// Drop members that no longer exist instead of failing on them
        #[arg(long)]
        skip_vanished: bool,
    },

    /// Verify and summarise a checkpoint file
    Inspect {
        /// Path to the checkpoint
        file: PathBuf,
    },

    /// Print the effective configuration as TOML
    Config {
        /// Configuration file (TOML)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            config,
            orgs,
            restart_corrupt,
            timeout_secs,
            skip_vanished,
        } => {
            let corrupt_policy = if restart_corrupt {
                CorruptCheckpointPolicy::RestartEmpty
            } else {
                CorruptCheckpointPolicy::Abort
            };
            run(
                config.as_deref(),
                &orgs,
                corrupt_policy,
                Duration::from_secs(timeout_secs),
                skip_vanished,
            )
            .await
        }
        Commands::Inspect { file } => inspect(&file),
        Commands::Config { config } => {
            let settings = Settings::load(config.as_deref()).context("failed to load configuration")?;
            print!("{}", settings.to_toml()?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Organizations named on the command line, or every enabled one.
///
/// Names not present in the configuration get default settings. Disabled
/// organizations are skipped even when named.
fn select_organizations(settings: &Settings, names: &[String]) -> Result<Vec<OrganizationSettings>> {
    if names.is_empty() {
        return Ok(settings.enabled_organizations().cloned().collect());
    }

    let selected = Settings {
        organizations: names
            .iter()
            .map(|name| {
                settings
                    .organization(name)
                    .cloned()
                    .unwrap_or_else(|| OrganizationSettings::new(name.as_str()))
            })
            .collect(),
        ..settings.clone()
    };
    selected.validate()?;
    Ok(selected
        .organizations
        .into_iter()
        .filter(|org| {
            if !org.enabled {
                warn!(organization = %org.name, "organization is disabled, skipping");
            }
            org.enabled
        })
        .collect())
}

/// One budget per credential, in the order of `organizations`.
fn credential_budgets(settings: &Settings, organizations: &[OrganizationSettings]) -> Vec<SharedBudget> {
    let mut budgets: BTreeMap<(String, String), SharedBudget> = BTreeMap::new();
    organizations
        .iter()
        .map(|org| {
            budgets
                .entry(org.credential_key())
                .or_insert_with(|| BudgetTracker::new(settings.budget.clone()).into())
                .clone()
        })
        .collect()
}

async fn run(
    config: Option<&Path>,
    names: &[String],
    corrupt_policy: CorruptCheckpointPolicy,
    timeout: Duration,
    skip_vanished: bool,
) -> Result<ExitCode> {
    let settings = Settings::load(config).context("failed to load configuration")?;
    let organizations = select_organizations(&settings, names)?;
    if organizations.is_empty() {
        bail!("no organizations to traverse; pass --org or add [[organizations]] to the configuration");
    }

    let store: Arc<dyn CheckpointStore> = Arc::new(
        FileCheckpointStore::new(&settings.checkpoint.dir).with_context(|| {
            format!(
                "failed to open checkpoint directory {}",
                settings.checkpoint.dir.display()
            )
        })?,
    );
    let output = JsonLinesSink::new(tokio::io::stdout());
    let budgets = credential_budgets(&settings, &organizations);

    let mut engines = Vec::with_capacity(organizations.len());
    for (org, budget) in organizations.iter().zip(budgets) {
        let token = std::env::var(&org.token_env).with_context(|| {
            format!(
                "environment variable {} (token for {}) is not set",
                org.token_env, org.name
            )
        })?;
        let transport = HttpTransport::new(&org.endpoint, token, timeout)
            .context("failed to build HTTP client")?;
        info!(organization = %org.name, endpoint = %transport.endpoint(), "preparing traversal");

        let fetcher = Arc::new(GithubPageFetcher::new(Arc::new(transport), org.name.as_str()));
        let engine = TraversalEngine::new(
            org.name.as_str(),
            fetcher,
            Arc::clone(&store),
            Box::new(output.for_organization(org.name.as_str())),
        )
        .with_config(settings.engine_config())
        .with_budget(budget)
        .with_policy(PerEntityPolicy::new(settings.planner.clone()))
        .resume_from_store(corrupt_policy)
        .with_context(|| format!("failed to restore checkpoint for {}", org.name))?;
        engines.push(engine);
    }

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, checkpointing and pausing");
            let _ = cancel_tx.send(true);
        }
    });

    let reports = join_all(
        engines
            .iter_mut()
            .map(|engine| run_engine(engine, cancel_rx.clone(), skip_vanished)),
    )
    .await;

    let mut failed = false;
    for report in &reports {
        print_summary(report);
        failed |= report.status().is_failure();
    }

    Ok(if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

/// Run one engine, optionally dropping vanished members and running again.
async fn run_engine(
    engine: &mut TraversalEngine,
    cancel: watch::Receiver<bool>,
    skip_vanished: bool,
) -> RunReport {
    loop {
        let report = engine.run(cancel.clone()).await;
        let vanished = match &report.state {
            EngineState::Failed(info) if skip_vanished => info.vanished_parent().cloned(),
            _ => None,
        };
        let Some(parent) = vanished else {
            return report;
        };
        match engine.skip_entity(&parent) {
            Ok(true) => {
                warn!(organization = %engine.traversal_id(), member = %parent, "member vanished, skipping");
            }
            Ok(false) => return report,
            Err(err) => {
                error!(organization = %engine.traversal_id(), error = %err, "failed to drop vanished member");
                return report;
            }
        }
    }
}

fn print_summary(report: &RunReport) {
    let status = report.status();
    let label = match status {
        RunStatus::Completed => status.as_label().green().bold(),
        RunStatus::Paused => status.as_label().yellow().bold(),
        RunStatus::Failed => status.as_label().red().bold(),
    };

    eprintln!("{} {}", report.traversal_id.as_str().bold(), label);
    eprintln!(
        "  {} members, {} repositories emitted; {} complete, {} pending",
        report.emitted_of(EntityKind::Member),
        report.emitted_of(EntityKind::Repository),
        report.outer_completed,
        report.outer_pending
    );
    eprintln!(
        "  {} fetches, {} retries, {} consumed",
        report.fetches, report.retries, report.consumed
    );

    match &report.state {
        EngineState::Paused(reason) => eprintln!("  {}", reason.to_string().as_str().yellow()),
        EngineState::Failed(info) => eprintln!("  {}", info.to_string().as_str().red()),
        _ => {}
    }
}

fn inspect(path: &Path) -> Result<ExitCode> {
    let bytes =
        std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let state = TraversalState::deserialize(&bytes)
        .with_context(|| format!("checkpoint {} failed verification", path.display()))?;

    let outer = state.outer();
    println!("{} {}", "checkpoint".bold(), path.display());
    println!("  status:       {}", if state.is_complete() { "complete" } else { "in progress" });
    println!("  outer level:  {}", outer.level_name);
    println!(
        "  outer cursor: {}",
        outer.next_cursor().unwrap_or(if outer.is_started() { "-" } else { "not started" })
    );
    println!("  outer done:   {}", outer.is_exhausted());
    println!("  inner levels: {}", state.inner_levels().join(", "));
    println!("  completed:    {}", state.completed_count());
    println!("  pending:      {}", state.pending_count());
    println!("  emitted:      {}", state.emitted_count());
    if let Some(head) = state.head() {
        let frame = head
            .open_frame()
            .map(|frame| frame.level_name.as_str())
            .unwrap_or("-");
        println!(
            "  head:         {} ({} open, {} consecutive pages)",
            head.id,
            frame,
            state.head_streak()
        );
    }
    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(text: &str) -> Settings {
        Settings::from_toml_str(text).unwrap()
    }

    #[test]
    fn test_organizations_on_one_token_share_a_budget() {
        let settings = settings(
            r#"
            [[organizations]]
            name = "acme"

            [[organizations]]
            name = "initech"

            [[organizations]]
            name = "globex"
            token_env = "GLOBEX_TOKEN"
            "#,
        );
        let organizations = select_organizations(&settings, &[]).unwrap();

        let budgets = credential_budgets(&settings, &organizations);

        assert_eq!(budgets.len(), 3);
        assert!(budgets[0].same_budget(&budgets[1]));
        assert!(!budgets[0].same_budget(&budgets[2]));
    }

    #[test]
    fn test_disabled_organizations_are_not_selected() {
        let settings = settings(
            r#"
            [[organizations]]
            name = "acme"

            [[organizations]]
            name = "legacy"
            enabled = false
            "#,
        );

        let all = select_organizations(&settings, &[]).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name, "acme");

        let named = select_organizations(&settings, &["legacy".to_string(), "other".to_string()]).unwrap();
        let names: Vec<&str> = named.iter().map(|org| org.name.as_str()).collect();
        assert_eq!(names, vec!["other"]);
    }

    fn vanished_member_engine(store: Arc<dyn CheckpointStore>) -> TraversalEngine {
        use ghwalk::cursor::PageInfo;
        use ghwalk::testing::{CollectingSink, FixtureFetcher, FixtureTree};
        use ghwalk::{FatalKind, FetchError, FetchTarget};

        let tree = FixtureTree::new()
            .member("A", "alice", &[])
            .member("B", "bob", &["R1"]);
        let fetcher = FixtureFetcher::new(tree)
            .with_failures(vec![FetchError::fatal(FatalKind::NotFound, "node A not found")]);
        let mut state = TraversalState::new("members", vec!["repositories".to_string()]);
        state.discover("A".into(), serde_json::json!({"login": "alice"}));
        state.discover("B".into(), serde_json::json!({"login": "bob"}));
        state.advance(&FetchTarget::Outer, PageInfo::last(), 2, 2);

        TraversalEngine::new("acme", Arc::new(fetcher), store, Box::new(CollectingSink::new()))
            .with_state(state)
    }

    #[tokio::test]
    async fn test_vanished_member_fails_without_flag() {
        let store: Arc<dyn CheckpointStore> = Arc::new(ghwalk::checkpoint::MemoryCheckpointStore::new());
        let mut engine = vanished_member_engine(store);

        let report = run_engine(&mut engine, watch::channel(false).1, false).await;

        assert_eq!(report.status(), RunStatus::Failed);
    }

    #[tokio::test]
    async fn test_vanished_member_is_skipped_with_flag() {
        let store: Arc<dyn CheckpointStore> = Arc::new(ghwalk::checkpoint::MemoryCheckpointStore::new());
        let mut engine = vanished_member_engine(store);

        let report = run_engine(&mut engine, watch::channel(false).1, true).await;

        assert_eq!(report.status(), RunStatus::Completed);
        assert_eq!(report.emitted_of(EntityKind::Member), 1);
    }
}
