//! Bundle Updater CLI - Main entry point for CLI binary
//!
//! Drives selection, verification and installation from the command line
//! with feeds and artifacts on the local filesystem.

use anyhow::{bail, Context, Result};
use bundle_updater::engine::{
    cli::formatter::{format_size, state_label, CliFormatter},
    cli::{Cli, Commands, FeedSource, OutputFormat},
    config::UpdaterConfig,
    locks::InstallLocks,
    platform,
    updater::{
        coordinator::recover_interrupted,
        host_state::HostStateStore,
        selector::SelectionReport,
        swap::{BundleSwapper, RecoveryAction},
        BundleInfo, CancellationHandle, CandidateRecord, CandidateSelector, HostState,
        IdentityInspector, InProcessChannel, InstallPlan, InstallationCoordinator, LocalFetcher,
        ManifestInspector, PatchApplier, SelectionDecision, SignatureSet, StagedIntervalPolicy,
        TrustVerifier,
    },
};
use clap::Parser;
use std::cmp::Ordering;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    if let Err(e) = run_cli(cli).await {
        CliFormatter::error(&format!("{:#}", e));
        std::process::exit(1);
    }
}

async fn run_cli(cli: Cli) -> Result<()> {
    let config_dir = cli.get_config_dir();
    let json_output = cli.format == OutputFormat::Json;
    let config = UpdaterConfig::load_or_default(&config_dir)
        .with_context(|| format!("loading config from {}", config_dir.display()))?;

    match cli.command {
        Commands::Compare { a, b } => cmd_compare(&a, &b, json_output),
        Commands::Select { source } => cmd_select(&config, &source, json_output),
        Commands::Verify {
            artifact,
            signature,
            legacy,
        } => cmd_verify(&config, &artifact, signature, legacy, json_output),
        Commands::ApplyPatch { base, patch, out } => {
            cmd_apply_patch(&base, &patch, &out, json_output)
        }
        Commands::Install { source } => cmd_install(&config, &source, json_output).await,
        Commands::Recover => cmd_recover(&config, json_output),
        Commands::Skip { version } => {
            HostStateStore::new(&config.state_dir()).record_skip(&version)?;
            if !json_output {
                CliFormatter::success(&format!("Version {} will not be offered again", version));
            }
            Ok(())
        }
        Commands::Unskip => {
            HostStateStore::new(&config.state_dir()).clear_skip()?;
            if !json_output {
                CliFormatter::success("Cleared skipped version");
            }
            Ok(())
        }
    }
}

fn cmd_compare(a: &str, b: &str, json: bool) -> Result<()> {
    let ordering = bundle_updater::engine::updater::compare_versions(a, b);
    let (symbol, word) = match ordering {
        Ordering::Less => ("<", "less"),
        Ordering::Equal => ("=", "equal"),
        Ordering::Greater => (">", "greater"),
    };
    if json {
        println!("{}", serde_json::json!({ "a": a, "b": b, "ordering": word }));
    } else {
        println!("{} {} {}", a, symbol, b);
    }
    Ok(())
}

fn load_feed(path: &Path) -> Result<Vec<CandidateRecord>> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("reading feed {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("parsing feed {}", path.display()))
}

/// Host snapshot from `--host`, or from the installed bundle plus stored state.
fn load_host(config: &UpdaterConfig, source: &FeedSource) -> Result<HostState> {
    let mut host = match &source.host {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("reading host state {}", path.display()))?;
            serde_json::from_str(&content)?
        }
        None => {
            let info: BundleInfo = ManifestInspector
                .inspect(&source.bundle)
                .with_context(|| format!("reading {}", source.bundle.display()))?;
            let store = HostStateStore::new(&config.state_dir());
            if !source.user_initiated {
                store.assign_rollout_group(StagedIntervalPolicy::default().groups())?;
            }
            store.load(&info.version, &platform::os_version(), &config.allowed_channels)?
        }
    };
    if source.user_initiated {
        host.rollout_group = None;
    }
    Ok(host)
}

fn select(config: &UpdaterConfig, source: &FeedSource) -> Result<SelectionReport> {
    let feed = load_feed(&source.feed)?;
    let host = load_host(config, source)?;
    info!(
        "Evaluating {} candidates against {}",
        feed.len(),
        host.current_version
    );
    Ok(CandidateSelector::default().evaluate(&feed, &host))
}

fn print_decision(decision: &SelectionDecision) {
    match decision {
        SelectionDecision::NoUpdate => CliFormatter::info("No update available"),
        SelectionDecision::FullInstall { candidate } => {
            CliFormatter::success(&format!("Update available: {}", candidate.version));
            CliFormatter::kv("Artifact", &candidate.artifact.url);
            CliFormatter::kv("Size", &format_size(candidate.artifact.length));
        }
        SelectionDecision::DeltaInstall { candidate, delta } => {
            CliFormatter::success(&format!(
                "Update available: {} (delta from {})",
                candidate.version, delta.base_version
            ));
            CliFormatter::kv("Patch", &delta.artifact.url);
            CliFormatter::kv("Size", &format_size(delta.artifact.length));
        }
    }
}

fn cmd_select(config: &UpdaterConfig, source: &FeedSource, json: bool) -> Result<()> {
    let report = select(config, source)?;

    if json {
        let rejections: Vec<_> = report
            .rejections
            .iter()
            .map(|r| {
                serde_json::json!({ "version": r.version, "reason": format!("{:?}", r.reason) })
            })
            .collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "decision": report.decision,
                "rejections": rejections,
            }))?
        );
    } else {
        print_decision(&report.decision);
        if !report.rejections.is_empty() {
            CliFormatter::header("Rejected candidates");
            for rejection in &report.rejections {
                CliFormatter::item(&format!("{}: {:?}", rejection.version, rejection.reason));
            }
        }
    }
    Ok(())
}

fn cmd_verify(
    config: &UpdaterConfig,
    artifact: &Path,
    signature: String,
    legacy: bool,
    json: bool,
) -> Result<()> {
    let verifier = TrustVerifier::new(config.trust_root()?, config.identity_policy());
    let signatures = if legacy {
        SignatureSet::legacy(signature)
    } else {
        SignatureSet::modern(signature)
    };
    let verdict = verifier
        .verify_artifact_file(artifact, &signatures)
        .with_context(|| format!("reading {}", artifact.display()))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&verdict)?);
    } else {
        CliFormatter::verdict(&verdict);
    }
    if !verdict.is_trusted() {
        std::process::exit(2);
    }
    Ok(())
}

fn cmd_apply_patch(base: &Path, patch: &Path, out: &Path, json: bool) -> Result<()> {
    let staged = PatchApplier::new().apply(base, patch, out, &CancellationHandle::new())?;
    if json {
        println!("{}", serde_json::json!({ "staged": staged }));
    } else {
        CliFormatter::success(&format!("Patched bundle written to {}", staged.display()));
    }
    Ok(())
}

async fn cmd_install(config: &UpdaterConfig, source: &FeedSource, json: bool) -> Result<()> {
    let report = select(config, source)?;
    if !report.decision.is_update() {
        if json {
            println!("{}", serde_json::json!({ "decision": report.decision }));
        } else {
            print_decision(&report.decision);
        }
        return Ok(());
    }

    let settings = config.installer_settings();
    let fetch_root = source
        .feed
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();
    let coordinator = InstallationCoordinator::new(
        TrustVerifier::new(config.trust_root()?, config.identity_policy()),
        Arc::new(LocalFetcher::with_root(fetch_root)),
        Arc::new(InProcessChannel::new(settings.state_dir.clone())),
        settings,
    );

    let cancel = CancellationHandle::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            if let Err(e) = on_interrupt.cancel() {
                CliFormatter::warning(&e.to_string());
            }
        }
    });

    let plan = InstallPlan::new(report.decision, &source.bundle);
    let result = coordinator.install(&plan, &cancel).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        CliFormatter::header(&format!("Installing {}", result.version));
        CliFormatter::history(&result.history);
        if result.used_full_fallback {
            CliFormatter::info("Delta could not be applied; installed the full update instead");
        }
        for warning in &result.warnings {
            CliFormatter::warning(warning);
        }
    }

    match result.failure() {
        Some(reason) => bail!("installation failed: {}", reason),
        None => {
            if !json {
                CliFormatter::success(&format!(
                    "{} is now {}",
                    result.installed.display(),
                    state_label(&result.outcome)
                ));
            }
            Ok(())
        }
    }
}

fn cmd_recover(config: &UpdaterConfig, json: bool) -> Result<()> {
    let state_dir = config.state_dir();
    let swapper = BundleSwapper::new(&state_dir);
    let reports = recover_interrupted(&swapper, &InstallLocks::new(&state_dir))?;

    if json {
        let values: Vec<serde_json::Value> = reports
            .iter()
            .map(|report| match &report.result {
                Ok(RecoveryAction::NothingToDo) => {
                    serde_json::json!({ "bundle": report.bundle, "action": "nothing_to_do" })
                }
                Ok(RecoveryAction::Restored(_)) => {
                    serde_json::json!({ "bundle": report.bundle, "action": "restored" })
                }
                Ok(RecoveryAction::Intact(_)) => {
                    serde_json::json!({ "bundle": report.bundle, "action": "intact" })
                }
                Err(e) => serde_json::json!({
                    "bundle": report.bundle,
                    "action": "failed",
                    "error": e.to_string(),
                }),
            })
            .collect();
        println!("{}", serde_json::Value::Array(values));
        return Ok(());
    }

    if reports.is_empty() {
        CliFormatter::info("No interrupted swap found");
    }
    for report in &reports {
        let bundle = report.bundle.display();
        match &report.result {
            Ok(RecoveryAction::NothingToDo) => {
                CliFormatter::info(&format!("{}: nothing to do", bundle))
            }
            Ok(RecoveryAction::Restored(_)) => {
                CliFormatter::warning(&format!("Restored previous bundle at {}", bundle))
            }
            Ok(RecoveryAction::Intact(_)) => {
                CliFormatter::success(&format!("{} is intact; cleaned up leftovers", bundle))
            }
            Err(e) => CliFormatter::error(&format!("Could not recover {}: {}", bundle, e)),
        }
    }
    Ok(())
}
