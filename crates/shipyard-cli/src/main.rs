//! Shipyard - multi-environment delivery pipeline CLI
//!
//! The `shipyard` command drives the delivery pipeline described by
//! `shipyard.toml`.
//!
//! ## Commands
//!
//! - `synth`: regenerate the resource graph and check it against policy
//! - `deploy`: run the full pipeline, dev through production
//! - `test`: build and run the verification steps only
//! - `approve`: grant or reject a pending manual approval
//! - `annotate`: turn synthesis log lines into grouped JSON annotations
//! - `suppressions`: list the compliance exception ledger

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use shipyard_core::graph::ResourceGraph;
use shipyard_core::safety_net::{CommandReplicaRuntime, HttpHealthChecker};
use shipyard_core::{
    capture_head_revision, parse_annotations, policy, CommandImageRegistry, RuntimeInfrastructure,
    ShipyardConfig, StepId,
};
use shipyard_pipeline::{
    standard_pipeline, verification_pipeline, ApprovalVerdict, ComplianceGate, ExecutionContext,
    Pipeline, PipelineRunner, StoreApproval,
};
use shipyard_state::{
    ImageRegistry, ParameterStore, RunLedger, SurrealHandle, SurrealParameterStore,
    SurrealRunLedger,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};

/// Timeout of a single replica health check.
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "shipyard")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Multi-environment delivery pipelines", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Pipeline configuration file
    #[arg(
        short,
        long,
        global = true,
        default_value = "shipyard.toml",
        env = "SHIPYARD_CONFIG"
    )]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Regenerate the resource graph and run the policy checks
    Synth {
        /// Directory receiving `resource-graph.json`
        #[arg(short, long, default_value = "shipyard.out")]
        out: PathBuf,
    },

    /// Run the delivery pipeline
    Deploy {
        /// Write the run report as JSON to this file
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// Build and run the verification steps without deploying
    Test {
        /// Write the run report as JSON to this file
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// Decide a pending manual approval
    Approve {
        /// Pipeline name
        pipeline: String,

        /// Approval step, e.g. `approve-production`
        step: String,

        /// Reject instead of approving, with this reason
        #[arg(long)]
        reject: Option<String>,

        /// Who is deciding
        #[arg(long, env = "USER")]
        approver: Option<String>,
    },

    /// Group `[Error at /path] message` lines of a log into JSON
    Annotate {
        /// Log file to read (`-` for stdin)
        #[arg(short, long, default_value = "-")]
        input: PathBuf,

        /// Output file (stdout when omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// List the compliance exception ledger
    Suppressions,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    shipyard_core::init_tracing(cli.json, level);

    match cli.command {
        Commands::Synth { out } => cmd_synth(&load_config(&cli.config)?, &out),
        Commands::Deploy { report } => {
            let config = Arc::new(load_config(&cli.config)?);
            let pipeline = standard_pipeline(&config)?;
            cmd_run(config, pipeline, true, report.as_deref()).await
        }
        Commands::Test { report } => {
            let config = Arc::new(load_config(&cli.config)?);
            let pipeline = verification_pipeline(&config)?;
            cmd_run(config, pipeline, false, report.as_deref()).await
        }
        Commands::Approve {
            pipeline,
            step,
            reject,
            approver,
        } => {
            let config = load_config(&cli.config)?;
            cmd_approve(&config, &pipeline, &step, reject, approver).await
        }
        Commands::Annotate { input, output } => cmd_annotate(&input, output.as_deref()),
        Commands::Suppressions => cmd_suppressions(&load_config(&cli.config)?, cli.json),
    }
}

fn load_config(path: &Path) -> Result<ShipyardConfig> {
    ShipyardConfig::load(path).with_context(|| format!("Failed to load {}", path.display()))
}

fn cmd_synth(config: &ShipyardConfig, out: &Path) -> Result<()> {
    let graph = ResourceGraph::synthesize(config)?;
    std::fs::create_dir_all(out).with_context(|| format!("Failed to create {}", out.display()))?;
    let path = out.join("resource-graph.json");
    std::fs::write(&path, graph.to_json()?)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    let digest = graph.digest()?;
    println!("{} resources -> {}", graph.len(), path.display());
    println!("digest: {digest}");

    if !config.runtime.mode.policy_checks_enabled() {
        info!(mode = %config.runtime.mode, "policy checks disabled in this mode");
        return Ok(());
    }

    let ledger = config.compliance_ledger()?;
    let findings = policy::evaluate(&graph);
    for record in ledger.unused(&findings) {
        warn!(
            resource = %record.resource_path,
            rule = %record.rule_id,
            "suppression matches no finding"
        );
    }
    let verdict = ComplianceGate::evaluate(&ledger, findings, config.policy.policy_threshold);
    for line in verdict.annotations() {
        println!("{line}");
    }
    if !verdict.passed {
        bail!("Policy check failed: {}", verdict.message);
    }
    println!("policy: {}", verdict.message);
    Ok(())
}

/// Open the persistent state shared by `deploy`, `test` and `approve`.
async fn open_state(
    config: &ShipyardConfig,
) -> Result<(Arc<dyn ParameterStore>, Arc<dyn RunLedger>)> {
    let handle = Arc::new(
        SurrealHandle::setup_from_env(&config.state.url)
            .await
            .context("Failed to open Shipyard state database")?,
    );
    Ok((
        Arc::new(SurrealParameterStore::new(handle.clone())),
        Arc::new(SurrealRunLedger::new(handle)),
    ))
}

fn source_revision(config: &ShipyardConfig) -> Result<String> {
    match &config.runtime.revision {
        Some(revision) => Ok(revision.clone()),
        None => capture_head_revision(Path::new("."))
            .context("No SHIPYARD_REVISION set and `git rev-parse HEAD` failed"),
    }
}

/// Infrastructure for the run; environment runtimes are only needed when
/// the pipeline deploys.
fn infrastructure(
    config: &ShipyardConfig,
    registry: Arc<dyn ImageRegistry>,
    store: Arc<dyn ParameterStore>,
    deploys: bool,
) -> Result<RuntimeInfrastructure> {
    let mut infrastructure = RuntimeInfrastructure::new(registry, store);
    if !deploys {
        return Ok(infrastructure);
    }
    let checker = Arc::new(HttpHealthChecker::new(HEALTH_CHECK_TIMEOUT)?);
    for env in &config.environments {
        let runtime = CommandReplicaRuntime::new(env.runtime.clone(), checker.clone())
            .with_context(|| format!("Environment {} has no usable runtime", env.name))?;
        infrastructure = infrastructure.with_environment(env.name.clone(), Arc::new(runtime));
    }
    Ok(infrastructure)
}

async fn cmd_run(
    config: Arc<ShipyardConfig>,
    pipeline: Pipeline,
    deploys: bool,
    report_path: Option<&Path>,
) -> Result<()> {
    let (store, ledger) = open_state(&config).await?;
    let registry: Arc<dyn ImageRegistry> =
        Arc::new(CommandImageRegistry::new(config.registry.clone()));
    let infrastructure = Arc::new(infrastructure(
        &config,
        registry.clone(),
        store.clone(),
        deploys,
    )?);
    let approvals = Arc::new(StoreApproval::new(
        store.clone(),
        Duration::from_secs(config.pipeline.approval_poll_secs),
    ));
    let revision = source_revision(&config)?;

    let cancel = CancellationToken::new();
    let ctx = ExecutionContext::new(
        config,
        store,
        registry,
        infrastructure,
        approvals,
        revision,
    )?
    .with_cancel(cancel.clone());

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling run");
            cancel.cancel();
        }
    });

    let report = PipelineRunner::new(ledger).run(&pipeline, ctx).await?;
    print!("{}", report.render_text());
    if let Some(path) = report_path {
        std::fs::write(path, serde_json::to_string_pretty(&report)?)
            .with_context(|| format!("Failed to write {}", path.display()))?;
    }

    if !report.success() {
        let failed: Vec<String> = report
            .failed_members()
            .iter()
            .map(|m| format!("{} ({})", m.id, m.detail))
            .collect();
        bail!(
            "Pipeline {} {}: {}",
            report.pipeline,
            report.status.as_str(),
            failed.join("; ")
        );
    }
    Ok(())
}

async fn cmd_approve(
    config: &ShipyardConfig,
    pipeline: &str,
    step: &str,
    reject: Option<String>,
    approver: Option<String>,
) -> Result<()> {
    let (store, _) = open_state(config).await?;
    let verdict = if reject.is_some() {
        ApprovalVerdict::Rejected
    } else {
        ApprovalVerdict::Approved
    };
    let decision = StoreApproval::decide(
        store.as_ref(),
        pipeline,
        &StepId::new(step),
        verdict,
        reject,
        approver,
    )
    .await?;
    let verb = match decision.decision {
        ApprovalVerdict::Approved => "approved",
        ApprovalVerdict::Rejected => "rejected",
    };
    println!("{pipeline}/{step}: {verb} for run {}", decision.run_id);
    Ok(())
}

fn cmd_annotate(input: &Path, output: Option<&Path>) -> Result<()> {
    let log = if input == Path::new("-") {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("Failed to read stdin")?;
        buf
    } else {
        std::fs::read_to_string(input)
            .with_context(|| format!("Failed to read {}", input.display()))?
    };
    let json = serde_json::to_string_pretty(&parse_annotations(&log))?;
    match output {
        Some(path) => std::fs::write(path, json)
            .with_context(|| format!("Failed to write {}", path.display()))?,
        None => println!("{json}"),
    }
    Ok(())
}

fn cmd_suppressions(config: &ShipyardConfig, json: bool) -> Result<()> {
    let ledger = config.compliance_ledger()?;
    if json {
        println!("{}", serde_json::to_string_pretty(ledger.records())?);
        return Ok(());
    }
    for record in ledger.records() {
        println!(
            "{:<56} {:<20} {}",
            record.resource_path.to_string(),
            record.rule_id,
            record.reason
        );
    }
    println!("{} suppression(s)", ledger.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use shipyard_core::RunMode;

    fn sample_config() -> ShipyardConfig {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../shipyard.toml");
        let source = std::fs::read_to_string(path).unwrap();
        ShipyardConfig::from_toml_str(&source).unwrap()
    }

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
        let cli = Cli::parse_from([
            "shipyard",
            "approve",
            "shipyard-delivery",
            "approve-production",
            "--reject",
            "change freeze",
        ]);
        match cli.command {
            Commands::Approve { step, reject, .. } => {
                assert_eq!(step, "approve-production");
                assert_eq!(reject.as_deref(), Some("change freeze"));
            }
            _ => panic!("expected approve"),
        }
    }

    #[test]
    fn test_synth_writes_graph_and_passes_policy() {
        let mut config = sample_config();
        config.runtime.mode = RunMode::Test;
        let out = tempfile::tempdir().unwrap();

        cmd_synth(&config, out.path()).unwrap();

        let written = std::fs::read_to_string(out.path().join("resource-graph.json")).unwrap();
        let expected = ResourceGraph::synthesize(&config).unwrap().to_json().unwrap();
        assert_eq!(written, expected);
    }

    #[tokio::test]
    async fn test_state_must_outlive_the_invocation() {
        let mut config = sample_config();
        config.state.url = "mem://".to_string();
        let overridden = std::env::var("SURREALDB_URL").is_ok()
            || std::env::var("SURREALDB_ENDPOINT").is_ok();
        if !overridden {
            let err = open_state(&config).await.err().unwrap();
            assert!(format!("{err:#}").contains("in-memory"));
        }
    }

    #[test]
    fn test_annotate_groups_by_location() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("synth.log");
        let output = dir.path().join("annotations.json");
        std::fs::write(
            &input,
            "[Error at /Dev/network] NET-OPEN-INGRESS: open\n\
             noise\n\
             [Warning at /Pipeline/role] IAM-WILDCARD: wildcard\n\
             [Error at /Dev/network] second\n",
        )
        .unwrap();

        cmd_annotate(&input, Some(&output)).unwrap();

        let parsed: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&output).unwrap()).unwrap();
        assert_eq!(parsed[0]["location"], "/Dev/network");
        assert_eq!(parsed[0]["messages"].as_array().unwrap().len(), 2);
        assert_eq!(parsed[1]["location"], "/Pipeline/role");
    }
}
