//! Command implementations.

use anyhow::Context;
use ricdeploy::checksum::{ChecksumVerifier, DigestAlgorithm};
use ricdeploy::config::{DeployConfig, XappDescriptor};
use ricdeploy::deploy::{collect_status, Collaborators, DeployPlan, LogSession};
use ricdeploy::exec::SystemCommandRunner;
use ricdeploy::observability::Diagnostics;
use ricdeploy::operator::{Answer, Confirmer, PromptPolicy};
use ricdeploy::pipeline::PipelineReport;
use ricdeploy::resources::docker::{Docker, NetworkBackend};
use ricdeploy::resources::{IdempotentResourceEnsurer, ManagedResource};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::info;

use crate::{GlobalArgs, DEFAULT_CONFIG};

fn load_config(global: &GlobalArgs) -> anyhow::Result<DeployConfig> {
    let path = match &global.config {
        Some(path) => path.clone(),
        None => {
            let fallback = PathBuf::from(DEFAULT_CONFIG);
            if !fallback.exists() {
                info!("No configuration file, using defaults");
                return Ok(DeployConfig::default());
            }
            fallback
        }
    };
    DeployConfig::load(&path).with_context(|| format!("loading {}", path.display()))
}

fn prompt_policy(global: &GlobalArgs, config: &DeployConfig) -> PromptPolicy {
    let base = if global.assume_yes {
        PromptPolicy::unattended(Answer::Yes)
    } else if global.non_interactive {
        PromptPolicy::unattended(Answer::No)
    } else {
        return config.prompt;
    };
    PromptPolicy {
        max_attempts: config.prompt.max_attempts,
        ..base
    }
}

fn build_plan(global: &GlobalArgs) -> anyhow::Result<DeployPlan> {
    let config = load_config(global)?;
    let confirmer = Confirmer::console(prompt_policy(global, &config));
    let collaborators =
        Collaborators::system(&config, confirmer).context("initializing collaborators")?;
    Ok(DeployPlan::new(config, collaborators))
}

fn write_report(path: Option<&Path>, report: &PipelineReport) -> anyhow::Result<()> {
    if let Some(path) = path {
        let json = report.to_json_pretty()?;
        std::fs::write(path, json).with_context(|| format!("writing report to {}", path.display()))?;
        info!(path = %path.display(), "Report written");
    }
    Ok(())
}

fn exit_for(report: &PipelineReport) -> ExitCode {
    if report.is_completed() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

pub(crate) async fn deploy(
    global: &GlobalArgs,
    report_path: Option<&Path>,
    skip_logs: bool,
) -> anyhow::Result<ExitCode> {
    let plan = build_plan(global)?;
    let mut ctx = plan.context();
    let report = plan.deploy().run(&mut ctx).await;
    write_report(report_path, &report)?;

    if !report.is_completed() {
        return Ok(exit_for(&report));
    }
    info!(
        xapp = ctx.xapp_name(),
        pod = ctx.pod_name().unwrap_or("-"),
        "Deployment finished"
    );
    if !skip_logs {
        if let Some(session) = plan.session() {
            session.run(&ctx).await?;
        }
    }
    Ok(ExitCode::SUCCESS)
}

pub(crate) async fn undeploy(global: &GlobalArgs, report_path: Option<&Path>) -> anyhow::Result<ExitCode> {
    let plan = build_plan(global)?;
    let mut ctx = plan.context();
    let report = plan.undeploy().run(&mut ctx).await;
    write_report(report_path, &report)?;
    Ok(exit_for(&report))
}

pub(crate) async fn status(global: &GlobalArgs, json: bool) -> anyhow::Result<ExitCode> {
    let plan = build_plan(global)?;
    let report = collect_status(plan.config(), plan.collaborators()).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{report}");
    }
    Ok(ExitCode::SUCCESS)
}

pub(crate) async fn reclaim(global: &GlobalArgs, ports: &[u16]) -> anyhow::Result<ExitCode> {
    let plan = build_plan(global)?;
    let reclaimer = plan.reclaimer();
    let diagnostics = Diagnostics::stderr();

    for &port in ports {
        let step = format!("reclaim {port}");
        let outcome = reclaimer.reclaim(port).await;
        if outcome.is_freed() {
            let message = match outcome.reservation().owner_pid {
                Some(pid) => format!("freed from pid {pid}"),
                None => "already free".to_string(),
            };
            diagnostics.ok(&step, &message);
        } else {
            let err = outcome.into_result().err().map(|e| e.to_string()).unwrap_or_default();
            diagnostics.fail(&step, &err);
            return Ok(ExitCode::FAILURE);
        }
    }
    Ok(ExitCode::SUCCESS)
}

pub(crate) async fn verify(source: &Path, dest: &Path, algorithm: DigestAlgorithm) -> ExitCode {
    let outcome = ChecksumVerifier::new(algorithm).verify_files(source, dest).await;
    let pair = outcome.pair();
    println!("{}  {}", pair.source_digest, source.display());
    println!("{}  {}", pair.dest_digest, dest.display());

    let diagnostics = Diagnostics::stderr();
    if outcome.is_match() {
        diagnostics.ok("verify", &format!("{algorithm} digests match"));
        ExitCode::SUCCESS
    } else {
        diagnostics.fail("verify", &format!("{algorithm} digests differ"));
        ExitCode::FAILURE
    }
}

pub(crate) async fn ensure_network(name: &str, driver: Option<String>) -> anyhow::Result<ExitCode> {
    let docker = Docker::new(Arc::new(SystemCommandRunner::new()));
    let resource = ManagedResource::new(name, Arc::new(NetworkBackend::new(docker).with_driver(driver)));
    let outcome = IdempotentResourceEnsurer::new()
        .ensure(&resource)
        .await?
        .into_result(&resource)?;
    println!("{}", serde_json::to_string(&outcome)?);
    Ok(ExitCode::SUCCESS)
}

pub(crate) async fn logs(global: &GlobalArgs) -> anyhow::Result<ExitCode> {
    let plan = build_plan(global)?;
    let config = plan.config();
    let mut ctx = plan.context();
    if let Some(path) = &config.xapp.descriptor {
        ctx.apply_descriptor(&XappDescriptor::load(path).await?);
    }
    ctx.require_xapp_name()?;

    let cluster = plan.cluster();
    if let Some(pod) = cluster
        .pods_by_label(&ctx.selector())
        .await?
        .into_iter()
        .find(|pod| pod.is_running())
    {
        ctx.set_pod_name(pod.name);
    }

    let session = LogSession::new(cluster, config.session.clone().unwrap_or_default());
    session.run(&ctx).await?;
    Ok(ExitCode::SUCCESS)
}
