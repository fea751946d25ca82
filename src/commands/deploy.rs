use clap::Args;
use serde::Serialize;

use cutover::deploy::{DeployPlan, DeployReport, DeploymentOrchestrator};

use super::{CmdResult, GlobalArgs};

#[derive(Args)]
pub struct DeployArgs {
    /// Show stages, steps and rendered hook commands without touching any host
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Serialize)]
pub struct DeployOutput {
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    pub dry_run: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<DeployPlan>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<DeployReport>,
}

pub fn run(args: DeployArgs, global: &GlobalArgs) -> CmdResult<DeployOutput> {
    let config = global.load_config()?;
    let orchestrator = DeploymentOrchestrator::from_config(&config, global.cancel.clone())?;

    if args.dry_run {
        let plan = orchestrator.plan()?;
        return Ok((
            DeployOutput {
                command: "deploy.plan".to_string(),
                stage: global.stage.clone(),
                dry_run: true,
                plan: Some(plan),
                report: None,
            },
            0,
        ));
    }

    // A failed run surfaces as an error carrying the full report.
    let report = orchestrator.run().into_result()?;

    Ok((
        DeployOutput {
            command: "deploy.run".to_string(),
            stage: global.stage.clone(),
            dry_run: false,
            plan: None,
            report: Some(report),
        },
        0,
    ))
}
