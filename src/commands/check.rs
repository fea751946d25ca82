use clap::Args;
use serde::Serialize;

use cutover::deploy::{CheckReport, DeploymentOrchestrator};

use super::{CmdResult, GlobalArgs};

#[derive(Args)]
pub struct CheckArgs {}

#[derive(Serialize)]
pub struct CheckOutput {
    pub command: String,
    #[serde(flatten)]
    pub report: CheckReport,
}

pub fn run(_args: CheckArgs, global: &GlobalArgs) -> CmdResult<CheckOutput> {
    let config = global.load_config()?;
    let report = DeploymentOrchestrator::from_config(&config, global.cancel.clone())?.check()?;

    Ok((
        CheckOutput {
            command: "check".to_string(),
            report,
        },
        0,
    ))
}
