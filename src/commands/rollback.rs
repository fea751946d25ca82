use clap::Args;
use serde::Serialize;

use cutover::deploy::{DeploymentOrchestrator, RollbackReport};

use super::{CmdResult, GlobalArgs};

#[derive(Args)]
pub struct RollbackArgs {}

#[derive(Serialize)]
pub struct RollbackOutput {
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(flatten)]
    pub report: RollbackReport,
}

pub fn run(_args: RollbackArgs, global: &GlobalArgs) -> CmdResult<RollbackOutput> {
    let config = global.load_config()?;
    let report = DeploymentOrchestrator::from_config(&config, global.cancel.clone())?
        .rollback()
        .map_err(|e| {
            if e.code == cutover::ErrorCode::StorageNoPreviousRelease {
                e.with_hint("Run 'cutover releases' to see what is deployed on each host")
            } else {
                e
            }
        })?;

    Ok((
        RollbackOutput {
            command: "rollback".to_string(),
            stage: global.stage.clone(),
            report,
        },
        0,
    ))
}
