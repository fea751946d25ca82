use clap::Args;
use serde::Serialize;

use cutover::deploy::{DeploymentOrchestrator, HostReleases};

use super::{CmdResult, GlobalArgs};

#[derive(Args)]
pub struct ReleasesArgs {}

#[derive(Serialize)]
pub struct ReleasesOutput {
    pub command: String,
    pub application: String,
    pub deploy_to: String,
    pub hosts: Vec<HostReleases>,
}

pub fn run(_args: ReleasesArgs, global: &GlobalArgs) -> CmdResult<ReleasesOutput> {
    let config = global.load_config()?;
    let hosts = DeploymentOrchestrator::from_config(&config, global.cancel.clone())?.releases()?;

    Ok((
        ReleasesOutput {
            command: "releases".to_string(),
            application: config.application.clone(),
            deploy_to: config.deploy_root(),
            hosts,
        },
        0,
    ))
}
