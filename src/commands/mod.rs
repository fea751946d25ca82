use std::path::PathBuf;

use cutover::{CancelToken, DeployConfig, Error};

pub type CmdResult<T> = cutover::Result<(T, i32)>;

/// Flags shared by every command, plus the interrupt token.
pub(crate) struct GlobalArgs {
    pub config: Option<PathBuf>,
    pub stage: Option<String>,
    pub cancel: CancelToken,
}

impl GlobalArgs {
    /// Load, overlay and validate the deploy config.
    pub fn load_config(&self) -> cutover::Result<DeployConfig> {
        let cwd = std::env::current_dir().map_err(|e| {
            Error::internal_io(e.to_string(), Some("read working directory".to_string()))
        })?;
        DeployConfig::resolve(self.config.as_deref(), &cwd, self.stage.as_deref())
    }
}

pub mod check;
pub mod deploy;
pub mod releases;
pub mod rollback;

macro_rules! dispatch {
    ($args:expr, $global:expr, $module:ident) => {
        crate::output::map_cmd_result_to_json($module::run($args, $global))
    };
}

pub(crate) fn run_json(
    command: crate::Commands,
    global: &GlobalArgs,
) -> (cutover::Result<serde_json::Value>, i32) {
    match command {
        crate::Commands::Deploy(args) => dispatch!(args, global, deploy),
        crate::Commands::Rollback(args) => dispatch!(args, global, rollback),
        crate::Commands::Releases(args) => dispatch!(args, global, releases),
        crate::Commands::Check(args) => dispatch!(args, global, check),
    }
}
