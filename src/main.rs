use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod output;

use commands::{check, deploy, releases, rollback, GlobalArgs};
use cutover::CancelToken;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "cutover")]
#[command(version = VERSION)]
#[command(about = "Release-based deployments with an atomic `current` switch")]
struct Cli {
    /// Config file (default: deploy.json or deploy.toml in the working directory)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Apply the named entry under `stages` on top of the base config
    #[arg(long, global = true, value_name = "NAME")]
    stage: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Deploy a new release and switch `current` to it
    Deploy(deploy::DeployArgs),
    /// Point `current` back at the previous release
    Rollback(rollback::RollbackArgs),
    /// List releases and the active one on every host
    Releases(releases::ReleasesArgs),
    /// Verify targets, directory layout and linked files
    Check(check::CheckArgs),
}

fn main() -> std::process::ExitCode {
    let cli = Cli::parse();

    let cancel = CancelToken::new();
    install_interrupt_handler(&cancel);

    let global = GlobalArgs {
        config: cli.config,
        stage: cli.stage,
        cancel,
    };

    let (json_result, exit_code) = commands::run_json(cli.command, &global);
    if let Err(err) = output::print_json_result(json_result) {
        eprintln!("[cutover] {}", err);
    }

    std::process::ExitCode::from(exit_code_to_u8(exit_code))
}

/// First Ctrl-C cancels cooperatively: the running step is interrupted and
/// no further stage starts.
fn install_interrupt_handler(cancel: &CancelToken) {
    let token = cancel.clone();
    let installed = ctrlc::set_handler(move || {
        eprintln!("[cutover] Interrupted, stopping after the current step");
        token.cancel();
    });
    if let Err(err) = installed {
        eprintln!("[cutover] Could not install interrupt handler: {}", err);
    }
}

fn exit_code_to_u8(code: i32) -> u8 {
    if code <= 0 {
        0
    } else if code >= 255 {
        255
    } else {
        code as u8
    }
}
