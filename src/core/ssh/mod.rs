mod client;

pub use client::{execute_local_command_in_dir, CommandOutput, ExecOptions, SshClient};
