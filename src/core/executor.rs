//! Remote command execution across a set of hosts.
//!
//! `Transport` runs one command on one host; `RemoteExecutor` fans a command
//! out to many hosts in parallel, waits for all of them, and decides whether
//! the call as a whole succeeded.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::error::{Error, RemoteCommandFailedDetails, Result};
use crate::host::Host;
use crate::ssh::{CommandOutput, ExecOptions, SshClient};
use crate::utils::shell;

/// Runs a fully composed shell command on one host.
pub trait Transport: Send + Sync {
    fn execute(&self, host: &Host, command: &str, options: &ExecOptions) -> CommandOutput;
}

/// Default transport: the system `ssh` binary, or `sh` for localhost.
#[derive(Debug, Clone, Copy, Default)]
pub struct SshTransport {
    pub pty: bool,
}

impl SshTransport {
    pub fn new(pty: bool) -> Self {
        Self { pty }
    }
}

impl Transport for SshTransport {
    fn execute(&self, host: &Host, command: &str, options: &ExecOptions) -> CommandOutput {
        SshClient::new(host.clone(), self.pty).execute(command, options)
    }
}

/// Result of a command on a single host.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HostOutput {
    pub host: String,
    pub success: bool,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub timed_out: bool,
}

impl HostOutput {
    fn from_output(host: &Host, output: CommandOutput) -> (Self, bool) {
        let connection_error = !output.success && output.is_connection_error();
        (
            Self {
                host: host.id.clone(),
                success: output.success,
                exit_code: output.exit_code,
                stdout: output.stdout,
                stderr: output.stderr,
                timed_out: output.timed_out,
            },
            connection_error,
        )
    }
}

#[derive(Clone)]
pub struct RemoteExecutor {
    transport: Arc<dyn Transport>,
    options: ExecOptions,
}

impl RemoteExecutor {
    pub fn new(transport: Arc<dyn Transport>, timeout: Option<Duration>) -> Self {
        Self {
            transport,
            options: ExecOptions {
                timeout,
                cancel: None,
            },
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.options.cancel = Some(cancel);
        self
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::clone(&self.transport)
    }

    pub fn options(&self) -> &ExecOptions {
        &self.options
    }

    /// Run `command` on every host and require all of them to succeed.
    ///
    /// Hosts run in parallel; the call returns once every host finished. On
    /// failure the error names the first failing host (in `hosts` order) and
    /// carries its captured output.
    pub fn run(
        &self,
        hosts: &[Host],
        command: &str,
        cwd: Option<&str>,
        env: &BTreeMap<String, String>,
    ) -> Result<Vec<HostOutput>> {
        let outputs = self.dispatch(hosts, command, cwd, env)?;

        let failed: Vec<&(HostOutput, bool)> =
            outputs.iter().filter(|(output, _)| !output.success).collect();

        if let Some((first, connection_error)) = failed.first() {
            let details = RemoteCommandFailedDetails {
                host: first.host.clone(),
                command: command.to_string(),
                exit_code: first.exit_code,
                stdout: first.stdout.clone(),
                stderr: first.stderr.clone(),
                failed_hosts: failed.iter().map(|(o, _)| o.host.clone()).collect(),
            };
            let mut err = if first.timed_out {
                Error::remote_command_timeout(details)
            } else {
                Error::remote_command_failed(details)
            };
            if *connection_error {
                err.retryable = Some(true);
                err = err.with_hint("The host could not be reached; check network and SSH access");
            }
            return Err(err);
        }

        Ok(outputs.into_iter().map(|(output, _)| output).collect())
    }

    /// Run `command` on every host and return each result, failed or not.
    pub fn run_tolerant(
        &self,
        hosts: &[Host],
        command: &str,
        cwd: Option<&str>,
        env: &BTreeMap<String, String>,
    ) -> Result<Vec<HostOutput>> {
        Ok(self
            .dispatch(hosts, command, cwd, env)?
            .into_iter()
            .map(|(output, _)| output)
            .collect())
    }

    fn dispatch(
        &self,
        hosts: &[Host],
        command: &str,
        cwd: Option<&str>,
        env: &BTreeMap<String, String>,
    ) -> Result<Vec<(HostOutput, bool)>> {
        if hosts.is_empty() {
            return Err(Error::validation_invalid_argument(
                "hosts",
                "Remote command requires at least one host",
                None,
            ));
        }

        let full_command = compose_command(command, cwd, env);

        if hosts.len() == 1 {
            let host = &hosts[0];
            log_status!("remote", "{} $ {}", host.id, command);
            let output = self.transport.execute(host, &full_command, &self.options);
            return Ok(vec![HostOutput::from_output(host, output)]);
        }

        let handles: Vec<_> = hosts
            .iter()
            .map(|host| {
                let host = host.clone();
                let transport = Arc::clone(&self.transport);
                let options = self.options.clone();
                let full_command = full_command.clone();
                log_status!("remote", "{} $ {}", host.id, command);
                thread::spawn(move || {
                    let output = transport.execute(&host, &full_command, &options);
                    HostOutput::from_output(&host, output)
                })
            })
            .collect();

        let mut outputs = Vec::with_capacity(hosts.len());
        for handle in handles {
            outputs.push(handle.join().map_err(|_| {
                Error::internal_unexpected("Remote execution thread panicked".to_string())
            })?);
        }

        Ok(outputs)
    }
}

/// `cd <cwd> && export K=V && <command>`, with every interpolated value quoted.
pub fn compose_command(command: &str, cwd: Option<&str>, env: &BTreeMap<String, String>) -> String {
    let mut parts = Vec::new();

    if let Some(dir) = cwd {
        parts.push(format!("cd {}", shell::quote_path(dir)));
    }

    if !env.is_empty() {
        let assignments: Vec<String> = env
            .iter()
            .map(|(key, value)| format!("{}={}", key, shell::quote_arg(value)))
            .collect();
        parts.push(format!("export {}", assignments.join(" ")));
    }

    parts.push(command.to_string());
    parts.join(" && ")
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Transport that records every command and fails on chosen hosts.
    #[derive(Default)]
    pub struct ScriptedTransport {
        pub calls: Mutex<Vec<(String, String)>>,
        pub failing_hosts: Vec<String>,
        pub fail_when_contains: Option<String>,
    }

    impl ScriptedTransport {
        pub fn failing_on(host: &str, needle: &str) -> Self {
            Self {
                failing_hosts: vec![host.to_string()],
                fail_when_contains: Some(needle.to_string()),
                ..Self::default()
            }
        }

        pub fn commands_for(&self, host: &str) -> Vec<String> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|(h, _)| h == host)
                .map(|(_, c)| c.clone())
                .collect()
        }
    }

    impl Transport for ScriptedTransport {
        fn execute(&self, host: &Host, command: &str, _options: &ExecOptions) -> CommandOutput {
            self.calls
                .lock()
                .unwrap()
                .push((host.id.clone(), command.to_string()));

            let matches = self
                .fail_when_contains
                .as_ref()
                .is_none_or(|needle| command.contains(needle.as_str()));
            if matches && self.failing_hosts.contains(&host.id) {
                return CommandOutput {
                    stdout: format!("partial output on {}", host.id),
                    stderr: "build failed".to_string(),
                    success: false,
                    exit_code: 1,
                    ..CommandOutput::default()
                };
            }

            CommandOutput {
                stdout: format!("ok {}", host.id),
                success: true,
                ..CommandOutput::default()
            }
        }
    }
}
