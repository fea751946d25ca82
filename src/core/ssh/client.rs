use std::io::Read;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crate::cancel::CancelToken;
use crate::defaults::{INTERRUPTED_EXIT_CODE, TIMEOUT_EXIT_CODE};
use crate::host::Host;

const POLL_INTERVAL: Duration = Duration::from_millis(20);
const INTERRUPT_GRACE: Duration = Duration::from_secs(2);

pub struct SshClient {
    pub host: Host,
    /// Request a remote pseudo-terminal (`ssh -tt`).
    pub pty: bool,
    /// When true, all commands run locally instead of over SSH.
    /// Set automatically when the host address is localhost/127.0.0.1/::1.
    pub is_local: bool,
}

#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
    pub exit_code: i32,
    pub timed_out: bool,
    pub interrupted: bool,
}

impl CommandOutput {
    fn spawn_error(err: std::io::Error) -> Self {
        Self {
            stderr: format!("Command error: {}", err),
            exit_code: -1,
            ..Self::default()
        }
    }

    /// SSH exit code 255 or a well-known connection message means the
    /// command never ran on the remote side.
    pub fn is_connection_error(&self) -> bool {
        let stderr = self.stderr.to_lowercase();
        let transient_patterns = [
            "connection refused",
            "connection reset",
            "connection timed out",
            "no route to host",
            "network is unreachable",
            "temporary failure in name resolution",
            "could not resolve hostname",
            "broken pipe",
            "ssh_exchange_identification",
            "connection closed by remote host",
        ];

        self.exit_code == 255 || transient_patterns.iter().any(|p| stderr.contains(p))
    }
}

/// Limits applied while waiting for a command.
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    pub timeout: Option<Duration>,
    pub cancel: Option<CancelToken>,
}

impl SshClient {
    pub fn new(host: Host, pty: bool) -> Self {
        let is_local = host.is_local();
        Self {
            host,
            pty,
            is_local,
        }
    }

    fn build_ssh_args(&self, command: &str) -> Vec<String> {
        let mut args = Vec::new();

        if let Some(identity_file) = &self.host.identity_file {
            args.push("-i".to_string());
            args.push(identity_file.clone());
        }

        if self.host.port != 22 {
            args.push("-p".to_string());
            args.push(self.host.port.to_string());
        }

        if self.pty {
            args.push("-tt".to_string());
        }

        // Never prompt: a prompt would hang until the command timeout.
        args.extend([
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "ConnectTimeout=10".to_string(),
            "-o".to_string(),
            "ServerAliveInterval=15".to_string(),
            "-o".to_string(),
            "ServerAliveCountMax=3".to_string(),
        ]);

        args.push(self.host.destination());
        args.push(command.to_string());

        args
    }

    pub fn execute(&self, command: &str, options: &ExecOptions) -> CommandOutput {
        if self.is_local {
            return execute_local_command_in_dir(command, None, options);
        }

        let mut cmd = Command::new("ssh");
        cmd.args(self.build_ssh_args(command));
        run_with_limits(cmd, options)
    }
}

/// Run a shell command on this machine, optionally inside `current_dir`.
pub fn execute_local_command_in_dir(
    command: &str,
    current_dir: Option<&str>,
    options: &ExecOptions,
) -> CommandOutput {
    let mut cmd = Command::new("sh");
    cmd.args(["-c", command]);

    if let Some(dir) = current_dir {
        cmd.current_dir(dir);
    }

    run_with_limits(cmd, options)
}

enum Outcome {
    Exited(ExitStatus),
    TimedOut,
    Interrupted,
    WaitFailed(std::io::Error),
}

fn run_with_limits(mut cmd: Command, options: &ExecOptions) -> CommandOutput {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    // Own process group, so a timeout also reaches whatever the shell spawned.
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(err) => return CommandOutput::spawn_error(err),
    };

    let stdout_reader = child.stdout.take().map(|mut out| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = out.read_to_end(&mut buf);
            buf
        })
    });
    let stderr_reader = child.stderr.take().map(|mut err| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = err.read_to_end(&mut buf);
            buf
        })
    });

    let started = Instant::now();
    let outcome = loop {
        match child.try_wait() {
            Ok(Some(status)) => break Outcome::Exited(status),
            Ok(None) => {}
            Err(err) => break Outcome::WaitFailed(err),
        }

        if options.cancel.as_ref().is_some_and(|c| c.is_cancelled()) {
            interrupt(&mut child);
            break Outcome::Interrupted;
        }

        if options.timeout.is_some_and(|limit| started.elapsed() >= limit) {
            kill(&mut child);
            break Outcome::TimedOut;
        }

        thread::sleep(POLL_INTERVAL);
    };

    let stdout = collect(stdout_reader);
    let mut stderr = collect(stderr_reader);

    match outcome {
        Outcome::Exited(status) => CommandOutput {
            stdout,
            stderr,
            success: status.success(),
            exit_code: status.code().unwrap_or(-1),
            timed_out: false,
            interrupted: false,
        },
        Outcome::TimedOut => {
            if let Some(limit) = options.timeout {
                stderr.push_str(&format!("\nCommand timed out after {}s", limit.as_secs_f64()));
            }
            CommandOutput {
                stdout,
                stderr,
                success: false,
                exit_code: TIMEOUT_EXIT_CODE,
                timed_out: true,
                interrupted: false,
            }
        }
        Outcome::Interrupted => {
            stderr.push_str("\nCommand interrupted by cancellation");
            CommandOutput {
                stdout,
                stderr,
                success: false,
                exit_code: INTERRUPTED_EXIT_CODE,
                timed_out: false,
                interrupted: true,
            }
        }
        Outcome::WaitFailed(err) => CommandOutput {
            stdout,
            stderr: format!("{}\nFailed to wait for command: {}", stderr, err),
            exit_code: -1,
            ..CommandOutput::default()
        },
    }
}

fn collect(reader: Option<thread::JoinHandle<Vec<u8>>>) -> String {
    reader
        .and_then(|handle| handle.join().ok())
        .map(|buf| String::from_utf8_lossy(&buf).to_string())
        .unwrap_or_default()
}

/// SIGINT to the process group, then SIGKILL if it does not exit in time.
fn interrupt(child: &mut Child) {
    signal_group(child, SignalKind::Interrupt);

    let deadline = Instant::now() + INTERRUPT_GRACE;
    while Instant::now() < deadline {
        if let Ok(Some(_)) = child.try_wait() {
            return;
        }
        thread::sleep(POLL_INTERVAL);
    }

    kill(child);
}

fn kill(child: &mut Child) {
    signal_group(child, SignalKind::Kill);
    let _ = child.kill();
    let _ = child.wait();
}

enum SignalKind {
    Interrupt,
    Kill,
}

#[cfg(unix)]
fn signal_group(child: &Child, kind: SignalKind) {
    let signal = match kind {
        SignalKind::Interrupt => libc::SIGINT,
        SignalKind::Kill => libc::SIGKILL,
    };
    // process_group(0) made the child a group leader; a negative pid addresses the group.
    unsafe {
        libc::kill(-(child.id() as libc::pid_t), signal);
    }
}

#[cfg(not(unix))]
fn signal_group(_child: &Child, _kind: SignalKind) {}
