/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

#[cfg(test)]
pub(crate) mod fake;
pub mod local;
pub mod ssh;

pub use local::LocalShell;
pub use ssh::SshShell;

use crate::errors::ShellError;
use std::{io, sync::Arc, time::Duration, time::Instant};
use subprocess::{Exec, ExitStatus, NullFile, Redirection};
use tracing::debug;

pub const DEFAULT_SHELL_TIMEOUT: Duration = Duration::from_secs(90);

/// Options that control how a single command is executed.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandOptions {
    pub timeout: Duration,
    /// Turn a non-zero return code into `ShellError::NonZeroExit`.
    pub check: bool,
    pub close_stdin: bool,
    /// Keep the command output out of the logs.
    pub no_log: bool,
}
impl Default for CommandOptions {
    fn default() -> Self {
        CommandOptions {
            timeout: DEFAULT_SHELL_TIMEOUT,
            check: true,
            close_stdin: false,
            no_log: false,
        }
    }
}
impl CommandOptions {
    pub fn unchecked() -> Self {
        CommandOptions {
            check: false,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    pub return_code: i32,
}

/// A command shell on some system, local or remote.
pub trait Shell: Send + Sync {
    fn exec_with(&self, command: &str, options: &CommandOptions)
        -> Result<CommandResult, ShellError>;

    /// Name of the host the commands end up on, used in logs and errors.
    fn host(&self) -> &str;

    fn exec(&self, command: &str) -> Result<CommandResult, ShellError> {
        self.exec_with(command, &CommandOptions::default())
    }
}

impl<S: Shell + ?Sized> Shell for Box<S> {
    fn exec_with(
        &self,
        command: &str,
        options: &CommandOptions,
    ) -> Result<CommandResult, ShellError> {
        (**self).exec_with(command, options)
    }

    fn host(&self) -> &str {
        (**self).host()
    }
}

impl<S: Shell + ?Sized> Shell for Arc<S> {
    fn exec_with(
        &self,
        command: &str,
        options: &CommandOptions,
    ) -> Result<CommandResult, ShellError> {
        (**self).exec_with(command, options)
    }

    fn host(&self) -> &str {
        (**self).host()
    }
}

/// Rewrites a command before it is handed to the shell.
pub trait CommandInspector: Send + Sync + std::fmt::Debug {
    fn inspect(&self, command: &str) -> String;
}

/// Prepends `sudo` unless the command already starts with it.
#[derive(Debug, Default, Clone, Copy)]
pub struct SudoInspector;
impl CommandInspector for SudoInspector {
    fn inspect(&self, command: &str) -> String {
        if command.starts_with("sudo") {
            command.to_string()
        } else {
            format!("sudo {}", command)
        }
    }
}

pub(crate) fn apply_inspectors(inspectors: &[Box<dyn CommandInspector>], command: &str) -> String {
    inspectors
        .iter()
        .fold(command.to_string(), |cmd, inspector| inspector.inspect(&cmd))
}

/// Spawns `exec`, captures both output streams and waits at most `options.timeout` for it. The
/// return code is not checked here, see `check_result`.
pub(crate) fn run_captured(
    exec: Exec,
    command: &str,
    options: &CommandOptions,
) -> Result<CommandResult, ShellError> {
    let exec = exec
        .stdout(Redirection::Pipe)
        .stderr(Redirection::Pipe);
    let exec = if options.close_stdin {
        exec.stdin(NullFile)
    } else {
        exec
    };

    let mut popen = exec.popen().map_err(|source| ShellError::Spawn {
        command: command.to_string(),
        source,
    })?;

    let captured = popen
        .communicate_start(None)
        .limit_time(options.timeout)
        .read_string();

    let (stdout, stderr) = match captured {
        Ok(streams) => streams,
        Err(err) if err.error.kind() == io::ErrorKind::TimedOut => {
            let _ = popen.kill();
            let _ = popen.wait();
            return Err(ShellError::Timeout {
                command: command.to_string(),
                timeout: options.timeout,
            });
        }
        Err(err) => {
            return Err(ShellError::Io {
                command: command.to_string(),
                source: err.error,
            })
        }
    };

    let status = popen.wait().map_err(|source| ShellError::Spawn {
        command: command.to_string(),
        source,
    })?;

    Ok(CommandResult {
        stdout: stdout.unwrap_or_default(),
        stderr: stderr.unwrap_or_default(),
        return_code: exit_code(status),
    })
}

fn exit_code(status: ExitStatus) -> i32 {
    match status {
        ExitStatus::Exited(code) => code as i32,
        ExitStatus::Signaled(signal) => 128 + signal as i32,
        ExitStatus::Other(code) => code,
        ExitStatus::Undetermined => -1,
    }
}

pub(crate) fn check_result(
    command: &str,
    result: CommandResult,
    options: &CommandOptions,
) -> Result<CommandResult, ShellError> {
    if options.check && result.return_code != 0 {
        let mut output = result.stdout;
        output.push_str(&result.stderr);
        return Err(ShellError::NonZeroExit {
            command: command.to_string(),
            code: result.return_code,
            output,
        });
    }
    Ok(result)
}

pub(crate) fn log_result(
    host: &str,
    command: &str,
    result: &CommandResult,
    started: Instant,
    options: &CommandOptions,
) {
    if options.no_log {
        debug!(
            "HOST: {} COMMAND: {} RC: {} ({:?})",
            host,
            command,
            result.return_code,
            started.elapsed()
        );
        return;
    }

    debug!(
        "HOST: {}\nCOMMAND:\n {}\nRC:\n {}\nSTDOUT:\n{}\nSTDERR:\n{}\nElapsed: {:?}",
        host,
        command,
        result.return_code,
        result.stdout,
        result.stderr,
        started.elapsed()
    );
}
