/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use super::{
    apply_inspectors, check_result, log_result, run_captured, CommandInspector, CommandOptions,
    CommandResult, Shell,
};
use crate::{errors::ShellError, retry::RetryPolicy};
use std::{ops::ControlFlow, path::PathBuf, time::Duration, time::Instant};
use subprocess::Exec;
use tracing::{info, warn};

/// Exit code the ssh client uses for its own (connection) failures.
const SSH_CONNECTION_FAILED: i32 = 255;
const SSH_CONNECTION_ATTEMPTS: u32 = 3;
const SSH_RECONNECT_INTERVAL: Duration = Duration::from_secs(3);

/// Runs commands on a remote host through the system `ssh` client.
#[derive(Debug)]
pub struct SshShell {
    host: String,
    port: u16,
    login: String,
    private_key_path: Option<PathBuf>,
    reconnect: RetryPolicy,
    inspectors: Vec<Box<dyn CommandInspector>>,
}
impl SshShell {
    pub fn new(host: impl Into<String>, port: u16, login: impl Into<String>) -> Self {
        SshShell {
            host: host.into(),
            port,
            login: login.into(),
            private_key_path: None,
            reconnect: RetryPolicy::fixed(SSH_CONNECTION_ATTEMPTS, SSH_RECONNECT_INTERVAL),
            inspectors: vec![],
        }
    }

    pub fn with_private_key(mut self, path: impl Into<PathBuf>) -> Self {
        self.private_key_path = Some(path.into());
        self
    }

    pub fn with_reconnect_policy(mut self, policy: RetryPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    pub fn with_inspector(mut self, inspector: impl CommandInspector + 'static) -> Self {
        self.inspectors.push(Box::new(inspector));
        self
    }

    /// Arguments handed to the `ssh` binary, the remote command last.
    pub fn ssh_args(&self, command: &str, options: &CommandOptions) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "LogLevel=ERROR".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", options.timeout.as_secs().max(1)),
            "-p".to_string(),
            self.port.to_string(),
        ];
        if let Some(key) = &self.private_key_path {
            args.push("-i".to_string());
            args.push(key.to_string_lossy().to_string());
        }
        if options.close_stdin {
            args.push("-n".to_string());
        }
        args.push(format!("{}@{}", self.login, self.host));
        args.push(command.to_string());
        args
    }
}

impl Shell for SshShell {
    fn exec_with(
        &self,
        command: &str,
        options: &CommandOptions,
    ) -> Result<CommandResult, ShellError> {
        let command = apply_inspectors(&self.inspectors, command);
        info!("Execute command \"{}\" on \"{}\"", command, self.host);

        let started = Instant::now();
        let result = self.reconnect.run(|attempt| -> Result<_, ShellError> {
            let args = self.ssh_args(&command, options);
            let exec = Exec::cmd("ssh").args(args.as_slice());
            let result = run_captured(exec, &command, options)?;
            if result.return_code == SSH_CONNECTION_FAILED {
                warn!(
                    "Connection to {} failed (attempt {}): {}",
                    self.host,
                    attempt + 1,
                    result.stderr.trim()
                );
                return Ok(ControlFlow::Continue(()));
            }
            Ok(ControlFlow::Break(result))
        })?;

        let result = result.ok_or_else(|| ShellError::HostNotAvailable(self.host.clone()))?;
        log_result(&self.host, &command, &result, started, options);

        check_result(&command, result, options)
    }

    fn host(&self) -> &str {
        &self.host
    }
}
