/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{
    errors::ShellError,
    retry::RetryPolicy,
    shell::{CommandOptions, Shell},
};
use nanoid::nanoid;
use std::{ops::ControlFlow, sync::Arc, time::Duration};
use tracing::{debug, info};

pub const SIGTERM: i32 = 15;
pub const SIGKILL: i32 = 9;

const PID_ATTEMPTS: u32 = 50;
const PID_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}
impl Stream {
    fn file_name(&self) -> &'static str {
        match self {
            Stream::Stdout => "stdout",
            Stream::Stderr => "stderr",
        }
    }
}

/// Remembers how far into a stream the caller has already read, and the final contents once the
/// process is gone.
#[derive(Debug, Default)]
struct StreamCursor {
    last_line: usize,
    saved: Option<String>,
}

/// A process detached on some host. Its pid, return code and output streams live in a private
/// directory on that host:
///
/// * `command.sh` - wrapper script that runs the command
/// * `pid` - pid of the command
/// * `rc` - return code, written once the command exits
/// * `stdout`, `stderr` - output of the command
#[derive(Debug)]
pub struct RemoteProcess<S: Shell> {
    shell: Arc<S>,
    cmd: String,
    process_dir: String,
    pid: String,
    proc_rc: Option<i32>,
    stdout: StreamCursor,
    stderr: StreamCursor,
}

impl<S: Shell> RemoteProcess<S> {
    /// Creates the process directory on the host behind `shell` and starts `command` in the
    /// background. Returns as soon as the pid of the command is known.
    pub fn create(command: &str, shell: Arc<S>) -> Result<Self, ShellError> {
        Self::create_with(
            command,
            shell,
            RetryPolicy::fixed(PID_ATTEMPTS, PID_INTERVAL),
        )
    }

    pub fn create_with(
        command: &str,
        shell: Arc<S>,
        pid_policy: RetryPolicy,
    ) -> Result<Self, ShellError> {
        let process_dir = format!("/tmp/proc_{}", nanoid!(12, &nanoid::alphabet::SAFE));
        let mut process = RemoteProcess {
            shell,
            cmd: command.to_string(),
            process_dir,
            pid: String::new(),
            proc_rc: None,
            stdout: StreamCursor::default(),
            stderr: StreamCursor::default(),
        };

        process.create_process_dir()?;
        process.generate_command_script()?;
        process.start_process()?;
        process.pid = process.wait_for_pid(pid_policy)?;

        info!(
            "Started process {} on {} in {}",
            process.pid,
            process.shell.host(),
            process.process_dir
        );
        Ok(process)
    }

    pub fn process_dir(&self) -> &str {
        &self.process_dir
    }

    pub fn pid(&self) -> &str {
        &self.pid
    }

    pub fn command(&self) -> &str {
        &self.cmd
    }

    /// Output written since the previous call, or everything when `full` is set.
    pub fn stdout(&mut self, full: bool) -> Result<String, ShellError> {
        self.read_stream(Stream::Stdout, full)
    }

    pub fn stderr(&mut self, full: bool) -> Result<String, ShellError> {
        self.read_stream(Stream::Stderr, full)
    }

    /// Return code of the command, `None` while it is still running.
    pub fn rc(&mut self) -> Result<Option<i32>, ShellError> {
        if self.proc_rc.is_some() {
            return Ok(self.proc_rc);
        }

        let command = format!("cat {}/rc", self.process_dir);
        let terminal = self
            .shell
            .exec_with(&command, &CommandOptions::unchecked())?;
        if terminal.stderr.contains("No such file or directory") {
            return Ok(None);
        }
        if !terminal.stderr.is_empty() || terminal.return_code != 0 {
            return Err(ShellError::UnexpectedOutput {
                command,
                output: terminal.stderr,
            });
        }

        // the wrapper script may not have finished writing the file yet
        let rc = terminal.stdout.trim();
        if rc.is_empty() {
            return Ok(None);
        }
        let rc = rc.parse::<i32>().map_err(|_| ShellError::UnexpectedOutput {
            command,
            output: terminal.stdout.clone(),
        })?;

        self.proc_rc = Some(rc);
        Ok(self.proc_rc)
    }

    pub fn running(&mut self) -> Result<bool, ShellError> {
        Ok(self.rc()?.is_none())
    }

    pub fn send_signal(&self, signal: i32) -> Result<(), ShellError> {
        send_signal(self.shell.as_ref(), &self.pid, signal)
    }

    pub fn stop(&self) -> Result<(), ShellError> {
        self.send_signal(SIGTERM)
    }

    pub fn kill(&self) -> Result<(), ShellError> {
        self.send_signal(SIGKILL)
    }

    /// Removes the process directory together with everything the process wrote there.
    pub fn clear(&self) -> Result<(), ShellError> {
        if self.process_dir.trim_end_matches('/').is_empty() {
            return Err(ShellError::InvalidPath(self.process_dir.clone()));
        }
        self.shell.exec(&format!("rm -rf {}", self.process_dir))?;
        Ok(())
    }

    /// A detached handle able to SIGKILL this process without borrowing it.
    pub fn killer(&self) -> ProcessKiller<S> {
        ProcessKiller {
            shell: self.shell.clone(),
            pid: self.pid.clone(),
        }
    }

    fn read_stream(&mut self, stream: Stream, full: bool) -> Result<String, ShellError> {
        let saved = match stream {
            Stream::Stdout => self.stdout.saved.clone(),
            Stream::Stderr => self.stderr.saved.clone(),
        };
        let current = match saved {
            Some(saved) => saved,
            None => {
                let path = format!("{}/{}", self.process_dir, stream.file_name());
                let terminal = self.shell.exec_with(
                    &format!("cat {}", path),
                    &CommandOptions {
                        no_log: true,
                        ..Default::default()
                    },
                )?;
                if self.proc_rc.is_some() {
                    self.cursor(stream).saved = Some(terminal.stdout.clone());
                }
                terminal.stdout
            }
        };

        if full {
            return Ok(current);
        }
        Ok(fresh_lines(&current, &mut self.cursor(stream).last_line))
    }

    fn cursor(&mut self, stream: Stream) -> &mut StreamCursor {
        match stream {
            Stream::Stdout => &mut self.stdout,
            Stream::Stderr => &mut self.stderr,
        }
    }

    fn create_process_dir(&mut self) -> Result<(), ShellError> {
        self.shell.exec(&format!(
            "mkdir {dir}; chmod 777 {dir}",
            dir = self.process_dir
        ))?;
        let terminal = self.shell.exec(&format!("realpath {}", self.process_dir))?;
        self.process_dir = terminal.stdout.trim().to_string();
        Ok(())
    }

    fn generate_command_script(&self) -> Result<(), ShellError> {
        let script = command_script(&self.process_dir, &self.cmd);
        let script_path = format!("{}/command.sh", self.process_dir);

        self.shell.exec(&format!(
            "printf '%s\\n' {} > {}",
            shlex::try_quote(&script)?,
            script_path
        ))?;
        self.shell.exec(&format!("chmod +x {}", script_path))?;
        Ok(())
    }

    fn start_process(&self) -> Result<(), ShellError> {
        self.shell.exec(&format!(
            "nohup {dir}/command.sh </dev/null >{dir}/stdout 2>{dir}/stderr &",
            dir = self.process_dir
        ))?;
        Ok(())
    }

    fn wait_for_pid(&self, policy: RetryPolicy) -> Result<String, ShellError> {
        let command = format!("cat {}/pid", self.process_dir);
        let pid = policy.run(|attempt| -> Result<_, ShellError> {
            let terminal = self
                .shell
                .exec_with(&command, &CommandOptions::unchecked())?;
            let pid = terminal.stdout.trim();
            if terminal.return_code == 0 && !pid.is_empty() {
                return Ok(ControlFlow::Break(pid.to_string()));
            }
            debug!("pid of {} is not known yet (attempt {})", self.cmd, attempt + 1);
            Ok(ControlFlow::Continue(()))
        })?;

        pid.ok_or_else(|| ShellError::UnexpectedOutput {
            command,
            output: "invalid pid".to_string(),
        })
    }
}

/// Sends SIGKILL to a process on behalf of a scope that can no longer borrow its
/// `RemoteProcess`, e.g. from a drop guard.
#[derive(Debug)]
pub struct ProcessKiller<S: Shell> {
    shell: Arc<S>,
    pid: String,
}
impl<S: Shell> ProcessKiller<S> {
    pub fn kill(&self) -> Result<(), ShellError> {
        send_signal(self.shell.as_ref(), &self.pid, SIGKILL)
    }
}

fn send_signal<S: Shell + ?Sized>(shell: &S, pid: &str, signal: i32) -> Result<(), ShellError> {
    let kill_res = shell.exec_with(
        &format!("kill -{} {}", signal, pid),
        &CommandOptions::unchecked(),
    )?;
    if kill_res.stderr.contains("No such process") {
        return Ok(());
    }
    if kill_res.return_code != 0 {
        return Err(ShellError::SignalNotSent {
            signal,
            code: kill_res.return_code,
        });
    }
    Ok(())
}

fn command_script(process_dir: &str, command: &str) -> String {
    [
        "#!/bin/bash".to_string(),
        format!("cd {}", process_dir),
        format!("{} &", command),
        "pid=$!".to_string(),
        format!("cd {}", process_dir),
        format!("echo $pid > {}/pid", process_dir),
        "wait $pid".to_string(),
        format!("echo $? > {}/rc", process_dir),
    ]
    .join("\n")
}

fn fresh_lines(current: &str, last_line: &mut usize) -> String {
    let lines = current.split('\n').collect::<Vec<_>>();
    if lines.len() > *last_line {
        let fresh = lines[*last_line..].join("\n");
        *last_line = lines.len();
        return fresh;
    }
    String::new()
}
