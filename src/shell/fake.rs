/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! Scripted stand-in for a load node. Understands the handful of commands `RemoteProcess` sends
//! and records everything it was asked to run.

use super::{CommandOptions, CommandResult, Shell};
use crate::errors::ShellError;
use std::{
    sync::{Arc, Mutex, MutexGuard},
    thread,
    time::Duration,
};

pub(crate) const FAKE_PID: &str = "4242";

#[derive(Debug)]
pub(crate) struct FakeHost {
    pub commands: Vec<String>,
    pub running: bool,
    pub rc: i32,
    /// Return code after SIGTERM, `None` when the process ignores it.
    pub term_rc: Option<i32>,
    /// Process exits on its own after this many `rc` reads.
    pub finish_after_polls: Option<u32>,
    pub stdout: String,
    /// Canned results for any other command, matched by substring.
    pub responses: Vec<(String, CommandResult)>,
    pub rc_reads: u32,
    /// Time every command takes.
    pub latency: Duration,
}

#[derive(Debug, Clone)]
pub(crate) struct FakeShell {
    host: Arc<Mutex<FakeHost>>,
}
impl FakeShell {
    pub fn new() -> Self {
        FakeShell {
            host: Arc::new(Mutex::new(FakeHost {
                commands: vec![],
                running: true,
                rc: 0,
                term_rc: Some(0),
                finish_after_polls: None,
                stdout: String::new(),
                responses: vec![],
                rc_reads: 0,
                latency: Duration::ZERO,
            })),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, FakeHost> {
        self.host.lock().expect("fake host lock poisoned")
    }

    pub fn with_stdout(self, stdout: &str) -> Self {
        self.state().stdout = stdout.to_string();
        self
    }

    pub fn ignoring_sigterm(self) -> Self {
        self.state().term_rc = None;
        self
    }

    pub fn exiting_on_sigterm_with(self, rc: i32) -> Self {
        self.state().term_rc = Some(rc);
        self
    }

    pub fn finishing_after_polls(self, polls: u32, rc: i32) -> Self {
        {
            let mut state = self.state();
            state.finish_after_polls = Some(polls);
            state.rc = rc;
        }
        self
    }

    pub fn already_finished(self, rc: i32) -> Self {
        {
            let mut state = self.state();
            state.running = false;
            state.rc = rc;
        }
        self
    }

    pub fn with_latency(self, latency: Duration) -> Self {
        self.state().latency = latency;
        self
    }

    pub fn respond(self, needle: &str, stdout: &str) -> Self {
        self.state().responses.push((
            needle.to_string(),
            CommandResult {
                stdout: stdout.to_string(),
                ..Default::default()
            },
        ));
        self
    }

    pub fn commands(&self) -> Vec<String> {
        self.state().commands.clone()
    }

    pub fn signals(&self, signal: i32) -> usize {
        let needle = format!("kill -{} ", signal);
        self.state()
            .commands
            .iter()
            .filter(|cmd| cmd.starts_with(&needle))
            .count()
    }

    pub fn rc_reads(&self) -> u32 {
        self.state().rc_reads
    }

    fn answer(state: &mut FakeHost, command: &str) -> CommandResult {
        let ok = |stdout: &str| CommandResult {
            stdout: stdout.to_string(),
            ..Default::default()
        };

        if let Some(path) = command.strip_prefix("realpath ") {
            return ok(&format!("{}\n", path));
        }
        if command.starts_with("cat ") && command.ends_with("/pid") {
            return ok(&format!("{}\n", FAKE_PID));
        }
        if command.starts_with("cat ") && command.ends_with("/rc") {
            state.rc_reads += 1;
            if state.running {
                if let Some(left) = state.finish_after_polls.as_mut() {
                    *left = left.saturating_sub(1);
                    if *left == 0 {
                        state.running = false;
                    }
                }
            }
            if state.running {
                return CommandResult {
                    stdout: String::new(),
                    stderr: format!("{}: No such file or directory\n", command),
                    return_code: 1,
                };
            }
            return ok(&format!("{}\n", state.rc));
        }
        if command.starts_with("cat ") && command.ends_with("/stdout") {
            return ok(&state.stdout.clone());
        }
        if command.starts_with("cat ") && command.ends_with("/stderr") {
            return ok("");
        }
        if let Some(rest) = command.strip_prefix("kill -") {
            if !state.running {
                return CommandResult {
                    stdout: String::new(),
                    stderr: "kill: No such process\n".to_string(),
                    return_code: 1,
                };
            }
            if rest.starts_with("9 ") {
                state.running = false;
                state.rc = 137;
            } else if let Some(rc) = state.term_rc {
                state.running = false;
                state.rc = rc;
            }
            return ok("");
        }

        state
            .responses
            .iter()
            .find(|(needle, _)| command.contains(needle.as_str()))
            .map(|(_, result)| result.clone())
            .unwrap_or_default()
    }
}

impl Shell for FakeShell {
    fn exec_with(
        &self,
        command: &str,
        options: &CommandOptions,
    ) -> Result<CommandResult, ShellError> {
        let (result, latency) = {
            let mut state = self.state();
            state.commands.push(command.to_string());
            (FakeShell::answer(&mut state, command), state.latency)
        };
        if !latency.is_zero() {
            thread::sleep(latency);
        }
        super::check_result(command, result, options)
    }

    fn host(&self) -> &str {
        "fake-host"
    }
}
