/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{errors::ShellError, shell::Shell};
use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc};
use tracing::{info, warn};

#[derive(Debug, Deserialize, Serialize, PartialEq, Eq, Clone, Copy, Default)]
#[serde(rename_all = "lowercase")]
pub enum StopMode {
    #[default]
    Hard,
    Soft,
}
impl fmt::Display for StopMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopMode::Hard => write!(f, "hard"),
            StopMode::Soft => write!(f, "soft"),
        }
    }
}

/// A storage node that can be taken out of the cluster for the duration of a load.
pub trait HostControl: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;
    fn stop_host(&self, mode: StopMode) -> Result<(), ShellError>;
    fn start_host(&self) -> Result<(), ShellError>;
}

/// Controls a node by running configured command lines on it. `{mode}` in the stop command is
/// replaced with the requested stop mode.
#[derive(Debug)]
pub struct CommandHost<S: Shell> {
    name: String,
    shell: S,
    stop: String,
    start: String,
}
impl<S: Shell> CommandHost<S> {
    pub fn new(name: impl Into<String>, shell: S, stop: &str, start: &str) -> Self {
        CommandHost {
            name: name.into(),
            shell,
            stop: stop.to_string(),
            start: start.to_string(),
        }
    }
}

impl<S: Shell + fmt::Debug> HostControl for CommandHost<S> {
    fn name(&self) -> &str {
        &self.name
    }

    fn stop_host(&self, mode: StopMode) -> Result<(), ShellError> {
        let command = self.stop.replace("{mode}", &mode.to_string());
        info!("Stopping node {} ({})", self.name, mode);
        self.shell.exec(&command)?;
        Ok(())
    }

    fn start_host(&self) -> Result<(), ShellError> {
        info!("Starting node {}", self.name);
        self.shell.exec(&self.start)?;
        Ok(())
    }
}

/// Nodes stopped for a load that still have to be brought back.
#[derive(Debug, Default)]
pub struct StoppedHosts {
    hosts: Vec<Arc<dyn HostControl>>,
}
impl StoppedHosts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.hosts.iter().map(|host| host.name()).collect()
    }

    /// Stops every node past the first `used_count`. Stops at the first node that refuses,
    /// the ones already stopped stay recorded.
    pub fn stop_unused_nodes(
        &mut self,
        nodes: &[Arc<dyn HostControl>],
        used_count: usize,
        mode: StopMode,
    ) -> Result<(), ShellError> {
        for node in nodes.iter().skip(used_count) {
            node.stop_host(mode)?;
            self.hosts.push(node.clone());
        }
        Ok(())
    }

    /// Starts every recorded node. Nodes that fail to start stay recorded and the first failure
    /// is returned.
    pub fn start_stopped_nodes(&mut self) -> Result<(), ShellError> {
        let mut first_err = None;
        let mut still_stopped = vec![];

        for node in self.hosts.drain(..) {
            if let Err(err) = node.start_host() {
                warn!("Failed to start node {}: {}", node.name(), err);
                first_err.get_or_insert(err);
                still_stopped.push(node);
            }
        }
        self.hosts = still_stopped;

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
