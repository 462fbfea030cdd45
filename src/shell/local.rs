/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use super::{
    apply_inspectors, check_result, log_result, run_captured, CommandInspector, CommandOptions,
    CommandResult, Shell,
};
use crate::errors::ShellError;
use std::time::Instant;
use subprocess::Exec;
use tracing::info;

/// Runs commands through `sh -c` on this machine.
#[derive(Debug, Default)]
pub struct LocalShell {
    inspectors: Vec<Box<dyn CommandInspector>>,
}
impl LocalShell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_inspector(mut self, inspector: impl CommandInspector + 'static) -> Self {
        self.inspectors.push(Box::new(inspector));
        self
    }
}

impl Shell for LocalShell {
    fn exec_with(
        &self,
        command: &str,
        options: &CommandOptions,
    ) -> Result<CommandResult, ShellError> {
        let command = apply_inspectors(&self.inspectors, command);
        info!("Executing command: {}", command);

        let started = Instant::now();
        let result = run_captured(Exec::shell(&command), &command, options)?;
        log_result(self.host(), &command, &result, started, options);

        check_result(&command, result, options)
    }

    fn host(&self) -> &str {
        "localhost"
    }
}
