/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use std::time::Duration;
use thiserror::Error;

/// Failures raised while executing a command on a local or remote shell.
#[derive(Debug, Error)]
pub enum ShellError {
    #[error("Failed to spawn command: {command}")]
    Spawn {
        command: String,
        #[source]
        source: subprocess::PopenError,
    },

    #[error("I/O error while running command: {command}")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Command: {command}\nreturn code: {code}\nOutput: {output}")]
    NonZeroExit {
        command: String,
        code: i32,
        output: String,
    },

    #[error("Command: {command} did not finish within {}s", .timeout.as_secs())]
    Timeout { command: String, timeout: Duration },

    #[error("Host {0} is not available")]
    HostNotAvailable(String),

    #[error("Signal {signal} not sent. Return code of kill: {code}")]
    SignalNotSent { signal: i32, code: i32 },

    #[error("Unexpected output from `{command}`: {output}")]
    UnexpectedOutput { command: String, output: String },

    #[error("Invalid path to delete: {0}")]
    InvalidPath(String),

    #[error("Command can not be quoted for the remote shell")]
    Quote(#[from] shlex::QuoteError),
}

/// Failures in the lifecycle of a single k6 run.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("Wrong K6 load type: {0}")]
    WrongLoadType(String),

    #[error("Load parameter `{0}` is required")]
    MissingParam(&'static str),

    #[error("No k6 instances were executed")]
    NotStarted,

    #[error("K6 was already started on {0}")]
    AlreadyStarted(String),

    #[error("k6 should be running")]
    NotRunning,

    #[error("K6 unexpectedly finished")]
    UnexpectedlyFinished,

    #[error("Expected K6 finished in {:?}", .0)]
    Timeout(Duration),

    #[error("Can not stop K6 process within timeout")]
    StopExhausted,

    #[error("Return code of K6 job should be 0, but {}", display_rc(.0))]
    BadReturnCode(Option<i32>),

    #[error("K6 unexpectedly finished with RC {}", display_rc(.0))]
    UnexpectedExit(Option<i32>),

    #[error("K6 has not finished in expected time")]
    NotFinishedInTime,

    #[error(transparent)]
    Shell(#[from] ShellError),
}

fn display_rc(rc: &Option<i32>) -> String {
    rc.map(|rc| rc.to_string())
        .unwrap_or_else(|| "None".to_string())
}

/// Raised by `compare_load_results` when two runs diverge.
#[derive(Debug, Error, PartialEq)]
pub enum CompareError {
    #[error("Difference in {0} values more than 25%")]
    Difference(String),

    #[error("Unexpected zero value in {0}")]
    UnexpectedZero(String),

    #[error("Metric {0} is missing from the compared results")]
    MissingMetric(String),
}
