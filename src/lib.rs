/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! Runs k6 load against NeoFS storage nodes and gateways on remote load nodes, supervises the
//! detached k6 processes and reads their results back.

pub mod clap_args;
pub mod config;
pub mod errors;
pub mod fanout;
pub mod load_params;
pub mod nodes;
pub mod parser;
pub mod remote_process;
pub mod report;
pub mod retry;
pub mod runner;
pub mod s3_auth;
pub mod shell;

pub use errors::{CompareError, LoadError, ShellError};
pub use load_params::{LoadParams, LoadResults, LoadType};
pub use runner::{ContextOptions, K6Dir, LoadRunner};
