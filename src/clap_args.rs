/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{config::DEFAULT_CONFIG_PATH, load_params::LoadType};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Verbose mode (-v, --verbose), overridden by RUST_LOG
    #[arg(short, long)]
    pub verbose: bool,

    /// Path to the config file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    pub file: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Write an example config file
    Init,

    /// Generate containers and objects on every load node
    Prepare,

    /// Run the load on every load node and average the results
    Run {
        /// Reuse objects generated by an earlier `prepare`
        #[arg(long)]
        no_prepare: bool,

        /// Write the results as JSON to this file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Parse the summary of a finished k6 run
    Parse {
        /// File holding k6 output
        path: PathBuf,

        #[arg(short, long)]
        load_type: LoadType,
    },

    /// Check two result files are within 25% of each other
    Compare {
        baseline: PathBuf,
        new: PathBuf,
    },
}

pub fn parse() -> Cli {
    Cli::parse()
}
