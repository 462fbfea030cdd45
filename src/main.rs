/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use anyhow::{anyhow, Context};
use colored::Colorize;
use neofs_load::{
    clap_args::{self, Commands},
    config::Config,
    fanout::{self, FanoutReport},
    load_params::LoadType,
    nodes::StoppedHosts,
    parser,
    report::{self, NodeEntry, ResultFile},
    s3_auth,
};
use std::{fs, path::Path};
use tokio::task::block_in_place;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn init_tracing(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
}

fn load_config(path: &Path) -> anyhow::Result<Config> {
    let mut config = Config::try_from_path(path)
        .with_context(|| format!("Unable to load config {}, try `neofs-load init`", path.display()))?;
    config.apply_env()?;
    Ok(config)
}

async fn run_load(
    config: &Config,
    stopped: &mut StoppedHosts,
    prepare: bool,
) -> anyhow::Result<FanoutReport> {
    let hosts = config.used_load_nodes().to_vec();
    if hosts.is_empty() {
        return Err(anyhow!("No load nodes configured"));
    }

    if let Some(used) = config.used_storage_nodes {
        block_in_place(|| stopped.stop_unused_nodes(&config.storage_hosts(), used, config.stop_mode))
            .context("Unable to stop unused storage nodes")?;
    }

    if config.load.load_type == LoadType::S3 {
        let s3 = config
            .s3
            .as_ref()
            .context("s3 load needs an [s3] section in the config")?;
        block_in_place(|| s3_auth::init_s3_client(&hosts, &config.ssh, s3))
            .context("Unable to configure S3 credentials on load nodes")?;
    }

    let runners = block_in_place(|| {
        fanout::prepare_k6_instances(
            &hosts,
            &config.ssh,
            &config.load,
            &config.runner_settings(),
            prepare,
        )
    })?;

    fanout::multi_node_k6_run(runners).await
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = clap_args::parse();
    init_tracing(args.verbose);

    match args.command {
        Commands::Init => {
            Config::write_example_to_file(&args.file)?;
            println!("{} {}", "Written".green(), args.file.display());
        }

        Commands::Prepare => {
            let config = load_config(&args.file)?;
            let runners = block_in_place(|| {
                fanout::prepare_k6_instances(
                    config.used_load_nodes(),
                    &config.ssh,
                    &config.load,
                    &config.runner_settings(),
                    true,
                )
            })?;
            info!("Prepared {} load node(s)", runners.len());
        }

        Commands::Run { no_prepare, output } => {
            let config = load_config(&args.file)?;
            let mut stopped = StoppedHosts::new();

            let outcome = run_load(&config, &mut stopped, !no_prepare).await;

            if !stopped.is_empty() {
                if let Err(err) = block_in_place(|| stopped.start_stopped_nodes()) {
                    error!("Storage nodes {:?} are left stopped: {}", stopped.names(), err);
                }
            }

            let report = outcome?;
            let file = ResultFile::new(config.load.load_type, &report);
            report::print_summary(&file);
            if let Some(path) = output {
                file.write(&path)?;
                info!("Results are written to {}", path.display());
            }
        }

        Commands::Parse { path, load_type } => {
            let output = fs::read_to_string(&path)
                .with_context(|| format!("Unable to read k6 output from {}", path.display()))?;
            let results = parser::parse_results(load_type, &output);

            let entries = [NodeEntry {
                host: path.display().to_string(),
                results,
            }];
            println!("{}", report::summary_table(&entries, &results));
            println!("{}", serde_json::to_string_pretty(&results.to_map())?);
        }

        Commands::Compare { baseline, new } => {
            let baseline = report::read_metrics(&baseline)?;
            let new = report::read_metrics(&new)?;

            match fanout::compare_load_results(&baseline, &new) {
                Ok(()) => println!("{}", "Results match".green()),
                Err(err) => {
                    println!("{}", err.to_string().red());
                    return Err(err.into());
                }
            }
        }
    }

    Ok(())
}
