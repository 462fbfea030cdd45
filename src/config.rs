/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{
    fanout::RunnerSettings,
    load_params::{LoadParams, LoadType},
    nodes::{CommandHost, HostControl, StopMode},
    retry::RetryPolicy,
    runner::K6Dir,
    s3_auth::S3Settings,
    shell::SshShell,
};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::{
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
    time::Duration,
};

static EXAMPLE_CONFIG: &str = include_str!("templates/neofs-load.toml");

pub const DEFAULT_CONFIG_PATH: &str = "neofs-load.toml";

fn default_load_nodes() -> Vec<String> {
    vec!["127.0.0.1".to_string()]
}

fn default_login() -> String {
    "k6".to_string()
}

fn default_port() -> u16 {
    22
}

fn default_stop_attempts() -> u32 {
    5
}

fn default_stop_interval() -> u64 {
    15
}

// ******** ******** ********
// **    CONFIGURATION     **
// ******** ******** ********
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Config {
    pub load: LoadParams,
    #[serde(default)]
    pub ssh: SshSettings,
    #[serde(default = "default_load_nodes")]
    pub load_nodes: Vec<String>,
    /// Only the first `load_nodes_count` load nodes take part when set.
    pub load_nodes_count: Option<usize>,
    #[serde(default)]
    pub k6_dir: K6Dir,
    #[serde(default)]
    pub stop_policy: StopPolicy,
    #[serde(default, rename(serialize = "storage_node", deserialize = "storage_node"))]
    pub storage_nodes: Vec<StorageNode>,
    /// Storage nodes past this count are stopped for the duration of the load.
    pub used_storage_nodes: Option<usize>,
    #[serde(default)]
    pub stop_mode: StopMode,
    pub s3: Option<S3Settings>,
}
impl Config {
    pub fn write_example_to_file(path: &Path) -> anyhow::Result<File> {
        let mut file = File::create_new(path)
            .with_context(|| format!("Unable to create {}", path.display()))?;
        file.write_all(EXAMPLE_CONFIG.as_bytes())?;
        Ok(file)
    }

    pub fn try_from_path(path: &Path) -> anyhow::Result<Config> {
        let mut config_str = String::new();
        fs::File::open(path)
            .with_context(|| format!("Unable to open config file {}", path.display()))?
            .read_to_string(&mut config_str)?;
        Config::try_from_str(&config_str)
    }

    pub fn try_from_str(conf_str: &str) -> anyhow::Result<Config> {
        toml::from_str::<Config>(conf_str).map_err(|e| anyhow::anyhow!("TOML parsing error: {}", e))
    }

    /// Applies the process environment on top of the file, see `apply_env_with`.
    pub fn apply_env(&mut self) -> anyhow::Result<()> {
        self.apply_env_with(|key| std::env::var(key).ok())
    }

    /// Overrides settings from environment variables looked up through `var`. Unset and empty
    /// variables leave the file value alone.
    pub fn apply_env_with(&mut self, var: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
        let var = |key: &str| var(key).filter(|value| !value.trim().is_empty());

        if let Some(nodes) = var("LOAD_NODES") {
            self.load_nodes = nodes
                .split(',')
                .map(|node| node.trim().to_string())
                .filter(|node| !node.is_empty())
                .collect();
        }
        if let Some(login) = var("LOAD_NODE_SSH_USER") {
            self.ssh.login = login;
        }
        if let Some(key) = var("LOAD_NODE_SSH_PRIVATE_KEY_PATH") {
            self.ssh.private_key_path = Some(PathBuf::from(key));
        }
        if let Some(load_type) = var("LOAD_TYPE") {
            self.load.load_type = LoadType::from_str(&load_type)?;
        }
        if let Some(out_file) = var("OUT_FILE") {
            self.load.out_file = Some(out_file);
        }

        override_num(&var, "LOAD_TIME", &mut self.load.load_time)?;
        override_num(&var, "WRITERS", &mut self.load.writers)?;
        override_num(&var, "READERS", &mut self.load.readers)?;
        override_num(&var, "DELETERS", &mut self.load.deleters)?;
        override_num(&var, "OBJ_SIZE", &mut self.load.obj_size)?;
        override_num(&var, "OBJ_COUNT", &mut self.load.obj_count)?;
        override_num(&var, "CONTAINERS_COUNT", &mut self.load.containers_count)?;
        override_num(&var, "LOAD_NODES_COUNT", &mut self.load_nodes_count)?;
        Ok(())
    }

    /// Load nodes taking part in the run.
    pub fn used_load_nodes(&self) -> &[String] {
        match self.load_nodes_count {
            Some(count) => &self.load_nodes[..count.min(self.load_nodes.len())],
            None => &self.load_nodes,
        }
    }

    pub fn runner_settings(&self) -> RunnerSettings {
        RunnerSettings {
            k6_dir: self.k6_dir.clone(),
            stop_policy: Some(self.stop_policy.retry_policy()),
        }
    }

    pub fn storage_hosts(&self) -> Vec<Arc<dyn HostControl>> {
        self.storage_nodes
            .iter()
            .map(|node| Arc::new(node.command_host(&self.ssh)) as Arc<dyn HostControl>)
            .collect()
    }
}

fn override_num<T>(
    var: &impl Fn(&str) -> Option<String>,
    key: &str,
    target: &mut Option<T>,
) -> anyhow::Result<()>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    if let Some(value) = var(key) {
        let parsed = value
            .trim()
            .parse::<T>()
            .with_context(|| format!("{} should be a number, got {:?}", key, value))?;
        *target = Some(parsed);
    }
    Ok(())
}

/// How load and storage nodes are reached over ssh.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct SshSettings {
    #[serde(default = "default_login")]
    pub login: String,
    pub private_key_path: Option<PathBuf>,
    #[serde(default = "default_port")]
    pub port: u16,
}
impl Default for SshSettings {
    fn default() -> Self {
        SshSettings {
            login: default_login(),
            private_key_path: None,
            port: default_port(),
        }
    }
}
impl SshSettings {
    pub fn shell_for(&self, host: &str) -> SshShell {
        let shell = SshShell::new(host, self.port, self.login.clone());
        match &self.private_key_path {
            Some(key) => shell.with_private_key(key.clone()),
            None => shell,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq)]
pub struct StopPolicy {
    #[serde(default = "default_stop_attempts")]
    pub attempts: u32,
    #[serde(default = "default_stop_interval")]
    pub interval_secs: u64,
}
impl Default for StopPolicy {
    fn default() -> Self {
        StopPolicy {
            attempts: default_stop_attempts(),
            interval_secs: default_stop_interval(),
        }
    }
}
impl StopPolicy {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(self.attempts, Duration::from_secs(self.interval_secs))
            .with_trailing_delay()
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct StorageNode {
    pub name: String,
    pub host: String,
    /// Command stopping the node, `{mode}` is replaced with `hard` or `soft`.
    pub stop: String,
    pub start: String,
}
impl StorageNode {
    pub fn command_host(&self, ssh: &SshSettings) -> CommandHost<SshShell> {
        CommandHost::new(
            self.name.clone(),
            ssh.shell_for(&self.host),
            &self.stop,
            &self.start,
        )
    }
}
