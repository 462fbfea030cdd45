/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{
    errors::{LoadError, ShellError},
    load_params::{LoadParams, LoadResults, LoadType},
    parser::parse_results,
    remote_process::{ProcessKiller, RemoteProcess},
    retry::RetryPolicy,
    shell::Shell,
};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::{ops::ControlFlow, sync::Arc, thread, time::Duration};
use tracing::{debug, error, info, warn};

pub const EXIT_RESULT_CODE: i32 = 0;
pub const DEFAULT_K6_DIR: &str = "/xk6-neofs";

const STOP_ATTEMPTS: u32 = 5;
const STOP_INTERVAL: Duration = Duration::from_secs(15);
const PID_ATTEMPTS: u32 = 50;
const PID_INTERVAL: Duration = Duration::from_secs(1);
const WAIT_CHECKS: u32 = 5;

/// Where the k6 binary and its scenarios live on a load node.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
#[serde(tag = "strategy", rename_all = "lowercase")]
pub enum K6Dir {
    /// A known path.
    Fixed {
        #[serde(default = "default_k6_path")]
        path: String,
    },
    /// First `locate` hit for `k6`.
    Locate,
    /// Directory of the first `k6` found below the login directory.
    Find,
}
fn default_k6_path() -> String {
    DEFAULT_K6_DIR.to_string()
}

impl Default for K6Dir {
    fn default() -> Self {
        K6Dir::Fixed {
            path: DEFAULT_K6_DIR.to_string(),
        }
    }
}
impl K6Dir {
    pub fn resolve<S: Shell + ?Sized>(&self, shell: &S) -> Result<String, ShellError> {
        let command = match self {
            K6Dir::Fixed { path } => return Ok(path.trim_end_matches('/').to_string()),
            K6Dir::Locate => "locate -l 1 'k6'",
            K6Dir::Find => r"sudo find . -name 'k6' -exec dirname {} \; -quit",
        };

        let terminal = shell.exec(command)?;
        let dir = terminal.stdout.trim_matches('\n').trim();
        if dir.is_empty() {
            return Err(ShellError::UnexpectedOutput {
                command: command.to_string(),
                output: "k6 directory not found".to_string(),
            });
        }
        Ok(dir.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Created,
    Prepared,
    Running,
    Finished,
    Stopped,
    Killed,
}

/// How `start_context` treats the load once the scoped block returned successfully.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ContextOptions {
    pub warm_up_time: Duration,
    /// The load must have finished on its own by the end of the block.
    pub expected_finish: bool,
    /// The load is expected to be broken, kill it without looking at the outcome.
    pub expected_fail: bool,
}

/// The `-e KEY=VALUE` overrides passed to k6, in order. `None` values are left out of the
/// command line.
pub fn k6_env_vars(params: &LoadParams, k6_dir: &str) -> Vec<(String, Option<String>)> {
    fn non_zero<T: PartialEq + Default + ToString>(value: Option<T>) -> Option<String> {
        value
            .filter(|v| *v != T::default())
            .map(|v| v.to_string())
    }
    fn non_empty(value: &Option<String>) -> Option<String> {
        value.clone().filter(|v| !v.is_empty())
    }

    vec![
        ("DURATION".to_string(), non_zero(params.load_time)),
        ("WRITE_OBJ_SIZE".to_string(), non_zero(params.obj_size)),
        (
            "WRITERS".to_string(),
            Some(params.writers.unwrap_or(0).to_string()),
        ),
        (
            "READERS".to_string(),
            Some(params.readers.unwrap_or(0).to_string()),
        ),
        (
            "DELETERS".to_string(),
            Some(params.deleters.unwrap_or(0).to_string()),
        ),
        ("REGISTRY_FILE".to_string(), non_empty(&params.registry_file)),
        ("CLIENTS".to_string(), non_zero(params.clients)),
        (
            format!("{}_ENDPOINTS", params.load_type.env_prefix()),
            Some(params.endpoint.clone()),
        ),
        (
            "PREGEN_JSON".to_string(),
            params
                .pregen_file_name()
                .map(|name| format!("{}/{}", k6_dir, name)),
        ),
    ]
}

/// Full command line that runs the k6 scenario for `params`.
pub fn k6_command(params: &LoadParams, k6_dir: &str) -> String {
    let env = k6_env_vars(params, k6_dir)
        .into_iter()
        .filter_map(|(key, value)| value.map(|value| format!("-e {}={}", key, value)))
        .join(" ");

    format!(
        "{dir}/k6 run {env} {dir}/scenarios/{load_type}.js",
        dir = k6_dir,
        env = env,
        load_type = params.load_type
    )
}

/// Command line of the preset script that pre-creates containers (or buckets) and objects.
pub fn preset_command(params: &LoadParams, k6_dir: &str) -> Result<String, LoadError> {
    let obj_size = params.obj_size.ok_or(LoadError::MissingParam("obj_size"))?;
    let containers = params
        .containers_count
        .ok_or(LoadError::MissingParam("containers_count"))?;
    let out_file = params
        .pregen_file_name()
        .ok_or(LoadError::MissingParam("out_file"))?;
    let obj_count = params
        .obj_count
        .ok_or(LoadError::MissingParam("obj_count"))?;

    let command = match params.load_type {
        LoadType::Grpc | LoadType::Http => format!(
            "{dir}/scenarios/preset/preset_grpc.py --size {size} --containers {containers} \
             --out {dir}/{out} --endpoint {endpoint} --preload_obj {count}",
            dir = k6_dir,
            size = obj_size,
            containers = containers,
            out = out_file,
            endpoint = params.first_endpoint(),
            count = obj_count,
        ),
        LoadType::S3 => format!(
            "{dir}/scenarios/preset/preset_s3.py --size {size} --buckets {containers} \
             --out {dir}/{out} --endpoint {endpoint} --preload_obj {count} --location load-1-1",
            dir = k6_dir,
            size = obj_size,
            containers = containers,
            out = out_file,
            endpoint = params.first_endpoint(),
            count = obj_count,
        ),
    };
    Ok(command)
}

/// Kills the load if the scope holding it unwinds.
struct KillOnUnwind<S: Shell>(Option<ProcessKiller<S>>);
impl<S: Shell> Drop for KillOnUnwind<S> {
    fn drop(&mut self) {
        if !thread::panicking() {
            return;
        }
        if let Some(killer) = &self.0 {
            if let Err(err) = killer.kill() {
                error!("Failed to kill k6 while unwinding: {}", err);
            }
        }
    }
}

/// Drives a single k6 run on one load node, from preset generation to result parsing.
///
/// A runner owns at most one k6 process: it is started once and can not be restarted.
#[derive(Debug)]
pub struct LoadRunner<S: Shell> {
    shell: Arc<S>,
    params: LoadParams,
    k6_dir: K6Dir,
    resolved_dir: Option<String>,
    stop_policy: RetryPolicy,
    pid_policy: RetryPolicy,
    process: Option<RemoteProcess<S>>,
    state: Lifecycle,
}

impl<S: Shell> LoadRunner<S> {
    pub fn new(params: LoadParams, shell: S) -> Self {
        Self::from_shared(params, Arc::new(shell))
    }

    pub fn from_shared(params: LoadParams, shell: Arc<S>) -> Self {
        LoadRunner {
            shell,
            params,
            k6_dir: K6Dir::default(),
            resolved_dir: None,
            stop_policy: RetryPolicy::fixed(STOP_ATTEMPTS, STOP_INTERVAL).with_trailing_delay(),
            pid_policy: RetryPolicy::fixed(PID_ATTEMPTS, PID_INTERVAL),
            process: None,
            state: Lifecycle::Created,
        }
    }

    pub fn with_k6_dir(mut self, k6_dir: K6Dir) -> Self {
        self.k6_dir = k6_dir;
        self.resolved_dir = None;
        self
    }

    /// Policy of the SIGTERM loop used by `stop` and friends.
    pub fn with_stop_policy(mut self, policy: RetryPolicy) -> Self {
        self.stop_policy = policy;
        self
    }

    pub fn with_pid_policy(mut self, policy: RetryPolicy) -> Self {
        self.pid_policy = policy;
        self
    }

    pub fn params(&self) -> &LoadParams {
        &self.params
    }

    pub fn host(&self) -> &str {
        self.shell.host()
    }

    pub fn state(&self) -> Lifecycle {
        self.state
    }

    pub fn process_dir(&self) -> Result<&str, LoadError> {
        self.process
            .as_ref()
            .map(|process| process.process_dir())
            .ok_or(LoadError::NotStarted)
    }

    /// The k6 directory on the load node, looked up once.
    pub fn k6_dir(&mut self) -> Result<String, LoadError> {
        if let Some(dir) = &self.resolved_dir {
            return Ok(dir.clone());
        }
        let dir = self.k6_dir.resolve(self.shell.as_ref())?;
        debug!("k6 directory on {} is {}", self.host(), dir);
        self.resolved_dir = Some(dir.clone());
        Ok(dir)
    }

    /// Pre-creates containers (or buckets) and objects for the load and returns the output of
    /// the preset script, the path of the generated manifest.
    pub fn prepare(&mut self) -> Result<String, LoadError> {
        let dir = self.k6_dir()?;
        let command = preset_command(&self.params, &dir)?;

        info!("Prepare containers and objects on {}", self.host());
        let terminal = self.shell.exec(&command)?;
        self.state = Lifecycle::Prepared;

        Ok(terminal.stdout.trim_matches('\n').to_string())
    }

    /// Environment overrides this runner passes to k6.
    pub fn k6_env(&mut self) -> Result<Vec<(String, Option<String>)>, LoadError> {
        let dir = self.k6_dir()?;
        Ok(k6_env_vars(&self.params, &dir))
    }

    /// Starts k6 on the load node without waiting for it.
    pub fn start(&mut self) -> Result<(), LoadError> {
        if let Some(process) = &self.process {
            return Err(LoadError::AlreadyStarted(process.process_dir().to_string()));
        }

        let env = self
            .k6_env()?
            .iter()
            .map(|(key, value)| format!("{}: {}", key, value.as_deref().unwrap_or("None")))
            .join("\n");
        info!("K6 ENV variables on {}:\n{}", self.host(), env);

        let dir = self.k6_dir()?;
        let command = k6_command(&self.params, &dir);
        let process = RemoteProcess::create_with(&command, self.shell.clone(), self.pid_policy)?;
        self.process = Some(process);
        self.state = Lifecycle::Running;
        Ok(())
    }

    /// Waits up to `timeout` for k6 to exit on its own, checking 5 times. A run that overstays
    /// is stopped and reported as `LoadError::Timeout`.
    pub fn wait_until_finished(
        &mut self,
        timeout: Duration,
        must_be_running: bool,
    ) -> Result<(), LoadError> {
        let process = self.process_mut()?;
        if must_be_running && !process.running()? {
            return Err(LoadError::NotRunning);
        }

        let finished = RetryPolicy::spread(timeout, WAIT_CHECKS).run(|_| -> Result<_, LoadError> {
            if self.process_mut()?.running()? {
                Ok(ControlFlow::Continue(()))
            } else {
                Ok(ControlFlow::Break(()))
            }
        })?;

        if finished.is_some() {
            self.state = Lifecycle::Finished;
            return Ok(());
        }

        warn!(
            "K6 on {} is still running after {}s, stopping it",
            self.host(),
            timeout.as_secs()
        );
        if let Err(err) = self.stop_k6() {
            warn!("Graceful stop failed ({}), killing k6", err);
            if let Err(err) = self.kill_k6() {
                error!("Failed to kill k6 on {}: {}", self.host(), err);
            }
        }
        Err(LoadError::Timeout(timeout))
    }

    /// Gracefully terminates a load that is still running and checks it exited cleanly.
    pub fn stop(&mut self) -> Result<(), LoadError> {
        if !self.process_mut()?.running()? {
            self.state = Lifecycle::Finished;
            return Err(LoadError::UnexpectedlyFinished);
        }

        self.stop_k6()?;

        let rc = self.process_mut()?.rc()?;
        if rc != Some(EXIT_RESULT_CODE) {
            return Err(LoadError::BadReturnCode(rc));
        }
        Ok(())
    }

    /// Full k6 output so far. Also written to the log.
    pub fn get_results(&mut self) -> Result<String, LoadError> {
        let host = self.host().to_string();
        let output = self.process_mut()?.stdout(true)?;
        info!("K6 output on {}:\n{}", host, output);
        Ok(output)
    }

    pub fn parsing_results(&mut self) -> Result<LoadResults, LoadError> {
        let load_type = self.params.load_type;
        let output = self.process_mut()?.stdout(true)?;
        Ok(parse_results(load_type, &output))
    }

    /// `false` for a runner that was never started.
    pub fn check_k6_is_running(&mut self) -> Result<bool, LoadError> {
        match self.process.as_mut() {
            Some(process) => Ok(process.running()?),
            None => Ok(false),
        }
    }

    pub fn is_finished(&mut self) -> Result<bool, LoadError> {
        Ok(!self.process_mut()?.running()?)
    }

    /// Sends SIGTERM until k6 is gone or the stop policy is spent.
    pub fn stop_k6(&mut self) -> Result<(), LoadError> {
        let policy = self.stop_policy;
        let stopped = policy.run(|attempt| -> Result<_, LoadError> {
            let process = self.process_mut()?;
            if !process.running()? {
                return Ok(ControlFlow::Break(()));
            }
            debug!("Sending SIGTERM to k6 (attempt {})", attempt + 1);
            process.stop()?;
            Ok(ControlFlow::Continue(()))
        })?;

        if stopped.is_none() && self.process_mut()?.running()? {
            return Err(LoadError::StopExhausted);
        }
        self.state = Lifecycle::Stopped;
        Ok(())
    }

    pub fn kill_k6(&mut self) -> Result<(), LoadError> {
        self.process_mut()?.kill()?;
        self.state = Lifecycle::Killed;
        Ok(())
    }

    /// Starts the load, lets it warm up and runs `body` while it is going. Whatever way the
    /// block ends, k6 does not outlive this call:
    ///
    /// * `body` fails or panics - k6 is killed and the failure passes through
    /// * `expected_fail` - k6 is killed
    /// * `expected_finish` - k6 must already be gone with a zero return code
    /// * otherwise k6 is stopped gracefully
    pub fn start_context<T, E, F>(&mut self, options: ContextOptions, body: F) -> Result<T, E>
    where
        F: FnOnce(&mut Self) -> Result<T, E>,
        E: From<LoadError>,
    {
        self.start()?;
        if !options.warm_up_time.is_zero() {
            thread::sleep(options.warm_up_time);
        }

        let guard = KillOnUnwind(self.process.as_ref().map(|process| process.killer()));
        let outcome = body(self);
        drop(guard);

        let value = match outcome {
            Ok(value) => value,
            Err(err) => {
                match self.check_k6_is_running() {
                    Ok(true) => {
                        if let Err(kill_err) = self.kill_k6() {
                            error!("Failed to kill k6 on {}: {}", self.host(), kill_err);
                        }
                    }
                    Ok(false) => {}
                    Err(check_err) => warn!("Unable to check k6 liveness: {}", check_err),
                }
                return Err(err);
            }
        };

        if options.expected_fail {
            self.kill_k6()?;
        } else if options.expected_finish {
            if self.process_mut()?.running().map_err(LoadError::from)? {
                self.kill_k6()?;
                return Err(LoadError::NotFinishedInTime.into());
            }
            self.k6_should_be_finished()?;
        } else {
            self.stop_k6()?;
        }

        Ok(value)
    }

    fn k6_should_be_finished(&mut self) -> Result<(), LoadError> {
        let rc = self.process_mut()?.rc()?;
        if rc != Some(EXIT_RESULT_CODE) {
            return Err(LoadError::UnexpectedExit(rc));
        }
        self.state = Lifecycle::Finished;
        Ok(())
    }

    fn process_mut(&mut self) -> Result<&mut RemoteProcess<S>, LoadError> {
        self.process.as_mut().ok_or(LoadError::NotStarted)
    }
}
