/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{
    config::SshSettings,
    errors::{CompareError, LoadError},
    load_params::{LoadParams, LoadResults},
    retry::RetryPolicy,
    runner::{K6Dir, LoadRunner},
    shell::{Shell, SshShell},
};
use anyhow::{anyhow, Context};
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tokio::{sync::Semaphore, task::JoinSet};
use tracing::{error, info};

const MAX_WORKERS: usize = 32;
const MAX_DIFFERENCE: f64 = 0.25;

/// Outcome of a run on one load node.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeResult {
    pub host: String,
    pub results: LoadResults,
    pub output: String,
}

/// Outcome of a run across every load node.
#[derive(Debug, Clone, PartialEq)]
pub struct FanoutReport {
    /// Per-node results, in completion order.
    pub nodes: Vec<NodeResult>,
    /// Arithmetic mean of every metric over all nodes.
    pub average: LoadResults,
}

/// How each load node's runner is set up.
#[derive(Debug, Clone, Default)]
pub struct RunnerSettings {
    pub k6_dir: K6Dir,
    pub stop_policy: Option<RetryPolicy>,
}

/// Number of runs driven at the same time.
pub fn worker_count() -> usize {
    MAX_WORKERS.min(num_cpus::get() + 4)
}

/// Opens an ssh session to every load node and builds its runner. With `prepare` set, the preset
/// is generated on every node in turn.
pub fn prepare_k6_instances(
    hosts: &[String],
    ssh: &SshSettings,
    params: &LoadParams,
    settings: &RunnerSettings,
    prepare: bool,
) -> Result<Vec<LoadRunner<SshShell>>, LoadError> {
    prepare_instances_with(hosts, |host| ssh.shell_for(host), params, settings, prepare)
}

/// `prepare_k6_instances` over any kind of shell.
pub fn prepare_instances_with<S, F>(
    hosts: &[String],
    mut shell_for: F,
    params: &LoadParams,
    settings: &RunnerSettings,
    prepare: bool,
) -> Result<Vec<LoadRunner<S>>, LoadError>
where
    S: Shell,
    F: FnMut(&str) -> S,
{
    let mut runners = Vec::with_capacity(hosts.len());
    for host in hosts {
        let mut runner =
            LoadRunner::new(params.clone(), shell_for(host)).with_k6_dir(settings.k6_dir.clone());
        if let Some(policy) = settings.stop_policy {
            runner = runner.with_stop_policy(policy);
        }
        if prepare {
            let manifest = runner.prepare()?;
            info!("Preset on {} is ready: {}", host, manifest);
        }
        runners.push(runner);
    }
    Ok(runners)
}

/// Runs the load on one node from start to parsed results. k6 gets twice its configured
/// duration to exit on its own.
pub fn run_k6_load<S: Shell>(runner: &mut LoadRunner<S>) -> Result<NodeResult, LoadError> {
    let load_time = runner
        .params()
        .load_time
        .ok_or(LoadError::MissingParam("load_time"))?;
    let timeout = Duration::from_secs(load_time.saturating_mul(2));

    runner.start()?;
    runner.wait_until_finished(timeout, false)?;
    let output = runner.get_results()?;
    let results = runner.parsing_results()?;

    Ok(NodeResult {
        host: runner.host().to_string(),
        results,
        output,
    })
}

/// Runs the load on every node concurrently and averages the results. Every node is waited
/// for, then the first error reported by any node is returned.
pub async fn multi_node_k6_run<S>(runners: Vec<LoadRunner<S>>) -> anyhow::Result<FanoutReport>
where
    S: Shell + 'static,
{
    if runners.is_empty() {
        return Err(LoadError::NotStarted.into());
    }

    let permits = Arc::new(Semaphore::new(worker_count()));
    let mut join_set = JoinSet::new();

    for mut runner in runners {
        let permit = permits.clone().acquire_owned().await?;
        join_set.spawn_blocking(move || {
            let host = runner.host().to_string();
            let res = run_k6_load(&mut runner).with_context(|| format!("k6 run on {} failed", host));
            drop(permit);
            res
        });
    }

    let mut nodes = vec![];
    let mut first_err = None;
    while let Some(joined) = join_set.join_next().await {
        let res = joined
            .map_err(|join_err| anyhow!("k6 worker panicked: {}", join_err))
            .and_then(|res| res);
        match res {
            Ok(node) => {
                info!("Load on {} finished", node.host);
                nodes.push(node);
            }
            Err(err) => {
                error!("{:#}", err);
                first_err.get_or_insert(err);
            }
        }
    }
    if let Some(err) = first_err {
        return Err(err);
    }

    let average = average_results(nodes.iter().map(|node| &node.results));
    Ok(FanoutReport { nodes, average })
}

/// Per-metric arithmetic mean, all zeros for no results.
pub fn average_results<'a>(results: impl IntoIterator<Item = &'a LoadResults>) -> LoadResults {
    let mut sum = LoadResults::default();
    let mut count = 0;
    for res in results {
        sum.data_sent += res.data_sent;
        sum.data_received += res.data_received;
        sum.read_ops += res.read_ops;
        sum.write_ops += res.write_ops;
        sum.total_ops += res.total_ops;
        count += 1;
    }
    if count == 0 {
        return sum;
    }

    let n = count as f64;
    LoadResults {
        data_sent: sum.data_sent / n,
        data_received: sum.data_received / n,
        read_ops: sum.read_ops / n,
        write_ops: sum.write_ops / n,
        total_ops: sum.total_ops / n,
    }
}

/// Checks that every metric of `first` is within 25% of the same metric in `second`. Two zeros
/// agree, a single zero does not.
pub fn compare_load_results(
    first: &BTreeMap<String, f64>,
    second: &BTreeMap<String, f64>,
) -> Result<(), CompareError> {
    for (key, &a) in first {
        let b = *second
            .get(key)
            .ok_or_else(|| CompareError::MissingMetric(key.clone()))?;

        match (a == 0.0, b == 0.0) {
            (true, true) => continue,
            (true, false) | (false, true) => return Err(CompareError::UnexpectedZero(key.clone())),
            (false, false) => {
                if (a - b).abs() / a.min(b) >= MAX_DIFFERENCE {
                    return Err(CompareError::Difference(key.clone()));
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{load_params::LoadType, remote_process::SIGTERM, shell::fake::FakeShell};

    fn params() -> LoadParams {
        LoadParams {
            writers: Some(10),
            obj_size: Some(1000),
            containers_count: Some(1),
            out_file: Some("1mb.json".to_string()),
            obj_count: Some(4),
            load_time: Some(0),
            ..LoadParams::new(LoadType::Grpc, "s01:8080")
        }
    }

    fn settings() -> RunnerSettings {
        RunnerSettings {
            k6_dir: K6Dir::default(),
            stop_policy: Some(RetryPolicy::fixed(2, Duration::ZERO).with_trailing_delay()),
        }
    }

    fn runners(shells: &[FakeShell]) -> Vec<LoadRunner<FakeShell>> {
        shells
            .iter()
            .map(|shell| {
                LoadRunner::new(params(), shell.clone())
                    .with_pid_policy(RetryPolicy::fixed(2, Duration::ZERO))
                    .with_stop_policy(RetryPolicy::fixed(2, Duration::ZERO).with_trailing_delay())
            })
            .collect()
    }

    fn map(values: &[(&str, f64)]) -> BTreeMap<String, f64> {
        values.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn prepare_builds_one_runner_per_host() -> anyhow::Result<()> {
        let shells = vec![FakeShell::new(), FakeShell::new()];
        let hosts = vec!["load-1".to_string(), "load-2".to_string()];
        let mut next = shells.iter().cloned();

        let runners = prepare_instances_with(
            &hosts,
            |_| next.next().unwrap_or_else(FakeShell::new),
            &params(),
            &settings(),
            true,
        )?;

        assert_eq!(runners.len(), 2);
        for shell in &shells {
            let commands = shell.commands();
            assert_eq!(commands.len(), 1);
            assert!(commands[0].contains("preset_grpc.py"));
        }
        Ok(())
    }

    #[test]
    fn prepare_can_be_skipped() -> anyhow::Result<()> {
        let shell = FakeShell::new();
        let runners = prepare_instances_with(
            &["load-1".to_string()],
            |_| shell.clone(),
            &params(),
            &settings(),
            false,
        )?;

        assert_eq!(runners.len(), 1);
        assert!(shell.commands().is_empty());
        Ok(())
    }

    #[test]
    fn single_node_run_parses_output() -> anyhow::Result<()> {
        let shell = FakeShell::new()
            .already_finished(0)
            .with_stdout("neofs_obj_put_total 10 30.0\n");
        let mut runner = runners(&[shell.clone()]).remove(0);

        let node = run_k6_load(&mut runner)?;

        assert_eq!(node.host, "fake-host");
        assert_eq!(node.results.write_ops, 30.0);
        assert_eq!(shell.signals(SIGTERM), 0);
        Ok(())
    }

    #[tokio::test]
    async fn results_are_averaged_over_nodes() -> anyhow::Result<()> {
        let shells = [
            FakeShell::new()
                .already_finished(0)
                .with_stdout("neofs_obj_put_total 10 30.0\nneofs_obj_get_total 10 4.0\n"),
            FakeShell::new()
                .already_finished(0)
                .with_stdout("neofs_obj_put_total 10 10.0\nneofs_obj_get_total 10 2.0\n"),
        ];

        let report = multi_node_k6_run(runners(&shells)).await?;

        assert_eq!(report.nodes.len(), 2);
        assert_eq!(report.average.write_ops, 20.0);
        assert_eq!(report.average.read_ops, 3.0);
        assert_eq!(report.average.total_ops, 0.0);
        Ok(())
    }

    #[tokio::test]
    async fn first_node_failure_fails_the_run() {
        let shells = [
            FakeShell::new().already_finished(0),
            // never exits on its own and ignores SIGTERM, so the wait times out
            FakeShell::new().ignoring_sigterm(),
        ];

        let res = multi_node_k6_run(runners(&shells)).await;

        let err = res.expect_err("a timed out node fails the run");
        assert!(err.to_string().contains("k6 run on fake-host failed"));
        assert!(matches!(
            err.downcast_ref::<LoadError>(),
            Some(LoadError::Timeout(_))
        ));
    }

    #[tokio::test]
    async fn failed_run_waits_for_remaining_nodes() {
        let slow = FakeShell::new()
            .already_finished(0)
            .with_latency(Duration::from_millis(50))
            .with_stdout("neofs_obj_put_total 10 30.0\n");
        let shells = [FakeShell::new().ignoring_sigterm(), slow.clone()];

        let res = multi_node_k6_run(runners(&shells)).await;

        assert!(res.is_err());
        let commands = slow.commands();
        assert!(commands.iter().any(|cmd| cmd.ends_with("/stdout")));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(slow.commands().len(), commands.len());
    }

    #[test]
    fn missing_load_time_is_rejected_before_start() {
        let shell = FakeShell::new().finishing_after_polls(2, 0);
        let params = LoadParams::new(LoadType::Grpc, "s01:8080");
        let mut runner = LoadRunner::new(params, shell.clone());

        let res = run_k6_load(&mut runner);

        assert!(matches!(res, Err(LoadError::MissingParam("load_time"))));
        assert!(shell.commands().is_empty());
    }

    #[tokio::test]
    async fn no_runners_is_an_error() {
        let res = multi_node_k6_run(Vec::<LoadRunner<FakeShell>>::new()).await;
        assert!(res.is_err());
    }

    #[test]
    fn worker_count_is_bounded() {
        let workers = worker_count();
        assert!(workers >= 5);
        assert!(workers <= MAX_WORKERS);
    }

    #[test]
    fn average_of_nothing_is_zero() {
        assert_eq!(average_results([]), LoadResults::default());
    }

    #[test]
    fn close_results_pass() {
        let a = map(&[("write_ops", 100.0), ("read_ops", 0.0)]);
        let b = map(&[("write_ops", 110.0), ("read_ops", 0.0)]);
        assert_eq!(compare_load_results(&a, &b), Ok(()));
    }

    #[test]
    fn difference_is_relative_to_smaller_value() {
        let a = map(&[("write_ops", 100.0)]);
        let b = map(&[("write_ops", 125.0)]);
        assert_eq!(
            compare_load_results(&a, &b),
            Err(CompareError::Difference("write_ops".to_string()))
        );
        assert_eq!(
            compare_load_results(&b, &a),
            Err(CompareError::Difference("write_ops".to_string()))
        );
    }

    #[test]
    fn quarter_difference_is_the_limit() {
        let a = map(&[("write_ops", 100.0)]);
        assert_eq!(compare_load_results(&a, &map(&[("write_ops", 124.0)])), Ok(()));
        assert_eq!(
            compare_load_results(&a, &map(&[("write_ops", 126.0)])),
            Err(CompareError::Difference("write_ops".to_string()))
        );
    }

    #[test]
    fn single_zero_is_rejected() {
        let a = map(&[("read_ops", 0.0)]);
        let b = map(&[("read_ops", 5.0)]);
        assert_eq!(
            compare_load_results(&a, &b),
            Err(CompareError::UnexpectedZero("read_ops".to_string()))
        );
    }

    #[test]
    fn metric_missing_from_second_is_rejected() {
        let a = map(&[("total_ops", 5.0)]);
        let b = map(&[]);
        assert_eq!(
            compare_load_results(&a, &b),
            Err(CompareError::MissingMetric("total_ops".to_string()))
        );
        assert_eq!(compare_load_results(&b, &a), Ok(()));
    }
}
