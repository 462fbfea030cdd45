/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::load_params::{LoadResults, LoadType};
use regex_lite::Regex;
use tracing::{debug, warn};

const DATA_PATTERNS: [(&str, &str); 2] = [
    (
        "data_received",
        r"data_received\W*\d*.\d*.\w*\W*(?P<data_received>\d*)",
    ),
    ("data_sent", r"data_sent\W*\d*.\d*.\w*\W*(?P<data_sent>\d*)"),
];

/// Metric name and pattern pairs used for the given load type. The capture group of every
/// pattern is named after its metric.
pub fn metric_patterns(load_type: LoadType) -> Vec<(&'static str, &'static str)> {
    let mut patterns = DATA_PATTERNS.to_vec();
    match load_type {
        LoadType::Grpc => patterns.extend([
            (
                "write_ops",
                r"neofs_obj_put_total\W*\d*\W*(?P<write_ops>\d*\.\d*)",
            ),
            (
                "read_ops",
                r"neofs_obj_get_total\W*\d*\W*(?P<read_ops>\d*\.\d*)",
            ),
        ]),
        LoadType::S3 => patterns.extend([
            (
                "write_ops",
                r"aws_obj_put_total\W*\d*\W*(?P<write_ops>\d*\.\d*)",
            ),
            (
                "read_ops",
                r"aws_obj_get_total\W*\d*\W*(?P<read_ops>\d*\.\d*)",
            ),
        ]),
        LoadType::Http => patterns.push(("total_ops", r"http_reqs\W*\d*\W*(?P<total_ops>\d*\.\d*)")),
    }
    patterns
}

/// Pulls the counters out of a k6 end-of-test summary.
///
/// A metric that can't be found (or isn't a number) is reported as `0.0`, so a partially garbled
/// summary still yields the metrics that are readable.
pub fn parse_results(load_type: LoadType, output: &str) -> LoadResults {
    let output = output.replace('\n', "");
    let mut results = LoadResults::default();

    for (metric, pattern) in metric_patterns(load_type) {
        let value = match Regex::new(pattern) {
            Ok(re) => re
                .captures(&output)
                .and_then(|caps| caps.name(metric))
                .map(|m| m.as_str()),
            Err(err) => {
                warn!("Invalid pattern for metric {}: {}", metric, err);
                None
            }
        };

        let value = match value {
            Some(raw) => raw.parse::<f64>().unwrap_or_else(|_| {
                warn!("Metric {} has non-numeric value {:?}", metric, raw);
                0.0
            }),
            None => {
                debug!("Metric {} not found in k6 output", metric);
                0.0
            }
        };
        results.set(metric, value);
    }

    results
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grpc_counters_are_read_and_missing_ones_default_to_zero() {
        let output = "neofs_obj_put_total 123 45.0\nneofs_obj_get_total 123 10.0\n";
        let results = parse_results(LoadType::Grpc, output);

        assert_eq!(results.write_ops, 45.0);
        assert_eq!(results.read_ops, 10.0);
        assert_eq!(results.data_sent, 0.0);
        assert_eq!(results.data_received, 0.0);
        assert_eq!(results.total_ops, 0.0);
    }

    #[test]
    fn s3_counters_use_aws_metric_names() {
        let output = "aws_obj_put_total..........: 600  20.000/s\n\
                      aws_obj_get_total..........: 300  10.500/s\n";
        let results = parse_results(LoadType::S3, output);

        assert_eq!(results.write_ops, 20.0);
        assert_eq!(results.read_ops, 10.5);
    }

    #[test]
    fn http_reads_total_requests() {
        let output = "http_reqs..................: 1200   40.0/s";
        let results = parse_results(LoadType::Http, output);

        assert_eq!(results.total_ops, 40.0);
        assert_eq!(results.write_ops, 0.0);
    }

    #[test]
    fn data_counters_are_read_for_every_type() {
        let output = "data_received..................: 0 B 0 B/s\n\
                      data_sent......................: 1 MB 3400 B/s\n";

        for load_type in [LoadType::Grpc, LoadType::Http, LoadType::S3] {
            let results = parse_results(load_type, output);
            assert_eq!(results.data_received, 0.0);
            assert_eq!(results.data_sent, 3400.0);
        }
    }

    #[test]
    fn grpc_patterns_do_not_leak_into_s3() {
        let output = "neofs_obj_put_total 123 45.0";
        let results = parse_results(LoadType::S3, output);

        assert_eq!(results, LoadResults::default());
    }

    #[test]
    fn every_pattern_compiles() {
        for load_type in [LoadType::Grpc, LoadType::Http, LoadType::S3] {
            for (metric, pattern) in metric_patterns(load_type) {
                let re = Regex::new(pattern).expect("pattern should compile");
                assert!(re.capture_names().flatten().any(|name| name == metric));
            }
        }
    }
}
