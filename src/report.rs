/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{
    fanout::FanoutReport,
    load_params::{LoadResults, LoadType},
};
use anyhow::Context;
use chrono::{DateTime, Utc};
use colored::*;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fs, path::Path};
use term_table::{row::Row, table_cell::TableCell, Table, TableStyle};

#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub struct NodeEntry {
    pub host: String,
    pub results: LoadResults,
}

/// What a run leaves on disk, and what `compare` reads back.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub struct ResultFile {
    pub finished_at: DateTime<Utc>,
    pub load_type: LoadType,
    pub nodes: Vec<NodeEntry>,
    pub average: LoadResults,
}
impl ResultFile {
    pub fn new(load_type: LoadType, report: &FanoutReport) -> Self {
        ResultFile {
            finished_at: Utc::now(),
            load_type,
            nodes: report
                .nodes
                .iter()
                .map(|node| NodeEntry {
                    host: node.host.clone(),
                    results: node.results,
                })
                .collect(),
            average: report.average,
        }
    }

    pub fn write(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).with_context(|| format!("Unable to write {}", path.display()))
    }
}

/// Metrics to compare from a JSON file. Takes either a full result file (its average is used)
/// or a flat `{"metric": value}` object.
pub fn read_metrics(path: &Path) -> anyhow::Result<BTreeMap<String, f64>> {
    let json = fs::read_to_string(path)
        .with_context(|| format!("Unable to read results from {}", path.display()))?;

    if let Ok(file) = serde_json::from_str::<ResultFile>(&json) {
        return Ok(file.average.to_map());
    }
    serde_json::from_str::<BTreeMap<String, f64>>(&json)
        .with_context(|| format!("{} holds neither a result file nor a metric map", path.display()))
}

fn metric_cells(results: &LoadResults) -> Vec<TableCell> {
    results
        .to_map()
        .values()
        .map(|value| TableCell::new(format!("{:.3}", value)))
        .collect()
}

/// Table with one row per node and the average in the last row.
pub fn summary_table(nodes: &[NodeEntry], average: &LoadResults) -> String {
    let mut header = vec![TableCell::builder("Node".bold()).build()];
    header.extend(
        average
            .to_map()
            .keys()
            .map(|metric| TableCell::builder(metric.bold()).build()),
    );

    let mut rows = vec![Row::new(header)];
    for node in nodes {
        let mut cells = vec![TableCell::new(&node.host)];
        cells.extend(metric_cells(&node.results));
        rows.push(Row::new(cells));
    }

    let mut cells = vec![TableCell::new("average".green())];
    cells.extend(metric_cells(average));
    rows.push(Row::new(cells));

    Table::builder()
        .rows(rows)
        .style(TableStyle::rounded())
        .build()
        .render()
}

pub fn print_summary(file: &ResultFile) {
    println!("\n{}", " Summary ".reversed().green());
    println!(
        "{} load on {} node(s), finished at {}",
        file.load_type.to_string().green(),
        file.nodes.len(),
        file.finished_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    println!("{}", summary_table(&file.nodes, &file.average));
}
