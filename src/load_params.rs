/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::errors::LoadError;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, str::FromStr};

/// Protocol targeted by a load run. Selects the k6 scenario, the preset script and the metrics
/// read back from the k6 summary.
#[derive(Debug, Deserialize, Serialize, PartialEq, Eq, Clone, Copy, Hash)]
#[serde(try_from = "String", into = "String")]
pub enum LoadType {
    Grpc,
    Http,
    S3,
}
impl LoadType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadType::Grpc => "grpc",
            LoadType::Http => "http",
            LoadType::S3 => "s3",
        }
    }

    /// Prefix of the `<TYPE>_ENDPOINTS` variable passed to k6.
    pub fn env_prefix(&self) -> String {
        self.as_str().to_uppercase()
    }
}
impl fmt::Display for LoadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
impl FromStr for LoadType {
    type Err = LoadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "grpc" => Ok(LoadType::Grpc),
            "http" => Ok(LoadType::Http),
            "s3" => Ok(LoadType::S3),
            other => Err(LoadError::WrongLoadType(other.to_string())),
        }
    }
}
impl TryFrom<String> for LoadType {
    type Error = LoadError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}
impl From<LoadType> for String {
    fn from(value: LoadType) -> Self {
        value.as_str().to_string()
    }
}

/// Everything k6 and the preset scripts need to know about one load run.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub struct LoadParams {
    pub load_type: LoadType,
    /// Comma separated list of endpoints.
    pub endpoint: String,
    pub writers: Option<u32>,
    pub readers: Option<u32>,
    pub deleters: Option<u32>,
    pub clients: Option<u32>,
    pub containers_count: Option<u32>,
    pub out_file: Option<String>,
    /// Seconds.
    pub load_time: Option<u64>,
    pub obj_count: Option<u64>,
    pub obj_size: Option<u64>,
    pub registry_file: Option<String>,
}
impl LoadParams {
    pub fn new(load_type: LoadType, endpoint: impl Into<String>) -> Self {
        LoadParams {
            load_type,
            endpoint: endpoint.into(),
            writers: None,
            readers: None,
            deleters: None,
            clients: None,
            containers_count: None,
            out_file: None,
            load_time: None,
            obj_count: None,
            obj_size: None,
            registry_file: None,
        }
    }

    pub fn first_endpoint(&self) -> &str {
        self.endpoint.split(',').next().unwrap_or_default()
    }

    /// Name of the pre-generated object manifest inside the k6 directory, if any.
    pub fn pregen_file_name(&self) -> Option<String> {
        self.out_file
            .as_deref()
            .filter(|name| !name.is_empty())
            .map(|name| format!("{}_{}", self.load_type, name))
    }
}

/// Counters read back from the k6 summary of a single run.
#[derive(Debug, Default, Deserialize, Serialize, PartialEq, Clone, Copy)]
pub struct LoadResults {
    pub data_sent: f64,
    pub data_received: f64,
    pub read_ops: f64,
    pub write_ops: f64,
    pub total_ops: f64,
}
impl LoadResults {
    pub fn to_map(&self) -> BTreeMap<String, f64> {
        BTreeMap::from([
            ("data_sent".to_string(), self.data_sent),
            ("data_received".to_string(), self.data_received),
            ("read_ops".to_string(), self.read_ops),
            ("write_ops".to_string(), self.write_ops),
            ("total_ops".to_string(), self.total_ops),
        ])
    }

    pub(crate) fn set(&mut self, metric: &str, value: f64) {
        match metric {
            "data_sent" => self.data_sent = value,
            "data_received" => self.data_received = value,
            "read_ops" => self.read_ops = value,
            "write_ops" => self.write_ops = value,
            "total_ops" => self.total_ops = value,
            _ => tracing::warn!("Ignoring unknown metric {}", metric),
        }
    }
}
