//! Node health signals as reported by the metrics backend.

pub mod prometheus;

use std::collections::BTreeSet;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use prometheus::{PrometheusConfig, PrometheusStatusSource};

/// Errors raised while querying the metrics backend.
#[derive(Error, Debug)]
pub enum StatusError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("query failed with status {status}: {body}")]
    Api { status: u16, body: String },

    #[error("query returned status: {0}")]
    Query(String),
}

/// Category of a node status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusType {
    #[default]
    Default,
    Baseboard,
    Cpu,
    Memory,
    Disk,
    System,
    Network,
    #[serde(rename = "ib")]
    InfiniBand,
    Gpu,
    Gpfs,
}

impl StatusType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Baseboard => "baseboard",
            Self::Cpu => "cpu",
            Self::Memory => "memory",
            Self::Disk => "disk",
            Self::System => "system",
            Self::Network => "network",
            Self::InfiniBand => "ib",
            Self::Gpu => "gpu",
            Self::Gpfs => "gpfs",
        }
    }

    /// Parse a label value. Unknown categories fall back to `Default`.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "baseboard" => Self::Baseboard,
            "cpu" => Self::Cpu,
            "memory" => Self::Memory,
            "disk" => Self::Disk,
            "system" => Self::System,
            "network" => Self::Network,
            "ib" => Self::InfiniBand,
            "gpu" => Self::Gpu,
            "gpfs" => Self::Gpfs,
            _ => Self::Default,
        }
    }

    /// Whether a fault of this category is a hardware issue (routes to hardware SRE).
    pub fn is_hardware(self) -> bool {
        !matches!(self, Self::Default | Self::System)
    }
}

impl fmt::Display for StatusType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One observed symptom on a node.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NodeStatus {
    /// Node name
    pub name: String,
    /// Symptom identifier, e.g. `GpuDown`
    pub condition: String,
    #[serde(rename = "type")]
    pub status_type: StatusType,
    /// Device index or slot, possibly empty
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub pci_bdf: String,
    #[serde(default)]
    pub msg: String,
    #[serde(default)]
    pub value: f64,
}

impl NodeStatus {
    pub fn new(name: impl Into<String>, condition: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            condition: condition.into(),
            ..Self::default()
        }
    }
}

/// A Kubernetes event as exported to the metrics backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeEvent {
    pub kind: String,
    pub namespace: String,
    pub name: String,
    pub event_type: String,
    pub reason: String,
    pub message: String,
    pub count: f64,
    pub timestamp: DateTime<Utc>,
}

/// Narrow read interface over the metrics backend.
///
/// Calls may block on network I/O and are never retried internally.
#[async_trait]
pub trait NodeStatusSource: Send + Sync {
    /// Names of every node known to the backend.
    async fn list_nodes(&self) -> Result<BTreeSet<String>, StatusError>;

    /// Every active status carrying `condition`, across all nodes.
    async fn list_node_statuses_with_condition(
        &self,
        condition: &str,
    ) -> Result<Vec<NodeStatus>, StatusError>;

    /// Active statuses of one node; an empty `type_filter` means all categories.
    async fn get_node_statuses(
        &self,
        node: &str,
        type_filter: &str,
    ) -> Result<Vec<NodeStatus>, StatusError>;

    async fn get_event(
        &self,
        kind: &str,
        namespace: &str,
        name: &str,
        event_type: &str,
    ) -> Result<Vec<NodeEvent>, StatusError>;

    /// Same as [`get_event`](Self::get_event) but over a lookback window such as `"1h"`.
    async fn get_event_with_range(
        &self,
        kind: &str,
        namespace: &str,
        name: &str,
        event_type: &str,
        range: &str,
    ) -> Result<Vec<NodeEvent>, StatusError>;
}
