//! Prometheus-backed node status source.
//!
//! Node statuses are exported by the node-problem exporters as the
//! `aegis_node_status_condition` series, one series per active symptom:
//!
//! ```text
//! aegis_node_status_condition{node="gpu-017",condition="GpuDown",type="gpu",id="3",pci_bdf="0000:3b:00.0",msg="..."} 1
//! ```
//!
//! Kubernetes events are exported as `aegis_resource_k8s_event`.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde::Deserialize;
use tracing::debug;

use super::{NodeEvent, NodeStatus, NodeStatusSource, StatusError, StatusType};

/// Default Prometheus service URL (internal Kubernetes DNS)
const DEFAULT_PROMETHEUS_URL: &str = "http://prometheus-server.observability.svc.cluster.local:80";

const NODE_STATUS_METRIC: &str = "aegis_node_status_condition";
const NODE_INFO_METRIC: &str = "kube_node_info";
const EVENT_METRIC: &str = "aegis_resource_k8s_event";

/// Configuration for the Prometheus status source
#[derive(Debug, Clone)]
pub struct PrometheusConfig {
    /// Base URL for the Prometheus API
    pub base_url: String,
    /// Request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        Self {
            base_url: std::env::var("PROMETHEUS_URL")
                .unwrap_or_else(|_| DEFAULT_PROMETHEUS_URL.to_string()),
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Deserialize)]
struct PrometheusResponse {
    status: String,
    #[serde(default)]
    data: PrometheusData,
}

#[derive(Debug, Default, Deserialize)]
struct PrometheusData {
    result: Vec<PrometheusResult>,
}

#[derive(Debug, Deserialize)]
struct PrometheusResult {
    metric: HashMap<String, String>,
    value: Option<(f64, String)>,
}

#[derive(Debug, Clone)]
struct Sample {
    labels: HashMap<String, String>,
    value: f64,
    timestamp: f64,
}

impl Sample {
    fn label(&self, key: &str) -> String {
        self.labels.get(key).cloned().unwrap_or_default()
    }

    fn into_status(self) -> NodeStatus {
        NodeStatus {
            name: self.label("node"),
            condition: self.label("condition"),
            status_type: StatusType::parse(&self.label("type")),
            id: self.label("id"),
            pci_bdf: self.label("pci_bdf"),
            msg: self.label("msg"),
            value: self.value,
        }
    }

    fn into_event(self) -> NodeEvent {
        let secs = self.timestamp.trunc() as i64;
        NodeEvent {
            kind: self.label("kind"),
            namespace: self.label("namespace"),
            name: self.label("name"),
            event_type: self.label("type"),
            reason: self.label("reason"),
            message: self.label("message"),
            count: self.value,
            timestamp: Utc
                .timestamp_opt(secs, 0)
                .single()
                .unwrap_or_else(Utc::now),
        }
    }
}

/// Status source that evaluates PromQL against the Prometheus HTTP API.
#[derive(Debug, Clone)]
pub struct PrometheusStatusSource {
    config: PrometheusConfig,
    client: reqwest::Client,
}

impl PrometheusStatusSource {
    pub fn new(config: PrometheusConfig) -> Result<Self, StatusError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self { config, client })
    }

    async fn query(&self, query: &str) -> Result<Vec<Sample>, StatusError> {
        let url = format!(
            "{}/api/v1/query",
            self.config.base_url.trim_end_matches('/')
        );

        debug!(query = %query, "Executing Prometheus query");

        let response = self
            .client
            .get(&url)
            .query(&[("query", query)])
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(StatusError::Api { status, body });
        }

        let prom_response: PrometheusResponse = response.json().await?;
        if prom_response.status != "success" {
            return Err(StatusError::Query(prom_response.status));
        }

        Ok(prom_response
            .data
            .result
            .into_iter()
            .filter_map(|result| {
                let (timestamp, raw) = result.value?;
                let value = raw.parse::<f64>().ok()?;
                Some(Sample {
                    labels: result.metric,
                    value,
                    timestamp,
                })
            })
            .collect())
    }

    fn event_selector(kind: &str, namespace: &str, name: &str, event_type: &str) -> String {
        let mut matchers = vec![format!(r#"kind="{kind}""#), format!(r#"name="{name}""#)];
        if !namespace.is_empty() {
            matchers.push(format!(r#"namespace="{namespace}""#));
        }
        if !event_type.is_empty() {
            matchers.push(format!(r#"type="{event_type}""#));
        }
        format!("{EVENT_METRIC}{{{}}}", matchers.join(","))
    }
}

#[async_trait]
impl NodeStatusSource for PrometheusStatusSource {
    async fn list_nodes(&self) -> Result<BTreeSet<String>, StatusError> {
        let samples = self.query(NODE_INFO_METRIC).await?;
        Ok(samples
            .iter()
            .map(|s| s.label("node"))
            .filter(|n| !n.is_empty())
            .collect())
    }

    async fn list_node_statuses_with_condition(
        &self,
        condition: &str,
    ) -> Result<Vec<NodeStatus>, StatusError> {
        let query = format!(r#"{NODE_STATUS_METRIC}{{condition="{condition}"}} != 0"#);
        let samples = self.query(&query).await?;
        Ok(samples.into_iter().map(Sample::into_status).collect())
    }

    async fn get_node_statuses(
        &self,
        node: &str,
        type_filter: &str,
    ) -> Result<Vec<NodeStatus>, StatusError> {
        let query = if type_filter.is_empty() {
            format!(r#"{NODE_STATUS_METRIC}{{node="{node}"}} != 0"#)
        } else {
            format!(r#"{NODE_STATUS_METRIC}{{node="{node}",type="{type_filter}"}} != 0"#)
        };
        let samples = self.query(&query).await?;
        Ok(samples.into_iter().map(Sample::into_status).collect())
    }

    async fn get_event(
        &self,
        kind: &str,
        namespace: &str,
        name: &str,
        event_type: &str,
    ) -> Result<Vec<NodeEvent>, StatusError> {
        let query = Self::event_selector(kind, namespace, name, event_type);
        let samples = self.query(&query).await?;
        Ok(samples.into_iter().map(Sample::into_event).collect())
    }

    async fn get_event_with_range(
        &self,
        kind: &str,
        namespace: &str,
        name: &str,
        event_type: &str,
        range: &str,
    ) -> Result<Vec<NodeEvent>, StatusError> {
        let selector = Self::event_selector(kind, namespace, name, event_type);
        let query = format!("max_over_time({selector}[{range}])");
        let samples = self.query(&query).await?;
        Ok(samples.into_iter().map(Sample::into_event).collect())
    }
}
