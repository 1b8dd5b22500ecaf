//! In-memory fakes for the healer's external seams.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, NodeAddress, NodeSpec, NodeStatus as K8sNodeStatus};
use kube::core::{ErrorResponse, ObjectMeta};

use crate::cluster::NodeOps;
use crate::events::{EventSink, HealerEvent};
use crate::gatekeeper::NODE_CORDON_CONDITION;
use crate::status::{NodeEvent, NodeStatus, NodeStatusSource, StatusError};

fn api_error(code: u16, reason: &str, message: String) -> kube::Error {
    kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message,
        reason: reason.to_string(),
        code,
    })
}

/// Metrics backend with canned node statuses.
#[derive(Default)]
pub struct FakeStatusSource {
    nodes: BTreeSet<String>,
    cordoned: Vec<String>,
    statuses: BTreeMap<String, Vec<NodeStatus>>,
    fail_node_list: bool,
    fail_condition_queries: bool,
    fail_status_queries: bool,
    status_queries: AtomicUsize,
    condition_queries: AtomicUsize,
}

impl FakeStatusSource {
    /// A cluster of `count` nodes named `n0`, `n1`, ...
    pub fn with_nodes(count: usize) -> Self {
        Self {
            nodes: (0..count).map(|i| format!("n{i}")).collect(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn node(mut self, name: &str) -> Self {
        self.nodes.insert(name.to_string());
        self
    }

    /// Report a `NodeCordon` status for each name, duplicates included.
    #[must_use]
    pub fn cordoned(mut self, names: &[&str]) -> Self {
        self.cordoned.extend(names.iter().map(ToString::to_string));
        self
    }

    #[must_use]
    pub fn statuses(mut self, node: &str, statuses: Vec<NodeStatus>) -> Self {
        self.nodes.insert(node.to_string());
        self.statuses
            .entry(node.to_string())
            .or_default()
            .extend(statuses);
        self
    }

    #[must_use]
    pub fn failing_node_list(mut self) -> Self {
        self.fail_node_list = true;
        self
    }

    #[must_use]
    pub fn failing_condition_queries(mut self) -> Self {
        self.fail_condition_queries = true;
        self
    }

    #[must_use]
    pub fn failing_status_queries(mut self) -> Self {
        self.fail_status_queries = true;
        self
    }

    /// Number of `get_node_statuses` calls so far.
    pub fn status_queries(&self) -> usize {
        self.status_queries.load(Ordering::SeqCst)
    }

    /// Number of `list_node_statuses_with_condition` calls so far.
    pub fn condition_queries(&self) -> usize {
        self.condition_queries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NodeStatusSource for FakeStatusSource {
    async fn list_nodes(&self) -> Result<BTreeSet<String>, StatusError> {
        if self.fail_node_list {
            return Err(StatusError::Query("node list unavailable".to_string()));
        }
        Ok(self.nodes.clone())
    }

    async fn list_node_statuses_with_condition(
        &self,
        condition: &str,
    ) -> Result<Vec<NodeStatus>, StatusError> {
        self.condition_queries.fetch_add(1, Ordering::SeqCst);
        if self.fail_condition_queries {
            return Err(StatusError::Query("condition query failed".to_string()));
        }
        let mut out: Vec<NodeStatus> = self
            .statuses
            .values()
            .flatten()
            .filter(|s| s.condition == condition)
            .cloned()
            .collect();
        if condition == NODE_CORDON_CONDITION {
            out.extend(
                self.cordoned
                    .iter()
                    .map(|name| NodeStatus::new(name.as_str(), NODE_CORDON_CONDITION)),
            );
        }
        Ok(out)
    }

    async fn get_node_statuses(
        &self,
        node: &str,
        type_filter: &str,
    ) -> Result<Vec<NodeStatus>, StatusError> {
        self.status_queries.fetch_add(1, Ordering::SeqCst);
        if self.fail_status_queries {
            return Err(StatusError::Query("status query failed".to_string()));
        }
        Ok(self
            .statuses
            .get(node)
            .into_iter()
            .flatten()
            .filter(|s| type_filter.is_empty() || s.status_type.as_str() == type_filter)
            .cloned()
            .collect())
    }

    async fn get_event(
        &self,
        _kind: &str,
        _namespace: &str,
        _name: &str,
        _event_type: &str,
    ) -> Result<Vec<NodeEvent>, StatusError> {
        Ok(Vec::new())
    }

    async fn get_event_with_range(
        &self,
        _kind: &str,
        _namespace: &str,
        _name: &str,
        _event_type: &str,
        _range: &str,
    ) -> Result<Vec<NodeEvent>, StatusError> {
        Ok(Vec::new())
    }
}

/// A worker node with an internal address.
pub fn test_node(name: &str) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(BTreeMap::new()),
            annotations: Some(BTreeMap::new()),
            ..ObjectMeta::default()
        },
        spec: Some(NodeSpec::default()),
        status: Some(K8sNodeStatus {
            addresses: Some(vec![NodeAddress {
                type_: "InternalIP".to_string(),
                address: "10.0.3.17".to_string(),
            }]),
            ..K8sNodeStatus::default()
        }),
    }
}

/// Node API over an in-memory map of nodes.
#[derive(Default)]
pub struct FakeNodeOps {
    nodes: Mutex<BTreeMap<String, Node>>,
    fail_patches: AtomicBool,
    patches: AtomicUsize,
}

impl FakeNodeOps {
    pub fn with_node(name: &str) -> Self {
        Self::from_nodes(vec![test_node(name)])
    }

    pub fn from_nodes(nodes: Vec<Node>) -> Self {
        let nodes = nodes
            .into_iter()
            .map(|n| (n.metadata.name.clone().unwrap_or_default(), n))
            .collect();
        Self {
            nodes: Mutex::new(nodes),
            ..Self::default()
        }
    }

    pub fn node(&self, name: &str) -> Option<Node> {
        self.nodes.lock().unwrap().get(name).cloned()
    }

    pub fn annotation(&self, node: &str, key: &str) -> Option<String> {
        self.node(node)?.metadata.annotations?.get(key).cloned()
    }

    pub fn unschedulable(&self, node: &str) -> bool {
        self.node(node)
            .and_then(|n| n.spec)
            .and_then(|s| s.unschedulable)
            .unwrap_or(false)
    }

    pub fn set_annotation(&self, node: &str, key: &str, value: &str) {
        if let Some(n) = self.nodes.lock().unwrap().get_mut(node) {
            n.metadata
                .annotations
                .get_or_insert_with(BTreeMap::new)
                .insert(key.to_string(), value.to_string());
        }
    }

    pub fn set_label(&self, node: &str, key: &str, value: &str) {
        if let Some(n) = self.nodes.lock().unwrap().get_mut(node) {
            n.metadata
                .labels
                .get_or_insert_with(BTreeMap::new)
                .insert(key.to_string(), value.to_string());
        }
    }

    pub fn fail_patches(&self, fail: bool) {
        self.fail_patches.store(fail, Ordering::SeqCst);
    }

    /// Number of successful patches so far.
    pub fn patches(&self) -> usize {
        self.patches.load(Ordering::SeqCst)
    }

    fn patch(&self, name: &str, apply: impl FnOnce(&mut Node)) -> Result<Node, kube::Error> {
        if self.fail_patches.load(Ordering::SeqCst) {
            return Err(api_error(500, "InternalError", "patch rejected".to_string()));
        }
        let mut nodes = self.nodes.lock().unwrap();
        let node = nodes
            .get_mut(name)
            .ok_or_else(|| api_error(404, "NotFound", format!("nodes \"{name}\" not found")))?;
        apply(node);
        self.patches.fetch_add(1, Ordering::SeqCst);
        Ok(node.clone())
    }
}

fn merge(target: &mut Option<BTreeMap<String, String>>, changes: BTreeMap<String, Option<String>>) {
    let map = target.get_or_insert_with(BTreeMap::new);
    for (key, value) in changes {
        match value {
            Some(value) => map.insert(key, value),
            None => map.remove(&key),
        };
    }
}

#[async_trait]
impl NodeOps for FakeNodeOps {
    async fn get_node(&self, name: &str) -> Result<Node, kube::Error> {
        self.node(name)
            .ok_or_else(|| api_error(404, "NotFound", format!("nodes \"{name}\" not found")))
    }

    async fn patch_annotations(
        &self,
        name: &str,
        annotations: BTreeMap<String, Option<String>>,
    ) -> Result<Node, kube::Error> {
        self.patch(name, |node| merge(&mut node.metadata.annotations, annotations))
    }

    async fn patch_labels(
        &self,
        name: &str,
        labels: BTreeMap<String, Option<String>>,
    ) -> Result<Node, kube::Error> {
        self.patch(name, |node| merge(&mut node.metadata.labels, labels))
    }

    async fn set_unschedulable(
        &self,
        name: &str,
        unschedulable: bool,
    ) -> Result<Node, kube::Error> {
        self.patch(name, |node| {
            node.spec.get_or_insert_with(NodeSpec::default).unschedulable = Some(unschedulable);
        })
    }
}

/// Event sink that keeps every event it receives.
#[derive(Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<HealerEvent>>,
}

impl RecordingEventSink {
    pub fn events(&self) -> Vec<HealerEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn reasons(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.reason).collect()
    }
}

#[async_trait]
impl EventSink for RecordingEventSink {
    async fn publish(&self, _node: &Node, event: HealerEvent) {
        self.events.lock().unwrap().push(event);
    }
}
