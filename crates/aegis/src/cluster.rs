//! Access to the Kubernetes Node objects the healer works on.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use serde_json::json;
use tracing::debug;

/// Label that suppresses self-healing on a node when set to `"true"`.
pub const DISABLE_SELFHEALING_LABEL: &str = "aegis.io/disable-selfhealing";
pub const DISABLE_SELFHEALING_VALUE: &str = "true";

const MASTER_ROLE_LABELS: &[&str] = &[
    "node-role.kubernetes.io/master",
    "node-role.kubernetes.io/control-plane",
];

/// Node operations used by the healer, the annotation ticket store and the SOPs.
#[async_trait]
pub trait NodeOps: Send + Sync {
    async fn get_node(&self, name: &str) -> Result<Node, kube::Error>;

    /// Strategic-merge the given annotations; `None` removes the key.
    async fn patch_annotations(
        &self,
        name: &str,
        annotations: BTreeMap<String, Option<String>>,
    ) -> Result<Node, kube::Error>;

    /// Strategic-merge the given labels; `None` removes the key.
    async fn patch_labels(
        &self,
        name: &str,
        labels: BTreeMap<String, Option<String>>,
    ) -> Result<Node, kube::Error>;

    /// Cordon (`true`) or uncordon (`false`) the node.
    async fn set_unschedulable(&self, name: &str, unschedulable: bool)
        -> Result<Node, kube::Error>;
}

/// [`NodeOps`] against the API server.
#[derive(Clone)]
pub struct KubeNodeOps {
    nodes: Api<Node>,
}

impl KubeNodeOps {
    pub fn new(client: Client) -> Self {
        Self {
            nodes: Api::all(client),
        }
    }
}

#[async_trait]
impl NodeOps for KubeNodeOps {
    async fn get_node(&self, name: &str) -> Result<Node, kube::Error> {
        self.nodes.get(name).await
    }

    async fn patch_annotations(
        &self,
        name: &str,
        annotations: BTreeMap<String, Option<String>>,
    ) -> Result<Node, kube::Error> {
        debug!(node = %name, keys = ?annotations.keys().collect::<Vec<_>>(), "Patching node annotations");
        let patch = json!({ "metadata": { "annotations": annotations } });
        self.nodes
            .patch(name, &PatchParams::default(), &Patch::Strategic(&patch))
            .await
    }

    async fn patch_labels(
        &self,
        name: &str,
        labels: BTreeMap<String, Option<String>>,
    ) -> Result<Node, kube::Error> {
        debug!(node = %name, keys = ?labels.keys().collect::<Vec<_>>(), "Patching node labels");
        let patch = json!({ "metadata": { "labels": labels } });
        self.nodes
            .patch(name, &PatchParams::default(), &Patch::Strategic(&patch))
            .await
    }

    async fn set_unschedulable(
        &self,
        name: &str,
        unschedulable: bool,
    ) -> Result<Node, kube::Error> {
        debug!(node = %name, unschedulable, "Patching node schedulability");
        let patch = json!({ "spec": { "unschedulable": unschedulable } });
        self.nodes
            .patch(name, &PatchParams::default(), &Patch::Strategic(&patch))
            .await
    }
}

/// Node name without any dot-suffix (`gpu-017.cluster.local` -> `gpu-017`).
pub fn short_node_name(name: &str) -> &str {
    name.split('.').next().unwrap_or(name)
}

pub fn node_label<'a>(node: &'a Node, key: &str) -> Option<&'a str> {
    node.metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(key))
        .map(String::as_str)
}

pub fn node_annotation<'a>(node: &'a Node, key: &str) -> Option<&'a str> {
    node.metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(key))
        .map(String::as_str)
}

pub fn is_selfhealing_disabled(node: &Node) -> bool {
    node_label(node, DISABLE_SELFHEALING_LABEL) == Some(DISABLE_SELFHEALING_VALUE)
}

pub fn is_master(node: &Node) -> bool {
    MASTER_ROLE_LABELS
        .iter()
        .any(|label| node_label(node, label).is_some())
}

pub fn is_unschedulable(node: &Node) -> bool {
    node.spec
        .as_ref()
        .and_then(|spec| spec.unschedulable)
        .unwrap_or(false)
}

/// The node's `InternalIP`, or its first address of any kind.
pub fn primary_address(node: &Node) -> Option<String> {
    let addresses = node.status.as_ref()?.addresses.as_ref()?;
    addresses
        .iter()
        .find(|a| a.type_ == "InternalIP")
        .or_else(|| addresses.first())
        .map(|a| a.address.clone())
}
