//! Standard operating procedures and the registry that selects them.
//!
//! An SOP is looked up by the condition the healer selected, bound to the
//! shared [`ApiBridge`], asked whether it wants to act, and then executed.
//! SOPs record every step on the node's ticket through the bridge.

mod builtin;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

pub use builtin::{EscalateSop, NodeCordonSop, NODE_NOT_READY_CONDITION};

use crate::cluster::NodeOps;
use crate::config::RegistrySettings;
use crate::events::EventSink;
use crate::gatekeeper::NODE_CORDON_CONDITION;
use crate::status::{NodeStatus, NodeStatusSource, StatusError};
use crate::ticket::{TicketError, TicketManager};

#[derive(Error, Debug)]
pub enum SopError {
    #[error("no SOP registered for condition {0}")]
    NotFound(String),

    #[error("SOP {0} used before create_instance")]
    NotInitialized(&'static str),

    #[error("ticket: {0}")]
    Ticket(#[from] TicketError),

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("metrics backend: {0}")]
    Status(#[from] StatusError),
}

/// Collaborators shared by every SOP of one invocation.
pub struct ApiBridge {
    pub cluster_name: String,
    pub region: String,
    pub org_name: String,
    pub nodes: Arc<dyn NodeOps>,
    pub statuses: Arc<dyn NodeStatusSource>,
    pub tickets: Arc<Mutex<TicketManager>>,
    pub events: Arc<dyn EventSink>,
    /// How aggressive remediation may be
    pub level: i32,
    pub registry: RegistrySettings,
}

impl fmt::Debug for ApiBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiBridge")
            .field("cluster_name", &self.cluster_name)
            .field("region", &self.region)
            .field("org_name", &self.org_name)
            .field("level", &self.level)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait Sop: Send + Sync {
    fn name(&self) -> &'static str;

    /// Bind to the shared collaborators. Called once before any other method.
    async fn create_instance(&mut self, bridge: Arc<ApiBridge>) -> Result<(), SopError>;

    /// Whether this SOP wants to act on `status`.
    async fn evaluate(&self, node: &str, status: &NodeStatus) -> bool;

    async fn execute(&self, node: &str, status: &NodeStatus) -> Result<(), SopError>;
}

pub type SopFactory = Arc<dyn Fn() -> Box<dyn Sop> + Send + Sync>;

/// Condition name to SOP factory.
#[derive(Clone, Default)]
pub struct SopRegistry {
    factories: BTreeMap<String, SopFactory>,
}

impl SopRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// `NodeCordon`, `NodeNotReady`, and an escalation SOP for each of
    /// `escalate_conditions`.
    pub fn builtin(escalate_conditions: &[String]) -> Self {
        let mut registry = Self::new();
        registry.register(
            NODE_CORDON_CONDITION,
            Arc::new(|| Box::new(NodeCordonSop::default()) as Box<dyn Sop>),
        );
        registry.register(
            NODE_NOT_READY_CONDITION,
            Arc::new(|| Box::new(EscalateSop::default()) as Box<dyn Sop>),
        );
        for condition in escalate_conditions {
            registry.register(
                condition,
                Arc::new(|| Box::new(EscalateSop::default()) as Box<dyn Sop>),
            );
        }
        registry
    }

    /// Later registrations replace earlier ones.
    pub fn register(&mut self, condition: &str, factory: SopFactory) {
        debug!(condition = %condition, "Registering SOP");
        self.factories.insert(condition.to_string(), factory);
    }

    /// A fresh, unbound SOP for `condition`.
    pub fn get_sop(&self, condition: &str) -> Result<Box<dyn Sop>, SopError> {
        self.factories
            .get(condition)
            .map(|factory| factory())
            .ok_or_else(|| SopError::NotFound(condition.to_string()))
    }

    pub fn conditions(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }
}

impl fmt::Debug for SopRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.conditions()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_registry() {
        let registry = SopRegistry::builtin(&["IBDown".to_string(), "GpfsDown".to_string()]);
        let conditions: Vec<&str> = registry.conditions().collect();
        assert_eq!(conditions, vec!["GpfsDown", "IBDown", "NodeCordon", "NodeNotReady"]);

        assert_eq!(registry.get_sop("NodeCordon").unwrap().name(), "NodeCordon");
        assert_eq!(registry.get_sop("IBDown").unwrap().name(), "Escalate");
    }

    #[test]
    fn test_missing_sop() {
        let registry = SopRegistry::builtin(&[]);
        assert!(matches!(
            registry.get_sop("GpuDown"),
            Err(SopError::NotFound(condition)) if condition == "GpuDown"
        ));
    }

    #[test]
    fn test_register_replaces() {
        let mut registry = SopRegistry::builtin(&[]);
        registry.register(
            NODE_NOT_READY_CONDITION,
            Arc::new(|| Box::new(NodeCordonSop::default()) as Box<dyn Sop>),
        );
        assert_eq!(registry.get_sop("NodeNotReady").unwrap().name(), "NodeCordon");
    }
}
