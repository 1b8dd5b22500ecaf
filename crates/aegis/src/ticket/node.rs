//! Ticket stored in the node's own annotation.
//!
//! Annotations are small, so only a pruned ticket is kept: workflows lose
//! their timestamps and messages, and the description beyond the condition
//! is not persisted.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{Ticket, TicketDescription, TicketError, TicketStatus, TicketWorkflow};
use super::{TicketWorkflowAction, TicketWorkflowStatus};
use crate::cluster::{node_annotation, NodeOps};

pub const TICKET_ANNOTATION: &str = "aegis.io/ticketing";
pub const MAX_ANNOTATION_BYTES: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeTicketWorkflow {
    pub action: TicketWorkflowAction,
    pub status: TicketWorkflowStatus,
}

/// Persisted form of a ticket in the `aegis.io/ticketing` annotation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeTicket {
    pub condition: String,
    pub reason: String,
    pub supervisor: String,
    pub status: TicketStatus,
    #[serde(default)]
    pub workflows: Vec<NodeTicketWorkflow>,
    pub creation_time: DateTime<Utc>,
}

impl NodeTicket {
    /// Serialize, refusing anything larger than the annotation budget.
    pub fn marshal(&self) -> Result<String, TicketError> {
        let yaml = serde_yaml::to_string(self)
            .map_err(|e| TicketError::InvalidDescription(e.to_string()))?;
        if yaml.len() > MAX_ANNOTATION_BYTES {
            return Err(TicketError::AnnotationTooLarge {
                size: yaml.len(),
                limit: MAX_ANNOTATION_BYTES,
            });
        }
        Ok(yaml)
    }

    pub fn unmarshal(raw: &str) -> Result<Self, TicketError> {
        serde_yaml::from_str(raw).map_err(|e| TicketError::InvalidDescription(e.to_string()))
    }
}

impl From<&Ticket> for NodeTicket {
    fn from(ticket: &Ticket) -> Self {
        Self {
            condition: ticket.condition.clone(),
            reason: ticket.reason.clone(),
            supervisor: ticket.supervisor.clone(),
            status: ticket.status,
            workflows: ticket
                .description
                .workflows
                .iter()
                .map(|w| NodeTicketWorkflow {
                    action: w.action,
                    status: w.status,
                })
                .collect(),
            creation_time: ticket.created_at,
        }
    }
}

impl From<NodeTicket> for Ticket {
    fn from(stored: NodeTicket) -> Self {
        let workflows = stored
            .workflows
            .into_iter()
            .map(|w| TicketWorkflow {
                timestamp: stored.creation_time,
                action: w.action,
                status: w.status,
                message: String::new(),
            })
            .collect();

        Self {
            id: None,
            is_hardware: false,
            description: TicketDescription {
                workflows,
                ..TicketDescription::new(stored.condition.clone())
            },
            condition: stored.condition,
            reason: stored.reason,
            supervisor: stored.supervisor,
            status: stored.status,
            created_at: stored.creation_time,
            foreign_description: None,
        }
    }
}

/// Reads and writes the ticket annotation of one node.
pub struct NodeTicketStore {
    node: String,
    nodes: Arc<dyn NodeOps>,
}

impl NodeTicketStore {
    pub fn new(node: impl Into<String>, nodes: Arc<dyn NodeOps>) -> Self {
        Self {
            node: node.into(),
            nodes,
        }
    }

    /// A missing or empty annotation means no ticket.
    pub async fn load(&self) -> Result<Option<Ticket>, TicketError> {
        let node = self.nodes.get_node(&self.node).await?;
        match node_annotation(&node, TICKET_ANNOTATION).map(str::trim) {
            None | Some("") => Ok(None),
            Some(raw) => Ok(Some(NodeTicket::unmarshal(raw)?.into())),
        }
    }

    pub async fn save(&self, ticket: &Ticket) -> Result<(), TicketError> {
        let yaml = NodeTicket::from(ticket).marshal()?;
        debug!(node = %self.node, bytes = yaml.len(), "Writing ticket annotation");
        self.nodes
            .patch_annotations(
                &self.node,
                BTreeMap::from([(TICKET_ANNOTATION.to_string(), Some(yaml))]),
            )
            .await?;
        Ok(())
    }

    pub async fn remove(&self) -> Result<(), TicketError> {
        debug!(node = %self.node, "Removing ticket annotation");
        self.nodes
            .patch_annotations(
                &self.node,
                BTreeMap::from([(TICKET_ANNOTATION.to_string(), None)]),
            )
            .await?;
        Ok(())
    }
}
