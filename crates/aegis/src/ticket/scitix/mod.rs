//! Remote ticketing service backend.
//!
//! The node is identified remotely by its serial number, resolved once from
//! the instance inventory. The full [`TicketDescription`] lives as YAML in
//! the remote ticket's `description` field.

mod client;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Node;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

pub use client::{
    signature, CreateTicketRequest, CredentialSource, InstanceInfo, RemoteTicket,
    ResolveTicketRequest, ScitixClient, ScitixCredentials,
};

use super::{Ticket, TicketDescription, TicketError, TicketStatus};
use crate::cluster::primary_address;
use crate::config::ConfigError;

const HISTORY_PAGE: usize = 1;
const ACTIVE_LOOKUP_SIZE: usize = 20;
const TICKET_PRIORITY: &str = "P2";

#[derive(Error, Debug)]
pub enum ScitixError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("ticket service returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("ticket service rejected the request: {0}")]
    Rejected(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("node {0} has no address to look up its instance")]
    NoAddress(String),

    #[error("{count} instances match ip {ip}")]
    AmbiguousInstance { ip: String, count: usize },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Fields only the remote service needs when opening a ticket.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewTicket {
    pub model: String,
    pub hardware_type: String,
}

fn parse_status(raw: &str) -> TicketStatus {
    match raw.to_ascii_lowercase().as_str() {
        "assigned" => TicketStatus::Assigned,
        "resolving" => TicketStatus::Resolving,
        "resolved" => TicketStatus::Resolved,
        "closed" => TicketStatus::Closed,
        _ => TicketStatus::Created,
    }
}

fn parse_time(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw).map_or_else(|_| Utc::now(), |t| t.with_timezone(&Utc))
}

impl From<RemoteTicket> for Ticket {
    fn from(remote: RemoteTicket) -> Self {
        let (description, foreign_description) = match TicketDescription::from_yaml(&remote.description) {
            Ok(description) => (description, None),
            Err(e) => {
                warn!(
                    ticket_id = %remote.ticket_id,
                    supervisor = %remote.supervisor,
                    error = %e,
                    "Ticket description is not a healer record, treating it as read-only"
                );
                (TicketDescription::default(), Some(e.to_string()))
            }
        };
        Self {
            id: Some(remote.ticket_id),
            condition: description.condition.clone(),
            reason: remote.title,
            supervisor: remote.supervisor,
            status: parse_status(&remote.status),
            created_at: parse_time(&remote.start_time),
            is_hardware: remote.is_hardware_issue,
            description,
            foreign_description,
        }
    }
}

/// Tickets of one node on the remote service.
pub struct ScitixTicketStore {
    client: ScitixClient,
    region: String,
    org_name: String,
    node_name: String,
    node_sn: String,
    creator: String,
}

impl ScitixTicketStore {
    /// Resolve the node's serial number from its address, then build the store.
    #[instrument(skip(client), fields(node = %node_name))]
    pub async fn new(
        client: ScitixClient,
        region: &str,
        org_name: &str,
        node_name: &str,
        node_ip: &str,
        creator: &str,
    ) -> Result<Self, TicketError> {
        let info = client.instance_info(region, org_name, node_ip).await?;
        debug!(sn = %info.sn, instance = %info.instance_id, "Resolved node serial number");
        Ok(Self::with_serial(
            client, region, org_name, node_name, &info.sn, creator,
        ))
    }

    /// [`Self::new`] keyed by the node's primary address.
    pub async fn for_node(
        client: ScitixClient,
        region: &str,
        org_name: &str,
        node: &Node,
        creator: &str,
    ) -> Result<Self, TicketError> {
        let name = node.metadata.name.as_deref().unwrap_or_default();
        let Some(address) = primary_address(node) else {
            return Err(ScitixError::NoAddress(name.to_string()).into());
        };
        Self::new(client, region, org_name, name, &address, creator).await
    }

    pub fn with_serial(
        client: ScitixClient,
        region: &str,
        org_name: &str,
        node_name: &str,
        node_sn: &str,
        creator: &str,
    ) -> Self {
        Self {
            client,
            region: region.to_string(),
            org_name: org_name.to_string(),
            node_name: node_name.to_string(),
            node_sn: node_sn.to_string(),
            creator: creator.to_string(),
        }
    }

    pub fn node_sn(&self) -> &str {
        &self.node_sn
    }

    /// The newest ticket of this node that is neither resolved nor closed.
    pub async fn load_active(&self) -> Result<Option<Ticket>, TicketError> {
        let rows = self
            .client
            .list_tickets(&self.region, &self.node_sn, HISTORY_PAGE, ACTIVE_LOOKUP_SIZE)
            .await?;

        Ok(rows
            .into_iter()
            .find(|row| parse_status(&row.status).is_active())
            .map(Ticket::from))
    }

    pub async fn create(&self, draft: &Ticket, request: &NewTicket) -> Result<Ticket, TicketError> {
        let body = CreateTicketRequest {
            region: self.region.clone(),
            org_name: self.org_name.clone(),
            creator: self.creator.clone(),
            title: draft.reason.clone(),
            priority: TICKET_PRIORITY.to_string(),
            node_name: self.node_name.clone(),
            node_sn: self.node_sn.clone(),
            is_hardware_issue: draft.is_hardware,
            model: request.model.clone(),
            hardware_type: request.hardware_type.clone(),
            start_time: draft.created_at.to_rfc3339(),
            description: draft.description.to_yaml()?,
            is_from_customer: false,
        };

        let remote = self.client.create_ticket(&body).await?;
        info!(ticket_id = %remote.ticket_id, "Remote ticket created");
        Ok(Ticket {
            id: Some(remote.ticket_id),
            ..draft.clone()
        })
    }

    pub async fn patch_description(&self, ticket: &Ticket) -> Result<(), TicketError> {
        let yaml = ticket.description.to_yaml()?;
        self.client
            .patch_ticket(remote_id(ticket)?, "description", &yaml)
            .await?;
        Ok(())
    }

    pub async fn accept(&self, ticket: &Ticket) -> Result<(), TicketError> {
        self.client.accept_ticket(remote_id(ticket)?).await?;
        Ok(())
    }

    pub async fn dispatch(&self, ticket: &Ticket, supervisor: &str) -> Result<(), TicketError> {
        self.client
            .dispatch_ticket(remote_id(ticket)?, supervisor)
            .await?;
        Ok(())
    }

    pub async fn resolve(
        &self,
        ticket: &Ticket,
        answer: &str,
        operation: &str,
    ) -> Result<(), TicketError> {
        let request = ResolveTicketRequest {
            ticket_id: remote_id(ticket)?.to_string(),
            answer: answer.to_string(),
            operation: operation.to_string(),
            finish_time: Utc::now().to_rfc3339(),
            is_hardware_issue: ticket.is_hardware,
        };
        self.client.resolve_ticket(&request).await?;
        Ok(())
    }

    pub async fn close(&self, ticket: &Ticket) -> Result<(), TicketError> {
        self.client.close_ticket(remote_id(ticket)?).await?;
        Ok(())
    }

    /// Descriptions of the last `size` tickets, most recent first.
    /// Undecodable descriptions are skipped.
    pub async fn history(&self, size: usize) -> Result<Vec<TicketDescription>, TicketError> {
        let rows = self
            .client
            .list_tickets(&self.region, &self.node_sn, HISTORY_PAGE, size)
            .await?;

        Ok(rows
            .into_iter()
            .take(size)
            .filter_map(|row| match TicketDescription::from_yaml(&row.description) {
                Ok(description) => Some(description),
                Err(e) => {
                    warn!(ticket_id = %row.ticket_id, error = %e, "Skipping undecodable ticket description");
                    None
                }
            })
            .collect())
    }
}

fn remote_id(ticket: &Ticket) -> Result<&str, TicketError> {
    ticket.id.as_deref().ok_or(TicketError::NotFound)
}
