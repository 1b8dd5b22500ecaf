//! Durable record of a node's remediation episode.
//!
//! A [`TicketManager`] owns at most one active ticket for its node and
//! persists every change through one of three backends:
//!
//! - [`TicketBackend::Node`]: a pruned YAML copy in the node annotation
//!   `aegis.io/ticketing`
//! - [`TicketBackend::Scitix`]: the remote ticketing service, with the full
//!   [`TicketDescription`] stored as YAML in the ticket's description
//! - [`TicketBackend::Disabled`]: in memory only, for dry runs
//!
//! Every operation either persists and then updates the in-memory ticket,
//! or fails and leaves it untouched. Only the ticket's supervisor may change
//! it.

pub mod description;
pub mod node;
pub mod scitix;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::status::NodeStatus;

pub use description::{
    is_frequent, CauseCondition, ShutdownDescription, TicketCause, TicketDescription,
    TicketWorkflow,
};
pub use node::{NodeTicket, NodeTicketStore, MAX_ANNOTATION_BYTES, TICKET_ANNOTATION};
pub use scitix::{ScitixClient, ScitixError, ScitixTicketStore};

/// Supervisor name the healer uses for itself.
pub const HEALER_SUPERVISOR: &str = "aegis";

#[derive(Error, Debug)]
pub enum TicketError {
    #[error("an active ticket already exists for condition {condition}")]
    AlreadyExist { condition: String },

    #[error("ticket not found")]
    NotFound,

    #[error("ticket conclusion already exists")]
    ConclusionExist,

    #[error("ticket diagnosis already exists")]
    DiagnosisExist,

    #[error("ticket whySRE already exists")]
    WhySreExist,

    #[error("ticket shutdown description already exists")]
    ShutdownExist,

    #[error("ticket already has workflows, root cause is frozen")]
    WorkflowExist,

    #[error("ticket cause is {existing}, refusing to record {requested}")]
    CauseConflict { existing: String, requested: String },

    #[error("last workflow is {found:?}, cannot update {expected}")]
    WorkflowMismatch {
        expected: TicketWorkflowAction,
        found: Option<TicketWorkflowAction>,
    },

    #[error("ticket is supervised by {supervisor}, not {user}")]
    NotSupervisor { supervisor: String, user: String },

    #[error("serialized ticket is {size} bytes, limit is {limit}")]
    AnnotationTooLarge { size: usize, limit: usize },

    #[error("invalid ticket description: {0}")]
    InvalidDescription(String),

    #[error("no SRE configured to dispatch the ticket to")]
    NoSreConfigured,

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("ticket service: {0}")]
    Scitix(#[from] ScitixError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TicketStatus {
    #[default]
    Created,
    Assigned,
    Resolving,
    Resolved,
    Closed,
}

impl TicketStatus {
    /// Neither resolved nor closed.
    pub fn is_active(self) -> bool {
        !matches!(self, Self::Resolved | Self::Closed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Assigned => "assigned",
            Self::Resolving => "resolving",
            Self::Resolved => "resolved",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TicketWorkflowAction {
    Cordon,
    Uncordon,
    Drain,
    RestartPod,
    Reboot,
    Shutdown,
    SleepWait,
    Repair,
    Remedy,
    Diagnose,
    PerfGPU,
    HealthCheck,
    WaitCondition,
}

impl fmt::Display for TicketWorkflowAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TicketWorkflowStatus {
    Running,
    Succeeded,
    Failed,
    Canceled,
}

/// In-memory view of a ticket, common to every backend.
#[derive(Debug, Clone, PartialEq)]
pub struct Ticket {
    /// Remote ticket id; `None` on the annotation backend
    pub id: Option<String>,
    pub condition: String,
    /// Human-readable title
    pub reason: String,
    pub supervisor: String,
    pub status: TicketStatus,
    pub created_at: DateTime<Utc>,
    pub is_hardware: bool,
    pub description: TicketDescription,
    /// Parse error of a stored description that is not ours. The ticket is
    /// still visible, but its description is never overwritten.
    pub foreign_description: Option<String>,
}

/// What [`TicketManager::get_root_cause_description`] reports.
#[derive(Debug, Clone, PartialEq)]
pub struct RootCauseDescription {
    pub created_at: DateTime<Utc>,
    pub condition: String,
    /// Only tracked by backends that persist the full description
    pub cause: Option<TicketCause>,
}

/// SRE groups tickets are handed to, from `SRE`, `HardwareSRE` and `NonHardwareSRE`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SreRouting {
    pub default: Option<String>,
    pub hardware: Option<String>,
    pub non_hardware: Option<String>,
}

impl SreRouting {
    pub fn from_env() -> Self {
        let read = |key: &str| std::env::var(key).ok().filter(|v| !v.is_empty());
        Self {
            default: read("SRE"),
            hardware: read("HardwareSRE"),
            non_hardware: read("NonHardwareSRE"),
        }
    }

    pub fn route(&self, is_hardware: bool) -> Option<&str> {
        let specific = if is_hardware {
            self.hardware.as_deref()
        } else {
            self.non_hardware.as_deref()
        };
        specific.or(self.default.as_deref())
    }
}

/// Persistence behind a [`TicketManager`].
pub enum TicketBackend {
    Node(NodeTicketStore),
    Scitix(ScitixTicketStore),
    Disabled,
}

impl TicketBackend {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Node(_) => "Node",
            Self::Scitix(_) => "Scitix",
            Self::Disabled => "Disabled",
        }
    }
}

/// Backend-agnostic ticket operations for one node.
pub struct TicketManager {
    node: String,
    user: String,
    routing: SreRouting,
    backend: TicketBackend,
    ticket: Option<Ticket>,
}

impl TicketManager {
    pub fn new(node: impl Into<String>, backend: TicketBackend) -> Self {
        Self {
            node: node.into(),
            user: HEALER_SUPERVISOR.to_string(),
            routing: SreRouting::default(),
            backend,
            ticket: None,
        }
    }

    pub fn disabled(node: impl Into<String>) -> Self {
        Self::new(node, TicketBackend::Disabled)
    }

    #[must_use]
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    #[must_use]
    pub fn with_sre_routing(mut self, routing: SreRouting) -> Self {
        self.routing = routing;
        self
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn ticket(&self) -> Option<&Ticket> {
        self.ticket.as_ref()
    }

    /// Discard the in-memory ticket and reload it from the backend.
    #[instrument(skip(self), fields(node = %self.node, backend = self.backend.name()))]
    pub async fn reset(&mut self) -> Result<(), TicketError> {
        self.ticket = match &self.backend {
            TicketBackend::Node(store) => store.load().await?,
            TicketBackend::Scitix(store) => store.load_active().await?,
            TicketBackend::Disabled => self.ticket.take(),
        };
        debug!(exists = self.ticket.is_some(), "Ticket reloaded");
        Ok(())
    }

    /// No ticket, or a ticket this healer supervises.
    pub fn can_deal_with(&self) -> bool {
        self.ticket
            .as_ref()
            .is_none_or(|ticket| ticket.supervisor == self.user)
    }

    pub fn check_exists(&self) -> bool {
        self.ticket.is_some()
    }

    pub fn check_supervisor(&self, user: &str) -> bool {
        self.ticket
            .as_ref()
            .is_some_and(|ticket| ticket.supervisor == user)
    }

    /// Open a ticket for `status`. Refused while an active ticket exists.
    #[instrument(skip(self, status), fields(node = %self.node, condition = %status.condition))]
    pub async fn create_ticket(
        &mut self,
        status: &NodeStatus,
        hardware_type: &str,
        custom_title: Option<&str>,
    ) -> Result<(), TicketError> {
        let title = custom_title.map_or_else(
            || format!("{}: {}", self.node, status.condition),
            str::to_string,
        );
        let request = scitix::NewTicket {
            model: String::new(),
            hardware_type: hardware_type.to_string(),
        };
        self.create(
            &status.condition,
            title,
            status.status_type.is_hardware(),
            request,
        )
        .await
    }

    /// Open a ticket for a failed component rather than a node condition.
    #[instrument(skip(self), fields(node = %self.node))]
    pub async fn create_component_ticket(
        &mut self,
        title: &str,
        model: &str,
        component: &str,
    ) -> Result<(), TicketError> {
        let request = scitix::NewTicket {
            model: model.to_string(),
            hardware_type: component.to_string(),
        };
        self.create(component, title.to_string(), true, request)
            .await
    }

    async fn create(
        &mut self,
        condition: &str,
        title: String,
        is_hardware: bool,
        request: scitix::NewTicket,
    ) -> Result<(), TicketError> {
        if let Some(existing) = self.ticket.as_ref().filter(|t| t.status.is_active()) {
            debug!(existing = %existing.condition, "Active ticket already exists");
            return Err(TicketError::AlreadyExist {
                condition: existing.condition.clone(),
            });
        }

        let draft = Ticket {
            id: None,
            condition: condition.to_string(),
            reason: title,
            supervisor: self.user.clone(),
            status: TicketStatus::Created,
            created_at: Utc::now(),
            is_hardware,
            description: TicketDescription::new(condition),
            foreign_description: None,
        };

        let created = match &self.backend {
            TicketBackend::Node(store) => {
                store.save(&draft).await?;
                draft
            }
            TicketBackend::Scitix(store) => store.create(&draft, &request).await?,
            TicketBackend::Disabled => draft,
        };

        info!(
            condition = %created.condition,
            ticket_id = created.id.as_deref().unwrap_or("-"),
            "Ticket created"
        );
        self.ticket = Some(created);
        Ok(())
    }

    /// Accept the ticket as its supervisor, moving it to `resolving`.
    #[instrument(skip(self), fields(node = %self.node))]
    pub async fn adopt_ticket(&mut self) -> Result<(), TicketError> {
        let mut next = self.owned_ticket()?.clone();
        next.status = TicketStatus::Resolving;

        match &self.backend {
            TicketBackend::Node(_) => {
                info!("Ticket adoption has no effect on the node annotation");
                return Ok(());
            }
            TicketBackend::Scitix(store) => store.accept(&next).await?,
            TicketBackend::Disabled => {}
        }

        info!("Ticket adopted");
        self.ticket = Some(next);
        Ok(())
    }

    /// Hand the ticket to `user`. After this the healer no longer owns it.
    #[instrument(skip(self), fields(node = %self.node))]
    pub async fn dispatch_ticket(&mut self, user: &str) -> Result<(), TicketError> {
        let mut next = self.owned_ticket()?.clone();

        match &self.backend {
            TicketBackend::Node(_) => {
                info!(user = %user, "Ticket dispatch has no effect on the node annotation");
                return Ok(());
            }
            TicketBackend::Scitix(store) => store.dispatch(&next, user).await?,
            TicketBackend::Disabled => {}
        }

        next.supervisor = user.to_string();
        next.status = TicketStatus::Assigned;
        info!(user = %user, "Ticket dispatched");
        self.ticket = Some(next);
        Ok(())
    }

    /// Dispatch to the hardware or non-hardware SRE group.
    pub async fn dispatch_ticket_to_sre(&mut self) -> Result<(), TicketError> {
        let is_hardware = self.owned_ticket()?.is_hardware;
        let sre = self
            .routing
            .route(is_hardware)
            .ok_or(TicketError::NoSreConfigured)?
            .to_string();
        self.dispatch_ticket(&sre).await
    }

    #[instrument(skip(self), fields(node = %self.node))]
    pub async fn resolve_ticket(&mut self, answer: &str, operation: &str) -> Result<(), TicketError> {
        let mut next = self.owned_ticket()?.clone();
        next.status = TicketStatus::Resolved;

        match &self.backend {
            TicketBackend::Node(_) => {
                info!(answer = %answer, "Ticket resolution has no effect on the node annotation");
                return Ok(());
            }
            TicketBackend::Scitix(store) => store.resolve(&next, answer, operation).await?,
            TicketBackend::Disabled => {}
        }

        info!(answer = %answer, operation = %operation, "Ticket resolved");
        self.ticket = Some(next);
        Ok(())
    }

    /// Close the ticket and forget it.
    #[instrument(skip(self), fields(node = %self.node))]
    pub async fn close_ticket(&mut self) -> Result<(), TicketError> {
        let current = self.owned_ticket()?;

        match &self.backend {
            TicketBackend::Node(store) => store.remove().await?,
            TicketBackend::Scitix(store) => store.close(current).await?,
            TicketBackend::Disabled => {}
        }

        info!("Ticket closed");
        self.ticket = None;
        Ok(())
    }

    /// Remove the ticket. The ticket service cannot delete, so it closes.
    #[instrument(skip(self), fields(node = %self.node))]
    pub async fn delete_ticket(&mut self) -> Result<(), TicketError> {
        let current = self.owned_ticket()?;

        match &self.backend {
            TicketBackend::Node(store) => store.remove().await?,
            TicketBackend::Scitix(store) => store.close(current).await?,
            TicketBackend::Disabled => {}
        }

        info!("Ticket deleted");
        self.ticket = None;
        Ok(())
    }

    /// Whether the node's most recent fault appears more than `frequency`
    /// times among its last `size` tickets.
    pub async fn is_frequent_issue(
        &self,
        size: usize,
        frequency: usize,
    ) -> Result<bool, TicketError> {
        let history = match &self.backend {
            TicketBackend::Scitix(store) => store.history(size).await?,
            // The annotation holds no history beyond the live ticket.
            TicketBackend::Node(_) => return Ok(false),
            TicketBackend::Disabled => self
                .ticket
                .iter()
                .map(|t| t.description.clone())
                .take(size)
                .collect(),
        };
        Ok(is_frequent(&history, frequency))
    }

    /// Record the root cause, strictly. Returns the repetition count.
    pub async fn add_root_cause_description(
        &mut self,
        cause: CauseCondition,
        condition: &str,
    ) -> Result<u32, TicketError> {
        self.mutate(|ticket| {
            let count = ticket.description.add_root_cause(cause)?;
            ticket.description.condition = condition.to_string();
            ticket.condition = condition.to_string();
            Ok(count)
        })
        .await
    }

    /// Record or replace the root cause. Returns `true` when an existing
    /// cause was updated rather than replaced.
    pub async fn add_or_update_root_cause_description(
        &mut self,
        cause: CauseCondition,
        condition: &str,
    ) -> Result<bool, TicketError> {
        self.mutate(|ticket| {
            let updated = ticket.description.add_or_update_root_cause(cause)?;
            ticket.description.condition = condition.to_string();
            ticket.condition = condition.to_string();
            Ok(updated)
        })
        .await
    }

    pub async fn add_conclusion(&mut self, conclusion: &str) -> Result<(), TicketError> {
        self.mutate(|ticket| ticket.description.add_conclusion(conclusion))
            .await
    }

    pub async fn add_diagnosis(&mut self, diagnosis: Vec<String>) -> Result<(), TicketError> {
        self.mutate(|ticket| ticket.description.add_diagnosis(diagnosis))
            .await
    }

    pub async fn add_why_sre(&mut self, why: &str) -> Result<(), TicketError> {
        self.mutate(|ticket| ticket.description.add_why_sre(why)).await
    }

    pub fn get_root_cause_description(&self) -> Option<RootCauseDescription> {
        let ticket = self.ticket.as_ref()?;
        let cause = match self.backend {
            TicketBackend::Node(_) => None,
            TicketBackend::Scitix(_) | TicketBackend::Disabled => ticket.description.cause.clone(),
        };
        Some(RootCauseDescription {
            created_at: ticket.created_at,
            condition: ticket.condition.clone(),
            cause,
        })
    }

    pub fn get_action_count(&self, action: TicketWorkflowAction) -> usize {
        self.ticket
            .as_ref()
            .map_or(0, |t| t.description.action_count(action))
    }

    pub fn get_workflows(&self) -> &[TicketWorkflow] {
        self.ticket
            .as_ref()
            .map_or(&[], |t| t.description.workflows.as_slice())
    }

    pub fn get_last_workflow(&self) -> Option<&TicketWorkflow> {
        self.get_workflows().last()
    }

    pub async fn add_workflow(
        &mut self,
        action: TicketWorkflowAction,
        status: TicketWorkflowStatus,
        message: &str,
    ) -> Result<(), TicketError> {
        self.mutate(|ticket| {
            ticket
                .description
                .add_workflow(action, status, message, Utc::now())
        })
        .await?;
        info!(node = %self.node, action = %action, status = ?status, "Workflow added");
        Ok(())
    }

    pub async fn update_workflow(
        &mut self,
        action: TicketWorkflowAction,
        status: TicketWorkflowStatus,
        message: &str,
    ) -> Result<(), TicketError> {
        self.mutate(|ticket| {
            ticket
                .description
                .update_workflow(action, status, message, Utc::now())
        })
        .await?;
        info!(node = %self.node, action = %action, status = ?status, "Workflow updated");
        Ok(())
    }

    pub async fn add_shutdown_description(
        &mut self,
        kind: &str,
        status: &str,
        message: &str,
    ) -> Result<(), TicketError> {
        self.mutate(|ticket| {
            ticket
                .description
                .add_shutdown(kind, status, message, Utc::now())
        })
        .await
    }

    pub async fn update_shutdown_description(
        &mut self,
        status: &str,
        message: &str,
    ) -> Result<(), TicketError> {
        self.mutate(|ticket| {
            ticket
                .description
                .update_shutdown(status, message, Utc::now())
        })
        .await
    }

    /// The current ticket, provided this healer supervises it.
    fn owned_ticket(&self) -> Result<&Ticket, TicketError> {
        let ticket = self.ticket.as_ref().ok_or(TicketError::NotFound)?;
        if ticket.supervisor != self.user {
            warn!(
                node = %self.node,
                supervisor = %ticket.supervisor,
                user = %self.user,
                "Refusing to modify a ticket supervised by someone else"
            );
            return Err(TicketError::NotSupervisor {
                supervisor: ticket.supervisor.clone(),
                user: self.user.clone(),
            });
        }
        Ok(ticket)
    }

    /// Apply `change` to a copy of the ticket, persist it, then keep it.
    async fn mutate<T>(
        &mut self,
        change: impl FnOnce(&mut Ticket) -> Result<T, TicketError>,
    ) -> Result<T, TicketError> {
        let mut next = self.owned_ticket()?.clone();
        if let Some(error) = &next.foreign_description {
            warn!(node = %self.node, error = %error, "Refusing to overwrite an unreadable ticket description");
            return Err(TicketError::InvalidDescription(error.clone()));
        }
        let out = change(&mut next)?;

        match &self.backend {
            TicketBackend::Node(store) => store.save(&next).await?,
            TicketBackend::Scitix(store) => store.patch_description(&next).await?,
            TicketBackend::Disabled => {}
        }

        self.ticket = Some(next);
        Ok(out)
    }
}
