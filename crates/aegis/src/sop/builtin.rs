//! SOPs shipped with the healer. They only orchestrate: cordon, record,
//! and hand the ticket to SRE.

use std::fmt::Write;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, instrument, warn};

use super::{ApiBridge, Sop, SopError};
use crate::status::NodeStatus;
use crate::ticket::{
    CauseCondition, TicketError, TicketManager, TicketWorkflowAction, TicketWorkflowStatus,
};

pub const NODE_NOT_READY_CONDITION: &str = "NodeNotReady";

/// Look-back window and threshold for flagging a frequent issue.
const FREQUENT_WINDOW: usize = 10;
const FREQUENT_THRESHOLD: usize = 3;

fn bound(bridge: Option<&Arc<ApiBridge>>, name: &'static str) -> Result<Arc<ApiBridge>, SopError> {
    bridge.cloned().ok_or(SopError::NotInitialized(name))
}

/// Dispatch to SRE; a missing SRE group leaves the ticket with the healer.
async fn hand_to_sre(tickets: &mut TicketManager) -> Result<(), SopError> {
    match tickets.dispatch_ticket_to_sre().await {
        Ok(()) => Ok(()),
        Err(TicketError::NoSreConfigured) => {
            warn!(node = %tickets.node(), "No SRE group configured, ticket stays with the healer");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// A node cordoned by someone else and without a ticket: open one, conclude
/// it and hand it to SRE.
#[derive(Default)]
pub struct NodeCordonSop {
    bridge: Option<Arc<ApiBridge>>,
}

#[async_trait]
impl Sop for NodeCordonSop {
    fn name(&self) -> &'static str {
        "NodeCordon"
    }

    async fn create_instance(&mut self, bridge: Arc<ApiBridge>) -> Result<(), SopError> {
        self.bridge = Some(bridge);
        Ok(())
    }

    async fn evaluate(&self, _node: &str, _status: &NodeStatus) -> bool {
        let Some(bridge) = &self.bridge else {
            return false;
        };
        !bridge.tickets.lock().await.check_exists()
    }

    #[instrument(skip(self, status), fields(condition = %status.condition))]
    async fn execute(&self, node: &str, status: &NodeStatus) -> Result<(), SopError> {
        let bridge = bound(self.bridge.as_ref(), self.name())?;
        let mut tickets = bridge.tickets.lock().await;

        let title = format!("{node}: cordoned outside self-healing");
        tickets
            .create_ticket(status, status.status_type.as_str(), Some(&title))
            .await?;
        tickets
            .add_root_cause_description(CauseCondition::from(status), &status.condition)
            .await?;
        tickets
            .add_conclusion("node was cordoned outside self-healing; needs manual follow-up")
            .await?;
        hand_to_sre(&mut tickets).await?;

        info!(node = %node, "Externally cordoned node handed to SRE");
        Ok(())
    }
}

/// Cordon the node, then escalate to SRE with an explanation.
#[derive(Default)]
pub struct EscalateSop {
    bridge: Option<Arc<ApiBridge>>,
}

impl EscalateSop {
    async fn cordon(&self, bridge: &ApiBridge, tickets: &mut TicketManager, node: &str) -> Result<(), SopError> {
        tickets
            .add_workflow(
                TicketWorkflowAction::Cordon,
                TicketWorkflowStatus::Running,
                "cordoning node before escalation",
            )
            .await?;

        match bridge.nodes.set_unschedulable(node, true).await {
            Ok(_) => {
                tickets
                    .update_workflow(TicketWorkflowAction::Cordon, TicketWorkflowStatus::Succeeded, "")
                    .await?;
                Ok(())
            }
            Err(e) => {
                warn!(node = %node, error = %e, "Failed to cordon node");
                tickets
                    .update_workflow(
                        TicketWorkflowAction::Cordon,
                        TicketWorkflowStatus::Failed,
                        &e.to_string(),
                    )
                    .await?;
                Err(e.into())
            }
        }
    }
}

#[async_trait]
impl Sop for EscalateSop {
    fn name(&self) -> &'static str {
        "Escalate"
    }

    async fn create_instance(&mut self, bridge: Arc<ApiBridge>) -> Result<(), SopError> {
        self.bridge = Some(bridge);
        Ok(())
    }

    /// Acts unless the current ticket was already cordoned or concluded.
    async fn evaluate(&self, _node: &str, _status: &NodeStatus) -> bool {
        let Some(bridge) = &self.bridge else {
            return false;
        };
        let tickets = bridge.tickets.lock().await;
        match tickets.ticket() {
            None => true,
            Some(ticket) => {
                ticket.description.conclusion.is_none()
                    && tickets.get_action_count(TicketWorkflowAction::Cordon) == 0
            }
        }
    }

    #[instrument(skip(self, status), fields(condition = %status.condition))]
    async fn execute(&self, node: &str, status: &NodeStatus) -> Result<(), SopError> {
        let bridge = bound(self.bridge.as_ref(), self.name())?;
        let mut tickets = bridge.tickets.lock().await;

        if !tickets.check_exists() {
            tickets
                .create_ticket(status, status.status_type.as_str(), None)
                .await?;
        }
        match tickets
            .add_or_update_root_cause_description(CauseCondition::from(status), &status.condition)
            .await
        {
            Ok(_) => {}
            Err(TicketError::CauseConflict { existing, requested }) => {
                warn!(existing = %existing, requested = %requested, "Keeping the ticket's original cause");
            }
            Err(e) => return Err(e.into()),
        }

        self.cordon(&bridge, &mut tickets, node).await?;

        let frequent = match tickets
            .is_frequent_issue(FREQUENT_WINDOW, FREQUENT_THRESHOLD)
            .await
        {
            Ok(frequent) => frequent,
            Err(e) => {
                warn!(error = %e, "Failed to read ticket history");
                false
            }
        };

        let mut why = format!("{} on {node} is not self-healable", status.condition);
        if frequent {
            let _ = write!(
                why,
                "; frequent issue, seen more than {FREQUENT_THRESHOLD} times in the last {FREQUENT_WINDOW} tickets"
            );
        }
        match tickets.add_why_sre(&why).await {
            Ok(()) | Err(TicketError::WhySreExist) => {}
            Err(e) => return Err(e.into()),
        }
        hand_to_sre(&mut tickets).await?;

        info!(node = %node, frequent, "Node cordoned and escalated to SRE");
        Ok(())
    }
}
