//! The per-node healing body.
//!
//! One invocation targets one node: refresh the ticket, pick the single most
//! urgent status, check cluster-wide admission, then hand the status to the
//! SOP registered for its condition. Every early return is reported as a
//! [`HealOutcome`].

pub mod lease;

#[cfg(test)]
mod tests;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Node;
use tracing::{debug, info, instrument, warn};

use crate::analysis::{select_status, Analyzer, PriorityTable};
use crate::cluster::{is_master, is_selfhealing_disabled};
use crate::config::HealerConfig;
use crate::error::{Error, Result};
use crate::events::HealerEvent;
use crate::gatekeeper::{GateKeeper, NODE_CORDON_CONDITION};
use crate::sop::{ApiBridge, SopError, SopRegistry};
use crate::status::NodeStatus;
use crate::ticket::{CauseCondition, TicketError};

const EVENT_STARTED: &str = "SelfHealingStarted";
const EVENT_FINISHED: &str = "SelfHealingFinished";
const EVENT_ACTION: &str = "SelfHealing";

/// How an invocation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealOutcome {
    PrecheckFailed,
    /// The ticket is supervised by someone else
    NotOwner,
    /// The node carries the disable-selfhealing label
    Disabled,
    NothingSelected,
    GateDenied { condition: String, reason: String },
    NoSop { condition: String },
    NotEvaluated { condition: String },
    MasterNode { condition: String },
    TicketOnly { condition: String },
    Executed { condition: String },
}

impl fmt::Display for HealOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PrecheckFailed => f.write_str("precheck failed"),
            Self::NotOwner => f.write_str("ticket is owned by another supervisor"),
            Self::Disabled => f.write_str("self-healing disabled by label, handed to SRE"),
            Self::NothingSelected => f.write_str("no actionable status"),
            Self::GateDenied { condition, reason } => {
                write!(f, "{condition}: denied by gatekeeper: {reason}")
            }
            Self::NoSop { condition } => write!(f, "{condition}: no SOP registered"),
            Self::NotEvaluated { condition } => write!(f, "{condition}: SOP declined to act"),
            Self::MasterNode { condition } => {
                write!(f, "{condition}: skipped on control-plane node")
            }
            Self::TicketOnly { condition } => write!(f, "{condition}: ticket recorded"),
            Self::Executed { condition } => write!(f, "{condition}: SOP executed"),
        }
    }
}

pub struct NodeHealer {
    node: String,
    type_filter: String,
    priority_config: PathBuf,
    ticket_only: bool,
    bridge: Arc<ApiBridge>,
    registry: SopRegistry,
}

impl NodeHealer {
    pub fn new(config: &HealerConfig, bridge: Arc<ApiBridge>, registry: SopRegistry) -> Self {
        Self {
            node: config.node.clone(),
            type_filter: config.type_filter.clone(),
            priority_config: config.priority_config.clone(),
            ticket_only: config.ticket_only,
            bridge,
            registry,
        }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    /// Reserved hook run before the body.
    pub fn precheck(&self) -> bool {
        true
    }

    /// Run one healing pass, posting start and finish events on the node.
    #[instrument(skip(self), fields(node = %self.node))]
    pub async fn heal(&self) -> Result<HealOutcome> {
        let node = match self.bridge.nodes.get_node(&self.node).await {
            Ok(node) => node,
            Err(kube::Error::Api(err)) if err.code == 404 => {
                return Err(Error::NodeNotFound(self.node.clone()));
            }
            Err(e) => return Err(e.into()),
        };

        self.bridge
            .events
            .publish(
                &node,
                HealerEvent::normal(EVENT_STARTED, EVENT_ACTION, "self-healing started"),
            )
            .await;

        let result = if self.precheck() {
            self.body(&node).await
        } else {
            Ok(HealOutcome::PrecheckFailed)
        };

        let event = match &result {
            Ok(outcome) => {
                info!(outcome = %outcome, "Self-healing finished");
                HealerEvent::normal(EVENT_FINISHED, EVENT_ACTION, outcome.to_string())
            }
            Err(e) => {
                warn!(error = %e, "Self-healing failed");
                HealerEvent::warning(
                    EVENT_FINISHED,
                    EVENT_ACTION,
                    format!("self-healing failed: {e}"),
                )
            }
        };
        self.bridge.events.publish(&node, event).await;

        result
    }

    async fn body(&self, node: &Node) -> Result<HealOutcome> {
        {
            let mut tickets = self.bridge.tickets.lock().await;
            tickets.reset().await?;

            if !tickets.can_deal_with() {
                info!(
                    supervisor = tickets.ticket().map_or("-", |t| t.supervisor.as_str()),
                    "Ticket is supervised by someone else, nothing to do"
                );
                return Ok(HealOutcome::NotOwner);
            }
        }

        if is_selfhealing_disabled(node) {
            self.hand_over_disabled().await?;
            return Ok(HealOutcome::Disabled);
        }

        let statuses = self
            .bridge
            .statuses
            .get_node_statuses(&self.node, &self.type_filter)
            .await?;
        let analyzer = Analyzer::new(PriorityTable::load(&self.priority_config)?);
        let analysis = analyzer.analyze(&statuses);
        debug!(
            statuses = statuses.len(),
            emergency = analysis.emergency_list.len(),
            "Statuses analyzed"
        );

        let Some(selected) = select_status(&analysis) else {
            info!("No status selected");
            return Ok(HealOutcome::NothingSelected);
        };
        let condition = selected.condition.clone();
        info!(condition = %condition, id = %selected.id, "Status selected");

        if condition != NODE_CORDON_CONDITION {
            let gate = GateKeeper::new(self.bridge.statuses.clone()).await?;
            let admission = gate.pass().await;
            if !admission.admitted {
                info!(condition = %condition, reason = %admission.reason, "GateKeeper denied remediation");
                return Ok(HealOutcome::GateDenied {
                    condition,
                    reason: admission.reason,
                });
            }
        }

        if self.ticket_only {
            self.record_ticket(selected).await?;
            return Ok(HealOutcome::TicketOnly { condition });
        }

        let mut sop = match self.registry.get_sop(&condition) {
            Ok(sop) => sop,
            Err(SopError::NotFound(_)) => {
                warn!(condition = %condition, "No SOP registered for condition");
                return Ok(HealOutcome::NoSop { condition });
            }
            Err(e) => return Err(e.into()),
        };

        sop.create_instance(self.bridge.clone()).await?;
        if !sop.evaluate(&self.node, selected).await {
            info!(condition = %condition, sop = sop.name(), "SOP declined to act");
            return Ok(HealOutcome::NotEvaluated { condition });
        }

        if is_master(node) {
            info!(condition = %condition, "Refusing to execute an SOP on a control-plane node");
            return Ok(HealOutcome::MasterNode { condition });
        }

        info!(condition = %condition, sop = sop.name(), "Executing SOP");
        sop.execute(&self.node, selected).await?;
        Ok(HealOutcome::Executed { condition })
    }

    /// Conclude and dispatch an existing ticket. The conclusion goes first
    /// since dispatching gives up ownership.
    async fn hand_over_disabled(&self) -> Result<()> {
        let mut tickets = self.bridge.tickets.lock().await;
        if !tickets.check_exists() {
            info!("Self-healing disabled by label, no ticket to hand over");
            return Ok(());
        }

        match tickets
            .add_conclusion("self-healing disabled on the node; dispatched to SRE")
            .await
        {
            Ok(()) | Err(TicketError::ConclusionExist) => {}
            Err(e) => return Err(e.into()),
        }
        match tickets.dispatch_ticket_to_sre().await {
            Ok(()) => info!("Self-healing disabled by label, ticket dispatched to SRE"),
            Err(TicketError::NoSreConfigured) => {
                warn!("Self-healing disabled by label but no SRE group is configured");
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    /// Open a ticket for `status` and record its cause, without remediation.
    async fn record_ticket(&self, status: &NodeStatus) -> Result<()> {
        let mut tickets = self.bridge.tickets.lock().await;
        match tickets
            .create_ticket(status, status.status_type.as_str(), None)
            .await
        {
            Ok(()) => {}
            Err(TicketError::AlreadyExist { condition }) => {
                debug!(existing = %condition, "Reusing the active ticket");
            }
            Err(e) => return Err(e.into()),
        }

        match tickets
            .add_or_update_root_cause_description(CauseCondition::from(status), &status.condition)
            .await
        {
            Ok(updated) => {
                debug!(updated, "Root cause recorded");
                Ok(())
            }
            Err(TicketError::CauseConflict { existing, requested }) => {
                warn!(existing = %existing, requested = %requested, "Keeping the ticket's original cause");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
