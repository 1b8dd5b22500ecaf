//! Structured ticket description and its write rules.
//!
//! The description is the incident's audit trail. It is stored as YAML in
//! the ticket service's `description` field and must decode into this exact
//! schema; maps with non-string keys or unknown shapes are rejected.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{TicketError, TicketWorkflowAction, TicketWorkflowStatus};
use crate::status::{NodeStatus, StatusType};

/// Shape of the fault a ticket was opened for.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CauseCondition {
    pub condition: String,
    #[serde(rename = "type", default)]
    pub status_type: StatusType,
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub msg: String,
}

impl CauseCondition {
    /// Same `(condition, type, id)`; the message is ignored.
    pub fn same_fault(&self, other: &Self) -> bool {
        self.condition == other.condition
            && self.status_type == other.status_type
            && self.id == other.id
    }
}

impl From<&NodeStatus> for CauseCondition {
    fn from(status: &NodeStatus) -> Self {
        Self {
            condition: status.condition.clone(),
            status_type: status.status_type,
            id: status.id.clone(),
            msg: status.msg.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketCause {
    pub condition: CauseCondition,
    pub count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketWorkflow {
    pub timestamp: DateTime<Utc>,
    pub action: TicketWorkflowAction,
    pub status: TicketWorkflowStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

/// Power-off record for nodes taken out of service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownDescription {
    pub kind: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TicketDescription {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub condition: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<TicketCause>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub workflows: Vec<TicketWorkflow>,
    #[serde(default, rename = "whySRE", skip_serializing_if = "Option::is_none")]
    pub why_sre: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnosis: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conclusion: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shutdown: Option<ShutdownDescription>,
}

impl TicketDescription {
    pub fn new(condition: impl Into<String>) -> Self {
        Self {
            condition: condition.into(),
            ..Self::default()
        }
    }

    pub fn to_yaml(&self) -> Result<String, TicketError> {
        serde_yaml::to_string(self).map_err(|e| TicketError::InvalidDescription(e.to_string()))
    }

    /// Decode a persisted description; an empty string is an empty description.
    pub fn from_yaml(raw: &str) -> Result<Self, TicketError> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(raw).map_err(|e| TicketError::InvalidDescription(e.to_string()))
    }

    /// Record the cause for the first time or bump its count. Refused once
    /// the ticket has a conclusion or any workflow, or if a different cause
    /// is already recorded.
    pub fn add_root_cause(&mut self, condition: CauseCondition) -> Result<u32, TicketError> {
        if self.conclusion.is_some() {
            return Err(TicketError::ConclusionExist);
        }
        if !self.workflows.is_empty() {
            return Err(TicketError::WorkflowExist);
        }
        match &mut self.cause {
            Some(cause) if !cause.condition.same_fault(&condition) => {
                Err(TicketError::CauseConflict {
                    existing: cause.condition.condition.clone(),
                    requested: condition.condition,
                })
            }
            Some(cause) => {
                cause.count += 1;
                Ok(cause.count)
            }
            None => {
                self.cause = Some(TicketCause {
                    condition,
                    count: 1,
                });
                Ok(1)
            }
        }
    }

    /// Bump the count of a matching cause, or replace it with a fresh one.
    /// Returns `true` when an existing cause was updated.
    pub fn add_or_update_root_cause(
        &mut self,
        condition: CauseCondition,
    ) -> Result<bool, TicketError> {
        match &mut self.cause {
            Some(cause) if cause.condition.same_fault(&condition) => {
                cause.count += 1;
                Ok(true)
            }
            Some(cause) if !self.workflows.is_empty() => Err(TicketError::CauseConflict {
                existing: cause.condition.condition.clone(),
                requested: condition.condition,
            }),
            _ => {
                self.cause = Some(TicketCause {
                    condition,
                    count: 1,
                });
                Ok(false)
            }
        }
    }

    pub fn add_conclusion(&mut self, conclusion: &str) -> Result<(), TicketError> {
        if self.conclusion.is_some() {
            return Err(TicketError::ConclusionExist);
        }
        self.conclusion = Some(conclusion.to_string());
        Ok(())
    }

    pub fn add_diagnosis(&mut self, diagnosis: Vec<String>) -> Result<(), TicketError> {
        if self.diagnosis.is_some() {
            return Err(TicketError::DiagnosisExist);
        }
        self.diagnosis = Some(diagnosis);
        Ok(())
    }

    pub fn add_why_sre(&mut self, why: &str) -> Result<(), TicketError> {
        if self.why_sre.is_some() {
            return Err(TicketError::WhySreExist);
        }
        self.why_sre = Some(why.to_string());
        Ok(())
    }

    pub fn add_workflow(
        &mut self,
        action: TicketWorkflowAction,
        status: TicketWorkflowStatus,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<(), TicketError> {
        if self.conclusion.is_some() {
            return Err(TicketError::ConclusionExist);
        }
        self.workflows.push(TicketWorkflow {
            timestamp: now,
            action,
            status,
            message: message.to_string(),
        });
        Ok(())
    }

    /// Rewrite the most recent workflow entry, which must be for `action`.
    pub fn update_workflow(
        &mut self,
        action: TicketWorkflowAction,
        status: TicketWorkflowStatus,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<(), TicketError> {
        let last = self
            .workflows
            .last_mut()
            .ok_or(TicketError::WorkflowMismatch {
                expected: action,
                found: None,
            })?;
        if last.action != action {
            return Err(TicketError::WorkflowMismatch {
                expected: action,
                found: Some(last.action),
            });
        }
        last.status = status;
        last.message = message.to_string();
        last.timestamp = now;
        Ok(())
    }

    pub fn action_count(&self, action: TicketWorkflowAction) -> usize {
        self.workflows.iter().filter(|w| w.action == action).count()
    }

    pub fn add_shutdown(
        &mut self,
        kind: &str,
        status: &str,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<(), TicketError> {
        if self.shutdown.is_some() {
            return Err(TicketError::ShutdownExist);
        }
        self.shutdown = Some(ShutdownDescription {
            kind: kind.to_string(),
            status: status.to_string(),
            message: message.to_string(),
            timestamp: now,
        });
        Ok(())
    }

    pub fn update_shutdown(
        &mut self,
        status: &str,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<(), TicketError> {
        let shutdown = self.shutdown.as_mut().ok_or(TicketError::NotFound)?;
        shutdown.status = status.to_string();
        shutdown.message = message.to_string();
        shutdown.timestamp = now;
        Ok(())
    }
}

/// Whether the most recent description's fault shows up more than
/// `frequency` times in `history` (most recent first).
pub fn is_frequent(history: &[TicketDescription], frequency: usize) -> bool {
    let Some(latest) = history
        .first()
        .and_then(|d| d.cause.as_ref())
        .map(|c| &c.condition)
    else {
        return false;
    };

    let count = history
        .iter()
        .filter_map(|d| d.cause.as_ref())
        .filter(|c| c.condition.same_fault(latest))
        .count();

    count > frequency
}
