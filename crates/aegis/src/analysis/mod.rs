//! Classification of a node's statuses into priority buckets.

pub mod priority;

use tracing::debug;

use crate::status::NodeStatus;

pub use priority::{Priority, PriorityError, PriorityTable};

/// A node's statuses partitioned by priority.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnalysisResult {
    pub not_ready: Option<NodeStatus>,
    pub cordon: Option<NodeStatus>,
    /// Priority in `(NodeCordon, Emergency]`, ascending. Also holds anything
    /// below `NodeNotReady` and repeat candidates for the two slots.
    pub emergency_list: Vec<NodeStatus>,
    /// Priority in `(Emergency, CanIgnore]`, ascending
    pub can_ignore_list: Vec<NodeStatus>,
    /// Priority above `CanIgnore`, ascending
    pub must_ignore_list: Vec<NodeStatus>,
}

impl AnalysisResult {
    pub fn len(&self) -> usize {
        usize::from(self.not_ready.is_some())
            + usize::from(self.cordon.is_some())
            + self.emergency_list.len()
            + self.can_ignore_list.len()
            + self.must_ignore_list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Buckets statuses with a priority table it owns.
#[derive(Debug, Clone, Default)]
pub struct Analyzer {
    table: PriorityTable,
}

impl Analyzer {
    pub fn new(table: PriorityTable) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &PriorityTable {
        &self.table
    }

    /// Partition `statuses`.
    ///
    /// Only a priority of exactly `NodeNotReady` or `NodeCordon` fills the
    /// matching slot, first in input order. Repeats and priorities below
    /// `NodeNotReady` sort to the head of the emergency list so that every
    /// input lands in exactly one bucket.
    pub fn analyze(&self, statuses: &[NodeStatus]) -> AnalysisResult {
        let mut result = AnalysisResult::default();
        let mut emergency = Vec::new();
        let mut can_ignore = Vec::new();
        let mut must_ignore = Vec::new();

        for status in statuses {
            let priority = self.table.priority_of(&status.condition);
            let entry = (priority, status.clone());

            if priority == Priority::NODE_NOT_READY {
                if result.not_ready.is_none() {
                    result.not_ready = Some(entry.1);
                } else {
                    emergency.push(entry);
                }
            } else if priority == Priority::NODE_CORDON {
                if result.cordon.is_none() {
                    result.cordon = Some(entry.1);
                } else {
                    emergency.push(entry);
                }
            } else if priority <= Priority::EMERGENCY {
                emergency.push(entry);
            } else if priority <= Priority::CAN_IGNORE {
                can_ignore.push(entry);
            } else {
                must_ignore.push(entry);
            }
        }

        result.emergency_list = sorted(emergency);
        result.can_ignore_list = sorted(can_ignore);
        result.must_ignore_list = sorted(must_ignore);

        debug!(
            not_ready = result.not_ready.is_some(),
            cordon = result.cordon.is_some(),
            emergency = result.emergency_list.len(),
            can_ignore = result.can_ignore_list.len(),
            must_ignore = result.must_ignore_list.len(),
            "Analyzed node statuses"
        );

        result
    }
}

// sort_by_key is stable, so equal priorities keep input order
fn sorted(mut entries: Vec<(i32, NodeStatus)>) -> Vec<NodeStatus> {
    entries.sort_by_key(|(priority, _)| *priority);
    entries.into_iter().map(|(_, status)| status).collect()
}

/// Pick the one status to act on: not-ready first, then cordon when nothing
/// is an emergency, then the most urgent emergency.
pub fn select_status(result: &AnalysisResult) -> Option<&NodeStatus> {
    if let Some(status) = &result.not_ready {
        return Some(status);
    }
    if result.emergency_list.is_empty() {
        if let Some(status) = &result.cordon {
            return Some(status);
        }
    }
    result.emergency_list.first()
}
