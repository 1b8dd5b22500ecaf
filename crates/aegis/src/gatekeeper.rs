//! Cluster-wide admission control.
//!
//! Remediation usually starts by cordoning the node. When too much of the
//! cluster is already cordoned, further remediation is refused so that
//! workloads keep enough headroom.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::status::{NodeStatusSource, StatusError};

/// Condition reported for cordoned nodes.
pub const NODE_CORDON_CONDITION: &str = "NodeCordon";

/// Fraction of the cluster allowed to be cordoned.
pub const DISABLE_RATIO: f64 = 0.3;

/// Verdict of [`GateKeeper::pass`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub admitted: bool,
    pub reason: String,
}

pub struct GateKeeper {
    source: Arc<dyn NodeStatusSource>,
    node_count: usize,
    disable_limit: usize,
}

impl GateKeeper {
    /// Snapshot the cluster size. The limit is not refreshed afterwards.
    pub async fn new(source: Arc<dyn NodeStatusSource>) -> Result<Self, StatusError> {
        let node_count = source.list_nodes().await?.len();
        let disable_limit = disable_limit(node_count);
        info!(node_count, disable_limit, "GateKeeper initialized");

        Ok(Self {
            source,
            node_count,
            disable_limit,
        })
    }

    pub fn node_count(&self) -> usize {
        self.node_count
    }

    pub fn disable_limit(&self) -> usize {
        self.disable_limit
    }

    /// Admit iff the number of cordoned nodes is within the limit. A failed
    /// query denies admission.
    pub async fn pass(&self) -> Admission {
        let statuses = match self
            .source
            .list_node_statuses_with_condition(NODE_CORDON_CONDITION)
            .await
        {
            Ok(statuses) => statuses,
            Err(e) => {
                warn!(error = %e, "Failed to count cordoned nodes");
                return Admission {
                    admitted: false,
                    reason: format!("failed to query cordoned nodes: {e}"),
                };
            }
        };

        let cordoned: BTreeSet<&str> = statuses.iter().map(|s| s.name.as_str()).collect();
        let cordon_count = cordoned.len();
        debug!(cordon_count, disable_limit = self.disable_limit, "GateKeeper check");

        if cordon_count <= self.disable_limit {
            Admission {
                admitted: true,
                reason: format!(
                    "{cordon_count} of {} nodes cordoned, limit {}",
                    self.node_count, self.disable_limit
                ),
            }
        } else {
            Admission {
                admitted: false,
                reason: format!(
                    "too many cordoned nodes: {cordon_count} of {} exceeds limit {}",
                    self.node_count, self.disable_limit
                ),
            }
        }
    }
}

/// `floor(DISABLE_RATIO * node_count)`
pub fn disable_limit(node_count: usize) -> usize {
    (DISABLE_RATIO * node_count as f64).floor() as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::FakeStatusSource;

    #[test]
    fn test_disable_limit() {
        assert_eq!(disable_limit(0), 0);
        assert_eq!(disable_limit(3), 0);
        assert_eq!(disable_limit(4), 1);
        assert_eq!(disable_limit(10), 3);
        assert_eq!(disable_limit(100), 30);
        assert_eq!(disable_limit(1001), 300);
    }

    #[tokio::test]
    async fn test_pass_within_limit() {
        let source = FakeStatusSource::with_nodes(10).cordoned(&["n0", "n1", "n2"]);
        let gate = GateKeeper::new(Arc::new(source)).await.unwrap();

        assert_eq!(gate.disable_limit(), 3);
        let admission = gate.pass().await;
        assert!(admission.admitted, "{}", admission.reason);
    }

    #[tokio::test]
    async fn test_pass_denied_above_limit() {
        let source = FakeStatusSource::with_nodes(10).cordoned(&["n0", "n1", "n2", "n3"]);
        let gate = GateKeeper::new(Arc::new(source)).await.unwrap();

        let admission = gate.pass().await;
        assert!(!admission.admitted);
        assert!(admission.reason.contains("exceeds limit 3"));
    }

    #[tokio::test]
    async fn test_duplicate_cordon_statuses_count_once() {
        let source = FakeStatusSource::with_nodes(10).cordoned(&["n0", "n0", "n1", "n1", "n2"]);
        let gate = GateKeeper::new(Arc::new(source)).await.unwrap();
        assert!(gate.pass().await.admitted);
    }

    #[tokio::test]
    async fn test_query_failure_denies() {
        let source = FakeStatusSource::with_nodes(10).failing_condition_queries();
        let gate = GateKeeper::new(Arc::new(source)).await.unwrap();

        let admission = gate.pass().await;
        assert!(!admission.admitted);
        assert!(admission.reason.contains("failed to query"));
    }

    #[tokio::test]
    async fn test_list_nodes_failure_fails_construction() {
        let source = FakeStatusSource::default().failing_node_list();
        assert!(GateKeeper::new(Arc::new(source)).await.is_err());
    }
}
