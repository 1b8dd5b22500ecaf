//! Scenario builder for healer tests.

use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tokio::sync::Mutex;

use crate::cluster::NodeOps;
use crate::config::{HealerConfig, RegistrySettings};
use crate::healer::NodeHealer;
use crate::sop::{ApiBridge, Sop, SopError, SopRegistry};
use crate::status::{NodeStatus, StatusType};
use crate::test_utils::{FakeNodeOps, FakeStatusSource, RecordingEventSink};
use crate::ticket::{NodeTicketStore, SreRouting, TicketBackend, TicketManager};

pub const NODE: &str = "gpu-017";

pub const PRIORITIES: &str = "\
# anchors
NodeNotReady:0
NodeCordon:1
GpuDown:10
MemoryUnhealthy:10
IBDown:20
XIDApplicationErr:999
";

pub fn status(condition: &str) -> NodeStatus {
    NodeStatus::new(NODE, condition)
}

pub fn gpu_down() -> NodeStatus {
    NodeStatus {
        status_type: StatusType::Gpu,
        id: "3".to_string(),
        value: 7.0,
        ..status("GpuDown")
    }
}

pub fn routing() -> SreRouting {
    SreRouting {
        default: Some("sre".to_string()),
        hardware: Some("hw-sre".to_string()),
        non_hardware: None,
    }
}

/// What the recording SOP observed.
#[derive(Default)]
pub struct SopCalls {
    pub created: AtomicUsize,
    pub evaluated: AtomicUsize,
    executed: StdMutex<Vec<NodeStatus>>,
}

impl SopCalls {
    pub fn executed(&self) -> Vec<NodeStatus> {
        self.executed.lock().unwrap().clone()
    }

    pub fn evaluated(&self) -> usize {
        self.evaluated.load(Ordering::SeqCst)
    }
}

pub struct RecordingSop {
    calls: Arc<SopCalls>,
    accept: bool,
}

#[async_trait]
impl Sop for RecordingSop {
    fn name(&self) -> &'static str {
        "Recording"
    }

    async fn create_instance(&mut self, _bridge: Arc<ApiBridge>) -> Result<(), SopError> {
        self.calls.created.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn evaluate(&self, _node: &str, _status: &NodeStatus) -> bool {
        self.calls.evaluated.fetch_add(1, Ordering::SeqCst);
        self.accept
    }

    async fn execute(&self, _node: &str, status: &NodeStatus) -> Result<(), SopError> {
        self.calls.executed.lock().unwrap().push(status.clone());
        Ok(())
    }
}

pub struct Harness {
    pub healer: NodeHealer,
    pub nodes: Arc<FakeNodeOps>,
    pub source: Arc<FakeStatusSource>,
    pub events: Arc<RecordingEventSink>,
    pub tickets: Arc<Mutex<TicketManager>>,
    pub calls: Arc<SopCalls>,
    _priorities: NamedTempFile,
}

pub struct Scenario {
    priorities: String,
    source: FakeStatusSource,
    nodes: Arc<FakeNodeOps>,
    tickets: Option<TicketManager>,
    annotation_backend: bool,
    registry: SopRegistry,
    recorded: Vec<String>,
    accept: bool,
    ticket_only: bool,
}

impl Scenario {
    /// Ten-node cluster including the target, no statuses, no SOPs.
    pub fn new() -> Self {
        Self {
            priorities: PRIORITIES.to_string(),
            source: FakeStatusSource::with_nodes(9).node(NODE),
            nodes: Arc::new(FakeNodeOps::with_node(NODE)),
            tickets: None,
            annotation_backend: false,
            registry: SopRegistry::new(),
            recorded: Vec::new(),
            accept: true,
            ticket_only: false,
        }
    }

    pub fn priorities(mut self, table: &str) -> Self {
        self.priorities = table.to_string();
        self
    }

    pub fn statuses(mut self, statuses: Vec<NodeStatus>) -> Self {
        self.source = self.source.statuses(NODE, statuses);
        self
    }

    pub fn source(mut self, adjust: impl FnOnce(FakeStatusSource) -> FakeStatusSource) -> Self {
        self.source = adjust(self.source);
        self
    }

    pub fn label(self, key: &str, value: &str) -> Self {
        self.nodes.set_label(NODE, key, value);
        self
    }

    pub fn tickets(mut self, tickets: TicketManager) -> Self {
        self.tickets = Some(tickets);
        self
    }

    pub fn annotation_backend(mut self) -> Self {
        self.annotation_backend = true;
        self
    }

    pub fn registry(mut self, registry: SopRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Register the recording SOP for `condition`.
    pub fn sop(mut self, condition: &str) -> Self {
        self.recorded.push(condition.to_string());
        self
    }

    /// The recording SOP declines in `evaluate`.
    pub fn declining(mut self) -> Self {
        self.accept = false;
        self
    }

    pub fn ticket_only(mut self) -> Self {
        self.ticket_only = true;
        self
    }

    pub fn build(self) -> Harness {
        let mut priorities = NamedTempFile::new().unwrap();
        priorities.write_all(self.priorities.as_bytes()).unwrap();

        let tickets = self.tickets.unwrap_or_else(|| {
            if self.annotation_backend {
                let ops: Arc<dyn NodeOps> = self.nodes.clone();
                TicketManager::new(NODE, TicketBackend::Node(NodeTicketStore::new(NODE, ops)))
                    .with_sre_routing(routing())
            } else {
                TicketManager::disabled(NODE).with_sre_routing(routing())
            }
        });
        let tickets = Arc::new(Mutex::new(tickets));

        let source = Arc::new(self.source);
        let events = Arc::new(RecordingEventSink::default());
        let bridge = Arc::new(ApiBridge {
            cluster_name: "hpc-a".to_string(),
            region: "cn-sh-01".to_string(),
            org_name: "ml".to_string(),
            nodes: self.nodes.clone(),
            statuses: source.clone(),
            tickets: tickets.clone(),
            events: events.clone(),
            level: 1,
            registry: RegistrySettings::default(),
        });

        let calls = Arc::new(SopCalls::default());
        let mut registry = self.registry;
        for condition in &self.recorded {
            let calls = calls.clone();
            let accept = self.accept;
            registry.register(
                condition,
                Arc::new(move || {
                    Box::new(RecordingSop {
                        calls: calls.clone(),
                        accept,
                    }) as Box<dyn Sop>
                }),
            );
        }

        let mut config = HealerConfig::new(NODE, priorities.path());
        config.ticket_only = self.ticket_only;

        Harness {
            healer: NodeHealer::new(&config, bridge, registry),
            nodes: self.nodes,
            source,
            events,
            tickets,
            calls,
            _priorities: priorities,
        }
    }
}
