//! Kubernetes events posted against the node being healed.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource};
use tracing::{debug, warn};

const REPORTER: &str = "aegis-selfhealing";

/// Severity of a healer event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Normal,
    Warning,
}

/// One event about a healing invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealerEvent {
    pub kind: EventKind,
    pub reason: String,
    pub action: String,
    pub note: String,
}

impl HealerEvent {
    pub fn normal(reason: &str, action: &str, note: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Normal,
            reason: reason.to_string(),
            action: action.to_string(),
            note: note.into(),
        }
    }

    pub fn warning(reason: &str, action: &str, note: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Warning,
            reason: reason.to_string(),
            action: action.to_string(),
            note: note.into(),
        }
    }
}

/// Alert that triggered this invocation, taken from `AlertType`, `Alert` and `Object`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AlertCorrelation {
    pub alert_type: Option<String>,
    pub alert: Option<String>,
    pub object: Option<String>,
}

impl AlertCorrelation {
    pub fn from_env() -> Self {
        let read = |key: &str| std::env::var(key).ok().filter(|v| !v.is_empty());
        Self {
            alert_type: read("AlertType"),
            alert: read("Alert"),
            object: read("Object"),
        }
    }

    /// `note` followed by the non-empty correlation fields.
    pub fn decorate(&self, note: &str) -> String {
        let fields: Vec<String> = [
            ("alertType", &self.alert_type),
            ("alert", &self.alert),
            ("object", &self.object),
        ]
        .into_iter()
        .filter_map(|(key, value)| value.as_ref().map(|v| format!("{key}={v}")))
        .collect();

        if fields.is_empty() {
            note.to_string()
        } else {
            format!("{note} ({})", fields.join(", "))
        }
    }
}

/// Destination for healer events. Publishing is best effort.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, node: &Node, event: HealerEvent);
}

/// Posts events through the kube-runtime recorder.
#[derive(Clone)]
pub struct KubeEventSink {
    recorder: Recorder,
    correlation: AlertCorrelation,
}

impl KubeEventSink {
    pub fn new(client: Client, instance: Option<String>, correlation: AlertCorrelation) -> Self {
        let reporter = Reporter {
            controller: REPORTER.to_string(),
            instance,
        };
        Self {
            recorder: Recorder::new(client, reporter),
            correlation,
        }
    }
}

#[async_trait]
impl EventSink for KubeEventSink {
    async fn publish(&self, node: &Node, event: HealerEvent) {
        let reference = node.object_ref(&());
        let note = self.correlation.decorate(&event.note);
        debug!(reason = %event.reason, note = %note, "Publishing node event");

        let result = self
            .recorder
            .publish(
                &Event {
                    type_: match event.kind {
                        EventKind::Normal => EventType::Normal,
                        EventKind::Warning => EventType::Warning,
                    },
                    reason: event.reason.clone(),
                    note: Some(note),
                    action: event.action,
                    secondary: None,
                },
                &reference,
            )
            .await;

        if let Err(e) = result {
            warn!(reason = %event.reason, error = %e, "Failed to publish node event");
        }
    }
}
