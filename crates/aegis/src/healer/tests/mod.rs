//! End-to-end scenarios for the healing body.

mod fixtures;

use fixtures::*;

use crate::cluster::DISABLE_SELFHEALING_LABEL;
use crate::error::Error;
use crate::events::EventKind;
use crate::healer::HealOutcome;
use crate::sop::SopRegistry;
use crate::status::StatusType;
use crate::ticket::{
    NodeTicket, TicketManager, TicketStatus, TicketWorkflowAction, TICKET_ANNOTATION,
};

#[tokio::test]
async fn test_emergency_preempts_cordon() {
    let h = Scenario::new()
        .priorities("NodeCordon:1\nGpuDown:10\n")
        .statuses(vec![status("NodeCordon"), gpu_down()])
        .sop("GpuDown")
        .sop("NodeCordon")
        .build();

    let outcome = h.healer.heal().await.unwrap();

    assert_eq!(outcome, HealOutcome::Executed { condition: "GpuDown".to_string() });
    assert_eq!(h.source.condition_queries(), 1);
    let executed = h.calls.executed();
    assert_eq!(executed.len(), 1);
    assert_eq!(executed[0].id, "3");
    assert_eq!(executed[0].status_type, StatusType::Gpu);
}

#[tokio::test]
async fn test_not_ready_preempts_everything() {
    let h = Scenario::new()
        .statuses(vec![status("GpuDown"), status("XIDApplicationErr"), status("NodeNotReady")])
        .sop("NodeNotReady")
        .sop("GpuDown")
        .build();

    let outcome = h.healer.heal().await.unwrap();

    assert_eq!(outcome, HealOutcome::Executed { condition: "NodeNotReady".to_string() });
    assert_eq!(h.source.condition_queries(), 1);
    assert_eq!(h.calls.executed().len(), 1);
}

#[tokio::test]
async fn test_cordon_alone_bypasses_gatekeeper() {
    let h = Scenario::new()
        .statuses(vec![status("NodeCordon")])
        .source(|s| s.cordoned(&["n0", "n1", "n2", "n3", "n4"]))
        .sop("NodeCordon")
        .build();

    let outcome = h.healer.heal().await.unwrap();

    assert_eq!(outcome, HealOutcome::Executed { condition: "NodeCordon".to_string() });
    assert_eq!(h.source.condition_queries(), 0);
    assert_eq!(h.calls.executed().len(), 1);
}

#[tokio::test]
async fn test_gatekeeper_denial_stops_before_sop() {
    let h = Scenario::new()
        .statuses(vec![status("MemoryUnhealthy")])
        .source(|s| s.cordoned(&["n0", "n1", "n2", "n3"]))
        .sop("MemoryUnhealthy")
        .build();

    let outcome = h.healer.heal().await.unwrap();

    assert!(matches!(
        outcome,
        HealOutcome::GateDenied { ref condition, ref reason }
            if condition == "MemoryUnhealthy" && reason.contains("exceeds limit 3")
    ));
    assert_eq!(h.calls.created.load(std::sync::atomic::Ordering::SeqCst), 0);
    assert!(h.calls.executed().is_empty());
    assert!(!h.tickets.lock().await.check_exists());
}

#[tokio::test]
async fn test_disable_label_hands_ticket_to_sre() {
    let mut tickets = TicketManager::disabled(NODE).with_sre_routing(routing());
    tickets.create_ticket(&gpu_down(), "gpu", None).await.unwrap();

    let h = Scenario::new()
        .label(DISABLE_SELFHEALING_LABEL, "true")
        .statuses(vec![gpu_down()])
        .tickets(tickets)
        .sop("GpuDown")
        .build();

    let outcome = h.healer.heal().await.unwrap();

    assert_eq!(outcome, HealOutcome::Disabled);
    assert!(h.calls.executed().is_empty());
    assert_eq!(h.source.status_queries(), 0);

    let tickets = h.tickets.lock().await;
    let ticket = tickets.ticket().unwrap();
    assert_eq!(ticket.supervisor, "hw-sre");
    assert_eq!(ticket.status, TicketStatus::Assigned);
    assert!(ticket
        .description
        .conclusion
        .as_deref()
        .unwrap()
        .contains("self-healing disabled"));
}

#[tokio::test]
async fn test_disable_label_without_ticket() {
    let h = Scenario::new()
        .label(DISABLE_SELFHEALING_LABEL, "true")
        .statuses(vec![gpu_down()])
        .sop("GpuDown")
        .build();

    assert_eq!(h.healer.heal().await.unwrap(), HealOutcome::Disabled);
    assert!(!h.tickets.lock().await.check_exists());
}

#[tokio::test]
async fn test_disable_label_requires_exact_value() {
    let h = Scenario::new()
        .label(DISABLE_SELFHEALING_LABEL, "false")
        .statuses(vec![gpu_down()])
        .sop("GpuDown")
        .build();

    assert!(matches!(h.healer.heal().await.unwrap(), HealOutcome::Executed { .. }));
}

#[tokio::test]
async fn test_foreign_supervisor_is_left_alone() {
    let mut tickets = TicketManager::disabled(NODE);
    tickets.create_ticket(&gpu_down(), "gpu", None).await.unwrap();
    tickets.dispatch_ticket("sre-team-x").await.unwrap();
    let before = tickets.ticket().cloned();

    let h = Scenario::new()
        .statuses(vec![gpu_down()])
        .tickets(tickets)
        .sop("GpuDown")
        .build();

    let outcome = h.healer.heal().await.unwrap();

    assert_eq!(outcome, HealOutcome::NotOwner);
    assert_eq!(h.source.status_queries(), 0);
    assert!(h.calls.executed().is_empty());
    assert_eq!(h.tickets.lock().await.ticket().cloned(), before);
}

#[tokio::test]
async fn test_nothing_selected() {
    let h = Scenario::new()
        .statuses(vec![status("XIDApplicationErr"), status("SomethingUnknown")])
        .sop("XIDApplicationErr")
        .build();

    assert_eq!(h.healer.heal().await.unwrap(), HealOutcome::NothingSelected);
    assert!(h.calls.executed().is_empty());
}

#[tokio::test]
async fn test_missing_sop_is_not_an_error() {
    let h = Scenario::new().statuses(vec![gpu_down()]).build();

    assert_eq!(
        h.healer.heal().await.unwrap(),
        HealOutcome::NoSop { condition: "GpuDown".to_string() }
    );
}

#[tokio::test]
async fn test_sop_may_decline() {
    let h = Scenario::new()
        .statuses(vec![gpu_down()])
        .sop("GpuDown")
        .declining()
        .build();

    assert_eq!(
        h.healer.heal().await.unwrap(),
        HealOutcome::NotEvaluated { condition: "GpuDown".to_string() }
    );
    assert_eq!(h.calls.evaluated(), 1);
    assert!(h.calls.executed().is_empty());
}

#[tokio::test]
async fn test_control_plane_node_is_never_executed() {
    let h = Scenario::new()
        .label("node-role.kubernetes.io/control-plane", "")
        .statuses(vec![gpu_down()])
        .sop("GpuDown")
        .build();

    assert_eq!(
        h.healer.heal().await.unwrap(),
        HealOutcome::MasterNode { condition: "GpuDown".to_string() }
    );
    assert_eq!(h.calls.evaluated(), 1);
    assert!(h.calls.executed().is_empty());
}

#[tokio::test]
async fn test_ticket_only_records_cause() {
    let h = Scenario::new()
        .statuses(vec![gpu_down()])
        .sop("GpuDown")
        .ticket_only()
        .build();

    assert_eq!(
        h.healer.heal().await.unwrap(),
        HealOutcome::TicketOnly { condition: "GpuDown".to_string() }
    );
    assert!(h.calls.executed().is_empty());

    let tickets = h.tickets.lock().await;
    let root = tickets.get_root_cause_description().unwrap();
    assert_eq!(root.condition, "GpuDown");
    assert_eq!(root.cause.unwrap().count, 1);
    drop(tickets);

    h.healer.heal().await.unwrap();
    let tickets = h.tickets.lock().await;
    assert_eq!(tickets.get_root_cause_description().unwrap().cause.unwrap().count, 2);
}

#[tokio::test]
async fn test_events_on_start_and_finish() {
    let h = Scenario::new().statuses(vec![gpu_down()]).sop("GpuDown").build();
    h.healer.heal().await.unwrap();

    assert_eq!(h.events.reasons(), ["SelfHealingStarted", "SelfHealingFinished"]);
    let events = h.events.events();
    assert_eq!(events[1].kind, EventKind::Normal);
    assert!(events[1].note.contains("GpuDown"));
}

#[tokio::test]
async fn test_invalid_priority_config_aborts() {
    let h = Scenario::new()
        .priorities("GpuDown:ten\n")
        .statuses(vec![gpu_down()])
        .sop("GpuDown")
        .build();

    let err = h.healer.heal().await.unwrap_err();
    assert!(matches!(err, Error::Priority(_)));
    assert!(h.calls.executed().is_empty());

    let events = h.events.events();
    assert_eq!(events.last().unwrap().kind, EventKind::Warning);
}

#[tokio::test]
async fn test_status_query_failure_aborts() {
    let h = Scenario::new()
        .source(|s| s.failing_status_queries())
        .sop("GpuDown")
        .build();

    assert!(matches!(h.healer.heal().await, Err(Error::Status(_))));
}

#[tokio::test]
async fn test_missing_node() {
    let h = Scenario::new().build();
    let healer = crate::healer::NodeHealer::new(
        &crate::config::HealerConfig::new("gpu-999", "/nonexistent"),
        h.healer.bridge.clone(),
        SopRegistry::new(),
    );

    assert!(matches!(healer.heal().await, Err(Error::NodeNotFound(name)) if name == "gpu-999"));
    assert!(h.events.events().is_empty());
}

#[tokio::test]
async fn test_builtin_escalation_on_annotation_backend() {
    let h = Scenario::new()
        .statuses(vec![status("NodeNotReady")])
        .annotation_backend()
        .registry(SopRegistry::builtin(&[]))
        .build();

    let outcome = h.healer.heal().await.unwrap();
    assert_eq!(outcome, HealOutcome::Executed { condition: "NodeNotReady".to_string() });
    assert!(h.nodes.unschedulable(NODE));

    let stored = NodeTicket::unmarshal(&h.nodes.annotation(NODE, TICKET_ANNOTATION).unwrap()).unwrap();
    assert_eq!(stored.condition, "NodeNotReady");
    assert_eq!(stored.workflows.len(), 1);
    assert_eq!(stored.workflows[0].action, TicketWorkflowAction::Cordon);

    // The annotation survives, so the next pass sees the cordon and stands down.
    let outcome = h.healer.heal().await.unwrap();
    assert_eq!(outcome, HealOutcome::NotEvaluated { condition: "NodeNotReady".to_string() });
}
