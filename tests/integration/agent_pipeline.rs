//! The agent actor end to end: pull, check, report, retry

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use pretty_assertions::assert_eq;
use serde_json::json;
use uplink::actors::{AgentHandle, Services};
use uplink::config::SchedulerConfig;
use uplink::transport::{HttpControlPlane, ReportBatch};
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::*;

fn quiet() -> SchedulerConfig {
    SchedulerConfig {
        tick_ms: 3_600_000,
        pull_interval_secs: 3600,
        device_step_interval_secs: 3600,
        ..Default::default()
    }
}

fn services(control_plane: Arc<dyn uplink::transport::ControlPlane>) -> Services {
    Services {
        prober: Arc::new(ScriptedProber::default()),
        collector: Arc::new(ScriptedCollector::default()),
        control_plane,
    }
}

#[tokio::test]
async fn test_cycle_against_http_control_plane() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/agent/tasks"))
        .and(query_param("agent_id", "agent-7"))
        .and(header("authorization", "Bearer agent-secret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "monitors": [{ "id": "m1", "target": "10.0.0.9", "protocol": "icmp" }],
            "devices": [{ "id": "d1", "management": "tcp_only", "host": "10.0.0.2" }],
            "manual_requests": [
                { "id": "r1", "device_id": "d1", "requested_at": "2026-01-01T00:00:00Z" }
            ]
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/agent/report"))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&server)
        .await;

    let plane = HttpControlPlane::new(
        &server.uri(),
        "agent-7",
        Some("agent-secret".to_string()),
        Duration::from_secs(5),
    )
    .unwrap();
    let (handle, task) = AgentHandle::spawn(quiet(), "agent-7", services(Arc::new(plane)));

    let summary = handle.run_cycle().await.unwrap();

    assert!(summary.pulled);
    assert_eq!(summary.monitors_checked, 1);
    assert_eq!(summary.device_checked.as_deref(), Some("d1"));
    assert_eq!(summary.acknowledged, vec!["r1".to_string()]);
    assert_eq!(summary.delivered, 1);
    assert_eq!(summary.queued, 0);

    let requests = server.received_requests().await.unwrap();
    let report = requests
        .iter()
        .find(|request| request.url.path() == "/api/agent/report")
        .unwrap();
    let batch: ReportBatch = serde_json::from_slice(&report.body).unwrap();
    assert_eq!(Some(batch.batch_id.clone()), summary.batch_id);
    assert_eq!(batch.agent_id, "agent-7");
    assert_eq!(batch.acknowledgements, vec!["r1".to_string()]);
    assert_eq!(batch.monitors[0].monitor_id, "m1");
    assert_eq!(batch.devices[0].manual_request_id.as_deref(), Some("r1"));

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn test_rejected_pull_keeps_agent_running() {
    let server = MockServer::start().await;
    Mock::given(path("/api/agent/tasks"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let plane = HttpControlPlane::new(&server.uri(), "agent-7", None, Duration::from_secs(5)).unwrap();
    let (handle, task) = AgentHandle::spawn(quiet(), "agent-7", services(Arc::new(plane)));

    assert!(handle.pull_now().await.is_err());
    let summary = handle.run_cycle().await.unwrap();
    assert!(!summary.pulled);
    assert_eq!(summary.batch_id, None);

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn test_undelivered_batch_is_retried_with_same_id() {
    let plane = Arc::new(MemoryControlPlane::default());
    plane.serve(bundle(
        vec![icmp_monitor("m1")],
        vec![tcp_device("d1", "s", "fw")],
    ));
    *plane.reject_pushes.lock().unwrap() = true;

    let (handle, task) = AgentHandle::spawn(quiet(), "agent-7", services(plane.clone()));

    let failed = handle.run_cycle().await.unwrap();
    assert_eq!(failed.delivered, 0);
    assert_eq!(failed.queued, 1);
    let batch_id = failed.batch_id.clone().unwrap();

    *plane.reject_pushes.lock().unwrap() = false;
    // nothing new is due, so this cycle only drains the outbox
    let retried = handle.run_cycle().await.unwrap();
    assert_eq!(retried.batch_id, None);
    assert_eq!(retried.delivered, 1);
    assert_eq!(retried.queued, 0);

    let pushed = plane.pushed.lock().unwrap().clone();
    assert_eq!(pushed.len(), 1);
    assert_eq!(pushed[0].batch_id, batch_id);
    assert_eq!(pushed[0].devices[0].device_id, "d1");

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn test_snapshot_reflects_cycle_state() {
    let plane = Arc::new(MemoryControlPlane::default());
    plane.serve(bundle(
        vec![icmp_monitor("m1")],
        vec![tcp_device("d1", "s", "fw")],
    ));
    let (handle, task) = AgentHandle::spawn(quiet(), "agent-7", services(plane.clone()));

    handle.run_cycle().await.unwrap();
    let snapshot = handle.snapshot().await.unwrap();

    assert_eq!(snapshot.monitors, 1);
    assert_eq!(snapshot.devices, 1);
    assert!(snapshot.pending_manual.is_empty());
    let (id, schedule) = &snapshot.schedules[0];
    assert_eq!(id, "d1");
    assert!(schedule.next_run_at.unwrap() > Utc::now());
    assert_eq!(snapshot.monitor_states[0].0, "m1");

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn test_ack_survives_outbox_overflow_during_push_outage() {
    let plane = Arc::new(MemoryControlPlane::default());
    let now = Utc::now();
    plane.serve(uplink::transport::TaskBundle {
        devices: vec![tcp_device("d1", "s", "fw-1"), tcp_device("d2", "s", "fw-2")],
        manual_requests: vec![manual_request("r1", "d1", now)],
        ..Default::default()
    });
    *plane.reject_pushes.lock().unwrap() = true;
    let config = SchedulerConfig {
        outbox_capacity: 1,
        ..quiet()
    };
    let (handle, task) = AgentHandle::spawn(config, "agent-7", services(plane.clone()));

    let first = handle.run_cycle().await.unwrap();
    assert_eq!(first.acknowledged, vec!["r1".to_string()]);
    assert_eq!(first.queued, 1);

    // the service never saw the ack, so it keeps offering r1
    plane.serve(uplink::transport::TaskBundle {
        devices: vec![tcp_device("d1", "s", "fw-1"), tcp_device("d2", "s", "fw-2")],
        manual_requests: vec![
            manual_request("r1", "d1", now),
            manual_request("r2", "d2", now),
        ],
        ..Default::default()
    });
    let second = handle.run_cycle().await.unwrap();
    assert_eq!(second.acknowledged, vec!["r2".to_string()]);
    assert_eq!(second.queued, 1);

    *plane.reject_pushes.lock().unwrap() = false;
    let drained = handle.run_cycle().await.unwrap();
    assert_eq!(drained.delivered, 1);

    let mut acknowledged = plane.acknowledged();
    acknowledged.sort();
    assert_eq!(acknowledged, vec!["r1".to_string(), "r2".to_string()]);

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}
