//! Real collectors against a mock vendor API and a local TCP listener

use chrono::{Duration, Utc};
use pretty_assertions::assert_eq;
use serde_json::json;
use uplink::collectors::{CollectionMode, Collectors, DeviceCollector};
use uplink::config::{Config, SchedulerConfig};
use uplink::scheduler::Scheduler;
use uplink::tasks::{Management, TokenMode};
use uplink::{LinkStatus, Status};
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::*;

const STATUS_PATH: &str = "/api/v2/monitor/system/status";
const PERF_PATH: &str = "/api/v2/monitor/system/performance/status";
const IFACE_PATH: &str = "/api/v2/monitor/system/interface";

async fn mount_json(server: &MockServer, at: &str, body: serde_json::Value) {
    Mock::given(method("GET"))
        .and(path(at))
        .and(query_param("access_token", "device-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
}

async fn mount_status(server: &MockServer) {
    mount_json(
        server,
        STATUS_PATH,
        json!({ "results": { "hostname": "fw-branch-a", "uptime": 86400 } }),
    )
    .await;
}

async fn mount_perf(server: &MockServer) {
    mount_json(
        server,
        PERF_PATH,
        json!({ "results": {
            "cpu": [{ "current": 12 }],
            "mem": [{ "current": "48%" }],
            "session": [{ "current": 3100 }]
        }}),
    )
    .await;
}

fn collectors() -> Collectors {
    Collectors::new(&Config::default()).unwrap()
}

#[tokio::test]
async fn test_interface_run_parses_all_endpoints() {
    let server = MockServer::start().await;
    mount_status(&server).await;
    mount_perf(&server).await;
    mount_json(
        &server,
        IFACE_PATH,
        json!({ "results": [
            { "name": "pppoe0", "ip": "203.0.113.5", "link": "up" },
            { "name": "internal", "ip": "192.168.1.1/24", "link": true },
            { "name": "port9", "ip": "0.0.0.0", "link": "down" }
        ]}),
    )
    .await;

    let device = api_device("d1", &server.uri());
    let collection = collectors()
        .collect(&device, CollectionMode::Interface)
        .await
        .unwrap();

    let sample = collection.sample;
    assert_eq!(sample.status, Status::Up);
    assert!(sample.reachable);
    assert_eq!(sample.error, None);
    assert_eq!(sample.fields.hostname.as_deref(), Some("fw-branch-a"));
    assert_eq!(sample.fields.uptime_secs, Some(86400));
    assert_eq!(sample.fields.cpu_percent, Some(12.0));
    assert_eq!(sample.fields.mem_percent, Some(48.0));
    assert_eq!(sample.fields.sessions, Some(3100));
    assert_eq!(sample.fields.wan1.ip.as_deref(), Some("203.0.113.5"));
    assert_eq!(sample.fields.wan1.status, Some(LinkStatus::Up));
    assert!(sample.fields.wan2.is_empty());
    assert_eq!(sample.fields.lan.ip.as_deref(), Some("192.168.1.1"));
    assert_eq!(collection.invoked.len(), 3);
    assert!(collection.failures.is_empty());
}

#[tokio::test]
async fn test_status_mode_skips_optional_endpoints() {
    let server = MockServer::start().await;
    mount_status(&server).await;
    Mock::given(path(PERF_PATH))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;

    let device = api_device("d1", &server.uri());
    let collection = collectors()
        .collect(&device, CollectionMode::Status)
        .await
        .unwrap();

    assert_eq!(collection.sample.status, Status::Up);
    assert_eq!(collection.sample.fields.cpu_percent, None);
}

#[tokio::test]
async fn test_failed_perf_call_degrades_run() {
    let server = MockServer::start().await;
    mount_status(&server).await;
    Mock::given(path(PERF_PATH))
        .respond_with(ResponseTemplate::new(502))
        .mount(&server)
        .await;

    let device = api_device("d1", &server.uri());
    let collection = collectors()
        .collect(&device, CollectionMode::Performance)
        .await
        .unwrap();

    let sample = collection.sample;
    assert_eq!(sample.status, Status::Degraded);
    assert!(sample.reachable);
    assert_eq!(sample.fields.hostname.as_deref(), Some("fw-branch-a"));
    let error = sample.error.unwrap();
    assert!(error.starts_with("perf failed ("), "{error}");
    assert!(error.ends_with("iface skipped"), "{error}");
}

#[tokio::test]
async fn test_header_token_mode_uses_bearer_auth() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(STATUS_PATH))
        .and(header("authorization", "Bearer device-token"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "results": { "hostname": "fw" } })),
        )
        .mount(&server)
        .await;

    let mut device = api_device("d1", &server.uri());
    if let Management::Api { token_mode, .. } = &mut device.management {
        *token_mode = Some(TokenMode::Header);
    }
    let collection = collectors()
        .collect(&device, CollectionMode::Status)
        .await
        .unwrap();

    assert_eq!(collection.sample.status, Status::Up);
}

#[tokio::test]
async fn test_missing_token_is_a_configuration_problem() {
    let server = MockServer::start().await;
    let mut device = api_device("d1", &server.uri());
    if let Management::Api { token, .. } = &mut device.management {
        *token = None;
    }

    let collection = collectors()
        .collect(&device, CollectionMode::Status)
        .await
        .unwrap();

    assert_eq!(collection.sample.status, Status::Degraded);
    assert!(!collection.sample.reachable);
    assert_eq!(collection.sample.error.as_deref(), Some("missing API token"));
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_status_429_backs_off_device() {
    let server = MockServer::start().await;
    Mock::given(path(STATUS_PATH))
        .respond_with(ResponseTemplate::new(429))
        .mount(&server)
        .await;

    let collectors = collectors();
    let mut scheduler = Scheduler::new(SchedulerConfig::default());
    let now = Utc::now();
    scheduler.apply_bundle(bundle(vec![], vec![api_device("d1", &server.uri())]), now);

    let step = scheduler.run_device_step(&collectors, now).await;

    let report = step.report.unwrap();
    assert_eq!(report.sample.status, Status::Degraded);
    assert!(report.sample.reachable);
    let state = scheduler.backoff().state("d1").unwrap();
    assert_eq!(state.rate_limit_count, 1);
    assert_eq!(state.next_allowed_at, Some(now + Duration::seconds(600)));
    assert!(scheduler.backoff().is_backed_off("d1", now + Duration::seconds(300)));
}

#[tokio::test]
async fn test_iface_429_cools_down_interface_calls_only() {
    let server = MockServer::start().await;
    mount_status(&server).await;
    mount_perf(&server).await;
    Mock::given(path(IFACE_PATH))
        .respond_with(ResponseTemplate::new(429))
        .expect(1)
        .mount(&server)
        .await;

    let collectors = collectors();
    let mut scheduler = Scheduler::new(SchedulerConfig::default());
    let t0 = Utc::now();
    scheduler.apply_bundle(bundle(vec![], vec![api_device("d1", &server.uri())]), t0);

    let first = scheduler.run_device_step(&collectors, t0).await;
    assert_eq!(first.report.unwrap().sample.status, Status::Degraded);
    assert!(!scheduler.backoff().is_backed_off("d1", t0));
    assert!(scheduler.backoff().iface_cooling("d1", t0 + Duration::seconds(300)));

    let second = scheduler
        .run_device_step(&collectors, t0 + Duration::seconds(300))
        .await
        .report
        .unwrap();
    assert_eq!(second.mode, CollectionMode::Performance);
    assert_eq!(second.sample.status, Status::Up);
    assert_eq!(second.sample.fields.cpu_percent, Some(12.0));
}

#[tokio::test]
async fn test_tcp_only_device_against_local_listener() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            drop(socket);
        }
    });

    let mut device = tcp_device("d1", "s", "edge");
    device.management = Management::TcpOnly {
        host: "127.0.0.1".to_string(),
        ports: vec![port],
    };
    let collection = collectors()
        .collect(&device, CollectionMode::Status)
        .await
        .unwrap();

    assert_eq!(collection.sample.status, Status::Up);
    assert!(collection.sample.reachable);
}
