//! Monitor runs: worker pool width, circuit breaking and hysteresis

use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use pretty_assertions::assert_eq;
use uplink::circuit::CircuitKey;
use uplink::config::SchedulerConfig;
use uplink::scheduler::Scheduler;
use uplink::{EffectiveStatus, Status};

use crate::helpers::*;

fn scheduler_for(monitors: Vec<uplink::tasks::MonitorTask>, width: usize) -> Scheduler {
    let mut scheduler = Scheduler::new(SchedulerConfig {
        monitor_concurrency: width,
        ..Default::default()
    });
    scheduler.apply_bundle(bundle(monitors, vec![]), Utc::now());
    scheduler
}

#[tokio::test]
async fn test_monitor_checks_respect_pool_width() {
    let monitors = (0..6).map(|i| icmp_monitor(&format!("m{i}"))).collect();
    let mut scheduler = scheduler_for(monitors, 2);
    let prober = ScriptedProber::with_delay(StdDuration::from_millis(20));

    let reports = scheduler.run_monitors(&prober, Utc::now()).await;

    assert_eq!(reports.len(), 6);
    let peak = prober
        .max_in_flight
        .load(std::sync::atomic::Ordering::SeqCst);
    assert!(peak <= 2, "saw {peak} concurrent checks");
    assert!(peak >= 1);
}

#[tokio::test]
async fn test_monitor_runs_only_when_due() {
    let mut scheduler = scheduler_for(vec![icmp_monitor("m1")], 2);
    let prober = ScriptedProber::default();
    let t0 = Utc::now();

    assert_eq!(scheduler.run_monitors(&prober, t0).await.len(), 1);
    assert!(
        scheduler
            .run_monitors(&prober, t0 + Duration::seconds(30))
            .await
            .is_empty()
    );
    assert_eq!(
        scheduler
            .run_monitors(&prober, t0 + Duration::seconds(60))
            .await
            .len(),
        1
    );
    assert_eq!(prober.call_count("m1"), 2);
}

#[tokio::test]
async fn test_inactive_monitors_are_never_checked() {
    let mut paused = icmp_monitor("paused");
    paused.active = false;
    let mut scheduler = scheduler_for(vec![paused, icmp_monitor("live")], 2);
    let prober = ScriptedProber::default();

    let reports = scheduler.run_monitors(&prober, Utc::now()).await;

    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].monitor_id, "live");
    assert_eq!(prober.call_count("paused"), 0);
}

#[tokio::test]
async fn test_circuit_opens_after_three_failures_and_cools_down() {
    let mut scheduler = scheduler_for(vec![icmp_monitor("m1")], 2);
    let prober = ScriptedProber::default();
    prober.script("m1", &[Status::Down, Status::Down, Status::Down]);
    let t0 = Utc::now();
    let key = CircuitKey::monitor("m1");

    for i in 0..3 {
        scheduler
            .run_monitors(&prober, t0 + Duration::seconds(60 * i))
            .await;
    }
    let tripped_at = t0 + Duration::seconds(120);
    assert!(scheduler.circuits().is_open(&key, tripped_at));

    // due again, but the circuit is still cooling down
    let skipped = scheduler
        .run_monitors(&prober, tripped_at + Duration::seconds(60))
        .await;
    assert!(skipped.is_empty());
    assert_eq!(prober.call_count("m1"), 3);

    let resumed = scheduler
        .run_monitors(&prober, tripped_at + Duration::seconds(180))
        .await;
    assert_eq!(resumed.len(), 1);
    assert_eq!(resumed[0].result.status, Status::Up);
    assert!(!scheduler.circuits().is_open(&key, tripped_at + Duration::seconds(180)));
    assert_eq!(scheduler.circuits().state(&key).map(|s| s.streak), Some(0));
}

#[tokio::test]
async fn test_effective_status_follows_thresholds() {
    let mut monitor = icmp_monitor("m1");
    monitor.failure_threshold = 2;
    monitor.success_threshold = 2;
    let mut scheduler = scheduler_for(vec![monitor], 2);
    let prober = ScriptedProber::default();
    prober.script(
        "m1",
        &[
            Status::Down,
            Status::Down,
            Status::Up,
            Status::Degraded,
        ],
    );
    let t0 = Utc::now();
    let mut effective = Vec::new();

    for i in 0..4 {
        scheduler
            .run_monitors(&prober, t0 + Duration::seconds(60 * i))
            .await;
        effective.push(scheduler.monitor_state("m1").unwrap().effective_status);
    }

    assert_eq!(
        effective,
        vec![
            EffectiveStatus::Up,
            EffectiveStatus::Down,
            EffectiveStatus::Down,
            EffectiveStatus::Up,
        ]
    );
    assert_eq!(
        scheduler.monitor_state("m1").unwrap().surface_status,
        Some(Status::Degraded)
    );
}

#[tokio::test]
async fn test_removed_monitor_state_is_dropped_on_pull() {
    let mut scheduler = scheduler_for(vec![icmp_monitor("m1")], 2);
    let prober = ScriptedProber::default();
    let now = Utc::now();
    scheduler.run_monitors(&prober, now).await;
    assert!(scheduler.monitor_state("m1").is_some());

    scheduler.apply_bundle(bundle(vec![icmp_monitor("m2")], vec![]), now);

    assert!(scheduler.monitor_state("m1").is_none());
    assert!(
        scheduler
            .circuits()
            .state(&CircuitKey::monitor("m1"))
            .is_none()
    );
}
