use cansat_fsw::{pack, AgentId, FswConfig, LaunchMode, Lifecycle, Message, Supervisor};
use std::time::Duration;

fn fast_config() -> FswConfig {
    FswConfig {
        launch_mode: LaunchMode::InProcess,
        link_bind: "127.0.0.1:0".to_string(),
        spawn_delay_ms: 2,
        queue_poll_ms: 10,
        worker_read_timeout_ms: 10,
        heartbeat_period_ms: 20,
        sensor_period_ms: 20,
        downlink_period_ms: 50,
        grace_period_ms: 2000,
        escalation_ms: 500,
        ..FswConfig::default()
    }
}

#[tokio::test]
async fn test_standard_agents_start_and_stop_cleanly() {
    let lifecycle = Lifecycle::new();
    let mut supervisor = Supervisor::new(fast_config(), lifecycle.clone());
    supervisor.start().await;
    assert!(supervisor.spawn_failures().is_empty());
    assert_eq!(supervisor.live_workers().len(), AgentId::workers().count());

    let tx = supervisor.inbound_sender();
    let run = tokio::spawn(async move {
        let report = supervisor.run().await;
        (report, supervisor)
    });

    tokio::time::sleep(Duration::from_millis(200)).await;
    tx.send(pack(&Message::terminate(AgentId::Housekeeping, AgentId::Supervisor)))
        .await
        .unwrap();

    let (report, supervisor) = tokio::time::timeout(Duration::from_secs(10), run)
        .await
        .unwrap()
        .unwrap();
    assert!(report.killed.is_empty(), "killed: {:?}", report.killed);
    assert_eq!(report.graceful.len(), AgentId::workers().count());
    assert!(supervisor.stats().delivered > 0);
    assert_eq!(supervisor.stats().invalid, 0);
    assert!(supervisor.last_heartbeat(AgentId::Comm).is_some());
    assert!(supervisor.last_heartbeat(AgentId::FlightLogic).is_some());
}
