#![cfg(unix)]

use cansat_fsw::error::RouteError;
use cansat_fsw::{pack, AgentId, FswConfig, LaunchMode, Lifecycle, Message, MessageKind, RouteOutcome, Supervisor};
use std::path::PathBuf;
use std::time::{Duration, Instant};

fn process_config(agents: Vec<AgentId>) -> FswConfig {
    FswConfig {
        launch_mode: LaunchMode::Process,
        worker_program: Some(PathBuf::from(env!("CARGO_BIN_EXE_cansat-fsw"))),
        agents,
        spawn_delay_ms: 10,
        queue_poll_ms: 10,
        worker_read_timeout_ms: 20,
        heartbeat_period_ms: 50,
        grace_period_ms: 3000,
        escalation_ms: 2000,
        log_level: "warn".to_string(),
        ..FswConfig::default()
    }
}

async fn wait_until_dead(supervisor: &mut Supervisor, agent: AgentId) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while supervisor.worker_mut(agent).is_some_and(|w| w.is_alive()) {
        assert!(Instant::now() < deadline, "{agent} still alive");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_killed_child_is_skipped_and_the_rest_shut_down() {
    let lifecycle = Lifecycle::new();
    let mut supervisor = Supervisor::new(process_config(vec![AgentId::Camera, AgentId::Motor]), lifecycle.clone());
    supervisor.start().await;
    assert!(supervisor.spawn_failures().is_empty(), "{:?}", supervisor.spawn_failures());

    let camera_pid = supervisor.worker_mut(AgentId::Camera).unwrap().pid().unwrap();
    assert!(supervisor.worker_mut(AgentId::Motor).unwrap().pid().is_some());

    // let both children get through startup and emit heartbeats on stdout
    tokio::time::sleep(Duration::from_millis(300)).await;

    let rc = unsafe { libc::kill(camera_pid as libc::pid_t, libc::SIGKILL) };
    assert_eq!(rc, 0);
    wait_until_dead(&mut supervisor, AgentId::Camera).await;

    let to_camera = pack(&Message::new(AgentId::Comm, AgentId::Camera, MessageKind::CMD_CAM, "ON"));
    let to_motor = pack(&Message::new(AgentId::Comm, AgentId::Motor, MessageKind::CMD_MEC, "MOTOR,ON"));
    assert_eq!(
        supervisor.route(&to_camera),
        RouteOutcome::Dropped(RouteError::WorkerDead(AgentId::Camera))
    );
    assert_eq!(supervisor.route(&to_motor), RouteOutcome::Delivered);
    assert_eq!(
        supervisor.route(&to_camera),
        RouteOutcome::Dropped(RouteError::WorkerDead(AgentId::Camera))
    );

    // queued behind the children's heartbeats, so those are routed first
    supervisor
        .inbound_sender()
        .send(pack(&Message::terminate(AgentId::Motor, AgentId::Supervisor)))
        .await
        .unwrap();
    let report = tokio::time::timeout(Duration::from_secs(10), supervisor.run())
        .await
        .unwrap();

    assert_eq!(report.already_dead, vec![AgentId::Camera]);
    assert_eq!(report.graceful, vec![AgentId::Motor]);
    assert!(report.signalled.is_empty());
    assert!(report.killed.is_empty());
    assert!(supervisor.last_heartbeat(AgentId::Motor).is_some());
    // status reports addressed to the absent housekeeping agent are dropped too
    assert_eq!(supervisor.stats().delivered, 1);
    assert!(supervisor.stats().dropped >= 2);
}

#[tokio::test]
async fn test_sigterm_stops_child_once_grace_is_spent() {
    let mut config = process_config(vec![AgentId::Motor]);
    config.grace_period_ms = 0;
    let mut supervisor = Supervisor::new(config, Lifecycle::new());
    supervisor.start().await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let report = tokio::time::timeout(Duration::from_secs(10), supervisor.shutdown())
        .await
        .unwrap();
    assert!(report.graceful.is_empty());
    assert_eq!(report.signalled, vec![AgentId::Motor]);
    assert!(report.killed.is_empty());
}
