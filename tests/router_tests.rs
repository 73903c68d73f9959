use cansat_fsw::error::{RouteError, WorkerError};
use cansat_fsw::registry::{AgentEntry, Registry};
use cansat_fsw::worker::{Inbound, WorkerContext, WorkerFuture};
use cansat_fsw::{pack, AgentId, FswConfig, LaunchMode, Lifecycle, Message, MessageKind, RouteOutcome, Supervisor};
use std::sync::Mutex;
use std::time::Duration;

static COMM_INBOX: Mutex<Vec<Message>> = Mutex::new(Vec::new());

fn recording_comm(mut ctx: WorkerContext) -> WorkerFuture {
    Box::pin(async move {
        loop {
            match ctx.next_inbound().await {
                Inbound::Terminate => return Ok(()),
                Inbound::Idle => {}
                Inbound::Message(msg) => COMM_INBOX.lock().unwrap().push(msg),
            }
        }
    })
}

fn crashing(_ctx: WorkerContext) -> WorkerFuture {
    Box::pin(async { Err(WorkerError::Fatal("sensor bus gone".to_string())) })
}

fn test_config() -> FswConfig {
    FswConfig {
        launch_mode: LaunchMode::InProcess,
        agents: vec![AgentId::Comm, AgentId::Barometer],
        spawn_delay_ms: 5,
        queue_poll_ms: 10,
        worker_read_timeout_ms: 10,
        grace_period_ms: 500,
        escalation_ms: 200,
        ..FswConfig::default()
    }
}

fn test_registry() -> Registry {
    Registry::with_entries([
        AgentEntry {
            agent: AgentId::Comm,
            entry: recording_comm,
            accepts: &[MessageKind::BARO_DATA, MessageKind::VOLTAGE],
        },
        AgentEntry {
            agent: AgentId::Barometer,
            entry: crashing,
            accepts: &[MessageKind::CMD_CAL],
        },
    ])
}

fn line(sender: AgentId, receiver: AgentId, kind: MessageKind, payload: &str) -> String {
    pack(&Message::new(sender, receiver, kind, payload))
}

#[tokio::test]
async fn test_dead_worker_does_not_stop_routing() {
    let mut supervisor = Supervisor::with_registry(test_config(), Lifecycle::new(), test_registry());
    supervisor.start().await;
    tokio::time::sleep(Duration::from_millis(30)).await;

    let to_dead = line(AgentId::Comm, AgentId::Barometer, MessageKind::CMD_CAL, "");
    assert_eq!(
        supervisor.route(&to_dead),
        RouteOutcome::Dropped(RouteError::WorkerDead(AgentId::Barometer))
    );

    let to_comm = line(AgentId::Housekeeping, AgentId::Comm, MessageKind::VOLTAGE, "4.90");
    assert_eq!(supervisor.route(&to_comm), RouteOutcome::Delivered);
    assert_eq!(supervisor.route(&to_dead), RouteOutcome::Dropped(RouteError::WorkerDead(AgentId::Barometer)));
    assert_eq!(supervisor.route(&to_comm), RouteOutcome::Delivered);

    tokio::time::sleep(Duration::from_millis(30)).await;
    let received: Vec<_> = COMM_INBOX
        .lock()
        .unwrap()
        .iter()
        .filter(|m| m.kind == MessageKind::VOLTAGE)
        .map(|m| m.payload.clone())
        .collect();
    assert_eq!(received, vec!["4.90".to_string(), "4.90".to_string()]);

    assert_eq!(supervisor.stats().delivered, 2);
    assert_eq!(supervisor.stats().dropped, 2);

    let report = supervisor.shutdown().await;
    assert!(report.already_dead.contains(&AgentId::Barometer));
    assert!(report.graceful.contains(&AgentId::Comm));
}

#[tokio::test]
async fn test_route_outcomes() {
    let mut supervisor = Supervisor::with_registry(test_config(), Lifecycle::new(), test_registry());
    supervisor.start().await;

    assert_eq!(supervisor.route("not,a,message"), RouteOutcome::Invalid);
    assert_eq!(supervisor.route(""), RouteOutcome::Invalid);

    let unspawned = line(AgentId::Comm, AgentId::Gps, MessageKind::STATUS, "");
    assert_eq!(
        supervisor.route(&unspawned),
        RouteOutcome::Dropped(RouteError::UnknownReceiver(AgentId::Gps))
    );

    let wrong_kind = line(AgentId::Comm, AgentId::Comm, MessageKind::CMD_CAM, "ON");
    assert_eq!(
        supervisor.route(&wrong_kind),
        RouteOutcome::Dropped(RouteError::UnsupportedKind {
            agent: AgentId::Comm,
            kind: MessageKind::CMD_CAM
        })
    );

    assert!(supervisor.last_heartbeat(AgentId::Comm).is_none());
    let heartbeat = pack(&Message::heartbeat(AgentId::Comm, AgentId::Supervisor));
    assert_eq!(supervisor.route(&heartbeat), RouteOutcome::Local);
    assert!(supervisor.last_heartbeat(AgentId::Comm).is_some());
    assert!(supervisor.lifecycle().is_running());

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_inbound_queue_feeds_router() {
    let mut supervisor = Supervisor::with_registry(test_config(), Lifecycle::new(), test_registry());
    supervisor.start().await;

    let tx = supervisor.inbound_sender();
    tx.send(line(AgentId::Barometer, AgentId::Comm, MessageKind::BARO_DATA, "1013.25,20.00,0.00"))
        .await
        .unwrap();
    tx.send(pack(&Message::terminate(AgentId::Comm, AgentId::Supervisor)))
        .await
        .unwrap();

    let report = tokio::time::timeout(Duration::from_secs(5), supervisor.run())
        .await
        .unwrap();
    assert!(report.killed.is_empty());
    assert!(COMM_INBOX
        .lock()
        .unwrap()
        .iter()
        .any(|m| m.kind == MessageKind::BARO_DATA && m.sender == AgentId::Barometer));
}
