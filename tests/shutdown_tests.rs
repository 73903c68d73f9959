use cansat_fsw::lifecycle::{spawn_watchdog, LifecycleState, TriggerOutcome};
use cansat_fsw::registry::{AgentEntry, Registry};
use cansat_fsw::worker::{Inbound, WorkerContext, WorkerFuture};
use cansat_fsw::{pack, AgentId, FswConfig, LaunchMode, Lifecycle, Message, Supervisor, TerminationCause};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

static TERMINATES_SEEN: AtomicUsize = AtomicUsize::new(0);

/// Leaves as soon as it reads `Terminate`.
fn obedient(mut ctx: WorkerContext) -> WorkerFuture {
    Box::pin(async move {
        loop {
            if let Inbound::Terminate = ctx.next_inbound().await {
                TERMINATES_SEEN.fetch_add(1, Ordering::SeqCst);
                return Ok(());
            }
        }
    })
}

/// Never reads its pipe; only the run-flag stops it.
fn deaf(ctx: WorkerContext) -> WorkerFuture {
    Box::pin(async move {
        ctx.cancel_token().cancelled().await;
        Ok(())
    })
}

/// Ignores every stop request.
fn stubborn(_ctx: WorkerContext) -> WorkerFuture {
    Box::pin(async move {
        loop {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
}

fn config(agents: Vec<AgentId>) -> FswConfig {
    FswConfig {
        launch_mode: LaunchMode::InProcess,
        agents,
        spawn_delay_ms: 1,
        queue_poll_ms: 10,
        worker_read_timeout_ms: 10,
        grace_period_ms: 150,
        escalation_ms: 150,
        ..FswConfig::default()
    }
}

fn entry(agent: AgentId, entry: fn(WorkerContext) -> WorkerFuture) -> AgentEntry {
    AgentEntry {
        agent,
        entry,
        accepts: &[],
    }
}

#[tokio::test]
async fn test_terminate_to_supervisor_reaches_every_worker() {
    let agents = vec![AgentId::Camera, AgentId::Motor, AgentId::Thermal];
    let registry = Registry::with_entries(agents.iter().map(|a| entry(*a, obedient)));
    let lifecycle = Lifecycle::new();
    let mut supervisor = Supervisor::with_registry(config(agents.clone()), lifecycle.clone(), registry);
    supervisor.start().await;

    let before = TERMINATES_SEEN.load(Ordering::SeqCst);
    supervisor
        .inbound_sender()
        .send(pack(&Message::terminate(AgentId::Camera, AgentId::Supervisor)))
        .await
        .unwrap();

    let report = tokio::time::timeout(Duration::from_secs(5), supervisor.run())
        .await
        .unwrap();

    assert_eq!(report.graceful.len(), agents.len());
    assert!(report.signalled.is_empty());
    assert!(report.killed.is_empty());
    assert!(TERMINATES_SEEN.load(Ordering::SeqCst) - before >= agents.len());
    assert_eq!(lifecycle.state(), LifecycleState::Stopped);
    assert_eq!(lifecycle.cause(), Some(TerminationCause::Requested(AgentId::Camera)));
}

#[tokio::test]
async fn test_escalation_ladder() {
    let registry = Registry::with_entries([
        entry(AgentId::Camera, obedient),
        entry(AgentId::Motor, deaf),
        entry(AgentId::Thermal, stubborn),
    ]);
    let lifecycle = Lifecycle::new();
    let cfg = config(vec![AgentId::Camera, AgentId::Motor, AgentId::Thermal]);
    let bound = cfg.grace_period() + cfg.escalation() + Duration::from_millis(500);
    let mut supervisor = Supervisor::with_registry(cfg, lifecycle.clone(), registry);
    supervisor.start().await;

    lifecycle.trigger(TerminationCause::Signal("SIGTERM"));
    let started = Instant::now();
    let report = supervisor.run().await;

    assert_eq!(report.graceful, vec![AgentId::Camera]);
    assert_eq!(report.signalled, vec![AgentId::Motor]);
    assert_eq!(report.killed, vec![AgentId::Thermal]);
    assert!(started.elapsed() < bound, "shutdown took {:?}", started.elapsed());
    assert_eq!(lifecycle.state(), LifecycleState::Stopped);
}

#[tokio::test]
async fn test_second_trigger_forces_immediate_kill() {
    let registry = Registry::with_entries([entry(AgentId::Thermal, stubborn)]);
    let lifecycle = Lifecycle::new();
    let mut cfg = config(vec![AgentId::Thermal]);
    cfg.grace_period_ms = 10_000;
    cfg.escalation_ms = 10_000;
    let mut supervisor = Supervisor::with_registry(cfg, lifecycle.clone(), registry);
    supervisor.start().await;

    assert_eq!(lifecycle.trigger(TerminationCause::Signal("SIGINT")), TriggerOutcome::BeginGraceful);
    let second = lifecycle.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        second.trigger(TerminationCause::Signal("SIGINT"));
    });

    let report = tokio::time::timeout(Duration::from_secs(3), supervisor.run())
        .await
        .unwrap();
    assert_eq!(report.killed, vec![AgentId::Thermal]);
    assert_eq!(lifecycle.cause(), Some(TerminationCause::Signal("SIGINT")));
}

#[tokio::test]
async fn test_watchdog_ends_the_run() {
    let registry = Registry::with_entries([entry(AgentId::Camera, obedient)]);
    let lifecycle = Lifecycle::new();
    let mut supervisor = Supervisor::with_registry(config(vec![AgentId::Camera]), lifecycle.clone(), registry);
    supervisor.start().await;

    spawn_watchdog(lifecycle.clone(), Duration::from_millis(50));
    let report = tokio::time::timeout(Duration::from_secs(3), supervisor.run())
        .await
        .unwrap();
    assert_eq!(report.graceful, vec![AgentId::Camera]);
    assert_eq!(lifecycle.cause(), Some(TerminationCause::Watchdog));
}

#[tokio::test]
async fn test_no_worker_started_is_fatal() {
    let lifecycle = Lifecycle::new();
    let cfg = FswConfig {
        launch_mode: LaunchMode::Process,
        worker_program: Some("/nonexistent/cansat-fsw".into()),
        ..config(vec![AgentId::Camera, AgentId::Motor])
    };
    let mut supervisor = Supervisor::new(cfg, lifecycle.clone());
    supervisor.start().await;

    assert_eq!(supervisor.spawn_failures().len(), 2);
    assert_eq!(lifecycle.cause(), Some(TerminationCause::Fatal));
    assert_eq!(lifecycle.state(), LifecycleState::Terminating);

    let report = tokio::time::timeout(Duration::from_secs(3), supervisor.run())
        .await
        .unwrap();
    assert!(report.graceful.is_empty());
    assert!(report.killed.is_empty());
    assert_eq!(lifecycle.state(), LifecycleState::Stopped);
}
