//! Comm agent.
//!
//! Four activities share one [`TelemetryState`] behind a mutex:
//! - heartbeat emitter (liveness to Housekeeping and the supervisor)
//! - downlink emitter (one telemetry line per downlink period)
//! - command reader (uplink lines through the [`CommandEngine`])
//! - message handler (sensor messages into the aggregate)

use crate::agents::{AgentId, MessageKind};
use crate::error::{ProtocolError, WorkerError};
use crate::link::{bind_ground_link, link_pair, serve_ground_link, Downlink, LinkPort, LinkRead, Uplink};
use crate::protocol::CommandEngine;
use crate::telemetry::{time_of_day_now, TelemetryState};
use crate::worker::{Inbound, Outbox, WorkerContext, WorkerFuture};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

pub type SharedTelemetry = Arc<Mutex<TelemetryState>>;

pub fn entry(ctx: WorkerContext) -> WorkerFuture {
    Box::pin(run(ctx))
}

async fn run(ctx: WorkerContext) -> Result<(), WorkerError> {
    let (port, ground) = link_pair();
    match bind_ground_link(&ctx.config.link_bind).await {
        Ok(listener) => {
            tokio::spawn(serve_ground_link(listener, ground, ctx.cancel_token()));
        }
        Err(e) => {
            // Telemetry keeps flowing internally; no ground station can attach
            error!(addr = %ctx.config.link_bind, error = %e, "ground link unavailable");
        }
    }
    run_with_link(ctx, port).await
}

/// Run the Comm agent against an already-connected link.
pub async fn run_with_link(ctx: WorkerContext, port: LinkPort) -> Result<(), WorkerError> {
    let mut initial = TelemetryState::new(ctx.config.team_id);
    initial.set_telemetry_enabled(ctx.config.telemetry_on_start);
    let shared: SharedTelemetry = Arc::new(Mutex::new(initial));
    run_shared(ctx, port, shared).await
}

/// As [`run_with_link`], with the telemetry aggregate supplied by the caller.
pub async fn run_shared(
    mut ctx: WorkerContext,
    port: LinkPort,
    shared: SharedTelemetry,
) -> Result<(), WorkerError> {
    let cancel = ctx.cancel_token();
    let LinkPort { uplink, downlink } = port;
    info!(team = ctx.config.team_id, "comm started");

    let tasks = [
        tokio::spawn(heartbeat_loop(
            ctx.outbox().clone(),
            ctx.config.heartbeat_period(),
            cancel.clone(),
        )),
        tokio::spawn(downlink_loop(
            Arc::clone(&shared),
            downlink,
            ctx.config.downlink_period(),
            cancel.clone(),
        )),
        tokio::spawn(command_loop(
            Arc::clone(&shared),
            uplink,
            CommandEngine::new(ctx.config.team_id),
            ctx.outbox().clone(),
            ctx.config.worker_read_timeout(),
            cancel.clone(),
        )),
    ];

    loop {
        match ctx.next_inbound().await {
            Inbound::Terminate => break,
            Inbound::Idle => {}
            Inbound::Message(msg) => {
                let mut state = shared.lock().await;
                match state.apply(&msg) {
                    Ok(applied) => trace!(?applied, from = %msg.sender, "telemetry updated"),
                    Err(e) => warn!(from = %msg.sender, error = %e, "sensor message discarded"),
                }
            }
        }
    }

    cancel.cancel();
    for task in tasks {
        if let Err(e) = task.await {
            error!(error = %e, "comm activity panicked");
        }
    }
    info!("comm stopped");
    Ok(())
}

async fn heartbeat_loop(outbox: Outbox, period: Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                outbox.send(AgentId::Housekeeping, MessageKind::HEARTBEAT, "");
                outbox.send(AgentId::Supervisor, MessageKind::HEARTBEAT, "");
            }
        }
    }
}

async fn downlink_loop(
    shared: SharedTelemetry,
    downlink: Downlink,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let packet = shared.lock().await.next_packet(time_of_day_now());
                let Some(line) = packet else { continue };
                debug!(line = line.trim_end(), "downlink");
                if downlink.write_line(&line).is_err() {
                    trace!("no ground station attached");
                }
            }
        }
    }
}

async fn command_loop(
    shared: SharedTelemetry,
    mut uplink: Uplink,
    engine: CommandEngine,
    outbox: Outbox,
    read_timeout: Duration,
    cancel: CancellationToken,
) {
    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            read = uplink.read_line(read_timeout) => read,
        };
        let line = match read {
            LinkRead::Line(line) => line,
            LinkRead::Idle => continue,
            LinkRead::Closed => {
                debug!("uplink closed");
                cancel.cancelled().await;
                break;
            }
        };

        let routed = {
            let mut state = shared.lock().await;
            engine.handle_line(&line, &mut state, time_of_day_now())
        };
        match routed {
            Ok(msg) => {
                info!(command = %line, to = %msg.receiver, kind = %msg.kind, "command accepted");
                outbox.send_message(&msg);
            }
            Err(ProtocolError::ForeignTeam { found, .. }) => {
                debug!(team = %found, "command for another team ignored");
            }
            Err(e) => warn!(error = %e, "invalid command"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FswConfig;
    use crate::message::{pack, unpack, Message};
    use tokio::sync::mpsc;

    struct Harness {
        pipe: mpsc::Sender<String>,
        queue: mpsc::Receiver<String>,
        ground: crate::link::GroundEndpoint,
        shared: SharedTelemetry,
        cancel: CancellationToken,
        task: tokio::task::JoinHandle<Result<(), WorkerError>>,
    }

    fn start() -> Harness {
        let mut config = FswConfig::default();
        config.worker_read_timeout_ms = 10;
        config.downlink_period_ms = 20;
        let (pipe, pipe_rx) = mpsc::channel(16);
        let (queue_tx, queue) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        let ctx = WorkerContext::new(
            AgentId::Comm,
            Arc::new(config),
            pipe_rx,
            queue_tx,
            cancel.clone(),
        );
        let (port, ground) = link_pair();
        let shared = Arc::new(Mutex::new(TelemetryState::new(1000)));
        let task = tokio::spawn(run_shared(ctx, port, Arc::clone(&shared)));
        Harness {
            pipe,
            queue,
            ground,
            shared,
            cancel,
            task,
        }
    }

    async fn next_routed(queue: &mut mpsc::Receiver<String>) -> Message {
        loop {
            let line = tokio::time::timeout(Duration::from_secs(2), queue.recv())
                .await
                .unwrap()
                .unwrap();
            let msg = unpack(&line).unwrap();
            if msg.kind != MessageKind::HEARTBEAT {
                return msg;
            }
        }
    }

    #[tokio::test]
    async fn test_uplink_command_is_routed_once() {
        let mut h = start();
        h.ground.send_command("CMD,1000,CAM,ON").await.unwrap();
        let msg = next_routed(&mut h.queue).await;
        assert_eq!(msg.receiver, AgentId::Camera);
        assert_eq!(msg.kind, MessageKind::CMD_CAM);
        assert_eq!(msg.payload, "ON");
        assert_eq!(h.shared.lock().await.cmd_echo, "CAMON");
        h.cancel.cancel();
        h.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_sensor_message_updates_state() {
        let h = start();
        let msg = Message::new(AgentId::Housekeeping, AgentId::Comm, MessageKind::VOLTAGE, "4.95");
        h.pipe.send(pack(&msg)).await.unwrap();
        for _ in 0..100 {
            if h.shared.lock().await.voltage > 0.0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!((h.shared.lock().await.voltage - 4.95).abs() < 1e-9);
        h.pipe
            .send(pack(&Message::terminate(AgentId::Supervisor, AgentId::Comm)))
            .await
            .unwrap();
        h.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_downlink_reaches_ground() {
        let h = start();
        let mut rx = h.ground.subscribe();
        let line = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(line.starts_with("1000,"));
        assert_eq!(line.matches(',').count(), 27);
        h.cancel.cancel();
        h.task.await.unwrap().unwrap();
    }
}
