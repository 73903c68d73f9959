use super::{ignore_unexpected, MissionClock};
use crate::agents::{AgentId, MessageKind};
use crate::error::WorkerError;
use crate::message::Message;
use crate::sim::sensors::battery_voltage;
use crate::worker::{run_agent, Agent, Outbox, WorkerContext, WorkerFuture};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Comm is considered silent after this many missed heartbeat periods.
const COMM_SILENCE_PERIODS: u32 = 3;

pub fn entry(ctx: WorkerContext) -> WorkerFuture {
    let agent = Housekeeping::new(
        ctx.config.sensor_period(),
        ctx.config.heartbeat_period(),
        ctx.config.reboot_command.clone(),
    );
    Box::pin(run_agent(ctx, agent))
}

/// Power and platform bookkeeping: bus voltage, component status reports, Comm
/// liveness, and the `CX`/`ST`/`RBT` command notices.
#[derive(Debug)]
pub struct Housekeeping {
    clock: MissionClock,
    period: Duration,
    heartbeat_period: Duration,
    reboot_command: Option<Vec<String>>,
    last_comm_heartbeat: Option<Instant>,
    comm_silent: bool,
    statuses: BTreeMap<AgentId, String>,
    reboot_requests: u32,
}

impl Housekeeping {
    pub fn new(
        period: Duration,
        heartbeat_period: Duration,
        reboot_command: Option<Vec<String>>,
    ) -> Self {
        Self {
            clock: MissionClock::default(),
            period,
            heartbeat_period,
            reboot_command,
            last_comm_heartbeat: None,
            comm_silent: false,
            statuses: BTreeMap::new(),
            reboot_requests: 0,
        }
    }

    pub fn status_of(&self, agent: AgentId) -> Option<&str> {
        self.statuses.get(&agent).map(String::as_str)
    }

    pub fn reboot_requests(&self) -> u32 {
        self.reboot_requests
    }

    fn check_comm_liveness(&mut self, now: Instant) {
        let Some(last) = self.last_comm_heartbeat else {
            return;
        };
        let silent = now.duration_since(last) > self.heartbeat_period * COMM_SILENCE_PERIODS;
        if silent && !self.comm_silent {
            warn!(since = ?now.duration_since(last), "no heartbeat from comm");
        }
        self.comm_silent = silent;
    }

    fn request_reboot(&mut self) {
        self.reboot_requests += 1;
        let Some((program, args)) = self
            .reboot_command
            .as_ref()
            .and_then(|cmd| cmd.split_first())
        else {
            warn!("reboot requested, no reboot command configured");
            return;
        };
        info!(program = %program, "executing reboot request");
        match tokio::process::Command::new(program).args(args).spawn() {
            Ok(mut child) => {
                tokio::spawn(async move {
                    if let Err(e) = child.wait().await {
                        warn!(error = %e, "reboot command did not complete");
                    }
                });
            }
            Err(e) => error!(program = %program, error = %e, "reboot command failed to start"),
        }
    }
}

impl Agent for Housekeeping {
    fn on_message(&mut self, msg: &Message, _out: &Outbox) -> Result<(), WorkerError> {
        match msg.kind {
            MessageKind::HEARTBEAT if msg.sender == AgentId::Comm => {
                if self.comm_silent {
                    info!("comm heartbeat resumed");
                    self.comm_silent = false;
                }
                self.last_comm_heartbeat = Some(Instant::now());
            }
            MessageKind::STATUS => {
                let previous = self.statuses.insert(msg.sender, msg.payload.clone());
                if msg.sender != AgentId::Thermal && previous.as_deref() != Some(msg.payload.as_str()) {
                    info!(agent = %msg.sender, status = %msg.payload, "component status");
                }
            }
            MessageKind::CMD_CX => info!(state = %msg.payload, "telemetry transmission switched"),
            MessageKind::CMD_ST => info!(time = %msg.payload, "mission clock set"),
            MessageKind::CMD_RBT => self.request_reboot(),
            _ => ignore_unexpected(msg),
        }
        Ok(())
    }

    fn on_tick(&mut self, out: &Outbox) -> Result<(), WorkerError> {
        let volts = battery_voltage(self.clock.elapsed_s());
        out.send(AgentId::Comm, MessageKind::VOLTAGE, format!("{volts:.2}"));
        self.check_comm_liveness(Instant::now());
        Ok(())
    }

    fn tick_period(&self) -> Option<Duration> {
        Some(self.period)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn outbox() -> Outbox {
        let (tx, _rx) = mpsc::channel(8);
        Outbox::new(AgentId::Housekeeping, tx)
    }

    #[test]
    fn test_status_reports_are_tracked() {
        let out = outbox();
        let mut hk = Housekeeping::new(Duration::from_secs(1), Duration::from_secs(1), None);
        let msg = Message::new(AgentId::Motor, AgentId::Housekeeping, MessageKind::STATUS, "ON");
        hk.on_message(&msg, &out).unwrap();
        assert_eq!(hk.status_of(AgentId::Motor), Some("ON"));
        assert_eq!(hk.status_of(AgentId::Camera), None);
    }

    #[test]
    fn test_reboot_without_command_only_counts() {
        let out = outbox();
        let mut hk = Housekeeping::new(Duration::from_secs(1), Duration::from_secs(1), None);
        let msg = Message::new(AgentId::Comm, AgentId::Housekeeping, MessageKind::CMD_RBT, "");
        hk.on_message(&msg, &out).unwrap();
        assert_eq!(hk.reboot_requests(), 1);
    }

    #[test]
    fn test_comm_silence_detected() {
        let out = outbox();
        let mut hk = Housekeeping::new(Duration::from_secs(1), Duration::from_millis(10), None);
        let hb = Message::heartbeat(AgentId::Comm, AgentId::Housekeeping);
        hk.on_message(&hb, &out).unwrap();
        hk.check_comm_liveness(Instant::now() + Duration::from_millis(100));
        assert!(hk.comm_silent);
        hk.on_message(&hb, &out).unwrap();
        assert!(!hk.comm_silent);
    }
}
