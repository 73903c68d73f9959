use super::{ignore_unexpected, parse_switch};
use crate::agents::{AgentId, MessageKind};
use crate::error::WorkerError;
use crate::message::Message;
use crate::worker::{run_agent, Agent, Outbox, WorkerContext, WorkerFuture};
use tracing::{info, warn};

pub fn motor_entry(ctx: WorkerContext) -> WorkerFuture {
    Box::pin(run_agent(ctx, Actuator::motor()))
}

pub fn camera_entry(ctx: WorkerContext) -> WorkerFuture {
    Box::pin(run_agent(ctx, Actuator::camera()))
}

/// On/off actuator driven by one command kind. Every change is reported to
/// Housekeeping as `ON` or `OFF`.
#[derive(Debug)]
pub struct Actuator {
    agent: AgentId,
    command: MessageKind,
    on: bool,
}

impl Actuator {
    /// Release-mechanism motor, `MEC MOTOR`.
    pub fn motor() -> Self {
        Self {
            agent: AgentId::Motor,
            command: MessageKind::CMD_MEC,
            on: false,
        }
    }

    pub fn camera() -> Self {
        Self {
            agent: AgentId::Camera,
            command: MessageKind::CMD_CAM,
            on: false,
        }
    }

    pub fn is_on(&self) -> bool {
        self.on
    }

    fn set(&mut self, on: bool, out: &Outbox) {
        if self.on != on {
            info!(agent = %self.agent, on, "actuator switched");
        }
        self.on = on;
        out.send(AgentId::Housekeeping, MessageKind::STATUS, if on { "ON" } else { "OFF" });
    }
}

impl Agent for Actuator {
    fn on_start(&mut self, out: &Outbox) {
        self.set(false, out);
    }

    fn on_message(&mut self, msg: &Message, out: &Outbox) -> Result<(), WorkerError> {
        if msg.kind != self.command {
            ignore_unexpected(msg);
            return Ok(());
        }
        match parse_switch(&msg.payload) {
            Some(on) => self.set(on, out),
            None => warn!(agent = %self.agent, payload = %msg.payload, "bad actuator command"),
        }
        Ok(())
    }

    fn on_stop(&mut self, out: &Outbox) {
        if self.on {
            self.set(false, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::unpack;
    use tokio::sync::mpsc;

    #[test]
    fn test_camera_switches_and_reports() {
        let (tx, mut rx) = mpsc::channel(8);
        let out = Outbox::new(AgentId::Camera, tx);
        let mut camera = Actuator::camera();
        let on = Message::new(AgentId::Comm, AgentId::Camera, MessageKind::CMD_CAM, "ON");
        camera.on_message(&on, &out).unwrap();
        assert!(camera.is_on());
        let report = unpack(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(report.receiver, AgentId::Housekeeping);
        assert_eq!(report.payload, "ON");
    }

    #[test]
    fn test_foreign_command_ignored() {
        let (tx, _rx) = mpsc::channel(8);
        let out = Outbox::new(AgentId::Motor, tx);
        let mut motor = Actuator::motor();
        let cam = Message::new(AgentId::Comm, AgentId::Motor, MessageKind::CMD_CAM, "ON");
        motor.on_message(&cam, &out).unwrap();
        assert!(!motor.is_on());
    }
}
