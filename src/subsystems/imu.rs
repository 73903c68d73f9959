use super::{ignore_unexpected, MissionClock};
use crate::agents::{AgentId, MessageKind};
use crate::error::WorkerError;
use crate::message::Message;
use crate::sim::sensors::{imu_sample, rotor_rate, FlightProfile};
use crate::worker::{run_agent, Agent, Outbox, WorkerContext, WorkerFuture};
use std::time::Duration;

pub fn entry(ctx: WorkerContext) -> WorkerFuture {
    let agent = Imu::new(ctx.config.sensor_period());
    Box::pin(run_agent(ctx, agent))
}

/// Inertial unit plus the rotor tachometer.
#[derive(Debug)]
pub struct Imu {
    profile: FlightProfile,
    clock: MissionClock,
    period: Duration,
}

impl Imu {
    pub fn new(period: Duration) -> Self {
        Self {
            profile: FlightProfile::default(),
            clock: MissionClock::default(),
            period,
        }
    }

    pub fn imu_payload(&self, t_s: f64) -> String {
        imu_sample(&self.profile, t_s)
            .iter()
            .map(|v| format!("{v:.4}"))
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl Agent for Imu {
    fn on_message(&mut self, msg: &Message, _out: &Outbox) -> Result<(), WorkerError> {
        ignore_unexpected(msg);
        Ok(())
    }

    fn on_tick(&mut self, out: &Outbox) -> Result<(), WorkerError> {
        let t = self.clock.elapsed_s();
        out.send(AgentId::Comm, MessageKind::IMU_DATA, self.imu_payload(t));
        out.send(
            AgentId::Comm,
            MessageKind::ROT_RATE,
            format!("{:.2}", rotor_rate(&self.profile, t)),
        );
        Ok(())
    }

    fn tick_period(&self) -> Option<Duration> {
        Some(self.period)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::IMU_FIELDS;

    #[test]
    fn test_payload_field_count() {
        let imu = Imu::new(Duration::from_secs(1));
        assert_eq!(imu.imu_payload(40.0).split(',').count(), IMU_FIELDS);
    }
}
