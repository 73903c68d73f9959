use super::{ignore_unexpected, MissionClock};
use crate::agents::{AgentId, MessageKind};
use crate::error::WorkerError;
use crate::message::Message;
use crate::sim::sensors::{gps_sample, FlightProfile};
use crate::telemetry::{format_hms, time_of_day_now};
use crate::worker::{run_agent, Agent, Outbox, WorkerContext, WorkerFuture};
use std::time::Duration;

pub fn entry(ctx: WorkerContext) -> WorkerFuture {
    let agent = Gps::new(ctx.config.sensor_period());
    Box::pin(run_agent(ctx, agent))
}

#[derive(Debug)]
pub struct Gps {
    profile: FlightProfile,
    clock: MissionClock,
    period: Duration,
}

impl Gps {
    pub fn new(period: Duration) -> Self {
        Self {
            profile: FlightProfile::default(),
            clock: MissionClock::default(),
            period,
        }
    }

    /// `time,altitude,latitude,longitude,satellites`
    pub fn fix_payload(&self, t_s: f64, time_of_day: u32) -> String {
        let (altitude, latitude, longitude, satellites) = gps_sample(&self.profile, t_s);
        format!(
            "{},{altitude:.2},{latitude:.4},{longitude:.4},{satellites:.0}",
            format_hms(time_of_day)
        )
    }
}

impl Agent for Gps {
    fn on_message(&mut self, msg: &Message, _out: &Outbox) -> Result<(), WorkerError> {
        ignore_unexpected(msg);
        Ok(())
    }

    fn on_tick(&mut self, out: &Outbox) -> Result<(), WorkerError> {
        let payload = self.fix_payload(self.clock.elapsed_s(), time_of_day_now());
        out.send(AgentId::Comm, MessageKind::GPS_DATA, payload);
        Ok(())
    }

    fn tick_period(&self) -> Option<Duration> {
        Some(self.period)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::TelemetryState;

    #[test]
    fn test_fix_is_accepted_by_telemetry() {
        let gps = Gps::new(Duration::from_secs(1));
        let payload = gps.fix_payload(30.0, 12 * 3600 + 34 * 60 + 56);
        assert!(payload.starts_with("12:34:56,"));

        let mut state = TelemetryState::new(1000);
        let msg = Message::new(AgentId::Gps, AgentId::Comm, MessageKind::GPS_DATA, payload);
        state.apply(&msg).unwrap();
        assert_eq!(state.gps.time, "12:34:56");
        assert!(state.gps.satellites >= 8.0);
    }
}
