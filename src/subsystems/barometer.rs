use super::{ignore_unexpected, MissionClock};
use crate::agents::{AgentId, MessageKind};
use crate::error::WorkerError;
use crate::message::Message;
use crate::sim::sensors::{barometer_sample, FlightProfile};
use crate::worker::{run_agent, Agent, Outbox, WorkerContext, WorkerFuture};
use std::time::Duration;
use tracing::info;

pub fn entry(ctx: WorkerContext) -> WorkerFuture {
    let agent = Barometer::new(ctx.config.sensor_period());
    Box::pin(run_agent(ctx, agent))
}

/// Pressure sensor. Reports `pressure,temperature,altitude` to Comm and altitude to
/// FlightLogic; `CAL` makes the current altitude the new zero.
#[derive(Debug)]
pub struct Barometer {
    profile: FlightProfile,
    clock: MissionClock,
    period: Duration,
    ground_m: f64,
    last_raw_altitude: f64,
}

impl Barometer {
    pub fn new(period: Duration) -> Self {
        Self {
            profile: FlightProfile::default(),
            clock: MissionClock::default(),
            period,
            ground_m: 0.0,
            last_raw_altitude: 0.0,
        }
    }

    pub fn ground_m(&self) -> f64 {
        self.ground_m
    }

    /// Sample at `t_s` seconds into the flight and send the readings.
    pub fn report(&mut self, t_s: f64, out: &Outbox) {
        let (pressure, temperature, raw_altitude) = barometer_sample(&self.profile, t_s, 0.0);
        self.last_raw_altitude = raw_altitude;
        let altitude = raw_altitude - self.ground_m;
        out.send(
            AgentId::Comm,
            MessageKind::BARO_DATA,
            format!("{pressure:.2},{temperature:.2},{altitude:.2}"),
        );
        out.send(AgentId::FlightLogic, MessageKind::ALTITUDE, format!("{altitude:.2}"));
    }
}

impl Agent for Barometer {
    fn on_message(&mut self, msg: &Message, _out: &Outbox) -> Result<(), WorkerError> {
        match msg.kind {
            MessageKind::CMD_CAL => {
                self.ground_m = self.last_raw_altitude;
                info!(ground_m = self.ground_m, "altitude re-zeroed");
            }
            _ => ignore_unexpected(msg),
        }
        Ok(())
    }

    fn on_tick(&mut self, out: &Outbox) -> Result<(), WorkerError> {
        let t = self.clock.elapsed_s();
        self.report(t, out);
        Ok(())
    }

    fn tick_period(&self) -> Option<Duration> {
        Some(self.period)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::unpack;
    use tokio::sync::mpsc;

    #[test]
    fn test_calibration_zeroes_altitude() {
        let (tx, mut rx) = mpsc::channel(8);
        let out = Outbox::new(AgentId::Barometer, tx);
        let mut baro = Barometer::new(Duration::from_millis(500));

        // 10 s after apogee, well above ground
        let t = 38.0;
        baro.report(t, &out);
        let first = unpack(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(first.kind, MessageKind::BARO_DATA);
        assert_eq!(first.payload.split(',').count(), 3);
        let _ = rx.try_recv().unwrap();

        let cal = Message::new(AgentId::Comm, AgentId::Barometer, MessageKind::CMD_CAL, "");
        baro.on_message(&cal, &out).unwrap();
        baro.report(t, &out);
        let _ = rx.try_recv().unwrap();
        let altitude = unpack(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(altitude.receiver, AgentId::FlightLogic);
        assert_eq!(altitude.payload, "0.00");
    }
}
