use super::{ignore_unexpected, MissionClock};
use crate::agents::{AgentId, MessageKind};
use crate::error::WorkerError;
use crate::message::Message;
use crate::sim::sensors::board_temperature;
use crate::worker::{run_agent, Agent, Outbox, WorkerContext, WorkerFuture};
use std::time::Duration;
use tracing::warn;

const CRITICAL_TEMP_HIGH_C: f64 = 70.0;
const CRITICAL_TEMP_LOW_C: f64 = -20.0;
/// Board temperature is slow; report every few sensor periods.
const REPORT_DIVIDER: u32 = 4;

pub fn entry(ctx: WorkerContext) -> WorkerFuture {
    let agent = Thermal::new(ctx.config.sensor_period() * REPORT_DIVIDER);
    Box::pin(run_agent(ctx, agent))
}

/// Electronics-bay temperature, reported to Housekeeping.
#[derive(Debug)]
pub struct Thermal {
    clock: MissionClock,
    period: Duration,
    out_of_range: bool,
}

impl Thermal {
    pub fn new(period: Duration) -> Self {
        Self {
            clock: MissionClock::default(),
            period,
            out_of_range: false,
        }
    }

    pub fn report(&mut self, temp_c: f64, out: &Outbox) {
        let out_of_range = !(CRITICAL_TEMP_LOW_C..=CRITICAL_TEMP_HIGH_C).contains(&temp_c);
        if out_of_range && !self.out_of_range {
            warn!(temp_c, "board temperature outside operating range");
        }
        self.out_of_range = out_of_range;
        out.send(AgentId::Housekeeping, MessageKind::STATUS, format!("{temp_c:.2}"));
    }
}

impl Agent for Thermal {
    fn on_message(&mut self, msg: &Message, _out: &Outbox) -> Result<(), WorkerError> {
        ignore_unexpected(msg);
        Ok(())
    }

    fn on_tick(&mut self, out: &Outbox) -> Result<(), WorkerError> {
        self.report(board_temperature(self.clock.elapsed_s()), out);
        Ok(())
    }

    fn tick_period(&self) -> Option<Duration> {
        Some(self.period)
    }
}
