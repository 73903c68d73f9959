//! Flight-state machine and simulation-mode control.
//!
//! Altitude comes from the barometer in flight mode and from `SIMP` in simulation
//! mode. Transitions are debounced over consecutive samples so one noisy reading does
//! not advance the mission.

use super::ignore_unexpected;
use crate::agents::{AgentId, MessageKind};
use crate::error::WorkerError;
use crate::message::Message;
use crate::telemetry::TelemetryMode;
use crate::worker::{run_agent, Agent, Outbox, WorkerContext, WorkerFuture};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

/// Altitude above which the pad is considered left.
pub const LAUNCH_ALTITUDE_M: f64 = 10.0;
/// Drop below the peak that counts as past apogee.
pub const APOGEE_DROP_M: f64 = 2.0;
/// Probe is released below this fraction of the peak altitude.
pub const PROBE_RELEASE_FRACTION: f64 = 0.75;
pub const LANDED_ALTITUDE_M: f64 = 5.0;
const LANDED_STILL_M: f64 = 0.5;
const LAUNCH_CONFIRM_SAMPLES: u8 = 2;
const APOGEE_CONFIRM_SAMPLES: u8 = 3;
const LANDED_CONFIRM_SAMPLES: u8 = 3;

pub fn entry(ctx: WorkerContext) -> WorkerFuture {
    let agent = FlightLogic::new(ctx.config.heartbeat_period());
    Box::pin(run_agent(ctx, agent))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FlightState {
    LaunchPad,
    Ascent,
    Apogee,
    Descent,
    ProbeRelease,
    Landed,
}

impl FlightState {
    pub const fn label(self) -> &'static str {
        match self {
            FlightState::LaunchPad => "LAUNCH_PAD",
            FlightState::Ascent => "ASCENT",
            FlightState::Apogee => "APOGEE",
            FlightState::Descent => "DESCENT",
            FlightState::ProbeRelease => "PROBE_RELEASE",
            FlightState::Landed => "LANDED",
        }
    }

    /// State selected by `SS <digit>`.
    pub fn from_digit(digit: &str) -> Option<Self> {
        match digit {
            "0" => Some(FlightState::LaunchPad),
            "1" => Some(FlightState::Ascent),
            "2" => Some(FlightState::Apogee),
            "3" => Some(FlightState::Descent),
            "4" => Some(FlightState::ProbeRelease),
            "5" => Some(FlightState::Landed),
            _ => None,
        }
    }
}

/// `SIM ENABLE` arms, `SIM ACTIVATE` switches over only when armed, `SIM DISABLE`
/// returns to flight mode from either.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SimState {
    Disabled,
    Enabled,
    Active,
}

#[derive(Debug)]
pub struct FlightLogic {
    state: FlightState,
    sim: SimState,
    report_period: Duration,
    max_altitude: f64,
    last_altitude: Option<f64>,
    confirm: u8,
}

impl FlightLogic {
    pub fn new(report_period: Duration) -> Self {
        Self {
            state: FlightState::LaunchPad,
            sim: SimState::Disabled,
            report_period,
            max_altitude: 0.0,
            last_altitude: None,
            confirm: 0,
        }
    }

    pub fn state(&self) -> FlightState {
        self.state
    }

    pub fn sim(&self) -> SimState {
        self.sim
    }

    pub fn max_altitude(&self) -> f64 {
        self.max_altitude
    }

    pub fn mode(&self) -> TelemetryMode {
        if self.sim == SimState::Active {
            TelemetryMode::Simulation
        } else {
            TelemetryMode::Flight
        }
    }

    fn report(&self, out: &Outbox) {
        out.send(
            AgentId::Comm,
            MessageKind::FLIGHT_STATUS,
            format!("{},{}", self.state.label(), self.mode().code()),
        );
    }

    fn enter(&mut self, next: FlightState, out: &Outbox) {
        if next == self.state {
            return;
        }
        info!(from = self.state.label(), to = next.label(), "flight state changed");
        self.state = next;
        self.confirm = 0;
        match next {
            FlightState::Ascent => {
                out.send(AgentId::Camera, MessageKind::CMD_CAM, "ON");
            }
            FlightState::ProbeRelease => {
                out.send(AgentId::Motor, MessageKind::CMD_MEC, "ON");
            }
            FlightState::Landed => {
                out.send(AgentId::Camera, MessageKind::CMD_CAM, "OFF");
            }
            _ => {}
        }
        self.report(out);
    }

    /// Feed one altitude sample through the state machine.
    pub fn update_altitude(&mut self, altitude: f64, out: &Outbox) {
        if altitude > self.max_altitude {
            self.max_altitude = altitude;
        }
        let previous = self.last_altitude.replace(altitude);

        let condition = match self.state {
            FlightState::LaunchPad => Some((altitude > LAUNCH_ALTITUDE_M, LAUNCH_CONFIRM_SAMPLES, FlightState::Ascent)),
            FlightState::Ascent => Some((
                altitude < self.max_altitude - APOGEE_DROP_M,
                APOGEE_CONFIRM_SAMPLES,
                FlightState::Apogee,
            )),
            FlightState::Apogee => {
                self.enter(FlightState::Descent, out);
                None
            }
            FlightState::Descent => Some((
                altitude < self.max_altitude * PROBE_RELEASE_FRACTION,
                1,
                FlightState::ProbeRelease,
            )),
            FlightState::ProbeRelease => {
                let still = previous.is_some_and(|p| (p - altitude).abs() < LANDED_STILL_M);
                Some((
                    altitude < LANDED_ALTITUDE_M && still,
                    LANDED_CONFIRM_SAMPLES,
                    FlightState::Landed,
                ))
            }
            FlightState::Landed => None,
        };

        if let Some((met, needed, next)) = condition {
            if met {
                self.confirm += 1;
                if self.confirm >= needed {
                    self.enter(next, out);
                }
            } else {
                self.confirm = 0;
            }
        }
    }

    fn handle_sim(&mut self, option: &str, out: &Outbox) {
        let next = match (option, self.sim) {
            ("ENABLE", SimState::Disabled) => SimState::Enabled,
            ("ACTIVATE", SimState::Enabled) => SimState::Active,
            ("ACTIVATE", SimState::Disabled) => {
                warn!("SIM ACTIVATE ignored, simulation not enabled");
                return;
            }
            ("DISABLE", _) => SimState::Disabled,
            (_, current) => current,
        };
        if next != self.sim {
            info!(from = ?self.sim, to = ?next, "simulation mode changed");
            self.sim = next;
            self.report(out);
        }
    }

    fn reset_max_altitude(&mut self) {
        info!(previous = self.max_altitude, "maximum altitude reset");
        self.max_altitude = 0.0;
        self.last_altitude = None;
        self.confirm = 0;
    }
}

impl Agent for FlightLogic {
    fn on_start(&mut self, out: &Outbox) {
        self.report(out);
    }

    fn on_message(&mut self, msg: &Message, out: &Outbox) -> Result<(), WorkerError> {
        match msg.kind {
            MessageKind::ALTITUDE | MessageKind::CMD_SIMP => {
                let from_sim = msg.kind == MessageKind::CMD_SIMP;
                if from_sim != (self.sim == SimState::Active) {
                    // Barometer altitude is ignored in simulation and SIMP outside it
                    return Ok(());
                }
                match msg.payload.trim().parse::<f64>() {
                    Ok(altitude) if altitude.is_finite() => self.update_altitude(altitude, out),
                    _ => warn!(payload = %msg.payload, "bad altitude payload"),
                }
            }
            MessageKind::CMD_SIM => self.handle_sim(&msg.payload, out),
            MessageKind::CMD_CAL => self.reset_max_altitude(),
            MessageKind::CMD_SS => match FlightState::from_digit(&msg.payload) {
                Some(state) => self.enter(state, out),
                None => warn!(option = %msg.payload, "no flight state for SS option"),
            },
            _ => ignore_unexpected(msg),
        }
        Ok(())
    }

    fn on_tick(&mut self, out: &Outbox) -> Result<(), WorkerError> {
        self.report(out);
        Ok(())
    }

    fn tick_period(&self) -> Option<Duration> {
        Some(self.report_period)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::unpack;
    use tokio::sync::mpsc;

    fn harness() -> (FlightLogic, Outbox, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(64);
        (
            FlightLogic::new(Duration::from_secs(1)),
            Outbox::new(AgentId::FlightLogic, tx),
            rx,
        )
    }

    fn command(kind: MessageKind, payload: &str) -> Message {
        Message::new(AgentId::Comm, AgentId::FlightLogic, kind, payload)
    }

    #[test]
    fn test_full_flight_sequence() {
        let (mut fl, out, _rx) = harness();
        let profile = [0.0, 5.0, 50.0, 200.0, 400.0, 600.0, 700.0, 698.0, 690.0, 680.0, 670.0];
        for alt in profile {
            fl.update_altitude(alt, &out);
        }
        assert_eq!(fl.state(), FlightState::Apogee);
        fl.update_altitude(660.0, &out);
        assert_eq!(fl.state(), FlightState::Descent);
        fl.update_altitude(500.0, &out);
        assert_eq!(fl.state(), FlightState::ProbeRelease);
        for alt in [100.0, 3.0, 2.9, 2.8, 2.8] {
            fl.update_altitude(alt, &out);
        }
        assert_eq!(fl.state(), FlightState::Landed);
    }

    #[test]
    fn test_single_spike_does_not_launch() {
        let (mut fl, out, _rx) = harness();
        fl.update_altitude(30.0, &out);
        fl.update_altitude(1.0, &out);
        fl.update_altitude(30.0, &out);
        assert_eq!(fl.state(), FlightState::LaunchPad);
    }

    #[test]
    fn test_sim_requires_enable_before_activate() {
        let (mut fl, out, _rx) = harness();
        fl.on_message(&command(MessageKind::CMD_SIM, "ACTIVATE"), &out).unwrap();
        assert_eq!(fl.sim(), SimState::Disabled);
        fl.on_message(&command(MessageKind::CMD_SIM, "ENABLE"), &out).unwrap();
        fl.on_message(&command(MessageKind::CMD_SIM, "ACTIVATE"), &out).unwrap();
        assert_eq!(fl.mode(), TelemetryMode::Simulation);
        fl.on_message(&command(MessageKind::CMD_SIM, "DISABLE"), &out).unwrap();
        assert_eq!(fl.mode(), TelemetryMode::Flight);
    }

    #[test]
    fn test_altitude_source_follows_mode() {
        let (mut fl, out, _rx) = harness();
        fl.on_message(&command(MessageKind::CMD_SIMP, "500.00"), &out).unwrap();
        assert_eq!(fl.max_altitude(), 0.0);

        fl.on_message(&command(MessageKind::CMD_SIM, "ENABLE"), &out).unwrap();
        fl.on_message(&command(MessageKind::CMD_SIM, "ACTIVATE"), &out).unwrap();
        let baro = Message::new(AgentId::Barometer, AgentId::FlightLogic, MessageKind::ALTITUDE, "300.00");
        fl.on_message(&baro, &out).unwrap();
        assert_eq!(fl.max_altitude(), 0.0);
        fl.on_message(&command(MessageKind::CMD_SIMP, "120.50"), &out).unwrap();
        assert_eq!(fl.max_altitude(), 120.5);

        fl.on_message(&command(MessageKind::CMD_CAL, ""), &out).unwrap();
        assert_eq!(fl.max_altitude(), 0.0);
    }

    #[test]
    fn test_state_forcing_reports_status() {
        let (mut fl, out, mut rx) = harness();
        fl.on_message(&command(MessageKind::CMD_SS, "3"), &out).unwrap();
        assert_eq!(fl.state(), FlightState::Descent);
        let status = unpack(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(status.kind, MessageKind::FLIGHT_STATUS);
        assert_eq!(status.payload, "DESCENT,F");
        fl.on_message(&command(MessageKind::CMD_SS, "9"), &out).unwrap();
        assert_eq!(fl.state(), FlightState::Descent);
    }
}
