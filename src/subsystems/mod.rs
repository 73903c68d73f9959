//! Agents hosted by the flight software, each behind the [`crate::worker::Agent`] trait.
//!
//! Sensor agents sample the simulated flight in [`crate::sim::sensors`]; actuator
//! agents track on/off state and report it to Housekeeping.

pub mod actuators;
pub mod barometer;
pub mod flight_logic;
pub mod gps;
pub mod housekeeping;
pub mod imu;
pub mod thermal;

pub use actuators::Actuator;
pub use barometer::Barometer;
pub use flight_logic::{FlightLogic, FlightState, SimState};
pub use gps::Gps;
pub use housekeeping::Housekeeping;
pub use imu::Imu;
pub use thermal::Thermal;

use crate::message::Message;
use std::time::Instant;
use tracing::debug;

/// Seconds since the agent started; the time base of the simulated flight.
#[derive(Debug, Clone, Copy)]
pub struct MissionClock {
    started: Instant,
}

impl Default for MissionClock {
    fn default() -> Self {
        Self {
            started: Instant::now(),
        }
    }
}

impl MissionClock {
    pub fn elapsed_s(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }
}

pub(crate) fn ignore_unexpected(msg: &Message) {
    debug!(from = %msg.sender, to = %msg.receiver, kind = %msg.kind, "unexpected message ignored");
}

/// Parse an `ON`/`OFF` option.
pub(crate) fn parse_switch(payload: &str) -> Option<bool> {
    match payload {
        "ON" => Some(true),
        "OFF" => Some(false),
        _ => None,
    }
}
