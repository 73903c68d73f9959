//! Agent identifiers and message-kind ids.
//!
//! Every worker on the bus is addressed by an [`AgentId`]; every message carries a
//! [`MessageKind`] that tells the receiver how to read the payload.

use core::fmt;
use core::str::FromStr;
use serde::{Deserialize, Serialize};

/// Closed set of subsystems hosted by the flight software.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentId {
    Supervisor,
    Comm,
    Housekeeping,
    Barometer,
    Gps,
    Imu,
    FlightLogic,
    Motor,
    Camera,
    Thermal,
}

impl AgentId {
    pub const ALL: [AgentId; 10] = [
        AgentId::Supervisor,
        AgentId::Comm,
        AgentId::Housekeeping,
        AgentId::Barometer,
        AgentId::Gps,
        AgentId::Imu,
        AgentId::FlightLogic,
        AgentId::Motor,
        AgentId::Camera,
        AgentId::Thermal,
    ];

    /// Numeric id used on the wire.
    pub const fn id(self) -> u8 {
        match self {
            AgentId::Supervisor => 0,
            AgentId::Comm => 1,
            AgentId::Housekeeping => 2,
            AgentId::Barometer => 3,
            AgentId::Gps => 4,
            AgentId::Imu => 5,
            AgentId::FlightLogic => 6,
            AgentId::Motor => 7,
            AgentId::Camera => 8,
            AgentId::Thermal => 9,
        }
    }

    pub const fn from_id(id: u32) -> Option<Self> {
        match id {
            0 => Some(AgentId::Supervisor),
            1 => Some(AgentId::Comm),
            2 => Some(AgentId::Housekeeping),
            3 => Some(AgentId::Barometer),
            4 => Some(AgentId::Gps),
            5 => Some(AgentId::Imu),
            6 => Some(AgentId::FlightLogic),
            7 => Some(AgentId::Motor),
            8 => Some(AgentId::Camera),
            9 => Some(AgentId::Thermal),
            _ => None,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            AgentId::Supervisor => "supervisor",
            AgentId::Comm => "comm",
            AgentId::Housekeeping => "housekeeping",
            AgentId::Barometer => "barometer",
            AgentId::Gps => "gps",
            AgentId::Imu => "imu",
            AgentId::FlightLogic => "flight_logic",
            AgentId::Motor => "motor",
            AgentId::Camera => "camera",
            AgentId::Thermal => "thermal",
        }
    }

    /// Every agent except the supervisor runs as a worker.
    pub fn workers() -> impl Iterator<Item = AgentId> {
        Self::ALL.into_iter().filter(|a| *a != AgentId::Supervisor)
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown agent name: {0}")]
pub struct UnknownAgent(pub String);

impl FromStr for AgentId {
    type Err = UnknownAgent;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|a| a.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownAgent(s.to_string()))
    }
}

/// Message-kind discriminator. The payload layout of each kind is fixed by its sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageKind(pub u16);

impl MessageKind {
    // Lifecycle and liveness, understood by every agent
    pub const TERMINATE: Self = Self(0);
    pub const HEARTBEAT: Self = Self(1);
    pub const STATUS: Self = Self(2);

    // Sensor data
    /// `pressure_hpa,temperature_c,altitude_m`
    pub const BARO_DATA: Self = Self(10);
    /// `hh:mm:ss,altitude,latitude,longitude,satellites`
    pub const GPS_DATA: Self = Self(11);
    /// gyro(3), accel(3), mag_ut(3), filtered attitude(3)
    pub const IMU_DATA: Self = Self(12);
    pub const ROT_RATE: Self = Self(13);
    pub const VOLTAGE: Self = Self(14);
    /// `state_label,mode` where mode is `F` or `S`
    pub const FLIGHT_STATUS: Self = Self(15);
    pub const ALTITUDE: Self = Self(16);

    // Uplink commands routed to their owning agent
    pub const CMD_CX: Self = Self(20);
    pub const CMD_ST: Self = Self(21);
    pub const CMD_SIM: Self = Self(22);
    pub const CMD_SIMP: Self = Self(23);
    pub const CMD_CAL: Self = Self(24);
    pub const CMD_MEC: Self = Self(25);
    pub const CMD_CAM: Self = Self(26);
    pub const CMD_SS: Self = Self(27);
    pub const CMD_RBT: Self = Self(28);

    pub const fn name(self) -> &'static str {
        match self.0 {
            0 => "terminate",
            1 => "heartbeat",
            2 => "status",
            10 => "baro_data",
            11 => "gps_data",
            12 => "imu_data",
            13 => "rot_rate",
            14 => "voltage",
            15 => "flight_status",
            16 => "altitude",
            20 => "cmd_cx",
            21 => "cmd_st",
            22 => "cmd_sim",
            23 => "cmd_simp",
            24 => "cmd_cal",
            25 => "cmd_mec",
            26 => "cmd_cam",
            27 => "cmd_ss",
            28 => "cmd_rbt",
            _ => "unknown",
        }
    }

    /// Kinds every worker must accept regardless of its registered set.
    pub const fn is_control(self) -> bool {
        self.0 == Self::TERMINATE.0 || self.0 == Self::HEARTBEAT.0
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.0)
    }
}

pub const BARO_FIELDS: usize = 3;
pub const GPS_FIELDS: usize = 5;
pub const IMU_FIELDS: usize = 12;
