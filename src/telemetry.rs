//! Telemetry state owned by the Comm agent and the fixed-field downlink line.

use crate::agents::{AgentId, MessageKind, BARO_FIELDS, GPS_FIELDS, IMU_FIELDS};
use crate::error::TelemetryError;
use crate::message::{Message, FIELD_DELIMITER};
use arrayvec::ArrayString;
use serde::{Deserialize, Serialize};
use static_assertions::const_assert_eq;
use std::time::{SystemTime, UNIX_EPOCH};

const SECONDS_PER_DAY: i64 = 86_400;
const SEA_LEVEL_HPA: f64 = 1013.25;
const HPA_TO_KPA: f64 = 0.1;
const MICROTESLA_TO_GAUSS: f64 = 0.01;

pub const INITIAL_FLIGHT_STATE: &str = "LAUNCH_PAD";
pub const MAX_STATE_LABEL: usize = 16;

/// Downlink field order.
pub const DOWNLINK_FIELDS: [&str; 28] = [
    "TEAM_ID",
    "MISSION_TIME",
    "PACKET_COUNT",
    "MODE",
    "STATE",
    "ALTITUDE",
    "TEMPERATURE",
    "PRESSURE",
    "VOLTAGE",
    "GYRO_R",
    "GYRO_P",
    "GYRO_Y",
    "ACCEL_R",
    "ACCEL_P",
    "ACCEL_Y",
    "MAG_R",
    "MAG_P",
    "MAG_Y",
    "AUTO_GYRO_ROTATION_RATE",
    "GPS_TIME",
    "GPS_ALTITUDE",
    "GPS_LATITUDE",
    "GPS_LONGITUDE",
    "GPS_SATS",
    "CMD_ECHO",
    "FILTERED_ROLL",
    "FILTERED_PITCH",
    "FILTERED_YAW",
];

const_assert_eq!(DOWNLINK_FIELDS.len(), 28);

/// Barometric altitude in metres for a pressure in hPa.
pub fn pressure_to_altitude(pressure_hpa: f64) -> f64 {
    44307.7 * (1.0 - (pressure_hpa / SEA_LEVEL_HPA).powf(0.190284))
}

/// Seconds since UTC midnight of the local clock.
pub fn time_of_day_now() -> u32 {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    (secs % SECONDS_PER_DAY as u64) as u32
}

/// Parse `HH:MM:SS` into seconds since midnight.
pub fn parse_hms(text: &str) -> Option<u32> {
    let mut parts = text.split(':');
    let (h, m, s) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() {
        return None;
    }
    let field = |p: &str| -> Option<u32> {
        if p.len() == 2 && p.bytes().all(|b| b.is_ascii_digit()) {
            p.parse().ok()
        } else {
            None
        }
    };
    Some(field(h)? * 3600 + field(m)? * 60 + field(s)?)
}

pub fn format_hms(seconds: u32) -> String {
    let seconds = seconds % SECONDS_PER_DAY as u32;
    format!(
        "{:02}:{:02}:{:02}",
        seconds / 3600,
        (seconds / 60) % 60,
        seconds % 60
    )
}

/// Signed offset between the local clock and mission time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockOffset {
    seconds: i64,
}

impl ClockOffset {
    pub const fn zero() -> Self {
        Self { seconds: 0 }
    }

    /// Offset that makes mission time read `target` at local time `now`.
    pub fn from_target(now: u32, target: u32) -> Self {
        Self {
            seconds: i64::from(now) - i64::from(target),
        }
    }

    pub fn seconds(&self) -> i64 {
        self.seconds
    }

    pub fn mission_time(&self, now: u32) -> u32 {
        (i64::from(now) - self.seconds).rem_euclid(SECONDS_PER_DAY) as u32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TelemetryMode {
    Flight,
    Simulation,
}

impl TelemetryMode {
    pub const fn code(self) -> char {
        match self {
            TelemetryMode::Flight => 'F',
            TelemetryMode::Simulation => 'S',
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "F" => Some(TelemetryMode::Flight),
            "S" => Some(TelemetryMode::Simulation),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Triple {
    pub roll: f64,
    pub pitch: f64,
    pub yaw: f64,
}

impl Triple {
    fn from_slice(values: &[f64]) -> Self {
        Self {
            roll: values[0],
            pitch: values[1],
            yaw: values[2],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpsFix {
    pub time: String,
    pub altitude: f64,
    pub latitude: f64,
    pub longitude: f64,
    pub satellites: f64,
}

impl Default for GpsFix {
    fn default() -> Self {
        Self {
            time: "00:00:00".to_string(),
            altitude: 0.0,
            latitude: 0.0,
            longitude: 0.0,
            satellites: 0.0,
        }
    }
}

/// Live telemetry aggregate. Every slot has a default so a partial sensor outage
/// still produces a well-formed downlink line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryState {
    pub team_id: u16,
    pub clock: ClockOffset,
    pub packet_count: u32,
    pub telemetry_enabled: bool,
    pub mode: TelemetryMode,
    pub state: ArrayString<MAX_STATE_LABEL>,
    pub altitude: f64,
    pub temperature: f64,
    pub pressure_hpa: f64,
    pub voltage: f64,
    pub gyro: Triple,
    pub accel: Triple,
    pub mag_ut: Triple,
    pub rot_rate: f64,
    pub gps: GpsFix,
    pub cmd_echo: String,
    pub filtered: Triple,
    /// Altitude offset captured by `CAL` in simulation mode.
    pub sim_zero_offset: f64,
    /// Last un-offset altitude computed from `SIMP`.
    pub sim_raw_altitude: f64,
}

/// Which slots a message updated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Barometer,
    BarometerTemperatureOnly,
    Gps,
    Imu,
    RotationRate,
    Voltage,
    FlightStatus,
}

impl TelemetryState {
    pub fn new(team_id: u16) -> Self {
        let mut state = ArrayString::new();
        state.push_str(INITIAL_FLIGHT_STATE);
        Self {
            team_id,
            clock: ClockOffset::zero(),
            packet_count: 0,
            telemetry_enabled: true,
            mode: TelemetryMode::Flight,
            state,
            altitude: 0.0,
            temperature: 0.0,
            pressure_hpa: 0.0,
            voltage: 0.0,
            gyro: Triple::default(),
            accel: Triple::default(),
            mag_ut: Triple::default(),
            rot_rate: 0.0,
            gps: GpsFix::default(),
            cmd_echo: String::new(),
            filtered: Triple::default(),
            sim_zero_offset: 0.0,
            sim_raw_altitude: 0.0,
        }
    }

    /// `CX ON` resumes counting and transmitting; `CX OFF` stops and resets the counter.
    pub fn set_telemetry_enabled(&mut self, enabled: bool) {
        self.telemetry_enabled = enabled;
        if !enabled {
            self.packet_count = 0;
        }
    }

    /// Apply one inbound sensor message. The whole payload is validated before any
    /// slot is touched.
    pub fn apply(&mut self, msg: &Message) -> Result<Applied, TelemetryError> {
        match (msg.sender, msg.kind) {
            (AgentId::Barometer, MessageKind::BARO_DATA) => {
                let [pressure, temperature, altitude] =
                    parse_numbers::<BARO_FIELDS>(msg.kind, &msg.payload)?;
                self.temperature = temperature;
                // Pressure and altitude are driven by SIMP in simulation mode
                if self.mode == TelemetryMode::Flight {
                    self.pressure_hpa = pressure;
                    self.altitude = altitude;
                    Ok(Applied::Barometer)
                } else {
                    Ok(Applied::BarometerTemperatureOnly)
                }
            }
            (AgentId::Gps, MessageKind::GPS_DATA) => {
                let fields = split_exact::<GPS_FIELDS>(msg.kind, &msg.payload)?;
                if parse_hms(fields[0]).is_none() {
                    return Err(TelemetryError::BadField {
                        kind: msg.kind,
                        index: 0,
                        value: fields[0].to_string(),
                    });
                }
                let mut numbers = [0.0; GPS_FIELDS - 1];
                for (i, field) in fields[1..].iter().enumerate() {
                    numbers[i] = parse_number(msg.kind, i + 1, field)?;
                }
                self.gps = GpsFix {
                    time: fields[0].to_string(),
                    altitude: numbers[0],
                    latitude: numbers[1],
                    longitude: numbers[2],
                    satellites: numbers[3],
                };
                Ok(Applied::Gps)
            }
            (AgentId::Imu, MessageKind::IMU_DATA) => {
                let values = parse_numbers::<IMU_FIELDS>(msg.kind, &msg.payload)?;
                self.gyro = Triple::from_slice(&values[0..3]);
                self.accel = Triple::from_slice(&values[3..6]);
                self.mag_ut = Triple::from_slice(&values[6..9]);
                self.filtered = Triple::from_slice(&values[9..12]);
                Ok(Applied::Imu)
            }
            (AgentId::Imu, MessageKind::ROT_RATE) => {
                let [rate] = parse_numbers::<1>(msg.kind, &msg.payload)?;
                self.rot_rate = rate;
                Ok(Applied::RotationRate)
            }
            (AgentId::Housekeeping, MessageKind::VOLTAGE) => {
                let [volts] = parse_numbers::<1>(msg.kind, &msg.payload)?;
                self.voltage = volts;
                Ok(Applied::Voltage)
            }
            (AgentId::FlightLogic, MessageKind::FLIGHT_STATUS) => {
                let [label, mode] = split_exact::<2>(msg.kind, &msg.payload)?;
                let mut state = ArrayString::<MAX_STATE_LABEL>::new();
                if label.is_empty() || state.try_push_str(label).is_err() {
                    return Err(TelemetryError::BadField {
                        kind: msg.kind,
                        index: 0,
                        value: label.to_string(),
                    });
                }
                let mode = TelemetryMode::from_code(mode).ok_or_else(|| TelemetryError::BadField {
                    kind: msg.kind,
                    index: 1,
                    value: mode.to_string(),
                })?;
                self.state = state;
                self.mode = mode;
                Ok(Applied::FlightStatus)
            }
            (sender, kind) => Err(TelemetryError::UnexpectedKind { sender, kind }),
        }
    }

    /// Serialize the full fixed-field line, newline terminated.
    pub fn downlink_line(&self, now: u32) -> String {
        format!(
            "{},{},{},{},{},{:.2},{:.2},{:.2},{:.2},{:.4},{:.4},{:.4},{:.4},{:.4},{:.4},{:.4},{:.4},{:.4},{:.2},{},{:.2},{:.2},{:.2},{:.2},{},{:.4},{:.4},{:.4}\n",
            self.team_id,
            format_hms(self.clock.mission_time(now)),
            self.packet_count,
            self.mode.code(),
            self.state,
            self.altitude,
            self.temperature,
            self.pressure_hpa * HPA_TO_KPA,
            self.voltage,
            self.gyro.roll,
            self.gyro.pitch,
            self.gyro.yaw,
            self.accel.roll,
            self.accel.pitch,
            self.accel.yaw,
            self.mag_ut.roll * MICROTESLA_TO_GAUSS,
            self.mag_ut.pitch * MICROTESLA_TO_GAUSS,
            self.mag_ut.yaw * MICROTESLA_TO_GAUSS,
            self.rot_rate,
            self.gps.time,
            self.gps.altitude,
            self.gps.latitude,
            self.gps.longitude,
            self.gps.satellites,
            self.cmd_echo,
            self.filtered.roll,
            self.filtered.pitch,
            self.filtered.yaw,
        )
    }

    /// One downlink period: bump the counter and serialize, or `None` while `CX` is off.
    pub fn next_packet(&mut self, now: u32) -> Option<String> {
        if !self.telemetry_enabled {
            return None;
        }
        self.packet_count = self.packet_count.wrapping_add(1);
        Some(self.downlink_line(now))
    }
}

fn split_exact<const N: usize>(
    kind: MessageKind,
    payload: &str,
) -> Result<[&str; N], TelemetryError> {
    let found = payload.split(FIELD_DELIMITER).count();
    if found != N {
        return Err(TelemetryError::FieldCount {
            kind,
            expected: N,
            found,
        });
    }
    let mut out = [""; N];
    for (slot, field) in out.iter_mut().zip(payload.split(FIELD_DELIMITER)) {
        *slot = field.trim();
    }
    Ok(out)
}

fn parse_number(kind: MessageKind, index: usize, field: &str) -> Result<f64, TelemetryError> {
    field
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| TelemetryError::BadNumber {
            kind,
            index,
            value: field.to_string(),
        })
}

fn parse_numbers<const N: usize>(
    kind: MessageKind,
    payload: &str,
) -> Result<[f64; N], TelemetryError> {
    let fields = split_exact::<N>(kind, payload)?;
    let mut out = [0.0; N];
    for (i, field) in fields.iter().enumerate() {
        out[i] = parse_number(kind, i, field)?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sea_level_altitude_is_zero() {
        assert!(pressure_to_altitude(1013.25).abs() < 1e-9);
        assert!(pressure_to_altitude(900.0) > 900.0);
    }

    #[test]
    fn test_hms_parsing() {
        assert_eq!(parse_hms("00:00:00"), Some(0));
        assert_eq!(parse_hms("13:05:09"), Some(13 * 3600 + 5 * 60 + 9));
        assert_eq!(parse_hms("1:05:09"), None);
        assert_eq!(parse_hms("13:05"), None);
        assert_eq!(parse_hms("13:05:09:01"), None);
        assert_eq!(format_hms(13 * 3600 + 5 * 60 + 9), "13:05:09");
    }

    #[test]
    fn test_clock_offset_wraps_midnight() {
        let offset = ClockOffset::from_target(60, 86_340);
        assert_eq!(offset.mission_time(60), 86_340);
        assert_eq!(offset.mission_time(120), 0);
        assert_eq!(ClockOffset::zero().mission_time(4000), 4000);
    }

    #[test]
    fn test_counter_stops_while_disabled() {
        let mut state = TelemetryState::new(1000);
        assert!(state.next_packet(0).is_some());
        assert_eq!(state.packet_count, 1);
        state.set_telemetry_enabled(false);
        assert_eq!(state.packet_count, 0);
        assert!(state.next_packet(1).is_none());
        state.set_telemetry_enabled(true);
        assert!(state.next_packet(2).is_some());
        assert_eq!(state.packet_count, 1);
    }

    #[test]
    fn test_bad_number_leaves_state_untouched() {
        let mut state = TelemetryState::new(1000);
        let before = state.clone();
        let msg = Message::new(
            AgentId::Imu,
            AgentId::Comm,
            MessageKind::IMU_DATA,
            "1,2,3,4,5,6,7,8,9,10,11,nan-ish",
        );
        assert!(matches!(
            state.apply(&msg),
            Err(TelemetryError::BadNumber { index: 11, .. })
        ));
        assert_eq!(state, before);
    }
}
