//! Deterministic physical model of one CanSat flight, sampled by the sensor agents.

use crate::telemetry::pressure_to_altitude;

const SEA_LEVEL_HPA: f64 = 1013.25;
const GROUND_TEMP_C: f64 = 22.0;
const LAPSE_RATE_C_PER_M: f64 = 0.0065;
const LAUNCH_SITE_LAT: f64 = 37.1952;
const LAUNCH_SITE_LON: f64 = -80.5784;
const BATTERY_FULL_V: f64 = 5.05;
const BATTERY_DRAIN_V_PER_S: f64 = 0.0004;

/// Altitude-over-time profile: hold on the pad, boost to apogee, then descend under
/// canopy at a constant rate.
#[derive(Debug, Clone, Copy)]
pub struct FlightProfile {
    pub pad_hold_s: f64,
    pub ascent_s: f64,
    pub apogee_m: f64,
    pub descent_rate_mps: f64,
}

impl Default for FlightProfile {
    fn default() -> Self {
        Self {
            pad_hold_s: 20.0,
            ascent_s: 8.0,
            apogee_m: 725.0,
            descent_rate_mps: 5.0,
        }
    }
}

impl FlightProfile {
    pub fn altitude_at(&self, t_s: f64) -> f64 {
        let t = t_s - self.pad_hold_s;
        if t <= 0.0 {
            return 0.0;
        }
        if t < self.ascent_s {
            // Decelerating climb that reaches apogee with zero vertical speed
            let x = t / self.ascent_s;
            return self.apogee_m * (2.0 * x - x * x);
        }
        let fallen = (t - self.ascent_s) * self.descent_rate_mps;
        (self.apogee_m - fallen).max(0.0)
    }

    /// Vertical speed in m/s, positive up.
    pub fn vertical_speed_at(&self, t_s: f64) -> f64 {
        (self.altitude_at(t_s + 0.5) - self.altitude_at(t_s - 0.5)).clamp(-200.0, 200.0)
    }

    pub fn landed_at(&self) -> f64 {
        self.pad_hold_s + self.ascent_s + self.apogee_m / self.descent_rate_mps
    }
}

/// Pressure in hPa at `altitude_m`; inverse of [`pressure_to_altitude`].
pub fn pressure_at_altitude(altitude_m: f64) -> f64 {
    let ratio = (1.0 - altitude_m / 44307.7).max(0.0);
    SEA_LEVEL_HPA * ratio.powf(1.0 / 0.190284)
}

/// `(pressure_hpa, temperature_c, altitude_m)` as a barometer would report them,
/// with altitude relative to `ground_m`.
pub fn barometer_sample(profile: &FlightProfile, t_s: f64, ground_m: f64) -> (f64, f64, f64) {
    let altitude = profile.altitude_at(t_s);
    let pressure = pressure_at_altitude(altitude) + 0.05 * (t_s * 1.7).sin();
    let temperature = GROUND_TEMP_C - LAPSE_RATE_C_PER_M * altitude + 0.2 * (t_s * 0.3).sin();
    (pressure, temperature, pressure_to_altitude(pressure) - ground_m)
}

/// `(altitude, latitude, longitude, satellites)`.
pub fn gps_sample(profile: &FlightProfile, t_s: f64) -> (f64, f64, f64, f64) {
    let altitude = profile.altitude_at(t_s) + 2.0 * (t_s * 0.9).sin();
    let drift = (t_s - profile.pad_hold_s).max(0.0) * 0.00002;
    let satellites = if t_s < 5.0 { 4.0 } else { 9.0 + (t_s * 0.1).sin().round() };
    (altitude, LAUNCH_SITE_LAT + drift, LAUNCH_SITE_LON + drift * 0.6, satellites)
}

/// Gyro (deg/s), accelerometer (deg), magnetometer (µT) and filtered attitude (deg),
/// each as roll, pitch, yaw.
pub fn imu_sample(profile: &FlightProfile, t_s: f64) -> [f64; 12] {
    let descending = t_s > profile.pad_hold_s + profile.ascent_s && t_s < profile.landed_at();
    let spin = if descending { 120.0 } else { 0.5 };
    let gyro = [
        2.0 * (t_s * 1.3).sin(),
        1.5 * (t_s * 0.7).cos(),
        spin + (t_s * 2.1).sin(),
    ];
    let accel = [
        3.0 * (t_s * 0.5).sin(),
        2.0 * (t_s * 0.4).cos(),
        (spin * t_s) % 360.0,
    ];
    let heading = accel[2].to_radians();
    let mag = [
        22.0 * heading.cos(),
        22.0 * heading.sin(),
        -40.0 + (t_s * 0.2).sin(),
    ];
    let filtered = [accel[0] * 0.9, accel[1] * 0.9, accel[2]];
    [
        gyro[0], gyro[1], gyro[2], accel[0], accel[1], accel[2], mag[0], mag[1], mag[2],
        filtered[0], filtered[1], filtered[2],
    ]
}

/// Auto-gyro rotor rate in rpm; spinning only under canopy.
pub fn rotor_rate(profile: &FlightProfile, t_s: f64) -> f64 {
    let descending = t_s > profile.pad_hold_s + profile.ascent_s && t_s < profile.landed_at();
    if descending {
        1200.0 + 40.0 * (t_s * 0.8).sin()
    } else {
        0.0
    }
}

pub fn battery_voltage(t_s: f64) -> f64 {
    (BATTERY_FULL_V - BATTERY_DRAIN_V_PER_S * t_s).max(3.3)
}

/// Internal electronics temperature in °C.
pub fn board_temperature(t_s: f64) -> f64 {
    31.0 + 4.0 * (1.0 - (-t_s / 300.0).exp()) + 0.3 * (t_s * 0.05).sin()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_shape() {
        let profile = FlightProfile::default();
        assert_eq!(profile.altitude_at(0.0), 0.0);
        let apogee_t = profile.pad_hold_s + profile.ascent_s;
        assert!((profile.altitude_at(apogee_t) - profile.apogee_m).abs() < 1e-9);
        assert!(profile.vertical_speed_at(profile.pad_hold_s + 1.0) > 0.0);
        assert!(profile.vertical_speed_at(apogee_t + 10.0) < 0.0);
        assert_eq!(profile.altitude_at(profile.landed_at() + 1.0), 0.0);
    }

    #[test]
    fn test_pressure_inverts_altitude() {
        for altitude in [0.0, 100.0, 725.0] {
            let back = pressure_to_altitude(pressure_at_altitude(altitude));
            assert!((back - altitude).abs() < 1e-6);
        }
    }
}
