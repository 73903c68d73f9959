//! Simulated stand-ins for hardware the flight software talks to: the shared sensor
//! bus and the physical quantities the sensor agents report.

pub mod bus;
pub mod sensors;

pub use bus::{BusFaultStats, SimulatedBus};
pub use sensors::FlightProfile;

/// Linear congruential generator with a fixed default seed, so simulated faults are
/// reproducible run to run.
#[derive(Debug, Clone)]
pub struct Lcg {
    state: u64,
}

impl Default for Lcg {
    fn default() -> Self {
        Self::new(Self::DEFAULT_SEED)
    }
}

impl Lcg {
    pub const DEFAULT_SEED: u64 = 0x1234_5678_9ABC_DEF0;

    pub const fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    pub fn next_u64(&mut self) -> u64 {
        self.state = self
            .state
            .wrapping_mul(1_664_525)
            .wrapping_add(1_013_904_223);
        self.state
    }

    fn next_u32(&mut self) -> u32 {
        // High bits of an LCG are the well-distributed ones
        (self.next_u64() >> 32) as u32
    }

    /// Uniform in `[0, 1)`.
    pub fn next_f32(&mut self) -> f32 {
        (self.next_u32() >> 8) as f32 / (1u32 << 24) as f32
    }

    pub fn chance(&mut self, percent: f32) -> bool {
        self.next_f32() * 100.0 < percent
    }

    /// Uniform in `min..=max`.
    pub fn range(&mut self, min: u32, max: u32) -> u32 {
        if max <= min {
            return min;
        }
        min + self.next_u32() % (max - min + 1)
    }
}
