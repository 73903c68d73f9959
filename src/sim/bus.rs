use super::Lcg;
use crate::bus_health::BusInterconnect;
use crate::config::BusHealthConfig;
use crate::error::BusError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BusFaultStats {
    pub scans: u64,
    pub dropouts_injected: u32,
    pub dropouts_recovered: u32,
    pub resets: u32,
}

/// Shared sensor bus with probabilistic device dropouts. A dropped device misses scans
/// until its fault duration (in scans) elapses or the bus is reset.
#[derive(Debug)]
pub struct SimulatedBus {
    devices: BTreeSet<u8>,
    /// Address -> remaining scans; `None` means stuck until reset.
    dropped: BTreeMap<u8, Option<u32>>,
    rng: Lcg,
    fault_rate_percent: f32,
    min_fault_ticks: u32,
    max_fault_ticks: u32,
    stats: BusFaultStats,
}

impl SimulatedBus {
    pub fn new(devices: impl IntoIterator<Item = u8>) -> Self {
        Self {
            devices: devices.into_iter().collect(),
            dropped: BTreeMap::new(),
            rng: Lcg::default(),
            fault_rate_percent: 0.0,
            min_fault_ticks: 1,
            max_fault_ticks: 1,
            stats: BusFaultStats::default(),
        }
    }

    pub fn from_config(config: &BusHealthConfig) -> Self {
        let mut bus = Self::new(config.devices.iter().copied());
        bus.fault_rate_percent = config.fault_rate_percent;
        bus.min_fault_ticks = config.min_fault_ticks;
        bus.max_fault_ticks = config.max_fault_ticks;
        bus
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Lcg::new(seed);
        self
    }

    /// Take a device off the bus for `scans` scans, or until reset with `None`.
    pub fn drop_device(&mut self, address: u8, scans: Option<u32>) {
        if self.devices.contains(&address) {
            self.dropped.insert(address, scans);
        }
    }

    pub fn restore_device(&mut self, address: u8) {
        self.dropped.remove(&address);
    }

    pub fn stats(&self) -> &BusFaultStats {
        &self.stats
    }

    fn responding(&self, address: u8) -> bool {
        self.devices.contains(&address) && !self.dropped.contains_key(&address)
    }

    fn advance_faults(&mut self) {
        let mut recovered = 0;
        self.dropped.retain(|_, remaining| match remaining {
            Some(0) => {
                recovered += 1;
                false
            }
            Some(n) => {
                *n -= 1;
                true
            }
            None => true,
        });
        self.stats.dropouts_recovered += recovered;

        if self.fault_rate_percent <= 0.0 {
            return;
        }
        let candidates: Vec<u8> = self
            .devices
            .iter()
            .copied()
            .filter(|a| !self.dropped.contains_key(a))
            .collect();
        for address in candidates {
            if self.rng.chance(self.fault_rate_percent) {
                let scans = self.rng.range(self.min_fault_ticks, self.max_fault_ticks);
                debug!(address, scans, "injecting device dropout");
                self.dropped.insert(address, Some(scans));
                self.stats.dropouts_injected += 1;
            }
        }
    }
}

impl BusInterconnect for SimulatedBus {
    fn scan(&mut self) -> Result<BTreeSet<u8>, BusError> {
        self.stats.scans += 1;
        self.advance_faults();
        Ok(self
            .devices
            .iter()
            .copied()
            .filter(|a| self.responding(*a))
            .collect())
    }

    fn probe(&mut self, address: u8) -> bool {
        self.responding(address)
    }

    fn reset(&mut self) -> Result<(), BusError> {
        self.stats.resets += 1;
        self.stats.dropouts_recovered += self.dropped.len() as u32;
        self.dropped.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timed_dropout_recovers() {
        let mut bus = SimulatedBus::new([0x10, 0x20]);
        bus.drop_device(0x10, Some(1));
        assert_eq!(bus.scan().unwrap(), BTreeSet::from([0x20]));
        assert_eq!(bus.scan().unwrap(), BTreeSet::from([0x20]));
        assert_eq!(bus.scan().unwrap(), BTreeSet::from([0x10, 0x20]));
        assert_eq!(bus.stats().dropouts_recovered, 1);
    }

    #[test]
    fn test_reset_clears_stuck_devices() {
        let mut bus = SimulatedBus::new([0x10]);
        bus.drop_device(0x10, None);
        assert!(bus.scan().unwrap().is_empty());
        assert!(!bus.probe(0x10));
        bus.reset().unwrap();
        assert!(bus.probe(0x10));
        assert_eq!(bus.stats().resets, 1);
    }

    #[test]
    fn test_fault_injection_is_reproducible() {
        let config = BusHealthConfig {
            fault_rate_percent: 30.0,
            ..BusHealthConfig::default()
        };
        let mut a = SimulatedBus::from_config(&config).with_seed(99);
        let mut b = SimulatedBus::from_config(&config).with_seed(99);
        for _ in 0..20 {
            assert_eq!(a.scan().unwrap(), b.scan().unwrap());
        }
        assert!(a.stats().dropouts_injected > 0);
    }
}
