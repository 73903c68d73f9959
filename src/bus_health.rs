//! Bus health monitor for the shared sensor interconnect.
//!
//! Each tick scans the bus, accounts consecutive errors per device, and derives an
//! aggregate status. Entering aggregate `Error` resets the bus once per episode and
//! forces a rediscovery. The monitor owns its [`BusInterconnect`], so nothing else can
//! reset the bus while it runs.

use crate::config::BusHealthConfig;
use crate::error::BusError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Scan, probe, and reset primitives of the hardware bus.
pub trait BusInterconnect: Send {
    /// Addresses that answered the scan.
    fn scan(&mut self) -> Result<BTreeSet<u8>, BusError>;
    fn probe(&mut self, address: u8) -> bool;
    /// Reload the bus driver.
    fn reset(&mut self) -> Result<(), BusError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DeviceStatus {
    Normal,
    Degraded,
    Error,
    Offline,
}

impl DeviceStatus {
    pub fn is_error(self) -> bool {
        matches!(self, DeviceStatus::Error | DeviceStatus::Offline)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BusStatus {
    Normal,
    Degraded,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthThresholds {
    pub error: u32,
    pub offline: u32,
}

impl HealthThresholds {
    pub fn status_for(&self, consecutive_errors: u32) -> DeviceStatus {
        match consecutive_errors {
            0 => DeviceStatus::Normal,
            n if n < self.error => DeviceStatus::Degraded,
            n if n < self.offline => DeviceStatus::Error,
            _ => DeviceStatus::Offline,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeviceHealthRecord {
    pub address: u8,
    pub last_seen: Option<Instant>,
    pub consecutive_errors: u32,
    pub status: DeviceStatus,
}

impl DeviceHealthRecord {
    fn discovered(address: u8, now: Instant) -> Self {
        Self {
            address,
            last_seen: Some(now),
            consecutive_errors: 0,
            status: DeviceStatus::Normal,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BusHealthStats {
    pub ticks: u64,
    pub scan_failures: u32,
    pub resets: u32,
    pub reset_failures: u32,
}

/// Result of one monitor tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickOutcome {
    pub status: BusStatus,
    pub reset_performed: bool,
}

pub struct BusHealthMonitor<B: BusInterconnect> {
    bus: B,
    thresholds: HealthThresholds,
    stabilization_delay: Duration,
    records: BTreeMap<u8, DeviceHealthRecord>,
    in_error_episode: bool,
    stats: BusHealthStats,
}

impl<B: BusInterconnect> BusHealthMonitor<B> {
    pub fn new(bus: B, config: &BusHealthConfig) -> Self {
        Self {
            bus,
            thresholds: HealthThresholds {
                error: config.error_threshold,
                offline: config.offline_threshold,
            },
            stabilization_delay: Duration::from_millis(config.stabilization_delay_ms),
            records: BTreeMap::new(),
            in_error_episode: false,
            stats: BusHealthStats::default(),
        }
    }

    pub fn record(&self, address: u8) -> Option<&DeviceHealthRecord> {
        self.records.get(&address)
    }

    pub fn records(&self) -> impl Iterator<Item = &DeviceHealthRecord> {
        self.records.values()
    }

    pub fn stats(&self) -> &BusHealthStats {
        &self.stats
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    /// Aggregate over all records: `Normal` with no device in error, `Degraded` while
    /// fewer than half are, else `Error`.
    pub fn status(&self) -> BusStatus {
        let total = self.records.len();
        let in_error = self.records.values().filter(|r| r.status.is_error()).count();
        if in_error == 0 {
            BusStatus::Normal
        } else if in_error * 2 < total {
            BusStatus::Degraded
        } else {
            BusStatus::Error
        }
    }

    /// Scan once and update every record.
    pub fn check(&mut self) -> BusStatus {
        let now = Instant::now();
        self.stats.ticks += 1;
        let found = match self.bus.scan() {
            Ok(found) => found,
            Err(e) => {
                warn!(error = %e, "bus scan failed, counting every device as missed");
                self.stats.scan_failures += 1;
                BTreeSet::new()
            }
        };

        for (address, record) in self.records.iter_mut() {
            let before = record.status;
            if found.contains(address) && self.bus.probe(*address) {
                record.consecutive_errors = 0;
                record.last_seen = Some(now);
            } else {
                record.consecutive_errors = record.consecutive_errors.saturating_add(1);
            }
            record.status = self.thresholds.status_for(record.consecutive_errors);
            if record.status != before {
                if record.status > before {
                    warn!(address = *address, from = ?before, to = ?record.status, errors = record.consecutive_errors, "device health degraded");
                } else {
                    info!(address = *address, from = ?before, "device recovered");
                }
            }
        }

        for address in found {
            self.records.entry(address).or_insert_with(|| {
                info!(address, "device discovered");
                DeviceHealthRecord::discovered(address, now)
            });
        }

        self.status()
    }

    /// One monitor period: check, and reset the bus on entering an error episode.
    pub async fn tick(&mut self) -> TickOutcome {
        let status = self.check();
        if status != BusStatus::Error {
            if self.in_error_episode {
                info!(?status, "bus error episode over");
            }
            self.in_error_episode = false;
            return TickOutcome {
                status,
                reset_performed: false,
            };
        }
        if self.in_error_episode {
            debug!("bus still in error, reset already attempted this episode");
            return TickOutcome {
                status,
                reset_performed: false,
            };
        }

        self.in_error_episode = true;
        if let Err(e) = self.recover().await {
            error!(error = %e, "bus recovery failed");
        }
        TickOutcome {
            status: self.status(),
            reset_performed: true,
        }
    }

    /// Reset the driver, forget every record, wait for the bus to settle, rescan.
    pub async fn recover(&mut self) -> Result<(), BusError> {
        warn!(devices = self.records.len(), "bus in error, resetting interconnect");
        self.stats.resets += 1;
        let reset = self.bus.reset();
        if reset.is_err() {
            self.stats.reset_failures += 1;
        }
        self.records.clear();
        tokio::time::sleep(self.stabilization_delay).await;

        let now = Instant::now();
        let found = self.bus.scan()?;
        for address in found {
            self.records
                .insert(address, DeviceHealthRecord::discovered(address, now));
        }
        info!(devices = self.records.len(), "bus rediscovery complete");
        reset
    }

    pub async fn run(mut self, interval: Duration, cancel: CancellationToken) -> BusHealthStats {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let outcome = self.tick().await;
                    debug!(status = ?outcome.status, reset = outcome.reset_performed, "bus health tick");
                }
            }
        }
        self.stats
    }
}
