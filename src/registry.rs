//! Static agent table: which entry point hosts each agent and which message kinds it
//! accepts besides the control kinds.

use crate::agents::{AgentId, MessageKind};
use crate::worker::WorkerEntry;
use crate::{comm, subsystems};

#[derive(Debug, Clone, Copy)]
pub struct AgentEntry {
    pub agent: AgentId,
    pub entry: WorkerEntry,
    pub accepts: &'static [MessageKind],
}

impl AgentEntry {
    pub fn accepts(&self, kind: MessageKind) -> bool {
        kind.is_control() || self.accepts.contains(&kind)
    }
}

pub static STANDARD_AGENTS: [AgentEntry; 9] = [
    AgentEntry {
        agent: AgentId::Comm,
        entry: comm::entry,
        accepts: &[
            MessageKind::BARO_DATA,
            MessageKind::GPS_DATA,
            MessageKind::IMU_DATA,
            MessageKind::ROT_RATE,
            MessageKind::VOLTAGE,
            MessageKind::FLIGHT_STATUS,
        ],
    },
    AgentEntry {
        agent: AgentId::Housekeeping,
        entry: subsystems::housekeeping::entry,
        accepts: &[
            MessageKind::STATUS,
            MessageKind::CMD_CX,
            MessageKind::CMD_ST,
            MessageKind::CMD_RBT,
        ],
    },
    AgentEntry {
        agent: AgentId::Barometer,
        entry: subsystems::barometer::entry,
        accepts: &[MessageKind::CMD_CAL],
    },
    AgentEntry {
        agent: AgentId::Gps,
        entry: subsystems::gps::entry,
        accepts: &[],
    },
    AgentEntry {
        agent: AgentId::Imu,
        entry: subsystems::imu::entry,
        accepts: &[],
    },
    AgentEntry {
        agent: AgentId::FlightLogic,
        entry: subsystems::flight_logic::entry,
        accepts: &[
            MessageKind::ALTITUDE,
            MessageKind::CMD_SIM,
            MessageKind::CMD_SIMP,
            MessageKind::CMD_CAL,
            MessageKind::CMD_SS,
        ],
    },
    AgentEntry {
        agent: AgentId::Motor,
        entry: subsystems::actuators::motor_entry,
        accepts: &[MessageKind::CMD_MEC],
    },
    AgentEntry {
        agent: AgentId::Camera,
        entry: subsystems::actuators::camera_entry,
        accepts: &[MessageKind::CMD_CAM],
    },
    AgentEntry {
        agent: AgentId::Thermal,
        entry: subsystems::thermal::entry,
        accepts: &[],
    },
];

/// Set of agents a supervisor can launch.
#[derive(Debug, Clone)]
pub struct Registry {
    entries: Vec<AgentEntry>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::standard()
    }
}

impl Registry {
    pub fn standard() -> Self {
        Self {
            entries: STANDARD_AGENTS.to_vec(),
        }
    }

    /// Registry with some entries replaced or added.
    pub fn with_entries(entries: impl IntoIterator<Item = AgentEntry>) -> Self {
        let mut registry = Self::standard();
        for entry in entries {
            registry.insert(entry);
        }
        registry
    }

    pub fn insert(&mut self, entry: AgentEntry) {
        match self.entries.iter_mut().find(|e| e.agent == entry.agent) {
            Some(slot) => *slot = entry,
            None => self.entries.push(entry),
        }
    }

    pub fn lookup(&self, agent: AgentId) -> Option<&AgentEntry> {
        self.entries.iter().find(|e| e.agent == agent)
    }
}

/// Entry point for a worker process launched as `worker --agent <name>`.
pub fn lookup(agent: AgentId) -> Option<&'static AgentEntry> {
    STANDARD_AGENTS.iter().find(|e| e.agent == agent)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_worker_is_registered_once() {
        for agent in AgentId::workers() {
            assert_eq!(
                STANDARD_AGENTS.iter().filter(|e| e.agent == agent).count(),
                1,
                "{agent}"
            );
        }
        assert!(lookup(AgentId::Supervisor).is_none());
    }

    #[test]
    fn test_command_owners_accept_their_kinds() {
        for entry in crate::protocol::GRAMMAR.iter() {
            let owner = lookup(entry.owner).unwrap();
            assert!(owner.accepts(entry.kind), "{} rejects {}", entry.owner, entry.kind);
        }
        // CAL is re-routed to flight logic in simulation mode
        assert!(lookup(AgentId::FlightLogic)
            .unwrap()
            .accepts(MessageKind::CMD_CAL));
    }

    #[test]
    fn test_control_kinds_always_accepted() {
        let gps = lookup(AgentId::Gps).unwrap();
        assert!(gps.accepts(MessageKind::TERMINATE));
        assert!(gps.accepts(MessageKind::HEARTBEAT));
        assert!(!gps.accepts(MessageKind::CMD_CAM));
    }
}
