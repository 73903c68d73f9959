//! Uplink command protocol.
//!
//! Lines have the form `CMD,<team_id>,<VERB>[,<OPTION>]`. Each line is matched against
//! a static grammar table in priority order; a match must consume every field of the
//! line (full-match semantics), otherwise the line is invalid.

use crate::agents::{AgentId, MessageKind};
use crate::error::ProtocolError;
use crate::message::{Message, FIELD_DELIMITER};
use crate::telemetry::{format_hms, parse_hms, pressure_to_altitude, TelemetryMode, TelemetryState};
use serde::{Deserialize, Serialize};

pub const COMMAND_PREFIX: &str = "CMD";
const MAX_COMMAND_FIELDS: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verb {
    Cx,
    St,
    Sim,
    Simp,
    Cal,
    Mec,
    Cam,
    Ss,
    Rbt,
}

/// Accepted shape of the option field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionPattern {
    /// No option field at all.
    None,
    OneOf(&'static [&'static str]),
    /// ASCII digits only, length within `min..=max`.
    Digits { min: usize, max: usize },
    /// `HH:MM:SS` or the literal `GPS`.
    TimeOrGps,
}

impl OptionPattern {
    fn matches(&self, option: Option<&str>) -> bool {
        match (self, option) {
            (OptionPattern::None, None) => true,
            (OptionPattern::OneOf(choices), Some(opt)) => choices.contains(&opt),
            (OptionPattern::Digits { min, max }, Some(opt)) => {
                (*min..=*max).contains(&opt.len()) && opt.bytes().all(|b| b.is_ascii_digit())
            }
            (OptionPattern::TimeOrGps, Some(opt)) => opt == "GPS" || is_hms_shape(opt),
            _ => false,
        }
    }
}

fn is_hms_shape(text: &str) -> bool {
    let bytes = text.as_bytes();
    bytes.len() == 8
        && bytes[2] == b':'
        && bytes[5] == b':'
        && [0, 1, 3, 4, 6, 7].iter().all(|&i| bytes[i].is_ascii_digit())
}

#[derive(Debug, Clone, Copy)]
pub struct GrammarEntry {
    pub verb: Verb,
    /// Fields following the team id, verb first.
    pub header: &'static [&'static str],
    pub option: OptionPattern,
    pub owner: AgentId,
    pub kind: MessageKind,
}

const ON_OFF: &[&str] = &["ON", "OFF"];

/// Grammar table in verb-priority order.
pub static GRAMMAR: [GrammarEntry; 9] = [
    GrammarEntry {
        verb: Verb::Cx,
        header: &["CX"],
        option: OptionPattern::OneOf(ON_OFF),
        owner: AgentId::Housekeeping,
        kind: MessageKind::CMD_CX,
    },
    GrammarEntry {
        verb: Verb::St,
        header: &["ST"],
        option: OptionPattern::TimeOrGps,
        owner: AgentId::Housekeeping,
        kind: MessageKind::CMD_ST,
    },
    GrammarEntry {
        verb: Verb::Simp,
        header: &["SIMP"],
        option: OptionPattern::Digits { min: 5, max: 6 },
        owner: AgentId::FlightLogic,
        kind: MessageKind::CMD_SIMP,
    },
    GrammarEntry {
        verb: Verb::Sim,
        header: &["SIM"],
        option: OptionPattern::OneOf(&["ENABLE", "ACTIVATE", "DISABLE"]),
        owner: AgentId::FlightLogic,
        kind: MessageKind::CMD_SIM,
    },
    GrammarEntry {
        verb: Verb::Cal,
        header: &["CAL"],
        option: OptionPattern::None,
        owner: AgentId::Barometer,
        kind: MessageKind::CMD_CAL,
    },
    GrammarEntry {
        verb: Verb::Mec,
        header: &["MEC", "MOTOR"],
        option: OptionPattern::OneOf(ON_OFF),
        owner: AgentId::Motor,
        kind: MessageKind::CMD_MEC,
    },
    GrammarEntry {
        verb: Verb::Cam,
        header: &["CAM"],
        option: OptionPattern::OneOf(ON_OFF),
        owner: AgentId::Camera,
        kind: MessageKind::CMD_CAM,
    },
    GrammarEntry {
        verb: Verb::Ss,
        header: &["SS"],
        option: OptionPattern::Digits { min: 1, max: 1 },
        owner: AgentId::FlightLogic,
        kind: MessageKind::CMD_SS,
    },
    GrammarEntry {
        verb: Verb::Rbt,
        header: &["RBT"],
        option: OptionPattern::None,
        owner: AgentId::Housekeeping,
        kind: MessageKind::CMD_RBT,
    },
];

/// A line that matched a grammar entry.
#[derive(Debug, Clone, Copy)]
pub struct UplinkCommand<'a> {
    pub entry: &'static GrammarEntry,
    /// Empty when the verb takes no option.
    pub option: &'a str,
}

#[derive(Debug, Clone)]
pub struct CommandEngine {
    team: String,
}

impl CommandEngine {
    pub fn new(team_id: u16) -> Self {
        Self {
            team: team_id.to_string(),
        }
    }

    pub fn team(&self) -> &str {
        &self.team
    }

    /// Validate a line against the grammar.
    pub fn parse<'a>(&self, line: &'a str) -> Result<UplinkCommand<'a>, ProtocolError> {
        let line = line.trim_end_matches(['\n', '\r']);
        let mut fields: heapless::Vec<&str, MAX_COMMAND_FIELDS> = heapless::Vec::new();
        for field in line.split(FIELD_DELIMITER) {
            if fields.push(field).is_err() {
                return Err(ProtocolError::InvalidCommand(line.to_string()));
            }
        }

        if fields.len() < 3 || fields[0] != COMMAND_PREFIX {
            return Err(ProtocolError::InvalidCommand(line.to_string()));
        }
        if fields[1] != self.team {
            return Err(ProtocolError::ForeignTeam {
                expected: self.team.clone(),
                found: fields[1].to_string(),
            });
        }

        let rest = &fields[2..];
        for entry in GRAMMAR.iter() {
            let header_len = entry.header.len();
            if rest.len() < header_len || rest[..header_len] != *entry.header {
                continue;
            }
            let option = match &rest[header_len..] {
                [] => None,
                [opt] => Some(*opt),
                _ => continue,
            };
            if entry.option.matches(option) {
                return Ok(UplinkCommand {
                    entry,
                    option: option.unwrap_or(""),
                });
            }
        }

        Err(ProtocolError::InvalidCommand(line.to_string()))
    }

    /// Run one uplink line through the engine.
    ///
    /// On a match the `cmd_echo` slot is overwritten, any Comm-local effect is applied
    /// to `state`, and exactly one routed message is returned. On a mismatch `state`
    /// is left untouched.
    pub fn handle_line(
        &self,
        line: &str,
        state: &mut TelemetryState,
        now: u32,
    ) -> Result<Message, ProtocolError> {
        let command = self.parse(line)?;
        let entry = command.entry;
        let option = command.option;

        state.cmd_echo = echo_text(line);

        let mut receiver = entry.owner;
        let payload = match entry.verb {
            Verb::Cx => {
                state.set_telemetry_enabled(option == "ON");
                option.to_string()
            }
            Verb::St => {
                let target = if option == "GPS" {
                    parse_hms(&state.gps.time).unwrap_or_default()
                } else {
                    parse_hms(option).unwrap_or_default()
                };
                state.clock = crate::telemetry::ClockOffset::from_target(now, target);
                format_hms(target)
            }
            Verb::Simp => {
                // Option is 5-6 digits, so this parse cannot fail
                let raw: f64 = option.parse().unwrap_or_default();
                let pressure_hpa = raw / 100.0;
                let raw_altitude = pressure_to_altitude(pressure_hpa);
                let altitude = raw_altitude - state.sim_zero_offset;
                state.sim_raw_altitude = raw_altitude;
                state.pressure_hpa = pressure_hpa;
                state.altitude = altitude;
                format!("{altitude:.2}")
            }
            Verb::Cal => {
                if state.mode == TelemetryMode::Simulation {
                    state.sim_zero_offset = state.sim_raw_altitude;
                    state.altitude = 0.0;
                    receiver = AgentId::FlightLogic;
                }
                String::new()
            }
            Verb::Sim | Verb::Mec | Verb::Cam | Verb::Ss | Verb::Rbt => option.to_string(),
        };

        Ok(Message::new(AgentId::Comm, receiver, entry.kind, payload))
    }
}

/// Command text after the team id with delimiters removed, e.g. `CXON`.
pub fn echo_text(line: &str) -> String {
    let line = line.trim_end_matches(['\n', '\r']);
    line.splitn(3, FIELD_DELIMITER)
        .nth(2)
        .unwrap_or_default()
        .replace(FIELD_DELIMITER, "")
}
