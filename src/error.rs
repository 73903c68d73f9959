use crate::agents::{AgentId, MessageKind};
use thiserror::Error;

/// Reasons a raw line is not a valid [`crate::message::Message`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("expected at least {expected} fields, found {found}")]
    TooFewFields { expected: usize, found: usize },
    #[error("non-numeric {field} field: {value:?}")]
    NonNumeric { field: &'static str, value: String },
    #[error("{field} id {id} is not a known agent")]
    UnknownAgent { field: &'static str, id: u32 },
}

/// Uplink lines that do not match the command grammar.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("invalid command: {0:?}")]
    InvalidCommand(String),
    #[error("command addressed to team {found}, not {expected}")]
    ForeignTeam { expected: String, found: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TelemetryError {
    #[error("{kind} payload needs {expected} fields, got {found}")]
    FieldCount {
        kind: MessageKind,
        expected: usize,
        found: usize,
    },
    #[error("{kind} field {index} is not a number: {value:?}")]
    BadNumber {
        kind: MessageKind,
        index: usize,
        value: String,
    },
    #[error("{kind} field {index} is not a valid value: {value:?}")]
    BadField {
        kind: MessageKind,
        index: usize,
        value: String,
    },
    #[error("no telemetry slot for {kind} from {sender}")]
    UnexpectedKind { sender: AgentId, kind: MessageKind },
}

/// Why the router dropped a message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteError {
    #[error("no worker registered for {0}")]
    UnknownReceiver(AgentId),
    #[error("worker {0} is not alive")]
    WorkerDead(AgentId),
    #[error("pipe to {0} is broken")]
    BrokenPipe(AgentId),
    #[error("pipe to {0} is full")]
    PipeFull(AgentId),
    #[error("{agent} does not accept {kind}")]
    UnsupportedKind { agent: AgentId, kind: MessageKind },
}

#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("no registry entry for {0}")]
    NotRegistered(AgentId),
    #[error("failed to launch {agent}: {source}")]
    Launch {
        agent: AgentId,
        #[source]
        source: std::io::Error,
    },
    #[error("{0} exited immediately after spawn")]
    DiedAtStartup(AgentId),
    #[error("failed to hand configuration to {agent}: {source}")]
    Config {
        agent: AgentId,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("bus scan failed: {0}")]
    ScanFailed(String),
    #[error("bus driver reset failed: {0}")]
    ResetFailed(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("no ground station is listening")]
    NoListener,
    #[error("link i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that end a worker's own process.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("worker i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("worker configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("fatal worker error: {0}")]
    Fatal(String),
}

/// Top-level error of the flight-software binary.
#[derive(Debug, Error)]
pub enum FswError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    #[error(transparent)]
    Worker(#[from] WorkerError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("flight software stopped on a fatal error")]
    Fatal,
}
