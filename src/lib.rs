//! # CanSat Flight Software Core
//!
//! Supervisor, message router and subsystem agents for a CanSat probe.
//!
//! ## Features
//!
//! - **Process supervision**: every subsystem runs as its own worker (a child process
//!   or a task), started with a fixed spawn delay and torn down with escalation
//! - **Message routing**: one shared inbound queue, one receive-pipe per worker, text
//!   messages `sender,receiver,kind,payload`
//! - **Uplink commands**: `CMD,<team>,<verb>[,<option>]` grammar with telemetry echo
//! - **Telemetry downlink**: one 28-field CSV line per second while enabled
//! - **Flight logic**: debounced launch/apogee/release/landing detection, with
//!   simulated-pressure mode driven from the ground
//! - **Bus health**: sensor-bus device tracking with one driver reset per fault episode
//!
//! ## Quick Start
//!
//! ```no_run
//! use cansat_fsw::{FswConfig, Lifecycle, Supervisor};
//!
//! # async fn demo() {
//! let lifecycle = Lifecycle::new();
//! let mut supervisor = Supervisor::new(FswConfig::default(), lifecycle.clone());
//! supervisor.start().await;
//! let report = supervisor.run().await;
//! println!("stopped after {} ms", report.elapsed_ms);
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`supervisor`] - worker spawning, routing and shutdown
//! - [`worker`] - the runtime every agent runs inside
//! - [`subsystems`] and [`comm`] - the agents themselves
//! - [`protocol`] - uplink command grammar
//! - [`telemetry`] - downlink packet state
//! - [`bus_health`] - sensor-bus monitor

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

pub mod agents;
pub mod bus_health;
pub mod comm;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod link;
pub mod message;
pub mod protocol;
pub mod registry;
pub mod sim;
pub mod subsystems;
pub mod supervisor;
pub mod telemetry;
pub mod worker;

pub use agents::{AgentId, MessageKind};
pub use config::{FswConfig, LaunchMode};
pub use error::{FswError, RouteError, WorkerError};
pub use lifecycle::{Lifecycle, TerminationCause};
pub use message::{pack, unpack, Message};
pub use protocol::CommandEngine;
pub use supervisor::{RouteOutcome, ShutdownReport, Supervisor};
pub use telemetry::TelemetryState;
