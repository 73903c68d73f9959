use cansat_fsw::bus_health::BusHealthMonitor;
use cansat_fsw::config::{FswConfig, LaunchMode};
use cansat_fsw::error::{FswError, SpawnError};
use cansat_fsw::lifecycle::{spawn_signal_listener, spawn_watchdog, Lifecycle, TerminationCause};
use cansat_fsw::sim::SimulatedBus;
use cansat_fsw::worker::run_worker_process;
use cansat_fsw::{registry, AgentId, Supervisor};
use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use std::path::Path;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let agent_names: Vec<&str> = AgentId::workers().map(AgentId::name).collect();
    let matches = App::new("cansat-fsw")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Space Systems Engineering Team")
        .about("CanSat flight software: supervisor, router and subsystem workers")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("JSON configuration file")
                .takes_value(true)
                .global(true),
        )
        .arg(
            Arg::with_name("log-level")
                .short("l")
                .long("log-level")
                .value_name("LEVEL")
                .help("Log level when RUST_LOG is unset")
                .takes_value(true)
                .possible_values(&["error", "warn", "info", "debug", "trace"])
                .global(true),
        )
        .subcommand(
            SubCommand::with_name("run")
                .about("Start the supervisor and every configured worker")
                .arg(
                    Arg::with_name("team")
                        .short("t")
                        .long("team")
                        .value_name("ID")
                        .help("Four-digit team id expected in uplink commands")
                        .takes_value(true)
                        .validator(|v| match v.parse::<u16>() {
                            Ok(id) if id <= 9999 => Ok(()),
                            _ => Err("Team id must be a number between 0 and 9999".into()),
                        }),
                )
                .arg(
                    Arg::with_name("mode")
                        .short("m")
                        .long("mode")
                        .value_name("MODE")
                        .help("Run workers as child processes or as tasks")
                        .takes_value(true)
                        .possible_values(&["process", "in-process"]),
                )
                .arg(
                    Arg::with_name("link")
                        .long("link")
                        .value_name("ADDR")
                        .help("Ground-link bind address")
                        .takes_value(true),
                )
                .arg(
                    Arg::with_name("max-runtime")
                        .long("max-runtime")
                        .value_name("SECONDS")
                        .help("Shut down automatically after this many seconds")
                        .takes_value(true)
                        .validator(|v| match v.parse::<u64>() {
                            Ok(s) if s > 0 => Ok(()),
                            _ => Err("Max runtime must be a positive number of seconds".into()),
                        }),
                )
                .arg(
                    Arg::with_name("telemetry-off")
                        .long("telemetry-off")
                        .help("Start with telemetry transmission disabled until CX ON"),
                )
                .arg(
                    Arg::with_name("no-bus-monitor")
                        .long("no-bus-monitor")
                        .help("Do not run the sensor-bus health monitor"),
                ),
        )
        .subcommand(
            SubCommand::with_name("config")
                .about("Print the effective configuration as JSON"),
        )
        .subcommand(
            SubCommand::with_name("worker")
                .setting(AppSettings::Hidden)
                .about("Run one agent as a worker process (started by the supervisor)")
                .arg(
                    Arg::with_name("agent")
                        .long("agent")
                        .value_name("NAME")
                        .takes_value(true)
                        .required(true)
                        .possible_values(&agent_names),
                ),
        )
        .get_matches();

    let code = match matches.subcommand() {
        ("worker", Some(sub)) => run_worker(&matches, sub).await,
        ("config", Some(sub)) => print_config(&matches, sub),
        ("run", Some(sub)) => match run_supervisor(&matches, sub).await {
            Ok(()) => 0,
            Err(e) => {
                eprintln!("cansat-fsw: {e}");
                1
            }
        },
        _ => 2,
    };

    std::process::exit(code);
}

/// Logs always go to stderr: in worker processes stdout is the message pipe.
fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Global flags may land on either side of the subcommand.
fn global_value<'a>(matches: &'a ArgMatches<'_>, sub: &'a ArgMatches<'_>, name: &str) -> Option<&'a str> {
    sub.value_of(name).or_else(|| matches.value_of(name))
}

fn load_config(matches: &ArgMatches<'_>, sub: &ArgMatches<'_>) -> Result<FswConfig, FswError> {
    let mut config = FswConfig::load(global_value(matches, sub, "config").map(Path::new))?;

    if let Some(level) = global_value(matches, sub, "log-level") {
        config.log_level = level.to_string();
    }
    if let Some(team) = sub.value_of("team").and_then(|v| v.parse().ok()) {
        config.team_id = team;
    }
    match sub.value_of("mode") {
        Some("process") => config.launch_mode = LaunchMode::Process,
        Some("in-process") => config.launch_mode = LaunchMode::InProcess,
        _ => {}
    }
    if let Some(link) = sub.value_of("link") {
        config.link_bind = link.to_string();
    }
    if let Some(secs) = sub.value_of("max-runtime").and_then(|v| v.parse().ok()) {
        config.max_runtime_s = Some(secs);
    }
    if sub.is_present("telemetry-off") {
        config.telemetry_on_start = false;
    }
    if sub.is_present("no-bus-monitor") {
        config.bus_health.enabled = false;
    }

    config.validate()?;
    Ok(config)
}

fn print_config(matches: &ArgMatches<'_>, sub: &ArgMatches<'_>) -> i32 {
    let config = match FswConfig::load(global_value(matches, sub, "config").map(Path::new)) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return 1;
        }
    };
    match serde_json::to_string_pretty(&config) {
        Ok(json) => {
            println!("{json}");
            0
        }
        Err(e) => {
            eprintln!("cannot serialize config: {e}");
            1
        }
    }
}

async fn run_supervisor(matches: &ArgMatches<'_>, sub: &ArgMatches<'_>) -> Result<(), FswError> {
    let config = load_config(matches, sub)?;
    init_tracing(&config.log_level);
    info!(
        team = config.team_id,
        mode = ?config.launch_mode,
        agents = config.agents.len(),
        link = %config.link_bind,
        "flight software starting"
    );

    let lifecycle = Lifecycle::new();
    let signals = spawn_signal_listener(lifecycle.clone());
    let watchdog = config
        .max_runtime()
        .map(|max_runtime| spawn_watchdog(lifecycle.clone(), max_runtime));

    let bus_monitor = config.bus_health.enabled.then(|| {
        let bus = SimulatedBus::from_config(&config.bus_health);
        let monitor = BusHealthMonitor::new(bus, &config.bus_health);
        let interval = Duration::from_millis(config.bus_health.interval_ms);
        tokio::spawn(monitor.run(interval, lifecycle.terminate_token()))
    });

    let mut supervisor = Supervisor::new(config, lifecycle.clone());
    supervisor.start().await;
    for (agent, reason) in supervisor.spawn_failures() {
        warn!(agent = %agent, reason = %reason, "running without agent");
    }

    let report = supervisor.run().await;
    info!(
        cause = ?lifecycle.cause(),
        graceful = ?report.graceful,
        signalled = ?report.signalled,
        killed = ?report.killed,
        "shutdown complete"
    );

    if let Some(handle) = bus_monitor {
        match handle.await {
            Ok(stats) => info!(
                ticks = stats.ticks,
                resets = stats.resets,
                "bus monitor stopped"
            ),
            Err(e) => warn!(error = %e, "bus monitor task failed"),
        }
    }
    if let Some(handle) = watchdog {
        handle.abort();
    }
    signals.abort();
    if lifecycle.cause() == Some(TerminationCause::Fatal) {
        return Err(FswError::Fatal);
    }
    Ok(())
}

async fn run_worker(matches: &ArgMatches<'_>, sub: &ArgMatches<'_>) -> i32 {
    let config = match FswConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            init_tracing("info");
            error!(error = %e, "worker configuration rejected");
            return 1;
        }
    };
    init_tracing(global_value(matches, sub, "log-level").unwrap_or(config.log_level.as_str()));

    let agent = match sub.value_of("agent").map(str::parse::<AgentId>) {
        Some(Ok(agent)) => agent,
        Some(Err(e)) => {
            error!(error = %e, "unknown worker agent");
            return 2;
        }
        None => return 2,
    };
    let Some(entry) = registry::lookup(agent) else {
        error!(error = %SpawnError::NotRegistered(agent), "cannot start worker");
        return 2;
    };

    match run_worker_process(agent, config, entry.entry).await {
        Ok(()) => 0,
        Err(e) => {
            error!(agent = %agent, error = %e, "worker failed");
            1
        }
    }
}
