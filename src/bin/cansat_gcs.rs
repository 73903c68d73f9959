use cansat_fsw::protocol::{echo_text, CommandEngine, COMMAND_PREFIX};
use cansat_fsw::telemetry::DOWNLINK_FIELDS;
use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use colored::*;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: &str = "8080";
const DEFAULT_TEAM: &str = "1000";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

#[tokio::main]
async fn main() -> CliResult<()> {
    let matches = App::new("cansat-gcs")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Space Systems Engineering Team")
        .about("📡 CanSat ground station - uplink commands and downlink monitor")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("host")
                .short("h")
                .long("host")
                .value_name("HOST")
                .help("Ground-link host address")
                .takes_value(true)
                .default_value(DEFAULT_HOST)
                .global(true),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("Ground-link port")
                .takes_value(true)
                .default_value(DEFAULT_PORT)
                .global(true),
        )
        .arg(
            Arg::with_name("team")
                .short("t")
                .long("team")
                .value_name("ID")
                .help("Team id placed in uplink commands")
                .takes_value(true)
                .default_value(DEFAULT_TEAM)
                .global(true)
                .validator(|v| match v.parse::<u16>() {
                    Ok(id) if id <= 9999 => Ok(()),
                    _ => Err("Team id must be a number between 0 and 9999".into()),
                }),
        )
        .arg(
            Arg::with_name("format")
                .short("f")
                .long("format")
                .value_name("FORMAT")
                .help("Output format")
                .takes_value(true)
                .possible_values(&["table", "csv", "compact"])
                .default_value("table")
                .global(true),
        )
        .subcommand(
            SubCommand::with_name("send")
                .about("🛰️  Send an uplink command, e.g. `send CX ON` or `send MEC MOTOR ON`")
                .arg(
                    Arg::with_name("verb")
                        .help("Command verb")
                        .required(true)
                        .possible_values(&["CX", "ST", "SIM", "SIMP", "CAL", "MEC", "CAM", "SS", "RBT"])
                        .case_insensitive(true),
                )
                .arg(
                    Arg::with_name("args")
                        .help("Remaining command fields")
                        .multiple(true),
                )
                .arg(
                    Arg::with_name("wait")
                        .short("w")
                        .long("wait")
                        .value_name("SECONDS")
                        .help("Wait for the command echo in telemetry")
                        .takes_value(true)
                        .default_value("3"),
                ),
        )
        .subcommand(
            SubCommand::with_name("raw")
                .about("Send one line verbatim, without local validation")
                .arg(Arg::with_name("line").help("Uplink line").required(true)),
        )
        .subcommand(
            SubCommand::with_name("monitor")
                .about("📈 Monitor the telemetry downlink")
                .arg(
                    Arg::with_name("count")
                        .short("n")
                        .long("count")
                        .value_name("PACKETS")
                        .help("Stop after this many packets (default: run until closed)")
                        .takes_value(true),
                ),
        )
        .get_matches();

    let (sub_name, sub) = matches.subcommand();
    let Some(sub) = sub else {
        return Ok(());
    };
    let host = global(&matches, sub, "host").unwrap_or(DEFAULT_HOST);
    let port = global(&matches, sub, "port").unwrap_or(DEFAULT_PORT).parse::<u16>()?;
    let team = global(&matches, sub, "team").unwrap_or(DEFAULT_TEAM).parse::<u16>()?;
    let format = global(&matches, sub, "format").unwrap_or("table");

    match sub_name {
        "send" => handle_send(sub, host, port, team).await?,
        "raw" => {
            let line = sub.value_of("line").unwrap_or_default();
            let mut stream = connect(host, port).await?;
            send_line(&mut stream, line).await?;
            println!("{} {}", "→".bright_blue(), line.bright_white());
        }
        "monitor" => {
            let count = sub.value_of("count").map(str::parse::<u64>).transpose()?;
            monitor(host, port, format, count).await?;
        }
        _ => {}
    }
    Ok(())
}

fn global<'a>(matches: &'a ArgMatches<'_>, sub: &'a ArgMatches<'_>, name: &str) -> Option<&'a str> {
    sub.value_of(name).or_else(|| matches.value_of(name))
}

async fn handle_send(matches: &ArgMatches<'_>, host: &str, port: u16, team: u16) -> CliResult<()> {
    let verb = matches.value_of("verb").unwrap_or_default().to_ascii_uppercase();
    let mut fields = vec![COMMAND_PREFIX.to_string(), team.to_string(), verb];
    if let Some(args) = matches.values_of("args") {
        fields.extend(args.map(str::to_string));
    }
    let line = fields.join(",");

    // Validate locally with the flight grammar so typos never reach the probe
    if let Err(e) = CommandEngine::new(team).parse(&line) {
        eprintln!("{} {}", "❌".red(), e.to_string().bright_red());
        return Err(e.into());
    }

    let mut stream = connect(host, port).await?;
    send_line(&mut stream, &line).await?;
    println!("{} {}", "→".bright_blue(), line.bright_white());

    let wait: u64 = matches.value_of("wait").unwrap_or("0").parse()?;
    if wait == 0 {
        return Ok(());
    }

    let expected = echo_text(&line);
    let echo_index = field_index("CMD_ECHO");
    let mut lines = BufReader::new(stream).lines();
    let confirmed = tokio::time::timeout(Duration::from_secs(wait), async {
        while let Ok(Some(packet)) = lines.next_line().await {
            if packet.split(',').nth(echo_index) == Some(expected.as_str()) {
                return true;
            }
        }
        false
    })
    .await
    .unwrap_or(false);

    if confirmed {
        println!("{} echoed as {}", "✅".green(), expected.bright_green());
    } else {
        println!(
            "{} no echo within {}s (telemetry may be off, try `send CX ON`)",
            "⏰".yellow(),
            wait
        );
    }
    Ok(())
}

async fn connect(host: &str, port: u16) -> CliResult<TcpStream> {
    let addr = format!("{}:{}", host, port);
    match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => {
            eprintln!("{} Failed to connect to ground link at {}", "❌".red(), addr.bright_white());
            if e.kind() == std::io::ErrorKind::ConnectionRefused {
                eprintln!("{} Flight software is not running. Start it with:", "💡".yellow());
                eprintln!("   {}", "cansat-fsw run".bright_cyan());
            }
            Err(e.into())
        }
        Err(_) => {
            eprintln!("{} Connection timed out after {:?}", "⏰".yellow(), CONNECT_TIMEOUT);
            Err("connection timeout".into())
        }
    }
}

async fn send_line(stream: &mut TcpStream, line: &str) -> std::io::Result<()> {
    stream.write_all(line.as_bytes()).await?;
    stream.write_all(b"\n").await?;
    stream.flush().await
}

fn field_index(name: &str) -> usize {
    DOWNLINK_FIELDS
        .iter()
        .position(|f| *f == name)
        .unwrap_or(DOWNLINK_FIELDS.len())
}

async fn monitor(host: &str, port: u16, format: &str, count: Option<u64>) -> CliResult<()> {
    let stream = connect(host, port).await?;
    let mut lines = BufReader::new(stream).lines();
    let mut seen = 0u64;

    if format == "table" {
        println!("{}", "📡 Monitoring CanSat telemetry (Press Ctrl+C to stop)...".bright_blue().bold());
        println!(
            "{}",
            "│ Time     │ Pkt  │ Mode │ State          │ Alt (m) │ Temp │ Volt │ Sats │ Echo".bright_white()
        );
    } else if format == "csv" {
        println!("{}", DOWNLINK_FIELDS.join(","));
    }

    while let Some(packet) = lines.next_line().await? {
        match format {
            "csv" => println!("{packet}"),
            "compact" => print_compact(&packet),
            _ => print_row(&packet),
        }
        seen += 1;
        if count.is_some_and(|n| seen >= n) {
            break;
        }
    }
    Ok(())
}

fn print_row(packet: &str) {
    let f: Vec<&str> = packet.split(',').collect();
    if f.len() != DOWNLINK_FIELDS.len() {
        println!("{} {}", "?".yellow(), packet.dimmed());
        return;
    }
    let get = |name: &str| f[field_index(name)];

    let mode = match get("MODE") {
        "S" => "  S ".bright_magenta(),
        other => format!("  {other} ").normal(),
    };
    let state = match get("STATE") {
        "LANDED" => format!("{:<14}", "LANDED").bright_green(),
        "LAUNCH_PAD" => format!("{:<14}", "LAUNCH_PAD").white(),
        other => format!("{other:<14}").bright_cyan(),
    };
    let volts = get("VOLTAGE").parse::<f64>().unwrap_or(0.0);
    let volt_str = if volts >= 3.6 {
        format!("{volts:>4.1}").green()
    } else {
        format!("{volts:>4.1}").yellow()
    };

    println!(
        "│ {} │ {:>4} │ {} │ {} │ {:>7} │ {:>4} │ {} │ {:>4} │ {}",
        get("MISSION_TIME"),
        get("PACKET_COUNT"),
        mode,
        state,
        get("ALTITUDE"),
        get("TEMPERATURE"),
        volt_str,
        get("GPS_SATS"),
        get("CMD_ECHO").bright_white(),
    );
}

fn print_compact(packet: &str) {
    let f: Vec<&str> = packet.split(',').collect();
    if f.len() != DOWNLINK_FIELDS.len() {
        println!("{}", packet.dimmed());
        return;
    }
    let get = |name: &str| f[field_index(name)];
    println!(
        "[{}] #{} {} {}m {}",
        get("MISSION_TIME"),
        get("PACKET_COUNT"),
        get("STATE"),
        get("ALTITUDE"),
        get("CMD_ECHO")
    );
}
