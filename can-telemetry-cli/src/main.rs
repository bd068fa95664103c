//! CAN Telemetry CLI Application
//!
//! Command-line front end for the can-telemetry library:
//! - Run a telemetry session from a JSON configuration
//! - Query frames persisted by a session
//! - Decode single frames with a DBC file
//! - Derive arbitration-id filters from message names
//! - Write configuration snapshots, optionally replaying a CSV log

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;

/// CAN Telemetry - capture, store and decode CAN bus traffic
#[derive(Parser, Debug)]
#[command(name = "can-telemetry-cli")]
#[command(about = "Capture, store and decode CAN bus traffic", long_about = None)]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Verbosity level (can be repeated: -v, -vv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a telemetry session until the time limit or Enter
    Run {
        /// JSON configuration snapshot
        #[arg(short, long, value_name = "FILE")]
        config: PathBuf,

        /// Stop after this many seconds instead of waiting for Enter
        #[arg(long, value_name = "SECS")]
        seconds: Option<f64>,

        /// Virtual channel name for the SIM/VIRTUAL interfaces
        #[arg(long, value_name = "NAME")]
        channel: Option<String>,

        /// SocketCAN interface for the PEAK interface
        #[arg(long, value_name = "IFACE")]
        peak_interface: Option<String>,
    },

    /// Print stored frames, newest first
    Query {
        /// SQLite database written by a session
        #[arg(long, value_name = "FILE")]
        db: PathBuf,

        /// Maximum number of frames
        #[arg(short, default_value_t = 20)]
        n: usize,

        /// Only these arbitration ids (repeatable, decimal or 0x hex)
        #[arg(long, value_name = "ID", value_parser = commands::parse_id)]
        allow: Vec<u32>,

        /// Never these arbitration ids (repeatable, decimal or 0x hex)
        #[arg(long, value_name = "ID", value_parser = commands::parse_id)]
        deny: Vec<u32>,

        /// Only error frames (true) or only non-error frames (false)
        #[arg(long, value_name = "BOOL")]
        error: Option<bool>,

        /// Print frames as JSON
        #[arg(long)]
        json: bool,
    },

    /// Decode one frame with a DBC file
    Decode {
        #[arg(long, value_name = "FILE")]
        dbc: PathBuf,

        /// Arbitration id (decimal or 0x hex)
        #[arg(
            long,
            value_name = "ID",
            value_parser = commands::parse_id,
            required_unless_present = "message",
            conflicts_with = "message"
        )]
        id: Option<u32>,

        /// Message name from the DBC, instead of --id
        #[arg(long, value_name = "NAME")]
        message: Option<String>,

        /// Payload as hex, e.g. E803D007
        #[arg(long, value_name = "HEX", default_value = "")]
        data: String,

        /// Print signals as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the arbitration ids of messages whose name contains a substring,
    /// or every message of the DBC when no substring is given
    Filter {
        #[arg(long, value_name = "FILE")]
        dbc: PathBuf,

        /// Case-sensitive name substring (repeatable)
        #[arg(long = "name", value_name = "SUBSTRING")]
        names: Vec<String>,
    },

    /// Write a sample configuration snapshot
    InitConfig {
        /// Output JSON file
        #[arg(long, value_name = "FILE")]
        out: PathBuf,

        /// DBC file referenced by the configuration
        #[arg(long, value_name = "FILE", default_value = "telemetry.dbc")]
        dbc: PathBuf,

        /// Interface name: SIM, VIRTUAL or PEAK
        #[arg(long, value_name = "NAME", default_value = "SIM")]
        interface: can_telemetry::CanInterface,

        /// Replay the frames of a CSV log instead of the built-in sample
        #[arg(long, value_name = "FILE")]
        sim_csv: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(args.verbose, args.quiet);

    log::debug!("CAN Telemetry CLI v{}", env!("CARGO_PKG_VERSION"));
    log::debug!("Using telemetry library v{}", can_telemetry::VERSION);

    match args.command {
        Command::Run {
            config,
            seconds,
            channel,
            peak_interface,
        } => commands::run(&config, seconds, channel, peak_interface),
        Command::Query {
            db,
            n,
            allow,
            deny,
            error,
            json,
        } => commands::query(&db, n, &allow, &deny, error, json),
        Command::Decode {
            dbc,
            id,
            message,
            data,
            json,
        } => commands::decode(&dbc, id, message.as_deref(), &data, json),
        Command::Filter { dbc, names } => commands::filter(&dbc, &names),
        Command::InitConfig {
            out,
            dbc,
            interface,
            sim_csv,
        } => commands::init_config(&out, dbc, interface, sim_csv.as_deref()),
    }
}

/// Initialize logging based on verbosity level
fn init_logging(verbose: u8, quiet: bool) {
    use env_logger::Builder;
    use log::LevelFilter;
    use std::io::Write;

    let level = if quiet {
        LevelFilter::Error
    } else {
        match verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    };

    Builder::new()
        .filter_level(level)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {}] {}",
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();
}
