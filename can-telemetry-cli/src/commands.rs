//! Subcommand implementations

use anyhow::{bail, Context, Result};
use can_telemetry::{
    now_seconds, read_csv_log, CanInterface, FilterBuilder, FilterSet, Frame, FrameQuery,
    FrameStore, MessageDatabase, SignalDecoder, TelemetryApp, TelemetryConfig, MAX_STANDARD_ID,
};
use chrono::{DateTime, Local, Utc};
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

/// Frames shown after a session ends
const SUMMARY_FRAMES: usize = 10;

/// Parse an arbitration id given as decimal or `0x` hex
pub fn parse_id(value: &str) -> std::result::Result<u32, String> {
    let value = value.trim();
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => value.parse::<u32>(),
    };
    parsed.map_err(|e| format!("invalid arbitration id '{}': {}", value, e))
}

/// Parse a payload given as hex digits, optionally separated by spaces
pub fn parse_payload(value: &str) -> Result<Vec<u8>> {
    let digits: String = value.chars().filter(|c| !c.is_whitespace()).collect();
    hex::decode(&digits).with_context(|| format!("invalid hex payload '{}'", value))
}

/// Local wall-clock rendering of an epoch-seconds timestamp
fn format_timestamp(timestamp: f64) -> String {
    let secs = timestamp.floor() as i64;
    let nanos = ((timestamp - timestamp.floor()) * 1e9) as u32;
    match DateTime::<Utc>::from_timestamp(secs, nanos) {
        Some(utc) => utc
            .with_timezone(&Local)
            .format("%Y-%m-%d %H:%M:%S%.6f")
            .to_string(),
        None => format!("{:.6}", timestamp),
    }
}

fn print_frames(frames: &[Frame]) {
    for frame in frames {
        println!("{}  {}", format_timestamp(frame.timestamp), frame);
    }
}

pub fn run(
    config_path: &Path,
    seconds: Option<f64>,
    channel: Option<String>,
    peak_interface: Option<String>,
) -> Result<()> {
    let config = TelemetryConfig::from_json_file(config_path)
        .with_context(|| format!("Failed to load configuration {:?}", config_path))?;

    let mut app = TelemetryApp::new(config)?;
    if let Some(channel) = channel {
        app = app.with_virtual_channel(channel);
    }
    if let Some(interface) = peak_interface {
        app = app.with_peak_interface(interface);
    }

    app.start().context("Failed to start telemetry")?;
    println!(
        "Telemetry running on {} interface, storing to {:?}",
        app.config().interface,
        app.config().sqlite_log_file_path()
    );

    match seconds {
        Some(secs) if secs > 0.0 => thread::sleep(Duration::from_secs_f64(secs)),
        Some(_) => {}
        None => {
            println!("Press Enter to stop");
            let mut line = String::new();
            io::stdin()
                .read_line(&mut line)
                .context("Failed to read from stdin")?;
        }
    }

    let status = app.check();
    app.stop();
    if let Err(e) = status {
        log::warn!("{}", e);
    }

    let recent = app.sqlite_read_via(SUMMARY_FRAMES, None, None, None)?;
    println!("\nMost recent {} frame(s):", recent.len());
    print_frames(&recent);
    Ok(())
}

pub fn query(
    db: &Path,
    n: usize,
    allow: &[u32],
    deny: &[u32],
    error: Option<bool>,
    json: bool,
) -> Result<()> {
    let store = FrameStore::open_read_only(db)
        .with_context(|| format!("Failed to open frame store {:?}", db))?;

    let mut query = FrameQuery::new(n);
    if !allow.is_empty() {
        query = query.allow(allow.iter().copied());
    }
    if !deny.is_empty() {
        query = query.deny(deny.iter().copied());
    }
    if let Some(is_error) = error {
        query = query.error_frames(is_error);
    }

    let frames = store.query(&query)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&frames)?);
    } else {
        print_frames(&frames);
        log::info!("{} frame(s)", frames.len());
    }
    Ok(())
}

/// Arbitration id and id width of the frame to decode
fn resolve_message(
    database: &MessageDatabase,
    id: Option<u32>,
    message: Option<&str>,
) -> Result<(u32, bool)> {
    match (id, message) {
        (Some(id), _) => Ok((id, id > MAX_STANDARD_ID)),
        (None, Some(name)) => database
            .get_message_by_name(name)
            .map(|m| (m.id, m.is_extended))
            .with_context(|| format!("No message named '{}' in the DBC", name)),
        (None, None) => bail!("either an arbitration id or a message name is required"),
    }
}

pub fn decode(
    dbc: &Path,
    id: Option<u32>,
    message: Option<&str>,
    data: &str,
    json: bool,
) -> Result<()> {
    let decoder = SignalDecoder::from_dbc(dbc)
        .with_context(|| format!("Failed to load DBC {:?}", dbc))?;
    let (id, extended) = resolve_message(decoder.database(), id, message)?;
    let payload = parse_payload(data)?;
    let frame = if extended {
        Frame::new_extended(id, &payload)
    } else {
        Frame::new(id, &payload)
    };
    let frame = frame.with_timestamp(now_seconds());

    let signals = decoder.decode_signals(&frame)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&signals)?);
        return Ok(());
    }

    if let Some(message) = decoder.database().get_message(id) {
        println!("{} (0x{:X})", message.name, id);
    }
    for signal in signals {
        let unit = signal.unit.as_deref().unwrap_or("");
        match signal.value_description {
            Some(label) => println!("  {} = {} {} ({})", signal.name, signal.value, unit, label),
            None => println!("  {} = {} {}", signal.name, signal.value, unit),
        }
    }
    Ok(())
}

/// One line per label: the sorted ids of the messages matching it, or one
/// line per message when no names are given
fn filter_lines(database: &MessageDatabase, names: &[String]) -> Vec<String> {
    if names.is_empty() {
        return database
            .can_ids()
            .into_iter()
            .filter_map(|id| database.get_message(id))
            .map(|m| format!("0x{:X}: {}", m.id, m.name))
            .collect();
    }

    let mut filters = FilterSet::new();
    for name in names {
        FilterBuilder::add(&mut filters, database, name);
    }

    filters
        .labels()
        .map(|label| {
            let mut ids: Vec<u32> = filters
                .get(label)
                .map(|ids| ids.iter().copied().collect())
                .unwrap_or_default();
            ids.sort_unstable();
            let rendered: Vec<String> = ids.iter().map(|id| format!("0x{:X}", id)).collect();
            format!("{}: {}", label, rendered.join(", "))
        })
        .collect()
}

pub fn filter(dbc: &Path, names: &[String]) -> Result<()> {
    let database = MessageDatabase::from_dbc(dbc)
        .with_context(|| format!("Failed to load DBC {:?}", dbc))?;

    let stats = database.stats();
    log::info!(
        "{}: {} message(s), {} signal(s), {} multiplexed",
        database.source().unwrap_or("DBC"),
        stats.num_messages,
        stats.num_signals,
        stats.num_multiplexed
    );

    for line in filter_lines(&database, names) {
        println!("{}", line);
    }
    Ok(())
}

/// Sample configuration: two battery frames replayed one and two seconds in
pub fn sample_config(dbc: PathBuf, interface: CanInterface) -> TelemetryConfig {
    let now = now_seconds();
    TelemetryConfig::new(dbc)
        .with_interface(interface)
        .with_csv_logging(true)
        .with_sim_messages(vec![
            Frame::new(0x100, &[0xE8, 0x03, 0xD0, 0x07]).with_timestamp(now + 1.0),
            Frame::new(0x200, &[0x83, 0xFF]).with_timestamp(now + 2.0),
        ])
}

/// Frames of a CSV log moved forward in time: the first one replays one
/// second from now, the rest keep their spacing
pub fn frames_from_csv(path: &Path) -> Result<Vec<Frame>> {
    let mut frames = read_csv_log(path)
        .with_context(|| format!("Failed to read CSV log {:?}", path))?;
    let Some(first) = frames.iter().map(|f| f.timestamp).reduce(f64::min) else {
        bail!("CSV log {:?} contains no frames", path);
    };
    let shift = now_seconds() + 1.0 - first;
    for frame in &mut frames {
        frame.timestamp += shift;
    }
    Ok(frames)
}

pub fn init_config(
    out: &Path,
    dbc: PathBuf,
    interface: CanInterface,
    sim_csv: Option<&Path>,
) -> Result<()> {
    let mut config = sample_config(dbc, interface);
    if let Some(path) = sim_csv {
        config = config.with_sim_messages(frames_from_csv(path)?);
    }
    config
        .to_json_file(out, true)
        .with_context(|| format!("Failed to write configuration {:?}", out))?;
    println!(
        "Configuration with {} replay frame(s) written to {:?}",
        config.sim_messages.len(),
        out
    );
    Ok(())
}
