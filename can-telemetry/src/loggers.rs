//! File loggers registered as bus listeners
//!
//! - [`CsvLogger`]: one CSV row per frame, payload base64-encoded
//! - [`AsciiLogger`]: candump `-l` log format, readable by `canplayer`
//!
//! Write failures are logged and counted; they never reach the notifying
//! thread.

use crate::listener::Listener;
use crate::types::{Frame, Result, TelemetryError};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use parking_lot::Mutex;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// Header written as the first line of every CSV log
pub const CSV_HEADER: &str = "timestamp,arbitration_id,extended,remote,error,dlc,data";

/// Error bit OR-ed into the id of error frames in candump logs
const CAN_ERR_FLAG: u32 = 0x2000_0000;

/// Channel name used when a frame carries none
const DEFAULT_ASCII_CHANNEL: &str = "vcan0";

/// Buffered file shared by the logger types
struct LogFile {
    path: PathBuf,
    writer: Mutex<Option<BufWriter<File>>>,
    written: AtomicU64,
    failures: AtomicU64,
}

impl LogFile {
    fn create(path: &Path, header: Option<&str>) -> Result<Self> {
        let mut writer = BufWriter::new(File::create(path)?);
        if let Some(header) = header {
            writeln!(writer, "{}", header)?;
        }
        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(Some(writer)),
            written: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        })
    }

    fn write_line(&self, line: &str) {
        let mut guard = self.writer.lock();
        let result = match guard.as_mut() {
            Some(writer) => writeln!(writer, "{}", line),
            None => {
                log::trace!("Dropping frame for closed log {:?}", self.path);
                return;
            }
        };
        match result {
            Ok(()) => {
                self.written.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                log::error!("Failed to write to {:?}: {}", self.path, e);
            }
        }
    }

    fn flush(&self) -> Result<()> {
        if let Some(writer) = self.writer.lock().as_mut() {
            writer.flush()?;
        }
        Ok(())
    }

    fn close(&self) -> Result<()> {
        match self.writer.lock().take() {
            Some(mut writer) => {
                writer.flush()?;
                log::info!(
                    "Closed {:?} ({} line(s) written)",
                    self.path,
                    self.written.load(Ordering::Relaxed)
                );
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl Drop for LogFile {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::warn!("Failed to finalize {:?}: {}", self.path, e);
        }
    }
}

/// CSV log of received frames
pub struct CsvLogger {
    file: LogFile,
}

impl CsvLogger {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        log::info!("Opening CSV log: {:?}", path);
        Ok(Self {
            file: LogFile::create(path, Some(CSV_HEADER))?,
        })
    }

    /// One CSV row (without line terminator)
    pub fn format_frame(frame: &Frame) -> String {
        format!(
            "{},0x{:x},{},{},{},{},{}",
            frame.timestamp,
            frame.arbitration_id,
            u8::from(frame.is_extended_id),
            u8::from(frame.is_remote_frame),
            u8::from(frame.is_error_frame),
            frame.dlc,
            BASE64.encode(&frame.data)
        )
    }

    pub fn path(&self) -> &Path {
        &self.file.path
    }

    pub fn lines_written(&self) -> u64 {
        self.file.written.load(Ordering::Relaxed)
    }

    pub fn write_failures(&self) -> u64 {
        self.file.failures.load(Ordering::Relaxed)
    }

    pub fn flush(&self) -> Result<()> {
        self.file.flush()
    }

    /// Flush and release the file; frames arriving afterwards are dropped
    pub fn close(&self) -> Result<()> {
        self.file.close()
    }
}

impl Listener for CsvLogger {
    fn on_frame(&self, frame: &Frame) {
        self.file.write_line(&Self::format_frame(frame));
    }

    fn name(&self) -> &str {
        "csv-logger"
    }
}

/// candump-compatible text log of received frames
pub struct AsciiLogger {
    file: LogFile,
}

impl AsciiLogger {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        log::info!("Opening ASCII log: {:?}", path);
        Ok(Self {
            file: LogFile::create(path, None)?,
        })
    }

    /// One candump line: `(<secs.micros>) <channel> <ID>#<DATA>`
    pub fn format_frame(frame: &Frame) -> String {
        let channel = frame
            .channel
            .as_ref()
            .map(|c| c.to_string())
            .unwrap_or_else(|| DEFAULT_ASCII_CHANNEL.to_string());

        let id = if frame.is_error_frame {
            format!("{:08X}", frame.arbitration_id | CAN_ERR_FLAG)
        } else if frame.is_extended_id {
            format!("{:08X}", frame.arbitration_id)
        } else {
            format!("{:03X}", frame.arbitration_id)
        };

        let payload = if frame.is_remote_frame {
            "R".to_string()
        } else if frame.is_fd {
            let flags = u8::from(frame.bitrate_switch) | (u8::from(frame.error_state_indicator) << 1);
            format!("#{:X}{}", flags, hex::encode_upper(&frame.data))
        } else {
            hex::encode_upper(&frame.data)
        };

        format!("({:.6}) {} {}#{}", frame.timestamp, channel, id, payload)
    }

    pub fn path(&self) -> &Path {
        &self.file.path
    }

    pub fn lines_written(&self) -> u64 {
        self.file.written.load(Ordering::Relaxed)
    }

    pub fn write_failures(&self) -> u64 {
        self.file.failures.load(Ordering::Relaxed)
    }

    pub fn flush(&self) -> Result<()> {
        self.file.flush()
    }

    pub fn close(&self) -> Result<()> {
        self.file.close()
    }
}

impl Listener for AsciiLogger {
    fn on_frame(&self, frame: &Frame) {
        self.file.write_line(&Self::format_frame(frame));
    }

    fn name(&self) -> &str {
        "ascii-logger"
    }
}

/// Read every frame of a CSV log written by [`CsvLogger`]
///
/// The header line is optional; blank lines are skipped.
pub fn read_csv_log(path: impl AsRef<Path>) -> Result<Vec<Frame>> {
    let content = std::fs::read_to_string(path.as_ref())?;
    content
        .lines()
        .filter(|line| !line.trim().is_empty() && *line != CSV_HEADER)
        .map(parse_csv_row)
        .collect()
}

/// Parse a CSV row written by [`CsvLogger`] back into a frame
fn parse_csv_row(row: &str) -> Result<Frame> {
    let fields: Vec<&str> = row.trim_end().split(',').collect();
    if fields.len() != 7 {
        return Err(TelemetryError::InvalidFrame(format!(
            "expected 7 CSV fields, got {}",
            fields.len()
        )));
    }
    let bad = |what: &str| TelemetryError::InvalidFrame(format!("bad {} in CSV row '{}'", what, row));
    let flag = |value: &str, what: &str| match value {
        "1" => Ok(true),
        "0" => Ok(false),
        _ => Err(bad(what)),
    };

    let timestamp = fields[0].parse::<f64>().map_err(|_| bad("timestamp"))?;
    let arbitration_id = u32::from_str_radix(fields[1].trim_start_matches("0x"), 16)
        .map_err(|_| bad("arbitration_id"))?;
    let dlc = fields[5].parse::<u8>().map_err(|_| bad("dlc"))?;
    let data = BASE64.decode(fields[6]).map_err(|_| bad("data"))?;

    Ok(Frame {
        timestamp,
        arbitration_id,
        is_extended_id: flag(fields[2], "extended")?,
        channel: None,
        dlc,
        data,
        is_error_frame: flag(fields[4], "error")?,
        is_remote_frame: flag(fields[3], "remote")?,
        is_fd: false,
        bitrate_switch: false,
        error_state_indicator: false,
    })
}
