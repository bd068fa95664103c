//! Persisted frame log
//!
//! [`FrameStore`] appends one row per received frame to an SQLite table and
//! answers filtered, newest-first reads. Rows are only ever inserted; the
//! store never updates or deletes what it has written.
//!
//! Table layout (`messages`):
//!
//! | column         | type    | frame field       |
//! |----------------|---------|-------------------|
//! | ts             | REAL    | `timestamp`       |
//! | arbitration_id | INTEGER | `arbitration_id`  |
//! | extended       | INTEGER | `is_extended_id`  |
//! | remote         | INTEGER | `is_remote_frame` |
//! | error          | INTEGER | `is_error_frame`  |
//! | dlc            | INTEGER | `dlc`             |
//! | data           | BLOB    | `data`            |

use crate::listener::Listener;
use crate::types::{Frame, Result, TelemetryError};
use parking_lot::Mutex;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OpenFlags};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

const TABLE: &str = "messages";

const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS messages (
    ts REAL,
    arbitration_id INTEGER,
    extended INTEGER,
    remote INTEGER,
    error INTEGER,
    dlc INTEGER,
    data BLOB
)";

const INSERT_FRAME: &str = "INSERT INTO messages (ts, arbitration_id, extended, remote, error, dlc, data)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)";

/// Filter parameters for [`FrameStore::query`]
///
/// All present filters are combined with AND. An empty id list is treated
/// the same as an absent one.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameQuery {
    /// Maximum number of rows returned
    pub limit: usize,
    /// Only frames with one of these ids
    pub allow_ids: Option<Vec<u32>>,
    /// Never frames with one of these ids (wins over `allow_ids`)
    pub deny_ids: Option<Vec<u32>>,
    /// Only frames whose error flag equals this value
    pub error_filter: Option<bool>,
}

impl FrameQuery {
    /// Query for the newest `limit` frames, unfiltered
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            ..Self::default()
        }
    }

    /// Builder method: restrict to these arbitration ids
    pub fn allow(mut self, ids: impl IntoIterator<Item = u32>) -> Self {
        self.allow_ids = Some(ids.into_iter().collect());
        self
    }

    /// Builder method: exclude these arbitration ids
    pub fn deny(mut self, ids: impl IntoIterator<Item = u32>) -> Self {
        self.deny_ids = Some(ids.into_iter().collect());
        self
    }

    /// Builder method: restrict to error (or non-error) frames
    pub fn error_frames(mut self, is_error_frame: bool) -> Self {
        self.error_filter = Some(is_error_frame);
        self
    }

    /// Build the SQL text and its bound parameters
    ///
    /// Ids and the error flag only ever appear as `?` placeholders.
    fn to_sql(&self) -> (String, Vec<Value>) {
        let mut sql = format!(
            "SELECT ts, arbitration_id, extended, remote, error, dlc, data FROM {}",
            TABLE
        );
        let mut conditions: Vec<String> = Vec::new();
        let mut parameters: Vec<Value> = Vec::new();

        if let Some(ids) = self.allow_ids.as_ref().filter(|ids| !ids.is_empty()) {
            conditions.push(format!("arbitration_id IN ({})", placeholders(ids.len())));
            parameters.extend(ids.iter().map(|id| Value::Integer(i64::from(*id))));
        }
        if let Some(ids) = self.deny_ids.as_ref().filter(|ids| !ids.is_empty()) {
            conditions.push(format!("arbitration_id NOT IN ({})", placeholders(ids.len())));
            parameters.extend(ids.iter().map(|id| Value::Integer(i64::from(*id))));
        }
        if let Some(is_error) = self.error_filter {
            conditions.push("error = ?".to_string());
            parameters.push(Value::Integer(i64::from(is_error)));
        }

        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }
        sql.push_str(" ORDER BY ts DESC LIMIT ?");
        parameters.push(Value::Integer(i64::try_from(self.limit).unwrap_or(i64::MAX)));

        (sql, parameters)
    }
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(",")
}

/// Append-only SQLite log of frames
pub struct FrameStore {
    path: Option<PathBuf>,
    conn: Mutex<Connection>,
    appended: AtomicU64,
    append_failures: AtomicU64,
}

impl FrameStore {
    /// Open (creating if needed) the database at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        log::info!("Opening frame store: {:?}", path);
        let conn = Connection::open(path)?;
        // WAL lets readers proceed while the reader thread appends
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        log::debug!("Frame store journal mode: {}", mode);
        Self::with_connection(conn, Some(path.to_path_buf()))
    }

    /// Open an existing database for queries only
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(TelemetryError::Query(format!(
                "frame store not found: {:?}",
                path
            )));
        }
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Ok(Self {
            path: Some(path.to_path_buf()),
            conn: Mutex::new(conn),
            appended: AtomicU64::new(0),
            append_failures: AtomicU64::new(0),
        })
    }

    /// Private in-memory database (tests, throwaway sessions)
    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?, None)
    }

    fn with_connection(conn: Connection, path: Option<PathBuf>) -> Result<Self> {
        conn.execute_batch(CREATE_TABLE)?;
        Ok(Self {
            path,
            conn: Mutex::new(conn),
            appended: AtomicU64::new(0),
            append_failures: AtomicU64::new(0),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Append one row for `frame`
    pub fn append(&self, frame: &Frame) -> Result<()> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(INSERT_FRAME)?;
        stmt.execute(params![
            frame.timestamp,
            i64::from(frame.arbitration_id),
            frame.is_extended_id,
            frame.is_remote_frame,
            frame.is_error_frame,
            i64::from(frame.dlc),
            frame.data,
        ])?;
        self.appended.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Newest-first frames matching `query`, at most `query.limit` of them
    pub fn query(&self, query: &FrameQuery) -> Result<Vec<Frame>> {
        let (sql, parameters) = query.to_sql();
        log::trace!("Frame query: {} ({} parameters)", sql, parameters.len());

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(parameters.iter()), |row| {
            let arbitration_id: i64 = row.get(1)?;
            let dlc: i64 = row.get(5)?;
            let data: Option<Vec<u8>> = row.get(6)?;
            Ok(Frame {
                timestamp: row.get(0)?,
                arbitration_id: arbitration_id as u32,
                is_extended_id: row.get(2)?,
                channel: None,
                dlc: dlc as u8,
                data: data.unwrap_or_default(),
                is_error_frame: row.get(4)?,
                is_remote_frame: row.get(3)?,
                is_fd: false,
                bitrate_switch: false,
                error_state_indicator: false,
            })
        })?;

        let frames = rows.collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(frames)
    }

    /// Convenience wrapper over [`FrameStore::query`] taking each filter separately
    pub fn read_via(
        &self,
        n: usize,
        allow_ids: Option<&[u32]>,
        deny_ids: Option<&[u32]>,
        is_error_frame: Option<bool>,
    ) -> Result<Vec<Frame>> {
        let query = FrameQuery {
            limit: n,
            allow_ids: allow_ids.map(<[u32]>::to_vec),
            deny_ids: deny_ids.map(<[u32]>::to_vec),
            error_filter: is_error_frame,
        };
        self.query(&query)
    }

    /// Total rows in the table
    pub fn count(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", TABLE),
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Rows appended through this handle
    pub fn appended(&self) -> u64 {
        self.appended.load(Ordering::Relaxed)
    }

    /// Appends that failed (and were logged) while acting as a listener
    pub fn append_failures(&self) -> u64 {
        self.append_failures.load(Ordering::Relaxed)
    }
}

impl Listener for FrameStore {
    fn on_frame(&self, frame: &Frame) {
        if let Err(e) = self.append(frame) {
            self.append_failures.fetch_add(1, Ordering::Relaxed);
            log::error!(
                "Failed to persist frame 0x{:X}: {}",
                frame.arbitration_id,
                e
            );
        }
    }

    fn name(&self) -> &str {
        "frame-store"
    }
}
