//! Durable logging of stream lines and cycler data points.
//!
//! All file and database writes happen on a background thread so the tick
//! path never waits on the disk. Write failures are logged and dropped.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Sender};
use std::thread::{self, JoinHandle};

use chrono::{SecondsFormat, TimeZone, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cycler::{DataPoint, StepDefinition};
use crate::drivers::BridgeError;
use crate::types::Channel;

pub const SOFTWARE_VERSION: &str = concat!("smu-bridge-", env!("CARGO_PKG_VERSION"));
pub const DATA_FORMAT_VERSION: &str = "1.0";

/// Column order shared by the cycler's SQLite `data` table and CSV file.
pub const RUN_COLUMNS: [&str; 14] = [
    "timestamp",
    "unix_timestamp",
    "cycle",
    "step",
    "step_type",
    "step_time_s",
    "total_time_s",
    "voltage_v",
    "current_a",
    "step_ah",
    "cycle_ah",
    "total_ah",
    "temperature_c",
    "notes",
];

pub(crate) fn iso_millis(ms: i64) -> String {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or_default()
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Descriptive fields supplied when a cycler run starts.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TestMetadata {
    pub test_name: Option<String>,
    pub test_type: Option<String>,
    pub operator: Option<String>,
    pub battery_id: Option<String>,
    pub battery_type: Option<String>,
    pub capacity_ah: Option<f64>,
    pub temperature_c: Option<f64>,
    pub notes: Option<String>,
}

/// Everything a sink needs to know when a run starts.
#[derive(Clone, Debug)]
pub struct RunHeader {
    pub channel: Channel,
    pub total_cycles: u32,
    pub steps: Vec<StepDefinition>,
    pub metadata: TestMetadata,
    pub started_ms: i64,
}

impl RunHeader {
    /// Key/value pairs stored in the `metadata` table at start.
    pub fn metadata_pairs(&self) -> Vec<(&'static str, String)> {
        let m = &self.metadata;
        let or = |v: &Option<String>, d: &str| v.clone().unwrap_or_else(|| d.to_owned());
        vec![
            ("test_name", or(&m.test_name, "Battery Cycling Test")),
            ("test_type", or(&m.test_type, "cycling")),
            ("channel", self.channel.to_string()),
            ("total_cycles", self.total_cycles.to_string()),
            ("start_time", iso_millis(self.started_ms)),
            ("operator", or(&m.operator, "system")),
            ("battery_id", or(&m.battery_id, "unknown")),
            ("battery_type", or(&m.battery_type, "unknown")),
            (
                "capacity_ah",
                m.capacity_ah.map(|c| c.to_string()).unwrap_or_else(|| "unknown".into()),
            ),
            (
                "temperature_c",
                m.temperature_c.map(|t| t.to_string()).unwrap_or_else(|| "ambient".into()),
            ),
            ("notes", or(&m.notes, "")),
            (
                "step_definition",
                serde_json::to_string(&self.steps).unwrap_or_default(),
            ),
            ("software_version", SOFTWARE_VERSION.to_owned()),
            ("data_format_version", DATA_FORMAT_VERSION.to_owned()),
        ]
    }
}

/// How a run ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOutcome {
    Completed,
    Stopped,
}

impl RunOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            RunOutcome::Completed => "completed",
            RunOutcome::Stopped => "stopped",
        }
    }
}

/// Completion record written when a run stops.
#[derive(Clone, Debug, PartialEq)]
pub struct RunSummary {
    pub ended_ms: i64,
    pub outcome: RunOutcome,
    pub final_cycle_count: u32,
    pub total_test_time_s: f64,
}

impl RunSummary {
    pub fn metadata_pairs(&self) -> Vec<(&'static str, String)> {
        vec![
            ("end_time", iso_millis(self.ended_ms)),
            ("test_status", self.outcome.as_str().to_owned()),
            ("final_cycle_count", self.final_cycle_count.to_string()),
            ("total_test_time_s", self.total_test_time_s.to_string()),
        ]
    }
}

/// Destination for cycler data points.
pub trait CyclerSink: Send {
    /// Queues one point. Must not block on I/O.
    fn write_point(&mut self, point: &DataPoint);
    /// Writes completion metadata and closes every handle before returning.
    fn finish(&mut self, summary: &RunSummary);
    fn describe(&self) -> String;
}

/// Creates a sink for each run that asks for logging.
pub trait SinkOpener: Send {
    fn open(&self, header: &RunHeader) -> Result<Box<dyn CyclerSink>, BridgeError>;
}

// ---------------------------------------------------------------------------
// background writer

enum WriteOp {
    Point(DataPoint),
    Row(Vec<Option<String>>),
    Finish(RunSummary),
}

trait Backend: Send {
    fn write(&mut self, op: &WriteOp) -> Result<(), BridgeError>;
    fn close(&mut self) -> Result<(), BridgeError>;
    fn name(&self) -> String;
}

/// Owns a writer thread; dropping or closing it drains the queue and joins.
struct BackgroundWriter {
    tx: Option<Sender<WriteOp>>,
    handle: Option<JoinHandle<()>>,
}

impl BackgroundWriter {
    fn spawn(label: &str, mut backends: Vec<Box<dyn Backend>>) -> Result<Self, BridgeError> {
        let (tx, rx) = channel::<WriteOp>();
        let handle = thread::Builder::new()
            .name(format!("recorder {label}"))
            .spawn(move || {
                for op in rx {
                    for backend in backends.iter_mut() {
                        if let Err(e) = backend.write(&op) {
                            log::error!("{} write failed: {e}", backend.name());
                        }
                    }
                }
                for backend in backends.iter_mut() {
                    if let Err(e) = backend.close() {
                        log::error!("{} close failed: {e}", backend.name());
                    }
                }
            })
            .map_err(|e| BridgeError::Persistence(e.to_string()))?;
        Ok(Self {
            tx: Some(tx),
            handle: Some(handle),
        })
    }

    fn send(&self, op: WriteOp) {
        if let Some(tx) = &self.tx {
            if tx.send(op).is_err() {
                log::error!("recorder thread is gone; record dropped");
            }
        }
    }

    fn close(&mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("recorder thread panicked");
            }
        }
    }
}

impl Drop for BackgroundWriter {
    fn drop(&mut self) {
        self.close();
    }
}

fn persistence(e: std::io::Error) -> BridgeError {
    BridgeError::Persistence(e.to_string())
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_owned()
    }
}

fn csv_line<'a>(fields: impl IntoIterator<Item = &'a str>) -> String {
    fields.into_iter().map(csv_field).collect::<Vec<_>>().join(",")
}

fn sql_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn point_fields(p: &DataPoint) -> Vec<String> {
    vec![
        p.timestamp.clone(),
        p.unix_timestamp.to_string(),
        p.cycle.to_string(),
        p.step.to_string(),
        p.step_type.clone(),
        p.step_time_s.to_string(),
        p.total_time_s.to_string(),
        p.voltage_v.to_string(),
        p.current_a.to_string(),
        p.step_ah.to_string(),
        p.cycle_ah.to_string(),
        p.total_ah.to_string(),
        p.temperature_c.map(|t| t.to_string()).unwrap_or_default(),
        p.notes.clone().unwrap_or_default(),
    ]
}

// ---------------------------------------------------------------------------
// cycler run logging

struct RunCsvBackend {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl RunCsvBackend {
    fn create(path: &Path) -> Result<Self, BridgeError> {
        let mut writer = BufWriter::new(File::create(path).map_err(persistence)?);
        writeln!(writer, "{}", RUN_COLUMNS.join(",")).map_err(persistence)?;
        Ok(Self {
            path: path.to_owned(),
            writer: Some(writer),
        })
    }
}

impl Backend for RunCsvBackend {
    fn write(&mut self, op: &WriteOp) -> Result<(), BridgeError> {
        let Some(w) = self.writer.as_mut() else {
            return Ok(());
        };
        match op {
            WriteOp::Point(p) => {
                let fields = point_fields(p);
                writeln!(w, "{}", csv_line(fields.iter().map(String::as_str))).map_err(persistence)
            }
            WriteOp::Finish(_) => w.flush().map_err(persistence),
            WriteOp::Row(_) => Ok(()),
        }
    }

    fn close(&mut self) -> Result<(), BridgeError> {
        if let Some(mut w) = self.writer.take() {
            w.flush().map_err(persistence)?;
        }
        Ok(())
    }

    fn name(&self) -> String {
        format!("csv {}", self.path.display())
    }
}

struct RunSqliteBackend {
    path: PathBuf,
    conn: Option<Connection>,
}

impl RunSqliteBackend {
    fn create(path: &Path, header: &RunHeader) -> Result<Self, BridgeError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS metadata (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                key TEXT UNIQUE NOT NULL,
                value TEXT,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );
            CREATE TABLE IF NOT EXISTS data (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp DATETIME NOT NULL,
                unix_timestamp INTEGER NOT NULL,
                cycle INTEGER NOT NULL,
                step INTEGER NOT NULL,
                step_type TEXT NOT NULL,
                step_time_s REAL NOT NULL,
                total_time_s REAL NOT NULL,
                voltage_v REAL,
                current_a REAL,
                step_ah REAL NOT NULL,
                cycle_ah REAL NOT NULL,
                total_ah REAL NOT NULL,
                temperature_c REAL,
                notes TEXT,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );",
        )?;
        let backend = Self {
            path: path.to_owned(),
            conn: Some(conn),
        };
        backend.put_metadata(&header.metadata_pairs())?;
        Ok(backend)
    }

    fn put_metadata(&self, pairs: &[(&'static str, String)]) -> Result<(), BridgeError> {
        let Some(conn) = &self.conn else {
            return Ok(());
        };
        let mut stmt = conn.prepare_cached("INSERT OR REPLACE INTO metadata (key, value) VALUES (?1, ?2)")?;
        for (key, value) in pairs {
            stmt.execute(params![key, value])?;
        }
        Ok(())
    }
}

impl Backend for RunSqliteBackend {
    fn write(&mut self, op: &WriteOp) -> Result<(), BridgeError> {
        match op {
            WriteOp::Point(p) => {
                let Some(conn) = &self.conn else {
                    return Ok(());
                };
                let mut stmt = conn.prepare_cached(
                    "INSERT INTO data (
                        timestamp, unix_timestamp, cycle, step, step_type, step_time_s, total_time_s,
                        voltage_v, current_a, step_ah, cycle_ah, total_ah, temperature_c, notes
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                )?;
                stmt.execute(params![
                    p.timestamp,
                    p.unix_timestamp,
                    p.cycle,
                    p.step as i64,
                    p.step_type,
                    p.step_time_s,
                    p.total_time_s,
                    p.voltage_v,
                    p.current_a,
                    p.step_ah,
                    p.cycle_ah,
                    p.total_ah,
                    p.temperature_c,
                    p.notes,
                ])?;
                Ok(())
            }
            WriteOp::Finish(summary) => self.put_metadata(&summary.metadata_pairs()),
            WriteOp::Row(_) => Ok(()),
        }
    }

    fn close(&mut self) -> Result<(), BridgeError> {
        if let Some(conn) = self.conn.take() {
            conn.close().map_err(|(_, e)| BridgeError::from(e))?;
        }
        Ok(())
    }

    fn name(&self) -> String {
        format!("sqlite {}", self.path.display())
    }
}

/// SQLite database plus CSV file for one cycler run.
pub struct RunLogger {
    label: String,
    writer: BackgroundWriter,
}

impl CyclerSink for RunLogger {
    fn write_point(&mut self, point: &DataPoint) {
        self.writer.send(WriteOp::Point(point.clone()));
    }

    fn finish(&mut self, summary: &RunSummary) {
        self.writer.send(WriteOp::Finish(summary.clone()));
        self.writer.close();
        log::info!("run log closed: {}", self.label);
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}

/// Opens `battery_test_<timestamp>.db` and `.csv` in a directory.
pub struct FileSinkOpener {
    pub dir: PathBuf,
}

impl FileSinkOpener {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn base_name(started_ms: i64) -> String {
        let stamp = iso_millis(started_ms).replace([':', '.'], "-");
        format!("battery_test_{stamp}")
    }
}

impl SinkOpener for FileSinkOpener {
    fn open(&self, header: &RunHeader) -> Result<Box<dyn CyclerSink>, BridgeError> {
        std::fs::create_dir_all(&self.dir).map_err(persistence)?;
        let base = Self::base_name(header.started_ms);
        let db_path = self.dir.join(format!("{base}.db"));
        let csv_path = self.dir.join(format!("{base}.csv"));
        let sqlite = RunSqliteBackend::create(&db_path, header)?;
        let csv = RunCsvBackend::create(&csv_path)?;
        log::info!("battery test logging initialized:");
        log::info!("  SQLite: {}", db_path.display());
        log::info!("  CSV: {}", csv_path.display());
        let label = db_path.display().to_string();
        let writer = BackgroundWriter::spawn(&base, vec![Box::new(sqlite), Box::new(csv)])?;
        Ok(Box::new(RunLogger { label, writer }))
    }
}

// ---------------------------------------------------------------------------
// ad-hoc stream logging

/// Shape of logged lines, fixed by the first line seen.
#[derive(Clone, Debug, PartialEq)]
pub enum RecordEncoding {
    /// JSON array; columns are positions.
    PositionalArray { width: usize },
    /// JSON object; columns are its keys.
    KeyedObject { keys: Vec<String> },
    /// Text split on `,`, tab, `|` or `;`.
    Delimited { width: usize },
}

const DELIMITERS: [char; 4] = [',', '\t', '|', ';'];

fn positional_columns(width: usize) -> Vec<String> {
    (1..=width.max(1)).map(|i| format!("col_{i:02}")).collect()
}

fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

impl RecordEncoding {
    pub fn detect(line: &str) -> Self {
        match serde_json::from_str::<Value>(line) {
            Ok(Value::Array(items)) => RecordEncoding::PositionalArray { width: items.len() },
            Ok(Value::Object(map)) => RecordEncoding::KeyedObject {
                keys: map.keys().cloned().collect(),
            },
            _ => RecordEncoding::Delimited {
                width: line.split(DELIMITERS).count(),
            },
        }
    }

    pub fn default_columns(&self) -> Vec<String> {
        match self {
            RecordEncoding::PositionalArray { width } | RecordEncoding::Delimited { width } => {
                positional_columns(*width)
            }
            RecordEncoding::KeyedObject { keys } => keys.clone(),
        }
    }

    /// Values for `columns`, or `None` when the line does not fit this encoding.
    pub fn extract(&self, line: &str, columns: &[String]) -> Option<Vec<Option<String>>> {
        match self {
            RecordEncoding::PositionalArray { .. } => {
                let Ok(Value::Array(items)) = serde_json::from_str::<Value>(line) else {
                    return None;
                };
                Some(
                    (0..columns.len())
                        .map(|i| items.get(i).and_then(value_text))
                        .collect(),
                )
            }
            RecordEncoding::KeyedObject { .. } => {
                let Ok(Value::Object(map)) = serde_json::from_str::<Value>(line) else {
                    return None;
                };
                Some(
                    columns
                        .iter()
                        .map(|c| map.get(c).and_then(value_text))
                        .collect(),
                )
            }
            RecordEncoding::Delimited { .. } => {
                let parts: Vec<&str> = line.split(DELIMITERS).map(str::trim).collect();
                Some(
                    (0..columns.len())
                        .map(|i| parts.get(i).map(|s| s.to_string()))
                        .collect(),
                )
            }
        }
    }
}

/// Where the ad-hoc logger writes.
#[derive(Clone, Debug, PartialEq)]
pub enum LogTarget {
    Csv { path: PathBuf },
    Sqlite { path: PathBuf, table: String },
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogStatus {
    pub is_logging: bool,
    #[serde(rename = "type")]
    pub kind: Option<&'static str>,
    pub filename: Option<String>,
    pub table_name: Option<String>,
    pub columns: Vec<String>,
    pub schema_detected: bool,
}

struct AdHocCsvBackend {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl AdHocCsvBackend {
    fn open(path: &Path, columns: &[String]) -> Result<Self, BridgeError> {
        let exists = path.exists();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(persistence)?;
        let mut writer = BufWriter::new(file);
        if !exists {
            writeln!(writer, "{}", csv_line(columns.iter().map(String::as_str))).map_err(persistence)?;
        }
        Ok(Self {
            path: path.to_owned(),
            writer: Some(writer),
        })
    }
}

impl Backend for AdHocCsvBackend {
    fn write(&mut self, op: &WriteOp) -> Result<(), BridgeError> {
        match (op, self.writer.as_mut()) {
            (WriteOp::Row(values), Some(w)) => {
                let line = csv_line(values.iter().map(|v| v.as_deref().unwrap_or("")));
                writeln!(w, "{line}").map_err(persistence)
            }
            _ => Ok(()),
        }
    }

    fn close(&mut self) -> Result<(), BridgeError> {
        if let Some(mut w) = self.writer.take() {
            w.flush().map_err(persistence)?;
        }
        Ok(())
    }

    fn name(&self) -> String {
        format!("csv {}", self.path.display())
    }
}

struct AdHocSqliteBackend {
    path: PathBuf,
    conn: Option<Connection>,
    insert_sql: String,
}

impl AdHocSqliteBackend {
    fn open(path: &Path, table: &str, columns: &[String]) -> Result<Self, BridgeError> {
        let conn = Connection::open(path)?;
        let defs = columns
            .iter()
            .map(|c| format!("{} TEXT", sql_ident(c)))
            .collect::<Vec<_>>()
            .join(", ");
        conn.execute_batch(&format!("CREATE TABLE IF NOT EXISTS {} ({defs})", sql_ident(table)))?;
        let names = columns.iter().map(|c| sql_ident(c)).collect::<Vec<_>>().join(", ");
        let placeholders = (1..=columns.len()).map(|i| format!("?{i}")).collect::<Vec<_>>().join(", ");
        Ok(Self {
            path: path.to_owned(),
            conn: Some(conn),
            insert_sql: format!("INSERT INTO {} ({names}) VALUES ({placeholders})", sql_ident(table)),
        })
    }
}

impl Backend for AdHocSqliteBackend {
    fn write(&mut self, op: &WriteOp) -> Result<(), BridgeError> {
        match (op, &self.conn) {
            (WriteOp::Row(values), Some(conn)) => {
                let mut stmt = conn.prepare_cached(&self.insert_sql)?;
                stmt.execute(rusqlite::params_from_iter(values.iter()))?;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn close(&mut self) -> Result<(), BridgeError> {
        if let Some(conn) = self.conn.take() {
            conn.close().map_err(|(_, e)| BridgeError::from(e))?;
        }
        Ok(())
    }

    fn name(&self) -> String {
        format!("sqlite {}", self.path.display())
    }
}

/// General-purpose logger for raw stream lines.
#[derive(Default)]
pub struct AdHocLogger {
    target: Option<LogTarget>,
    columns: Vec<String>,
    encoding: Option<RecordEncoding>,
    writer: Option<BackgroundWriter>,
}

impl AdHocLogger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts logging to `target`, stopping any active log first.
    /// Empty `columns` means detect them from the first line.
    pub fn start(&mut self, target: LogTarget, columns: Vec<String>) {
        self.stop();
        log::info!("started logging to {target:?}");
        self.target = Some(target);
        self.columns = columns;
    }

    pub fn stop(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            writer.close();
        }
        if self.target.take().is_some() {
            log::info!("logging stopped and resources cleaned up");
        }
        self.columns.clear();
        self.encoding = None;
    }

    pub fn is_logging(&self) -> bool {
        self.target.is_some()
    }

    pub fn log_line(&mut self, line: &str) {
        let Some(target) = self.target.clone() else {
            return;
        };
        let cleaned = line.replace(['\r', '\n'], "");
        let cleaned = cleaned.trim();
        if cleaned.is_empty() {
            return;
        }
        if self.encoding.is_none() {
            let encoding = RecordEncoding::detect(cleaned);
            if self.columns.is_empty() {
                self.columns = encoding.default_columns();
            }
            let opened: Result<Box<dyn Backend>, BridgeError> = match &target {
                LogTarget::Csv { path } => {
                    AdHocCsvBackend::open(path, &self.columns).map(|b| Box::new(b) as Box<dyn Backend>)
                }
                LogTarget::Sqlite { path, table } => AdHocSqliteBackend::open(path, table, &self.columns)
                    .map(|b| Box::new(b) as Box<dyn Backend>),
            };
            match opened.and_then(|b| BackgroundWriter::spawn("adhoc", vec![b])) {
                Ok(writer) => self.writer = Some(writer),
                Err(e) => {
                    log::error!("could not open log {target:?}: {e}");
                    self.stop();
                    return;
                }
            }
            log::debug!("log schema detected: {encoding:?} -> {:?}", self.columns);
            self.encoding = Some(encoding);
        }
        let (Some(encoding), Some(writer)) = (&self.encoding, &self.writer) else {
            return;
        };
        match encoding.extract(cleaned, &self.columns) {
            Some(values) => writer.send(WriteOp::Row(values)),
            None => log::debug!("line does not match log schema, skipped: {cleaned}"),
        }
    }

    pub fn status(&self) -> LogStatus {
        let (kind, filename, table_name) = match &self.target {
            Some(LogTarget::Csv { path }) => (Some("csv"), Some(path.display().to_string()), None),
            Some(LogTarget::Sqlite { path, table }) => {
                (Some("sqlite"), Some(path.display().to_string()), Some(table.clone()))
            }
            None => (None, None, None),
        };
        LogStatus {
            is_logging: self.target.is_some(),
            kind,
            filename,
            table_name,
            columns: self.columns.clone(),
            schema_detected: self.encoding.is_some(),
        }
    }
}
