// src/types.rs
use serde::{Deserialize, Serialize};

use crate::cycler::{Measurement, Step, StepDefinition};
use crate::recorder::{LogStatus, TestMetadata};

/// Instrument channel. The device exposes exactly two.
#[derive(PartialEq, Eq, Clone, Copy, Debug, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Channel {
    One,
    Two,
}

impl Channel {
    pub fn number(self) -> u8 {
        match self {
            Channel::One => 1,
            Channel::Two => 2,
        }
    }

    pub fn from_number(n: u8) -> Option<Self> {
        match n {
            1 => Some(Channel::One),
            2 => Some(Channel::Two),
            _ => None,
        }
    }

    pub fn all() -> [Channel; 2] {
        [Channel::One, Channel::Two]
    }
}

impl TryFrom<u8> for Channel {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Channel::from_number(value).ok_or_else(|| format!("channel must be 1 or 2, got {value}"))
    }
}

impl From<Channel> for u8 {
    fn from(value: Channel) -> Self {
        value.number()
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.number())
    }
}

/// One measurement line demultiplexed from the stream.
///
/// `current_a` follows the source-positive convention: the device reports
/// sink current as positive, so the raw field is negated on parse.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct ChannelSample {
    pub channel: Channel,
    /// Local wall-clock epoch millis; the device timestamp is discarded.
    pub time_ms: i64,
    pub voltage_v: f64,
    pub current_a: f64,
}

/// Line ending used for a raw passthrough write.
#[derive(PartialEq, Eq, Clone, Copy, Debug, Default)]
pub enum LineEnding {
    #[default]
    Configured,
    CrLf,
    Lf,
    None,
}

/// Read-only instrument queries whose replies arrive asynchronously.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum SmuQuery {
    Identity,
    Temperatures,
    LedBrightness,
    WifiStatus,
    WifiScan,
    MeasureVoltage(Channel),
    MeasureCurrent(Channel),
    MeasureVoltageAndCurrent(Channel),
}

/// Source range selector accepted by the instrument.
#[derive(PartialEq, Eq, Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum VoltageRange {
    Auto,
    Low,
    High,
}

impl VoltageRange {
    pub fn as_str(self) -> &'static str {
        match self {
            VoltageRange::Auto => "AUTO",
            VoltageRange::Low => "LOW",
            VoltageRange::High => "HIGH",
        }
    }
}

/// Semantic instrument operations accepted by the bridge.
#[derive(Clone, Debug, PartialEq)]
pub enum SmuOp {
    SetCurrent(Channel, f64),
    SetVoltage(Channel, f64),
    SetSourceMode(Channel, crate::smu::SourceMode),
    Enable(Channel),
    Disable(Channel),
    SetVoltageRange(Channel, VoltageRange),
    SetSampleRate(Channel, u32),
    StartStreaming(Channel),
    StopStreaming(Channel),
    Reset,
    SetLedBrightness(u8),
    SetTime(i64),
    SetWifiCredentials { ssid: String, password: String },
    EnableWifi,
    DisableWifi,
}

/// Where a serial link should be opened.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialSettings {
    pub path: String,
    pub baud: u32,
}

/// Request to start a cycler run.
#[derive(Clone, Debug)]
pub struct CyclerRequest {
    pub channel: Channel,
    pub steps: Vec<StepDefinition>,
    /// Zero means repeat until stopped.
    pub cycles: u32,
    pub enable_logging: bool,
    pub metadata: TestMetadata,
}

/// Commands sent into the bridge engine thread.
#[derive(Debug)]
pub enum BridgeCommand {
    /// Raw bytes delivered by the transport reader.
    Transport(Vec<u8>),
    /// The transport reader saw the port close or fail.
    LinkLost(String),
    Connect(SerialSettings),
    Disconnect,
    WriteRaw(String, LineEnding),
    Smu(SmuOp),
    /// Issue a query and deliver the advisory reply after the reply delay.
    Query(SmuQuery, std::sync::mpsc::Sender<Option<String>>),
    StartCycler(CyclerRequest, std::sync::mpsc::Sender<Result<(), String>>),
    StopCycler,
    PauseCycler(std::sync::mpsc::Sender<Result<(), String>>),
    ResumeCycler(std::sync::mpsc::Sender<Result<(), String>>),
    StartCsvLog {
        path: std::path::PathBuf,
        columns: Vec<String>,
    },
    StartSqliteLog {
        path: std::path::PathBuf,
        table: String,
        columns: Vec<String>,
    },
    StopLog,
    Snapshot(std::sync::mpsc::Sender<Snapshot>),
    Shutdown,
}

/// Point-in-time view of the bridge, used by front-ends.
#[derive(Clone, Debug, Serialize)]
pub struct Snapshot {
    pub buffer: String,
    pub last_heard_ms: Option<i64>,
    pub last_samples: Vec<ChannelSample>,
    pub cycler: CyclerStatus,
    pub smu: crate::smu::SmuState,
    pub log: LogStatus,
}

/// State of the serial link as seen by the engine.
#[derive(PartialEq, Eq, Clone, Copy, Debug, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    Open,
    Closed,
    Error,
}

/// Lifecycle flag published on cycler transitions.
#[derive(PartialEq, Eq, Clone, Copy, Debug, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CyclerPhase {
    Running,
    Paused,
    Stopped,
}

/// Messages published by the engine. Delivery is best effort.
#[derive(Clone, Debug)]
pub enum BridgeEvent {
    Link(LinkState, String),
    /// Decoded text of every transport delivery.
    Data(String),
    Sample(ChannelSample),
    OtherLine(String),
    CyclerData(crate::cycler::DataPoint),
    CyclerStatus(CyclerPhase),
    StepCompleted { cycle: u32, step_index: usize, reason: String },
    CycleCompleted(u32),
}

/// Snapshot of the cycler context.
#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CyclerStatus {
    pub is_running: bool,
    pub is_paused: bool,
    pub channel: Option<Channel>,
    pub current_cycle: u32,
    pub total_cycles: u32,
    pub current_step_index: usize,
    pub current_step: Option<Step>,
    pub step_time: f64,
    pub total_time: f64,
    pub step_ah: f64,
    pub cycle_ah: f64,
    pub total_ah: f64,
    pub log_file: Option<String>,
    pub total_steps: usize,
    pub last_measurement: Option<Measurement>,
}
