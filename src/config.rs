use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::drivers::BridgeError;
use crate::types::SerialSettings;

/// Bounds applied to telemetry lines before they reach the cycler.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryLimits {
    pub min_abs_voltage: f64,
    pub max_abs_voltage: f64,
    pub max_abs_current: f64,
    /// Longer lines are status chatter, not measurements.
    pub max_line_len: usize,
    /// Substrings that mark a line as a command acknowledgment.
    pub ack_tokens: Vec<String>,
}

impl Default for TelemetryLimits {
    fn default() -> Self {
        Self {
            min_abs_voltage: 0.1,
            max_abs_voltage: 50.0,
            max_abs_current: 100.0,
            max_line_len: 50,
            ack_tokens: ["OK", "ERROR", "MEAS", "SOUR", "OUTP"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Ring buffer bound, in bytes of decoded text.
    pub buffer_capacity: usize,
    /// Per-channel sample history bound.
    pub series_capacity: usize,
    pub line_ending: String,
    pub stream_settle_ms: u64,
    pub reply_delay_ms: u64,
    pub log_dir: PathBuf,
    pub telemetry: TelemetryLimits,
    pub serial: Option<SerialSettings>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 10_000,
            series_capacity: 10_000,
            line_ending: "\r\n".to_owned(),
            stream_settle_ms: 1000,
            reply_delay_ms: 200,
            log_dir: PathBuf::from("."),
            telemetry: TelemetryLimits::default(),
            serial: None,
        }
    }
}

impl BridgeConfig {
    pub fn load(path: &Path) -> Result<Self, BridgeError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| BridgeError::Config(format!("{}: {e}", path.display())))?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.buffer_capacity == 0 {
            return Err(BridgeError::Config("buffer_capacity must be greater than zero".into()));
        }
        if self.series_capacity == 0 {
            return Err(BridgeError::Config("series_capacity must be greater than zero".into()));
        }
        let t = &self.telemetry;
        if t.min_abs_voltage > t.max_abs_voltage {
            return Err(BridgeError::Config(format!(
                "telemetry voltage range is empty: {} > {}",
                t.min_abs_voltage, t.max_abs_voltage
            )));
        }
        Ok(())
    }
}
