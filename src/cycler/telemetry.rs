//! Picks plausible measurements out of a noisy line stream.
//!
//! Anything that does not look like a measurement is dropped without error.

use serde::Serialize;

use crate::config::TelemetryLimits;
use crate::drivers::{classify_line, Classified};
use crate::types::Channel;

/// A voltage/current pair accepted for the cycler.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Measurement {
    pub voltage_v: f64,
    pub current_a: f64,
    pub time_ms: i64,
}

fn is_timestamp_echo(line: &str) -> bool {
    line.len() >= 10 && line.bytes().all(|b| b.is_ascii_digit())
}

fn is_chatter(line: &str, limits: &TelemetryLimits) -> bool {
    line.contains(':')
        || is_timestamp_echo(line)
        || line.len() > limits.max_line_len
        || limits.ack_tokens.iter().any(|t| line.contains(t.as_str()))
}

fn voltage_in_range(v: f64, limits: &TelemetryLimits) -> bool {
    v.is_finite() && (limits.min_abs_voltage..=limits.max_abs_voltage).contains(&v.abs())
}

fn current_in_range(i: f64, limits: &TelemetryLimits) -> bool {
    i.is_finite() && i.abs() <= limits.max_abs_current
}

/// Parses a demultiplexed line into a measurement for `channel`.
///
/// Accepts, in order: a classified channel sample for `channel`, a bare
/// `voltage,current` pair, or a bare voltage (current taken as zero, as seen
/// during open-circuit and rest steps).
pub fn parse_measurement(
    line: &str,
    classified: &Classified,
    channel: Channel,
    limits: &TelemetryLimits,
    now_ms: i64,
) -> Option<Measurement> {
    let line = line.trim();
    if line.is_empty() || is_chatter(line, limits) {
        return None;
    }
    let (voltage_v, current_a) = match classified {
        Classified::Sample(sample) if sample.channel == channel => (sample.voltage_v, sample.current_a),
        Classified::Sample(_) => return None,
        Classified::Other(_) => parse_bare(line)?,
    };
    if !voltage_in_range(voltage_v, limits) || !current_in_range(current_a, limits) {
        log::trace!("out of range telemetry dropped: {line}");
        return None;
    }
    Some(Measurement {
        voltage_v,
        current_a,
        time_ms: now_ms,
    })
}

fn parse_bare(line: &str) -> Option<(f64, f64)> {
    if line.contains(',') {
        let mut parts = line.split(',');
        let (v, i) = (parts.next()?, parts.next()?);
        if parts.next().is_some() {
            return None;
        }
        Some((v.trim().parse().ok()?, i.trim().parse().ok()?))
    } else {
        Some((line.parse().ok()?, 0.0))
    }
}

/// Convenience for lines that have not been through the demultiplexer.
pub fn parse_line(line: &str, channel: Channel, limits: &TelemetryLimits, now_ms: i64) -> Option<Measurement> {
    let classified = match classify_line(line.trim(), now_ms) {
        Some(sample) => Classified::Sample(sample),
        None => Classified::Other(line.trim().to_owned()),
    };
    parse_measurement(line, &classified, channel, limits, now_ms)
}
