//! Splits the continuous serial stream into per-channel measurement series.
//!
//! Every delivery is appended to a bounded text buffer. When the delivery
//! completes at least one line, the newest *complete* line (the one before
//! the possibly partial tail) is classified by its channel prefix. This keeps
//! classification one line behind the freshest byte.

use crate::drivers::buffer::{RingBuffer, SampleSeries};
use crate::drivers::BridgeError;
use crate::types::{Channel, ChannelSample};

/// Result of classifying one completed line.
#[derive(Clone, Debug, PartialEq)]
pub enum Classified {
    Sample(ChannelSample),
    Other(String),
}

/// What a single `ingest` call produced.
#[derive(Clone, Debug, PartialEq)]
pub struct Ingested {
    /// Decoded text of the delivery itself.
    pub chunk_text: String,
    /// The classified line, when the delivery completed one.
    pub line: Option<(String, Classified)>,
}

pub struct StreamDemux {
    ring: RingBuffer,
    ch1: SampleSeries<ChannelSample>,
    ch2: SampleSeries<ChannelSample>,
    other: SampleSeries<String>,
    last_heard_ms: Option<i64>,
}

impl StreamDemux {
    pub fn new(buffer_capacity: usize, series_capacity: usize) -> Result<Self, BridgeError> {
        Ok(Self {
            ring: RingBuffer::with_capacity(buffer_capacity)?,
            ch1: SampleSeries::with_capacity(series_capacity),
            ch2: SampleSeries::with_capacity(series_capacity),
            other: SampleSeries::with_capacity(series_capacity),
            last_heard_ms: None,
        })
    }

    pub fn ingest(&mut self, chunk: &[u8], now_ms: i64) -> Ingested {
        let chunk_text = String::from_utf8_lossy(chunk).into_owned();
        self.ring.push_str(&chunk_text);
        self.last_heard_ms = Some(now_ms);
        if !chunk.contains(&b'\n') {
            return Ingested {
                chunk_text,
                line: None,
            };
        }
        let Some(line) = self.ring.last_completed_line().map(str::to_owned) else {
            return Ingested {
                chunk_text,
                line: None,
            };
        };
        log::trace!("{line}");
        let classified = match classify_line(&line, now_ms) {
            Some(sample) => {
                self.series_mut(sample.channel).push(sample);
                Classified::Sample(sample)
            }
            None => {
                self.other.push(line.clone());
                Classified::Other(line.clone())
            }
        };
        Ingested {
            chunk_text,
            line: Some((line, classified)),
        }
    }

    pub fn buffer(&self) -> &str {
        self.ring.as_str()
    }

    /// Most recently completed line, used as the advisory reply to queries.
    pub fn last_line(&self) -> Option<&str> {
        self.ring.last_completed_line()
    }

    pub fn last_heard_ms(&self) -> Option<i64> {
        self.last_heard_ms
    }

    pub fn last_sample(&self, channel: Channel) -> Option<ChannelSample> {
        self.series(channel).latest().copied()
    }

    pub fn series(&self, channel: Channel) -> &SampleSeries<ChannelSample> {
        match channel {
            Channel::One => &self.ch1,
            Channel::Two => &self.ch2,
        }
    }

    pub fn other_lines(&self) -> &SampleSeries<String> {
        &self.other
    }

    fn series_mut(&mut self, channel: Channel) -> &mut SampleSeries<ChannelSample> {
        match channel {
            Channel::One => &mut self.ch1,
            Channel::Two => &mut self.ch2,
        }
    }
}

/// Parses `channel,device_time,voltage,current` lines.
///
/// Returns `None` for anything that does not start with `1,` or `2,` or whose
/// numeric fields do not parse; such lines are kept as plain text.
pub fn classify_line(line: &str, now_ms: i64) -> Option<ChannelSample> {
    let channel = if line.starts_with("1,") {
        Channel::One
    } else if line.starts_with("2,") {
        Channel::Two
    } else {
        return None;
    };
    let mut fields = line.split(',').skip(2);
    let voltage_v = fields.next()?.trim().parse::<f64>().ok()?;
    // firmware sometimes prints exponents as `e-05`
    let raw_current = fields.next()?.trim().replace("e-0", "e-");
    let current_a = -raw_current.parse::<f64>().ok()?;
    Some(ChannelSample {
        channel,
        time_ms: now_ms,
        voltage_v,
        current_a,
    })
}
