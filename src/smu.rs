//! Command protocol for the source-measure unit.
//!
//! Each semantic operation becomes one or more ASCII writes on the link and
//! is mirrored into [`SmuState`]. The device never tags replies, so queries
//! only send; their answers are picked up later from the stream buffer by
//! whoever asked, and must be treated as advisory.

use serde::Serialize;

use crate::drivers::{BridgeError, LinkWriter};
use crate::types::{Channel, SmuOp, SmuQuery, VoltageRange};

/// Source mode of a channel.
#[derive(PartialEq, Eq, Clone, Copy, Debug, Serialize)]
pub enum SourceMode {
    /// Force voltage, measure current.
    #[serde(rename = "FVMI")]
    ForceVoltage,
    /// Force current, measure voltage.
    #[serde(rename = "FIMV")]
    ForceCurrent,
}

impl SourceMode {
    pub fn keyword(self) -> &'static str {
        match self {
            SourceMode::ForceVoltage => "FVMI",
            SourceMode::ForceCurrent => "FIMV",
        }
    }
}

/// Last commanded values of one channel.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelMirror {
    pub potential: f64,
    pub current: f64,
    pub enabled: bool,
    pub streaming: bool,
    pub sample_rate: u32,
    pub mode: Option<SourceMode>,
}

impl Default for ChannelMirror {
    fn default() -> Self {
        Self {
            potential: 0.0,
            current: 0.0,
            enabled: false,
            streaming: false,
            sample_rate: 1000,
            mode: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SmuState {
    pub channel1: ChannelMirror,
    pub channel2: ChannelMirror,
    pub led_brightness: u8,
}

impl Default for SmuState {
    fn default() -> Self {
        Self {
            channel1: ChannelMirror::default(),
            channel2: ChannelMirror::default(),
            led_brightness: 50,
        }
    }
}

impl SmuState {
    pub fn channel(&self, channel: Channel) -> &ChannelMirror {
        match channel {
            Channel::One => &self.channel1,
            Channel::Two => &self.channel2,
        }
    }

    fn channel_mut(&mut self, channel: Channel) -> &mut ChannelMirror {
        match channel {
            Channel::One => &mut self.channel1,
            Channel::Two => &mut self.channel2,
        }
    }
}

/// Instrument operations the cycler drives.
pub trait Instrument {
    fn set_current(&mut self, channel: Channel, amps: f64) -> Result<(), BridgeError>;
    fn set_voltage(&mut self, channel: Channel, volts: f64) -> Result<(), BridgeError>;
    fn enable_channel(&mut self, channel: Channel) -> Result<(), BridgeError>;
    fn disable_channel(&mut self, channel: Channel) -> Result<(), BridgeError>;
    fn start_streaming(&mut self, channel: Channel) -> Result<(), BridgeError>;
    fn stop_streaming(&mut self, channel: Channel) -> Result<(), BridgeError>;
}

pub struct SmuProtocol {
    link: Option<Box<dyn LinkWriter>>,
    line_ending: String,
    state: SmuState,
}

impl SmuProtocol {
    pub fn new(line_ending: &str) -> Self {
        Self {
            link: None,
            line_ending: line_ending.to_owned(),
            state: SmuState::default(),
        }
    }

    pub fn attach(&mut self, link: Box<dyn LinkWriter>) {
        log::info!("link attached: {}", link.describe());
        self.link = Some(link);
    }

    pub fn detach(&mut self) -> Option<Box<dyn LinkWriter>> {
        self.link.take()
    }

    pub fn state(&self) -> &SmuState {
        &self.state
    }

    pub fn line_ending(&self) -> &str {
        &self.line_ending
    }

    /// Writes `text` followed by `line_ending` without touching the mirror.
    pub fn write_raw(&mut self, text: &str, line_ending: &str) -> Result<(), BridgeError> {
        let link = self
            .link
            .as_mut()
            .ok_or_else(|| BridgeError::Transport("no instrument link attached".into()))?;
        log::debug!("[serial out] {text}");
        link.write_text(&format!("{text}{line_ending}"))
    }

    fn send(&mut self, text: &str) -> Result<(), BridgeError> {
        let ending = self.line_ending.clone();
        self.write_raw(text, &ending)
    }

    pub fn set_source_mode(&mut self, channel: Channel, mode: SourceMode) -> Result<(), BridgeError> {
        self.send(&format!("SOUR{channel}:{} ENA", mode.keyword()))?;
        self.state.channel_mut(channel).mode = Some(mode);
        Ok(())
    }

    pub fn set_voltage_range(&mut self, channel: Channel, range: VoltageRange) -> Result<(), BridgeError> {
        self.send(&format!("SOUR{channel}:VOLT:RANGE {}", range.as_str()))
    }

    pub fn set_sample_rate(&mut self, channel: Channel, rate: u32) -> Result<(), BridgeError> {
        self.send(&format!("SOUR{channel}:DATA:SRATE {rate}"))?;
        self.state.channel_mut(channel).sample_rate = rate;
        Ok(())
    }

    /// Resets the device and the mirrored channel records.
    pub fn reset(&mut self) -> Result<(), BridgeError> {
        self.send("*RST")?;
        self.state.channel1 = ChannelMirror::default();
        self.state.channel2 = ChannelMirror::default();
        Ok(())
    }

    pub fn set_led_brightness(&mut self, brightness: u8) -> Result<(), BridgeError> {
        if brightness > 100 {
            return Err(BridgeError::validation(
                None,
                format!("LED brightness must be between 0 and 100, got {brightness}"),
            ));
        }
        self.send(&format!("SYST:LED {brightness}"))?;
        self.state.led_brightness = brightness;
        Ok(())
    }

    pub fn set_time(&mut self, epoch_s: i64) -> Result<(), BridgeError> {
        self.send(&format!("SYST:TIME {epoch_s}"))
    }

    pub fn set_wifi_credentials(&mut self, ssid: &str, password: &str) -> Result<(), BridgeError> {
        self.send(&format!("SYST:WIFI:SSID \"{ssid}\""))?;
        self.send(&format!("SYST:WIFI:PASS \"{password}\""))
    }

    pub fn set_wifi_enabled(&mut self, enabled: bool) -> Result<(), BridgeError> {
        self.send(if enabled { "SYST:WIFI ENA" } else { "SYST:WIFI DIS" })
    }

    /// Sends a query. The reply, if any, shows up later on the stream.
    pub fn query(&mut self, query: SmuQuery) -> Result<(), BridgeError> {
        let text = match query {
            SmuQuery::Identity => "*IDN?".to_owned(),
            SmuQuery::Temperatures => "SYST:TEMP?".to_owned(),
            SmuQuery::LedBrightness => "SYST:LED?".to_owned(),
            SmuQuery::WifiStatus => "SYST:WIFI?".to_owned(),
            SmuQuery::WifiScan => "SYST:WIFI:SCAN?".to_owned(),
            SmuQuery::MeasureVoltage(ch) => format!("MEAS{ch}:VOLT?"),
            SmuQuery::MeasureCurrent(ch) => format!("MEAS{ch}:CURR?"),
            SmuQuery::MeasureVoltageAndCurrent(ch) => format!("MEAS{ch}:VOLT:CURR?"),
        };
        self.send(&text)
    }

    pub fn apply(&mut self, op: &SmuOp) -> Result<(), BridgeError> {
        match op {
            SmuOp::SetCurrent(ch, amps) => self.set_current(*ch, *amps),
            SmuOp::SetVoltage(ch, volts) => self.set_voltage(*ch, *volts),
            SmuOp::SetSourceMode(ch, mode) => self.set_source_mode(*ch, *mode),
            SmuOp::Enable(ch) => self.enable_channel(*ch),
            SmuOp::Disable(ch) => self.disable_channel(*ch),
            SmuOp::SetVoltageRange(ch, range) => self.set_voltage_range(*ch, *range),
            SmuOp::SetSampleRate(ch, rate) => self.set_sample_rate(*ch, *rate),
            SmuOp::StartStreaming(ch) => self.start_streaming(*ch),
            SmuOp::StopStreaming(ch) => self.stop_streaming(*ch),
            SmuOp::Reset => self.reset(),
            SmuOp::SetLedBrightness(b) => self.set_led_brightness(*b),
            SmuOp::SetTime(t) => self.set_time(*t),
            SmuOp::SetWifiCredentials { ssid, password } => self.set_wifi_credentials(ssid, password),
            SmuOp::EnableWifi => self.set_wifi_enabled(true),
            SmuOp::DisableWifi => self.set_wifi_enabled(false),
        }
    }
}

impl Instrument for SmuProtocol {
    fn set_current(&mut self, channel: Channel, amps: f64) -> Result<(), BridgeError> {
        if self.state.channel(channel).mode != Some(SourceMode::ForceCurrent) {
            self.set_source_mode(channel, SourceMode::ForceCurrent)?;
        }
        self.send(&format!("SOUR{channel}:CURR {amps}"))?;
        self.state.channel_mut(channel).current = amps;
        Ok(())
    }

    fn set_voltage(&mut self, channel: Channel, volts: f64) -> Result<(), BridgeError> {
        if self.state.channel(channel).mode != Some(SourceMode::ForceVoltage) {
            self.set_source_mode(channel, SourceMode::ForceVoltage)?;
        }
        self.send(&format!("SOUR{channel}:VOLT {volts}"))?;
        self.state.channel_mut(channel).potential = volts;
        Ok(())
    }

    fn enable_channel(&mut self, channel: Channel) -> Result<(), BridgeError> {
        self.send(&format!("OUTP{channel} ON"))?;
        self.state.channel_mut(channel).enabled = true;
        Ok(())
    }

    fn disable_channel(&mut self, channel: Channel) -> Result<(), BridgeError> {
        self.send(&format!("OUTP{channel} OFF"))?;
        self.state.channel_mut(channel).enabled = false;
        Ok(())
    }

    fn start_streaming(&mut self, channel: Channel) -> Result<(), BridgeError> {
        self.send(&format!("SOUR{channel}:DATA:STREAM ON"))?;
        self.state.channel_mut(channel).streaming = true;
        Ok(())
    }

    fn stop_streaming(&mut self, channel: Channel) -> Result<(), BridgeError> {
        self.send(&format!("SOUR{channel}:DATA:STREAM OFF"))?;
        self.state.channel_mut(channel).streaming = false;
        Ok(())
    }
}
