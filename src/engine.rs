// src/engine.rs
//! Bridge engine: owns the stream, the instrument protocol, the cycler and
//! the ad-hoc logger, and drives them from a single command queue.

use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::config::BridgeConfig;
use crate::cycler::{validate_steps, Cycler, Step, StepDefinition};
use crate::drivers::{BridgeError, Classified, LinkWriter, SerialLink, StreamDemux};
use crate::recorder::{AdHocLogger, FileSinkOpener, LogTarget};
use crate::smu::{SmuProtocol, SmuState};
use crate::types::*;

const IDLE_POLL: Duration = Duration::from_millis(20);

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

struct PendingReply {
    due_ms: i64,
    reply: Sender<Option<String>>,
}

pub struct Bridge {
    config: BridgeConfig,
    demux: StreamDemux,
    smu: SmuProtocol,
    cycler: Cycler,
    adhoc: AdHocLogger,
    events: Sender<BridgeEvent>,
    pending: Vec<PendingReply>,
    /// Handed to serial readers so their chunks come back through the queue.
    commands: Option<Sender<BridgeCommand>>,
}

impl Bridge {
    pub fn new(config: BridgeConfig, events: Sender<BridgeEvent>) -> Result<Self, BridgeError> {
        config.validate()?;
        let demux = StreamDemux::new(config.buffer_capacity, config.series_capacity)?;
        let smu = SmuProtocol::new(&config.line_ending);
        let cycler = Cycler::new(
            config.telemetry.clone(),
            config.stream_settle_ms,
            Some(Box::new(FileSinkOpener::new(config.log_dir.clone()))),
            Some(events.clone()),
        );
        Ok(Self {
            config,
            demux,
            smu,
            cycler,
            adhoc: AdHocLogger::new(),
            events,
            pending: Vec::new(),
            commands: None,
        })
    }

    pub fn set_command_sender(&mut self, commands: Sender<BridgeCommand>) {
        self.commands = Some(commands);
    }

    fn emit(&self, event: BridgeEvent) {
        // front-end may have gone away
        let _ = self.events.send(event);
    }

    /// Attaches an already-open link, replacing any previous one.
    pub fn attach_link(&mut self, link: Box<dyn LinkWriter>) {
        let name = link.describe();
        self.disconnect();
        self.smu.attach(link);
        self.emit(BridgeEvent::Link(LinkState::Open, name));
    }

    pub fn connect(&mut self, settings: &SerialSettings) -> Result<(), BridgeError> {
        let commands = self
            .commands
            .clone()
            .ok_or_else(|| BridgeError::Lifecycle("engine has no command queue for the reader".into()))?;
        self.disconnect();
        let link = SerialLink::open(&settings.path, settings.baud, commands)?;
        self.attach_link(Box::new(link));
        Ok(())
    }

    pub fn disconnect(&mut self) {
        if let Some(link) = self.smu.detach() {
            log::info!("serial port closed: {}", link.describe());
            self.emit(BridgeEvent::Link(LinkState::Closed, link.describe()));
        }
    }

    /// Handles one command. Returns `false` once the engine should exit.
    pub fn handle(&mut self, cmd: BridgeCommand, now_ms: i64) -> bool {
        match cmd {
            BridgeCommand::Transport(bytes) => self.on_data(&bytes, now_ms),
            BridgeCommand::LinkLost(reason) => {
                log::error!("serial link lost: {reason}");
                self.smu.detach();
                self.emit(BridgeEvent::Link(LinkState::Error, reason));
            }
            BridgeCommand::Connect(settings) => {
                if let Err(e) = self.connect(&settings) {
                    log::error!("failed to open {}: {e}", settings.path);
                    self.emit(BridgeEvent::Link(LinkState::Error, e.to_string()));
                }
            }
            BridgeCommand::Disconnect => self.disconnect(),
            BridgeCommand::WriteRaw(text, ending) => {
                if let Err(e) = self.write_raw(&text, ending) {
                    log::error!("raw write failed: {e}");
                }
            }
            BridgeCommand::Smu(op) => {
                if let Err(e) = self.smu.apply(&op) {
                    log::error!("{op:?} failed: {e}");
                }
            }
            BridgeCommand::Query(query, reply) => self.query(query, reply, now_ms),
            BridgeCommand::StartCycler(request, reply) => {
                let result = self.start_cycler(request, now_ms).map_err(|e| e.to_string());
                let _ = reply.send(result);
            }
            BridgeCommand::StopCycler => self.stop_cycler(now_ms),
            BridgeCommand::PauseCycler(reply) => {
                let _ = reply.send(self.cycler.pause().map_err(|e| e.to_string()));
            }
            BridgeCommand::ResumeCycler(reply) => {
                let _ = reply.send(self.cycler.resume().map_err(|e| e.to_string()));
            }
            BridgeCommand::StartCsvLog { path, columns } => {
                self.adhoc.start(LogTarget::Csv { path }, columns);
            }
            BridgeCommand::StartSqliteLog { path, table, columns } => {
                self.adhoc.start(LogTarget::Sqlite { path, table }, columns);
            }
            BridgeCommand::StopLog => self.adhoc.stop(),
            BridgeCommand::Snapshot(reply) => {
                let _ = reply.send(self.snapshot(now_ms));
            }
            BridgeCommand::Shutdown => {
                self.shutdown(now_ms);
                return false;
            }
        }
        true
    }

    /// Feeds one transport delivery through the demultiplexer, the ad-hoc
    /// logger and the cycler.
    pub fn on_data(&mut self, chunk: &[u8], now_ms: i64) {
        let ingested = self.demux.ingest(chunk, now_ms);
        self.emit(BridgeEvent::Data(ingested.chunk_text));
        let Some((line, classified)) = ingested.line else {
            return;
        };
        match &classified {
            Classified::Sample(sample) => self.emit(BridgeEvent::Sample(*sample)),
            Classified::Other(text) => self.emit(BridgeEvent::OtherLine(text.clone())),
        }
        self.adhoc.log_line(&line);
        self.cycler.tick(&line, &classified, &mut self.smu, now_ms);
    }

    /// Runs deferred work that has come due.
    pub fn poll(&mut self, now_ms: i64) {
        self.cycler.poll(&mut self.smu, now_ms);
        if self.pending.iter().any(|p| now_ms >= p.due_ms) {
            let latest = self.demux.last_line().map(str::to_owned);
            self.pending.retain(|p| {
                if now_ms >= p.due_ms {
                    let _ = p.reply.send(latest.clone());
                    false
                } else {
                    true
                }
            });
        }
    }

    pub fn write_raw(&mut self, text: &str, ending: LineEnding) -> Result<(), BridgeError> {
        let ending = match ending {
            LineEnding::Configured => self.smu.line_ending().to_owned(),
            LineEnding::CrLf => "\r\n".to_owned(),
            LineEnding::Lf => "\n".to_owned(),
            LineEnding::None => String::new(),
        };
        self.smu.write_raw(text, &ending)
    }

    /// Sends a query; the latest completed line is delivered after the reply delay.
    /// The reply is advisory and may be unrelated to the query.
    pub fn query(&mut self, query: SmuQuery, reply: Sender<Option<String>>, now_ms: i64) {
        if let Err(e) = self.smu.query(query) {
            log::error!("{query:?} failed: {e}");
            let _ = reply.send(None);
            return;
        }
        self.pending.push(PendingReply {
            due_ms: now_ms + self.config.reply_delay_ms as i64,
            reply,
        });
    }

    pub fn start_cycler(&mut self, request: CyclerRequest, now_ms: i64) -> Result<(), BridgeError> {
        self.cycler.start(request, &mut self.smu, now_ms)
    }

    pub fn stop_cycler(&mut self, now_ms: i64) {
        self.cycler.stop(&mut self.smu, now_ms);
    }

    pub fn validate_steps(&self, steps: &[StepDefinition]) -> Result<Vec<Step>, BridgeError> {
        validate_steps(steps)
    }

    pub fn buffer(&self) -> &str {
        self.demux.buffer()
    }

    pub fn last_sample(&self, channel: Channel) -> Option<ChannelSample> {
        self.demux.last_sample(channel)
    }

    pub fn cycler_status(&self, now_ms: i64) -> CyclerStatus {
        self.cycler.status(now_ms)
    }

    pub fn smu_state(&self) -> &SmuState {
        self.smu.state()
    }

    pub fn cycler(&self) -> &Cycler {
        &self.cycler
    }

    pub fn snapshot(&self, now_ms: i64) -> Snapshot {
        Snapshot {
            buffer: self.buffer().to_owned(),
            last_heard_ms: self.demux.last_heard_ms(),
            last_samples: Channel::all()
                .into_iter()
                .filter_map(|ch| self.demux.last_sample(ch))
                .collect(),
            cycler: self.cycler.status(now_ms),
            smu: self.smu.state().clone(),
            log: self.adhoc.status(),
        }
    }

    pub fn shutdown(&mut self, now_ms: i64) {
        self.cycler.stop(&mut self.smu, now_ms);
        self.adhoc.stop();
        self.disconnect();
    }
}

/// Runs a [`Bridge`] on its own thread until `Shutdown` arrives or every
/// command sender is dropped.
pub fn spawn_thread(
    config: BridgeConfig,
    tx: Sender<BridgeEvent>,
    rx_cmd: Receiver<BridgeCommand>,
    tx_cmd: Sender<BridgeCommand>,
) -> Result<JoinHandle<()>, BridgeError> {
    let mut bridge = Bridge::new(config, tx)?;
    let handle = thread::Builder::new()
        .name("bridge-engine".into())
        .spawn(move || {
            log::info!("bridge engine ready");
            bridge.set_command_sender(tx_cmd);
            if let Some(settings) = bridge.config.serial.clone() {
                bridge.handle(BridgeCommand::Connect(settings), now_ms());
            }
            loop {
                match rx_cmd.recv_timeout(IDLE_POLL) {
                    Ok(cmd) => {
                        if !bridge.handle(cmd, now_ms()) {
                            break;
                        }
                        // drain whatever queued up behind it
                        while let Ok(cmd) = rx_cmd.try_recv() {
                            if !bridge.handle(cmd, now_ms()) {
                                log::info!("bridge engine stopped");
                                return;
                            }
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => {
                        bridge.shutdown(now_ms());
                        break;
                    }
                }
                bridge.poll(now_ms());
            }
            log::info!("bridge engine stopped");
        })
        .map_err(|e| BridgeError::Transport(e.to_string()))?;
    Ok(handle)
}
