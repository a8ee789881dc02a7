// src/main.rs
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Sender};
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use smu_bridge::cycler::StepDefinition;
use smu_bridge::drivers::list_ports;
use smu_bridge::recorder::TestMetadata;
use smu_bridge::types::*;
use smu_bridge::{spawn_thread, BridgeConfig};

const REPLY_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Default, PartialEq)]
struct CliArgs {
    config: Option<PathBuf>,
    path: Option<String>,
    baud: Option<u32>,
    buffer_len: Option<usize>,
}

impl CliArgs {
    fn parse(args: impl IntoIterator<Item = String>) -> Result<Self> {
        let mut out = CliArgs::default();
        let mut positional = Vec::new();
        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            if arg == "--config" {
                let file = args.next().ok_or_else(|| anyhow!("--config needs a file"))?;
                out.config = Some(PathBuf::from(file));
            } else {
                positional.push(arg);
            }
        }
        let mut positional = positional.into_iter();
        out.path = positional.next();
        if let Some(baud) = positional.next() {
            out.baud = Some(baud.parse().with_context(|| format!("bad baud rate {baud:?}"))?);
        }
        if let Some(len) = positional.next() {
            out.buffer_len = Some(len.parse().with_context(|| format!("bad buffer length {len:?}"))?);
        }
        if let Some(extra) = positional.next() {
            bail!("unexpected argument {extra:?}");
        }
        Ok(out)
    }

    fn into_config(self) -> Result<BridgeConfig> {
        let mut config = match &self.config {
            Some(path) => BridgeConfig::load(path)
                .with_context(|| format!("loading config {}", path.display()))?,
            None => BridgeConfig::default(),
        };
        if let Some(path) = self.path {
            let baud = self
                .baud
                .or(config.serial.as_ref().map(|s| s.baud))
                .unwrap_or(115_200);
            config.serial = Some(SerialSettings { path, baud });
        } else if let (Some(baud), Some(serial)) = (self.baud, config.serial.as_mut()) {
            serial.baud = baud;
        }
        if let Some(len) = self.buffer_len {
            config.buffer_capacity = len;
        }
        config.validate()?;
        Ok(config)
    }
}

/// One line typed at the console.
#[derive(Debug, PartialEq)]
enum ConsoleCommand {
    Raw(String),
    Connect(SerialSettings),
    Disconnect,
    Ports,
    Start { file: PathBuf, cycles: u32, channel: Channel },
    Stop,
    Pause,
    Resume,
    Status,
    State,
    Buffer,
    Query(SmuQuery),
    LogCsv { path: PathBuf, columns: Vec<String> },
    LogSqlite { path: PathBuf, table: String, columns: Vec<String> },
    LogStop,
    LogStatus,
    Quit,
}

fn parse_channel(text: Option<&str>) -> Result<Channel> {
    match text {
        None => Ok(Channel::One),
        Some(t) => {
            let n: u8 = t.parse().with_context(|| format!("bad channel {t:?}"))?;
            Channel::from_number(n).ok_or_else(|| anyhow!("channel must be 1 or 2"))
        }
    }
}

impl ConsoleCommand {
    fn parse(line: &str) -> Result<Self> {
        let Some(rest) = line.strip_prefix('/') else {
            return Ok(ConsoleCommand::Raw(line.to_owned()));
        };
        let words: Vec<&str> = rest.split_whitespace().collect();
        let arg = |i: usize| words.get(i).copied();
        let cmd = match words.first().copied().unwrap_or("") {
            "connect" => {
                let path = arg(1).ok_or_else(|| anyhow!("usage: /connect PATH [BAUD]"))?;
                let baud = arg(2).map(str::parse).transpose()?.unwrap_or(115_200);
                ConsoleCommand::Connect(SerialSettings {
                    path: path.to_owned(),
                    baud,
                })
            }
            "disconnect" => ConsoleCommand::Disconnect,
            "ports" => ConsoleCommand::Ports,
            "start" => {
                let file = arg(1).ok_or_else(|| anyhow!("usage: /start STEPS.json [CYCLES] [CHANNEL]"))?;
                let cycles = arg(2).map(str::parse).transpose()?.unwrap_or(1);
                ConsoleCommand::Start {
                    file: PathBuf::from(file),
                    cycles,
                    channel: parse_channel(arg(3))?,
                }
            }
            "stop" => ConsoleCommand::Stop,
            "pause" => ConsoleCommand::Pause,
            "resume" => ConsoleCommand::Resume,
            "status" => ConsoleCommand::Status,
            "state" => ConsoleCommand::State,
            "buffer" => ConsoleCommand::Buffer,
            "idn" => ConsoleCommand::Query(SmuQuery::Identity),
            "temp" => ConsoleCommand::Query(SmuQuery::Temperatures),
            "led" => ConsoleCommand::Query(SmuQuery::LedBrightness),
            "wifi" => ConsoleCommand::Query(SmuQuery::WifiStatus),
            "scan" => ConsoleCommand::Query(SmuQuery::WifiScan),
            "meas" => ConsoleCommand::Query(SmuQuery::MeasureVoltageAndCurrent(parse_channel(arg(1))?)),
            "log" => match arg(1) {
                Some("csv") => ConsoleCommand::LogCsv {
                    path: PathBuf::from(arg(2).ok_or_else(|| anyhow!("usage: /log csv PATH [COLUMNS..]"))?),
                    columns: words.iter().skip(3).map(|s| s.to_string()).collect(),
                },
                Some("sqlite") => {
                    let (Some(path), Some(table)) = (arg(2), arg(3)) else {
                        bail!("usage: /log sqlite PATH TABLE [COLUMNS..]");
                    };
                    ConsoleCommand::LogSqlite {
                        path: PathBuf::from(path),
                        table: table.to_owned(),
                        columns: words.iter().skip(4).map(|s| s.to_string()).collect(),
                    }
                }
                Some("stop") => ConsoleCommand::LogStop,
                _ => ConsoleCommand::LogStatus,
            },
            "quit" | "exit" => ConsoleCommand::Quit,
            other => bail!("unknown command /{other}"),
        };
        Ok(cmd)
    }
}

fn load_steps(file: &Path) -> Result<Vec<StepDefinition>> {
    let text = std::fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing steps in {}", file.display()))
}

fn send(tx_cmd: &Sender<BridgeCommand>, cmd: BridgeCommand) -> Result<()> {
    tx_cmd.send(cmd).map_err(|_| anyhow!("bridge engine has stopped"))
}

fn snapshot(tx_cmd: &Sender<BridgeCommand>) -> Result<Snapshot> {
    let (tx, rx) = channel();
    send(tx_cmd, BridgeCommand::Snapshot(tx))?;
    rx.recv_timeout(REPLY_TIMEOUT).context("engine did not answer")
}

fn lifecycle(
    tx_cmd: &Sender<BridgeCommand>,
    make: impl FnOnce(Sender<std::result::Result<(), String>>) -> BridgeCommand,
) -> Result<()> {
    let (tx, rx) = channel();
    send(tx_cmd, make(tx))?;
    rx.recv_timeout(REPLY_TIMEOUT)
        .context("engine did not answer")?
        .map_err(|e| anyhow!(e))
}

fn run_console_command(cmd: ConsoleCommand, tx_cmd: &Sender<BridgeCommand>) -> Result<bool> {
    match cmd {
        ConsoleCommand::Raw(text) => send(tx_cmd, BridgeCommand::WriteRaw(text, LineEnding::Configured))?,
        ConsoleCommand::Connect(settings) => send(tx_cmd, BridgeCommand::Connect(settings))?,
        ConsoleCommand::Disconnect => send(tx_cmd, BridgeCommand::Disconnect)?,
        ConsoleCommand::Ports => {
            for port in list_ports()? {
                println!("{port}");
            }
        }
        ConsoleCommand::Start { file, cycles, channel } => {
            let request = CyclerRequest {
                channel,
                steps: load_steps(&file)?,
                cycles,
                enable_logging: true,
                metadata: TestMetadata::default(),
            };
            lifecycle(tx_cmd, |tx| BridgeCommand::StartCycler(request, tx))?;
        }
        ConsoleCommand::Stop => send(tx_cmd, BridgeCommand::StopCycler)?,
        ConsoleCommand::Pause => lifecycle(tx_cmd, BridgeCommand::PauseCycler)?,
        ConsoleCommand::Resume => lifecycle(tx_cmd, BridgeCommand::ResumeCycler)?,
        ConsoleCommand::Status => println!("{}", serde_json::to_string_pretty(&snapshot(tx_cmd)?.cycler)?),
        ConsoleCommand::State => println!("{}", serde_json::to_string_pretty(&snapshot(tx_cmd)?.smu)?),
        ConsoleCommand::Buffer => println!("{}", snapshot(tx_cmd)?.buffer),
        ConsoleCommand::Query(query) => {
            let (tx, rx) = channel();
            send(tx_cmd, BridgeCommand::Query(query, tx))?;
            match rx.recv_timeout(REPLY_TIMEOUT).context("engine did not answer")? {
                Some(reply) => println!("{reply}"),
                None => println!("(no reply)"),
            }
        }
        ConsoleCommand::LogCsv { path, columns } => send(tx_cmd, BridgeCommand::StartCsvLog { path, columns })?,
        ConsoleCommand::LogSqlite { path, table, columns } => {
            send(tx_cmd, BridgeCommand::StartSqliteLog { path, table, columns })?
        }
        ConsoleCommand::LogStop => send(tx_cmd, BridgeCommand::StopLog)?,
        ConsoleCommand::LogStatus => println!("{}", serde_json::to_string_pretty(&snapshot(tx_cmd)?.log)?),
        ConsoleCommand::Quit => return Ok(false),
    }
    Ok(true)
}

fn print_event(event: BridgeEvent) {
    match event {
        BridgeEvent::Data(text) => {
            print!("{text}");
            io::stdout().flush().ok();
        }
        BridgeEvent::Link(state, detail) => log::info!("link {state:?}: {detail}"),
        BridgeEvent::CyclerStatus(phase) => log::info!("cycler {phase:?}"),
        BridgeEvent::StepCompleted { cycle, step_index, reason } => {
            log::info!("cycle {cycle} step {step_index} done: {reason}")
        }
        BridgeEvent::CycleCompleted(cycle) => log::info!("cycle {cycle} completed"),
        BridgeEvent::CyclerData(point) => log::debug!(
            "[{} {}] {:.4} V {:.6} A {:.6} Ah",
            point.cycle,
            point.step_type,
            point.voltage_v,
            point.current_a,
            point.total_ah
        ),
        BridgeEvent::Sample(_) | BridgeEvent::OtherLine(_) => {}
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let config = CliArgs::parse(std::env::args().skip(1))?.into_config()?;

    let (tx_cmd, rx_cmd) = channel();
    let (tx_evt, rx_evt) = channel();
    let engine = spawn_thread(config, tx_evt, rx_cmd, tx_cmd.clone()).context("starting bridge engine")?;
    thread::Builder::new()
        .name("console-events".into())
        .spawn(move || {
            for event in rx_evt {
                print_event(event);
            }
        })
        .context("starting event printer")?;

    for line in io::stdin().lock().lines() {
        let line = line.context("reading stdin")?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let keep_going = ConsoleCommand::parse(line).and_then(|cmd| run_console_command(cmd, &tx_cmd));
        match keep_going {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => log::error!("{e:#}"),
        }
    }

    tx_cmd.send(BridgeCommand::Shutdown).ok();
    engine.join().map_err(|_| anyhow!("bridge engine panicked"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Result<CliArgs> {
        CliArgs::parse(list.iter().map(|s| s.to_string()))
    }

    #[test]
    fn positional_arguments() {
        let parsed = args(&["/dev/ttyACM0", "9600", "2048"]).unwrap();
        assert_eq!(parsed.path.as_deref(), Some("/dev/ttyACM0"));
        assert_eq!(parsed.baud, Some(9600));
        assert_eq!(parsed.buffer_len, Some(2048));
        let config = parsed.into_config().unwrap();
        assert_eq!(config.buffer_capacity, 2048);
        assert_eq!(config.serial.unwrap().baud, 9600);
    }

    #[test]
    fn bad_arguments_are_reported() {
        assert!(args(&["/dev/ttyACM0", "fast"]).is_err());
        assert!(args(&["--config"]).is_err());
        assert!(args(&["a", "1", "2", "3"]).is_err());
        assert!(args(&["a", "1", "0"]).unwrap().into_config().is_err());
    }

    #[test]
    fn console_commands() {
        assert_eq!(
            ConsoleCommand::parse("SOUR1:CURR 0.1").unwrap(),
            ConsoleCommand::Raw("SOUR1:CURR 0.1".into())
        );
        assert_eq!(
            ConsoleCommand::parse("/start steps.json 3 2").unwrap(),
            ConsoleCommand::Start {
                file: PathBuf::from("steps.json"),
                cycles: 3,
                channel: Channel::Two
            }
        );
        assert_eq!(
            ConsoleCommand::parse("/log sqlite run.db readings v i").unwrap(),
            ConsoleCommand::LogSqlite {
                path: PathBuf::from("run.db"),
                table: "readings".into(),
                columns: vec!["v".into(), "i".into()]
            }
        );
        assert_eq!(
            ConsoleCommand::parse("/meas 2").unwrap(),
            ConsoleCommand::Query(SmuQuery::MeasureVoltageAndCurrent(Channel::Two))
        );
        assert!(ConsoleCommand::parse("/start").is_err());
        assert!(ConsoleCommand::parse("/meas 3").is_err());
        assert!(ConsoleCommand::parse("/bogus").is_err());
    }
}
