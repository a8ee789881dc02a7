use std::io::{ErrorKind, Read, Write};
use std::sync::mpsc::Sender;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use crate::drivers::BridgeError;
use crate::types::BridgeCommand;
/// Write half of the instrument link. Writes are fire-and-forget.
pub trait LinkWriter: Send {
    fn write_text(&mut self, text: &str) -> Result<(), BridgeError>;
    fn describe(&self) -> String;
}
/// Serial port link. Reads run on a dedicated thread that forwards raw chunks
/// into the engine's command queue, so ingestion stays on the engine thread.
pub struct SerialLink {
    path: String,
    port: Box<dyn serialport::SerialPort>,
    alive: Arc<AtomicBool>,
}
impl SerialLink {
    pub fn open(path: &str, baud: u32, tx_cmd: Sender<BridgeCommand>) -> Result<Self, BridgeError> {
        let port = serialport::new(path, baud)
            .timeout(Duration::from_millis(50))
            .open()?;
        let mut reader = port.try_clone()?;
        let reader_path = path.to_owned();
        let alive = Arc::new(AtomicBool::new(true));
        let reader_alive = alive.clone();
        thread::Builder::new()
            .name(format!("serial-rx {path}"))
            .spawn(move || {
                let mut buf = [0u8; 1024];
                while reader_alive.load(Ordering::Relaxed) {
                    match reader.read(&mut buf) {
                        Ok(0) => continue,
                        Ok(n) => {
                            if tx_cmd.send(BridgeCommand::Transport(buf[..n].to_vec())).is_err() {
                                // engine is gone
                                break;
                            }
                        }
                        Err(e) if e.kind() == ErrorKind::TimedOut => continue,
                        Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                        Err(e) => {
                            log::error!("serial read on {reader_path} failed: {e}");
                            tx_cmd.send(BridgeCommand::LinkLost(e.to_string())).ok();
                            break;
                        }
                    }
                }
                log::debug!("reader for {reader_path} exited");
            })?;
        log::info!("serial port opened: {path} @ {baud}");
        Ok(Self {
            path: path.to_owned(),
            port,
            alive,
        })
    }
}
impl Drop for SerialLink {
    fn drop(&mut self) {
        self.alive.store(false, Ordering::Relaxed);
    }
}
impl LinkWriter for SerialLink {
    fn write_text(&mut self, text: &str) -> Result<(), BridgeError> {
        self.port.write_all(text.as_bytes())?;
        Ok(())
    }
    fn describe(&self) -> String {
        self.path.clone()
    }
}
/// Names of the serial ports visible to the host.
pub fn list_ports() -> Result<Vec<String>, BridgeError> {
    Ok(serialport::available_ports()?
        .into_iter()
        .map(|p| p.port_name)
        .collect())
}
/// In-memory link useful for tests and dry runs. Clones share the same log.
#[derive(Clone, Default)]
pub struct MemoryLink {
    written: Arc<Mutex<Vec<String>>>,
    fail_writes: Arc<Mutex<bool>>,
}
impl MemoryLink {
    pub fn new() -> Self {
        Self::default()
    }
    /// Everything written so far, one entry per write.
    pub fn written(&self) -> Vec<String> {
        self.written.lock().map(|w| w.clone()).unwrap_or_default()
    }
    pub fn clear(&self) {
        if let Ok(mut w) = self.written.lock() {
            w.clear();
        }
    }
    /// Makes subsequent writes fail, to exercise transport error handling.
    pub fn set_failing(&self, failing: bool) {
        if let Ok(mut f) = self.fail_writes.lock() {
            *f = failing;
        }
    }
}
impl LinkWriter for MemoryLink {
    fn write_text(&mut self, text: &str) -> Result<(), BridgeError> {
        if self.fail_writes.lock().map(|f| *f).unwrap_or(false) {
            return Err(BridgeError::Transport("memory link set to fail".into()));
        }
        self.written
            .lock()
            .map_err(|_| BridgeError::Transport("memory link poisoned".into()))?
            .push(text.to_owned());
        Ok(())
    }
    fn describe(&self) -> String {
        "memory".to_owned()
    }
}
