use thiserror::Error;
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Malformed step sequence. `index` names the offending step when there is one.
    #[error("invalid step definition{}: {message}", .index.map(|i| format!(" at step {i}")).unwrap_or_default())]
    Validation {
        index: Option<usize>,
        message: String,
    },
    #[error("{0}")]
    Lifecycle(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("configuration error: {0}")]
    Config(String),
}
impl BridgeError {
    pub fn validation(index: Option<usize>, message: impl Into<String>) -> Self {
        BridgeError::Validation {
            index,
            message: message.into(),
        }
    }
}
impl From<std::io::Error> for BridgeError {
    fn from(value: std::io::Error) -> Self {
        BridgeError::Transport(value.to_string())
    }
}
impl From<serialport::Error> for BridgeError {
    fn from(value: serialport::Error) -> Self {
        BridgeError::Transport(value.to_string())
    }
}
impl From<rusqlite::Error> for BridgeError {
    fn from(value: rusqlite::Error) -> Self {
        BridgeError::Persistence(value.to_string())
    }
}
impl From<serde_json::Error> for BridgeError {
    fn from(value: serde_json::Error) -> Self {
        BridgeError::Config(value.to_string())
    }
}
