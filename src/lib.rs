//! Serial bridge for a two-channel source-measure unit, with a battery
//! cycling controller layered on the measurement stream.

pub mod config;
pub mod cycler;
pub mod drivers;
pub mod engine;
pub mod recorder;
pub mod smu;
pub mod types;

pub use config::{BridgeConfig, TelemetryLimits};
pub use drivers::BridgeError;
pub use engine::{spawn_thread, Bridge};
