// src/drivers/mod.rs
pub mod buffer;
pub mod demux;
pub mod error;
pub mod source;
pub use buffer::{RingBuffer, SampleSeries};
pub use demux::{classify_line, Classified, Ingested, StreamDemux};
pub use error::BridgeError;
pub use source::{list_ports, LinkWriter, MemoryLink, SerialLink};
