//! vshark-core: live capture with flow bucketing, DNS snooping and process
//! correlation, plus a tshark bridge that maps dissector JSON onto typed
//! protocol layers.

pub mod capture_file;
pub mod config;
pub mod decode;
pub mod dissect;
pub mod dns;
pub mod error;
pub mod filter;
pub mod flow;
pub mod layers;
pub mod logging;
pub mod model;
pub mod network;
pub mod process;
pub mod tree;

pub use config::Config;
pub use dissect::{cancel_pair, CancelHandle, CancelToken, Dissector, Progress, Stage};
pub use error::{Error, Result};
pub use filter::{FilterSpec, PacketFilter};
pub use flow::FlowTable;
pub use layers::{Layer, LayerRegistry, PacketLayers};
pub use model::{Direction, Endpoint, FlowKey, MacAddr, Packet, TransportKind};
pub use network::{CaptureLoop, CaptureOptions, CaptureSource, CaptureState, CaptureStats};
pub use process::ProcessCorrelator;
