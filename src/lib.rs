//! Serial Bridge Library
//!
//! Reads bytes from one serial device and broadcasts every chunk to all
//! connected TCP clients, recovering from device unplugs, busy ports and
//! client hang-ups without restarting.

pub mod cli;
pub mod core;
pub mod domain;
pub mod infrastructure;

pub use core::{BackoffPolicy, Bridge, Shutdown};
pub use domain::config::BridgeConfig;
pub use domain::error::{BridgeError, BridgeResult, SerialFaultKind};
pub use infrastructure::serial::{LinkState, SerialLink};
pub use infrastructure::tcp::{BroadcastServer, ClientRegistry};
