// TCP module - Client tracking and broadcast fan-out
pub mod client;
pub mod registry;
pub mod server;

pub use client::{ClientConnection, ClientId, ClientSink};
pub use registry::{ClientRegistry, Visit};
pub use server::{broadcast_to, BroadcastReport, BroadcastServer};
