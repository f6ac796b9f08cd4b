// Serial module - Serial device access and the managed link
pub mod driver;
pub mod link;
pub mod memory;

pub use driver::{NativeDriver, SerialDriver, SerialStream};
pub use link::{LinkState, SerialLink, SerialMessage};
pub use memory::{MemoryDevice, MemoryDriver};
