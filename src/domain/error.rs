use thiserror::Error;

/// Serial Bridge unified error type
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("Network error: {0}")]
    Network(#[from] std::io::Error),

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Serial device '{device}' failed ({kind}): {message}")]
    Device {
        device: String,
        kind: SerialFaultKind,
        message: String,
    },

    #[error("Failed to listen on {addr} ({kind}): {source}")]
    Listen {
        addr: String,
        kind: ListenFaultKind,
        #[source]
        source: std::io::Error,
    },

    #[error("Operation cancelled by shutdown")]
    Cancelled,

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

pub type BridgeResult<T> = Result<T, BridgeError>;

/// Classification of serial device failures, used to pick retry policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SerialFaultKind {
    /// Device exists but another process holds it
    Busy,
    /// Device node is missing (unplugged, not yet enumerated)
    NotFound,
    /// Permission denied on the device node
    AccessDenied,
    /// Identifier or settings rejected by the driver
    Invalid,
    /// Any other I/O failure
    Io,
}

impl std::fmt::Display for SerialFaultKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SerialFaultKind::Busy => write!(f, "device busy"),
            SerialFaultKind::NotFound => write!(f, "device not found"),
            SerialFaultKind::AccessDenied => write!(f, "access denied"),
            SerialFaultKind::Invalid => write!(f, "invalid device"),
            SerialFaultKind::Io => write!(f, "i/o error"),
        }
    }
}

impl SerialFaultKind {
    pub fn from_io(error: &std::io::Error) -> Self {
        use std::io::ErrorKind;

        #[cfg(unix)]
        if error.raw_os_error() == Some(EBUSY) {
            return SerialFaultKind::Busy;
        }

        match error.kind() {
            ErrorKind::NotFound => SerialFaultKind::NotFound,
            ErrorKind::PermissionDenied => SerialFaultKind::AccessDenied,
            ErrorKind::WouldBlock | ErrorKind::AddrInUse => SerialFaultKind::Busy,
            ErrorKind::InvalidInput => SerialFaultKind::Invalid,
            _ => SerialFaultKind::Io,
        }
    }

    pub fn from_serialport(error: &serialport::Error) -> Self {
        match error.kind() {
            serialport::ErrorKind::NoDevice => SerialFaultKind::NotFound,
            serialport::ErrorKind::InvalidInput => SerialFaultKind::Invalid,
            serialport::ErrorKind::Io(kind) => {
                SerialFaultKind::from_io(&std::io::Error::new(kind, error.description.clone()))
            }
            serialport::ErrorKind::Unknown => SerialFaultKind::Io,
        }
    }
}

#[cfg(unix)]
const EBUSY: i32 = 16;

/// A classified serial failure, carried through the backoff loop.
#[derive(Error, Debug, Clone)]
#[error("{kind}: {message}")]
pub struct SerialFault {
    pub kind: SerialFaultKind,
    pub message: String,
}

impl SerialFault {
    pub fn new(kind: SerialFaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<serialport::Error> for SerialFault {
    fn from(error: serialport::Error) -> Self {
        Self::new(SerialFaultKind::from_serialport(&error), error.description)
    }
}

impl From<std::io::Error> for SerialFault {
    fn from(error: std::io::Error) -> Self {
        Self::new(SerialFaultKind::from_io(&error), error.to_string())
    }
}

/// Classification of listener bind failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListenFaultKind {
    AddressInUse,
    Socket,
    Invalid,
}

impl std::fmt::Display for ListenFaultKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ListenFaultKind::AddressInUse => write!(f, "address in use"),
            ListenFaultKind::Socket => write!(f, "socket error"),
            ListenFaultKind::Invalid => write!(f, "invalid address"),
        }
    }
}

impl ListenFaultKind {
    pub fn from_io(error: &std::io::Error) -> Self {
        use std::io::ErrorKind;

        match error.kind() {
            ErrorKind::AddrInUse => ListenFaultKind::AddressInUse,
            // Not an address of this host
            ErrorKind::AddrNotAvailable => ListenFaultKind::Invalid,
            ErrorKind::InvalidInput | ErrorKind::Unsupported => ListenFaultKind::Invalid,
            _ => ListenFaultKind::Socket,
        }
    }
}
