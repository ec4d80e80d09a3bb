//! Error types for domainlink.
//!
//! Every concern has its own enum; the top-level [`Error`] wraps them. Each
//! error maps onto a small shared taxonomy ([`ErrorKind`]) so callers can
//! react to the class of failure without matching on every variant.

use std::time::Duration;

use serde::Serialize;

use crate::wire::WireFormat;

/// Failure classes shared by every error type in the crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Oversized or otherwise malformed input.
    InvalidArgument,
    /// Unknown channel or message id.
    NotFound,
    /// Remote publish attempted on a channel that is not a shadow.
    PermissionDenied,
    /// Device or endpoint not initialized.
    NotReady,
    /// A bounded pool or queue is full.
    ResourceExhausted,
    /// Backend lacks an optional capability.
    Unsupported,
    /// Peer bind, transmit gate or publish wait expired.
    Timeout,
    /// A task ended abnormally.
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::InvalidArgument => "invalid argument",
            ErrorKind::NotFound => "not found",
            ErrorKind::PermissionDenied => "permission denied",
            ErrorKind::NotReady => "not ready",
            ErrorKind::ResourceExhausted => "resource exhausted",
            ErrorKind::Unsupported => "unsupported",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Tracker error: {0}")]
    Tracker(#[from] TrackerError),

    #[error("Queue {queue} is full")]
    QueueFull { queue: &'static str },

    #[error("Agent {agent} crashed")]
    Crashed { agent: String },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config(e) => e.kind(),
            Error::Codec(e) => e.kind(),
            Error::Transport(e) => e.kind(),
            Error::Bus(e) => e.kind(),
            Error::Tracker(e) => e.kind(),
            Error::QueueFull { .. } => ErrorKind::ResourceExhausted,
            Error::Crashed { .. } => ErrorKind::Internal,
        }
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConfigError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConfigError::Io(e) if e.kind() == std::io::ErrorKind::NotFound => ErrorKind::NotFound,
            _ => ErrorKind::InvalidArgument,
        }
    }
}

/// Envelope packing and unpacking errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("Payload of {size} bytes exceeds capacity of {max}")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Channel name of {len} bytes exceeds capacity of {max}")]
    ChannelNameTooLong { len: usize, max: usize },

    #[error("Data message carries an empty payload")]
    EmptyPayload,

    #[error("Frame is {actual} bytes, expected {expected}")]
    FrameSize { expected: usize, actual: usize },

    #[error("Payload size field {size} out of bounds (max {max})")]
    InvalidPayloadSize { size: usize, max: usize },

    #[error("{field} length field {len} out of bounds (max {max})")]
    InvalidNameLength {
        field: &'static str,
        len: usize,
        max: usize,
    },

    #[error("Unknown message kind {0}")]
    UnknownKind(u8),

    #[error("Frame does not match the {expected} wire format")]
    FormatMismatch { expected: WireFormat },
}

impl CodecError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::InvalidArgument
    }
}

/// Errors reported by the transport device layer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    #[error("Device {name} is not ready")]
    NotReady { name: String },

    #[error("Instance {name} is already open")]
    AlreadyOpen { name: String },

    #[error("Endpoint {name} is not registered")]
    NoEndpoint { name: String },

    #[error("Endpoint {name} is not bound to a peer")]
    NotBound { name: String },

    #[error("Device {name} is busy")]
    Busy { name: String },

    #[error("No receive buffer supplied")]
    NoBuffer,

    #[error("Device link closed")]
    Closed,
}

impl DeviceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DeviceError::NotReady { .. }
            | DeviceError::NotBound { .. }
            | DeviceError::Busy { .. }
            | DeviceError::Closed => ErrorKind::NotReady,
            DeviceError::AlreadyOpen { .. } => ErrorKind::InvalidArgument,
            DeviceError::NoEndpoint { .. } => ErrorKind::NotFound,
            DeviceError::NoBuffer => ErrorKind::ResourceExhausted,
        }
    }
}

/// Backend-level transport errors.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Backend {name} is not initialized")]
    NotReady { name: String },

    #[error("Backend {name} is already initialized")]
    AlreadyInitialized { name: String },

    #[error("Endpoint {endpoint} was not bound within {timeout:?}")]
    BindTimeout { endpoint: String, timeout: Duration },

    #[error("Transmit gate of {name} not released within {timeout:?}")]
    GateTimeout { name: String, timeout: Duration },

    #[error("Backend does not support {op}")]
    Unsupported { op: &'static str },

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),
}

impl TransportError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransportError::NotReady { .. } => ErrorKind::NotReady,
            TransportError::AlreadyInitialized { .. } => ErrorKind::InvalidArgument,
            TransportError::BindTimeout { .. } | TransportError::GateTimeout { .. } => {
                ErrorKind::Timeout
            }
            TransportError::Unsupported { .. } => ErrorKind::Unsupported,
            TransportError::Codec(e) => e.kind(),
            TransportError::Device(e) => e.kind(),
        }
    }
}

/// Publish/subscribe bus errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BusError {
    #[error("Channel {0} not found")]
    ChannelNotFound(String),

    #[error("Channel {0} already registered")]
    DuplicateChannel(String),

    #[error("Channel {0} is not a shadow channel")]
    NotShadow(String),

    #[error("Channel {0} is a shadow channel and cannot be published locally")]
    ShadowChannel(String),

    #[error("Message for {channel} is {actual} bytes, channel carries {expected}")]
    MessageSize {
        channel: String,
        expected: usize,
        actual: usize,
    },

    #[error("Observer queue of {channel} is full")]
    Full { channel: String },

    #[error("Publish on {channel} timed out after {timeout:?}")]
    Timeout { channel: String, timeout: Duration },
}

impl BusError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BusError::ChannelNotFound(_) => ErrorKind::NotFound,
            BusError::DuplicateChannel(_) | BusError::MessageSize { .. } => {
                ErrorKind::InvalidArgument
            }
            BusError::NotShadow(_) | BusError::ShadowChannel(_) => ErrorKind::PermissionDenied,
            BusError::Full { .. } => ErrorKind::ResourceExhausted,
            BusError::Timeout { .. } => ErrorKind::Timeout,
        }
    }
}

/// Pending-send tracker errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TrackerError {
    #[error("Tracking pool of {capacity} entries is exhausted")]
    PoolExhausted { capacity: usize },

    #[error("Message {id} is not tracked")]
    NotFound { id: u32 },
}

impl TrackerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TrackerError::PoolExhausted { .. } => ErrorKind::ResourceExhausted,
            TrackerError::NotFound { .. } => ErrorKind::NotFound,
        }
    }
}

/// Result type for domainlink operations.
pub type Result<T> = std::result::Result<T, Error>;
