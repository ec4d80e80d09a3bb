//! Transport backends.
//!
//! A [`Backend`] moves encoded frames between two domains over one device
//! and reports what arrives through callbacks installed by the engine:
//!
//! - [`StreamBackend`] over a byte-stream device with a rotating ring of
//!   receive buffers and one transmission in flight at a time.
//! - [`PacketBackend`] over a packet IPC device with a single endpoint that
//!   must be bound by the peer before use.

pub mod device;
pub mod loopback;
mod packet;
mod stream;

pub use packet::PacketBackend;
pub use stream::StreamBackend;

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::Limits;
use crate::error::{Error, TransportError};
use crate::provenance::tag_domain;
use crate::wire::{Frame, WireFormat};

/// Physical link family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Stream,
    Packet,
}

impl TransportKind {
    /// Appended to the provenance domain of one-way messages received over
    /// this kind of link.
    pub fn domain_suffix(&self) -> &'static str {
        match self {
            TransportKind::Stream => "_stream",
            TransportKind::Packet => "_packet",
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Stream => write!(f, "stream"),
            TransportKind::Packet => write!(f, "packet"),
        }
    }
}

/// Invoked with every data frame received. Must not block.
pub type ReceiveCallback = Arc<dyn Fn(Frame) -> Result<(), Error> + Send + Sync>;

/// Invoked with the id of every acknowledgment received. Must not block.
pub type AckCallback = Arc<dyn Fn(u32) -> Result<(), Error> + Send + Sync>;

/// One transport endpoint shared by an agent.
#[async_trait]
pub trait Backend: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> TransportKind;

    fn format(&self) -> WireFormat;

    /// Check the device, install event handling and wait until the link
    /// can carry frames. Only the first call may succeed.
    async fn initialize(&self) -> Result<(), TransportError>;

    /// Transmit one frame.
    async fn send(&self, frame: &Frame) -> Result<(), TransportError>;

    fn set_receive_callback(&self, callback: ReceiveCallback) -> Result<(), TransportError>;

    /// Backends without acknowledgment support keep this default.
    fn set_ack_callback(&self, _callback: AckCallback) -> Result<(), TransportError> {
        Err(TransportError::Unsupported {
            op: "acknowledgment callback",
        })
    }
}

/// Routes decoded frames to the installed callbacks.
pub(crate) struct Dispatch {
    backend: String,
    kind: TransportKind,
    limits: Limits,
    receive: RwLock<Option<ReceiveCallback>>,
    ack: RwLock<Option<AckCallback>>,
}

impl Dispatch {
    pub(crate) fn new(backend: &str, kind: TransportKind, limits: Limits) -> Self {
        Self {
            backend: backend.to_string(),
            kind,
            limits,
            receive: RwLock::new(None),
            ack: RwLock::new(None),
        }
    }

    pub(crate) fn set_receive(&self, callback: ReceiveCallback) {
        *self
            .receive
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(callback);
    }

    pub(crate) fn set_ack(&self, callback: AckCallback) {
        *self
            .ack
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(callback);
    }

    fn receive_callback(&self) -> Option<ReceiveCallback> {
        self.receive
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn ack_callback(&self) -> Option<AckCallback> {
        self.ack
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Hand a decoded frame to the engine.
    pub(crate) fn deliver(&self, frame: Frame) {
        let frame = match frame {
            Frame::Proxy(msg) if msg.is_ack() => {
                match self.ack_callback() {
                    Some(callback) => {
                        if let Err(e) = callback(msg.id) {
                            tracing::warn!(
                                backend = %self.backend,
                                msg_id = msg.id,
                                error = %e,
                                "Acknowledgment callback failed"
                            );
                        }
                    }
                    None => tracing::warn!(
                        backend = %self.backend,
                        msg_id = msg.id,
                        "Acknowledgment received but no callback installed"
                    ),
                }
                return;
            }
            Frame::Domain(mut msg) => {
                msg.domain = tag_domain(&msg.domain, self.kind.domain_suffix(), &self.limits);
                Frame::Domain(msg)
            }
            other => other,
        };

        match self.receive_callback() {
            Some(callback) => {
                if let Err(e) = callback(frame) {
                    tracing::error!(
                        backend = %self.backend,
                        error = %e,
                        "Receive callback failed"
                    );
                }
            }
            None => tracing::warn!(
                backend = %self.backend,
                "Frame received but no receive callback installed"
            ),
        }
    }
}
