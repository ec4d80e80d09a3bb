//! Driver contracts the backends are written against.
//!
//! Device calls never block. Everything the device has to report comes back
//! through callbacks invoked from the device's own context (an interrupt
//! handler on hardware, a service task for the loopback devices), so
//! handlers must not block either.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};

use crate::error::DeviceError;

/// One buffer of a streaming receive ring.
#[derive(Debug)]
pub struct RxBuffer {
    /// Position in the owning ring.
    pub index: usize,
    size: usize,
    data: BytesMut,
}

impl RxBuffer {
    pub fn new(index: usize, size: usize) -> Self {
        Self {
            index,
            size,
            data: BytesMut::with_capacity(size),
        }
    }

    /// Capacity the device may fill.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn filled(&self) -> &[u8] {
        &self.data
    }

    pub fn remaining(&self) -> usize {
        self.size - self.data.len()
    }

    pub fn is_full(&self) -> bool {
        self.data.len() == self.size
    }

    /// Append up to [`RxBuffer::remaining`] bytes, returning how many fit.
    pub fn fill(&mut self, bytes: &[u8]) -> usize {
        let take = bytes.len().min(self.remaining());
        self.data.extend_from_slice(&bytes[..take]);
        take
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }
}

/// Events raised by a streaming device.
#[derive(Debug)]
pub enum StreamEvent {
    /// The last transmission completed.
    TxDone,
    /// The last transmission was cut short.
    TxAborted,
    /// A receive buffer filled up; `data` is a copy of its contents.
    RxReady { data: Bytes },
    /// The device wants the next receive buffer.
    RxBufRequest,
    /// The device no longer uses this buffer.
    RxBufReleased(RxBuffer),
    /// Reception stopped; buffers were released first.
    RxDisabled,
}

pub type StreamEventHandler = Arc<dyn Fn(StreamEvent) + Send + Sync>;

/// Byte-stream device, such as a UART with asynchronous DMA reception.
pub trait StreamDevice: Send + Sync {
    fn name(&self) -> &str;

    fn is_ready(&self) -> bool;

    fn set_event_handler(&self, handler: StreamEventHandler) -> Result<(), DeviceError>;

    /// Start receiving into `buffer`.
    fn rx_enable(&self, buffer: RxBuffer) -> Result<(), DeviceError>;

    /// Answer an [`StreamEvent::RxBufRequest`].
    fn rx_buf_rsp(&self, buffer: RxBuffer) -> Result<(), DeviceError>;

    /// Stop receiving and drop any partially received data.
    fn rx_disable(&self) -> Result<(), DeviceError>;

    /// Start transmitting `data`. Completion is reported by
    /// [`StreamEvent::TxDone`] or [`StreamEvent::TxAborted`].
    fn tx(&self, data: Bytes) -> Result<(), DeviceError>;
}

/// Callbacks bound to a packet endpoint.
#[derive(Clone)]
pub struct EndpointCallbacks {
    /// The peer registered the same endpoint.
    pub bound: Arc<dyn Fn() + Send + Sync>,
    /// One complete packet arrived.
    pub received: Arc<dyn Fn(Bytes) + Send + Sync>,
    pub error: Arc<dyn Fn(&str) + Send + Sync>,
}

impl std::fmt::Debug for EndpointCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointCallbacks").finish_non_exhaustive()
    }
}

/// Packet IPC device, such as an inter-processor mailbox.
pub trait PacketDevice: Send + Sync {
    fn name(&self) -> &str;

    fn is_ready(&self) -> bool;

    /// Open the IPC instance. Fails with [`DeviceError::AlreadyOpen`] when
    /// another user opened it first.
    fn open_instance(&self) -> Result<(), DeviceError>;

    fn register_endpoint(&self, name: &str, callbacks: EndpointCallbacks)
    -> Result<(), DeviceError>;

    fn send(&self, endpoint: &str, data: Bytes) -> Result<(), DeviceError>;
}
