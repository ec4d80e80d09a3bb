//! Backend over a byte-stream device.
//!
//! Frames have a fixed size, so each receive buffer holds exactly one
//! frame. The device is kept supplied from a ring of buffers: every
//! buffer request takes the next free slot, every release puts the buffer
//! back. When a completed buffer fails validation the stream has lost
//! alignment; receive is disabled (dropping any partial frame) and
//! re-enabled once the device confirms.
//!
//! Only one transmission is in flight. The gate is a single-permit
//! semaphore taken by `send` and given back by the device's transmit-done
//! or transmit-aborted event.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Semaphore;

use super::device::{RxBuffer, StreamDevice, StreamEvent};
use super::{AckCallback, Backend, Dispatch, ReceiveCallback, TransportKind};
use crate::config::ProxyConfig;
use crate::error::{DeviceError, TransportError};
use crate::wire::{Codec, Frame, WireFormat};

struct RxRing {
    slots: Vec<Option<RxBuffer>>,
    size: usize,
    next: usize,
}

impl RxRing {
    fn new(count: usize, size: usize) -> Self {
        Self {
            slots: (0..count).map(|index| Some(RxBuffer::new(index, size))).collect(),
            size,
            next: 0,
        }
    }

    /// Next free buffer, starting at the ring cursor.
    fn take_next(&mut self) -> Option<RxBuffer> {
        let count = self.slots.len();
        for offset in 0..count {
            let index = (self.next + offset) % count;
            if let Some(buffer) = self.slots[index].take() {
                self.next = (index + 1) % count;
                return Some(buffer);
            }
        }
        None
    }

    fn put_back(&mut self, mut buffer: RxBuffer) -> bool {
        buffer.clear();
        match self.slots.get_mut(buffer.index) {
            Some(slot) if slot.is_none() => {
                *slot = Some(buffer);
                true
            }
            _ => false,
        }
    }

    /// Refill an empty slot whose buffer the device dropped.
    fn restore(&mut self, index: usize) -> bool {
        match self.slots.get_mut(index) {
            Some(slot) if slot.is_none() => {
                *slot = Some(RxBuffer::new(index, self.size));
                true
            }
            _ => false,
        }
    }

    fn free(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }
}

/// State reachable from the device's event context.
struct Shared {
    name: String,
    device: Weak<dyn StreamDevice>,
    codec: Codec,
    ring: Mutex<RxRing>,
    tx_gate: Semaphore,
    tx_busy: AtomicBool,
    dispatch: Dispatch,
}

impl Shared {
    fn ring(&self) -> MutexGuard<'_, RxRing> {
        self.ring.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// A device that rejects a buffer keeps it only when busy, and then
    /// hands it back with `RxBufReleased`. Any other failure drops it.
    fn reclaim(&self, index: usize, error: &DeviceError) {
        if !matches!(error, DeviceError::Busy { .. }) && self.ring().restore(index) {
            tracing::debug!(backend = %self.name, index, "Rejected receive buffer reclaimed");
        }
    }

    fn release_gate(&self) {
        if self.tx_busy.swap(false, Ordering::SeqCst) {
            self.tx_gate.add_permits(1);
        }
    }

    fn on_event(&self, event: StreamEvent) {
        let Some(device) = self.device.upgrade() else {
            return;
        };
        match event {
            StreamEvent::TxDone => self.release_gate(),
            StreamEvent::TxAborted => {
                tracing::error!(backend = %self.name, "Transmission aborted");
                self.release_gate();
            }
            StreamEvent::RxBufRequest => {
                let buffer = self.ring().take_next();
                match buffer {
                    Some(buffer) => {
                        let index = buffer.index;
                        if let Err(e) = device.rx_buf_rsp(buffer) {
                            tracing::error!(
                                backend = %self.name,
                                index,
                                error = %e,
                                "Failed to supply receive buffer"
                            );
                            self.reclaim(index, &e);
                        }
                    }
                    None => tracing::warn!(backend = %self.name, "No free receive buffer"),
                }
            }
            StreamEvent::RxBufReleased(buffer) => {
                let index = buffer.index;
                if !self.ring().put_back(buffer) {
                    tracing::warn!(
                        backend = %self.name,
                        index,
                        "Released buffer does not belong to the ring"
                    );
                }
            }
            StreamEvent::RxReady { data } => self.on_frame(device.as_ref(), &data),
            StreamEvent::RxDisabled => {
                tracing::debug!(backend = %self.name, "Receive disabled, re-enabling");
                let buffer = self.ring().take_next();
                match buffer {
                    Some(buffer) => {
                        let index = buffer.index;
                        if let Err(e) = device.rx_enable(buffer) {
                            tracing::error!(
                                backend = %self.name,
                                error = %e,
                                "Failed to re-enable receive"
                            );
                            self.reclaim(index, &e);
                        }
                    }
                    None => {
                        tracing::error!(backend = %self.name, "No free buffer to re-enable receive")
                    }
                }
            }
        }
    }

    fn on_frame(&self, device: &dyn StreamDevice, data: &[u8]) {
        if let Err(e) = self.codec.validate(data) {
            tracing::error!(
                backend = %self.name,
                error = %e,
                "Invalid frame received, resynchronizing"
            );
            if let Err(e) = device.rx_disable() {
                tracing::error!(backend = %self.name, error = %e, "Failed to disable receive");
            }
            return;
        }
        match self.codec.decode(data) {
            Ok(frame) => self.dispatch.deliver(frame),
            Err(e) => tracing::error!(backend = %self.name, error = %e, "Failed to decode frame"),
        }
    }
}

/// Backend for UART-like links.
pub struct StreamBackend {
    device: Arc<dyn StreamDevice>,
    shared: Arc<Shared>,
    send_timeout: Option<Duration>,
    initialized: AtomicBool,
}

impl StreamBackend {
    pub fn new(
        name: impl Into<String>,
        device: Arc<dyn StreamDevice>,
        format: WireFormat,
        config: &ProxyConfig,
    ) -> Self {
        let name = name.into();
        let codec = Codec::new(format, config.limits);
        let shared = Arc::new(Shared {
            dispatch: Dispatch::new(&name, TransportKind::Stream, config.limits),
            name,
            device: Arc::downgrade(&device),
            ring: Mutex::new(RxRing::new(config.rx_buffer_count, codec.frame_size())),
            codec,
            tx_gate: Semaphore::new(1),
            tx_busy: AtomicBool::new(false),
        });
        Self {
            device,
            shared,
            send_timeout: config.send_timeout(),
            initialized: AtomicBool::new(false),
        }
    }

    /// Receive buffers currently owned by the backend, not the device.
    pub fn free_rx_buffers(&self) -> usize {
        self.shared.ring().free()
    }

    pub fn frame_size(&self) -> usize {
        self.shared.codec.frame_size()
    }

    fn not_ready(&self) -> TransportError {
        TransportError::NotReady {
            name: self.shared.name.clone(),
        }
    }

    async fn start(&self) -> Result<(), TransportError> {
        if !self.device.is_ready() {
            return Err(DeviceError::NotReady {
                name: self.device.name().to_string(),
            }
            .into());
        }

        let shared = Arc::downgrade(&self.shared);
        self.device.set_event_handler(Arc::new(move |event: StreamEvent| {
            if let Some(shared) = shared.upgrade() {
                shared.on_event(event);
            }
        }))?;

        let buffer = self.shared.ring().take_next().ok_or(DeviceError::NoBuffer)?;
        let index = buffer.index;
        if let Err(e) = self.device.rx_enable(buffer) {
            self.shared.reclaim(index, &e);
            return Err(e.into());
        }
        Ok(())
    }
}

#[async_trait]
impl Backend for StreamBackend {
    fn name(&self) -> &str {
        &self.shared.name
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Stream
    }

    fn format(&self) -> WireFormat {
        self.shared.codec.format()
    }

    async fn initialize(&self) -> Result<(), TransportError> {
        if self
            .initialized
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(TransportError::AlreadyInitialized {
                name: self.shared.name.clone(),
            });
        }
        if let Err(e) = self.start().await {
            self.initialized.store(false, Ordering::SeqCst);
            return Err(e);
        }
        tracing::info!(
            backend = %self.shared.name,
            device = %self.device.name(),
            frame_size = self.shared.codec.frame_size(),
            "Stream backend initialized"
        );
        Ok(())
    }

    async fn send(&self, frame: &Frame) -> Result<(), TransportError> {
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(self.not_ready());
        }
        frame.ensure_sendable()?;
        let bytes: Bytes = self.shared.codec.encode(frame)?;

        let acquire = self.shared.tx_gate.acquire();
        let permit = match self.send_timeout {
            Some(timeout) => tokio::time::timeout(timeout, acquire).await.map_err(|_| {
                TransportError::GateTimeout {
                    name: self.shared.name.clone(),
                    timeout,
                }
            })?,
            None => acquire.await,
        }
        .map_err(|_| DeviceError::Closed)?;
        // Given back by the transmit-done handler.
        permit.forget();
        self.shared.tx_busy.store(true, Ordering::SeqCst);

        if let Err(e) = self.device.tx(bytes) {
            self.shared.release_gate();
            return Err(e.into());
        }
        tracing::debug!(backend = %self.shared.name, "Frame handed to device");
        Ok(())
    }

    fn set_receive_callback(&self, callback: ReceiveCallback) -> Result<(), TransportError> {
        self.shared.dispatch.set_receive(callback);
        Ok(())
    }

    fn set_ack_callback(&self, callback: AckCallback) -> Result<(), TransportError> {
        self.shared.dispatch.set_ack(callback);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;
    use tokio::sync::mpsc;

    use super::*;
    use crate::error::ErrorKind;
    use crate::transport::device::StreamEventHandler;
    use crate::transport::loopback::{LoopbackSerial, serial_pair};
    use crate::wire::ProxyMessage;

    /// Device whose receiver can be made to fail, dropping the buffer.
    #[derive(Default)]
    struct FlakyReceiver {
        failing: AtomicBool,
        handler: Mutex<Option<StreamEventHandler>>,
    }

    impl FlakyReceiver {
        fn emit(&self, event: StreamEvent) {
            let handler = self.handler.lock().unwrap().clone();
            if let Some(handler) = handler {
                handler(event);
            }
        }
    }

    impl StreamDevice for FlakyReceiver {
        fn name(&self) -> &str {
            "uart9"
        }

        fn is_ready(&self) -> bool {
            true
        }

        fn set_event_handler(&self, handler: StreamEventHandler) -> Result<(), DeviceError> {
            *self.handler.lock().unwrap() = Some(handler);
            Ok(())
        }

        fn rx_enable(&self, _buffer: RxBuffer) -> Result<(), DeviceError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(DeviceError::Closed);
            }
            Ok(())
        }

        fn rx_buf_rsp(&self, _buffer: RxBuffer) -> Result<(), DeviceError> {
            Err(DeviceError::Closed)
        }

        fn rx_disable(&self) -> Result<(), DeviceError> {
            Ok(())
        }

        fn tx(&self, _data: Bytes) -> Result<(), DeviceError> {
            Err(DeviceError::Closed)
        }
    }

    fn config() -> ProxyConfig {
        ProxyConfig::default()
    }

    fn backend(device: &Arc<LoopbackSerial>) -> StreamBackend {
        let device: Arc<dyn StreamDevice> = device.clone();
        StreamBackend::new("uart", device, WireFormat::Acknowledged, &config())
    }

    fn collect_frames(backend: &StreamBackend) -> mpsc::UnboundedReceiver<Frame> {
        let (tx, rx) = mpsc::unbounded_channel();
        backend
            .set_receive_callback(Arc::new(move |frame: Frame| {
                let _ = tx.send(frame);
                Ok(())
            }))
            .unwrap();
        rx
    }

    fn data(id: u32) -> Frame {
        Frame::Proxy(
            ProxyMessage::data(id, vec![id as u8; 4], "temp", &config().limits).unwrap(),
        )
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<Frame>) -> Frame {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("frame within a second")
            .expect("channel open")
    }

    // ── Lifecycle ──

    #[tokio::test]
    async fn test_initialize_twice_fails() {
        let (a, _b, _link) = serial_pair("uart0", "uart1");
        let backend = backend(&a);
        backend.initialize().await.unwrap();
        assert!(matches!(
            backend.initialize().await,
            Err(TransportError::AlreadyInitialized { .. })
        ));
    }

    #[tokio::test]
    async fn test_initialize_requires_ready_device() {
        let (a, _b, _link) = serial_pair("uart0", "uart1");
        a.set_ready(false);
        let backend = backend(&a);
        let err = backend.initialize().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotReady);

        // Nothing was claimed, so a later attempt may succeed.
        a.set_ready(true);
        backend.initialize().await.unwrap();
    }

    #[tokio::test]
    async fn test_rejected_receive_buffers_return_to_ring() {
        let device = Arc::new(FlakyReceiver::default());
        device.failing.store(true, Ordering::SeqCst);
        let dyn_device: Arc<dyn StreamDevice> = device.clone();
        let backend = StreamBackend::new("uart", dyn_device, WireFormat::Acknowledged, &config());
        let count = config().rx_buffer_count;

        assert!(matches!(
            backend.initialize().await,
            Err(TransportError::Device(DeviceError::Closed))
        ));
        assert_eq!(backend.free_rx_buffers(), count);

        device.failing.store(false, Ordering::SeqCst);
        backend.initialize().await.unwrap();
        assert_eq!(backend.free_rx_buffers(), count - 1);

        // Re-enabling after a resync and answering a buffer request both fail.
        device.failing.store(true, Ordering::SeqCst);
        device.emit(StreamEvent::RxDisabled);
        device.emit(StreamEvent::RxBufRequest);
        assert_eq!(backend.free_rx_buffers(), count - 1);
    }

    #[tokio::test]
    async fn test_send_before_initialize_is_not_ready() {
        let (a, _b, _link) = serial_pair("uart0", "uart1");
        let backend = backend(&a);
        assert!(matches!(
            backend.send(&data(1)).await,
            Err(TransportError::NotReady { .. })
        ));
    }

    // ── Traffic ──

    #[tokio::test]
    async fn test_frames_cross_the_link_in_order() {
        let (a, b, _link) = serial_pair("uart0", "uart1");
        let tx_side = backend(&a);
        let rx_side = backend(&b);
        let mut frames = collect_frames(&rx_side);
        tx_side.initialize().await.unwrap();
        rx_side.initialize().await.unwrap();

        for id in 1..=6 {
            tx_side.send(&data(id)).await.unwrap();
        }
        for id in 1..=6 {
            assert_eq!(recv(&mut frames).await, data(id));
        }
    }

    #[tokio::test]
    async fn test_acks_reach_ack_callback() {
        let (a, b, _link) = serial_pair("uart0", "uart1");
        let tx_side = backend(&a);
        let rx_side = backend(&b);
        let (ack_tx, mut ack_rx) = mpsc::unbounded_channel();
        rx_side
            .set_ack_callback(Arc::new(move |id: u32| {
                let _ = ack_tx.send(id);
                Ok(())
            }))
            .unwrap();
        tx_side.initialize().await.unwrap();
        rx_side.initialize().await.unwrap();

        tx_side.send(&Frame::Proxy(ProxyMessage::ack(42))).await.unwrap();
        assert_eq!(ack_rx.recv().await, Some(42));
    }

    #[tokio::test]
    async fn test_noise_forces_resync() {
        let (a, b, _link) = serial_pair("uart0", "uart1");
        let tx_side = backend(&a);
        let rx_side = backend(&b);
        let mut frames = collect_frames(&rx_side);
        tx_side.initialize().await.unwrap();
        rx_side.initialize().await.unwrap();

        // Misalign the stream: three stray bytes, then a full frame of
        // garbage so the buffer completes and fails validation.
        b.inject(vec![0xFFu8; 3]);
        b.inject(vec![0xFFu8; rx_side.frame_size()]);
        tokio::time::sleep(Duration::from_millis(50)).await;

        tx_side.send(&data(9)).await.unwrap();
        assert_eq!(recv(&mut frames).await, data(9));
        assert_eq!(rx_side.free_rx_buffers(), config().rx_buffer_count - 2);
    }

    #[tokio::test]
    async fn test_aborted_transmission_releases_gate() {
        let (a, b, _link) = serial_pair("uart0", "uart1");
        let tx_side = backend(&a);
        let rx_side = backend(&b);
        let mut frames = collect_frames(&rx_side);
        tx_side.initialize().await.unwrap();
        rx_side.initialize().await.unwrap();

        a.abort_next_tx();
        tx_side.send(&data(1)).await.unwrap();
        tx_side.send(&data(2)).await.unwrap();
        assert_eq!(recv(&mut frames).await, data(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gate_wait_can_time_out() {
        let (a, _b, _link) = serial_pair("uart0", "uart1");
        let mut cfg = config();
        cfg.send_timeout_ms = Some(20);
        let device: Arc<dyn StreamDevice> = a.clone();
        let backend = StreamBackend::new("uart", device, WireFormat::Acknowledged, &cfg);
        backend.initialize().await.unwrap();

        // Hold the gate as if a transmission were still in flight.
        let permit = backend.shared.tx_gate.acquire().await.unwrap();
        permit.forget();
        backend.shared.tx_busy.store(true, Ordering::SeqCst);

        assert!(matches!(
            backend.send(&data(1)).await,
            Err(TransportError::GateTimeout { .. })
        ));
    }

    #[test]
    fn test_ring_rotates_and_reclaims() {
        let mut ring = RxRing::new(3, 8);
        let first = ring.take_next().unwrap();
        let second = ring.take_next().unwrap();
        assert_eq!((first.index, second.index), (0, 1));
        assert!(ring.put_back(first));
        assert_eq!(ring.take_next().unwrap().index, 2);
        assert_eq!(ring.take_next().unwrap().index, 0);
        assert!(ring.take_next().is_none());
        assert!(!ring.put_back(RxBuffer::new(7, 8)));

        assert!(ring.restore(1));
        assert!(!ring.restore(1));
        assert!(!ring.restore(7));
        assert_eq!(ring.take_next().unwrap().index, 1);
    }
}
