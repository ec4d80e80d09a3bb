//! Backend over a packet IPC device.
//!
//! Each backend owns one endpoint named `ept_<backend>`. The peer domain
//! registers the same name; until it does the endpoint is unbound and
//! `initialize` waits, up to the configured bind timeout.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Semaphore;

use super::device::{EndpointCallbacks, PacketDevice};
use super::{AckCallback, Backend, Dispatch, ReceiveCallback, TransportKind};
use crate::config::ProxyConfig;
use crate::error::{DeviceError, TransportError};
use crate::wire::{Codec, Frame, WireFormat};

/// Backend for inter-processor mailboxes.
pub struct PacketBackend {
    name: String,
    endpoint: String,
    device: Arc<dyn PacketDevice>,
    codec: Codec,
    bind_timeout: Duration,
    bound: Arc<Semaphore>,
    dispatch: Arc<Dispatch>,
    initialized: AtomicBool,
}

impl PacketBackend {
    pub fn new(
        name: impl Into<String>,
        device: Arc<dyn PacketDevice>,
        format: WireFormat,
        config: &ProxyConfig,
    ) -> Self {
        let name = name.into();
        Self {
            endpoint: format!("ept_{name}"),
            dispatch: Arc::new(Dispatch::new(&name, TransportKind::Packet, config.limits)),
            name,
            device,
            codec: Codec::new(format, config.limits),
            bind_timeout: config.bind_timeout(),
            bound: Arc::new(Semaphore::new(0)),
            initialized: AtomicBool::new(false),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn callbacks(&self) -> EndpointCallbacks {
        let bound = self.bound.clone();
        let endpoint = self.endpoint.clone();
        let on_bound = move || {
            tracing::info!(endpoint = %endpoint, "Endpoint bound");
            bound.add_permits(1);
        };

        let codec = self.codec;
        let dispatch = self.dispatch.clone();
        let endpoint = self.endpoint.clone();
        let on_received = move |data: Bytes| {
            let expected = codec.frame_size();
            if data.len() != expected {
                tracing::error!(
                    endpoint = %endpoint,
                    len = data.len(),
                    expected,
                    "Packet size does not match envelope size, dropped"
                );
                return;
            }
            match codec.decode(&data) {
                Ok(frame) => dispatch.deliver(frame),
                Err(e) => tracing::error!(endpoint = %endpoint, error = %e, "Failed to decode packet"),
            }
        };

        let endpoint = self.endpoint.clone();
        let on_error = move |message: &str| {
            tracing::error!(endpoint = %endpoint, message, "IPC endpoint error");
        };

        EndpointCallbacks {
            bound: Arc::new(on_bound),
            received: Arc::new(on_received),
            error: Arc::new(on_error),
        }
    }

    async fn start(&self) -> Result<(), TransportError> {
        if !self.device.is_ready() {
            return Err(DeviceError::NotReady {
                name: self.device.name().to_string(),
            }
            .into());
        }

        match self.device.open_instance() {
            Ok(()) => {}
            Err(DeviceError::AlreadyOpen { .. }) => {
                tracing::debug!(backend = %self.name, "IPC instance already open");
            }
            Err(e) => return Err(e.into()),
        }

        self.device
            .register_endpoint(&self.endpoint, self.callbacks())?;

        let permit = tokio::time::timeout(self.bind_timeout, self.bound.acquire())
            .await
            .map_err(|_| TransportError::BindTimeout {
                endpoint: self.endpoint.clone(),
                timeout: self.bind_timeout,
            })?
            .map_err(|_| DeviceError::Closed)?;
        permit.forget();
        Ok(())
    }
}

#[async_trait]
impl Backend for PacketBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Packet
    }

    fn format(&self) -> WireFormat {
        self.codec.format()
    }

    async fn initialize(&self) -> Result<(), TransportError> {
        if self
            .initialized
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(TransportError::AlreadyInitialized {
                name: self.name.clone(),
            });
        }
        if let Err(e) = self.start().await {
            self.initialized.store(false, Ordering::SeqCst);
            tracing::error!(backend = %self.name, error = %e, "Packet backend failed to start");
            return Err(e);
        }
        tracing::info!(
            backend = %self.name,
            endpoint = %self.endpoint,
            frame_size = self.codec.frame_size(),
            "Packet backend initialized"
        );
        Ok(())
    }

    async fn send(&self, frame: &Frame) -> Result<(), TransportError> {
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(TransportError::NotReady {
                name: self.name.clone(),
            });
        }
        frame.ensure_sendable()?;
        let bytes = self.codec.encode(frame)?;
        self.device.send(&self.endpoint, bytes)?;
        tracing::debug!(backend = %self.name, endpoint = %self.endpoint, "Packet sent");
        Ok(())
    }

    fn set_receive_callback(&self, callback: ReceiveCallback) -> Result<(), TransportError> {
        self.dispatch.set_receive(callback);
        Ok(())
    }

    fn set_ack_callback(&self, callback: AckCallback) -> Result<(), TransportError> {
        self.dispatch.set_ack(callback);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tokio::sync::mpsc;

    use super::*;
    use crate::error::ErrorKind;
    use crate::transport::loopback::{LoopbackIpc, packet_pair};
    use crate::wire::{DomainMessage, ProxyMessage};

    fn backend(device: &Arc<LoopbackIpc>, format: WireFormat) -> PacketBackend {
        let device: Arc<dyn PacketDevice> = device.clone();
        PacketBackend::new("agent", device, format, &ProxyConfig::default())
    }

    async fn bring_up(a: &PacketBackend, b: &PacketBackend) {
        let (ra, rb) = tokio::join!(a.initialize(), b.initialize());
        ra.unwrap();
        rb.unwrap();
    }

    #[tokio::test]
    async fn test_endpoint_name() {
        let (a, _b, _link) = packet_pair("ipc0", "ipc0");
        assert_eq!(backend(&a, WireFormat::Acknowledged).endpoint(), "ept_agent");
    }

    #[tokio::test(start_paused = true)]
    async fn test_bind_timeout_without_peer() {
        let (a, _b, _link) = packet_pair("ipc0", "ipc0");
        let backend = backend(&a, WireFormat::Acknowledged);
        let err = backend.initialize().await.unwrap_err();
        assert!(matches!(err, TransportError::BindTimeout { ref endpoint, .. } if endpoint == "ept_agent"));
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_frames_and_acks_are_dispatched() {
        let (a, b, _link) = packet_pair("ipc0", "ipc0");
        let left = backend(&a, WireFormat::Acknowledged);
        let right = backend(&b, WireFormat::Acknowledged);

        let (frame_tx, mut frames) = mpsc::unbounded_channel();
        right
            .set_receive_callback(Arc::new(move |frame: Frame| {
                let _ = frame_tx.send(frame);
                Ok(())
            }))
            .unwrap();
        let (ack_tx, mut acks) = mpsc::unbounded_channel();
        left.set_ack_callback(Arc::new(move |id: u32| {
            let _ = ack_tx.send(id);
            Ok(())
        }))
        .unwrap();

        bring_up(&left, &right).await;

        let limits = ProxyConfig::default().limits;
        let msg = ProxyMessage::data(42, vec![1u8, 2], "temp", &limits).unwrap();
        left.send(&Frame::Proxy(msg.clone())).await.unwrap();
        assert_eq!(frames.recv().await, Some(Frame::Proxy(msg)));

        right.send(&Frame::Proxy(ProxyMessage::ack(42))).await.unwrap();
        assert_eq!(acks.recv().await, Some(42));
    }

    #[tokio::test]
    async fn test_wrong_sized_packet_is_dropped() {
        let (a, b, _link) = packet_pair("ipc0", "ipc0");
        let left = backend(&a, WireFormat::DomainTagged);
        let right = backend(&b, WireFormat::DomainTagged);
        let (frame_tx, mut frames) = mpsc::unbounded_channel();
        right
            .set_receive_callback(Arc::new(move |frame: Frame| {
                let _ = frame_tx.send(frame);
                Ok(())
            }))
            .unwrap();
        bring_up(&left, &right).await;

        b.inject("ept_agent", Bytes::from_static(b"short"));
        let limits = ProxyConfig::default().limits;
        let msg = DomainMessage::wrap("cpuapp", vec![3u8; 4], "temp", &limits).unwrap();
        left.send(&Frame::Domain(msg)).await.unwrap();

        match frames.recv().await {
            Some(Frame::Domain(received)) => {
                assert_eq!(received.domain, "cpuapp_packet");
                assert_eq!(received.payload.as_ref(), &[3u8; 4]);
            }
            other => panic!("Expected domain frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_empty_data_is_rejected() {
        let (a, b, _link) = packet_pair("ipc0", "ipc0");
        let left = backend(&a, WireFormat::Acknowledged);
        let right = backend(&b, WireFormat::Acknowledged);
        bring_up(&left, &right).await;

        let limits = ProxyConfig::default().limits;
        let empty = ProxyMessage::data(1, Bytes::new(), "temp", &limits).unwrap();
        let err = left.send(&Frame::Proxy(empty)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert_eq!(a.tx_count(), 0);
    }
}
