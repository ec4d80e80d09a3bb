//! In-process device pairs.
//!
//! [`serial_pair`] connects two [`LoopbackSerial`] devices the way a
//! crossed UART cable would: bytes written on one side stream into the
//! receive buffers of the other. [`packet_pair`] connects two
//! [`LoopbackIpc`] devices that exchange whole packets between endpoints of
//! the same name. Both carry a link switch for loss tests, and the serial
//! device can inject noise into its receive path.
//!
//! Each device runs a service task that raises its events, so handlers
//! never run on the caller's stack. Pairs must be created inside a tokio
//! runtime.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};

use bytes::Bytes;
use tokio::sync::mpsc;

use super::device::{
    EndpointCallbacks, PacketDevice, RxBuffer, StreamDevice, StreamEvent, StreamEventHandler,
};
use crate::error::DeviceError;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Shared on/off switch for a device pair.
#[derive(Debug, Clone)]
pub struct LinkSwitch(Arc<AtomicBool>);

impl LinkSwitch {
    fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    pub fn set_up(&self, up: bool) {
        self.0.store(up, Ordering::SeqCst);
    }

    pub fn is_up(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ── Serial ──

enum SerialCommand {
    Deliver(Bytes),
    Emit(StreamEvent),
}

#[derive(Default)]
struct SerialState {
    handler: Option<StreamEventHandler>,
    enabled: bool,
    current: Option<RxBuffer>,
    next: Option<RxBuffer>,
}

/// One end of a loopback serial link.
pub struct LoopbackSerial {
    name: String,
    ready: AtomicBool,
    abort_next_tx: AtomicBool,
    tx_count: AtomicU64,
    link: LinkSwitch,
    commands: mpsc::UnboundedSender<SerialCommand>,
    peer: OnceLock<Weak<LoopbackSerial>>,
    state: Mutex<SerialState>,
}

/// Two serial devices wired back to back.
pub fn serial_pair(
    a: impl Into<String>,
    b: impl Into<String>,
) -> (Arc<LoopbackSerial>, Arc<LoopbackSerial>, LinkSwitch) {
    let link = LinkSwitch::new();
    let dev_a = LoopbackSerial::spawn(a.into(), link.clone());
    let dev_b = LoopbackSerial::spawn(b.into(), link.clone());
    let _ = dev_a.peer.set(Arc::downgrade(&dev_b));
    let _ = dev_b.peer.set(Arc::downgrade(&dev_a));
    (dev_a, dev_b, link)
}

impl LoopbackSerial {
    fn spawn(name: String, link: LinkSwitch) -> Arc<Self> {
        let (commands, mut rx) = mpsc::unbounded_channel();
        let device = Arc::new(Self {
            name,
            ready: AtomicBool::new(true),
            abort_next_tx: AtomicBool::new(false),
            tx_count: AtomicU64::new(0),
            link,
            commands,
            peer: OnceLock::new(),
            state: Mutex::new(SerialState::default()),
        });

        let weak = Arc::downgrade(&device);
        tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                let Some(device) = weak.upgrade() else { break };
                match command {
                    SerialCommand::Deliver(bytes) => device.receive(&bytes),
                    SerialCommand::Emit(event) => device.raise(event),
                }
            }
        });
        device
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    /// Make the next transmission end in [`StreamEvent::TxAborted`]
    /// without reaching the peer.
    pub fn abort_next_tx(&self) {
        self.abort_next_tx.store(true, Ordering::SeqCst);
    }

    /// Feed raw bytes into this device's receive path.
    pub fn inject(&self, bytes: impl Into<Bytes>) {
        self.post(SerialCommand::Deliver(bytes.into()));
    }

    /// Transmissions started on this device.
    pub fn tx_count(&self) -> u64 {
        self.tx_count.load(Ordering::SeqCst)
    }

    pub fn link(&self) -> &LinkSwitch {
        &self.link
    }

    fn post(&self, command: SerialCommand) {
        if self.commands.send(command).is_err() {
            tracing::trace!(device = %self.name, "Serial service task stopped");
        }
    }

    fn raise(&self, event: StreamEvent) {
        let handler = lock(&self.state).handler.clone();
        match handler {
            Some(handler) => handler(event),
            None => tracing::trace!(device = %self.name, ?event, "No handler, event dropped"),
        }
    }

    /// Stream `bytes` into the receive buffers.
    fn receive(&self, bytes: &[u8]) {
        let mut rest = bytes;
        while !rest.is_empty() {
            let mut events = Vec::new();
            {
                let mut state = lock(&self.state);
                if !state.enabled {
                    tracing::trace!(device = %self.name, dropped = rest.len(), "Receiver off");
                    return;
                }
                let Some(current) = state.current.as_mut() else {
                    return;
                };
                let taken = current.fill(rest);
                rest = &rest[taken..];
                if current.is_full() {
                    if let Some(full) = state.current.take() {
                        events.push(StreamEvent::RxReady {
                            data: Bytes::copy_from_slice(full.filled()),
                        });
                        events.push(StreamEvent::RxBufReleased(full));
                    }
                    match state.next.take() {
                        Some(next) => {
                            state.current = Some(next);
                            events.push(StreamEvent::RxBufRequest);
                        }
                        None => {
                            state.enabled = false;
                            events.push(StreamEvent::RxDisabled);
                        }
                    }
                }
            }
            for event in events {
                self.raise(event);
            }
        }
    }
}

impl StreamDevice for LoopbackSerial {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn set_event_handler(&self, handler: StreamEventHandler) -> Result<(), DeviceError> {
        lock(&self.state).handler = Some(handler);
        Ok(())
    }

    fn rx_enable(&self, buffer: RxBuffer) -> Result<(), DeviceError> {
        let mut state = lock(&self.state);
        if state.enabled {
            drop(state);
            self.post(SerialCommand::Emit(StreamEvent::RxBufReleased(buffer)));
            return Err(DeviceError::Busy {
                name: self.name.clone(),
            });
        }
        state.enabled = true;
        state.current = Some(buffer);
        drop(state);
        self.post(SerialCommand::Emit(StreamEvent::RxBufRequest));
        Ok(())
    }

    fn rx_buf_rsp(&self, buffer: RxBuffer) -> Result<(), DeviceError> {
        let mut state = lock(&self.state);
        if !state.enabled || state.next.is_some() {
            drop(state);
            // Not needed; hand it straight back.
            self.post(SerialCommand::Emit(StreamEvent::RxBufReleased(buffer)));
            return Ok(());
        }
        state.next = Some(buffer);
        Ok(())
    }

    fn rx_disable(&self) -> Result<(), DeviceError> {
        let mut state = lock(&self.state);
        if !state.enabled {
            return Ok(());
        }
        state.enabled = false;
        let released: Vec<RxBuffer> = state
            .current
            .take()
            .into_iter()
            .chain(state.next.take())
            .collect();
        drop(state);
        for buffer in released {
            self.post(SerialCommand::Emit(StreamEvent::RxBufReleased(buffer)));
        }
        self.post(SerialCommand::Emit(StreamEvent::RxDisabled));
        Ok(())
    }

    fn tx(&self, data: Bytes) -> Result<(), DeviceError> {
        if !self.is_ready() {
            return Err(DeviceError::NotReady {
                name: self.name.clone(),
            });
        }
        self.tx_count.fetch_add(1, Ordering::SeqCst);
        if self.abort_next_tx.swap(false, Ordering::SeqCst) {
            self.post(SerialCommand::Emit(StreamEvent::TxAborted));
            return Ok(());
        }
        if self.link.is_up() {
            if let Some(peer) = self.peer.get().and_then(Weak::upgrade) {
                peer.post(SerialCommand::Deliver(data));
            }
        }
        self.post(SerialCommand::Emit(StreamEvent::TxDone));
        Ok(())
    }
}

// ── Packet IPC ──

enum IpcCommand {
    Bound(String),
    Received(String, Bytes),
    Error(String, String),
}

#[derive(Default)]
struct IpcState {
    opened: bool,
    endpoints: HashMap<String, EndpointCallbacks>,
    bound: HashSet<String>,
}

/// One side of a loopback IPC instance.
pub struct LoopbackIpc {
    name: String,
    ready: AtomicBool,
    tx_count: AtomicU64,
    link: LinkSwitch,
    commands: mpsc::UnboundedSender<IpcCommand>,
    peer: OnceLock<Weak<LoopbackIpc>>,
    state: Mutex<IpcState>,
}

/// Two IPC devices sharing one instance.
pub fn packet_pair(
    a: impl Into<String>,
    b: impl Into<String>,
) -> (Arc<LoopbackIpc>, Arc<LoopbackIpc>, LinkSwitch) {
    let link = LinkSwitch::new();
    let dev_a = LoopbackIpc::spawn(a.into(), link.clone());
    let dev_b = LoopbackIpc::spawn(b.into(), link.clone());
    let _ = dev_a.peer.set(Arc::downgrade(&dev_b));
    let _ = dev_b.peer.set(Arc::downgrade(&dev_a));
    (dev_a, dev_b, link)
}

impl LoopbackIpc {
    fn spawn(name: String, link: LinkSwitch) -> Arc<Self> {
        let (commands, mut rx) = mpsc::unbounded_channel();
        let device = Arc::new(Self {
            name,
            ready: AtomicBool::new(true),
            tx_count: AtomicU64::new(0),
            link,
            commands,
            peer: OnceLock::new(),
            state: Mutex::new(IpcState::default()),
        });

        let weak = Arc::downgrade(&device);
        tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                let Some(device) = weak.upgrade() else { break };
                device.service(command);
            }
        });
        device
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn tx_count(&self) -> u64 {
        self.tx_count.load(Ordering::SeqCst)
    }

    pub fn link(&self) -> &LinkSwitch {
        &self.link
    }

    /// Deliver a raw packet to a local endpoint as if the peer sent it.
    pub fn inject(&self, endpoint: &str, data: impl Into<Bytes>) {
        self.post(IpcCommand::Received(endpoint.to_string(), data.into()));
    }

    /// Raise the error callback of a local endpoint.
    pub fn report_error(&self, endpoint: &str, message: &str) {
        self.post(IpcCommand::Error(endpoint.to_string(), message.to_string()));
    }

    fn post(&self, command: IpcCommand) {
        if self.commands.send(command).is_err() {
            tracing::trace!(device = %self.name, "IPC service task stopped");
        }
    }

    fn peer(&self) -> Option<Arc<LoopbackIpc>> {
        self.peer.get().and_then(Weak::upgrade)
    }

    fn has_endpoint(&self, endpoint: &str) -> bool {
        lock(&self.state).endpoints.contains_key(endpoint)
    }

    fn mark_bound(&self, endpoint: &str) {
        lock(&self.state).bound.insert(endpoint.to_string());
        self.post(IpcCommand::Bound(endpoint.to_string()));
    }

    fn service(&self, command: IpcCommand) {
        let (endpoint, callbacks) = {
            let state = lock(&self.state);
            let endpoint = match &command {
                IpcCommand::Bound(ep) | IpcCommand::Received(ep, _) | IpcCommand::Error(ep, _) => {
                    ep.clone()
                }
            };
            let callbacks = state.endpoints.get(&endpoint).cloned();
            (endpoint, callbacks)
        };
        let Some(callbacks) = callbacks else {
            tracing::trace!(device = %self.name, endpoint = %endpoint, "No such endpoint, dropped");
            return;
        };
        match command {
            IpcCommand::Bound(_) => (callbacks.bound)(),
            IpcCommand::Received(_, data) => (callbacks.received)(data),
            IpcCommand::Error(_, message) => (callbacks.error)(&message),
        }
    }
}

impl PacketDevice for LoopbackIpc {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn open_instance(&self) -> Result<(), DeviceError> {
        let mut state = lock(&self.state);
        if state.opened {
            return Err(DeviceError::AlreadyOpen {
                name: self.name.clone(),
            });
        }
        state.opened = true;
        Ok(())
    }

    fn register_endpoint(
        &self,
        name: &str,
        callbacks: EndpointCallbacks,
    ) -> Result<(), DeviceError> {
        {
            let mut state = lock(&self.state);
            if !state.opened {
                return Err(DeviceError::NotReady {
                    name: self.name.clone(),
                });
            }
            state.endpoints.insert(name.to_string(), callbacks);
        }
        if let Some(peer) = self.peer() {
            if peer.has_endpoint(name) {
                self.mark_bound(name);
                peer.mark_bound(name);
            }
        }
        Ok(())
    }

    fn send(&self, endpoint: &str, data: Bytes) -> Result<(), DeviceError> {
        {
            let state = lock(&self.state);
            if !state.endpoints.contains_key(endpoint) {
                return Err(DeviceError::NoEndpoint {
                    name: endpoint.to_string(),
                });
            }
            if !state.bound.contains(endpoint) {
                return Err(DeviceError::NotBound {
                    name: endpoint.to_string(),
                });
            }
        }
        self.tx_count.fetch_add(1, Ordering::SeqCst);
        if !self.link.is_up() {
            return Ok(());
        }
        match self.peer() {
            Some(peer) => {
                peer.post(IpcCommand::Received(endpoint.to_string(), data));
                Ok(())
            }
            None => Err(DeviceError::Closed),
        }
    }
}
