//! Publish/subscribe bus contract and an in-process implementation.
//!
//! Channels are registered once with a fixed message size. A shadow channel
//! mirrors a channel owned by another domain: local code may read it but
//! only the forwarding layer may publish to it. Every publication carries
//! the domain it originated from.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};

use crate::config::DEFAULT_QUEUE_DEPTH;
use crate::error::BusError;

/// Static description of a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
    pub name: String,
    /// Exact size of every message on this channel.
    pub message_size: usize,
    pub shadow: bool,
}

/// A publication as seen by an observer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub channel: ChannelInfo,
    pub payload: Bytes,
    /// Domain the publication originated from.
    pub domain: String,
}

/// Observer side of the bus: a queue of publications on the channels the
/// observer was attached to.
#[derive(Debug)]
pub struct Subscription {
    observer: String,
    rx: mpsc::Receiver<BusMessage>,
}

impl Subscription {
    pub fn new(observer: impl Into<String>, rx: mpsc::Receiver<BusMessage>) -> Self {
        Self {
            observer: observer.into(),
            rx,
        }
    }

    pub fn observer(&self) -> &str {
        &self.observer
    }

    /// Wait for the next publication. `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<BusMessage> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<BusMessage> {
        self.rx.try_recv().ok()
    }
}

/// What the forwarding engine needs from a bus.
#[async_trait]
pub trait Bus: Send + Sync {
    /// Identity of the domain this bus lives in.
    fn domain(&self) -> &str;

    fn channel(&self, name: &str) -> Option<ChannelInfo>;

    /// Publish from local code. Shadow channels are rejected.
    async fn publish(&self, channel: &str, payload: Bytes, timeout: Duration)
    -> Result<(), BusError>;

    /// Publish a remote message to a shadow channel without blocking.
    fn publish_shadow(&self, channel: &str, payload: Bytes) -> Result<(), BusError>;

    /// Publish on behalf of another domain, recording it as provenance.
    async fn publish_with_domain(
        &self,
        channel: &str,
        payload: Bytes,
        domain: &str,
        timeout: Duration,
    ) -> Result<(), BusError>;
}

struct ChannelState {
    info: ChannelInfo,
    observers: Vec<(String, mpsc::Sender<BusMessage>)>,
    last: Option<BusMessage>,
}

/// In-process bus for one domain.
pub struct LocalBus {
    domain: String,
    queue_depth: usize,
    channels: RwLock<HashMap<String, ChannelState>>,
}

impl LocalBus {
    pub fn new(domain: impl Into<String>) -> Self {
        Self::with_queue_depth(domain, DEFAULT_QUEUE_DEPTH)
    }

    /// Observer queues hold at most `queue_depth` publications.
    pub fn with_queue_depth(domain: impl Into<String>, queue_depth: usize) -> Self {
        Self {
            domain: domain.into(),
            queue_depth: queue_depth.max(1),
            channels: RwLock::new(HashMap::new()),
        }
    }

    pub fn shared(domain: impl Into<String>) -> Arc<Self> {
        Arc::new(Self::new(domain))
    }

    pub fn register(
        &self,
        name: impl Into<String>,
        message_size: usize,
        shadow: bool,
    ) -> Result<ChannelInfo, BusError> {
        let name = name.into();
        let mut channels = self.write();
        if channels.contains_key(&name) {
            return Err(BusError::DuplicateChannel(name));
        }
        let info = ChannelInfo {
            name: name.clone(),
            message_size,
            shadow,
        };
        channels.insert(
            name,
            ChannelState {
                info: info.clone(),
                observers: Vec::new(),
                last: None,
            },
        );
        Ok(info)
    }

    /// Attach a new observer to `channels`.
    pub fn subscribe(&self, observer: &str, channels: &[&str]) -> Result<Subscription, BusError> {
        let (tx, rx) = mpsc::channel(self.queue_depth);
        let mut registry = self.write();
        if let Some(missing) = channels.iter().find(|name| !registry.contains_key(**name)) {
            return Err(BusError::ChannelNotFound(missing.to_string()));
        }
        for name in channels {
            if let Some(state) = registry.get_mut(*name) {
                state.observers.push((observer.to_string(), tx.clone()));
            }
        }
        Ok(Subscription::new(observer, rx))
    }

    /// Most recent publication on `channel`.
    pub fn last_message(&self, channel: &str) -> Option<BusMessage> {
        self.read().get(channel).and_then(|state| state.last.clone())
    }

    pub fn channel_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Record a publication and return the observer queues to notify.
    fn commit(
        &self,
        channel: &str,
        payload: Bytes,
        domain: &str,
        shadow_required: Option<bool>,
    ) -> Result<(BusMessage, Vec<(String, mpsc::Sender<BusMessage>)>), BusError> {
        let mut registry = self.write();
        let state = registry
            .get_mut(channel)
            .ok_or_else(|| BusError::ChannelNotFound(channel.to_string()))?;
        match shadow_required {
            Some(true) if !state.info.shadow => {
                return Err(BusError::NotShadow(channel.to_string()));
            }
            Some(false) if state.info.shadow => {
                return Err(BusError::ShadowChannel(channel.to_string()));
            }
            _ => {}
        }
        if payload.len() != state.info.message_size {
            return Err(BusError::MessageSize {
                channel: channel.to_string(),
                expected: state.info.message_size,
                actual: payload.len(),
            });
        }

        let message = BusMessage {
            channel: state.info.clone(),
            payload,
            domain: domain.to_string(),
        };
        state.last = Some(message.clone());
        state.observers.retain(|(_, tx)| !tx.is_closed());
        Ok((message, state.observers.clone()))
    }

    async fn notify(
        &self,
        message: BusMessage,
        observers: Vec<(String, mpsc::Sender<BusMessage>)>,
        timeout: Duration,
    ) -> Result<(), BusError> {
        for (observer, tx) in observers {
            match tx.send_timeout(message.clone(), timeout).await {
                Ok(()) => {}
                Err(SendTimeoutError::Timeout(_)) => {
                    tracing::warn!(
                        channel = %message.channel.name,
                        observer = %observer,
                        "Observer did not accept message in time"
                    );
                    return Err(BusError::Timeout {
                        channel: message.channel.name.clone(),
                        timeout,
                    });
                }
                Err(SendTimeoutError::Closed(_)) => {
                    tracing::debug!(observer = %observer, "Observer gone, skipping");
                }
            }
        }
        Ok(())
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, ChannelState>> {
        self.channels.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, ChannelState>> {
        self.channels.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Bus for LocalBus {
    fn domain(&self) -> &str {
        &self.domain
    }

    fn channel(&self, name: &str) -> Option<ChannelInfo> {
        self.read().get(name).map(|state| state.info.clone())
    }

    async fn publish(
        &self,
        channel: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<(), BusError> {
        let (message, observers) = self.commit(channel, payload, &self.domain, Some(false))?;
        self.notify(message, observers, timeout).await
    }

    fn publish_shadow(&self, channel: &str, payload: Bytes) -> Result<(), BusError> {
        let (message, observers) = self.commit(channel, payload, &self.domain, Some(true))?;
        for (observer, tx) in observers {
            match tx.try_send(message.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(channel, observer = %observer, "Observer queue full");
                    return Err(BusError::Full {
                        channel: channel.to_string(),
                    });
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::debug!(observer = %observer, "Observer gone, skipping");
                }
            }
        }
        Ok(())
    }

    async fn publish_with_domain(
        &self,
        channel: &str,
        payload: Bytes,
        domain: &str,
        timeout: Duration,
    ) -> Result<(), BusError> {
        let (message, observers) = self.commit(channel, payload, domain, None)?;
        self.notify(message, observers, timeout).await
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    const WAIT: Duration = Duration::from_millis(100);

    fn bus() -> LocalBus {
        let bus = LocalBus::with_queue_depth("cpuapp", 2);
        bus.register("temp", 4, false).unwrap();
        bus.register("remote_temp", 4, true).unwrap();
        bus
    }

    #[tokio::test]
    async fn test_publish_reaches_observers_with_own_domain() {
        let bus = bus();
        let mut sub = bus.subscribe("logger", &["temp"]).unwrap();

        bus.publish("temp", Bytes::from_static(&[1, 2, 3, 4]), WAIT)
            .await
            .unwrap();

        let msg = sub.recv().await.unwrap();
        assert_eq!(msg.channel.name, "temp");
        assert_eq!(msg.domain, "cpuapp");
        assert_eq!(msg.payload.as_ref(), &[1, 2, 3, 4]);
        assert_eq!(bus.last_message("temp"), Some(msg));
    }

    #[tokio::test]
    async fn test_shadow_rules() {
        let bus = bus();
        assert_eq!(
            bus.publish("remote_temp", Bytes::from_static(&[0; 4]), WAIT)
                .await
                .unwrap_err(),
            BusError::ShadowChannel("remote_temp".into())
        );
        assert_eq!(
            bus.publish_shadow("temp", Bytes::from_static(&[0; 4])).unwrap_err(),
            BusError::NotShadow("temp".into())
        );
        bus.publish_shadow("remote_temp", Bytes::from_static(&[9; 4]))
            .unwrap();
        assert!(bus.last_message("temp").is_none());
    }

    #[tokio::test]
    async fn test_message_size_is_enforced() {
        let bus = bus();
        let err = bus
            .publish("temp", Bytes::from_static(&[1, 2]), WAIT)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            BusError::MessageSize {
                channel: "temp".into(),
                expected: 4,
                actual: 2
            }
        );
    }

    #[tokio::test]
    async fn test_publish_with_domain_records_provenance() {
        let bus = bus();
        let mut sub = bus.subscribe("agent", &["temp", "remote_temp"]).unwrap();
        bus.publish_with_domain("temp", Bytes::from_static(&[5; 4]), "cpurad_stream", WAIT)
            .await
            .unwrap();
        assert_eq!(sub.recv().await.unwrap().domain, "cpurad_stream");
    }

    #[tokio::test]
    async fn test_shadow_publish_never_blocks() {
        let bus = bus();
        let _sub = bus.subscribe("slow", &["remote_temp"]).unwrap();
        bus.publish_shadow("remote_temp", Bytes::from_static(&[1; 4])).unwrap();
        bus.publish_shadow("remote_temp", Bytes::from_static(&[2; 4])).unwrap();
        assert_eq!(
            bus.publish_shadow("remote_temp", Bytes::from_static(&[3; 4]))
                .unwrap_err(),
            BusError::Full {
                channel: "remote_temp".into()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_times_out_on_full_observer() {
        let bus = bus();
        let _sub = bus.subscribe("slow", &["temp"]).unwrap();
        for _ in 0..2 {
            bus.publish("temp", Bytes::from_static(&[0; 4]), WAIT).await.unwrap();
        }
        assert!(matches!(
            bus.publish("temp", Bytes::from_static(&[0; 4]), WAIT).await,
            Err(BusError::Timeout { .. })
        ));
    }

    #[tokio::test]
    async fn test_registry_errors() {
        let bus = bus();
        assert_eq!(
            bus.register("temp", 4, false).unwrap_err(),
            BusError::DuplicateChannel("temp".into())
        );
        assert!(matches!(
            bus.subscribe("x", &["temp", "nope"]),
            Err(BusError::ChannelNotFound(name)) if name == "nope"
        ));
        assert!(bus.channel("nope").is_none());
        assert_eq!(bus.channel_names(), vec!["remote_temp", "temp"]);
    }
}
