use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::ids::MessageIdSource;
use crate::bus::{Bus, BusMessage, Subscription};
use crate::config::ProxyConfig;
use crate::error::{BusError, CodecError, Error};
use crate::provenance::ProvenanceFilter;
use crate::stats::{AgentStats, Counter, LinkStatus};
use crate::tracker::{PendingSendTracker, RetryTick, TimeoutAction};
use crate::transport::{AckCallback, Backend, ReceiveCallback};
use crate::wire::{DomainMessage, Frame, MessageKind, ProxyMessage, WireFormat};

/// How an agent delivers publications to the peer domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// Typed envelopes, acknowledged by the peer and retried until they are.
    Acknowledged,
    /// Domain-tagged envelopes, sent once.
    OneWay,
}

impl DeliveryMode {
    pub fn wire_format(&self) -> WireFormat {
        match self {
            DeliveryMode::Acknowledged => WireFormat::Acknowledged,
            DeliveryMode::OneWay => WireFormat::DomainTagged,
        }
    }
}

impl std::fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryMode::Acknowledged => write!(f, "acknowledged"),
            DeliveryMode::OneWay => write!(f, "one-way"),
        }
    }
}

/// Static description of one agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    pub name: String,
    pub mode: DeliveryMode,
    /// Channels this agent forwards. Empty forwards everything its
    /// subscription delivers.
    pub channels: Vec<String>,
    /// Track acknowledged sends for retry. Ignored in one-way mode.
    pub tracking: bool,
}

impl AgentConfig {
    pub fn new(name: impl Into<String>, mode: DeliveryMode) -> Self {
        Self {
            name: name.into(),
            mode,
            channels: Vec::new(),
            tracking: true,
        }
    }

    pub fn with_channels<I, S>(mut self, channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.channels = channels.into_iter().map(Into::into).collect();
        self
    }

    pub fn without_tracking(mut self) -> Self {
        self.tracking = false;
        self
    }

    fn forwards(&self, channel: &str) -> bool {
        self.channels.is_empty() || self.channels.iter().any(|c| c == channel)
    }
}

/// Aborts the agent's worker tasks when the agent loop ends.
struct Workers(Vec<JoinHandle<()>>);

impl Drop for Workers {
    fn drop(&mut self) {
        for worker in &self.0 {
            worker.abort();
        }
    }
}

/// Forwards publications between the local bus and one backend.
pub struct ProxyAgent {
    config: AgentConfig,
    settings: Arc<ProxyConfig>,
    bus: Arc<dyn Bus>,
    backend: Arc<dyn Backend>,
    tracker: Option<Arc<PendingSendTracker>>,
    retry_rx: std::sync::Mutex<Option<mpsc::Receiver<RetryTick>>>,
    ids: MessageIdSource,
    provenance: ProvenanceFilter,
    stats: Arc<AgentStats>,
}

impl ProxyAgent {
    /// Build an agent. `settings` must validate and the backend must carry
    /// the envelope of `config.mode`.
    pub fn new(
        config: AgentConfig,
        settings: Arc<ProxyConfig>,
        bus: Arc<dyn Bus>,
        backend: Arc<dyn Backend>,
    ) -> Result<Arc<Self>, Error> {
        settings.validate()?;
        let expected = config.mode.wire_format();
        if backend.format() != expected {
            return Err(CodecError::FormatMismatch { expected }.into());
        }

        let (tracker, retry_rx) = if config.mode == DeliveryMode::Acknowledged && config.tracking {
            let (tx, rx) = mpsc::channel(settings.queue_depth);
            let tracker = PendingSendTracker::new(
                config.name.clone(),
                settings.retry.policy(),
                settings.retry.max_in_flight,
                tx,
            );
            (Some(Arc::new(tracker)), Some(rx))
        } else {
            (None, None)
        };

        Ok(Arc::new(Self {
            provenance: ProvenanceFilter::new(settings.domain.clone()),
            config,
            settings,
            bus,
            backend,
            tracker,
            retry_rx: std::sync::Mutex::new(retry_rx),
            ids: MessageIdSource::new(),
            stats: Arc::new(AgentStats::new()),
        }))
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn stats(&self) -> Arc<AgentStats> {
        self.stats.clone()
    }

    pub fn tracker(&self) -> Option<&Arc<PendingSendTracker>> {
        self.tracker.as_ref()
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// Run the agent on its own task.
    pub fn spawn(self: Arc<Self>, subscription: Subscription) -> AgentHandle {
        let agent = self.clone();
        let task = tokio::spawn(self.run(subscription));
        AgentHandle { agent, task }
    }

    /// Install callbacks, bring the backend up, then forward every
    /// publication from `subscription` until the bus closes it.
    ///
    /// Only setup failures end the agent with an error; per-message
    /// failures are logged and counted.
    pub async fn run(self: Arc<Self>, mut subscription: Subscription) -> Result<(), Error> {
        tracing::info!(
            agent = %self.config.name,
            backend = %self.backend.name(),
            transport = %self.backend.kind(),
            mode = %self.config.mode,
            "Starting proxy agent"
        );
        let result = self.serve(&mut subscription).await;
        match &result {
            Ok(()) => {
                tracing::info!(agent = %self.config.name, "Proxy agent stopped");
                self.stats.set_status(LinkStatus::Stopped);
            }
            Err(e) => {
                tracing::error!(agent = %self.config.name, error = %e, "Proxy agent failed");
                self.stats.set_status(LinkStatus::Failed(e.to_string()));
            }
        }
        if let Some(tracker) = &self.tracker {
            tracker.clear();
        }
        result
    }

    async fn serve(self: &Arc<Self>, subscription: &mut Subscription) -> Result<(), Error> {
        let depth = self.settings.queue_depth;
        let (inbound_tx, inbound_rx) = mpsc::channel::<Frame>(depth);
        let mut workers = Workers(vec![tokio::spawn(self.clone().inbound_worker(inbound_rx))]);

        let ack_tx = match self.config.mode {
            DeliveryMode::Acknowledged => {
                let (tx, rx) = mpsc::channel::<u32>(depth);
                workers.0.push(tokio::spawn(self.clone().ack_worker(rx)));
                Some(tx)
            }
            DeliveryMode::OneWay => None,
        };

        let retry_rx = self
            .retry_rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let (Some(tracker), Some(rx)) = (self.tracker.clone(), retry_rx) {
            workers.0.push(tokio::spawn(self.clone().retry_worker(tracker, rx)));
        }

        self.backend
            .set_receive_callback(receive_callback(inbound_tx, ack_tx))?;
        if self.config.mode == DeliveryMode::Acknowledged {
            self.backend.set_ack_callback(self.ack_callback())?;
        }

        self.backend.initialize().await?;
        self.stats.set_status(LinkStatus::Up);
        tracing::info!(agent = %self.config.name, "Proxy agent ready");

        while let Some(message) = subscription.recv().await {
            self.forward(message).await;
        }
        tracing::debug!(agent = %self.config.name, "Subscription closed");
        drop(workers);
        Ok(())
    }

    /// Forward one local publication.
    async fn forward(&self, message: BusMessage) {
        let channel = &message.channel;
        if !self.config.forwards(&channel.name) {
            tracing::trace!(agent = %self.config.name, channel = %channel.name, "Channel not bound to agent");
            return;
        }
        if channel.shadow {
            tracing::error!(
                agent = %self.config.name,
                channel = %channel.name,
                "Forwarding of shadow channel not supported"
            );
            self.stats.record(Counter::OutboundSkipped);
            return;
        }

        let result = match self.config.mode {
            DeliveryMode::Acknowledged => {
                match ProxyMessage::data(
                    self.ids.next_id(),
                    message.payload.clone(),
                    &channel.name,
                    &self.settings.limits,
                ) {
                    Ok(envelope) => self.transmit(envelope, 0).await,
                    Err(e) => Err(e.into()),
                }
            }
            DeliveryMode::OneWay => {
                if !self.provenance.should_forward(&message.domain) {
                    tracing::debug!(
                        agent = %self.config.name,
                        channel = %channel.name,
                        origin = %message.domain,
                        "Publication from another domain, not forwarded"
                    );
                    self.stats.record(Counter::OutboundSkipped);
                    return;
                }
                self.send_tagged(&message).await
            }
        };

        if let Err(e) = result {
            tracing::error!(
                agent = %self.config.name,
                channel = %channel.name,
                error = %e,
                "Failed to forward publication"
            );
        }
    }

    /// Track `message` (data only) with `attempts` prior re-sends, then
    /// hand it to the backend.
    ///
    /// Tracking comes first so an acknowledgment racing the send always
    /// finds its entry. A failed first send is untracked again.
    pub async fn transmit(&self, message: ProxyMessage, attempts: u8) -> Result<(), Error> {
        let tracker = self.tracker.as_ref().filter(|_| !message.is_ack());
        if let Some(tracker) = tracker {
            tracker.start_or_reschedule(&message, attempts)?;
        }

        let id = message.id;
        match self.backend.send(&Frame::Proxy(message)).await {
            Ok(()) => {
                self.stats.record(Counter::FramesSent);
                if attempts > 0 {
                    self.stats.record(Counter::Retransmissions);
                }
                tracing::debug!(agent = %self.config.name, msg_id = id, attempts, "Message sent");
                Ok(())
            }
            Err(e) => {
                self.stats.record(Counter::SendFailures);
                if let Some(tracker) = tracker {
                    if attempts == 0 {
                        if let Err(e) = tracker.stop(id) {
                            tracing::debug!(
                                agent = %self.config.name,
                                msg_id = id,
                                error = %e,
                                "Failed send was no longer tracked"
                            );
                        }
                    }
                }
                Err(e.into())
            }
        }
    }

    async fn send_tagged(&self, message: &BusMessage) -> Result<(), Error> {
        let envelope = DomainMessage::wrap(
            &self.settings.domain,
            message.payload.clone(),
            &message.channel.name,
            &self.settings.limits,
        )?;
        match self.backend.send(&Frame::Domain(envelope)).await {
            Ok(()) => {
                self.stats.record(Counter::FramesSent);
                tracing::debug!(
                    agent = %self.config.name,
                    channel = %message.channel.name,
                    "Tagged message sent"
                );
                Ok(())
            }
            Err(e) => {
                self.stats.record(Counter::SendFailures);
                Err(e.into())
            }
        }
    }

    /// Publish a frame received from the peer on the local bus.
    pub async fn publish_inbound(&self, frame: Frame) -> Result<(), Error> {
        match frame {
            Frame::Proxy(msg) => {
                let channel = self
                    .bus
                    .channel(&msg.channel)
                    .ok_or_else(|| BusError::ChannelNotFound(msg.channel.clone()))?;
                if !channel.shadow {
                    return Err(BusError::NotShadow(channel.name).into());
                }
                self.bus.publish_shadow(&channel.name, msg.payload)?;
                tracing::debug!(
                    agent = %self.config.name,
                    channel = %channel.name,
                    msg_id = msg.id,
                    "Published on shadow channel"
                );
            }
            Frame::Domain(msg) => {
                let channel = self
                    .bus
                    .channel(&msg.channel)
                    .ok_or_else(|| BusError::ChannelNotFound(msg.channel.clone()))?;
                self.bus
                    .publish_with_domain(
                        &channel.name,
                        msg.payload,
                        &msg.domain,
                        self.settings.publish_timeout(),
                    )
                    .await?;
                tracing::debug!(
                    agent = %self.config.name,
                    channel = %channel.name,
                    origin = %msg.domain,
                    "Published message from peer domain"
                );
            }
        }
        Ok(())
    }

    fn ack_callback(&self) -> AckCallback {
        let tracker = self.tracker.clone();
        let stats = self.stats.clone();
        let agent = self.config.name.clone();
        Arc::new(move |id: u32| {
            stats.record(Counter::AcksReceived);
            let Some(tracker) = &tracker else {
                tracing::trace!(agent = %agent, msg_id = id, "Tracking disabled, acknowledgment ignored");
                return Ok(());
            };
            tracker.stop(id).map_err(|e| {
                stats.record(Counter::UnmatchedAcks);
                Error::from(e)
            })
        })
    }

    async fn inbound_worker(self: Arc<Self>, mut rx: mpsc::Receiver<Frame>) {
        while let Some(frame) = rx.recv().await {
            match self.publish_inbound(frame).await {
                Ok(()) => self.stats.record(Counter::InboundPublished),
                Err(e) => {
                    self.stats.record(Counter::InboundRejected);
                    tracing::error!(
                        agent = %self.config.name,
                        error = %e,
                        kind = %e.kind(),
                        "Failed to publish inbound message"
                    );
                }
            }
        }
    }

    async fn ack_worker(self: Arc<Self>, mut rx: mpsc::Receiver<u32>) {
        while let Some(id) = rx.recv().await {
            match self.backend.send(&Frame::Proxy(ProxyMessage::ack(id))).await {
                Ok(()) => {
                    self.stats.record(Counter::AcksSent);
                    tracing::debug!(agent = %self.config.name, msg_id = id, "Acknowledgment sent");
                }
                Err(e) => {
                    self.stats.record(Counter::SendFailures);
                    tracing::error!(
                        agent = %self.config.name,
                        msg_id = id,
                        error = %e,
                        "Failed to send acknowledgment"
                    );
                }
            }
        }
    }

    async fn retry_worker(
        self: Arc<Self>,
        tracker: Arc<PendingSendTracker>,
        mut rx: mpsc::Receiver<RetryTick>,
    ) {
        while let Some(tick) = rx.recv().await {
            match tracker.on_timeout(tick) {
                Some(TimeoutAction::Retry { message, attempts }) => {
                    let id = message.id;
                    // The next timer is already armed; a failed send is
                    // retried when it fires.
                    match self.backend.send(&Frame::Proxy(message)).await {
                        Ok(()) => {
                            self.stats.record(Counter::FramesSent);
                            self.stats.record(Counter::Retransmissions);
                        }
                        Err(e) => {
                            self.stats.record(Counter::SendFailures);
                            tracing::error!(
                                agent = %self.config.name,
                                msg_id = id,
                                attempts,
                                error = %e,
                                "Retransmission failed"
                            );
                        }
                    }
                }
                Some(TimeoutAction::GaveUp { .. }) => self.stats.record(Counter::GivenUp),
                None => {}
            }
        }
    }
}

/// Receive callback: queue the frame for publishing, then queue an
/// acknowledgment for data messages. Never blocks.
fn receive_callback(inbound: mpsc::Sender<Frame>, acks: Option<mpsc::Sender<u32>>) -> ReceiveCallback {
    Arc::new(move |frame: Frame| {
        let ack_id = match &frame {
            Frame::Proxy(msg) if msg.kind == MessageKind::Data => Some(msg.id),
            _ => None,
        };
        inbound
            .try_send(frame)
            .map_err(|_| Error::QueueFull { queue: "inbound" })?;
        if let (Some(id), Some(acks)) = (ack_id, &acks) {
            acks.try_send(id)
                .map_err(|_| Error::QueueFull { queue: "acknowledgment" })?;
        }
        Ok(())
    })
}

/// A running agent.
pub struct AgentHandle {
    agent: Arc<ProxyAgent>,
    task: JoinHandle<Result<(), Error>>,
}

impl AgentHandle {
    pub fn agent(&self) -> &Arc<ProxyAgent> {
        &self.agent
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub fn abort(&self) {
        self.task.abort();
    }

    /// Wait for the agent task to end. An aborted agent counts as stopped;
    /// a panicked one is reported as [`Error::Crashed`].
    pub async fn join(self) -> Result<(), Error> {
        let stats = self.agent.stats();
        match self.task.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => {
                tracing::info!(agent = %self.agent.name(), "Proxy agent aborted");
                stats.set_status(LinkStatus::Stopped);
                Ok(())
            }
            Err(e) => {
                tracing::error!(agent = %self.agent.name(), error = %e, "Proxy agent task panicked");
                if let Some(tracker) = self.agent.tracker() {
                    tracker.clear();
                }
                let err = Error::Crashed {
                    agent: self.agent.name().to_string(),
                };
                stats.set_status(LinkStatus::Failed(err.to_string()));
                Err(err)
            }
        }
    }
}
