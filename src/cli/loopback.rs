//! Loopback demo: two domains in one process.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use clap::{Args, ValueEnum};
use serde::Serialize;

use crate::bus::{Bus, LocalBus};
use crate::config::ProxyConfig;
use crate::engine::{AgentConfig, DeliveryMode, ProxyAgent};
use crate::stats::{Counter, LinkStatus, StatsSnapshot};
use crate::transport::device::{PacketDevice, StreamDevice};
use crate::transport::loopback::{LinkSwitch, packet_pair, serial_pair};
use crate::transport::{Backend, PacketBackend, StreamBackend};

const SENDER_DOMAIN: &str = "cpuapp";
const RECEIVER_DOMAIN: &str = "cpurad";
const SENSOR_CHANNEL: &str = "sensor";
const COMMAND_CHANNEL: &str = "command";
const SAMPLE_SIZE: usize = 4;
const STARTUP_TIMEOUT: Duration = Duration::from_secs(10);
const POLL_INTERVAL: Duration = Duration::from_millis(5);

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportArg {
    Stream,
    Packet,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeArg {
    Acked,
    OneWay,
}

impl From<ModeArg> for DeliveryMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Acked => DeliveryMode::Acknowledged,
            ModeArg::OneWay => DeliveryMode::OneWay,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct LoopbackArgs {
    /// Device pair connecting the two domains
    #[arg(long, value_enum, default_value = "stream")]
    pub transport: TransportArg,

    /// Delivery mode of both agents
    #[arg(long, value_enum, default_value = "acked")]
    pub mode: ModeArg,

    /// Messages to publish on the sender domain
    #[arg(long, default_value = "10")]
    pub count: u32,

    /// Publish the first N messages while the link is down
    #[arg(long, default_value = "0")]
    pub loss: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct Received {
    pub sequence: u32,
    pub domain: String,
}

/// Outcome of one loopback run.
#[derive(Debug, Clone, Serialize)]
pub struct LoopbackReport {
    pub transport: String,
    pub mode: String,
    pub published: u32,
    pub received: Vec<Received>,
    pub sender: StatsSnapshot,
    pub receiver: StatsSnapshot,
}

/// Run the `loopback` command and print its report.
pub async fn run_loopback_command(args: LoopbackArgs, base: &ProxyConfig) -> anyhow::Result<()> {
    let report = run_loopback(&args, base).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn backends(
    transport: TransportArg,
    mode: DeliveryMode,
    sender: &ProxyConfig,
    receiver: &ProxyConfig,
) -> (Arc<dyn Backend>, Arc<dyn Backend>, LinkSwitch) {
    let format = mode.wire_format();
    match transport {
        TransportArg::Stream => {
            let (a, b, link) = serial_pair("uart0", "uart1");
            let a: Arc<dyn StreamDevice> = a;
            let b: Arc<dyn StreamDevice> = b;
            (
                Arc::new(StreamBackend::new("proxy", a, format, sender)),
                Arc::new(StreamBackend::new("proxy", b, format, receiver)),
                link,
            )
        }
        TransportArg::Packet => {
            let (a, b, link) = packet_pair("ipc0", "ipc0");
            let a: Arc<dyn PacketDevice> = a;
            let b: Arc<dyn PacketDevice> = b;
            (
                Arc::new(PacketBackend::new("proxy", a, format, sender)),
                Arc::new(PacketBackend::new("proxy", b, format, receiver)),
                link,
            )
        }
    }
}

async fn wait_for<F>(what: &str, timeout: Duration, condition: F) -> anyhow::Result<()>
where
    F: Fn() -> bool,
{
    tokio::time::timeout(timeout, async {
        while !condition() {
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    })
    .await
    .map_err(|_| anyhow::anyhow!("Timed out waiting for {}", what))
}

/// Wire a sender and a receiver domain back to back, publish `count`
/// samples on the sender and collect what the receiver's bus sees.
pub async fn run_loopback(args: &LoopbackArgs, base: &ProxyConfig) -> anyhow::Result<LoopbackReport> {
    let mode = DeliveryMode::from(args.mode);
    let sender_cfg = Arc::new(ProxyConfig {
        domain: SENDER_DOMAIN.to_string(),
        ..base.clone()
    });
    let receiver_cfg = Arc::new(ProxyConfig {
        domain: RECEIVER_DOMAIN.to_string(),
        ..base.clone()
    });
    let (backend_a, backend_b, link) = backends(args.transport, mode, &sender_cfg, &receiver_cfg);

    // Acknowledged delivery lands on shadow channels; one-way delivery
    // publishes on the ordinary channel with the sender's provenance.
    let acked = mode == DeliveryMode::Acknowledged;
    let bus_a = LocalBus::shared(SENDER_DOMAIN);
    bus_a.register(SENSOR_CHANNEL, SAMPLE_SIZE, false)?;
    bus_a.register(COMMAND_CHANNEL, SAMPLE_SIZE, acked)?;
    let bus_b = LocalBus::shared(RECEIVER_DOMAIN);
    bus_b.register(SENSOR_CHANNEL, SAMPLE_SIZE, acked)?;
    bus_b.register(COMMAND_CHANNEL, SAMPLE_SIZE, false)?;

    let sub_a = bus_a.subscribe("proxy", &[SENSOR_CHANNEL])?;
    let receiver_channels: &[&str] = if acked {
        &[COMMAND_CHANNEL]
    } else {
        &[SENSOR_CHANNEL, COMMAND_CHANNEL]
    };
    let sub_b = bus_b.subscribe("proxy", receiver_channels)?;
    let mut listener = bus_b.subscribe("listener", &[SENSOR_CHANNEL])?;

    let bus: Arc<dyn Bus> = bus_a.clone();
    let agent_a = ProxyAgent::new(AgentConfig::new("proxy", mode), sender_cfg.clone(), bus, backend_a)?;
    let bus: Arc<dyn Bus> = bus_b.clone();
    let agent_b = ProxyAgent::new(AgentConfig::new("proxy", mode), receiver_cfg, bus, backend_b)?;
    let handle_a = agent_a.clone().spawn(sub_a);
    let handle_b = agent_b.clone().spawn(sub_b);

    let (stats_a, stats_b) = (agent_a.stats(), agent_b.stats());
    wait_for("both agents to come up", STARTUP_TIMEOUT, || {
        stats_a.status() == LinkStatus::Up && stats_b.status() == LinkStatus::Up
    })
    .await?;
    tracing::info!(transport = ?args.transport, mode = %mode, count = args.count, "Loopback link up");

    let publish_timeout = sender_cfg.publish_timeout();
    let dropped = args.loss.min(args.count);
    if dropped > 0 {
        link.set_up(false);
        for sequence in 0..dropped {
            let payload = Bytes::copy_from_slice(&sequence.to_le_bytes());
            bus_a.publish(SENSOR_CHANNEL, payload, publish_timeout).await?;
        }
        let handed_over = u64::from(dropped);
        wait_for("lost messages to be sent", STARTUP_TIMEOUT, || {
            stats_a.get(Counter::FramesSent) + stats_a.get(Counter::SendFailures) >= handed_over
        })
        .await?;
        link.set_up(true);
        tracing::info!(lost = dropped, "Link restored");
    }
    for sequence in dropped..args.count {
        let payload = Bytes::copy_from_slice(&sequence.to_le_bytes());
        bus_a.publish(SENSOR_CHANNEL, payload, publish_timeout).await?;
    }

    // Long enough for every retry of the last message.
    let policy = sender_cfg.retry.policy();
    let settle: Duration = (0..policy.max_attempts)
        .map(|attempts| policy.timeout_for(attempts))
        .sum::<Duration>()
        + Duration::from_millis(200);

    let mut received = Vec::new();
    let collect = async {
        while received.len() < args.count as usize {
            let Some(message) = listener.recv().await else { break };
            let mut raw = [0u8; 4];
            let len = message.payload.len().min(raw.len());
            raw[..len].copy_from_slice(&message.payload[..len]);
            received.push(Received {
                sequence: u32::from_le_bytes(raw),
                domain: message.domain,
            });
        }
    };
    let _ = tokio::time::timeout(settle, collect).await;
    if acked {
        if let Some(tracker) = agent_a.tracker() {
            let _ = wait_for("pending sends to drain", settle, || tracker.is_empty()).await;
        }
    }

    handle_a.abort();
    handle_b.abort();

    Ok(LoopbackReport {
        transport: format!("{:?}", args.transport).to_lowercase(),
        mode: mode.to_string(),
        published: args.count,
        received,
        sender: agent_a.stats().snapshot(),
        receiver: agent_b.stats().snapshot(),
    })
}
