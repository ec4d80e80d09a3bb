//! Forwarding engine.
//!
//! A [`ProxyAgent`] sits between the local bus and one backend:
//!
//! ```text
//! bus subscription ──► forward ──► backend.send ──► peer domain
//!                        │
//!                        └─ tracker (acknowledged mode) ── timer ──► retry worker
//!
//! peer domain ──► backend receive callback ──► inbound queue ──► bus publish
//!                                         └──► ack queue ──► backend.send(ack)
//! ```
//!
//! Backend callbacks never block: they only push onto bounded queues that
//! worker tasks drain.

mod agent;
mod ids;

pub use agent::{AgentConfig, AgentHandle, DeliveryMode, ProxyAgent};
pub use ids::MessageIdSource;
