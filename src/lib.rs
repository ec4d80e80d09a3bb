//! domainlink: cross-domain publish/subscribe forwarding.
//!
//! Mirrors publications made on a bus channel in one compute domain onto
//! the bus of a peer domain, over a byte-stream link or a packet IPC link.
//!
//! Two delivery modes:
//! - **Acknowledged**: typed envelopes carrying a message id; the receiver
//!   publishes on a shadow channel and acknowledges, the sender retries
//!   with exponential backoff until acknowledged or out of attempts.
//! - **One-way**: envelopes tagged with the origin domain; inbound messages
//!   keep that tag as provenance so they are never forwarded back.
//!
//! ```text
//! ┌─────────┐   ┌────────────┐   ┌─────────┐  link  ┌─────────┐   ┌────────────┐   ┌─────────┐
//! │ bus (A) │──►│ ProxyAgent │──►│ Backend │◄──────►│ Backend │──►│ ProxyAgent │──►│ bus (B) │
//! └─────────┘   └────────────┘   └─────────┘        └─────────┘   └────────────┘   └─────────┘
//!                     │
//!                     └── PendingSendTracker (retry timers)
//! ```

pub mod bus;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod provenance;
pub mod stats;
pub mod tracker;
pub mod transport;
pub mod wire;

pub use config::ProxyConfig;
pub use engine::{AgentConfig, AgentHandle, DeliveryMode, ProxyAgent};
pub use error::{Error, ErrorKind, Result};
