//! Netsight Helper Client Library
//!
//! This crate runs inside the unprivileged monitoring application. It
//! connects to the elevated helper over the platform secure channel,
//! authenticates with a keyed signature over its own process id, and issues
//! typed telemetry requests. Loss of the connection is surfaced both as an
//! explicit error on the failing call and as an event on a channel the
//! application can watch.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use netsight_client::{ClientConfig, HelperClient};
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = ClientConfig::new().with_timeout(Duration::from_secs(10));
//!
//! let mut client = HelperClient::connect(config)?;
//! let stats = client.connection_stats()?;
//! println!("{} connections observed", stats.connections.len());
//!
//! client.disconnect();
//! # Ok(())
//! # }
//! ```

mod client;

pub use client::*;
// Re-export the payload types callers see in responses
pub use netsight_common::protocol::{
    ConnectionStat, ConnectionStatsResponse, ErrorCode, ErrorPayload, HeartbeatResponse,
    ProcessStat, ProcessStatsResponse,
};
pub use netsight_common::SOCKET_NAME;
