//! Labnode - Client library for Labnode laboratory devices
//!
//! Talks to a device over TCP or a serial port. Requests are CBOR maps of
//! operation ids to arguments; many requests can be in flight at once and
//! replies are matched back to their callers by correlation id.
//!
//! ```no_run
//! use labnode::network::{ConnectionManager, TransportConfig};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let manager = ConnectionManager::default();
//! manager.connect(&TransportConfig::tcp("192.168.1.50", 4223)).await?;
//! let identity = manager.identify().await?;
//! println!("device type {}", identity.device_type);
//! manager.close().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod network;
pub mod protocol;

pub use ciborium::value::Value;
pub use config::Config;
pub use network::{ConnectionManager, ConnectionOptions, ConnectionState, RequestError, TransportConfig};
pub use protocol::{CorrelationId, Framing, OperationId, OperationMap};
