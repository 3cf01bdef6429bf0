//! Transport abstraction for the filament runtime.
//!
//! The runtime consumes a connection-oriented, reliable, per-connection
//! ordered message service with explicit failure events; this crate defines
//! that seam and ships two implementations:
//!
//! - [`memory`]: an in-process hub, for tests that run several nodes inside
//!   one OS process.
//! - [`quic`]: QUIC via `quinn` with self-signed development certificates,
//!   restricted to a single ordered stream per connection so frame order is
//!   preserved end-to-end.
//!
//! Connections are handed out as split sender/receiver halves so the
//! runtime can run its writer and reader loops as independent tasks. There
//! is no reconnection and no failure masking here: when a half reports
//! closure or an error, the connection is gone for good.

#![warn(missing_docs)]

pub mod memory;
pub mod quic;

use async_trait::async_trait;
use filament_core::EndpointAddr;

/// Errors reported by a transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The address could not be parsed by this transport.
    #[error("invalid address: {0}")]
    InvalidAddr(String),
    /// Another endpoint is already bound to the address.
    #[error("address already in use: {0}")]
    AddrInUse(String),
    /// Establishing a connection failed.
    #[error("connect to {addr} failed: {detail}")]
    Connect {
        /// The address we tried to reach.
        addr: String,
        /// Transport-specific detail.
        detail: String,
    },
    /// The connection was closed by the peer or torn down locally.
    #[error("connection closed")]
    Closed,
    /// The endpoint itself has shut down; no further connections.
    #[error("endpoint shut down")]
    Shutdown,
    /// Certificate or TLS configuration failed.
    #[error("tls error: {0}")]
    Tls(String),
    /// An underlying I/O error.
    #[error("i/o error: {0}")]
    Io(String),
}

/// The sending half of one connection.
#[async_trait]
pub trait ConnSender: Send {
    /// Writes one frame. Frames arrive at the peer intact and in send order.
    async fn send(&mut self, frame: &[u8]) -> Result<(), TransportError>;
}

/// The receiving half of one connection.
#[async_trait]
pub trait ConnReceiver: Send {
    /// Reads the next frame.
    ///
    /// `Ok(None)` means the peer closed the connection in an orderly way;
    /// an error means it failed. The runtime treats both as permanent.
    async fn recv(&mut self) -> Result<Option<Vec<u8>>, TransportError>;
}

/// A split connection: independent sender and receiver halves.
pub type Connection = (Box<dyn ConnSender>, Box<dyn ConnReceiver>);

/// An endpoint-addressed, connection-oriented transport.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// The address peers use to reach this endpoint.
    fn addr(&self) -> EndpointAddr;

    /// Opens a connection to a remote endpoint. May suspend while the
    /// connection is established.
    async fn connect(&self, remote: &EndpointAddr) -> Result<Connection, TransportError>;

    /// Waits for the next inbound connection.
    async fn accept(&self) -> Result<Connection, TransportError>;
}
