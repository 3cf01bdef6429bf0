//! Core types for the filament distributed process runtime.
//!
//! This crate holds everything the runtime and the transport layer agree on
//! without depending on either: process and channel identifiers, the type
//! fingerprint scheme that gates message decoding, tagged messages, death
//! reasons, the serializable closure form, and the node-to-node wire
//! protocol.
//!
//! Nothing in here spawns tasks or touches the network.

#![warn(missing_docs)]

mod fingerprint;
mod ident;
mod message;
mod reason;
mod system;
pub mod wire;

pub use fingerprint::{Fingerprint, Remotable};
pub use ident::{ChannelId, EndpointAddr, MonitorRef, NodeId, ProcessId, SpawnRef};
pub use message::{CodecError, Message, RawClosure};
pub use reason::DiedReason;
pub use system::{MonitorNotification, SpawnReply};
