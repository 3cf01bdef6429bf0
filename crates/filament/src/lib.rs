//! # filament — a distributed process runtime
//!
//! Lightweight, location-transparent processes that communicate by typed,
//! asynchronous messages across a network:
//!
//! - **Processes**: independently scheduled tasks with pids that are never
//!   reused, each owning a mailbox with selective receive
//! - **Typed channels**: one-way queues with serializable send ends and
//!   mergeable receive ends
//! - **Monitors**: one-shot subscriptions to a process's death
//! - **Links**: bidirectional failure propagation
//! - **Closures**: serializable `(label, environment)` computations that
//!   run on remote nodes
//!
//! Reliability is layered on an abstract transport
//! ([`filament_transport::Transport`]): per-destination delivery is
//! ordered, and a broken connection is permanent — the runtime converts it
//! into death notifications rather than reconnecting.
//!
//! # Quick start
//!
//! ```ignore
//! use filament::prelude::*;
//! use filament_transport::memory::MemoryHub;
//!
//! #[tokio::main]
//! async fn main() {
//!     let hub = MemoryHub::new();
//!     let node = LocalNode::start(hub.open("a").unwrap(), RemoteTable::builder().build());
//!
//!     node.run(|process| async move {
//!         let echo = process.spawn_local(|p| async move {
//!             let (from, text): (ProcessId, String) = p.expect().await?;
//!             p.send(from, &text);
//!             Ok(())
//!         });
//!         process.send(echo, &(process.pid(), "hello".to_string()));
//!         let reply: String = process.expect().await?;
//!         println!("{reply}");
//!         Ok(())
//!     })
//!     .await;
//! }
//! ```

#![warn(missing_docs)]

pub mod channel;
pub mod closure;
mod controller;
pub mod error;
pub mod mailbox;
pub mod node;
pub mod process;

pub use channel::{ReceivePort, SendPort, merge_ports_biased, merge_ports_rr};
pub use closure::{
    Closure, DynValue, ProcBody, RemoteTable, RemoteTableBuilder, StepBody, cp_bind, cp_seq,
    link_back, send_result,
};
pub use error::{ClosureError, MailboxError};
pub use mailbox::{Mailbox, Match};
pub use node::LocalNode;
pub use process::{Fault, Process, ProcessResult, catch, terminate};

// Core identifier and message types, re-exported for convenience.
pub use filament_core::{
    ChannelId, CodecError, DiedReason, EndpointAddr, Fingerprint, Message, MonitorNotification,
    MonitorRef, NodeId, ProcessId, RawClosure, Remotable, SpawnRef, SpawnReply,
};

/// The transport seam and its bundled implementations.
pub use filament_transport as transport;

/// One-stop imports for application code.
pub mod prelude {
    pub use crate::channel::{ReceivePort, SendPort, merge_ports_biased, merge_ports_rr};
    pub use crate::closure::{Closure, ProcBody, RemoteTable, StepBody, cp_bind, cp_seq};
    pub use crate::mailbox::Match;
    pub use crate::node::LocalNode;
    pub use crate::process::{Fault, Process, ProcessResult, catch, terminate};
    pub use filament_core::{
        DiedReason, EndpointAddr, MonitorNotification, MonitorRef, NodeId, ProcessId, Remotable,
        SpawnRef, SpawnReply,
    };
}
