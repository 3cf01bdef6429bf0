//! Messages the runtime itself delivers into mailboxes.
//!
//! Both are ordinary [`Remotable`](crate::Remotable) payloads; user code
//! receives them with the same selective-receive machinery as anything else.

use crate::{DiedReason, MonitorRef, ProcessId, SpawnRef};
use serde::{Deserialize, Serialize};

/// Delivered at most once per installed monitor, when the target dies.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorNotification {
    /// The reference returned by the `monitor` call.
    pub mref: MonitorRef,
    /// The process that died.
    pub pid: ProcessId,
    /// Why it died.
    pub reason: DiedReason,
}

/// The reply to a remote spawn request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnReply {
    /// The reference the requester allocated for this spawn.
    pub sref: SpawnRef,
    /// The pid of the newly started process.
    pub pid: ProcessId,
}
