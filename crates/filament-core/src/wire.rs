//! Wire protocol between nodes.
//!
//! Every frame is self-describing: a handshake, a data payload addressed to
//! a mailbox or channel, or a control signal for the destination's node
//! controller. Frames are postcard-encoded; on byte-stream transports they
//! are delimited by a 4-byte big-endian length prefix.

use crate::{
    ChannelId, DiedReason, Fingerprint, Message, MonitorRef, NodeId, ProcessId, RawClosure,
    SpawnRef,
};
use serde::{Deserialize, Serialize};

/// Where a data frame is headed.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Destination {
    /// A process mailbox.
    Process(ProcessId),
    /// A typed channel queue.
    Channel(ChannelId),
}

impl Destination {
    /// The node that owns the destination.
    pub fn node(&self) -> &NodeId {
        match self {
            Destination::Process(pid) => pid.node(),
            Destination::Channel(cid) => cid.owner().node(),
        }
    }
}

/// Who emitted a control message.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum SenderId {
    /// A process, for signals requested by user code.
    Process(ProcessId),
    /// A node controller, for signals it originates itself.
    Node(NodeId),
}

/// The process protocol.
///
/// Every control frame carries one signal; the node controller that owns the
/// implied destination interprets it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Signal {
    /// Install a bidirectional link between the sender and `target`.
    Link {
        /// The process to link with.
        target: ProcessId,
    },
    /// Remove a link between the sender and `target`.
    Unlink {
        /// The linked process.
        target: ProcessId,
    },
    /// Install a monitor on `target` under `mref`.
    Monitor {
        /// The process to watch.
        target: ProcessId,
        /// The watcher-allocated reference.
        mref: MonitorRef,
    },
    /// Remove the monitor installed under `mref`.
    Unmonitor {
        /// The reference from the original `Monitor`.
        mref: MonitorRef,
    },
    /// Resolve `closure` on the receiving node, start it as a new process,
    /// and reply with `DidSpawn`.
    Spawn {
        /// The serializable computation to start.
        closure: RawClosure,
        /// The requester-allocated correlation reference.
        sref: SpawnRef,
    },
    /// The reply to `Spawn`; surfaces in the requester's mailbox as a
    /// [`crate::SpawnReply`].
    DidSpawn {
        /// The process that asked for the spawn.
        requester: ProcessId,
        /// The reference from the request.
        sref: SpawnRef,
        /// The new process.
        pid: ProcessId,
    },
    /// A process died; the receiving controller fans this out to its local
    /// linkers and monitorers.
    Died {
        /// The dead process.
        pid: ProcessId,
        /// Why it died.
        reason: DiedReason,
    },
}

/// One unit on the wire.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Frame {
    /// First frame on every connection: names the connecting node so the
    /// receiver can attribute a later connection failure.
    Hello {
        /// The connecting node.
        node: NodeId,
    },
    /// A payload for a mailbox or a channel queue.
    Data {
        /// Where it is headed.
        dest: Destination,
        /// The sending process.
        sender: ProcessId,
        /// The payload's type fingerprint.
        fingerprint: Fingerprint,
        /// The encoded payload.
        payload: Vec<u8>,
    },
    /// A control signal for the destination node's controller.
    Control {
        /// Who emitted the signal.
        sender: SenderId,
        /// The signal itself.
        signal: Signal,
    },
}

impl Frame {
    /// Builds a data frame from a tagged message.
    pub fn data(dest: Destination, sender: ProcessId, message: Message) -> Self {
        let (fingerprint, payload) = message.into_parts();
        Frame::Data {
            dest,
            sender,
            fingerprint,
            payload,
        }
    }

    /// Serializes this frame to bytes.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        postcard::to_allocvec(self).map_err(WireError::Encode)
    }

    /// Deserializes a frame from bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        postcard::from_bytes(bytes).map_err(WireError::Decode)
    }
}

/// Errors from frame encoding or decoding.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// Frame serialization failed.
    #[error("frame encode failed: {0}")]
    Encode(postcard::Error),
    /// Frame deserialization failed.
    #[error("frame decode failed: {0}")]
    Decode(postcard::Error),
}

/// Prefixes an encoded frame with its 4-byte big-endian length.
///
/// Byte-stream transports use this to delimit frames; a reader recovers
/// the boundary by reading the four length bytes first. Message-oriented
/// transports do not need it.
pub fn length_prefix(payload: &[u8]) -> Vec<u8> {
    let len = payload.len() as u32;
    let mut framed = Vec::with_capacity(4 + payload.len());
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(payload);
    framed
}
