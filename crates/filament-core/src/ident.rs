//! Identifier types.
//!
//! Every addressable thing in filament is named by one of the types in this
//! module. A [`NodeId`] wraps a transport endpoint address and is stable for
//! the node's lifetime. A [`ProcessId`] pairs a node with an index drawn from
//! that node's strictly monotonic counter, so a pid is never reused even
//! after the process it named has died. Channels, monitors and spawn
//! requests are numbered from per-process counters in the same way.

use serde::{Deserialize, Serialize};
use std::fmt;

/// An opaque transport endpoint address.
///
/// The runtime never interprets the contents; each transport implementation
/// defines its own address syntax (a socket address for QUIC, an arbitrary
/// label for the in-memory transport).
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EndpointAddr(String);

impl EndpointAddr {
    /// Creates an address from its printable form.
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    /// Returns the printable form of the address.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for EndpointAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EndpointAddr({})", self.0)
    }
}

impl fmt::Display for EndpointAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies a node by its transport endpoint address.
///
/// Two nodes are the same node iff their addresses are equal. The identifier
/// is persistent across the node's lifetime; it is embedded in every
/// [`ProcessId`] minted by the node.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(EndpointAddr);

impl NodeId {
    /// Creates a node identifier from a transport address.
    pub fn new(addr: EndpointAddr) -> Self {
        Self(addr)
    }

    /// Returns the transport address of the node.
    #[inline]
    pub fn addr(&self) -> &EndpointAddr {
        &self.0
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "nid://{}", self.0)
    }
}

/// A process identifier.
///
/// A pid is the pair of the owning node and an index assigned by that node
/// from a strictly monotonic counter. Indices are **never reused** within a
/// node's lifetime, so a pid names at most one process, ever; holding a pid
/// for a dead process is safe and merely means signals about it resolve to
/// its recorded death.
///
/// Ordering is lexicographic over `(node, index)` and exists only so that a
/// bidirectional link between two processes has a canonical orientation.
///
/// # Examples
///
/// ```
/// use filament_core::{EndpointAddr, NodeId, ProcessId};
///
/// let node = NodeId::new(EndpointAddr::new("127.0.0.1:4000"));
/// let pid = ProcessId::new(node.clone(), 7);
/// assert_eq!(pid.node(), &node);
/// assert_eq!(format!("{}", pid), "pid://127.0.0.1:4000/7");
/// ```
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProcessId {
    node: NodeId,
    index: u64,
}

impl ProcessId {
    /// Creates a pid from its parts.
    ///
    /// Indices must come from the owning node's counter; this constructor is
    /// otherwise only useful for deserialization and tests.
    pub fn new(node: NodeId, index: u64) -> Self {
        Self { node, index }
    }

    /// Returns the owning node.
    #[inline]
    pub fn node(&self) -> &NodeId {
        &self.node
    }

    /// Returns the process index within the owning node.
    #[inline]
    pub fn index(&self) -> u64 {
        self.index
    }
}

impl fmt::Debug for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pid<{}/{}>", self.node.0, self.index)
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pid://{}/{}", self.node.0, self.index)
    }
}

/// Identifies one typed channel.
///
/// Channels are owned by exactly one process and die with it; the identifier
/// is the owner's pid plus an index from the owner's channel counter.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelId {
    owner: ProcessId,
    index: u64,
}

impl ChannelId {
    /// Creates a channel identifier from its parts.
    pub fn new(owner: ProcessId, index: u64) -> Self {
        Self { owner, index }
    }

    /// Returns the owning process.
    #[inline]
    pub fn owner(&self) -> &ProcessId {
        &self.owner
    }

    /// Returns the channel index within the owning process.
    #[inline]
    pub fn index(&self) -> u64 {
        self.index
    }
}

impl fmt::Debug for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Chan<{:?}.{}>", self.owner, self.index)
    }
}

/// Identifies a single monitor installation.
///
/// The id component is drawn from the monitoring process's own counter, so a
/// watcher can correlate an [`crate::MonitorNotification`] with the
/// `monitor` call that produced it, and `unmonitor` can name exactly one
/// installation. Node controllers key their tables by `(watcher, ref)`, so
/// equal counters from different watchers never collide.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MonitorRef {
    target: ProcessId,
    id: u64,
}

impl MonitorRef {
    /// Creates a monitor reference from its parts.
    pub fn new(target: ProcessId, id: u64) -> Self {
        Self { target, id }
    }

    /// Returns the monitored process.
    #[inline]
    pub fn target(&self) -> &ProcessId {
        &self.target
    }

    /// Returns the watcher-local counter value.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl fmt::Debug for MonitorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Monitor<{:?}#{}>", self.target, self.id)
    }
}

/// Correlates a remote spawn request with its reply.
///
/// Drawn from the requesting process's counter; the [`crate::SpawnReply`]
/// carries it back so a selective receive can pick out the right reply.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SpawnRef(u64);

impl SpawnRef {
    /// Creates a spawn reference from a raw counter value.
    pub const fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw counter value.
    #[inline]
    pub const fn as_raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Debug for SpawnRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Spawn#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(addr: &str) -> NodeId {
        NodeId::new(EndpointAddr::new(addr))
    }

    #[test]
    fn test_pid_ordering_is_lexicographic() {
        let a = ProcessId::new(node("a"), 9);
        let b = ProcessId::new(node("b"), 1);
        assert!(a < b, "node component dominates");

        let lo = ProcessId::new(node("a"), 1);
        let hi = ProcessId::new(node("a"), 2);
        assert!(lo < hi, "index breaks ties within a node");
    }

    #[test]
    fn test_pid_display() {
        let pid = ProcessId::new(node("127.0.0.1:9000"), 42);
        assert_eq!(format!("{}", pid), "pid://127.0.0.1:9000/42");
        assert_eq!(format!("{:?}", pid), "Pid<127.0.0.1:9000/42>");
    }

    #[test]
    fn test_pid_serialization() {
        let pid = ProcessId::new(node("host:1"), 123);
        let bytes = postcard::to_allocvec(&pid).unwrap();
        let decoded: ProcessId = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(pid, decoded);
    }

    #[test]
    fn test_pid_hash() {
        use std::collections::HashSet;

        let mut set = HashSet::new();
        set.insert(ProcessId::new(node("a"), 1));
        set.insert(ProcessId::new(node("a"), 2));
        set.insert(ProcessId::new(node("a"), 1));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_channel_id_parts() {
        let owner = ProcessId::new(node("a"), 3);
        let cid = ChannelId::new(owner.clone(), 5);
        assert_eq!(cid.owner(), &owner);
        assert_eq!(cid.index(), 5);
    }

    #[test]
    fn test_monitor_ref_correlation() {
        let target = ProcessId::new(node("b"), 8);
        let r1 = MonitorRef::new(target.clone(), 0);
        let r2 = MonitorRef::new(target.clone(), 1);
        assert_ne!(r1, r2, "separate installations on one target are distinct");
    }

    #[test]
    fn test_spawn_ref_roundtrip() {
        let sref = SpawnRef::from_raw(77);
        assert_eq!(sref.as_raw(), 77);
        let bytes = postcard::to_allocvec(&sref).unwrap();
        assert_eq!(sref, postcard::from_bytes(&bytes).unwrap());
    }
}
