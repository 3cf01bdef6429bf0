//! Typed unidirectional channels.
//!
//! `new_chan` (on a [`Process`](crate::process::Process)) yields a
//! serializable [`SendPort`] and a receive end that stays with the creating
//! process. Receive ends compose: [`merge_ports_biased`] always drains the
//! leftmost non-empty constituent, [`merge_ports_rr`] rotates after every
//! successful receive. Selection across a merged tree is atomic — a message
//! claimed from a leaf is returned, never dropped on the floor by a
//! concurrent wakeup.
//!
//! Consuming a merged port and one of its constituents concurrently is not
//! supported; merge for fan-in, or receive from the sources directly, but
//! not both at once.

use crate::error::MailboxError;
use filament_core::{ChannelId, Message, Remotable};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// The queue behind one channel. Shared between the owning process's
/// receive end and the node controller, which routes inbound sends here.
pub(crate) struct ChanQueue {
    queue: Mutex<VecDeque<Message>>,
    notify: Notify,
}

impl ChanQueue {
    pub(crate) fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    pub(crate) fn push(&self, message: Message) {
        self.queue.lock().push_back(message);
        self.notify.notify_one();
    }

    fn try_pop(&self) -> Option<Message> {
        self.queue.lock().pop_front()
    }
}

/// The sending end of a typed channel.
///
/// Serializable: ship it to another process — on any node — and sends will
/// be routed back to the owning process's queue.
#[derive(Serialize, Deserialize)]
#[serde(transparent, bound(serialize = "", deserialize = ""))]
pub struct SendPort<T> {
    id: ChannelId,
    #[serde(skip)]
    _marker: PhantomData<fn(T)>,
}

impl<T> SendPort<T> {
    pub(crate) fn new(id: ChannelId) -> Self {
        Self {
            id,
            _marker: PhantomData,
        }
    }

    /// The channel this port sends into.
    pub fn id(&self) -> &ChannelId {
        &self.id
    }
}

impl<T> Clone for SendPort<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for SendPort<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendPort").field("id", &self.id).finish()
    }
}

#[derive(Clone)]
enum Tree {
    Leaf(Arc<ChanQueue>),
    Biased(Vec<Tree>),
    RoundRobin { children: Vec<Tree>, cursor: usize },
}

impl Tree {
    /// Atomically claims one message from the tree, honoring bias and
    /// rotation. Returns `None` when every leaf is empty.
    fn try_select(&mut self) -> Option<Message> {
        match self {
            Tree::Leaf(queue) => queue.try_pop(),
            Tree::Biased(children) => children.iter_mut().find_map(Tree::try_select),
            Tree::RoundRobin { children, cursor } => {
                let n = children.len();
                for offset in 0..n {
                    let index = (*cursor + offset) % n;
                    if let Some(message) = children[index].try_select() {
                        *cursor = (index + 1) % n;
                        return Some(message);
                    }
                }
                None
            }
        }
    }

    fn leaves<'a>(&'a self, out: &mut Vec<&'a Arc<ChanQueue>>) {
        match self {
            Tree::Leaf(queue) => out.push(queue),
            Tree::Biased(children) | Tree::RoundRobin { children, .. } => {
                for child in children {
                    child.leaves(out);
                }
            }
        }
    }
}

/// The receiving end of a typed channel, or a merge of several.
///
/// Not serializable; it never leaves the process that created its channels.
pub struct ReceivePort<T> {
    tree: Tree,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Remotable> ReceivePort<T> {
    pub(crate) fn single(queue: Arc<ChanQueue>) -> Self {
        Self {
            tree: Tree::Leaf(queue),
            _marker: PhantomData,
        }
    }

    /// Receives the next value, suspending until one arrives.
    pub async fn receive(&mut self) -> Result<T, MailboxError> {
        loop {
            if let Some(message) = self.tree.try_select() {
                return message.unpack::<T>().map_err(MailboxError::Decode);
            }

            let mut leaves = Vec::new();
            self.tree.leaves(&mut leaves);
            if leaves.is_empty() {
                // A merge of nothing can never produce a value.
                futures::future::pending::<()>().await;
            }
            let waits: Vec<_> = leaves
                .iter()
                .map(|queue| Box::pin(queue.notify.notified()))
                .collect();
            futures::future::select_all(waits).await;
        }
    }

    /// Bounded receive; `Ok(None)` on expiry. A zero duration polls without
    /// parking.
    pub async fn receive_timeout(&mut self, duration: Duration) -> Result<Option<T>, MailboxError> {
        if duration.is_zero() {
            return self.try_receive();
        }
        match tokio::time::timeout(duration, self.receive()).await {
            Ok(outcome) => outcome.map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Non-blocking receive.
    pub fn try_receive(&mut self) -> Result<Option<T>, MailboxError> {
        match self.tree.try_select() {
            Some(message) => message
                .unpack::<T>()
                .map(Some)
                .map_err(MailboxError::Decode),
            None => Ok(None),
        }
    }
}

impl<T> fmt::Debug for ReceivePort<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.tree {
            Tree::Leaf(_) => "single",
            Tree::Biased(_) => "biased",
            Tree::RoundRobin { .. } => "round-robin",
        };
        f.debug_struct("ReceivePort").field("kind", &kind).finish()
    }
}

/// Merges receive ports left-biased: each receive drains the first
/// constituent (in argument order) that has a message.
///
/// The source ports remain usable, but consuming a merged port and a
/// constituent concurrently is not supported.
pub fn merge_ports_biased<T: Remotable>(ports: &[ReceivePort<T>]) -> ReceivePort<T> {
    ReceivePort {
        tree: Tree::Biased(ports.iter().map(|p| p.tree.clone()).collect()),
        _marker: PhantomData,
    }
}

/// Merges receive ports round-robin: after each successful receive the
/// search origin rotates past the port that delivered.
///
/// The source ports remain usable, but consuming a merged port and a
/// constituent concurrently is not supported.
pub fn merge_ports_rr<T: Remotable>(ports: &[ReceivePort<T>]) -> ReceivePort<T> {
    ReceivePort {
        tree: Tree::RoundRobin {
            children: ports.iter().map(|p| p.tree.clone()).collect(),
            cursor: 0,
        },
        _marker: PhantomData,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use filament_core::{EndpointAddr, NodeId, ProcessId};

    fn port_pair<T: Remotable>() -> (Arc<ChanQueue>, ReceivePort<T>) {
        let queue = Arc::new(ChanQueue::new());
        (queue.clone(), ReceivePort::single(queue))
    }

    fn push<T: Remotable>(queue: &ChanQueue, value: &T) {
        queue.push(Message::pack(value).unwrap());
    }

    #[tokio::test]
    async fn test_single_roundtrip() {
        let (queue, mut port) = port_pair::<i64>();
        push(&queue, &42i64);
        assert_eq!(port.receive().await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_receive_blocks_until_send() {
        let (queue, mut port) = port_pair::<String>();

        let handle = tokio::spawn(async move { port.receive().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        push(&queue, &"late".to_string());

        assert_eq!(handle.await.unwrap().unwrap(), "late");
    }

    #[tokio::test]
    async fn test_biased_prefers_left() {
        let (q1, p1) = port_pair::<i64>();
        let (q2, p2) = port_pair::<i64>();
        let mut merged = merge_ports_biased(&[p1, p2]);

        push(&q2, &2i64);
        push(&q1, &1i64);

        // Left constituent wins regardless of arrival order.
        assert_eq!(merged.receive().await.unwrap(), 1);
        assert_eq!(merged.receive().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_round_robin_cycles() {
        let (q1, p1) = port_pair::<i64>();
        let (q2, p2) = port_pair::<i64>();
        let mut merged = merge_ports_rr(&[p1, p2]);

        push(&q1, &1i64);
        push(&q2, &2i64);
        push(&q1, &3i64);
        push(&q2, &4i64);

        let mut got = Vec::new();
        for _ in 0..4 {
            got.push(merged.receive().await.unwrap());
        }
        assert_eq!(got, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_round_robin_skips_empty() {
        let (q1, p1) = port_pair::<i64>();
        let (q2, p2) = port_pair::<i64>();
        let (q3, p3) = port_pair::<i64>();
        let mut merged = merge_ports_rr(&[p1, p2, p3]);

        // Only the middle port has mail; rotation continues from after it.
        push(&q2, &20i64);
        assert_eq!(merged.receive().await.unwrap(), 20);

        push(&q1, &10i64);
        push(&q3, &30i64);
        assert_eq!(merged.receive().await.unwrap(), 30, "search resumes at r3");
        assert_eq!(merged.receive().await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_merged_wakeup_from_any_leaf() {
        let (_q1, p1) = port_pair::<i64>();
        let (q2, p2) = port_pair::<i64>();
        let mut merged = merge_ports_rr(&[p1, p2]);

        let handle = tokio::spawn(async move { merged.receive().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        push(&q2, &9i64);

        assert_eq!(handle.await.unwrap().unwrap(), 9);
    }

    #[tokio::test]
    async fn test_timeout_and_try() {
        let (queue, mut port) = port_pair::<i64>();
        assert_eq!(port.try_receive().unwrap(), None);
        assert_eq!(
            port.receive_timeout(Duration::from_millis(10)).await.unwrap(),
            None
        );
        push(&queue, &5i64);
        assert_eq!(
            port.receive_timeout(Duration::ZERO).await.unwrap(),
            Some(5)
        );
    }

    #[test]
    fn test_send_port_serializes_to_its_id() {
        let cid = ChannelId::new(
            ProcessId::new(NodeId::new(EndpointAddr::new("n")), 4),
            2,
        );
        let port = SendPort::<u32>::new(cid.clone());
        let bytes = postcard::to_allocvec(&port).unwrap();
        let back: SendPort<u32> = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(back.id(), &cid);

        // And the wire form is exactly the id's.
        let id_bytes = postcard::to_allocvec(&cid).unwrap();
        assert_eq!(bytes, id_bytes);
    }
}
