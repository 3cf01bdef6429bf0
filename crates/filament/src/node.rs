//! The local node.
//!
//! A [`LocalNode`] hosts lightweight processes: it allocates their pids
//! from a strictly monotonic counter, keeps the registry that senders use
//! to reach mailboxes and channels, runs each body as a tokio task, and
//! boots the node controller and transport accept loop.
//!
//! Processes hold the node through an [`Arc`]; the registry holds only
//! per-process handles, so there is no reference cycle, and a pid that has
//! left the registry can never come back — indices are never reused.

use crate::channel::ChanQueue;
use crate::closure::{ProcBody, RemoteTable};
use crate::controller::{Controller, NcEvent};
use crate::mailbox::Mailbox;
use crate::process::{Fault, Process, ProcessResult};
use dashmap::DashMap;
use filament_core::wire::{Destination, Frame};
use filament_core::{DiedReason, Message, NodeId, ProcessId, Remotable};
use filament_transport::{ConnReceiver, Transport, TransportError};
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// Registry entry for one live process.
#[derive(Clone)]
pub(crate) struct ProcHandle {
    pub(crate) pid: ProcessId,
    pub(crate) mailbox: Arc<Mailbox>,
    pub(crate) channels: Arc<DashMap<u64, Arc<ChanQueue>>>,
    kill: Arc<parking_lot::Mutex<Option<oneshot::Sender<DiedReason>>>>,
}

impl ProcHandle {
    /// Terminates the process with `reason`. Idempotent; only the first
    /// kill lands, and a process that already exited ignores it.
    pub(crate) fn kill(&self, reason: DiedReason) {
        if let Some(tx) = self.kill.lock().take() {
            let _ = tx.send(reason);
        }
    }
}

pub(crate) struct NodeInner {
    id: NodeId,
    registry: DashMap<u64, ProcHandle>,
    names: DashMap<String, ProcessId>,
    next_index: AtomicU64,
    pub(crate) nc_tx: mpsc::UnboundedSender<NcEvent>,
    remote_table: RemoteTable,
    pub(crate) cancel: CancellationToken,
}

impl NodeInner {
    pub(crate) fn id(&self) -> &NodeId {
        &self.id
    }

    pub(crate) fn remote_table(&self) -> &RemoteTable {
        &self.remote_table
    }

    /// Starts a body as a new process and returns its pid.
    ///
    /// `done` observes the death reason; `LocalNode::run` uses it to wait
    /// for its root process.
    pub(crate) fn spawn_body(
        self: Arc<Self>,
        body: ProcBody,
        done: Option<oneshot::Sender<DiedReason>>,
    ) -> ProcessId {
        let index = self.next_index.fetch_add(1, Ordering::Relaxed);
        let pid = ProcessId::new(self.id.clone(), index);

        let mailbox = Arc::new(Mailbox::new());
        let channels: Arc<DashMap<u64, Arc<ChanQueue>>> = Arc::new(DashMap::new());
        let (kill_tx, kill_rx) = oneshot::channel();

        self.registry.insert(
            index,
            ProcHandle {
                pid: pid.clone(),
                mailbox: mailbox.clone(),
                channels: channels.clone(),
                kill: Arc::new(parking_lot::Mutex::new(Some(kill_tx))),
            },
        );

        let process = Process::new(pid.clone(), self.clone(), mailbox, channels);
        let node = self;
        let task_pid = pid.clone();

        tokio::spawn(async move {
            let body_outcome = AssertUnwindSafe(body.call(process)).catch_unwind();
            let reason = tokio::select! {
                killed = kill_rx => match killed {
                    Ok(reason) => reason,
                    Err(_) => DiedReason::Normal,
                },
                outcome = body_outcome => match outcome {
                    Ok(Ok(_)) => DiedReason::Normal,
                    Ok(Err(Fault::Terminated)) => DiedReason::Normal,
                    Ok(Err(Fault::Error(msg))) => DiedReason::Exception(msg),
                    Err(panic) => DiedReason::Exception(panic_message(panic)),
                },
            };

            tracing::debug!(pid = %task_pid, reason = %reason, "process exited");
            let _ = node.nc_tx.send(NcEvent::LocalDied {
                pid: task_pid,
                reason: reason.clone(),
            });
            if let Some(done) = done {
                let _ = done.send(reason);
            }
        });

        pid
    }

    pub(crate) fn proc_handle(&self, pid: &ProcessId) -> Option<ProcHandle> {
        self.registry.get(&pid.index()).map(|r| r.value().clone())
    }

    /// Drops a dead process from the registry, along with any names it
    /// held. The pid stays burned forever.
    pub(crate) fn remove_process(&self, pid: &ProcessId) {
        self.names.retain(|_, registered| *registered != *pid);
        self.registry.remove(&pid.index());
    }

    /// Hands a payload to its destination: straight into a local mailbox
    /// or channel queue, or to the controller for remote routing.
    pub(crate) fn deliver_data(&self, dest: Destination, sender: ProcessId, message: Message) {
        if dest.node() == &self.id {
            self.dispatch_local(&dest, message);
        } else {
            let to = dest.node().clone();
            let _ = self.nc_tx.send(NcEvent::Route {
                to,
                frame: Frame::data(dest, sender, message),
            });
        }
    }

    /// Routes a payload already on this node into a mailbox or channel
    /// queue. Payloads for dead processes or unknown channels are dropped.
    pub(crate) fn dispatch_local(&self, dest: &Destination, message: Message) {
        match dest {
            Destination::Process(pid) => {
                if let Some(handle) = self.registry.get(&pid.index()) {
                    debug_assert_eq!(handle.pid, *pid, "indices are never reused");
                    handle.mailbox.push(message);
                } else {
                    tracing::trace!(pid = %pid, "payload dropped: process gone");
                }
            }
            Destination::Channel(cid) => {
                let queue = self
                    .registry
                    .get(&cid.owner().index())
                    .and_then(|handle| handle.channels.get(&cid.index()).map(|q| q.value().clone()));
                match queue {
                    Some(queue) => queue.push(message),
                    None => tracing::trace!(channel = ?cid, "payload dropped: channel gone"),
                }
            }
        }
    }

    /// Packs and delivers a runtime message to a local mailbox.
    pub(crate) fn deliver_system<T: Remotable>(&self, to: &ProcessId, value: &T) {
        match Message::pack(value) {
            Ok(message) => self.dispatch_local(&Destination::Process(to.clone()), message),
            Err(err) => tracing::warn!(error = %err, "runtime message failed to encode"),
        }
    }

    /// Enqueues a control request for the controller.
    pub(crate) fn control(&self, sender: ProcessId, to: NodeId, signal: filament_core::wire::Signal) {
        let _ = self.nc_tx.send(NcEvent::FromLocal { sender, to, signal });
    }

    pub(crate) fn register_name(&self, name: String, pid: ProcessId) -> bool {
        if self.names.contains_key(&name) {
            return false;
        }
        self.names.insert(name, pid);
        true
    }

    pub(crate) fn whereis(&self, name: &str) -> Option<ProcessId> {
        self.names.get(name).map(|r| r.value().clone())
    }

    pub(crate) fn unregister_name(&self, name: &str) -> Option<ProcessId> {
        self.names.remove(name).map(|(_, pid)| pid)
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = panic.downcast_ref::<String>() {
        text.clone()
    } else {
        "panic".to_string()
    }
}

/// A node hosting lightweight processes over one transport endpoint.
pub struct LocalNode {
    inner: Arc<NodeInner>,
}

impl LocalNode {
    /// Boots a node on `transport` with the given closure table.
    ///
    /// Spawns the controller and the accept loop; must run inside a tokio
    /// runtime.
    pub fn start(transport: impl Transport, remote_table: RemoteTable) -> Self {
        Self::start_arc(Arc::new(transport), remote_table)
    }

    /// [`start`](Self::start), for an already-shared transport.
    pub fn start_arc(transport: Arc<dyn Transport>, remote_table: RemoteTable) -> Self {
        let id = NodeId::new(transport.addr());
        let (nc_tx, nc_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let inner = Arc::new(NodeInner {
            id: id.clone(),
            registry: DashMap::new(),
            names: DashMap::new(),
            next_index: AtomicU64::new(0),
            nc_tx,
            remote_table,
            cancel: cancel.clone(),
        });

        let controller = Controller::new(inner.clone(), transport.clone());
        tokio::spawn({
            let cancel = cancel.clone();
            async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = controller.run(nc_rx) => {}
                }
            }
        });

        tokio::spawn(accept_loop(inner.clone(), transport));

        tracing::info!(node = %id, "node started");
        LocalNode { inner }
    }

    /// This node's identifier.
    pub fn id(&self) -> NodeId {
        self.inner.id.clone()
    }

    /// Spawns a process on this node and returns its pid.
    pub fn spawn_local<F, Fut>(&self, body: F) -> ProcessId
    where
        F: FnOnce(Process) -> Fut + Send + 'static,
        Fut: Future<Output = ProcessResult<()>> + Send + 'static,
    {
        self.inner.clone().spawn_body(ProcBody::new(body), None)
    }

    /// Spawns a root process and waits for it to die, returning the
    /// reason.
    pub async fn run<F, Fut>(&self, body: F) -> DiedReason
    where
        F: FnOnce(Process) -> Fut + Send + 'static,
        Fut: Future<Output = ProcessResult<()>> + Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        self.inner.clone().spawn_body(ProcBody::new(body), Some(done_tx));
        done_rx.await.unwrap_or(DiedReason::Normal)
    }

    /// Stops the node abruptly: controller, readers and writers are
    /// cancelled, and peers observe connection failures. There is no
    /// goodbye in the protocol.
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
        tracing::info!(node = %self.inner.id, "node shut down");
    }
}

impl std::fmt::Debug for LocalNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalNode")
            .field("id", &self.inner.id)
            .field("processes", &self.inner.registry.len())
            .finish()
    }
}

/// Accepts inbound connections and hands each to a reader task.
async fn accept_loop(node: Arc<NodeInner>, transport: Arc<dyn Transport>) {
    loop {
        let conn = tokio::select! {
            _ = node.cancel.cancelled() => return,
            conn = transport.accept() => conn,
        };
        match conn {
            Ok((_tx_half, rx_half)) => {
                tokio::spawn(inbound_reader(node.clone(), rx_half));
            }
            Err(TransportError::Shutdown) => return,
            Err(err) => {
                // A single failed handshake must not stop the node from
                // accepting further connections.
                tracing::warn!(error = %err, "inbound connection failed during accept");
            }
        }
    }
}

/// Reads frames off one inbound connection and feeds the controller.
///
/// The first frame must be a `Hello` naming the peer node; everything else
/// is forwarded in arrival order. When the connection ends — orderly or
/// not — a node-down observation follows the last dispatched frame, so
/// queued deliveries always precede the death announcement.
async fn inbound_reader(node: Arc<NodeInner>, mut rx: Box<dyn ConnReceiver>) {
    let origin = match read_frame(&mut rx).await {
        Some(Frame::Hello { node }) => node,
        Some(_) => {
            tracing::warn!("connection did not open with hello; dropping");
            return;
        }
        None => return,
    };
    tracing::debug!(peer = %origin, "inbound connection attributed");

    loop {
        let frame = tokio::select! {
            _ = node.cancel.cancelled() => return,
            frame = read_frame(&mut rx) => frame,
        };
        match frame {
            Some(frame) => {
                if node
                    .nc_tx
                    .send(NcEvent::Inbound {
                        origin: origin.clone(),
                        frame,
                    })
                    .is_err()
                {
                    return;
                }
            }
            None => break,
        }
    }

    let _ = node.nc_tx.send(NcEvent::NodeDown { node: origin });
}

async fn read_frame(rx: &mut Box<dyn ConnReceiver>) -> Option<Frame> {
    match rx.recv().await {
        Ok(Some(bytes)) => match Frame::decode(&bytes) {
            Ok(frame) => Some(frame),
            Err(err) => {
                tracing::warn!(error = %err, "undecodable frame; failing connection");
                None
            }
        },
        Ok(None) => None,
        Err(err) => {
            tracing::debug!(error = %err, "connection failed");
            None
        }
    }
}
