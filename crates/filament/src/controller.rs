//! The node controller.
//!
//! One serialized actor per node. Everything that crosses a process
//! boundary for control — links, monitors, spawns, deaths — and everything
//! that crosses the node boundary in either direction flows through its
//! inbox, which is what makes the bookkeeping race-free: there is exactly
//! one reader of the link and monitor tables, and inbound frames from one
//! connection reach their destination mailboxes in arrival order because
//! the same single loop dispatches them all.
//!
//! Outbound traffic goes through one writer task per destination node with
//! an unbounded FIFO in front, so the controller never blocks on the
//! transport and per-destination order is preserved. A destination whose
//! connection has failed is marked `Failed` forever; frames to it are
//! dropped, and monitors or links toward it resolve immediately.

use crate::closure::ProcBody;
use crate::node::NodeInner;
use crate::process::Fault;
use filament_core::wire::{Frame, SenderId, Signal};
use filament_core::{
    DiedReason, Message, MonitorNotification, MonitorRef, NodeId, ProcessId, SpawnReply,
};
use filament_transport::{Transport, TransportError};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;

/// The controller's inbox items.
pub(crate) enum NcEvent {
    /// A local process requested a control operation aimed at `to`.
    FromLocal {
        sender: ProcessId,
        to: NodeId,
        signal: Signal,
    },
    /// A local process produced a data frame for a remote destination.
    Route { to: NodeId, frame: Frame },
    /// A frame arrived on an inbound connection from `origin`.
    Inbound { origin: NodeId, frame: Frame },
    /// A process on this node died.
    LocalDied { pid: ProcessId, reason: DiedReason },
    /// A connection to or from `node` failed.
    NodeDown { node: NodeId },
}

enum Remote {
    Open(mpsc::UnboundedSender<Frame>),
    /// Permanent. A failed destination never comes back.
    Failed,
}

pub(crate) struct Controller {
    node: Arc<NodeInner>,
    transport: Arc<dyn Transport>,
    /// Symmetric link relation; an entry under each endpoint.
    links: HashMap<ProcessId, HashSet<ProcessId>>,
    /// target → watchers. Holds local watchers of remote targets and all
    /// watchers of local targets.
    monitors: HashMap<ProcessId, Vec<(ProcessId, MonitorRef)>>,
    /// Last-known reasons for locally dead pids. Monotone; sound because
    /// pids are never reused.
    died: HashMap<ProcessId, DiedReason>,
    conns: HashMap<NodeId, Remote>,
}

impl Controller {
    pub(crate) fn new(node: Arc<NodeInner>, transport: Arc<dyn Transport>) -> Self {
        Self {
            node,
            transport,
            links: HashMap::new(),
            monitors: HashMap::new(),
            died: HashMap::new(),
            conns: HashMap::new(),
        }
    }

    pub(crate) async fn run(mut self, mut rx: mpsc::UnboundedReceiver<NcEvent>) {
        while let Some(event) = rx.recv().await {
            match event {
                NcEvent::FromLocal { sender, to, signal } => {
                    if to == *self.node.id() {
                        self.handle_signal(SenderId::Process(sender), signal);
                    } else {
                        self.forward_local(sender, to, signal);
                    }
                }
                NcEvent::Route { to, frame } => self.route(to, frame),
                NcEvent::Inbound { origin, frame } => self.dispatch_inbound(origin, frame),
                NcEvent::LocalDied { pid, reason } => {
                    self.node.remove_process(&pid);
                    self.propagate_death(pid, reason, true);
                }
                NcEvent::NodeDown { node } => self.node_down(node),
            }
        }
    }

    /// A control request from a local process aimed at a remote node:
    /// record the watcher-side bookkeeping, then forward.
    fn forward_local(&mut self, sender: ProcessId, to: NodeId, signal: Signal) {
        if self.is_failed(&to) {
            match signal {
                Signal::Monitor { target, mref } => {
                    self.deliver_notification(sender, mref, target, DiedReason::Unreachable);
                }
                Signal::Link { target } => {
                    self.exit_linked(&sender, &target, &DiedReason::Unreachable);
                }
                Signal::Spawn { .. } => {
                    tracing::warn!(node = %to, "spawn dropped: node unreachable");
                }
                _ => {}
            }
            return;
        }

        match &signal {
            Signal::Monitor { target, mref } => {
                self.monitors
                    .entry(target.clone())
                    .or_default()
                    .push((sender.clone(), mref.clone()));
            }
            Signal::Unmonitor { mref } => self.drop_monitor(&sender, mref),
            Signal::Link { target } => self.add_link(&sender, target),
            Signal::Unlink { target } => self.remove_link(&sender, target),
            _ => {}
        }

        self.route(
            to,
            Frame::Control {
                sender: SenderId::Process(sender),
                signal,
            },
        );
    }

    /// A signal whose destination is this node, from a local process or
    /// off the wire.
    fn handle_signal(&mut self, sender: SenderId, signal: Signal) {
        match signal {
            Signal::Link { target } => {
                let watcher = match sender {
                    SenderId::Process(pid) => pid,
                    SenderId::Node(_) => return,
                };
                match self.death_of(&target) {
                    Some(reason) => self.deliver_link_exit(watcher, target, reason),
                    None => self.add_link(&watcher, &target),
                }
            }
            Signal::Unlink { target } => {
                if let SenderId::Process(watcher) = sender {
                    self.remove_link(&watcher, &target);
                }
            }
            Signal::Monitor { target, mref } => {
                let watcher = match sender {
                    SenderId::Process(pid) => pid,
                    SenderId::Node(_) => return,
                };
                match self.death_of(&target) {
                    Some(reason) => self.deliver_notification(watcher, mref, target, reason),
                    None => self
                        .monitors
                        .entry(target)
                        .or_default()
                        .push((watcher, mref)),
                }
            }
            Signal::Unmonitor { mref } => {
                if let SenderId::Process(watcher) = sender {
                    self.drop_monitor(&watcher, &mref);
                }
            }
            Signal::Spawn { closure, sref } => {
                let requester = match sender {
                    SenderId::Process(pid) => pid,
                    SenderId::Node(_) => return,
                };
                let body = match self.node.remote_table().resolve_body(&closure) {
                    Ok(body) => body,
                    Err(err) => {
                        // Spawn a process that dies at once with the
                        // resolution error, so the requester still gets a
                        // pid and can observe the failure via a monitor.
                        tracing::warn!(label = %closure.label, error = %err, "closure resolution failed");
                        let msg = err.to_string();
                        ProcBody::raw(move |_process| async move { Err(Fault::Error(msg)) })
                    }
                };
                let pid = self.node.clone().spawn_body(body, None);
                let reply = Signal::DidSpawn {
                    requester: requester.clone(),
                    sref,
                    pid,
                };
                if requester.node() == self.node.id() {
                    self.handle_signal(SenderId::Node(self.node.id().clone()), reply);
                } else {
                    let to = requester.node().clone();
                    self.route(
                        to,
                        Frame::Control {
                            sender: SenderId::Node(self.node.id().clone()),
                            signal: reply,
                        },
                    );
                }
            }
            Signal::DidSpawn {
                requester,
                sref,
                pid,
            } => {
                self.node.deliver_system(&requester, &SpawnReply { sref, pid });
            }
            Signal::Died { pid, reason } => self.propagate_death(pid, reason, false),
        }
    }

    fn dispatch_inbound(&mut self, origin: NodeId, frame: Frame) {
        match frame {
            Frame::Hello { .. } => {
                tracing::warn!(peer = %origin, "unexpected mid-stream hello");
            }
            Frame::Data {
                dest,
                fingerprint,
                payload,
                ..
            } => {
                if dest.node() != self.node.id() {
                    tracing::warn!(peer = %origin, "misrouted data frame dropped");
                    return;
                }
                self.node
                    .dispatch_local(&dest, Message::from_parts(fingerprint, payload));
            }
            Frame::Control { sender, signal } => self.handle_signal(sender, signal),
        }
    }

    /// A process stopped existing; fan the news out.
    ///
    /// Local watchers get their notification or link exit directly; each
    /// remote node involved gets one `Died` frame and fans out on its own
    /// side.
    fn propagate_death(&mut self, pid: ProcessId, reason: DiedReason, local: bool) {
        if local {
            self.died.insert(pid.clone(), reason.clone());
        }
        let mut fanout: HashSet<NodeId> = HashSet::new();

        if let Some(watchers) = self.monitors.remove(&pid) {
            for (watcher, mref) in watchers {
                if watcher.node() == self.node.id() {
                    self.node.deliver_system(
                        &watcher,
                        &MonitorNotification {
                            mref,
                            pid: pid.clone(),
                            reason: reason.clone(),
                        },
                    );
                } else {
                    fanout.insert(watcher.node().clone());
                }
            }
        }

        if let Some(peers) = self.links.remove(&pid) {
            for peer in peers {
                let now_empty = match self.links.get_mut(&peer) {
                    Some(back) => {
                        back.remove(&pid);
                        back.is_empty()
                    }
                    None => false,
                };
                if now_empty {
                    self.links.remove(&peer);
                }
                if peer.node() == self.node.id() {
                    self.exit_linked(&peer, &pid, &reason);
                } else {
                    fanout.insert(peer.node().clone());
                }
            }
        }

        for node in fanout {
            self.route(
                node,
                Frame::Control {
                    sender: SenderId::Node(self.node.id().clone()),
                    signal: Signal::Died {
                        pid: pid.clone(),
                        reason: reason.clone(),
                    },
                },
            );
        }
    }

    /// The connection to `node` broke. Mark it failed forever and treat
    /// every remote process there that we hold links or monitors on as
    /// dead with reason `Disconnected`.
    fn node_down(&mut self, node: NodeId) {
        if self.is_failed(&node) {
            return;
        }
        tracing::warn!(node = %node, "connection failed; node marked unreachable");
        self.conns.insert(node.clone(), Remote::Failed);

        let mut affected: HashSet<ProcessId> = HashSet::new();
        for pid in self.monitors.keys() {
            if pid.node() == &node {
                affected.insert(pid.clone());
            }
        }
        for pid in self.links.keys() {
            if pid.node() == &node {
                affected.insert(pid.clone());
            }
        }
        for pid in affected {
            self.propagate_death(pid, DiedReason::Disconnected, false);
        }
    }

    fn route(&mut self, to: NodeId, frame: Frame) {
        if to == *self.node.id() {
            let origin = to;
            self.dispatch_inbound(origin, frame);
            return;
        }
        match self.conns.get(&to) {
            Some(Remote::Failed) => {
                tracing::debug!(node = %to, "frame dropped: node unreachable");
            }
            Some(Remote::Open(tx)) => {
                if tx.send(frame).is_err() {
                    tracing::debug!(node = %to, "frame dropped: writer gone");
                }
            }
            None => {
                let (tx, rx) = mpsc::unbounded_channel();
                let _ = tx.send(frame);
                self.conns.insert(to.clone(), Remote::Open(tx));
                tokio::spawn(outbound_writer(
                    self.node.clone(),
                    self.transport.clone(),
                    to,
                    rx,
                ));
            }
        }
    }

    fn deliver_notification(
        &mut self,
        watcher: ProcessId,
        mref: MonitorRef,
        target: ProcessId,
        reason: DiedReason,
    ) {
        if watcher.node() == self.node.id() {
            self.node.deliver_system(
                &watcher,
                &MonitorNotification {
                    mref,
                    pid: target,
                    reason,
                },
            );
        } else {
            let to = watcher.node().clone();
            self.route(
                to,
                Frame::Control {
                    sender: SenderId::Node(self.node.id().clone()),
                    signal: Signal::Died {
                        pid: target,
                        reason,
                    },
                },
            );
        }
    }

    fn deliver_link_exit(&mut self, watcher: ProcessId, target: ProcessId, reason: DiedReason) {
        if watcher.node() == self.node.id() {
            self.exit_linked(&watcher, &target, &reason);
        } else {
            let to = watcher.node().clone();
            self.route(
                to,
                Frame::Control {
                    sender: SenderId::Node(self.node.id().clone()),
                    signal: Signal::Died {
                        pid: target,
                        reason,
                    },
                },
            );
        }
    }

    /// Terminates a local process because `dead`, which it was linked to,
    /// died. Normal deaths do not propagate.
    fn exit_linked(&self, local: &ProcessId, dead: &ProcessId, reason: &DiedReason) {
        if reason.is_abnormal()
            && let Some(handle) = self.node.proc_handle(local)
        {
            handle.kill(DiedReason::LinkedDeath(dead.clone(), Box::new(reason.clone())));
        }
    }

    fn add_link(&mut self, a: &ProcessId, b: &ProcessId) {
        self.links.entry(a.clone()).or_default().insert(b.clone());
        self.links.entry(b.clone()).or_default().insert(a.clone());
    }

    fn remove_link(&mut self, a: &ProcessId, b: &ProcessId) {
        for (x, y) in [(a, b), (b, a)] {
            let now_empty = match self.links.get_mut(x) {
                Some(set) => {
                    set.remove(y);
                    set.is_empty()
                }
                None => false,
            };
            if now_empty {
                self.links.remove(x);
            }
        }
    }

    fn drop_monitor(&mut self, watcher: &ProcessId, mref: &MonitorRef) {
        let now_empty = match self.monitors.get_mut(mref.target()) {
            Some(entries) => {
                entries.retain(|(w, r)| !(w == watcher && r == mref));
                entries.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.monitors.remove(mref.target());
        }
    }

    fn death_of(&self, pid: &ProcessId) -> Option<DiedReason> {
        self.died.get(pid).cloned()
    }

    fn is_failed(&self, node: &NodeId) -> bool {
        matches!(self.conns.get(node), Some(Remote::Failed))
    }
}

/// Drains one destination's outbound queue onto a fresh connection.
///
/// Connects lazily, announces this node with a `Hello`, then writes frames
/// in queue order. Any failure reports the destination down; queued and
/// future frames are dropped, never retried.
async fn outbound_writer(
    node: Arc<NodeInner>,
    transport: Arc<dyn Transport>,
    dest: NodeId,
    mut rx: mpsc::UnboundedReceiver<Frame>,
) {
    let outcome: Result<(), TransportError> = async {
        let (mut tx, _rx_half) = transport.connect(dest.addr()).await?;
        let hello = Frame::Hello {
            node: node.id().clone(),
        }
        .encode()
        .map_err(|e| TransportError::Io(e.to_string()))?;
        tx.send(&hello).await?;

        loop {
            let frame = tokio::select! {
                _ = node.cancel.cancelled() => return Ok(()),
                frame = rx.recv() => match frame {
                    Some(frame) => frame,
                    None => return Ok(()),
                },
            };
            let bytes = frame
                .encode()
                .map_err(|e| TransportError::Io(e.to_string()))?;
            tx.send(&bytes).await?;
        }
    }
    .await;

    if let Err(err) = outcome {
        tracing::debug!(node = %dest, error = %err, "outbound connection failed");
        let _ = node.nc_tx.send(NcEvent::NodeDown { node: dest });
    }
}
