//! The process handle and its operations.
//!
//! A [`Process`] is the capability a body receives when it is spawned: it
//! names the process, reaches its mailbox and channels, and talks to the
//! local node for everything that crosses process or node boundaries.
//!
//! Bodies return [`ProcessResult<()>`]; the runtime maps the outcome to a
//! death reason. Returning `Err(terminate())` unwinds the body and counts
//! as normal termination; any other error, and any panic, counts as an
//! exception.

use crate::channel::{ChanQueue, ReceivePort, SendPort};
use crate::closure::{Closure, ProcBody, cp_seq, link_back, send_result};
use crate::error::{ClosureError, MailboxError};
use crate::mailbox::{Mailbox, Match};
use crate::node::NodeInner;
use dashmap::DashMap;
use filament_core::wire::{Destination, Signal};
use filament_core::{
    ChannelId, CodecError, Message, MonitorNotification, MonitorRef, NodeId, ProcessId, Remotable,
    SpawnRef, SpawnReply,
};
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Why a process body unwound.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Fault {
    /// The body asked to stop via [`terminate`]. Counts as a normal death.
    Terminated,
    /// The body failed. Counts as an exception.
    Error(String),
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fault::Terminated => write!(f, "terminated"),
            Fault::Error(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Fault {}

impl From<MailboxError> for Fault {
    fn from(err: MailboxError) -> Self {
        Fault::Error(err.to_string())
    }
}

impl From<CodecError> for Fault {
    fn from(err: CodecError) -> Self {
        Fault::Error(err.to_string())
    }
}

impl From<ClosureError> for Fault {
    fn from(err: ClosureError) -> Self {
        Fault::Error(err.to_string())
    }
}

/// The result type of process bodies and blocking process operations.
pub type ProcessResult<T> = Result<T, Fault>;

/// The distinguished termination condition.
///
/// `return Err(terminate())` unwinds the current body. Uncaught, the
/// process dies with a `Normal` reason; [`catch`] can intercept it.
pub fn terminate() -> Fault {
    Fault::Terminated
}

/// Runs `body`, handing any fault to `handler` for recovery.
///
/// This only sees faults raised inside `body` — remote death signals
/// arrive as ordinary mailbox messages and pass through untouched.
pub async fn catch<T, Fut, H>(body: Fut, handler: H) -> ProcessResult<T>
where
    Fut: Future<Output = ProcessResult<T>>,
    H: FnOnce(Fault) -> ProcessResult<T>,
{
    match body.await {
        Ok(value) => Ok(value),
        Err(fault) => handler(fault),
    }
}

pub(crate) struct ProcessInner {
    pid: ProcessId,
    node: Arc<NodeInner>,
    mailbox: Arc<Mailbox>,
    channels: Arc<DashMap<u64, Arc<ChanQueue>>>,
    monitor_counter: AtomicU64,
    spawn_counter: AtomicU64,
    channel_counter: AtomicU64,
}

/// A handle on the current process.
///
/// Cloneable so that composed bodies can share it; the mailbox still has a
/// single consumer, the process's own task.
#[derive(Clone)]
pub struct Process {
    inner: Arc<ProcessInner>,
}

impl Process {
    pub(crate) fn new(
        pid: ProcessId,
        node: Arc<NodeInner>,
        mailbox: Arc<Mailbox>,
        channels: Arc<DashMap<u64, Arc<ChanQueue>>>,
    ) -> Self {
        Self {
            inner: Arc::new(ProcessInner {
                pid,
                node,
                mailbox,
                channels,
                monitor_counter: AtomicU64::new(0),
                spawn_counter: AtomicU64::new(0),
                channel_counter: AtomicU64::new(0),
            }),
        }
    }

    /// This process's pid.
    pub fn pid(&self) -> ProcessId {
        self.inner.pid.clone()
    }

    /// The node this process runs on.
    pub fn node_id(&self) -> NodeId {
        self.inner.node.id().clone()
    }

    // --- messaging ---

    /// Sends a value to another process's mailbox.
    ///
    /// Fire-and-forget: never fails at the call site, and returning does
    /// not imply delivery. Failures surface only through monitors.
    pub fn send<T: Remotable>(&self, to: ProcessId, value: &T) {
        match Message::pack(value) {
            Ok(message) => self.send_message(to, message),
            Err(err) => tracing::warn!(error = %err, "send dropped: payload failed to encode"),
        }
    }

    pub(crate) fn send_message(&self, to: ProcessId, message: Message) {
        self.inner
            .node
            .deliver_data(Destination::Process(to), self.pid(), message);
    }

    /// Waits for the next message of type `T`.
    pub async fn expect<T: Remotable>(&self) -> ProcessResult<T> {
        Ok(self
            .inner
            .mailbox
            .receive(&mut [Match::of(|value: T| value)])
            .await?)
    }

    /// Waits for a message of type `T`, bounded by a deadline.
    pub async fn expect_timeout<T: Remotable>(
        &self,
        duration: Duration,
    ) -> ProcessResult<Option<T>> {
        Ok(self
            .inner
            .mailbox
            .receive_timeout(duration, &mut [Match::of(|value: T| value)])
            .await?)
    }

    /// Selective receive: blocks until one of `matches` accepts a message.
    pub async fn receive_wait<R>(&self, matches: &mut [Match<R>]) -> ProcessResult<R> {
        Ok(self.inner.mailbox.receive(matches).await?)
    }

    /// Selective receive bounded by a deadline; `Ok(None)` on expiry.
    pub async fn receive_timeout<R>(
        &self,
        duration: Duration,
        matches: &mut [Match<R>],
    ) -> ProcessResult<Option<R>> {
        Ok(self.inner.mailbox.receive_timeout(duration, matches).await?)
    }

    /// Non-blocking selective receive.
    pub fn try_receive<R>(&self, matches: &mut [Match<R>]) -> ProcessResult<Option<R>> {
        Ok(self.inner.mailbox.try_receive(matches)?)
    }

    // --- typed channels ---

    /// Creates a typed channel owned by this process.
    pub fn new_chan<T: Remotable>(&self) -> (SendPort<T>, ReceivePort<T>) {
        let index = self.inner.channel_counter.fetch_add(1, Ordering::Relaxed);
        let id = ChannelId::new(self.pid(), index);
        let queue = Arc::new(ChanQueue::new());
        self.inner.channels.insert(index, queue.clone());
        (SendPort::new(id), ReceivePort::single(queue))
    }

    /// Sends a value into a channel, wherever its owner lives.
    ///
    /// Fire-and-forget, like [`send`](Self::send).
    pub fn send_chan<T: Remotable>(&self, port: &SendPort<T>, value: &T) {
        match Message::pack(value) {
            Ok(message) => self.inner.node.deliver_data(
                Destination::Channel(port.id().clone()),
                self.pid(),
                message,
            ),
            Err(err) => tracing::warn!(error = %err, "send_chan dropped: payload failed to encode"),
        }
    }

    /// Receives from a receive port (single or merged).
    pub async fn receive_chan<T: Remotable>(&self, port: &mut ReceivePort<T>) -> ProcessResult<T> {
        Ok(port.receive().await?)
    }

    /// Bounded channel receive; `Ok(None)` on expiry.
    pub async fn receive_chan_timeout<T: Remotable>(
        &self,
        port: &mut ReceivePort<T>,
        duration: Duration,
    ) -> ProcessResult<Option<T>> {
        Ok(port.receive_timeout(duration).await?)
    }

    // --- monitors and links ---

    /// Installs a monitor on `target`.
    ///
    /// At most one [`MonitorNotification`] carrying the returned reference
    /// will ever arrive in this mailbox.
    pub fn monitor(&self, target: ProcessId) -> MonitorRef {
        let id = self.inner.monitor_counter.fetch_add(1, Ordering::Relaxed);
        let mref = MonitorRef::new(target.clone(), id);
        let to = target.node().clone();
        self.inner.node.control(
            self.pid(),
            to,
            Signal::Monitor {
                target,
                mref: mref.clone(),
            },
        );
        mref
    }

    /// Removes a monitor. A notification already in the mailbox stays
    /// there; one not yet emitted never will be.
    pub fn unmonitor(&self, mref: MonitorRef) {
        let to = mref.target().node().clone();
        self.inner
            .node
            .control(self.pid(), to, Signal::Unmonitor { mref });
    }

    /// Links this process with `target`, bidirectionally.
    ///
    /// If either side later dies abnormally, the other is terminated with
    /// a `LinkedDeath` reason. Linking to an already-dead process delivers
    /// the exit immediately, based on its recorded reason.
    pub fn link(&self, target: ProcessId) {
        let to = target.node().clone();
        self.inner
            .node
            .control(self.pid(), to, Signal::Link { target });
    }

    /// Removes a link.
    pub fn unlink(&self, target: ProcessId) {
        let to = target.node().clone();
        self.inner
            .node
            .control(self.pid(), to, Signal::Unlink { target });
    }

    // --- spawning ---

    /// Fires a spawn request at `node` and returns the correlation
    /// reference without waiting for the reply.
    pub fn spawn_async(&self, node: &NodeId, closure: Closure<ProcBody>) -> SpawnRef {
        let sref = SpawnRef::from_raw(self.inner.spawn_counter.fetch_add(1, Ordering::Relaxed));
        self.inner.node.control(
            self.pid(),
            node.clone(),
            Signal::Spawn {
                closure: closure.into_raw(),
                sref,
            },
        );
        sref
    }

    /// Spawns `closure` on `node` and waits for the new pid.
    pub async fn spawn(
        &self,
        node: &NodeId,
        closure: Closure<ProcBody>,
    ) -> ProcessResult<ProcessId> {
        let sref = self.spawn_async(node, closure);
        self.receive_wait(&mut [Match::when(
            move |reply: &SpawnReply| reply.sref == sref,
            |reply: SpawnReply| reply.pid,
        )])
        .await
    }

    /// Spawns `closure` on `node`, runs it to completion, and returns its
    /// result.
    ///
    /// The remote process's result message is forwarded back here; if it
    /// dies before producing one, the death reason becomes the error.
    pub async fn call<T: Remotable>(
        &self,
        node: &NodeId,
        closure: Closure<ProcBody>,
    ) -> ProcessResult<T> {
        let wrapped = send_result(self.pid(), closure).map_err(Fault::from)?;
        let proxy = self.spawn(node, wrapped).await?;
        let mref = self.monitor(proxy);

        let watch = mref.clone();
        let outcome: ProcessResult<T> = self
            .receive_wait(&mut [
                Match::of(|value: T| Ok(value)),
                Match::when(
                    move |n: &MonitorNotification| n.mref == watch,
                    |n: MonitorNotification| {
                        Err(Fault::Error(format!("call target died: {}", n.reason)))
                    },
                ),
            ])
            .await?;
        let value = outcome?;

        self.unmonitor(mref.clone());
        // The reply may have raced the death notification; drop the
        // notification if it is already queued.
        let flush = mref;
        let _ = self.inner.mailbox.try_receive(&mut [Match::when(
            move |n: &MonitorNotification| n.mref == flush,
            |_: MonitorNotification| (),
        )]);
        Ok(value)
    }

    /// Spawns `closure` on `node` linked back to this process, then
    /// monitors it. Returns the child pid and the monitor reference.
    pub async fn spawn_supervised(
        &self,
        node: &NodeId,
        closure: Closure<ProcBody>,
    ) -> ProcessResult<(ProcessId, MonitorRef)> {
        let prologue = link_back(self.pid()).map_err(Fault::from)?;
        let wrapped = cp_seq(prologue, closure).map_err(Fault::from)?;
        let pid = self.spawn(node, wrapped).await?;
        let mref = self.monitor(pid.clone());
        Ok((pid, mref))
    }

    /// Spawns a body on this node directly, no closure required.
    pub fn spawn_local<F, Fut>(&self, body: F) -> ProcessId
    where
        F: FnOnce(Process) -> Fut + Send + 'static,
        Fut: Future<Output = ProcessResult<()>> + Send + 'static,
    {
        self.inner.node.clone().spawn_body(ProcBody::new(body), None)
    }

    /// Spawns a local body linked to this process.
    pub fn spawn_local_link<F, Fut>(&self, body: F) -> ProcessId
    where
        F: FnOnce(Process) -> Fut + Send + 'static,
        Fut: Future<Output = ProcessResult<()>> + Send + 'static,
    {
        let pid = self.spawn_local(body);
        self.link(pid.clone());
        pid
    }

    /// Spawns a local body and monitors it.
    pub fn spawn_local_monitor<F, Fut>(&self, body: F) -> (ProcessId, MonitorRef)
    where
        F: FnOnce(Process) -> Fut + Send + 'static,
        Fut: Future<Output = ProcessResult<()>> + Send + 'static,
    {
        let pid = self.spawn_local(body);
        let mref = self.monitor(pid.clone());
        (pid, mref)
    }

    // --- closures ---

    /// Resolves a closure against this node's remote table.
    pub fn un_closure<T: Any>(&self, closure: &Closure<T>) -> Result<T, ClosureError> {
        self.inner
            .node
            .remote_table()
            .resolve(closure.raw())?
            .downcast::<T>()
    }

    // --- named registry ---

    /// Registers this process under `name` on the local node.
    ///
    /// Returns `false` if the name is taken.
    pub fn register(&self, name: impl Into<String>) -> bool {
        self.inner.node.register_name(name.into(), self.pid())
    }

    /// Looks up a locally registered name.
    pub fn whereis(&self, name: &str) -> Option<ProcessId> {
        self.inner.node.whereis(name)
    }

    /// Removes a name registration, returning the pid it named.
    pub fn unregister(&self, name: &str) -> Option<ProcessId> {
        self.inner.node.unregister_name(name)
    }
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process").field("pid", &self.inner.pid).finish()
    }
}
