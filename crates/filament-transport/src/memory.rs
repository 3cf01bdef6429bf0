//! In-process transport for tests.
//!
//! A [`MemoryHub`] plays the role of the network: endpoints register under
//! an arbitrary string address and connections are pairs of unbounded
//! channels. Several nodes can then run inside one OS process, and killing
//! a node's tasks drops its channel ends, which the peer observes as a
//! connection failure — the same thing a broken socket looks like.

use crate::{ConnReceiver, ConnSender, Connection, Transport, TransportError};
use async_trait::async_trait;
use dashmap::DashMap;
use filament_core::EndpointAddr;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};

/// The shared fabric connecting memory endpoints.
pub struct MemoryHub {
    listeners: DashMap<EndpointAddr, mpsc::UnboundedSender<Connection>>,
}

impl MemoryHub {
    /// Creates an empty hub.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            listeners: DashMap::new(),
        })
    }

    /// Binds a new endpoint under `addr`.
    pub fn open(
        self: &Arc<Self>,
        addr: impl Into<String>,
    ) -> Result<MemoryTransport, TransportError> {
        let addr = EndpointAddr::new(addr);
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        if self.listeners.contains_key(&addr) {
            return Err(TransportError::AddrInUse(addr.as_str().to_string()));
        }
        self.listeners.insert(addr.clone(), accept_tx);
        Ok(MemoryTransport {
            hub: Arc::clone(self),
            addr,
            accept_rx: Mutex::new(accept_rx),
        })
    }
}

/// One endpoint on a [`MemoryHub`].
pub struct MemoryTransport {
    hub: Arc<MemoryHub>,
    addr: EndpointAddr,
    accept_rx: Mutex<mpsc::UnboundedReceiver<Connection>>,
}

#[async_trait]
impl Transport for MemoryTransport {
    fn addr(&self) -> EndpointAddr {
        self.addr.clone()
    }

    async fn connect(&self, remote: &EndpointAddr) -> Result<Connection, TransportError> {
        let listener = self
            .hub
            .listeners
            .get(remote)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| TransportError::Connect {
                addr: remote.as_str().to_string(),
                detail: "no such endpoint".to_string(),
            })?;

        let (to_peer_tx, to_peer_rx) = mpsc::unbounded_channel();
        let (from_peer_tx, from_peer_rx) = mpsc::unbounded_channel();

        let accepted: Connection = (
            Box::new(MemorySender { tx: from_peer_tx }),
            Box::new(MemoryReceiver { rx: to_peer_rx }),
        );
        listener
            .send(accepted)
            .map_err(|_| TransportError::Connect {
                addr: remote.as_str().to_string(),
                detail: "endpoint no longer accepting".to_string(),
            })?;

        Ok((
            Box::new(MemorySender { tx: to_peer_tx }),
            Box::new(MemoryReceiver { rx: from_peer_rx }),
        ))
    }

    async fn accept(&self) -> Result<Connection, TransportError> {
        self.accept_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(TransportError::Shutdown)
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.hub.listeners.remove(&self.addr);
    }
}

struct MemorySender {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

#[async_trait]
impl ConnSender for MemorySender {
    async fn send(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        self.tx
            .send(frame.to_vec())
            .map_err(|_| TransportError::Closed)
    }
}

struct MemoryReceiver {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

#[async_trait]
impl ConnReceiver for MemoryReceiver {
    async fn recv(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        Ok(self.rx.recv().await)
    }
}
