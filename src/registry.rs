//! Concurrency-safe registry of live connections.
//!
//! The registry is shared between the acceptor loop (add), each
//! connection's supervisor task (remove), and the forced-shutdown path
//! (snapshot). All access goes through this type; callers never touch
//! the underlying collection.

use slab::Slab;
use std::net::SocketAddr;
use std::sync::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Control handle for one live connection.
///
/// Held in the registry while the connection's processing task runs.
/// Both signals are idempotent, non-blocking token cancellations.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    peer: SocketAddr,
    close: CancellationToken,
    kill: CancellationToken,
}

impl ConnectionHandle {
    pub fn new(peer: SocketAddr, close: CancellationToken, kill: CancellationToken) -> Self {
        ConnectionHandle { peer, close, kill }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Request a graceful transport close: the connection engine answers
    /// 421 and shuts the stream down at its next suspension point.
    pub fn close(&self) {
        self.close.cancel();
    }

    /// Force termination: the processing future is dropped at its next
    /// suspension point, closing the stream with it.
    pub fn terminate(&self) {
        self.kill.cancel();
    }
}

/// Registry of active connections.
///
/// An entry exists from before a connection's processing task is spawned
/// until its supervisor observes completion; removal of an absent entry
/// is a no-op so racing termination and self-completion stay harmless.
pub struct ConnectionRegistry {
    connections: Mutex<Slab<ConnectionHandle>>,
    occupancy: watch::Sender<usize>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        let (occupancy, _) = watch::channel(0);
        ConnectionRegistry {
            connections: Mutex::new(Slab::new()),
            occupancy,
        }
    }

    /// Insert a connection handle, returning its registry id.
    pub fn add(&self, handle: ConnectionHandle) -> usize {
        let mut connections = self.connections.lock().unwrap();
        let id = connections.insert(handle);
        self.occupancy.send_replace(connections.len());
        id
    }

    /// Remove a connection by id. Removing an absent id is a no-op.
    pub fn remove(&self, id: usize) {
        let mut connections = self.connections.lock().unwrap();
        if connections.contains(id) {
            connections.remove(id);
            self.occupancy.send_replace(connections.len());
        }
    }

    /// Point-in-time copy of all live handles, safe to iterate while the
    /// live set keeps mutating. Used by forced shutdown.
    pub fn snapshot(&self) -> Vec<ConnectionHandle> {
        let connections = self.connections.lock().unwrap();
        connections.iter().map(|(_, h)| h.clone()).collect()
    }

    /// Number of active connections.
    pub fn len(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until the registry is empty.
    pub async fn drained(&self) {
        let mut occupancy = self.occupancy.subscribe();
        // Closed is impossible while `self` is alive (we own the sender)
        let _ = occupancy.wait_for(|n| *n == 0).await;
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        ConnectionRegistry::new()
    }
}
