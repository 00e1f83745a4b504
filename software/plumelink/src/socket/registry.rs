//! The connection registry: who is reachable right now.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{error, info};

use plumelink_shared::RoleId;

use super::Connection;

/// Live connections keyed by peer address.
///
/// Insert and close both take the lock, and a connection is shut down
/// while its entry is being removed, so an entry exists exactly as long
/// as its socket is open.
#[derive(Debug, Default)]
pub struct Registry {
    conns: Mutex<BTreeMap<SocketAddr, Arc<Connection>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<SocketAddr, Arc<Connection>>> {
        // A panic while holding the lock cannot leave the map half-updated
        self.conns.lock().unwrap_or_else(|poisoned| {
            error!("Connection registry lock poisoned; continuing");
            poisoned.into_inner()
        })
    }

    pub fn insert(&self, conn: Arc<Connection>) {
        let peer = conn.peer();
        if let Some(stale) = self.lock().insert(peer, conn) {
            stale.close();
        }
    }

    /// Close and remove the connection to `peer`.
    ///
    /// Returns `false` if there was none, which makes repeated closes a no-op.
    pub fn close(&self, peer: &SocketAddr) -> bool {
        let mut conns = self.lock();
        match conns.remove(peer) {
            Some(conn) => {
                conn.close();
                true
            }
            None => false,
        }
    }

    /// Close the connection whose peer is using remote `port`.
    pub fn close_by_port(&self, port: u16) -> Option<SocketAddr> {
        let mut conns = self.lock();
        let peer = *conns.keys().find(|addr| addr.port() == port)?;
        if let Some(conn) = conns.remove(&peer) {
            conn.close();
            info!("Closed {peer} ({}) on request", conn.role());
        }
        Some(peer)
    }

    /// Close everything. Returns the number of connections closed.
    pub fn close_all(&self) -> usize {
        let mut conns = self.lock();
        let n = conns.len();
        for (_, conn) in std::mem::take(&mut *conns) {
            conn.close();
        }
        n
    }

    /// Current connections, for writing to outside the lock.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.lock().values().cloned().collect()
    }

    /// Peer addresses and their roles.
    pub fn peers(&self) -> Vec<(SocketAddr, RoleId)> {
        self.lock()
            .iter()
            .map(|(addr, conn)| (*addr, conn.role()))
            .collect()
    }

    pub fn contains(&self, peer: &SocketAddr) -> bool {
        self.lock().contains_key(peer)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
