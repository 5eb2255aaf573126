//! Connected central tracking

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

// ----------------------------------------------------------------------------
// Peer Identity
// ----------------------------------------------------------------------------

/// Transport-assigned identifier of a connected central
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Link-layer connection handle
pub type ConnHandle = u16;

// ----------------------------------------------------------------------------
// Peer Registry
// ----------------------------------------------------------------------------

/// Shared map of connected peers.
///
/// Mutated only by connection events on the controller task; read by
/// notification tasks.
#[derive(Debug, Clone, Default)]
pub struct ConnectedPeers {
    inner: Arc<RwLock<HashMap<PeerId, ConnHandle>>>,
}

impl ConnectedPeers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a connection. Returns the previous handle if the peer reconnected.
    pub async fn connect(&self, peer: PeerId, handle: ConnHandle) -> Option<ConnHandle> {
        self.inner.write().await.insert(peer, handle)
    }

    pub async fn disconnect(&self, peer: &PeerId) -> Option<ConnHandle> {
        self.inner.write().await.remove(peer)
    }

    pub async fn handle(&self, peer: &PeerId) -> Option<ConnHandle> {
        self.inner.read().await.get(peer).copied()
    }

    pub async fn contains(&self, peer: &PeerId) -> bool {
        self.inner.read().await.contains_key(peer)
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    /// Disconnect everyone, e.g. on power loss
    pub async fn clear(&self) {
        self.inner.write().await.clear();
    }

    pub async fn snapshot(&self) -> Vec<(PeerId, ConnHandle)> {
        let mut peers: Vec<_> = self
            .inner
            .read()
            .await
            .iter()
            .map(|(p, h)| (p.clone(), *h))
            .collect();
        peers.sort();
        peers
    }
}
