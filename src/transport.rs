//! Peer transport boundary and an in-memory network for tests.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::mpsc::UnboundedSender;
use tracing::trace;

use crate::message::{Destination, Message};
use crate::types::{Error, PublicKey, Result};

#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Fire-and-forget delivery to `to`.
    async fn send(&self, to: Destination, message: Message) -> Result<()>;

    /// Deliver every message addressed to this node on `topic` into `sink`.
    async fn subscribe(&self, topic: &str, sink: UnboundedSender<Message>) -> Result<()>;

    /// Peers currently reachable, excluding this node.
    async fn available_nodes(&self) -> Result<Vec<PublicKey>>;

    async fn all_known_nodes(&self) -> Result<Vec<PublicKey>>;
}

#[derive(Default)]
struct Peer {
    online: bool,
    subscriptions: Vec<(String, UnboundedSender<Message>)>,
}

/// Shared switchboard that every [`InMemoryTransport`] hangs off.
#[derive(Clone, Default)]
pub struct InMemoryNetwork {
    peers: Arc<RwLock<BTreeMap<PublicKey, Peer>>>,
}

impl InMemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(&self, key: PublicKey) -> InMemoryTransport {
        self.peers.write().entry(key).or_default().online = true;
        InMemoryTransport {
            network: self.clone(),
            me: key,
        }
    }

    /// Offline peers neither send nor receive.
    pub fn set_online(&self, key: &PublicKey, online: bool) {
        if let Some(peer) = self.peers.write().get_mut(key) {
            peer.online = online;
        }
    }

    fn deliver(&self, from: &PublicKey, to: Destination, message: Message) {
        let peers = self.peers.read();
        if !peers.get(from).is_some_and(|p| p.online) {
            return;
        }
        let targets: Vec<PublicKey> = match to {
            Destination::All => peers.keys().filter(|k| *k != from).copied().collect(),
            Destination::Nodes(keys) => keys,
            Destination::Node(key) => vec![key],
        };
        for target in targets {
            let Some(peer) = peers.get(&target) else {
                continue;
            };
            if !peer.online {
                trace!(to = %target, "dropping message to offline peer");
                continue;
            }
            for (_, sink) in peer.subscriptions.iter() {
                let _ = sink.send(message.clone());
            }
        }
    }
}

pub struct InMemoryTransport {
    network: InMemoryNetwork,
    me: PublicKey,
}

impl InMemoryTransport {
    pub fn key(&self) -> PublicKey {
        self.me
    }
}

#[async_trait]
impl PeerTransport for InMemoryTransport {
    async fn send(&self, to: Destination, message: Message) -> Result<()> {
        self.network.deliver(&self.me, to, message);
        Ok(())
    }

    async fn subscribe(&self, topic: &str, sink: UnboundedSender<Message>) -> Result<()> {
        let mut peers = self.network.peers.write();
        let peer = peers
            .get_mut(&self.me)
            .ok_or_else(|| Error::Transport("not joined".into()))?;
        peer.subscriptions.push((topic.to_owned(), sink));
        Ok(())
    }

    async fn available_nodes(&self) -> Result<Vec<PublicKey>> {
        let peers = self.network.peers.read();
        Ok(peers
            .iter()
            .filter(|(k, p)| **k != self.me && p.online)
            .map(|(k, _)| *k)
            .collect())
    }

    async fn all_known_nodes(&self) -> Result<Vec<PublicKey>> {
        let peers = self.network.peers.read();
        Ok(peers.keys().filter(|k| **k != self.me).copied().collect())
    }
}
