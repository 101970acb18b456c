//! Shared record of who is connected to the server.
//!
//! The registry holds two sets behind a single lock: TCP clients that
//! completed the nickname handshake, and UDP endpoints that opted into the
//! relay. The lock only guards the sets themselves. Fan-out copies the
//! recipients while locked and sends after releasing it, so one slow peer
//! cannot stall admissions or other broadcasts.

use std::{
    collections::{BTreeMap, HashSet},
    net::SocketAddr,
    sync::atomic::{AtomicU64, Ordering},
};

use tokio::sync::{Mutex, mpsc};
use tracing::debug;

use crate::protocol::roster_line;

pub type ClientId = u64;

/// Work queued for the session task that owns a client's socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Written to the socket as-is.
    Text(String),
    /// Write the shutdown sentinel, then close the connection.
    Shutdown,
}

/// A TCP client that finished the handshake.
///
/// Identity is the `id`; two clients may share a nickname.
#[derive(Debug, Clone)]
pub struct ConnectedClient {
    id: ClientId,
    nickname: String,
    address: SocketAddr,
    outbox: mpsc::UnboundedSender<Outbound>,
}

impl ConnectedClient {
    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn nickname(&self) -> &str {
        &self.nickname
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Queues `message` for this client. Returns `false` if its session has
    /// already gone away, which is harmless during fan-out.
    pub fn deliver(&self, message: Outbound) -> bool {
        self.outbox.send(message).is_ok()
    }
}

/// Result of admitting a client: its registry entry plus the roster line it
/// should be greeted with.
#[derive(Debug)]
pub struct Admission {
    pub client: ConnectedClient,
    pub roster: String,
}

/// Everything removed by [`TransportRegistry::drain`].
#[derive(Debug, Default)]
pub struct Drained {
    pub clients: Vec<ConnectedClient>,
    pub udp_subscribers: Vec<SocketAddr>,
}

#[derive(Default)]
struct Sets {
    tcp_clients: BTreeMap<ClientId, ConnectedClient>,
    udp_subscribers: HashSet<SocketAddr>,
}

pub struct TransportRegistry {
    sets: Mutex<Sets>,
    next_id: AtomicU64,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self {
            sets: Mutex::new(Sets::default()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Adds a client and returns the roster of everyone who was present
    /// before it, computed under the same lock acquisition as the insert.
    pub async fn admit(
        &self,
        nickname: String,
        address: SocketAddr,
        outbox: mpsc::UnboundedSender<Outbound>,
    ) -> Admission {
        let mut sets = self.sets.lock().await;
        // Ids are taken under the lock so id order is admission order.
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let client = ConnectedClient {
            id,
            nickname,
            address,
            outbox,
        };

        let roster = roster_line(sets.tcp_clients.values().map(ConnectedClient::nickname));
        sets.tcp_clients.insert(id, client.clone());

        Admission { client, roster }
    }

    /// Removes a client. Only the first call for a given id returns the
    /// entry; later calls are no-ops.
    pub async fn remove(&self, id: ClientId) -> Option<ConnectedClient> {
        let mut sets = self.sets.lock().await;
        sets.tcp_clients.remove(&id)
    }

    /// Copy of every admitted client except `id`, in admission order.
    pub async fn snapshot_excluding(&self, id: ClientId) -> Vec<ConnectedClient> {
        let sets = self.sets.lock().await;
        sets.tcp_clients
            .values()
            .filter(|client| client.id != id)
            .cloned()
            .collect()
    }

    /// Queues `text` for every admitted client except `sender` and returns how
    /// many recipients accepted it.
    pub async fn broadcast_excluding(&self, sender: ClientId, text: &str) -> usize {
        let recipients = self.snapshot_excluding(sender).await;
        let mut delivered = 0;
        for client in &recipients {
            if client.deliver(Outbound::Text(text.to_string())) {
                delivered += 1;
            } else {
                debug!(
                    peer = %client.address,
                    nickname = %client.nickname,
                    "recipient session already closed"
                );
            }
        }
        delivered
    }

    /// Records `address` as a UDP relay subscriber. Returns `true` only the
    /// first time an address subscribes.
    pub async fn subscribe_udp(&self, address: SocketAddr) -> bool {
        let mut sets = self.sets.lock().await;
        sets.udp_subscribers.insert(address)
    }

    pub async fn udp_subscribers(&self) -> Vec<SocketAddr> {
        let sets = self.sets.lock().await;
        sets.udp_subscribers.iter().copied().collect()
    }

    /// Empties both sets at once and hands back what they held.
    pub async fn drain(&self) -> Drained {
        let mut sets = self.sets.lock().await;
        let clients = std::mem::take(&mut sets.tcp_clients).into_values().collect();
        let udp_subscribers = sets.udp_subscribers.drain().collect();
        Drained {
            clients,
            udp_subscribers,
        }
    }

    pub async fn client_count(&self) -> usize {
        self.sets.lock().await.tcp_clients.len()
    }

    pub async fn udp_subscriber_count(&self) -> usize {
        self.sets.lock().await.udp_subscribers.len()
    }

    /// Nicknames of admitted clients in admission order.
    pub async fn nicknames(&self) -> Vec<String> {
        let sets = self.sets.lock().await;
        sets.tcp_clients
            .values()
            .map(|client| client.nickname.clone())
            .collect()
    }
}

impl Default for TransportRegistry {
    fn default() -> Self {
        Self::new()
    }
}
