//! UDP unicast relay.
//!
//! A datagram carrying exactly [`UDP_INIT`] subscribes its sender. Anything
//! else is sent back out, unchanged, to every subscriber, the sender
//! included. Subscribers are never evicted.

use std::net::SocketAddr;

use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::{protocol::UDP_INIT, registry::TransportRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    /// The datagram was a subscription request. `new` is false when the
    /// sender was already subscribed.
    Subscribed { new: bool },
    /// The datagram was relayed to `delivered` subscribers.
    Relayed { delivered: usize },
}

pub async fn handle_datagram(
    socket: &UdpSocket,
    registry: &TransportRegistry,
    payload: &[u8],
    from: SocketAddr,
) -> RelayOutcome {
    if payload == UDP_INIT.as_bytes() {
        let new = registry.subscribe_udp(from).await;
        if new {
            info!(peer = %from, "udp subscriber added");
        }
        return RelayOutcome::Subscribed { new };
    }

    let subscribers = registry.udp_subscribers().await;
    debug!(peer = %from, bytes = payload.len(), subscribers = subscribers.len(), "relaying datagram");

    let mut delivered = 0;
    for subscriber in subscribers {
        match socket.send_to(payload, subscriber).await {
            Ok(_) => delivered += 1,
            Err(err) => warn!(peer = %subscriber, error = ?err, "failed to relay datagram"),
        }
    }
    RelayOutcome::Relayed { delivered }
}
