//! Multicast channel shared by every client.
//!
//! There is no server side. Each client joins the group on the default
//! interface and sends straight to the group address; whether a sender hears
//! its own datagrams depends on the system's multicast loopback default.

use std::{
    io,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use crate::protocol::{BUFFER_SIZE, decode};

pub const DEFAULT_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 224);
pub const DEFAULT_PORT: u16 = 12346;

/// Local address a member binds to.
///
/// Windows refuses to bind a socket to a multicast address, so members bind
/// the wildcard address there. Elsewhere binding the group address keeps
/// unrelated datagrams sent to the same port off this socket.
pub fn bind_address(group: Ipv4Addr, port: u16) -> SocketAddrV4 {
    if cfg!(windows) {
        SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)
    } else {
        SocketAddrV4::new(group, port)
    }
}

pub struct MulticastChannel {
    socket: UdpSocket,
    group: SocketAddrV4,
}

impl MulticastChannel {
    pub fn join(group: Ipv4Addr, port: u16) -> io::Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        // Several clients on one host share the group port.
        socket.set_reuse_address(true)?;
        socket.bind(&SocketAddr::V4(bind_address(group, port)).into())?;
        socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
        socket.set_nonblocking(true)?;

        // Port 0 picks an ephemeral port; later members join with the real one.
        let port = socket
            .local_addr()?
            .as_socket()
            .map_or(port, |bound| bound.port());

        let socket = UdpSocket::from_std(socket.into())?;
        Ok(Self {
            socket,
            group: SocketAddrV4::new(group, port),
        })
    }

    pub fn group(&self) -> SocketAddrV4 {
        self.group
    }

    pub async fn send(&self, text: &str) -> io::Result<usize> {
        self.socket.send_to(text.as_bytes(), self.group).await
    }

    /// Waits for the next datagram addressed to the group.
    pub async fn recv(&self) -> io::Result<String> {
        let mut buffer = [0u8; BUFFER_SIZE];
        let (len, _) = self.socket.recv_from(&mut buffer).await?;
        Ok(decode(&buffer[..len]))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;

    const WAIT: Duration = Duration::from_secs(1);

    /// Joins the default group on a fresh port, or `None` when the host has no
    /// multicast route.
    async fn join_or_skip() -> Option<MulticastChannel> {
        let channel = match MulticastChannel::join(DEFAULT_GROUP, 0) {
            Ok(channel) => channel,
            Err(err) => {
                eprintln!("skipping: cannot join {DEFAULT_GROUP}: {err}");
                return None;
            }
        };
        if let Err(err) = channel.send("ping").await {
            eprintln!("skipping: no multicast route: {err}");
            return None;
        }
        // Drain the looped-back ping so tests start from a quiet socket.
        let _ = timeout(WAIT, channel.recv()).await;
        Some(channel)
    }

    #[tokio::test]
    async fn every_member_on_the_port_receives_group_datagrams() {
        let Some(first) = join_or_skip().await else {
            return;
        };
        assert_eq!(*first.group().ip(), DEFAULT_GROUP);
        assert_ne!(first.group().port(), 0);

        let second = MulticastChannel::join(DEFAULT_GROUP, first.group().port())
            .expect("second member shares the port");
        assert_eq!(second.group(), first.group());

        let sent = first.send("[alice]:\nart").await.expect("send to group");
        assert_eq!(sent, "[alice]:\nart".len());

        let heard = timeout(WAIT, second.recv())
            .await
            .expect("second member should hear the group")
            .expect("recv from group");
        assert_eq!(heard, "[alice]:\nart");
    }

    #[test]
    fn defaults_match_the_well_known_group() {
        assert!(DEFAULT_GROUP.is_multicast());
        assert_eq!(DEFAULT_PORT, 12346);
    }

    #[cfg(not(windows))]
    #[test]
    fn members_bind_the_group_address() {
        assert_eq!(
            bind_address(DEFAULT_GROUP, DEFAULT_PORT),
            SocketAddrV4::new(DEFAULT_GROUP, DEFAULT_PORT)
        );
    }

    #[cfg(windows)]
    #[test]
    fn members_bind_the_wildcard_address() {
        assert_eq!(
            bind_address(DEFAULT_GROUP, DEFAULT_PORT),
            SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)
        );
    }
}
