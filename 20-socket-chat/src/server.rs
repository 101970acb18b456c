//! Chat server: one TCP listener and one UDP socket sharing a port.
//!
//! A single loop waits on both sockets and on the shutdown signal. Accepted
//! connections get their own session task ([`session`]); every inbound
//! datagram gets a short-lived relay task ([`relay`]). The only state shared
//! between tasks is the [`TransportRegistry`].

mod relay;
mod session;

use std::{future::Future, io, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use tokio::{
    net::{TcpListener, TcpStream, UdpSocket},
    select,
    sync::watch,
    task::{JoinError, JoinSet},
    time::timeout,
};
use tracing::{debug, info, warn};

pub use relay::RelayOutcome;

use crate::{
    protocol::BUFFER_SIZE,
    registry::{Outbound, TransportRegistry},
};

/// How long shutdown waits for sessions to deliver the shutdown notice.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

pub struct Server {
    listener: TcpListener,
    udp: Arc<UdpSocket>,
    registry: Arc<TransportRegistry>,
    shutdown_grace: Duration,
}

impl Server {
    pub fn new(listener: TcpListener, udp: UdpSocket) -> Self {
        Self {
            listener,
            udp: Arc::new(udp),
            registry: Arc::new(TransportRegistry::new()),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }

    /// Binds the TCP listener to `addr`, then the UDP socket to whatever
    /// address the listener actually got, so both channels share one port
    /// even when `addr` asks for an ephemeral one.
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind tcp listener on {addr}"))?;
        let local = listener.local_addr()?;
        let udp = UdpSocket::bind(local)
            .await
            .with_context(|| format!("failed to bind udp socket on {local}"))?;
        Ok(Self::new(listener, udp))
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Handle to the registry, mostly useful for inspecting server state.
    pub fn registry(&self) -> Arc<TransportRegistry> {
        Arc::clone(&self.registry)
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server {
            listener,
            udp,
            registry,
            shutdown_grace,
        } = self;
        tokio::pin!(shutdown);

        let (stop_tx, stop_rx) = watch::channel(false);
        let mut sessions = JoinSet::new();
        let mut buffer = [0u8; BUFFER_SIZE];

        loop {
            select! {
                _ = &mut shutdown => {
                    handle_shutdown(&registry, &stop_tx, &mut sessions, shutdown_grace).await;
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &registry, &stop_rx, &mut sessions);
                }
                recv_result = udp.recv_from(&mut buffer) => {
                    handle_recv_result(recv_result, &buffer, &udp, &registry);
                }
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    log_session_exit(joined);
                }
            }
        }

        info!("server stopped");
        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

fn handle_accept_result(
    result: io::Result<(TcpStream, SocketAddr)>,
    registry: &Arc<TransportRegistry>,
    stop: &watch::Receiver<bool>,
    sessions: &mut JoinSet<()>,
) {
    match result {
        Ok((stream, peer)) => {
            debug!(peer = %peer, "accepted connection");
            let registry = Arc::clone(registry);
            let stop = stop.clone();
            sessions.spawn(async move {
                if let Err(err) = session::handle_connection(stream, peer, registry, stop).await {
                    warn!(peer = %peer, error = ?err, "client connection closed with error");
                }
            });
        }
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn handle_recv_result(
    result: io::Result<(usize, SocketAddr)>,
    buffer: &[u8],
    udp: &Arc<UdpSocket>,
    registry: &Arc<TransportRegistry>,
) {
    match result {
        Ok((len, from)) => {
            let payload = buffer[..len].to_vec();
            let udp = Arc::clone(udp);
            let registry = Arc::clone(registry);
            tokio::spawn(async move {
                relay::handle_datagram(&udp, &registry, &payload, from).await;
            });
        }
        Err(err) => warn!(error = ?err, "failed to receive datagram"),
    }
}

fn log_session_exit(joined: Result<(), JoinError>) {
    if let Err(err) = joined {
        if err.is_panic() {
            warn!(error = ?err, "session task panicked");
        }
    }
}

/// Tells every admitted client the server is going away, waits for their
/// sessions to close, then lets the caller drop the listening sockets.
async fn handle_shutdown(
    registry: &TransportRegistry,
    stop: &watch::Sender<bool>,
    sessions: &mut JoinSet<()>,
    grace: Duration,
) {
    let drained = registry.drain().await;
    info!(
        clients = drained.clients.len(),
        udp_subscribers = drained.udp_subscribers.len(),
        "server shutting down"
    );

    for client in &drained.clients {
        if !client.deliver(Outbound::Shutdown) {
            debug!(peer = %client.address(), "session closed before shutdown notice");
        }
    }
    // Sessions still waiting for a nickname are not in the registry.
    let _ = stop.send(true);

    let wait_for_sessions = async {
        while let Some(joined) = sessions.join_next().await {
            log_session_exit(joined);
        }
    };
    if timeout(grace, wait_for_sessions).await.is_err() {
        warn!(
            remaining = sessions.len(),
            "sessions still open after shutdown grace period, aborting"
        );
        sessions.abort_all();
    }
}
