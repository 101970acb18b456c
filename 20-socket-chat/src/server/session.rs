//! One TCP connection from accept to close.
//!
//! The session waits for the nickname, admits the client, then relays
//! whatever it reads to every other client while writing out whatever other
//! sessions queued for it. This task is the only writer to its socket.

use std::{io, net::SocketAddr, sync::Arc};

use anyhow::{Result, bail};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    select,
    sync::{mpsc, watch},
};
use tracing::{debug, info};

use crate::{
    protocol::{SERVER_SHUTDOWN, joined_notice, left_notice, read_chunk, write_text},
    registry::{Admission, ConnectedClient, Outbound, TransportRegistry},
};

/// Why an admitted client's session ended.
#[derive(Debug)]
enum Disconnect {
    /// The peer closed its side.
    Closed,
    /// Reading from or writing to the socket failed. Resets land here, as does
    /// every other transport error.
    Failed(io::Error),
    /// The server is shutting down.
    Shutdown,
}

pub(crate) async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    registry: Arc<TransportRegistry>,
    stop: watch::Receiver<bool>,
) -> Result<()> {
    let (reader, writer) = stream.into_split();
    run_session(reader, writer, peer, &registry, stop).await
}

pub(crate) async fn run_session<R, W>(
    mut reader: R,
    mut writer: W,
    peer: SocketAddr,
    registry: &TransportRegistry,
    mut stop: watch::Receiver<bool>,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let Some(nickname) = await_nickname(&mut reader, &mut stop).await? else {
        debug!(peer = %peer, "shutdown before handshake completed");
        return Ok(());
    };

    let (outbox, mut inbox) = mpsc::unbounded_channel();
    let Admission { client, roster } = registry.admit(nickname, peer, outbox).await;
    info!(peer = %peer, nickname = client.nickname(), "client joined");

    registry
        .broadcast_excluding(client.id(), &joined_notice(client.nickname()))
        .await;

    let ending = match write_text(&mut writer, &roster).await {
        Ok(()) => {
            relay_until_disconnect(
                registry,
                &client,
                &mut reader,
                &mut writer,
                &mut inbox,
                &mut stop,
            )
            .await
        }
        Err(err) => Disconnect::Failed(err),
    };

    finish(registry, &client, ending, &mut writer).await;
    Ok(())
}

/// The first receive on a connection is the nickname, whole and untrimmed.
async fn await_nickname<R>(
    reader: &mut R,
    stop: &mut watch::Receiver<bool>,
) -> Result<Option<String>>
where
    R: AsyncRead + Unpin,
{
    select! {
        chunk = read_chunk(reader) => match chunk? {
            Some(nickname) => Ok(Some(nickname)),
            None => bail!("connection closed before nickname"),
        },
        _ = stop.changed() => Ok(None),
    }
}

async fn relay_until_disconnect<R, W>(
    registry: &TransportRegistry,
    client: &ConnectedClient,
    reader: &mut R,
    writer: &mut W,
    inbox: &mut mpsc::UnboundedReceiver<Outbound>,
    stop: &mut watch::Receiver<bool>,
) -> Disconnect
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        select! {
            chunk = read_chunk(reader) => match chunk {
                Ok(Some(text)) => {
                    registry.broadcast_excluding(client.id(), &text).await;
                }
                Ok(None) => return Disconnect::Closed,
                Err(err) => return Disconnect::Failed(err),
            },
            outbound = inbox.recv() => match outbound {
                Some(Outbound::Text(text)) => {
                    if let Err(err) = write_text(writer, &text).await {
                        return Disconnect::Failed(err);
                    }
                }
                Some(Outbound::Shutdown) | None => return Disconnect::Shutdown,
            },
            // Covers a client admitted after the shutdown drain ran.
            _ = stop.changed() => return flush_inbox(writer, inbox).await,
        }
    }
}

/// Writes whatever other sessions queued before the shutdown notice.
async fn flush_inbox<W>(
    writer: &mut W,
    inbox: &mut mpsc::UnboundedReceiver<Outbound>,
) -> Disconnect
where
    W: AsyncWrite + Unpin,
{
    while let Ok(Outbound::Text(text)) = inbox.try_recv() {
        if let Err(err) = write_text(writer, &text).await {
            return Disconnect::Failed(err);
        }
    }
    Disconnect::Shutdown
}

async fn finish<W>(
    registry: &TransportRegistry,
    client: &ConnectedClient,
    ending: Disconnect,
    writer: &mut W,
) where
    W: AsyncWrite + Unpin,
{
    let peer = client.address();
    let nickname = client.nickname();

    match ending {
        Disconnect::Shutdown => {
            if let Err(err) = write_text(writer, SERVER_SHUTDOWN).await {
                debug!(peer = %peer, error = ?err, "failed to deliver shutdown notice");
            }
            if let Err(err) = writer.shutdown().await {
                debug!(peer = %peer, error = ?err, "failed to close connection");
            }
            registry.remove(client.id()).await;
            info!(peer = %peer, nickname, "connection closed by server shutdown");
        }
        Disconnect::Closed | Disconnect::Failed(_) => {
            if let Disconnect::Failed(err) = &ending {
                debug!(peer = %peer, error = ?err, "connection failed");
            }
            if registry.remove(client.id()).await.is_some() {
                info!(peer = %peer, nickname, "client disconnected");
                registry
                    .broadcast_excluding(client.id(), &left_notice(nickname))
                    .await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::{
        io::{AsyncReadExt, DuplexStream, ReadHalf, WriteHalf, duplex, split},
        task::JoinHandle,
        time::timeout,
    };

    use super::*;

    const WAIT: Duration = Duration::from_secs(1);

    fn peer(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    struct Peer {
        reader: ReadHalf<DuplexStream>,
        writer: WriteHalf<DuplexStream>,
        task: JoinHandle<Result<()>>,
    }

    impl Peer {
        async fn read_text(&mut self) -> String {
            timeout(WAIT, read_chunk(&mut self.reader))
                .await
                .expect("timed out waiting for server text")
                .expect("read from session")
                .expect("session closed the stream")
        }
    }

    fn spawn_session(
        registry: &Arc<TransportRegistry>,
        stop: &watch::Receiver<bool>,
        port: u16,
    ) -> Peer {
        let (client_side, server_side) = duplex(4096);
        let (server_reader, server_writer) = split(server_side);
        let (reader, writer) = split(client_side);
        let registry = Arc::clone(registry);
        let stop = stop.clone();
        let task = tokio::spawn(async move {
            run_session(server_reader, server_writer, peer(port), &registry, stop).await
        });
        Peer {
            reader,
            writer,
            task,
        }
    }

    async fn join(
        registry: &Arc<TransportRegistry>,
        stop: &watch::Receiver<bool>,
        port: u16,
        nickname: &str,
    ) -> (Peer, String) {
        let mut peer = spawn_session(registry, stop, port);
        write_text(&mut peer.writer, nickname)
            .await
            .expect("send nickname");
        let roster = peer.read_text().await;
        (peer, roster)
    }

    #[tokio::test]
    async fn second_client_sees_roster_and_first_sees_join() {
        let registry = Arc::new(TransportRegistry::new());
        let (_stop_tx, stop) = watch::channel(false);

        let (mut alice, alice_roster) = join(&registry, &stop, 4000, "alice").await;
        assert_eq!(alice_roster, "[CLIENT] Chatroom: ");

        let (_bob, bob_roster) = join(&registry, &stop, 4001, "bob").await;
        assert_eq!(bob_roster, "[CLIENT] Chatroom: (alice) ");
        assert_eq!(alice.read_text().await, "[bob] Joined the chat.");
    }

    #[tokio::test]
    async fn chat_is_relayed_verbatim_to_others_only() {
        let registry = Arc::new(TransportRegistry::new());
        let (_stop_tx, stop) = watch::channel(false);

        let (mut alice, _) = join(&registry, &stop, 4000, "alice").await;
        let (mut bob, _) = join(&registry, &stop, 4001, "bob").await;
        assert_eq!(alice.read_text().await, "[bob] Joined the chat.");

        write_text(&mut alice.writer, "[alice] hi bob")
            .await
            .expect("alice sends");
        assert_eq!(bob.read_text().await, "[alice] hi bob");

        let mut buffer = [0u8; 64];
        let echoed = timeout(Duration::from_millis(100), alice.reader.read(&mut buffer)).await;
        assert!(echoed.is_err(), "sender must not receive its own message");
    }

    #[tokio::test]
    async fn closing_the_connection_announces_the_departure() {
        let registry = Arc::new(TransportRegistry::new());
        let (_stop_tx, stop) = watch::channel(false);

        let (alice, _) = join(&registry, &stop, 4000, "alice").await;
        let (mut bob, _) = join(&registry, &stop, 4001, "bob").await;

        let Peer {
            reader,
            writer,
            task,
        } = alice;
        drop(writer);
        drop(reader);
        task.await.expect("alice session").expect("clean exit");

        assert_eq!(bob.read_text().await, "[alice] Left the chat.");
        assert_eq!(registry.nicknames().await, vec!["bob".to_string()]);
    }

    #[tokio::test]
    async fn eof_before_nickname_is_never_admitted() {
        let registry = Arc::new(TransportRegistry::new());
        let (_stop_tx, stop) = watch::channel(false);

        let Peer {
            reader,
            writer,
            task,
        } = spawn_session(&registry, &stop, 4000);
        drop(writer);
        drop(reader);

        let result = task.await.expect("session task");
        assert!(result.is_err());
        assert_eq!(registry.client_count().await, 0);
    }

    #[tokio::test]
    async fn shutdown_notice_is_written_and_nobody_is_told_about_it() {
        let registry = Arc::new(TransportRegistry::new());
        let (_stop_tx, stop) = watch::channel(false);

        let (mut alice, _) = join(&registry, &stop, 4000, "alice").await;
        let (mut bob, _) = join(&registry, &stop, 4001, "bob").await;
        assert_eq!(alice.read_text().await, "[bob] Joined the chat.");

        let drained = registry.drain().await;
        for client in &drained.clients {
            assert!(client.deliver(Outbound::Shutdown));
        }

        assert_eq!(alice.read_text().await, SERVER_SHUTDOWN);
        assert_eq!(bob.read_text().await, SERVER_SHUTDOWN);
        alice.task.await.expect("alice session").expect("clean exit");
        bob.task.await.expect("bob session").expect("clean exit");
        assert_eq!(registry.client_count().await, 0);
    }

    #[tokio::test]
    async fn queued_text_is_written_before_the_shutdown_notice() {
        let registry = Arc::new(TransportRegistry::new());
        let (stop_tx, stop) = watch::channel(false);

        let (mut alice, _) = join(&registry, &stop, 4000, "alice").await;

        let drained = registry.drain().await;
        let [client] = drained.clients.as_slice() else {
            panic!("expected exactly one drained client");
        };
        assert!(client.deliver(Outbound::Text("[bob] one".into())));
        assert!(client.deliver(Outbound::Text("[bob] two".into())));
        assert!(client.deliver(Outbound::Shutdown));
        stop_tx.send(true).expect("signal stop");

        let mut received = String::new();
        while let Some(text) = timeout(WAIT, read_chunk(&mut alice.reader))
            .await
            .expect("timed out waiting for server text")
            .expect("read from session")
        {
            received.push_str(&text);
        }
        assert_eq!(received, format!("[bob] one[bob] two{SERVER_SHUTDOWN}"));
        alice.task.await.expect("alice session").expect("clean exit");
    }

    #[tokio::test]
    async fn stop_signal_releases_a_session_waiting_for_its_nickname() {
        let registry = Arc::new(TransportRegistry::new());
        let (stop_tx, stop) = watch::channel(false);

        let pending = spawn_session(&registry, &stop, 4000);
        stop_tx.send(true).expect("signal stop");

        let result = timeout(WAIT, pending.task)
            .await
            .expect("session should stop")
            .expect("session task");
        assert!(result.is_ok());
        assert_eq!(registry.client_count().await, 0);
    }
}
