//! Interactive chat client.
//!
//! A client holds three sockets: the TCP connection to the server, a UDP
//! socket bound to the same local address that subscribes to the server's
//! relay, and a member of the multicast group. Each socket is drained by its
//! own task; the main task multiplexes what they receive with stdin.

use std::{io, net::SocketAddr, sync::Arc};

use anyhow::{Context, Result, bail};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, Lines},
    net::{
        TcpStream, UdpSocket,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
    sync::mpsc,
    task::JoinSet,
};
use tracing::{debug, info, warn};

use crate::{
    cli::ClientArgs,
    multicast::MulticastChannel,
    protocol::{
        BUFFER_SIZE, SERVER_SHUTDOWN, UDP_INIT, chat_line, decode, multicast_art, read_chunk,
        udp_art, write_text,
    },
};

const NICKNAME_PROMPT: &str = "[CLIENT] Enter your nickname: ";
const CONNECT_FAILED: &str = "[CLIENT] Could not connect to the server.";
const DISCONNECTING: &str = "[CLIENT] Disconnecting...";
const SHUTDOWN_NOTICE: &str = "[CLIENT] Server has been shutdown. Press enter key to leave.";
const CONNECTION_CLOSED: &str = "[CLIENT] Connection closed by the server.";
const CONNECTION_LOST: &str = "[CLIENT] Connection to the server was lost.";

/// A line typed by the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputCommand {
    /// `Q`: leave the chat.
    Quit,
    /// `U`: send the UDP art payload through the server relay.
    Udp,
    /// `M`: send the multicast art payload to the group.
    Multicast,
    /// Anything else that is not empty.
    Chat(String),
}

impl InputCommand {
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        match line {
            "" => None,
            "Q" => Some(Self::Quit),
            "U" => Some(Self::Udp),
            "M" => Some(Self::Multicast),
            text => Some(Self::Chat(text.to_string())),
        }
    }
}

/// Something a receive task wants shown to the user.
#[derive(Debug, PartialEq, Eq)]
enum Event {
    Line(String),
    /// The TCP channel is finished; the next key press ends the session.
    ServerGone(&'static str),
}

pub async fn run(args: ClientArgs) -> Result<()> {
    let mut input = tokio::io::BufReader::new(tokio::io::stdin()).lines();

    let nickname = match args.nickname.clone() {
        Some(nickname) => nickname,
        None => prompt_nickname(&mut input).await?,
    };

    let session = ClientSession::connect(&args, nickname).await?;
    session.run(&mut input).await
}

async fn prompt_nickname<R>(input: &mut Lines<R>) -> Result<String>
where
    R: AsyncBufRead + Unpin,
{
    let mut stdout = tokio::io::stdout();
    stdout.write_all(NICKNAME_PROMPT.as_bytes()).await?;
    stdout.flush().await?;

    match input.next_line().await? {
        Some(nickname) => Ok(nickname),
        None => bail!("stdin closed before a nickname was entered"),
    }
}

pub struct ClientSession {
    nickname: String,
    server: SocketAddr,
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    udp: Option<Arc<UdpSocket>>,
    multicast: Option<Arc<MulticastChannel>>,
}

impl ClientSession {
    /// Connects to the server, opens the unreliable sockets and sends the
    /// nickname. Failing to reach the server is fatal; failing to open either
    /// UDP socket only disables that channel.
    pub async fn connect(args: &ClientArgs, nickname: String) -> Result<Self> {
        let stream = match TcpStream::connect(args.server).await {
            Ok(stream) => stream,
            Err(err) => {
                write_stdout(CONNECT_FAILED).await?;
                return Err(err).with_context(|| format!("failed to connect to {}", args.server));
            }
        };
        let local = stream.local_addr()?;
        info!("connected to {} from {}", args.server, local);

        let udp = match bind_udp(local) {
            Ok(socket) => Some(Arc::new(socket)),
            Err(err) => {
                warn!(error = ?err, %local, "udp relay channel unavailable");
                None
            }
        };

        let multicast = match MulticastChannel::join(args.multicast_group, args.multicast_port) {
            Ok(channel) => {
                info!(group = %channel.group(), "joined multicast group");
                Some(Arc::new(channel))
            }
            Err(err) => {
                warn!(
                    error = ?err,
                    group = %args.multicast_group,
                    port = args.multicast_port,
                    "multicast channel unavailable"
                );
                None
            }
        };

        let (reader, mut writer) = stream.into_split();
        write_text(&mut writer, &nickname)
            .await
            .context("failed to send nickname")?;

        Ok(Self {
            nickname,
            server: args.server,
            reader,
            writer,
            udp,
            multicast,
        })
    }

    pub async fn run<R>(self, input: &mut Lines<R>) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
    {
        let ClientSession {
            nickname,
            server,
            reader,
            mut writer,
            udp,
            multicast,
        } = self;

        let (events_tx, mut events) = mpsc::unbounded_channel();
        let mut receivers = JoinSet::new();

        receivers.spawn(receive_tcp(reader, events_tx.clone()));
        if let Some(udp) = &udp {
            match udp.send_to(UDP_INIT.as_bytes(), server).await {
                Ok(_) => {
                    receivers.spawn(receive_udp(Arc::clone(udp), events_tx.clone()));
                }
                Err(err) => warn!(error = ?err, "failed to subscribe to the udp relay"),
            }
        }
        if let Some(multicast) = &multicast {
            receivers.spawn(receive_multicast(Arc::clone(multicast), events_tx.clone()));
        }
        drop(events_tx);

        let outlets = Outlets {
            nickname: &nickname,
            server,
            udp: udp.as_deref(),
            multicast: multicast.as_deref(),
        };
        let mut server_gone = false;

        loop {
            select! {
                Some(event) = events.recv() => {
                    match event {
                        Event::Line(line) => write_stdout(&line).await?,
                        Event::ServerGone(notice) => {
                            write_stdout(notice).await?;
                            server_gone = true;
                        }
                    }
                }
                line = input.next_line() => {
                    let Some(line) = line? else {
                        break;
                    };
                    if server_gone {
                        break;
                    }
                    if !outlets.dispatch(&line, &mut writer).await? {
                        break;
                    }
                }
                ctrl_c = tokio::signal::ctrl_c() => {
                    if let Err(error) = ctrl_c {
                        warn!(?error, "ctrl-c handler failed");
                    }
                    write_stdout(DISCONNECTING).await?;
                    break;
                }
            }
        }

        receivers.abort_all();
        if let Err(error) = writer.shutdown().await {
            debug!(?error, "failed to shutdown client writer cleanly");
        }
        Ok(())
    }
}

/// Where typed commands are sent.
struct Outlets<'a> {
    nickname: &'a str,
    server: SocketAddr,
    udp: Option<&'a UdpSocket>,
    multicast: Option<&'a MulticastChannel>,
}

impl Outlets<'_> {
    /// Returns `false` once the session should end.
    async fn dispatch(&self, line: &str, writer: &mut OwnedWriteHalf) -> Result<bool> {
        let Some(command) = InputCommand::parse(line) else {
            return Ok(true);
        };

        match command {
            InputCommand::Quit => {
                write_stdout(DISCONNECTING).await?;
                return Ok(false);
            }
            InputCommand::Udp => match self.udp {
                Some(udp) => {
                    let payload = udp_art(self.nickname);
                    if let Err(err) = udp.send_to(payload.as_bytes(), self.server).await {
                        warn!(error = ?err, "failed to send udp message");
                    }
                }
                None => warn!("udp relay channel unavailable"),
            },
            InputCommand::Multicast => match self.multicast {
                Some(multicast) => {
                    if let Err(err) = multicast.send(&multicast_art(self.nickname)).await {
                        warn!(error = ?err, "failed to send multicast message");
                    }
                }
                None => warn!("multicast channel unavailable"),
            },
            InputCommand::Chat(text) => {
                if let Err(err) = write_text(writer, &chat_line(self.nickname, &text)).await {
                    debug!(error = ?err, "failed to send chat message");
                    write_stdout(DISCONNECTING).await?;
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }
}

fn bind_udp(local: SocketAddr) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(local), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&local.into())?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into())
}

async fn receive_tcp(mut reader: OwnedReadHalf, events: mpsc::UnboundedSender<Event>) {
    loop {
        let event = match read_chunk(&mut reader).await {
            Ok(Some(text)) if text == SERVER_SHUTDOWN => {
                let _ = events.send(Event::ServerGone(SHUTDOWN_NOTICE));
                return;
            }
            Ok(Some(text)) => Event::Line(text),
            Ok(None) => {
                let _ = events.send(Event::ServerGone(CONNECTION_CLOSED));
                return;
            }
            Err(err) => {
                debug!(error = ?err, "tcp receive failed");
                let _ = events.send(Event::ServerGone(CONNECTION_LOST));
                return;
            }
        };
        if events.send(event).is_err() {
            return;
        }
    }
}

async fn receive_udp(socket: Arc<UdpSocket>, events: mpsc::UnboundedSender<Event>) {
    let mut buffer = [0u8; BUFFER_SIZE];
    loop {
        match socket.recv_from(&mut buffer).await {
            Ok((len, _)) => {
                if events.send(Event::Line(decode(&buffer[..len]))).is_err() {
                    return;
                }
            }
            Err(err) => {
                warn!(error = ?err, "udp receive loop stopped");
                return;
            }
        }
    }
}

async fn receive_multicast(channel: Arc<MulticastChannel>, events: mpsc::UnboundedSender<Event>) {
    loop {
        match channel.recv().await {
            Ok(text) => {
                if events.send(Event::Line(text)).is_err() {
                    return;
                }
            }
            Err(err) => {
                warn!(error = ?err, "multicast receive loop stopped");
                return;
            }
        }
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}
