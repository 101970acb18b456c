use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound for a single receive. One receive is one logical message, so
/// this is also the largest message the chat can carry.
pub const BUFFER_SIZE: usize = 1024;

/// Datagram a client sends to opt into the server's UDP relay.
pub const UDP_INIT: &str = "UDP INIT";

/// Text written to every TCP client right before the server closes it.
pub const SERVER_SHUTDOWN: &str = "#SERVER SHUTDOWN#";

const ROSTER_PREFIX: &str = "[CLIENT] Chatroom: ";

const UDP_ART: &str = r#"
      /`·.¸
     /¸...¸`:·
 ¸.·´  ¸   `·.¸.·´)
: © ):´;      ¸  {
 `·.¸ `·  ¸.·´\`·¸)
     `\\´´\¸.·´
"#;

const MULTICAST_ART: &str = r#"
      _   _
     /(   )\
     \(   )/
   |/ \\_//  \|
  /  (#) (#)  \
  \  /     \  /
   \ \_____/ /
    \/  |  \/
  _ | o | o | _
 | \|o  |  o|/ |
 |  |  o|o  |  |
/|\ |o  |  o| /|\
    \  o|o  /
    /\__|__/\
   /         \
   \         /
   |\       /|
"#;

pub fn joined_notice(nickname: &str) -> String {
    format!("[{nickname}] Joined the chat.")
}

pub fn left_notice(nickname: &str) -> String {
    format!("[{nickname}] Left the chat.")
}

/// Line sent to a freshly admitted client listing everyone already present.
pub fn roster_line<'a, I>(nicknames: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    nicknames
        .into_iter()
        .fold(String::from(ROSTER_PREFIX), |mut line, nickname| {
            line.push('(');
            line.push_str(nickname);
            line.push_str(") ");
            line
        })
}

/// Chat text as typed by a user. The server relays it untouched, so the
/// sender's nickname has to be embedded here.
pub fn chat_line(nickname: &str, text: &str) -> String {
    format!("[{nickname}] {text}")
}

pub fn udp_art(nickname: &str) -> String {
    format!("[{nickname}]:\n{UDP_ART}")
}

pub fn multicast_art(nickname: &str) -> String {
    format!("[{nickname}]:\n{MULTICAST_ART}")
}

pub fn decode(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Reads whatever the peer sent in one receive, capped at [`BUFFER_SIZE`].
///
/// There is no framing on the wire: the bytes of one read are treated as one
/// message. Returns `Ok(None)` once the peer closed its side.
pub async fn read_chunk<R>(reader: &mut R) -> io::Result<Option<String>>
where
    R: AsyncRead + Unpin,
{
    let mut buffer = [0u8; BUFFER_SIZE];
    let bytes = reader.read(&mut buffer).await?;
    if bytes == 0 {
        return Ok(None);
    }
    Ok(Some(decode(&buffer[..bytes])))
}

pub async fn write_text<W>(writer: &mut W, text: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(text.as_bytes()).await?;
    writer.flush().await
}
