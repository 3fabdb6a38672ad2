//! Newline-delimited text protocol shared by the relay and the terminal client.

use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// Prefix of a roster push: `__USER_LIST__:alice,bob`.
pub const ROSTER_MARKER: &str = "__USER_LIST__:";

/// Prefix of a private message: `__DM__:<username>:<body>`.
pub const DM_MARKER: &str = "__DM__:";

/// Lines starting with this word are system text and never attributed to a user.
pub const SERVER_PREFIX: &str = "Server";

/// Lines the relay originates itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerLine {
    Roster(Vec<String>),
    Joined(String),
    Left(String),
    UnknownRecipient(String),
    UsernameTaken(String),
    InvalidUsername(String),
    /// `peer` is the sender when delivered to the target, the recipient when echoed.
    Direct { peer: String, body: String },
}

impl ServerLine {
    pub fn encode(&self) -> String {
        match self {
            ServerLine::Roster(names) => format!("{ROSTER_MARKER}{}", names.join(",")),
            ServerLine::Joined(name) => format!("{SERVER_PREFIX} : {name} has entered the chat !"),
            ServerLine::Left(name) => format!("{SERVER_PREFIX} : {name} has left the chat!"),
            ServerLine::UnknownRecipient(name) => {
                format!("{SERVER_PREFIX} : User {name} not found.")
            }
            ServerLine::UsernameTaken(name) => {
                format!("{SERVER_PREFIX} : Username {name} is already taken.")
            }
            ServerLine::InvalidUsername(reason) => {
                format!("{SERVER_PREFIX} : Invalid username, {reason}.")
            }
            ServerLine::Direct { peer, body } => format!("{DM_MARKER}{peer}:{body}"),
        }
    }
}

/// What a client sees when it reads one line from the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    Roster(Vec<String>),
    Direct { peer: String, body: String },
    Notice(String),
    Chat { sender: Option<String>, body: String },
}

impl Incoming {
    pub fn parse(line: &str) -> Option<Self> {
        if let Some(csv) = line.strip_prefix(ROSTER_MARKER) {
            let names = csv
                .split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .collect();
            return Some(Incoming::Roster(names));
        }

        if let Some(rest) = line.strip_prefix(DM_MARKER) {
            let (peer, body) = rest.split_once(':')?;
            return Some(Incoming::Direct {
                peer: peer.trim().to_string(),
                body: body.trim().to_string(),
            });
        }

        if line.starts_with(SERVER_PREFIX) {
            return Some(Incoming::Notice(line.to_string()));
        }

        Some(match line.split_once(':') {
            Some((sender, body)) => Incoming::Chat {
                sender: Some(sender.trim().to_string()),
                body: body.trim().to_string(),
            },
            None => Incoming::Chat {
                sender: None,
                body: line.to_string(),
            },
        })
    }
}

/// Reads one line with its terminator stripped. `None` means end of stream.
pub async fn read_line<R>(reader: &mut R) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let bytes = reader.read_line(&mut line).await?;
    if bytes == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim_end_matches(LINE_ENDINGS).to_string()))
}

/// Like [`read_line`], but safe to use as a `select!` branch.
///
/// Bytes of an unfinished line stay in `pending` when the future is dropped
/// and are picked up by the next call. A final line without a terminator is
/// returned before end of stream is reported.
pub async fn read_line_resumable<R>(
    reader: &mut R,
    pending: &mut Vec<u8>,
) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let bytes = reader.read_until(b'\n', pending).await?;
    if bytes == 0 && pending.is_empty() {
        return Ok(None);
    }

    let line = String::from_utf8(std::mem::take(pending))
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    Ok(Some(line.trim_end_matches(LINE_ENDINGS).to_string()))
}

pub async fn write_line<W>(writer: &mut W, line: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    // One write per line keeps a line from interleaving with another writer's bytes.
    let mut encoded = Vec::with_capacity(line.len() + 1);
    encoded.extend_from_slice(line.as_bytes());
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await
}
