//! Per-connection lifecycle: `Handshaking -> Active -> Closed`.
//!
//! Every path out of a session, whether the handshake failed, the client hung
//! up, a read errored, the writer pump died on a failed write, or the peer fell
//! so far behind that its queue filled, ends in the single `Closed` state, so
//! teardown runs exactly once.

use std::sync::Arc;

use anyhow::{Result, anyhow};
use tokio::{
    io::{AsyncBufRead, AsyncWrite, AsyncWriteExt},
    select,
    task::JoinHandle,
};
use tracing::debug;

use crate::{
    broadcast::RelayState,
    protocol::{SERVER_PREFIX, ServerLine, read_line, read_line_resumable, write_line},
    registry::RegistryError,
    router::{Inbound, classify},
    session::{SessionHandle, pump_outbound},
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidUsername {
    #[error("name cannot be empty")]
    Empty,
    #[error("name cannot contain '{0}'")]
    ReservedCharacter(char),
    #[error("name cannot start with 'Server'")]
    ReservedPrefix,
}

pub fn validate_username(username: &str) -> Result<(), InvalidUsername> {
    if username.is_empty() {
        return Err(InvalidUsername::Empty);
    }
    // `,` separates roster entries and `:` ends the name in private-message framing.
    if let Some(reserved) = username.chars().find(|c| matches!(c, ',' | ':')) {
        return Err(InvalidUsername::ReservedCharacter(reserved));
    }
    if username.starts_with(SERVER_PREFIX) {
        return Err(InvalidUsername::ReservedPrefix);
    }
    Ok(())
}

enum SessionState<W> {
    Handshaking(W),
    Active(Active<W>),
    Closed(Closed<W>),
}

struct Active<W> {
    session: SessionHandle,
    pump: JoinHandle<W>,
}

struct Closed<W> {
    session: Option<SessionHandle>,
    stream: Stream<W>,
    outcome: Result<()>,
}

/// Where the write half is when the session closes.
enum Stream<W> {
    /// Never handed to a pump.
    Direct(W),
    /// Owned by a pump that may still be flushing queued lines.
    Pumped(JoinHandle<W>),
    /// The pump already returned; `None` if its task panicked.
    Finished(Option<W>),
    /// The pump is stuck on a peer that stopped reading and must be aborted.
    Stalled(JoinHandle<W>),
}

impl<W> Closed<W> {
    fn unregistered(writer: W, outcome: Result<()>) -> SessionState<W> {
        SessionState::Closed(Self {
            session: None,
            stream: Stream::Direct(writer),
            outcome,
        })
    }
}

/// Drives one accepted connection until it closes.
///
/// Returns an error only when the connection never made it past the
/// handshake; disconnects of active sessions are normal and return `Ok`.
pub async fn supervise<R, W>(mut reader: R, writer: W, relay: Arc<RelayState>) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut state = SessionState::Handshaking(writer);

    loop {
        state = match state {
            SessionState::Handshaking(writer) => handshake(&mut reader, writer, &relay).await,
            SessionState::Active(active) => run_active(&mut reader, active, &relay).await,
            SessionState::Closed(closed) => return close(closed, &relay).await,
        };
    }
}

async fn handshake<R, W>(reader: &mut R, mut writer: W, relay: &RelayState) -> SessionState<W>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let username = match read_line(reader).await {
        Ok(Some(line)) => line.trim().to_string(),
        Ok(None) => {
            let outcome = Err(anyhow!("connection closed before handshake"));
            return Closed::unregistered(writer, outcome);
        }
        Err(error) => {
            let outcome = Err(anyhow::Error::new(error).context("failed to read username"));
            return Closed::unregistered(writer, outcome);
        }
    };

    if let Err(reason) = validate_username(&username) {
        let notice = ServerLine::InvalidUsername(reason.to_string()).encode();
        if let Err(error) = write_line(&mut writer, &notice).await {
            debug!(?error, "failed to send username rejection");
        }
        let outcome = Err(anyhow!("rejected username '{username}': {reason}"));
        return Closed::unregistered(writer, outcome);
    }

    let (session, queue) =
        SessionHandle::with_capacity(username.clone(), relay.outbound_capacity());
    let pump = tokio::spawn(pump_outbound(queue, writer));

    match relay.join(&session).await {
        Ok(()) => SessionState::Active(Active { session, pump }),
        Err(error @ RegistryError::DuplicateUsername(_)) => {
            let notice = ServerLine::UsernameTaken(username).encode();
            if session.deliver(notice).is_err() {
                debug!("failed to queue duplicate username notice");
            }
            SessionState::Closed(Closed {
                session: None,
                stream: Stream::Pumped(pump),
                outcome: Err(error.into()),
            })
        }
    }
}

async fn run_active<R, W>(reader: &mut R, active: Active<W>, relay: &RelayState) -> SessionState<W>
where
    R: AsyncBufRead + Unpin,
{
    let Active { session, mut pump } = active;
    let mut pending = Vec::new();

    let stream = loop {
        select! {
            line = read_line_resumable(reader, &mut pending) => match line {
                Ok(Some(line)) => dispatch(relay, &session, &line).await,
                Ok(None) => {
                    debug!(username = %session.username(), "client closed the stream");
                    break Stream::Pumped(pump);
                }
                Err(error) => {
                    debug!(username = %session.username(), ?error, "read failed");
                    break Stream::Pumped(pump);
                }
            },
            finished = &mut pump => {
                debug!(username = %session.username(), "writer stopped");
                break Stream::Finished(finished.ok());
            }
            () = session.evicted() => {
                debug!(username = %session.username(), "outbound queue overflowed");
                break Stream::Stalled(pump);
            }
        }
    };

    SessionState::Closed(Closed {
        session: Some(session),
        stream,
        outcome: Ok(()),
    })
}

async fn dispatch(relay: &RelayState, session: &SessionHandle, line: &str) {
    if line.trim().is_empty() {
        return;
    }

    match classify(session.username(), line) {
        Inbound::Group { sender, body } => relay.broadcast_group(&body, &sender).await,
        Inbound::ServerText(text) => relay.broadcast_group(&text, session.username()).await,
        Inbound::Private {
            recipient, body, ..
        } => relay.deliver_private(session, &recipient, &body).await,
        Inbound::Malformed => {
            debug!(username = %session.username(), line, "dropping malformed private message");
        }
    }
}

async fn close<W>(closed: Closed<W>, relay: &RelayState) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let Closed {
        session,
        stream,
        outcome,
    } = closed;

    // The handle must be gone before awaiting the pump, which only stops once
    // every sender is dropped.
    if let Some(session) = session {
        relay.depart(&session).await;
    }

    let writer = match stream {
        Stream::Direct(writer) => Some(writer),
        Stream::Pumped(pump) => pump.await.ok(),
        Stream::Finished(writer) => writer,
        Stream::Stalled(pump) => {
            pump.abort();
            let _ = pump.await;
            None
        }
    };

    if let Some(mut writer) = writer {
        if let Err(error) = writer.shutdown().await {
            debug!(?error, "failed to shut down writer");
        }
    }

    outcome
}
