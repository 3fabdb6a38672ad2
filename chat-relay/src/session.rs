use std::{
    fmt,
    num::NonZeroUsize,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use tokio::{
    io::AsyncWrite,
    sync::{
        Notify,
        mpsc::{self, error::TrySendError},
    },
};
use tracing::debug;

use crate::protocol::write_line;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Lines a session may have queued before it is treated as stalled.
pub const DEFAULT_OUTBOUND_CAPACITY: NonZeroUsize = match NonZeroUsize::new(256) {
    Some(capacity) => capacity,
    None => unreachable!(),
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl SessionId {
    fn next() -> Self {
        Self(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Undeliverable {
    /// The writer pump stopped, so nothing more can reach the stream.
    #[error("session '{0}' is no longer accepting lines")]
    Closed(String),
    /// The peer stopped reading and its queue is full.
    #[error("session '{0}' fell too far behind")]
    Backlogged(String),
}

/// Registry-side view of one connected client.
///
/// Lines are queued rather than written in place: the session's own writer
/// pump drains the queue onto the stream, so a slow or dead peer never blocks
/// the task that is relaying to it.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: SessionId,
    username: String,
    outbound: mpsc::Sender<String>,
    evicted: Arc<Notify>,
}

impl SessionHandle {
    pub fn new(username: impl Into<String>) -> (Self, mpsc::Receiver<String>) {
        Self::with_capacity(username, DEFAULT_OUTBOUND_CAPACITY)
    }

    pub fn with_capacity(
        username: impl Into<String>,
        capacity: NonZeroUsize,
    ) -> (Self, mpsc::Receiver<String>) {
        let (outbound, queue) = mpsc::channel(capacity.get());
        let handle = Self {
            id: SessionId::next(),
            username: username.into(),
            outbound,
            evicted: Arc::new(Notify::new()),
        };
        (handle, queue)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Queues one line without waiting. A full queue also signals [`Self::evicted`].
    pub fn deliver(&self, line: impl Into<String>) -> Result<(), Undeliverable> {
        match self.outbound.try_send(line.into()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.evicted.notify_one();
                Err(Undeliverable::Backlogged(self.username.clone()))
            }
            Err(TrySendError::Closed(_)) => Err(Undeliverable::Closed(self.username.clone())),
        }
    }

    /// Resolves once a delivery has found this session's queue full.
    pub async fn evicted(&self) {
        self.evicted.notified().await;
    }
}

/// Writes queued lines to `writer` in order until the queue closes or a write fails.
pub async fn pump_outbound<W>(mut queue: mpsc::Receiver<String>, mut writer: W) -> W
where
    W: AsyncWrite + Unpin,
{
    while let Some(line) = queue.recv().await {
        if let Err(error) = write_line(&mut writer, &line).await {
            debug!(?error, "outbound write failed");
            break;
        }
    }
    // Closing here makes every later `deliver` fail fast.
    queue.close();
    writer
}
