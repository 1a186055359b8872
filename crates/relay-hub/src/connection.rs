//! Outbound half of one peer's WebSocket.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use relay_core::{PeerId, RelayError};
use tokio::sync::mpsc;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique number for one accepted socket.
///
/// Distinguishes a reconnect from the connection it replaced when both
/// announce the same [`PeerId`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn_{}", self.0)
    }
}

/// Handle used to write frames to a peer.
///
/// Frames go through a bounded channel to the socket's writer task. The
/// registry holds the only long-lived reference, so removing the session
/// drops the sender and the writer task winds down.
pub struct PeerConnection {
    id: ConnectionId,
    peer: PeerId,
    tx: mpsc::Sender<Arc<String>>,
    connected_at: Instant,
    sent: AtomicU64,
}

impl PeerConnection {
    pub fn new(peer: PeerId, tx: mpsc::Sender<Arc<String>>) -> Self {
        Self {
            id: ConnectionId::next(),
            peer,
            tx,
            connected_at: Instant::now(),
            sent: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    /// Queue a text frame. A full queue counts as a failed write.
    pub fn send(&self, frame: Arc<String>) -> Result<(), RelayError> {
        match self.tx.try_send(frame) {
            Ok(()) => {
                let _ = self.sent.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                Err(RelayError::transport(&self.peer, "send queue full"))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(RelayError::transport(&self.peer, "connection closed"))
            }
        }
    }

    /// Frames successfully queued on this connection.
    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}
