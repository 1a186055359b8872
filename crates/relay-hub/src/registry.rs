//! Session registry: connected peers and their per-round acknowledgments.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use relay_core::{PeerId, RelayError, RoundId};
use relay_telemetry::{MetricsRecorder, CONNECTED_PEERS};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::connection::{ConnectionId, PeerConnection};

/// What a deadline watcher found when its round expired.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AckStatus {
    Acknowledged,
    Missed,
    /// The session was removed or replaced before the deadline.
    Gone,
}

struct Session {
    connection: Arc<PeerConnection>,
    /// Cancelled when the session leaves the registry.
    cancel: CancellationToken,
    /// Rounds sent to this peer whose deadline has not fired, with send time.
    outstanding: HashMap<RoundId, Instant>,
    /// Rounds acknowledged before their deadline fired.
    acknowledged: HashSet<RoundId>,
}

impl Session {
    fn owned_by(&self, connection: ConnectionId) -> bool {
        self.connection.id() == connection
    }
}

/// Registry of live peer sessions, keyed by [`PeerId`].
///
/// Holds at most one session per peer. All state sits behind one lock which
/// is never held across a network write; the broadcast engine iterates a
/// [`snapshot`](SessionRegistry::snapshot) instead.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<PeerId, Session>>,
    /// Parent of every session token. Cancelling it ends all sessions.
    root: CancellationToken,
    metrics: Option<Arc<MetricsRecorder>>,
}

impl SessionRegistry {
    pub fn new(root: CancellationToken, metrics: Option<Arc<MetricsRecorder>>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            root,
            metrics,
        }
    }

    /// Insert a session for the connection's peer.
    ///
    /// An existing session for the same peer is replaced and its token
    /// cancelled, which closes the old socket and stops its watchers.
    /// Returns the new session's token.
    pub fn register(&self, connection: Arc<PeerConnection>) -> CancellationToken {
        let peer = connection.peer().clone();
        let cancel = self.root.child_token();
        let session = Session {
            connection,
            cancel: cancel.clone(),
            outstanding: HashMap::new(),
            acknowledged: HashSet::new(),
        };

        let replaced = {
            let mut sessions = self.sessions.write();
            let replaced = sessions.insert(peer.clone(), session);
            self.record_count(sessions.len());
            replaced
        };

        if let Some(old) = replaced {
            old.cancel.cancel();
            info!(peer_id = %peer, old_conn = %old.connection.id(), "replaced existing session");
        }
        cancel
    }

    /// Remove a peer's session and close its connection. No-op if absent.
    pub fn remove(&self, peer: &PeerId) -> bool {
        let removed = {
            let mut sessions = self.sessions.write();
            let removed = sessions.remove(peer);
            if removed.is_some() {
                self.record_count(sessions.len());
            }
            removed
        };
        self.finish_removal(peer, removed)
    }

    /// Remove the peer's session only if it still belongs to `connection`.
    ///
    /// A socket task calls this on exit so that a stale connection cannot
    /// tear down the session that replaced it.
    pub fn remove_connection(&self, peer: &PeerId, connection: ConnectionId) -> bool {
        let removed = {
            let mut sessions = self.sessions.write();
            let owned = sessions.get(peer).is_some_and(|s| s.owned_by(connection));
            let removed = if owned { sessions.remove(peer) } else { None };
            if removed.is_some() {
                self.record_count(sessions.len());
            }
            removed
        };
        self.finish_removal(peer, removed)
    }

    fn finish_removal(&self, peer: &PeerId, removed: Option<Session>) -> bool {
        let Some(session) = removed else {
            return false;
        };
        session.cancel.cancel();
        info!(
            peer_id = %peer,
            conn = %session.connection.id(),
            age_ms = session.connection.age().as_millis() as u64,
            frames_sent = session.connection.sent_count(),
            pending_rounds = session.outstanding.len(),
            "session removed"
        );
        true
    }

    /// Record that `round` was sent to `peer` over `connection`.
    ///
    /// Returns the session token for the deadline watcher, or `None` if the
    /// session is gone or now belongs to another connection.
    pub fn begin_round(
        &self,
        peer: &PeerId,
        connection: ConnectionId,
        round: RoundId,
    ) -> Option<CancellationToken> {
        let mut sessions = self.sessions.write();
        let session = sessions.get_mut(peer).filter(|s| s.owned_by(connection))?;
        let _ = session.outstanding.insert(round, Instant::now());
        Some(session.cancel.clone())
    }

    /// Record an acknowledgment from `peer` received on `connection`.
    ///
    /// With `Some(round)` only that outstanding round is acknowledged. With
    /// `None` every outstanding round is. Acks arriving on a connection that
    /// has since been replaced are rejected. Returns each acknowledged round
    /// with its send-to-ack latency.
    pub fn mark_acknowledged(
        &self,
        peer: &PeerId,
        connection: ConnectionId,
        round: Option<RoundId>,
    ) -> Result<Vec<(RoundId, Duration)>, RelayError> {
        let mut sessions = self.sessions.write();
        let session = match sessions.get_mut(peer) {
            Some(s) if s.owned_by(connection) => s,
            Some(_) => {
                return Err(RelayError::ProtocolMismatch(format!(
                    "ack for {peer} on replaced connection {connection}"
                )));
            }
            None => {
                return Err(RelayError::ProtocolMismatch(format!(
                    "ack from unknown peer {peer}"
                )));
            }
        };

        let rounds: Vec<RoundId> = match round {
            Some(r) if session.outstanding.contains_key(&r) => vec![r],
            Some(r) => {
                return Err(RelayError::ProtocolMismatch(format!(
                    "ack for round {r} not outstanding for {peer}"
                )));
            }
            None => session.outstanding.keys().copied().collect(),
        };

        let mut acked = Vec::with_capacity(rounds.len());
        for r in rounds {
            if let Some(sent_at) = session.outstanding.remove(&r) {
                let _ = session.acknowledged.insert(r);
                acked.push((r, sent_at.elapsed()));
            }
        }
        Ok(acked)
    }

    /// Whether `peer` has acknowledged `round` and the deadline has not yet
    /// pruned it.
    #[cfg(test)]
    pub(crate) fn is_acknowledged(&self, peer: &PeerId, round: RoundId) -> bool {
        self.sessions
            .read()
            .get(peer)
            .is_some_and(|s| s.acknowledged.contains(&round))
    }

    /// Settle `round` for `peer` at its deadline and prune it.
    pub fn resolve(&self, peer: &PeerId, connection: ConnectionId, round: RoundId) -> AckStatus {
        let mut sessions = self.sessions.write();
        let Some(session) = sessions.get_mut(peer).filter(|s| s.owned_by(connection)) else {
            return AckStatus::Gone;
        };
        if session.acknowledged.remove(&round) {
            AckStatus::Acknowledged
        } else if session.outstanding.remove(&round).is_some() {
            AckStatus::Missed
        } else {
            debug!(peer_id = %peer, round_id = %round, "round already settled");
            AckStatus::Gone
        }
    }

    /// Point-in-time copy of every session's connection.
    pub fn snapshot(&self) -> Vec<(PeerId, Arc<PeerConnection>)> {
        self.sessions
            .read()
            .iter()
            .map(|(peer, s)| (peer.clone(), Arc::clone(&s.connection)))
            .collect()
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.sessions.read().contains_key(peer)
    }

    /// Connection currently registered for `peer`.
    pub fn connection_id(&self, peer: &PeerId) -> Option<ConnectionId> {
        self.sessions.read().get(peer).map(|s| s.connection.id())
    }

    /// Rounds sent to `peer` that are neither acknowledged nor expired.
    #[cfg(test)]
    pub(crate) fn outstanding_rounds(&self, peer: &PeerId) -> Vec<RoundId> {
        let mut rounds: Vec<RoundId> = self
            .sessions
            .read()
            .get(peer)
            .map(|s| s.outstanding.keys().copied().collect())
            .unwrap_or_default();
        rounds.sort();
        rounds
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    fn record_count(&self, count: usize) {
        if let Some(m) = &self.metrics {
            m.gauge_set(CONNECTED_PEERS, &[], count as i64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn registry() -> SessionRegistry {
        SessionRegistry::new(CancellationToken::new(), None)
    }

    fn connect(
        peer: &str,
    ) -> (Arc<PeerConnection>, mpsc::Receiver<Arc<String>>) {
        let (tx, rx) = mpsc::channel(8);
        (Arc::new(PeerConnection::new(PeerId::from_raw(peer), tx)), rx)
    }

    #[test]
    fn register_and_remove() {
        let reg = registry();
        let (a, _ra) = connect("a");
        let (b, _rb) = connect("b");
        let _ = reg.register(a);
        let _ = reg.register(b);
        assert_eq!(reg.len(), 2);

        assert!(reg.remove(&PeerId::from_raw("a")));
        assert_eq!(reg.len(), 1);
        assert!(!reg.contains(&PeerId::from_raw("a")));
    }

    #[test]
    fn remove_absent_peer_is_noop() {
        let reg = registry();
        assert!(!reg.remove(&PeerId::from_raw("ghost")));
        assert!(!reg.remove(&PeerId::from_raw("ghost")));
        assert!(reg.is_empty());
    }

    #[test]
    fn remove_cancels_session_token() {
        let reg = registry();
        let (a, _ra) = connect("a");
        let token = reg.register(a);
        assert!(!token.is_cancelled());
        let _ = reg.remove(&PeerId::from_raw("a"));
        assert!(token.is_cancelled());
    }

    #[test]
    fn remove_drops_sender_and_closes_channel() {
        let reg = registry();
        let (a, mut rx) = connect("a");
        let _ = reg.register(a);
        let _ = reg.remove(&PeerId::from_raw("a"));
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn register_same_peer_replaces_session() {
        let reg = registry();
        let (first, _r1) = connect("dup");
        let (second, _r2) = connect("dup");
        let second_id = second.id();

        let old_token = reg.register(first);
        let new_token = reg.register(second);

        assert_eq!(reg.len(), 1);
        assert!(old_token.is_cancelled());
        assert!(!new_token.is_cancelled());
        assert_eq!(reg.connection_id(&PeerId::from_raw("dup")), Some(second_id));
    }

    #[test]
    fn stale_connection_cannot_remove_successor() {
        let reg = registry();
        let (first, _r1) = connect("dup");
        let (second, _r2) = connect("dup");
        let first_id = first.id();
        let second_id = second.id();
        let _ = reg.register(first);
        let _ = reg.register(second);

        let peer = PeerId::from_raw("dup");
        assert!(!reg.remove_connection(&peer, first_id));
        assert!(reg.contains(&peer));
        assert!(reg.remove_connection(&peer, second_id));
        assert!(!reg.contains(&peer));
    }

    #[test]
    fn never_two_sessions_per_peer() {
        let reg = registry();
        let mut receivers = Vec::new();
        for i in 0..50 {
            let name = format!("p{}", i % 5);
            let (conn, rx) = connect(&name);
            receivers.push(rx);
            let _ = reg.register(conn);
            if i % 7 == 0 {
                let _ = reg.remove(&PeerId::from_raw(name));
            }
            let snap = reg.snapshot();
            let unique: HashSet<&PeerId> = snap.iter().map(|(p, _)| p).collect();
            assert_eq!(unique.len(), snap.len());
            assert!(snap.len() <= 5);
        }
    }

    #[test]
    fn ack_for_outstanding_round() {
        let reg = registry();
        let (a, _ra) = connect("a");
        let conn = a.id();
        let _ = reg.register(a);
        let peer = PeerId::from_raw("a");
        let round = RoundId::new(1);

        assert!(reg.begin_round(&peer, conn, round).is_some());
        assert!(!reg.is_acknowledged(&peer, round));

        let acked = reg.mark_acknowledged(&peer, conn, Some(round)).unwrap();
        assert_eq!(acked.len(), 1);
        assert_eq!(acked[0].0, round);
        assert!(reg.is_acknowledged(&peer, round));
        assert_eq!(reg.resolve(&peer, conn, round), AckStatus::Acknowledged);
        // pruned
        assert!(!reg.is_acknowledged(&peer, round));
    }

    #[test]
    fn ack_for_unknown_peer_is_mismatch() {
        let reg = registry();
        let err = reg
            .mark_acknowledged(&PeerId::from_raw("nobody"), ConnectionId::next(), Some(RoundId::new(1)))
            .unwrap_err();
        assert_eq!(err.error_kind(), "protocol_mismatch");
    }

    #[test]
    fn ack_for_round_never_sent_is_mismatch() {
        let reg = registry();
        let (a, _ra) = connect("a");
        let conn = a.id();
        let _ = reg.register(a);
        let err = reg
            .mark_acknowledged(&PeerId::from_raw("a"), conn, Some(RoundId::new(99)))
            .unwrap_err();
        assert_eq!(err.error_kind(), "protocol_mismatch");
        assert!(!reg.is_acknowledged(&PeerId::from_raw("a"), RoundId::new(99)));
    }

    #[test]
    fn ack_without_round_covers_all_outstanding() {
        let reg = registry();
        let (a, _ra) = connect("a");
        let conn = a.id();
        let _ = reg.register(a);
        let peer = PeerId::from_raw("a");
        let _ = reg.begin_round(&peer, conn, RoundId::new(1));
        let _ = reg.begin_round(&peer, conn, RoundId::new(2));

        let acked = reg.mark_acknowledged(&peer, conn, None).unwrap();
        assert_eq!(acked.len(), 2);
        assert!(reg.outstanding_rounds(&peer).is_empty());
    }

    #[test]
    fn ack_for_one_round_does_not_cover_the_next() {
        let reg = registry();
        let (a, _ra) = connect("a");
        let conn = a.id();
        let _ = reg.register(a);
        let peer = PeerId::from_raw("a");

        let _ = reg.begin_round(&peer, conn, RoundId::new(1));
        let _ = reg.mark_acknowledged(&peer, conn, Some(RoundId::new(1))).unwrap();
        assert_eq!(reg.resolve(&peer, conn, RoundId::new(1)), AckStatus::Acknowledged);

        let _ = reg.begin_round(&peer, conn, RoundId::new(2));
        assert_eq!(reg.resolve(&peer, conn, RoundId::new(2)), AckStatus::Missed);
    }

    #[test]
    fn missed_round_is_reported_once() {
        let reg = registry();
        let (a, _ra) = connect("a");
        let conn = a.id();
        let _ = reg.register(a);
        let peer = PeerId::from_raw("a");
        let _ = reg.begin_round(&peer, conn, RoundId::new(3));

        assert_eq!(reg.resolve(&peer, conn, RoundId::new(3)), AckStatus::Missed);
        assert_eq!(reg.resolve(&peer, conn, RoundId::new(3)), AckStatus::Gone);
    }

    #[test]
    fn resolve_after_removal_is_gone() {
        let reg = registry();
        let (a, _ra) = connect("a");
        let conn = a.id();
        let _ = reg.register(a);
        let peer = PeerId::from_raw("a");
        let _ = reg.begin_round(&peer, conn, RoundId::new(1));
        let _ = reg.remove(&peer);
        assert_eq!(reg.resolve(&peer, conn, RoundId::new(1)), AckStatus::Gone);
    }

    #[test]
    fn ack_on_replaced_connection_is_rejected() {
        let reg = registry();
        let (first, _r1) = connect("dup");
        let first_id = first.id();
        let (second, _r2) = connect("dup");
        let second_id = second.id();
        let _ = reg.register(first);
        let _ = reg.register(second);
        let peer = PeerId::from_raw("dup");
        let _ = reg.begin_round(&peer, second_id, RoundId::new(1));

        // a round-less ack still in flight on the old socket
        let err = reg.mark_acknowledged(&peer, first_id, None).unwrap_err();
        assert_eq!(err.error_kind(), "protocol_mismatch");
        assert_eq!(reg.outstanding_rounds(&peer), vec![RoundId::new(1)]);
        assert_eq!(reg.resolve(&peer, second_id, RoundId::new(1)), AckStatus::Missed);
    }

    #[test]
    fn begin_round_rejects_replaced_connection() {
        let reg = registry();
        let (first, _r1) = connect("dup");
        let first_id = first.id();
        let (second, _r2) = connect("dup");
        let _ = reg.register(first);
        let _ = reg.register(second);
        assert!(reg
            .begin_round(&PeerId::from_raw("dup"), first_id, RoundId::new(1))
            .is_none());
    }

    #[test]
    fn root_cancellation_reaches_sessions() {
        let root = CancellationToken::new();
        let reg = SessionRegistry::new(root.clone(), None);
        let (a, _ra) = connect("a");
        let token = reg.register(a);
        root.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn connected_peers_gauge_tracks_count() {
        let metrics = Arc::new(MetricsRecorder::new());
        let reg = SessionRegistry::new(CancellationToken::new(), Some(Arc::clone(&metrics)));
        let (a, _ra) = connect("a");
        let (b, _rb) = connect("b");
        let _ = reg.register(a);
        let _ = reg.register(b);
        assert_eq!(metrics.gauge_get(CONNECTED_PEERS, &[]), 2);
        let _ = reg.remove(&PeerId::from_raw("a"));
        assert_eq!(metrics.gauge_get(CONNECTED_PEERS, &[]), 1);
        // absent peer leaves the gauge alone
        let _ = reg.remove(&PeerId::from_raw("a"));
        assert_eq!(metrics.gauge_get(CONNECTED_PEERS, &[]), 1);
    }

    #[test]
    fn connected_peers_gauge_settles_under_concurrent_churn() {
        let metrics = Arc::new(MetricsRecorder::new());
        let reg = Arc::new(SessionRegistry::new(
            CancellationToken::new(),
            Some(Arc::clone(&metrics)),
        ));

        let workers: Vec<_> = (0..8)
            .map(|t| {
                let reg = Arc::clone(&reg);
                std::thread::spawn(move || {
                    let mut keep = Vec::new();
                    for i in 0..200 {
                        let name = format!("t{t}-p{}", i % 10);
                        let (conn, rx) = connect(&name);
                        keep.push(rx);
                        let _ = reg.register(conn);
                        if i % 3 == 0 {
                            let _ = reg.remove(&PeerId::from_raw(name));
                        }
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }

        assert_eq!(metrics.gauge_get(CONNECTED_PEERS, &[]), reg.len() as i64);
    }
}
