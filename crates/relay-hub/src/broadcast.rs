//! Round-based fan-out of payloads to every registered peer, with a deadline
//! watcher per (peer, round).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use relay_core::{AckMessage, Envelope, Payload, PeerId, PeerMessage, RelayError, RoundId};
use relay_telemetry::{
    MetricsRecorder, ACKS_MISSED_TOTAL, ACKS_TOTAL, ACK_LATENCY_MS, ENVELOPES_SENT_TOTAL,
    ROUNDS_TOTAL, SEND_FAILURES_TOTAL,
};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::connection::ConnectionId;
use crate::registry::{AckStatus, SessionRegistry};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Observable outcome of delivering one round to one peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeliveryEvent {
    Delivered { peer: PeerId, round: RoundId },
    SendFailed { peer: PeerId, round: RoundId, reason: String },
    Acknowledged { peer: PeerId, round: RoundId, latency: Duration },
    /// The deadline passed without an ack. Advisory only.
    Missed { peer: PeerId, round: RoundId },
}

/// Summary of one call to [`BroadcastEngine::broadcast`].
#[derive(Clone, Debug, Default)]
pub struct RoundReport {
    pub round: Option<RoundId>,
    pub delivered: Vec<PeerId>,
    pub failed: Vec<PeerId>,
}

/// Sends each round to every session and watches for acknowledgments.
pub struct BroadcastEngine {
    registry: Arc<SessionRegistry>,
    ack_timeout: Duration,
    next_round: AtomicU64,
    events: broadcast::Sender<DeliveryEvent>,
    metrics: Option<Arc<MetricsRecorder>>,
}

impl BroadcastEngine {
    pub fn new(
        registry: Arc<SessionRegistry>,
        ack_timeout: Duration,
        metrics: Option<Arc<MetricsRecorder>>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            registry,
            ack_timeout,
            next_round: AtomicU64::new(1),
            events,
            metrics,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Subscribe to delivery outcomes. Events sent before subscribing are not
    /// replayed.
    pub fn subscribe(&self) -> broadcast::Receiver<DeliveryEvent> {
        self.events.subscribe()
    }

    /// Rounds started so far.
    pub fn rounds_started(&self) -> u64 {
        self.next_round.load(Ordering::Relaxed) - 1
    }

    /// Send `payload` to every registered peer as a new round.
    ///
    /// A failed write removes that peer's session and moves on; it never
    /// aborts the round. Each successful send gets its own deadline watcher.
    /// Must be called from within a tokio runtime.
    #[instrument(skip_all, fields(round_id))]
    pub fn broadcast(&self, payload: &Payload) -> RoundReport {
        let round = RoundId::new(self.next_round.fetch_add(1, Ordering::Relaxed));
        let _ = tracing::Span::current().record("round_id", round.get());
        self.count(ROUNDS_TOTAL, 1);

        let sessions = self.registry.snapshot();
        let mut report = RoundReport {
            round: Some(round),
            ..RoundReport::default()
        };

        for (peer, connection) in sessions {
            let Some(token) = self.registry.begin_round(&peer, connection.id(), round) else {
                debug!(peer_id = %peer, "session left before send");
                continue;
            };

            let sent = Envelope::new(payload.clone(), peer.clone(), round)
                .encode()
                .and_then(|frame| connection.send(Arc::new(frame)));

            match sent {
                Ok(()) => {
                    self.count(ENVELOPES_SENT_TOTAL, 1);
                    self.emit(DeliveryEvent::Delivered {
                        peer: peer.clone(),
                        round,
                    });
                    self.spawn_watcher(peer.clone(), connection.id(), round, token);
                    report.delivered.push(peer);
                }
                Err(e) => {
                    warn!(peer_id = %peer, error = %e, "failed to send envelope, dropping session");
                    self.count(SEND_FAILURES_TOTAL, 1);
                    let _ = self.registry.remove(&peer);
                    self.emit(DeliveryEvent::SendFailed {
                        peer: peer.clone(),
                        round,
                        reason: e.to_string(),
                    });
                    report.failed.push(peer);
                }
            }
        }

        info!(
            delivered = report.delivered.len(),
            failed = report.failed.len(),
            "broadcast round sent"
        );
        report
    }

    /// Handle one text frame received from `from` on `connection`.
    ///
    /// Invalid JSON is returned as an error so the caller can drop the
    /// connection. Unknown messages and mismatched acks are ignored.
    pub fn handle_frame(
        &self,
        from: &PeerId,
        connection: ConnectionId,
        text: &str,
    ) -> Result<(), RelayError> {
        match PeerMessage::decode(text)? {
            Some(PeerMessage::Ack(ack)) => {
                if let Err(e) = self.handle_ack(from, connection, &ack) {
                    debug!(peer_id = %from, error = %e, "ignoring ack");
                }
            }
            None => debug!(peer_id = %from, "ignoring unrecognised message"),
        }
        Ok(())
    }

    /// Apply an ack received on `from`'s connection.
    ///
    /// The ack must name the sender's own peer ID and arrive on the
    /// connection that currently holds its session. Returns how many rounds
    /// it acknowledged.
    pub fn handle_ack(
        &self,
        from: &PeerId,
        connection: ConnectionId,
        ack: &AckMessage,
    ) -> Result<usize, RelayError> {
        if &ack.client_id != from {
            return Err(RelayError::ProtocolMismatch(format!(
                "ack names {} but arrived from {from}",
                ack.client_id
            )));
        }

        let acked = self.registry.mark_acknowledged(from, connection, ack.round_id)?;
        for (round, latency) in &acked {
            debug!(peer_id = %from, round_id = %round, latency_ms = latency.as_millis() as u64, "ack received");
            self.count(ACKS_TOTAL, 1);
            if let Some(m) = &self.metrics {
                m.histogram_observe(ACK_LATENCY_MS, &[], latency.as_secs_f64() * 1000.0);
            }
            self.emit(DeliveryEvent::Acknowledged {
                peer: from.clone(),
                round: *round,
                latency: *latency,
            });
        }
        Ok(acked.len())
    }

    /// Wait out the ack deadline for one (peer, round) unless the session
    /// ends first.
    fn spawn_watcher(
        &self,
        peer: PeerId,
        connection: ConnectionId,
        round: RoundId,
        token: CancellationToken,
    ) {
        let registry = Arc::clone(&self.registry);
        let events = self.events.clone();
        let metrics = self.metrics.clone();
        let timeout = self.ack_timeout;

        let _ = tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => {
                    debug!(peer_id = %peer, round_id = %round, "ack watcher cancelled");
                }
                () = tokio::time::sleep(timeout) => {
                    match registry.resolve(&peer, connection, round) {
                        AckStatus::Acknowledged => {}
                        AckStatus::Missed => {
                            warn!(
                                peer_id = %peer,
                                round_id = %round,
                                timeout_ms = timeout.as_millis() as u64,
                                "no ack received within deadline"
                            );
                            if let Some(m) = &metrics {
                                m.counter_inc(ACKS_MISSED_TOTAL, &[], 1);
                            }
                            let _ = events.send(DeliveryEvent::Missed { peer, round });
                        }
                        AckStatus::Gone => {
                            debug!(peer_id = %peer, round_id = %round, "session gone before deadline");
                        }
                    }
                }
            }
        });
    }

    fn emit(&self, event: DeliveryEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    fn count(&self, name: &str, n: u64) {
        if let Some(m) = &self.metrics {
            m.counter_inc(name, &[], n);
        }
    }
}
