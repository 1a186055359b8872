//! Subscriber connection loop and its supervisor.

use std::sync::Arc;

use chrono::Utc;
use futures::{SinkExt, StreamExt};
use relay_core::ids::host_identity;
use relay_core::{Envelope, PeerId, RelayError};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::backoff::Backoff;
use crate::config::SubscriberConfig;
use crate::state::LocalState;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection state of a [`Subscriber`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscriberState {
    Disconnected,
    Connecting,
    Connected,
}

/// `base` with `clientId=<peer>` appended to its query.
pub fn connect_url(base: &str, peer: &PeerId) -> Result<Url, RelayError> {
    let mut url =
        Url::parse(base).map_err(|e| RelayError::Connect(format!("invalid hub URL {base}: {e}")))?;
    match url.scheme() {
        "ws" | "wss" => {}
        other => {
            return Err(RelayError::Connect(format!(
                "hub URL must be ws:// or wss://, got {other}://"
            )))
        }
    }
    let _ = url.query_pairs_mut().append_pair("clientId", peer.as_str());
    Ok(url)
}

/// Dials a hub, applies envelopes to [`LocalState`] and acks them.
pub struct Subscriber {
    config: SubscriberConfig,
    host: String,
    state: Arc<LocalState>,
    status: watch::Sender<SubscriberState>,
}

impl Subscriber {
    pub fn new(config: SubscriberConfig) -> Self {
        Self::with_host(config, host_identity())
    }

    /// Use `host` instead of the machine's hostname when building peer IDs.
    pub fn with_host(config: SubscriberConfig, host: impl Into<String>) -> Self {
        let (status, _) = watch::channel(SubscriberState::Disconnected);
        Self {
            config,
            host: host.into(),
            state: Arc::new(LocalState::new()),
            status,
        }
    }

    pub fn local_state(&self) -> &Arc<LocalState> {
        &self.state
    }

    pub fn state(&self) -> SubscriberState {
        *self.status.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SubscriberState> {
        self.status.subscribe()
    }

    /// Dial, serve the session, and redial with backoff until `cancel` fires.
    ///
    /// A fresh peer ID is generated for every dial. The backoff schedule
    /// restarts after each successful connect.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut backoff = Backoff::from_config(&self.config);
        info!(server_url = %self.config.server_url, host = %self.host, "subscriber started");

        loop {
            let peer = PeerId::for_host(&self.host, Utc::now());
            self.set_state(SubscriberState::Connecting);

            let dialed = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                r = self.connect_once(&peer) => r,
            };

            match dialed {
                Ok(ws) => {
                    backoff.reset();
                    self.set_state(SubscriberState::Connected);
                    info!(peer_id = %peer, "connected to hub");

                    match self.run_session(ws, &peer, &cancel).await {
                        Ok(()) => info!(peer_id = %peer, "hub session closed"),
                        Err(e) => warn!(peer_id = %peer, error = %e, kind = e.error_kind(), "hub session ended"),
                    }
                    self.set_state(SubscriberState::Disconnected);
                }
                Err(e) => {
                    self.set_state(SubscriberState::Disconnected);
                    warn!(peer_id = %peer, error = %e, kind = e.error_kind(), "failed to connect to hub");
                }
            }

            let delay = backoff.next_delay();
            debug!(delay_ms = delay.as_millis() as u64, attempt = backoff.attempt(), "waiting before redial");
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
        }

        self.set_state(SubscriberState::Disconnected);
        info!("subscriber stopped");
    }

    async fn connect_once(&self, peer: &PeerId) -> Result<WsStream, RelayError> {
        let url = connect_url(&self.config.server_url, peer)?;
        let timeout = self.config.connect_timeout();
        match tokio::time::timeout(timeout, connect_async(url.as_str())).await {
            Ok(Ok((ws, _))) => Ok(ws),
            Ok(Err(e)) => Err(RelayError::Connect(format!("{url}: {e}"))),
            Err(_) => Err(RelayError::Connect(format!(
                "{url}: timed out after {}ms",
                timeout.as_millis()
            ))),
        }
    }

    /// Read envelopes until the hub closes, an error occurs, or shutdown.
    #[instrument(skip_all, fields(peer_id = %peer))]
    async fn run_session(
        &self,
        ws: WsStream,
        peer: &PeerId,
        cancel: &CancellationToken,
    ) -> Result<(), RelayError> {
        let (mut sink, mut stream) = ws.split();

        loop {
            let frame = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return Ok(());
                }
                frame = stream.next() => frame,
            };

            let Some(frame) = frame else {
                return Ok(());
            };
            match frame.map_err(|e| RelayError::transport(peer, e.to_string()))? {
                Message::Text(text) => {
                    let envelope = Envelope::decode(text.as_str())?;
                    if envelope.client_id != *peer {
                        debug!(addressed_to = %envelope.client_id, "envelope names another peer");
                    }
                    let ack = envelope.ack();
                    self.state.apply(envelope.data);
                    debug!(round_id = ?ack.round_id, "payload applied");

                    sink.send(Message::Text(ack.encode()?.into()))
                        .await
                        .map_err(|e| RelayError::transport(peer, e.to_string()))?;
                }
                Message::Close(_) => return Ok(()),
                // pongs are queued by tungstenite; binary is ignored
                _ => {}
            }
        }
    }

    fn set_state(&self, next: SubscriberState) {
        let _ = self.status.send_replace(next);
    }
}
