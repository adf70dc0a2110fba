use std::{sync::Arc, time::Duration};

use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use rand::Rng;
use shared::protocol::Envelope;
use tokio::{
    net::TcpStream,
    sync::{mpsc, watch, Mutex},
    time::{interval_at, Instant, MissedTickBehavior},
};
use tokio_tungstenite::{
    connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream,
};
use tracing::{info, warn};

use crate::{config::Settings, session::AuthTokens};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = SplitSink<WsStream, Message>;
type WsReader = SplitStream<WsStream>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

/// What a subscriber wants to see: one subsystem, optionally narrowed to a
/// single action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvelopePattern {
    pub subsystem: String,
    pub action: Option<String>,
}

impl EnvelopePattern {
    pub fn new(subsystem: impl Into<String>, action: Option<&str>) -> Self {
        Self {
            subsystem: subsystem.into(),
            action: action.map(str::to_string),
        }
    }

    pub fn matches(&self, envelope: &Envelope) -> bool {
        if envelope.subsystem != self.subsystem {
            return false;
        }
        match &self.action {
            Some(action) => envelope.action == *action,
            None => true,
        }
    }
}

struct Subscriber {
    pattern: EnvelopePattern,
    tx: mpsc::UnboundedSender<Envelope>,
}

/// One shared connection per authenticated session, multiplexed across
/// subsystems. Owns reconnection (bounded exponential backoff with jitter),
/// the `auth` envelope handshake, a ping/pong heartbeat and the fan-out of
/// inbound envelopes to `(subsystem, action)` subscribers in arrival order.
pub struct ChatSocket {
    url: String,
    tokens: Arc<AuthTokens>,
    heartbeat: Duration,
    backoff_base: Duration,
    backoff_cap: Duration,
    outbound_tx: mpsc::UnboundedSender<Envelope>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Envelope>>>,
    subscribers: Mutex<Vec<Subscriber>>,
    state_tx: watch::Sender<ConnectionState>,
    state_rx: watch::Receiver<ConnectionState>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ChatSocket {
    pub fn new(settings: &Settings, tokens: Arc<AuthTokens>) -> Arc<Self> {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Closed);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Arc::new(Self {
            url: settings.socket_url.clone(),
            tokens,
            heartbeat: Duration::from_secs(settings.heartbeat_seconds.max(1)),
            backoff_base: Duration::from_millis(settings.reconnect_base_ms.max(1)),
            backoff_cap: Duration::from_millis(settings.reconnect_cap_ms.max(1)),
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            subscribers: Mutex::new(Vec::new()),
            state_tx,
            state_rx,
            shutdown_tx,
            shutdown_rx,
        })
    }

    pub async fn subscribe(&self, pattern: EnvelopePattern) -> mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().await.push(Subscriber { pattern, tx });
        rx
    }

    /// Fire-and-forget: the envelope is queued for the writer task. There is
    /// no delivery acknowledgement.
    pub fn send(&self, envelope: Envelope) {
        if self.outbound_tx.send(envelope).is_err() {
            warn!("chat socket is shut down; dropping outbound envelope");
        }
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Permanently stops the connection loop. A closed socket never
    /// reconnects; create a new one for the next session.
    pub fn close(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Connection loop. Runs until [`close`](Self::close); spawn it once per
    /// session.
    pub async fn run(self: Arc<Self>) {
        let Some(mut outbound_rx) = self.outbound_rx.lock().await.take() else {
            warn!("chat socket run loop already started");
            return;
        };
        let mut shutdown_rx = self.shutdown_rx.clone();
        let mut attempt: u32 = 0;

        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            self.set_state(ConnectionState::Connecting);

            match connect_async(&self.url).await {
                Ok((stream, _)) => {
                    attempt = 0;
                    info!(url = %self.url, "chat socket connected");
                    let (mut writer, mut reader) = stream.split();

                    let mut ready = true;
                    match self.tokens.access().await {
                        Some(access) => {
                            if let Err(err) = write_envelope(&mut writer, &Envelope::auth(access)).await
                            {
                                warn!(%err, "failed to send auth envelope");
                                ready = false;
                            }
                        }
                        None => warn!("no access credential available for socket auth"),
                    }

                    if ready {
                        self.set_state(ConnectionState::Open);
                        self.drive(&mut writer, &mut reader, &mut outbound_rx, &mut shutdown_rx)
                            .await;
                    }
                }
                Err(err) => {
                    warn!(url = %self.url, %err, "chat socket connect failed");
                }
            }

            if *shutdown_rx.borrow() {
                break;
            }
            attempt = attempt.saturating_add(1);
            let delay = self.backoff_delay(attempt);
            info!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                "chat socket reconnecting after delay"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown_rx.changed() => {}
            }
        }

        self.set_state(ConnectionState::Closed);
        info!("chat socket shut down");
    }

    /// Drives one live connection until it drops: inbound frames fan out to
    /// subscribers, queued outbound envelopes are written, and a missed
    /// heartbeat pong tears the connection down for the reconnect loop.
    async fn drive(
        &self,
        writer: &mut WsWriter,
        reader: &mut WsReader,
        outbound_rx: &mut mpsc::UnboundedReceiver<Envelope>,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) {
        let mut heartbeat = interval_at(Instant::now() + self.heartbeat, self.heartbeat);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut awaiting_pong = false;

        loop {
            tokio::select! {
                frame = reader.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        awaiting_pong = false;
                        self.fan_out(&text).await;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = writer.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        warn!("chat socket closed by server");
                        return;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(%err, "chat socket receive failed");
                        return;
                    }
                },
                Some(envelope) = outbound_rx.recv() => {
                    if let Err(err) = write_envelope(writer, &envelope).await {
                        warn!(%err, "chat socket send failed");
                        return;
                    }
                }
                _ = heartbeat.tick() => {
                    if awaiting_pong {
                        warn!("heartbeat pong missed; dropping connection");
                        return;
                    }
                    awaiting_pong = true;
                    if writer.send(Message::Ping(Vec::new())).await.is_err() {
                        return;
                    }
                }
                _ = shutdown_rx.changed() => {
                    let _ = writer.send(Message::Close(None)).await;
                    return;
                }
            }
        }
    }

    async fn fan_out(&self, text: &str) {
        let envelope: Envelope = match serde_json::from_str(text) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(%err, "dropping malformed socket envelope");
                return;
            }
        };

        let mut subscribers = self.subscribers.lock().await;
        subscribers.retain(|subscriber| {
            if !subscriber.pattern.matches(&envelope) {
                return true;
            }
            subscriber.tx.send(envelope.clone()).is_ok()
        });
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let base_ms = self.backoff_base.as_millis() as u64;
        let cap_ms = self.backoff_cap.as_millis() as u64;
        let capped = base_ms.saturating_mul(1u64 << shift).min(cap_ms);
        let jitter = rand::thread_rng().gen_range(0..=capped / 2);
        Duration::from_millis(capped + jitter)
    }

    fn set_state(&self, state: ConnectionState) {
        let _ = self.state_tx.send(state);
    }
}

async fn write_envelope(
    writer: &mut WsWriter,
    envelope: &Envelope,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    let text = match serde_json::to_string(envelope) {
        Ok(text) => text,
        Err(err) => {
            warn!(%err, "failed to encode outbound envelope");
            return Ok(());
        }
    };
    writer.send(Message::Text(text)).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat_envelope(action: &str) -> Envelope {
        Envelope {
            subsystem: "chat".to_string(),
            action: action.to_string(),
            headers: None,
            data: None,
        }
    }

    #[test]
    fn pattern_matches_subsystem_and_action() {
        let exact = EnvelopePattern::new("chat", Some("new_message"));
        assert!(exact.matches(&chat_envelope("new_message")));
        assert!(!exact.matches(&chat_envelope("read_message")));

        let whole_subsystem = EnvelopePattern::new("chat", None);
        assert!(whole_subsystem.matches(&chat_envelope("new_message")));
        assert!(whole_subsystem.matches(&chat_envelope("read_message")));
        assert!(!whole_subsystem.matches(&Envelope::auth("jwt")));
    }

    #[test]
    fn backoff_grows_and_stays_bounded() {
        let settings = Settings {
            reconnect_base_ms: 100,
            reconnect_cap_ms: 2_000,
            ..Settings::default()
        };
        let socket = ChatSocket::new(&settings, Arc::new(AuthTokens::new(Arc::new(
            crate::session::MemoryCredentialStore::default(),
        ))));

        let first = socket.backoff_delay(1);
        assert!(first >= Duration::from_millis(100));
        assert!(first <= Duration::from_millis(150));

        // Far attempts are capped at reconnect_cap_ms plus at most 50% jitter.
        let late = socket.backoff_delay(30);
        assert!(late >= Duration::from_millis(2_000));
        assert!(late <= Duration::from_millis(3_000));
    }
}
