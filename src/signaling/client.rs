//! WebSocket Client für den Signaling-Relay
//!
//! Verwaltet die WebSocket-Verbindung zum Relay:
//! - Automatische Reconnection mit Backoff
//! - Identitäts-Announce bei jedem (Re-)Connect
//! - Heartbeat über WebSocket-Pings
//! - Event-basierte Kommunikation

use super::messages::{ParticipantInfo, SignalMessage};
use crate::config::SignalingConfig;
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use url::Url;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    #[error("WebSocket connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Invalid signaling URL: {0}")]
    InvalidUrl(String),

    #[error("Already connected to signaling server")]
    AlreadyConnected,

    #[error("Connection attempt timed out")]
    Timeout,
}

// ============================================================================
// SIGNALING EVENTS
// ============================================================================

/// Events die vom SignalingClient ausgelöst werden
#[derive(Debug, Clone)]
pub enum SignalingEvent {
    /// Verbunden; `reconnect` ist bei jedem Connect nach dem ersten gesetzt
    Connected { reconnect: bool },

    /// Verbindung getrennt, Reconnect läuft
    Disconnected,

    /// Eingehende Nachricht in Empfangsreihenfolge
    Message(SignalMessage),
}

/// Verbindungsstatus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
}

/// Ausgehender Kanal zum Relay
///
/// `send` ist fire-and-forget: ohne Verbindung wird die Nachricht verworfen
/// und `false` zurückgegeben. Es wird nichts für später gepuffert.
pub trait SignalSink: Send + Sync {
    fn send(&self, message: SignalMessage) -> bool;
}

// ============================================================================
// CLIENT STATE
// ============================================================================

#[derive(Debug)]
struct ClientState {
    status: ConnectionStatus,
    /// Nur während einer lebenden Verbindung gesetzt
    outbound: Option<mpsc::Sender<String>>,
}

impl Default for ClientState {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            outbound: None,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum ConnectionOutcome {
    Lost,
    Shutdown,
}

/// Alles, was der Verbindungs-Task braucht
struct ConnectionContext {
    url: Url,
    identity: ParticipantInfo,
    config: SignalingConfig,
    state: Arc<RwLock<ClientState>>,
    event_tx: broadcast::Sender<SignalingEvent>,
}

impl ConnectionContext {
    fn set_status(&self, status: ConnectionStatus) {
        self.state.write().status = status;
    }

    fn mark_disconnected(&self) {
        {
            let mut state = self.state.write();
            state.status = ConnectionStatus::Disconnected;
            // Gepufferte Nachrichten der toten Verbindung werden nicht wiederholt
            state.outbound = None;
        }
        let _ = self.event_tx.send(SignalingEvent::Disconnected);
    }
}

// ============================================================================
// SIGNALING CLIENT
// ============================================================================

/// WebSocket Client für die Relay-Kommunikation
pub struct SignalingClient {
    config: SignalingConfig,
    identity: ParticipantInfo,
    state: Arc<RwLock<ClientState>>,
    event_tx: broadcast::Sender<SignalingEvent>,
    shutdown_tx: Mutex<Option<mpsc::Sender<()>>>,
}

impl SignalingClient {
    /// Erstellt einen neuen SignalingClient
    pub fn new(config: SignalingConfig, identity: ParticipantInfo) -> Self {
        let (event_tx, _) = broadcast::channel(256);

        Self {
            config,
            identity,
            state: Arc::new(RwLock::new(ClientState::default())),
            event_tx,
            shutdown_tx: Mutex::new(None),
        }
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<SignalingEvent> {
        self.event_tx.subscribe()
    }

    pub fn identity(&self) -> &ParticipantInfo {
        &self.identity
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state.read().status
    }

    /// Prüft ob verbunden
    pub fn is_connected(&self) -> bool {
        self.state.read().outbound.is_some()
    }

    /// Baut die Verbindung auf und hält sie danach selbstständig am Leben
    ///
    /// Wartet höchstens `connect_timeout` auf den ersten erfolgreichen
    /// Connect. Scheitert der erste Versuch, wird kein Reconnect gestartet.
    pub async fn connect(&self) -> Result<(), SignalingError> {
        let url = websocket_url(&self.config.server_url)?;

        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        {
            let mut guard = self.shutdown_tx.lock();
            if guard.is_some() {
                return Err(SignalingError::AlreadyConnected);
            }
            *guard = Some(shutdown_tx);
        }

        tracing::info!("Connecting to signaling server: {}", url);

        let (ready_tx, ready_rx) = oneshot::channel();
        let ctx = ConnectionContext {
            url,
            identity: self.identity.clone(),
            config: self.config.clone(),
            state: Arc::clone(&self.state),
            event_tx: self.event_tx.clone(),
        };
        tokio::spawn(connection_loop(ctx, shutdown_rx, ready_tx));

        match tokio::time::timeout(self.config.connect_timeout, ready_rx).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => {
                self.shutdown_tx.lock().take();
                Err(e)
            }
            Ok(Err(_)) => {
                self.shutdown_tx.lock().take();
                Err(SignalingError::ConnectionFailed(
                    "connection task ended".to_string(),
                ))
            }
            Err(_) => {
                self.disconnect().await;
                Err(SignalingError::Timeout)
            }
        }
    }

    /// Trennt die Verbindung und beendet den Reconnect
    pub async fn disconnect(&self) {
        let shutdown_tx = self.shutdown_tx.lock().take();
        if let Some(tx) = shutdown_tx {
            let _ = tx.send(()).await;
        }
    }
}

impl SignalSink for SignalingClient {
    fn send(&self, message: SignalMessage) -> bool {
        let topic = message.topic();

        let tx = match self.state.read().outbound.clone() {
            Some(tx) => tx,
            None => {
                tracing::warn!("Not connected, dropping {} message", topic);
                return false;
            }
        };

        let json = match serde_json::to_string(&message) {
            Ok(json) => json,
            Err(e) => {
                tracing::error!("Failed to serialize {} message: {}", topic, e);
                return false;
            }
        };

        // try_send ist non-blocking
        match tx.try_send(json) {
            Ok(()) => {
                tracing::trace!("Queued {} message", topic);
                true
            }
            Err(e) => {
                tracing::warn!("Dropping {} message: {}", topic, e);
                false
            }
        }
    }
}

impl std::fmt::Debug for SignalingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingClient")
            .field("server_url", &self.config.server_url)
            .field("participant_id", &self.identity.participant_id)
            .field("state", &*self.state.read())
            .finish()
    }
}

// ============================================================================
// CONNECTION LOOP
// ============================================================================

/// Hauptschleife mit Reconnection-Logik
async fn connection_loop(
    ctx: ConnectionContext,
    mut shutdown_rx: mpsc::Receiver<()>,
    ready_tx: oneshot::Sender<Result<(), SignalingError>>,
) {
    let mut ready_tx = Some(ready_tx);
    let mut attempt = 0u32;
    let mut connected_before = false;

    loop {
        if attempt > 0 {
            ctx.set_status(ConnectionStatus::Reconnecting { attempt });
        } else {
            ctx.set_status(ConnectionStatus::Connecting);
        }

        match connect_async(ctx.url.as_str()).await {
            Ok((ws_stream, _)) => {
                tracing::info!("WebSocket connected");
                let outcome = run_connection(
                    &ctx,
                    ws_stream,
                    connected_before,
                    &mut shutdown_rx,
                    &mut ready_tx,
                )
                .await;

                if let Some(tx) = ready_tx.take() {
                    // Verbindung vor dem Announce verloren
                    let _ = tx.send(Err(SignalingError::ConnectionFailed(
                        "connection closed during handshake".to_string(),
                    )));
                    ctx.set_status(ConnectionStatus::Disconnected);
                    return;
                }

                connected_before = true;
                ctx.mark_disconnected();
                attempt = 0;

                if outcome == ConnectionOutcome::Shutdown {
                    tracing::info!("Signaling connection shut down");
                    return;
                }
            }
            Err(e) => {
                tracing::error!("Failed to connect to signaling server: {}", e);
                if let Some(tx) = ready_tx.take() {
                    let _ = tx.send(Err(SignalingError::ConnectionFailed(e.to_string())));
                    ctx.set_status(ConnectionStatus::Disconnected);
                    return;
                }
            }
        }

        attempt += 1;
        let backoff = backoff_delay(attempt, ctx.config.max_backoff);
        tracing::info!("Reconnecting in {:?} (attempt {})", backoff, attempt);

        tokio::select! {
            () = tokio::time::sleep(backoff) => {}
            _ = shutdown_rx.recv() => {
                tracing::info!("Shutdown during reconnect backoff");
                ctx.set_status(ConnectionStatus::Disconnected);
                return;
            }
        }
    }
}

/// Bedient eine einzelne Verbindung bis sie abbricht
async fn run_connection(
    ctx: &ConnectionContext,
    ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    reconnect: bool,
    shutdown_rx: &mut mpsc::Receiver<()>,
    ready_tx: &mut Option<oneshot::Sender<Result<(), SignalingError>>>,
) -> ConnectionOutcome {
    let (mut write, mut read) = ws_stream.split();

    // Identität immer als erste Nachricht, noch vor Anwendungsnachrichten
    let announce = match serde_json::to_string(&SignalMessage::Announce(ctx.identity.clone())) {
        Ok(json) => json,
        Err(e) => {
            tracing::error!("Failed to serialize announce: {}", e);
            return ConnectionOutcome::Lost;
        }
    };
    if let Err(e) = write.send(Message::Text(announce)).await {
        tracing::error!("Failed to announce identity: {}", e);
        return ConnectionOutcome::Lost;
    }

    let (tx, mut rx) = mpsc::channel::<String>(ctx.config.outbound_capacity);
    {
        let mut state = ctx.state.write();
        state.status = ConnectionStatus::Connected;
        state.outbound = Some(tx);
    }
    if let Some(ready) = ready_tx.take() {
        let _ = ready.send(Ok(()));
    }
    let _ = ctx.event_tx.send(SignalingEvent::Connected { reconnect });

    let mut heartbeat = tokio::time::interval(ctx.config.heartbeat_interval);
    heartbeat.tick().await;

    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => handle_text(&ctx.event_tx, &text),
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = write.send(Message::Pong(data)).await {
                            tracing::warn!("Failed to send pong: {}", e);
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        tracing::info!("WebSocket closed by server");
                        return ConnectionOutcome::Lost;
                    }
                    Some(Err(e)) => {
                        tracing::error!("WebSocket error: {}", e);
                        return ConnectionOutcome::Lost;
                    }
                    None => {
                        tracing::info!("WebSocket stream ended");
                        return ConnectionOutcome::Lost;
                    }
                    _ => {}
                }
            }

            outbound = rx.recv() => {
                match outbound {
                    Some(json) => {
                        if let Err(e) = write.send(Message::Text(json)).await {
                            tracing::error!("Failed to send WebSocket message: {}", e);
                            return ConnectionOutcome::Lost;
                        }
                    }
                    None => return ConnectionOutcome::Lost,
                }
            }

            _ = heartbeat.tick() => {
                if let Err(e) = write.send(Message::Ping(Vec::new())).await {
                    tracing::warn!("Failed to send heartbeat: {}", e);
                    return ConnectionOutcome::Lost;
                }
            }

            _ = shutdown_rx.recv() => {
                let _ = write.send(Message::Close(None)).await;
                return ConnectionOutcome::Shutdown;
            }
        }
    }
}

/// Parst eine Text-Nachricht; kaputte Frames werden verworfen
fn handle_text(event_tx: &broadcast::Sender<SignalingEvent>, text: &str) {
    match serde_json::from_str::<SignalMessage>(text) {
        Ok(msg) => {
            tracing::debug!("Received {} message", msg.topic());
            let _ = event_tx.send(SignalingEvent::Message(msg));
        }
        Err(e) => {
            tracing::warn!("Discarding malformed signaling message: {}", e);
        }
    }
}

// ============================================================================
// HELPERS
// ============================================================================

/// Baut die WebSocket-URL aus der konfigurierten Server-URL
pub fn websocket_url(server_url: &str) -> Result<Url, SignalingError> {
    let mut url =
        Url::parse(server_url).map_err(|e| SignalingError::InvalidUrl(e.to_string()))?;

    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(SignalingError::InvalidUrl(format!(
                "unsupported scheme '{}'",
                other
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| SignalingError::InvalidUrl(server_url.to_string()))?;

    if url.path() == "/" || url.path().is_empty() {
        url.set_path("/ws");
    }

    Ok(url)
}

/// Exponentieller Backoff (1s, 2s, 4s ...) mit Jitter, gedeckelt
pub fn backoff_delay(attempt: u32, max_backoff: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(5);
    let base = Duration::from_secs(1u64 << exponent);
    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..250));
    std::cmp::min(base + jitter, max_backoff)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio::time::timeout;
    use tokio_tungstenite::accept_async;

    fn test_config(server_url: String) -> SignalingConfig {
        SignalingConfig {
            server_url,
            connect_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(30),
            max_backoff: Duration::from_millis(300),
            outbound_capacity: 16,
        }
    }

    fn identity() -> ParticipantInfo {
        ParticipantInfo::new("alice".to_string(), "Alice".to_string(), true)
    }

    async fn next_event(rx: &mut broadcast::Receiver<SignalingEvent>) -> SignalingEvent {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    async fn next_message(ws: &mut WebSocketStream<TcpStream>) -> SignalMessage {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => return serde_json::from_str(&text).unwrap(),
                Some(Ok(_)) => continue,
                other => panic!("unexpected frame: {:?}", other),
            }
        }
    }

    #[test]
    fn test_websocket_url_rewrites_scheme() {
        assert_eq!(
            websocket_url("https://relay.example.com").unwrap().as_str(),
            "wss://relay.example.com/ws"
        );
        assert_eq!(
            websocket_url("http://localhost:8787/rooms/42").unwrap().as_str(),
            "ws://localhost:8787/rooms/42"
        );
        assert!(matches!(
            websocket_url("ftp://relay.example.com"),
            Err(SignalingError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_backoff_is_capped() {
        let first = backoff_delay(1, Duration::from_secs(30));
        assert!(first >= Duration::from_secs(1));
        assert!(first < Duration::from_millis(1250));

        for attempt in 1..20 {
            assert!(backoff_delay(attempt, Duration::from_secs(5)) <= Duration::from_secs(5));
        }
    }

    #[test]
    fn test_send_while_disconnected_is_dropped() {
        let client = SignalingClient::new(test_config("ws://127.0.0.1:9".to_string()), identity());

        assert!(!client.is_connected());
        assert!(!client.send(SignalMessage::RosterRequest));
    }

    #[tokio::test]
    async fn test_connect_to_unreachable_relay_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = SignalingClient::new(test_config(format!("ws://{}", addr)), identity());
        let result = client.connect().await;

        assert!(matches!(result, Err(SignalingError::ConnectionFailed(_))));
        assert_eq!(client.status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_reconnect_reannounces_without_replay() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = SignalingClient::new(test_config(format!("ws://{}", addr)), identity());
        let mut events = client.subscribe();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let first = next_message(&mut ws).await;
            let roster_request = next_message(&mut ws).await;
            // Harter Abbruch ohne Close-Handshake
            drop(ws);

            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let second = next_message(&mut ws).await;
            ws.send(Message::Text(
                r#"{"topic":"participant-left","payload":{"participantId":"bob"}}"#.to_string(),
            ))
            .await
            .unwrap();
            let after_reconnect = next_message(&mut ws).await;
            (first, roster_request, second, after_reconnect, ws)
        });

        client.connect().await.unwrap();
        assert!(matches!(
            next_event(&mut events).await,
            SignalingEvent::Connected { reconnect: false }
        ));
        assert!(client.send(SignalMessage::RosterRequest));

        assert!(matches!(
            next_event(&mut events).await,
            SignalingEvent::Disconnected
        ));
        // Während der Trennung wird nichts gepuffert
        assert!(!client.send(SignalMessage::CallEnded {
            call_id: "stale".to_string()
        }));

        assert!(matches!(
            next_event(&mut events).await,
            SignalingEvent::Connected { reconnect: true }
        ));
        match next_event(&mut events).await {
            SignalingEvent::Message(SignalMessage::ParticipantLeft { participant_id }) => {
                assert_eq!(participant_id, "bob")
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(client.send(SignalMessage::RosterRequest));

        let (first, roster_request, second, after_reconnect, _ws) =
            timeout(Duration::from_secs(5), server).await.unwrap().unwrap();
        assert_eq!(first, SignalMessage::Announce(identity()));
        assert_eq!(roster_request, SignalMessage::RosterRequest);
        assert_eq!(second, SignalMessage::Announce(identity()));
        assert_eq!(after_reconnect, SignalMessage::RosterRequest);

        client.disconnect().await;
    }
}
