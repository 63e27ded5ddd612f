//! WebSocket Client für den Signaling-Relay
//!
//! Verwaltet die WebSocket-Verbindung zum Relay:
//! - Registrierung mit Timeout
//! - Heartbeat-Keeping
//! - Event-basierte Weiterleitung in Empfangsreihenfolge

use super::messages::*;
use super::transport::SignalingTransport;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

/// Maximale Wartezeit auf die Registrierungs-Antwort
const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum SignalingError {
    #[error("Invalid signaling URL: {0}")]
    InvalidUrl(String),

    #[error("WebSocket connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected to signaling server")]
    NotConnected,

    #[error("Failed to send message: {0}")]
    SendFailed(String),

    #[error("Registration failed: {0}")]
    RegistrationFailed(String),

    #[error("Server error: {code} - {message}")]
    ServerError { code: i32, message: String },
}

// ============================================================================
// SIGNALING EVENTS
// ============================================================================

/// Events die vom SignalingClient ausgelöst werden
#[derive(Debug, Clone)]
pub enum SignalingEvent {
    /// Verbunden mit dem Relay
    Connected,

    /// Verbindung getrennt
    Disconnected,

    /// Registrierung erfolgreich
    Registered {
        peer_id: ParticipantId,
        username: String,
    },

    /// Envelope eines anderen Teilnehmers
    Envelope(SignalingEnvelope),

    /// Vollständige Teilnehmerliste
    Roster(Vec<ParticipantId>),

    /// Teilnehmer online
    ParticipantOnline(ParticipantId),

    /// Teilnehmer offline
    ParticipantOffline(ParticipantId),

    /// Fehler vom Server
    Error { code: i32, message: String },
}

// ============================================================================
// CLIENT STATE
// ============================================================================

#[derive(Debug, Clone, Default)]
struct ClientState {
    is_connected: bool,
    peer_id: Option<ParticipantId>,
    username: Option<String>,
}

// ============================================================================
// SIGNALING CLIENT
// ============================================================================

/// WebSocket Client für die Relay-Kommunikation
pub struct SignalingClient {
    server_url: String,
    state: Arc<RwLock<ClientState>>,
    tx: Option<mpsc::Sender<String>>,
    event_tx: broadcast::Sender<SignalingEvent>,
}

impl SignalingClient {
    /// Erstellt einen neuen SignalingClient
    pub fn new(server_url: String) -> Self {
        let (event_tx, _) = broadcast::channel(256);

        Self {
            server_url,
            state: Arc::new(RwLock::new(ClientState::default())),
            tx: None,
            event_tx,
        }
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<SignalingEvent> {
        self.event_tx.subscribe()
    }

    /// Registriert einen Handler, der pro eingehendem Event genau einmal
    /// aufgerufen wird, in der Reihenfolge der Zustellung
    pub fn on_receive<F>(&self, mut handler: F) -> JoinHandle<()>
    where
        F: FnMut(SignalingEvent) + Send + 'static,
    {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => handler(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Signaling receiver lagged, {} events dropped", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Gibt die aktuelle Peer-ID zurück (falls registriert)
    pub fn peer_id(&self) -> Option<ParticipantId> {
        self.state.read().peer_id.clone()
    }

    /// Gibt den aktuellen Username zurück (falls registriert)
    pub fn username(&self) -> Option<String> {
        self.state.read().username.clone()
    }

    /// Prüft ob verbunden
    pub fn is_connected(&self) -> bool {
        self.state.read().is_connected
    }

    /// Verbindet mit dem Relay und registriert den Benutzer
    pub async fn connect_and_register(
        &mut self,
        username: String,
    ) -> Result<ParticipantId, SignalingError> {
        let ws_url = websocket_url(&self.server_url)?;

        tracing::info!("Connecting to signaling server: {}", ws_url);

        let (ws_stream, _) = connect_async(ws_url.as_str())
            .await
            .map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();

        let (tx, mut rx) = mpsc::channel::<String>(100);
        self.tx = Some(tx);

        {
            let mut state = self.state.write();
            state.is_connected = true;
            state.username = Some(username.clone());
        }

        let _ = self.event_tx.send(SignalingEvent::Connected);

        // Channel für Registrierungs-Response
        let (reg_tx, mut reg_rx) = mpsc::channel::<Result<ParticipantId, SignalingError>>(1);

        // Read-Task
        let state_clone = Arc::clone(&self.state);
        let event_tx = self.event_tx.clone();

        tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerMessage>(&text) {
                        Ok(server_msg) => Self::handle_server_message(
                            server_msg,
                            &state_clone,
                            &event_tx,
                            &reg_tx,
                        ),
                        Err(e) => tracing::warn!("Dropping malformed relay message: {}", e),
                    },
                    Ok(Message::Close(_)) => {
                        tracing::info!("WebSocket closed by server");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }

            state_clone.write().is_connected = false;
            let _ = event_tx.send(SignalingEvent::Disconnected);
        });

        // Write-Task
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = write.send(Message::Text(msg)).await {
                    tracing::error!("Failed to send WebSocket message: {}", e);
                    break;
                }
            }
        });

        self.send_payload(&RegisterPayload::new(username))?;

        tokio::select! {
            result = reg_rx.recv() => {
                match result {
                    Some(result) => result,
                    None => Err(SignalingError::RegistrationFailed("No response".to_string())),
                }
            }
            _ = tokio::time::sleep(REGISTRATION_TIMEOUT) => {
                Err(SignalingError::RegistrationFailed("Timeout".to_string()))
            }
        }
    }

    /// Sendet einen Envelope (non-blocking, verwendet try_send)
    pub fn send_envelope(&self, envelope: SignalingEnvelope) -> Result<(), SignalingError> {
        let payload = SignalPayload::new(envelope, Utc::now().timestamp_millis());
        self.send_payload(&payload)
    }

    /// Sendet einen Heartbeat
    pub fn send_heartbeat(&self) -> Result<(), SignalingError> {
        let peer_id = self.peer_id().ok_or(SignalingError::NotConnected)?;
        self.send_payload(&HeartbeatPayload::new(peer_id))
    }

    /// Trennt die Verbindung; der Write-Task endet mit dem letzten Sender
    pub fn disconnect(&mut self) {
        self.tx = None;
        self.state.write().is_connected = false;
    }

    fn send_payload<T: serde::Serialize>(&self, payload: &T) -> Result<(), SignalingError> {
        let tx = self.tx.as_ref().ok_or(SignalingError::NotConnected)?;

        let msg_string =
            serde_json::to_string(payload).map_err(|e| SignalingError::SendFailed(e.to_string()))?;

        tx.try_send(msg_string)
            .map_err(|e| SignalingError::SendFailed(e.to_string()))
    }

    /// Verarbeitet eingehende Server-Nachrichten
    fn handle_server_message(
        msg: ServerMessage,
        state: &Arc<RwLock<ClientState>>,
        event_tx: &broadcast::Sender<SignalingEvent>,
        reg_tx: &mpsc::Sender<Result<ParticipantId, SignalingError>>,
    ) {
        match msg {
            ServerMessage::Registered { peer_id, username } => {
                tracing::info!("Registered as {} with peer_id {}", username, peer_id);
                {
                    let mut s = state.write();
                    s.peer_id = Some(peer_id.clone());
                    s.username = Some(username.clone());
                }
                let _ = reg_tx.try_send(Ok(peer_id.clone()));
                let _ = event_tx.send(SignalingEvent::Registered { peer_id, username });
            }

            ServerMessage::Signal { envelope } => {
                tracing::debug!("Relay delivered {} from {}", envelope.kind(), envelope.from());
                let _ = event_tx.send(SignalingEvent::Envelope(envelope));
            }

            ServerMessage::Roster { participants } => {
                let _ = event_tx.send(SignalingEvent::Roster(participants));
            }

            ServerMessage::UserOnline { peer_id } => {
                let _ = event_tx.send(SignalingEvent::ParticipantOnline(peer_id));
            }

            ServerMessage::UserOffline { peer_id } => {
                let _ = event_tx.send(SignalingEvent::ParticipantOffline(peer_id));
            }

            ServerMessage::Error { code, message } => {
                tracing::error!("Server error {}: {}", code, message);
                // Bei Registrierungs-Fehlern auch dem reg_tx melden
                let _ = reg_tx.try_send(Err(SignalingError::ServerError {
                    code,
                    message: message.clone(),
                }));
                let _ = event_tx.send(SignalingEvent::Error { code, message });
            }

            ServerMessage::Pong => {}
        }
    }

    /// Startet einen Heartbeat-Task
    pub fn start_heartbeat(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if !self.is_connected() {
                    tracing::info!("Heartbeat: client disconnected, stopping heartbeat task");
                    break;
                }
                if let Err(e) = self.send_heartbeat() {
                    tracing::warn!("Failed to send heartbeat: {}", e);
                }
            }
        })
    }
}

impl SignalingTransport for SignalingClient {
    fn send(&self, envelope: SignalingEnvelope) {
        let kind = envelope.kind();
        let to = envelope.to().clone();
        if let Err(e) = self.send_envelope(envelope) {
            tracing::warn!("Dropping {} to {}: {}", kind, to, e);
        }
    }
}

impl std::fmt::Debug for SignalingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingClient")
            .field("server_url", &self.server_url)
            .field("state", &*self.state.read())
            .finish()
    }
}

/// Leitet die WebSocket-URL aus der konfigurierten Server-URL ab
fn websocket_url(server_url: &str) -> Result<Url, SignalingError> {
    let mut url = Url::parse(server_url).map_err(|e| SignalingError::InvalidUrl(e.to_string()))?;

    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(SignalingError::InvalidUrl(format!("unsupported scheme {}", other))),
    };
    url.set_scheme(scheme)
        .map_err(|_| SignalingError::InvalidUrl(server_url.to_string()))?;

    let path = format!("{}/ws", url.path().trim_end_matches('/'));
    url.set_path(&path);
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_websocket_url_from_https() {
        let url = websocket_url("https://relay.example.com").unwrap();
        assert_eq!(url.as_str(), "wss://relay.example.com/ws");
    }

    #[test]
    fn test_websocket_url_keeps_path() {
        let url = websocket_url("http://localhost:8080/signal/").unwrap();
        assert_eq!(url.as_str(), "ws://localhost:8080/signal/ws");
    }

    #[test]
    fn test_websocket_url_rejects_unknown_scheme() {
        assert!(matches!(
            websocket_url("ftp://relay.example.com"),
            Err(SignalingError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_send_without_connection_fails() {
        let client = SignalingClient::new("https://relay.example.com".to_string());
        let result = client.send_envelope(SignalingEnvelope::CallEnded {
            from: "a".into(),
            to: "b".into(),
        });
        assert!(matches!(result, Err(SignalingError::NotConnected)));
    }

    #[tokio::test]
    async fn test_server_messages_become_events_in_order() {
        let state = Arc::new(RwLock::new(ClientState::default()));
        let (event_tx, mut event_rx) = broadcast::channel(16);
        let (reg_tx, mut reg_rx) = mpsc::channel(1);

        SignalingClient::handle_server_message(
            ServerMessage::Registered {
                peer_id: "me".into(),
                username: "alice".to_string(),
            },
            &state,
            &event_tx,
            &reg_tx,
        );
        SignalingClient::handle_server_message(
            ServerMessage::UserOffline {
                peer_id: "bob".into(),
            },
            &state,
            &event_tx,
            &reg_tx,
        );

        assert_eq!(reg_rx.recv().await.unwrap().unwrap().as_str(), "me");
        assert_eq!(state.read().peer_id.as_ref().unwrap().as_str(), "me");
        assert!(matches!(
            event_rx.recv().await.unwrap(),
            SignalingEvent::Registered { .. }
        ));
        assert!(matches!(
            event_rx.recv().await.unwrap(),
            SignalingEvent::ParticipantOffline(id) if id.as_str() == "bob"
        ));
    }
}
