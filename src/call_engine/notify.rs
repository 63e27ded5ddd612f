//! Notification Sink
//!
//! Reicht Controller-Events an die UI weiter. Trifft selbst keine
//! Entscheidungen.

use super::session::{CallState, EndReason};
use crate::media::{MediaHandle, TrackRole};
use crate::signaling::ParticipantId;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

/// Fehlerklassen für die UI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Ungültige Nachricht; verworfen, keine Zustandsänderung
    ProtocolError,
    /// Nachricht einer überholten Runde; stillschweigend verworfen
    StaleGenerationError,
    /// Für die Session fatal, Peer wird benachrichtigt
    NegotiationFailure,
    /// Sofortige Ablehnung, laufende Session unverändert
    BusyError,
    /// Relay-Verbindung verloren
    TransportLost,
    /// Lokaler Befehl im falschen Zustand oder mit falschen Argumenten
    InvalidRequest,
}

/// Events an die UI
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CallNotification {
    SessionStateChanged {
        state: CallState,
        remote: Option<ParticipantId>,
        reason: Option<EndReason>,
    },
    IncomingCall {
        remote: ParticipantId,
    },
    TrackAdded {
        remote: ParticipantId,
        role: TrackRole,
        handle: MediaHandle,
    },
    ChatReceived {
        remote: ParticipantId,
        text: String,
        sent_at: DateTime<Utc>,
    },
    Error {
        kind: ErrorKind,
        message: String,
    },
}

/// Broadcast-Kanal für `CallNotification`s
#[derive(Debug, Clone)]
pub struct NotificationSink {
    tx: broadcast::Sender<CallNotification>,
}

impl NotificationSink {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(100);
        Self { tx }
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<CallNotification> {
        self.tx.subscribe()
    }

    pub fn emit(&self, notification: CallNotification) {
        tracing::debug!("Notification: {:?}", notification);
        // Ohne Subscriber geht das Event verloren
        let _ = self.tx.send(notification);
    }
}

impl Default for NotificationSink {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notification_json_shape() {
        let json = serde_json::to_value(CallNotification::SessionStateChanged {
            state: CallState::Idle,
            remote: Some(ParticipantId::from("bob")),
            reason: Some(EndReason::RemoteError("unsupported".to_string())),
        })
        .unwrap();

        assert_eq!(json["type"], "session_state_changed");
        assert_eq!(json["state"], "idle");
        assert_eq!(json["remote"], "bob");
        assert_eq!(json["reason"]["kind"], "remote_error");
        assert_eq!(json["reason"]["detail"], "unsupported");
    }

    #[test]
    fn test_emit_without_subscriber() {
        let sink = NotificationSink::new();
        sink.emit(CallNotification::IncomingCall {
            remote: ParticipantId::from("bob"),
        });

        let mut rx = sink.subscribe();
        sink.emit(CallNotification::Error {
            kind: ErrorKind::BusyError,
            message: "busy".to_string(),
        });
        assert!(matches!(
            rx.try_recv(),
            Ok(CallNotification::Error { kind: ErrorKind::BusyError, .. })
        ));
    }
}
