//! Message Types für das Signaling-Protokoll
//!
//! Enthält die Umschläge (Envelopes), die zwischen zwei Teilnehmern über
//! den Relay ausgetauscht werden, sowie die Nachrichten zwischen Client
//! und Relay-Server.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// PARTICIPANT ID
// ============================================================================

/// Vom Server vergebene, opake Teilnehmer-ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ParticipantId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

// ============================================================================
// SIGNALING ENVELOPES (PEER ↔ PEER)
// ============================================================================

/// Grund, der bei `CallError` mitgeschickt wird, wenn der Empfänger besetzt ist
pub const BUSY_REASON: &str = "busy";

/// Umschlag für alle Peer-zu-Peer Signaling-Nachrichten
///
/// Offer, Answer und Candidate tragen die Generation der Verhandlungsrunde,
/// zu der sie gehören. Nachrichten einer überholten Runde werden verworfen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalingEnvelope {
    /// SDP Offer
    Offer {
        from: ParticipantId,
        to: ParticipantId,
        generation: u64,
        sdp: String,
    },

    /// SDP Answer
    Answer {
        from: ParticipantId,
        to: ParticipantId,
        generation: u64,
        sdp: String,
    },

    /// ICE Candidate (JSON-kodiertes `RTCIceCandidateInit`)
    Candidate {
        from: ParticipantId,
        to: ParticipantId,
        generation: u64,
        candidate: String,
    },

    /// Anruf wurde abgelehnt
    CallRejected { from: ParticipantId, to: ParticipantId },

    /// Anruf wurde beendet
    CallEnded { from: ParticipantId, to: ParticipantId },

    /// Anruf konnte nicht angenommen werden (z.B. besetzt)
    CallError {
        from: ParticipantId,
        to: ParticipantId,
        reason: String,
    },

    /// Chat-Nachricht während eines Anrufs
    ChatMessage {
        from: ParticipantId,
        to: ParticipantId,
        text: String,
        sent_at: DateTime<Utc>,
    },
}

impl SignalingEnvelope {
    pub fn from(&self) -> &ParticipantId {
        match self {
            Self::Offer { from, .. }
            | Self::Answer { from, .. }
            | Self::Candidate { from, .. }
            | Self::CallRejected { from, .. }
            | Self::CallEnded { from, .. }
            | Self::CallError { from, .. }
            | Self::ChatMessage { from, .. } => from,
        }
    }

    pub fn to(&self) -> &ParticipantId {
        match self {
            Self::Offer { to, .. }
            | Self::Answer { to, .. }
            | Self::Candidate { to, .. }
            | Self::CallRejected { to, .. }
            | Self::CallEnded { to, .. }
            | Self::CallError { to, .. }
            | Self::ChatMessage { to, .. } => to,
        }
    }

    /// Generation der Verhandlungsrunde (nur Offer/Answer/Candidate)
    pub fn generation(&self) -> Option<u64> {
        match self {
            Self::Offer { generation, .. }
            | Self::Answer { generation, .. }
            | Self::Candidate { generation, .. } => Some(*generation),
            _ => None,
        }
    }

    /// Kurzer Name für Logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::Candidate { .. } => "candidate",
            Self::CallRejected { .. } => "call_rejected",
            Self::CallEnded { .. } => "call_ended",
            Self::CallError { .. } => "call_error",
            Self::ChatMessage { .. } => "chat_message",
        }
    }
}

// ============================================================================
// CLIENT → SERVER MESSAGES
// ============================================================================

/// Registrierung beim Relay
#[derive(Debug, Clone, Serialize)]
pub struct RegisterPayload {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    pub username: String,
}

impl RegisterPayload {
    pub fn new(username: String) -> Self {
        Self {
            msg_type: "register",
            username,
        }
    }
}

/// Weiterleitung eines Envelopes an einen anderen Teilnehmer
#[derive(Debug, Clone, Serialize)]
pub struct SignalPayload {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    pub envelope: SignalingEnvelope,
    pub timestamp: i64,
}

impl SignalPayload {
    pub fn new(envelope: SignalingEnvelope, timestamp: i64) -> Self {
        Self {
            msg_type: "signal",
            envelope,
            timestamp,
        }
    }
}

/// Heartbeat
#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatPayload {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    #[serde(rename = "peerId")]
    pub peer_id: ParticipantId,
}

impl HeartbeatPayload {
    pub fn new(peer_id: ParticipantId) -> Self {
        Self {
            msg_type: "heartbeat",
            peer_id,
        }
    }
}

// ============================================================================
// SERVER → CLIENT MESSAGES
// ============================================================================

/// Alle möglichen Server-Nachrichten
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Erfolgreiche Registrierung
    Registered {
        #[serde(rename = "peerId")]
        peer_id: ParticipantId,
        username: String,
    },

    /// Aktuelle Teilnehmerliste
    Roster { participants: Vec<ParticipantId> },

    /// Teilnehmer ist online gekommen
    UserOnline {
        #[serde(rename = "peerId")]
        peer_id: ParticipantId,
    },

    /// Teilnehmer ist offline gegangen
    UserOffline {
        #[serde(rename = "peerId")]
        peer_id: ParticipantId,
    },

    /// Weitergeleiteter Envelope eines anderen Teilnehmers
    Signal { envelope: SignalingEnvelope },

    /// Fehler
    Error { code: i32, message: String },

    /// Heartbeat Antwort
    Pong,
}
