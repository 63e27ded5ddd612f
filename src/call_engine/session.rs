//! Call Session
//!
//! Eine Session existiert vom Anrufwunsch (bzw. eingehenden Offer) bis zum
//! Ende des Anrufs und besitzt genau einen `NegotiationContext`.

use crate::negotiation::NegotiationContext;
use crate::signaling::ParticipantId;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use uuid::Uuid;

/// Identität einer Session; alle asynchronen Ergebnisse tragen sie mit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// ============================================================================
// CALL STATE
// ============================================================================

/// Rolle der lokalen Seite in einer Session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallRole {
    Caller,
    Callee,
}

/// Aktueller Status eines Anrufs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    /// Kein aktiver Anruf
    Idle,
    /// Ausgehender Anruf, Offer gesendet
    Dialing,
    /// Eingehender Anruf wartet auf Antwort
    Ringing,
    /// Answer ausgetauscht, Verbindung wird hergestellt
    Connecting,
    /// Anruf aktiv
    Active,
    /// Ressourcen werden freigegeben
    Ending,
}

/// Warum eine Session beendet wurde
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum EndReason {
    LocalHangup,
    RemoteHangup,
    RejectedLocally,
    RemoteRejected,
    RemoteBusy,
    RemoteError(String),
    NegotiationFailed(String),
    TransportFailed,
    TransportLost,
    PeerLeft,
    RingTimeout,
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndReason::LocalHangup => f.write_str("local hangup"),
            EndReason::RemoteHangup => f.write_str("remote hangup"),
            EndReason::RejectedLocally => f.write_str("rejected locally"),
            EndReason::RemoteRejected => f.write_str("rejected by remote"),
            EndReason::RemoteBusy => f.write_str("remote busy"),
            EndReason::RemoteError(reason) => write!(f, "remote error: {}", reason),
            EndReason::NegotiationFailed(reason) => write!(f, "negotiation failed: {}", reason),
            EndReason::TransportFailed => f.write_str("transport failed"),
            EndReason::TransportLost => f.write_str("relay connection lost"),
            EndReason::PeerLeft => f.write_str("peer left"),
            EndReason::RingTimeout => f.write_str("ring timeout"),
        }
    }
}

// ============================================================================
// CALL SESSION
// ============================================================================

/// Ein einzelner Anruf zwischen zwei Teilnehmern
#[derive(Debug)]
pub struct CallSession {
    pub id: SessionId,
    pub local: ParticipantId,
    pub remote: ParticipantId,
    pub role: CallRole,
    pub state: CallState,
    pub created_at: DateTime<Utc>,
    pub negotiation: NegotiationContext,
    /// Generation, deren Local Description zuletzt gesendet wurde
    pub local_sent: Option<u64>,
    /// Lokale Candidates, die vor der Local Description anfielen
    pub outgoing_candidates: Vec<String>,
}

impl CallSession {
    pub fn new(
        id: SessionId,
        local: ParticipantId,
        remote: ParticipantId,
        role: CallRole,
        state: CallState,
        negotiation: NegotiationContext,
    ) -> Self {
        Self {
            id,
            local,
            remote,
            role,
            state,
            created_at: Utc::now(),
            negotiation,
            local_sent: None,
            outgoing_candidates: Vec::new(),
        }
    }

    /// Local Description der aktuellen Generation ist beim Peer
    pub fn local_description_sent(&self) -> bool {
        self.local_sent == Some(self.negotiation.generation())
    }

    pub fn snapshot(&self) -> CallSnapshot {
        CallSnapshot {
            session_id: self.id,
            remote: self.remote.clone(),
            role: self.role,
            state: self.state,
            generation: self.negotiation.generation(),
            created_at: self.created_at,
        }
    }
}

/// Schreibgeschützte Sicht auf den aktuellen Anruf
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSnapshot {
    pub session_id: SessionId,
    pub remote: ParticipantId,
    pub role: CallRole,
    pub state: CallState,
    pub generation: u64,
    pub created_at: DateTime<Utc>,
}
