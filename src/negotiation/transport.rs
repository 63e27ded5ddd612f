//! Abstraktion der Peer Connection
//!
//! Die Negotiation Engine spricht nur mit `PeerTransport`. Die WebRTC-
//! Implementierung liegt in `rtc.rs`.

use crate::media::{MediaHandle, MediaSource, TrackRole};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("WebRTC error: {0}")]
    WebRtc(String),

    #[error("Invalid SDP: {0}")]
    InvalidSdp(String),

    #[error("Invalid ICE candidate: {0}")]
    InvalidCandidate(String),

    #[error("No sender for track {0}")]
    NoSender(TrackRole),
}

// ============================================================================
// DESCRIPTIONS & EVENTS
// ============================================================================

/// Art einer Session Description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DescriptionKind {
    Offer,
    Answer,
}

/// SDP samt Typ
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: DescriptionKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: DescriptionKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: DescriptionKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Verbindungszustand des Medien-Transports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Events die der Transport von sich aus meldet
#[derive(Debug, Clone)]
pub enum TransportEvent {
    StateChanged(ConnectionState),
    /// Lokal gefundener ICE Candidate (JSON-kodiert)
    LocalCandidate(String),
    /// Eingehender Remote-Track
    RemoteTrack { role: TrackRole, handle: MediaHandle },
}

/// Rückkanal vom Transport zur Negotiation Engine
pub type TransportEventSink = Arc<dyn Fn(TransportEvent) + Send + Sync>;

// ============================================================================
// TRAITS
// ============================================================================

/// Eine Peer Connection
///
/// `create_offer`/`create_answer` setzen die erzeugte Beschreibung direkt
/// als Local Description.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn create_offer(&self) -> Result<String, TransportError>;

    async fn create_answer(&self) -> Result<String, TransportError>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), TransportError>;

    /// Verwirft das eigene, noch unbeantwortete Offer
    async fn rollback_local_offer(&self) -> Result<(), TransportError>;

    async fn add_ice_candidate(&self, candidate: &str) -> Result<(), TransportError>;

    /// Legt einen neuen Sender für `role` an
    async fn attach_track(
        &self,
        role: TrackRole,
        source: &MediaSource,
    ) -> Result<(), TransportError>;

    /// Tauscht die Quelle am bestehenden Sender; `None` leert ihn
    async fn replace_track(
        &self,
        role: TrackRole,
        source: Option<&MediaSource>,
    ) -> Result<(), TransportError>;

    /// Entfernt den Sender für `role`
    async fn detach_track(&self, role: TrackRole) -> Result<(), TransportError>;

    async fn close(&self);
}

/// Erzeugt pro Session eine neue Peer Connection
#[async_trait]
pub trait PeerTransportFactory: Send + Sync {
    async fn create(
        &self,
        events: TransportEventSink,
    ) -> Result<Arc<dyn PeerTransport>, TransportError>;

    /// Ob `replace_track` ohne neue Verhandlungsrunde möglich ist
    fn supports_in_place_replacement(&self) -> bool;
}
