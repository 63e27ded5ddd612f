//! Schnittstelle zwischen Call Engine und Relay
//!
//! Der Controller sendet ausschließlich über diesen Trait. Die Zustellung
//! ist fire-and-forget: Fehler werden geloggt, aber nicht zurückgemeldet.

use super::messages::SignalingEnvelope;

/// Ausgehende Seite des Signaling-Transports
pub trait SignalingTransport: Send + Sync {
    /// Sendet einen Envelope ohne Zustellbestätigung
    fn send(&self, envelope: SignalingEnvelope);
}
