//! Negotiation Module - Offer/Answer und ICE
//!
//! Dieses Modul verwaltet:
//! - Den Verhandlungszustand pro Peer Connection (Generation, Candidate-Puffer)
//! - Die Abstraktion des Medien-Transports
//! - Die WebRTC-Implementierung des Transports

mod context;
mod rtc;
mod transport;

#[cfg(test)]
pub(crate) mod fake;

pub use context::{
    CandidateDisposition, NegotiationContext, NegotiationError, NegotiationEvent,
    NegotiationOutcome, NegotiationSink, RemoteApply,
};
pub use rtc::{RtcMediaTracks, RtcPeerTransport, RtcTransportFactory};
pub use transport::{
    ConnectionState, DescriptionKind, PeerTransport, PeerTransportFactory, SessionDescription,
    TransportError, TransportEvent, TransportEventSink,
};
