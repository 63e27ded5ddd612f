//! Signaling Module - WebSocket Client für den Relay
//!
//! Dieses Modul verwaltet die Kommunikation mit dem Relay-Server:
//! - WebSocket-Verbindung aufbauen und halten
//! - Envelopes serialisieren und senden
//! - Eingehende Nachrichten parsen und in Empfangsreihenfolge weiterleiten
//!

mod client;
mod messages;
mod transport;

pub use client::{SignalingClient, SignalingError, SignalingEvent};
pub use messages::*;
pub use transport::SignalingTransport;
