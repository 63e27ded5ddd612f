//! Call Engine Module - Anruf-Zustandsmaschine
//!
//! Dieses Modul verwaltet:
//! - Die Call Session (Rollen, Zustände, Lebensdauer)
//! - Den Controller, der Befehle, Signaling und Negotiation-Ergebnisse verarbeitet
//! - Die Runtime mit Event-Queue und asynchroner Befehls-API
//! - Notifications an die UI

mod controller;
mod notify;
mod runtime;
mod session;

pub use controller::{CallCommand, CallController, CallError, ControllerEvent};
pub use notify::{CallNotification, ErrorKind, NotificationSink};
pub use runtime::{CallHandle, CallRuntime};
pub use session::{CallRole, CallSession, CallSnapshot, CallState, EndReason, SessionId};
