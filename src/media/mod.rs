//! Media Module - Lokale Tracks und Sender-Slots
//!
//! Die Erfassung von Kamera, Mikrofon und Bildschirm liegt außerhalb dieses
//! Crates; hier werden nur die Handles und deren Zuordnung verwaltet.

mod tracks;

pub use tracks::{MediaHandle, MediaKind, MediaSource, MediaTrackManager, TrackPlan, TrackRole};
