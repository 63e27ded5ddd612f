//! Media Track Manager
//!
//! Ordnet logische Tracks (Kamera, Mikrofon, Bildschirm) den Sender-Slots
//! einer Session zu und entscheidet, ob ein Quellenwechsel direkt am Sender
//! erfolgen kann oder eine neue Verhandlungsrunde braucht.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

// ============================================================================
// TRACK ROLES
// ============================================================================

/// Art eines Media-Tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

/// Logische Rolle eines lokalen Tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TrackRole {
    #[serde(rename = "camera-video")]
    CameraVideo,
    #[serde(rename = "microphone-audio")]
    MicrophoneAudio,
    #[serde(rename = "screen-video")]
    ScreenVideo,
}

impl TrackRole {
    pub const ALL: [TrackRole; 3] = [
        TrackRole::MicrophoneAudio,
        TrackRole::CameraVideo,
        TrackRole::ScreenVideo,
    ];

    pub fn kind(&self) -> MediaKind {
        match self {
            TrackRole::MicrophoneAudio => MediaKind::Audio,
            TrackRole::CameraVideo | TrackRole::ScreenVideo => MediaKind::Video,
        }
    }

    /// Wird auch als Track-ID auf dem Transport verwendet, damit die
    /// Gegenseite die Rolle eines eingehenden Tracks erkennt
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackRole::CameraVideo => "camera-video",
            TrackRole::MicrophoneAudio => "microphone-audio",
            TrackRole::ScreenVideo => "screen-video",
        }
    }
}

impl fmt::Display for TrackRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TrackRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TrackRole::ALL
            .into_iter()
            .find(|role| role.as_str() == s)
            .ok_or_else(|| format!("unknown track role: {}", s))
    }
}

// ============================================================================
// MEDIA SOURCE / HANDLE
// ============================================================================

/// Handle auf eine lokal erfasste Quelle
///
/// Die Erfassung selbst passiert außerhalb dieses Crates; Klone teilen sich
/// das Stop-Flag, über das die Erfassung beendet wird, und das Enabled-Flag.
/// Eine deaktivierte Quelle liefert Stille bzw. Schwarzbild, der Sender
/// bleibt bestehen.
#[derive(Debug, Clone)]
pub struct MediaSource {
    id: String,
    kind: MediaKind,
    label: String,
    stopped: Arc<AtomicBool>,
    enabled: Arc<AtomicBool>,
}

impl MediaSource {
    pub fn new(id: impl Into<String>, kind: MediaKind, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            label: label.into(),
            stopped: Arc::new(AtomicBool::new(false)),
            enabled: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Stoppt die Quelle und gibt die Ressource frei
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            tracing::debug!("Media source {} ({}) stopped", self.id, self.label);
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        if self.enabled.swap(enabled, Ordering::SeqCst) != enabled {
            tracing::debug!("Media source {} enabled: {}", self.id, enabled);
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }
}

impl PartialEq for MediaSource {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

/// Beschreibung eines eingehenden Remote-Tracks für die UI
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MediaHandle {
    pub track_id: String,
    pub stream_id: String,
    pub kind: MediaKind,
}

// ============================================================================
// TRACK MANAGER
// ============================================================================

/// Was der Controller nach `install` am Transport tun muss
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackPlan {
    /// Keine Session: Quelle wird beim nächsten Anruf angehängt
    Stored,
    /// Gleicher Sender, nur die Quelle wird getauscht
    ReplaceInPlace,
    /// Sender wird neu angelegt (ggf. nach Entfernen), neue Verhandlungsrunde
    Renegotiate { detach_first: bool },
}

/// Zuordnung logischer Rollen zu Quellen und Sender-Slots
#[derive(Debug, Default)]
pub struct MediaTrackManager {
    /// Aktive lokale Quelle pro Rolle
    sources: BTreeMap<TrackRole, MediaSource>,
    /// Standardquelle pro Rolle, wird nach `stop_track` wiederhergestellt
    defaults: BTreeMap<TrackRole, MediaSource>,
    /// Rollen mit einem Sender in der aktuellen Session
    attached: BTreeSet<TrackRole>,
    /// Stummgeschaltete Rollen; gilt auch für später gesetzte Quellen
    disabled: BTreeSet<TrackRole>,
}

impl MediaTrackManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Setzt die Standardquelle einer Rolle
    pub fn set_default(&mut self, role: TrackRole, source: MediaSource) {
        self.defaults.insert(role, source);
    }

    pub fn default_for(&self, role: TrackRole) -> Option<&MediaSource> {
        self.defaults.get(&role)
    }

    pub fn source(&self, role: TrackRole) -> Option<&MediaSource> {
        self.sources.get(&role)
    }

    /// Alle aktiven Quellen, in stabiler Reihenfolge
    pub fn sources(&self) -> impl Iterator<Item = (TrackRole, &MediaSource)> {
        self.sources.iter().map(|(role, source)| (*role, source))
    }

    pub fn is_attached(&self, role: TrackRole) -> bool {
        self.attached.contains(&role)
    }

    pub fn mark_attached(&mut self, role: TrackRole) {
        self.attached.insert(role);
    }

    pub fn mark_detached(&mut self, role: TrackRole) {
        self.attached.remove(&role);
    }

    /// Vergisst alle Sender-Slots der beendeten Session; Quellen bleiben
    pub fn release_session(&mut self) {
        self.attached.clear();
    }

    /// Übernimmt eine neue Quelle für `role` und plant den Transport-Schritt
    ///
    /// Die vorherige Quelle wird gestoppt, außer sie ist die Standardquelle
    /// der Rolle.
    pub fn install(
        &mut self,
        role: TrackRole,
        source: MediaSource,
        in_session: bool,
        in_place_supported: bool,
    ) -> TrackPlan {
        source.set_enabled(self.is_enabled(role));
        if let Some(previous) = self.sources.insert(role, source.clone()) {
            let is_default = self.defaults.get(&role) == Some(&previous);
            if previous != source && !is_default {
                previous.stop();
            }
        }

        if !in_session {
            return TrackPlan::Stored;
        }

        let attached = self.is_attached(role);
        if attached && in_place_supported {
            TrackPlan::ReplaceInPlace
        } else {
            TrackPlan::Renegotiate {
                detach_first: attached,
            }
        }
    }

    /// Entfernt die Quelle einer Rolle und stoppt sie
    ///
    /// War sie die Standardquelle der Rolle, wird auch diese vergessen.
    pub fn remove(&mut self, role: TrackRole) -> Option<MediaSource> {
        let source = self.sources.remove(&role)?;
        if self.defaults.get(&role) == Some(&source) {
            self.defaults.remove(&role);
        }
        source.stop();
        Some(source)
    }

    /// Schaltet eine Rolle stumm bzw. wieder frei, ohne den Sender anzufassen
    pub fn set_enabled(&mut self, role: TrackRole, enabled: bool) -> Option<&MediaSource> {
        let source = self.sources.get(&role)?;
        if enabled {
            self.disabled.remove(&role);
        } else {
            self.disabled.insert(role);
        }
        source.set_enabled(enabled);
        Some(source)
    }

    pub fn is_enabled(&self, role: TrackRole) -> bool {
        !self.disabled.contains(&role)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn camera(id: &str) -> MediaSource {
        MediaSource::new(id, MediaKind::Video, "Camera")
    }

    #[test]
    fn test_role_round_trip_through_track_id() {
        for role in TrackRole::ALL {
            assert_eq!(role.as_str().parse::<TrackRole>().unwrap(), role);
        }
        assert!("speaker-audio".parse::<TrackRole>().is_err());
    }

    #[test]
    fn test_install_without_session_is_stored() {
        let mut tracks = MediaTrackManager::new();
        let plan = tracks.install(TrackRole::CameraVideo, camera("cam"), false, true);
        assert_eq!(plan, TrackPlan::Stored);
        assert_eq!(tracks.source(TrackRole::CameraVideo).unwrap().id(), "cam");
    }

    #[test]
    fn test_attached_role_replaces_in_place() {
        let mut tracks = MediaTrackManager::new();
        tracks.install(TrackRole::CameraVideo, camera("cam-1"), false, true);
        tracks.mark_attached(TrackRole::CameraVideo);

        let first = tracks.source(TrackRole::CameraVideo).unwrap().clone();
        let plan = tracks.install(TrackRole::CameraVideo, camera("cam-2"), true, true);

        assert_eq!(plan, TrackPlan::ReplaceInPlace);
        assert!(first.is_stopped());
    }

    #[test]
    fn test_unattached_role_needs_renegotiation() {
        let mut tracks = MediaTrackManager::new();
        let plan = tracks.install(TrackRole::ScreenVideo, camera("screen"), true, true);
        assert_eq!(plan, TrackPlan::Renegotiate { detach_first: false });
    }

    #[test]
    fn test_no_in_place_support_detaches_first() {
        let mut tracks = MediaTrackManager::new();
        tracks.install(TrackRole::CameraVideo, camera("cam-1"), false, false);
        tracks.mark_attached(TrackRole::CameraVideo);

        let plan = tracks.install(TrackRole::CameraVideo, camera("cam-2"), true, false);
        assert_eq!(plan, TrackPlan::Renegotiate { detach_first: true });
    }

    #[test]
    fn test_default_source_survives_replacement() {
        let mut tracks = MediaTrackManager::new();
        let cam = camera("cam");
        tracks.set_default(TrackRole::ScreenVideo, cam.clone());
        tracks.install(TrackRole::ScreenVideo, cam.clone(), false, true);
        tracks.install(TrackRole::ScreenVideo, camera("screen"), false, true);

        assert!(!cam.is_stopped());
    }

    #[test]
    fn test_release_session_keeps_sources() {
        let mut tracks = MediaTrackManager::new();
        let mic = MediaSource::new("mic", MediaKind::Audio, "Mic");
        tracks.install(TrackRole::MicrophoneAudio, mic, false, true);
        tracks.mark_attached(TrackRole::MicrophoneAudio);

        tracks.release_session();

        assert!(!tracks.is_attached(TrackRole::MicrophoneAudio));
        assert!(tracks.source(TrackRole::MicrophoneAudio).is_some());
    }

    #[test]
    fn test_removing_default_source_forgets_it() {
        let mut tracks = MediaTrackManager::new();
        let cam = camera("cam");
        tracks.set_default(TrackRole::CameraVideo, cam.clone());
        tracks.install(TrackRole::CameraVideo, cam.clone(), false, true);

        let removed = tracks.remove(TrackRole::CameraVideo).unwrap();

        assert_eq!(removed, cam);
        assert!(cam.is_stopped());
        assert!(tracks.default_for(TrackRole::CameraVideo).is_none());
    }

    #[test]
    fn test_disabled_role_carries_over_to_new_source() {
        let mut tracks = MediaTrackManager::new();
        let first = camera("cam-1");
        tracks.install(TrackRole::CameraVideo, first.clone(), false, true);

        assert!(tracks.set_enabled(TrackRole::CameraVideo, false).is_some());
        assert!(!first.is_enabled());
        assert!(!first.is_stopped());

        let second = camera("cam-2");
        tracks.install(TrackRole::CameraVideo, second.clone(), false, true);
        assert!(!second.is_enabled());

        tracks.set_enabled(TrackRole::CameraVideo, true);
        assert!(second.is_enabled());
        assert!(tracks.set_enabled(TrackRole::ScreenVideo, false).is_none());
    }
}
