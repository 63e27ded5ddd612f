//! WebRTC Peer Transport
//!
//! `PeerTransport`-Implementierung auf Basis von webrtc-rs. Jede Session
//! bekommt eine eigene `RTCPeerConnection` mit Default-Codecs und
//! -Interceptors.

use super::transport::{
    ConnectionState, DescriptionKind, PeerTransport, PeerTransportFactory, SessionDescription,
    TransportError, TransportEvent, TransportEventSink,
};
use crate::config::IceServerConfig;
use crate::media::{MediaHandle, MediaKind, MediaSource, TrackRole};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Sample Rate für Opus
const AUDIO_CLOCK_RATE: u32 = 48000;

/// RTP Clock Rate für Video
const VIDEO_CLOCK_RATE: u32 = 90000;

/// Stream-ID aller lokalen Tracks
const LOCAL_STREAM_ID: &str = "pulse-call";

fn webrtc_error(e: webrtc::Error) -> TransportError {
    TransportError::WebRtc(e.to_string())
}

// ============================================================================
// MEDIA TRACK REGISTRY
// ============================================================================

/// Zugriff auf die RTP-Tracks der laufenden Session
///
/// Die lokale Erfassung schreibt Pakete in die lokalen Tracks, die
/// Wiedergabe liest aus den Remote-Tracks.
#[derive(Clone, Default)]
pub struct RtcMediaTracks {
    local: Arc<Mutex<HashMap<TrackRole, Arc<TrackLocalStaticRTP>>>>,
    remote: Arc<Mutex<HashMap<TrackRole, Arc<TrackRemote>>>>,
}

impl RtcMediaTracks {
    pub fn local(&self, role: TrackRole) -> Option<Arc<TrackLocalStaticRTP>> {
        self.local.lock().get(&role).cloned()
    }

    pub fn remote(&self, role: TrackRole) -> Option<Arc<TrackRemote>> {
        self.remote.lock().get(&role).cloned()
    }

    fn insert_local(&self, role: TrackRole, track: Arc<TrackLocalStaticRTP>) {
        self.local.lock().insert(role, track);
    }

    fn insert_remote(&self, role: TrackRole, track: Arc<TrackRemote>) {
        self.remote.lock().insert(role, track);
    }

    /// Entfernt aus `self` alle Tracks, die `owned` eingetragen hat und die
    /// noch nicht von einer neueren Peer Connection ersetzt wurden
    fn release(&self, owned: &RtcMediaTracks) {
        let local = std::mem::take(&mut *owned.local.lock());
        for (role, track) in local {
            remove_if_same(&self.local, role, &track);
        }

        let remote = std::mem::take(&mut *owned.remote.lock());
        for (role, track) in remote {
            remove_if_same(&self.remote, role, &track);
        }
    }

    /// Wie `release`, aber nur für den lokalen Track einer Rolle
    fn release_local(&self, owned: &RtcMediaTracks, role: TrackRole) {
        if let Some(track) = owned.local.lock().remove(&role) {
            remove_if_same(&self.local, role, &track);
        }
    }
}

fn remove_if_same<T>(map: &Mutex<HashMap<TrackRole, Arc<T>>>, role: TrackRole, track: &Arc<T>) {
    let mut map = map.lock();
    if map.get(&role).is_some_and(|current| Arc::ptr_eq(current, track)) {
        map.remove(&role);
    }
}

// ============================================================================
// FACTORY
// ============================================================================

/// Erzeugt WebRTC Peer Connections mit den konfigurierten ICE-Servern
pub struct RtcTransportFactory {
    ice_servers: Vec<RTCIceServer>,
    media: RtcMediaTracks,
}

impl RtcTransportFactory {
    pub fn new(ice_servers: &[IceServerConfig]) -> Self {
        let ice_servers = ice_servers
            .iter()
            .map(|server| RTCIceServer {
                urls: server.urls.clone(),
                username: server.username.clone().unwrap_or_default(),
                credential: server.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect();

        Self {
            ice_servers,
            media: RtcMediaTracks::default(),
        }
    }

    pub fn media(&self) -> RtcMediaTracks {
        self.media.clone()
    }
}

#[async_trait]
impl PeerTransportFactory for RtcTransportFactory {
    async fn create(
        &self,
        events: TransportEventSink,
    ) -> Result<Arc<dyn PeerTransport>, TransportError> {
        let media = self.media.clone();
        let transport = RtcPeerTransport::new(self.ice_servers.clone(), events, media).await?;
        Ok(Arc::new(transport))
    }

    fn supports_in_place_replacement(&self) -> bool {
        true
    }
}

// ============================================================================
// PEER TRANSPORT
// ============================================================================

/// Eine WebRTC Peer Connection
pub struct RtcPeerTransport {
    pc: Arc<RTCPeerConnection>,
    senders: Mutex<HashMap<TrackRole, Arc<RTCRtpSender>>>,
    /// Registry aller Sessions, geteilt mit der Factory
    media: RtcMediaTracks,
    /// Nur die Tracks dieser Peer Connection
    owned: RtcMediaTracks,
}

impl RtcPeerTransport {
    async fn new(
        ice_servers: Vec<RTCIceServer>,
        events: TransportEventSink,
        media: RtcMediaTracks,
    ) -> Result<Self, TransportError> {
        // Media Engine mit Default-Codecs (Opus, VP8, ...)
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(webrtc_error)?;

        // Interceptors für RTCP, NACK etc.
        let mut registry = Registry::new();
        registry =
            register_default_interceptors(registry, &mut media_engine).map_err(webrtc_error)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(config).await.map_err(webrtc_error)?);

        let transport = Self {
            pc,
            senders: Mutex::new(HashMap::new()),
            media,
            owned: RtcMediaTracks::default(),
        };
        transport.setup_handlers(events);
        Ok(transport)
    }

    /// Registriert Event Handler für die Peer Connection
    fn setup_handlers(&self, events: TransportEventSink) {
        let sink = Arc::clone(&events);
        self.pc
            .on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                tracing::info!("Peer connection state: {:?}", s);

                let state = match s {
                    RTCPeerConnectionState::Connecting => Some(ConnectionState::Connecting),
                    RTCPeerConnectionState::Connected => Some(ConnectionState::Connected),
                    RTCPeerConnectionState::Disconnected => Some(ConnectionState::Disconnected),
                    RTCPeerConnectionState::Failed => Some(ConnectionState::Failed),
                    RTCPeerConnectionState::Closed => Some(ConnectionState::Closed),
                    _ => None,
                };
                if let Some(state) = state {
                    sink(TransportEvent::StateChanged(state));
                }

                Box::pin(async {})
            }));

        // Lokale Candidates werden einzeln weitergereicht, sobald sie anfallen
        let sink = Arc::clone(&events);
        self.pc.on_ice_candidate(Box::new(move |candidate| {
            if let Some(c) = candidate {
                match c.to_json().map(|init| serde_json::to_string(&init)) {
                    Ok(Ok(json)) => sink(TransportEvent::LocalCandidate(json)),
                    Ok(Err(e)) => tracing::warn!("Failed to encode ICE candidate: {}", e),
                    Err(e) => tracing::warn!("Failed to convert ICE candidate: {}", e),
                }
            }
            Box::pin(async {})
        }));

        let sink = events;
        let media = self.media.clone();
        let owned = self.owned.clone();
        self.pc.on_track(Box::new(move |track, _, _| {
            let role = track.id().parse::<TrackRole>().unwrap_or(match track.kind() {
                RTPCodecType::Audio => TrackRole::MicrophoneAudio,
                _ => TrackRole::CameraVideo,
            });
            let handle = MediaHandle {
                track_id: track.id(),
                stream_id: track.stream_id(),
                kind: role.kind(),
            };
            tracing::info!("Received remote track {} ({:?})", handle.track_id, track.codec());

            owned.insert_remote(role, Arc::clone(&track));
            media.insert_remote(role, track);
            sink(TransportEvent::RemoteTrack { role, handle });
            Box::pin(async {})
        }));
    }

    fn local_track(role: TrackRole, source: &MediaSource) -> Arc<TrackLocalStaticRTP> {
        let capability = match source.kind() {
            MediaKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: AUDIO_CLOCK_RATE,
                channels: 1,
                ..Default::default()
            },
            MediaKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_string(),
                clock_rate: VIDEO_CLOCK_RATE,
                ..Default::default()
            },
        };

        Arc::new(TrackLocalStaticRTP::new(
            capability,
            role.as_str().to_string(),
            LOCAL_STREAM_ID.to_string(),
        ))
    }

    fn sender(&self, role: TrackRole) -> Result<Arc<RTCRtpSender>, TransportError> {
        self.senders
            .lock()
            .get(&role)
            .cloned()
            .ok_or(TransportError::NoSender(role))
    }

    fn publish_local(&self, role: TrackRole, track: Arc<TrackLocalStaticRTP>) {
        self.owned.insert_local(role, Arc::clone(&track));
        self.media.insert_local(role, track);
    }
}

#[async_trait]
impl PeerTransport for RtcPeerTransport {
    async fn create_offer(&self) -> Result<String, TransportError> {
        let offer = self.pc.create_offer(None).await.map_err(webrtc_error)?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(webrtc_error)?;
        Ok(offer.sdp)
    }

    async fn create_answer(&self) -> Result<String, TransportError> {
        let answer = self.pc.create_answer(None).await.map_err(webrtc_error)?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(webrtc_error)?;
        Ok(answer.sdp)
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        let description = match desc.kind {
            DescriptionKind::Offer => RTCSessionDescription::offer(desc.sdp),
            DescriptionKind::Answer => RTCSessionDescription::answer(desc.sdp),
        }
        .map_err(|e| TransportError::InvalidSdp(e.to_string()))?;

        self.pc
            .set_remote_description(description)
            .await
            .map_err(webrtc_error)
    }

    async fn rollback_local_offer(&self) -> Result<(), TransportError> {
        let pending = self
            .pc
            .pending_local_description()
            .await
            .ok_or_else(|| TransportError::WebRtc("no pending local offer".to_string()))?;

        let mut rollback = RTCSessionDescription::default();
        rollback.sdp_type = RTCSdpType::Rollback;
        rollback.sdp = pending.sdp;
        self.pc
            .set_local_description(rollback)
            .await
            .map_err(webrtc_error)
    }

    async fn add_ice_candidate(&self, candidate: &str) -> Result<(), TransportError> {
        let candidate: RTCIceCandidateInit = serde_json::from_str(candidate)
            .map_err(|e| TransportError::InvalidCandidate(e.to_string()))?;

        self.pc.add_ice_candidate(candidate).await.map_err(webrtc_error)
    }

    async fn attach_track(
        &self,
        role: TrackRole,
        source: &MediaSource,
    ) -> Result<(), TransportError> {
        let track = Self::local_track(role, source);
        let local: Arc<dyn TrackLocal + Send + Sync> = track.clone();
        let sender = self.pc.add_track(local).await.map_err(webrtc_error)?;

        tracing::debug!("Attached {} track from source {}", role, source.id());
        self.senders.lock().insert(role, sender);
        self.publish_local(role, track);
        Ok(())
    }

    async fn replace_track(
        &self,
        role: TrackRole,
        source: Option<&MediaSource>,
    ) -> Result<(), TransportError> {
        let sender = self.sender(role)?;

        match source {
            Some(source) => {
                let track = Self::local_track(role, source);
                let local: Arc<dyn TrackLocal + Send + Sync> = track.clone();
                sender.replace_track(Some(local)).await.map_err(webrtc_error)?;
                self.publish_local(role, track);
            }
            None => {
                sender.replace_track(None).await.map_err(webrtc_error)?;
                self.media.release_local(&self.owned, role);
            }
        }

        tracing::debug!("Replaced {} track in place", role);
        Ok(())
    }

    async fn detach_track(&self, role: TrackRole) -> Result<(), TransportError> {
        let sender = self.sender(role)?;
        self.pc.remove_track(&sender).await.map_err(webrtc_error)?;
        self.senders.lock().remove(&role);
        self.media.release_local(&self.owned, role);
        Ok(())
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            tracing::warn!("Failed to close peer connection: {}", e);
        }
        self.senders.lock().clear();
        self.media.release(&self.owned);
    }
}
