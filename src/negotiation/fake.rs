//! In-Memory Peer Transport für Tests
//!
//! Zeichnet alle Aufrufe auf und simuliert Candidates, Remote-Tracks und
//! den Verbindungsaufbau, sobald beide Descriptions gesetzt sind.

use super::transport::{
    ConnectionState, DescriptionKind, PeerTransport, PeerTransportFactory, SessionDescription,
    TransportError, TransportEvent, TransportEventSink,
};
use crate::media::{MediaHandle, MediaSource, TrackRole};
use crate::signaling::{SignalingEnvelope, SignalingTransport};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum FakeCall {
    CreateOffer,
    CreateAnswer,
    SetRemote(DescriptionKind),
    Rollback,
    AddCandidate(String),
    Attach(TrackRole, String),
    Replace(TrackRole, Option<String>),
    Detach(TrackRole),
    Close,
}

#[derive(Default)]
struct FakeState {
    senders: BTreeMap<TrackRole, Option<String>>,
    local_set: bool,
    remote_set: bool,
    connected: bool,
    gathered: bool,
    remote_roles: BTreeSet<TrackRole>,
}

pub(crate) struct FakeTransport {
    name: String,
    log: Arc<Mutex<Vec<FakeCall>>>,
    state: Mutex<FakeState>,
    events: TransportEventSink,
    fail_remote: Arc<AtomicBool>,
}

impl FakeTransport {
    fn local_sdp(&self) -> String {
        let state = self.state.lock();
        let roles: Vec<&str> = state.senders.keys().map(|role| role.as_str()).collect();
        format!("fake:{}:{}", self.name, roles.join(","))
    }

    fn after_local_description(&self) {
        let (gather, connect) = {
            let mut state = self.state.lock();
            state.local_set = true;
            let gather = !std::mem::replace(&mut state.gathered, true);
            (gather, Self::check_connected(&mut state))
        };

        if gather {
            for n in 1..=2 {
                (self.events)(TransportEvent::LocalCandidate(format!("{}-cand-{}", self.name, n)));
            }
        }
        if connect {
            (self.events)(TransportEvent::StateChanged(ConnectionState::Connected));
        }
    }

    fn check_connected(state: &mut FakeState) -> bool {
        if state.local_set && state.remote_set && !state.connected {
            state.connected = true;
            true
        } else {
            false
        }
    }
}

#[async_trait]
impl PeerTransport for FakeTransport {
    async fn create_offer(&self) -> Result<String, TransportError> {
        self.log.lock().push(FakeCall::CreateOffer);
        let sdp = self.local_sdp();
        self.after_local_description();
        Ok(sdp)
    }

    async fn create_answer(&self) -> Result<String, TransportError> {
        self.log.lock().push(FakeCall::CreateAnswer);
        let sdp = self.local_sdp();
        self.after_local_description();
        Ok(sdp)
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        self.log.lock().push(FakeCall::SetRemote(desc.kind));
        if self.fail_remote.load(Ordering::SeqCst) {
            return Err(TransportError::InvalidSdp("injected failure".to_string()));
        }

        let mut parts = desc.sdp.splitn(3, ':');
        parts.next();
        let peer = parts.next().unwrap_or_default();
        let roles = parts.next().unwrap_or_default();

        let (new_roles, connect) = {
            let mut state = self.state.lock();
            state.remote_set = true;
            let new_roles: Vec<TrackRole> = roles
                .split(',')
                .filter_map(|r| r.parse::<TrackRole>().ok())
                .filter(|role| state.remote_roles.insert(*role))
                .collect();
            (new_roles, Self::check_connected(&mut state))
        };

        for role in new_roles {
            (self.events)(TransportEvent::RemoteTrack {
                role,
                handle: MediaHandle {
                    track_id: role.as_str().to_string(),
                    stream_id: format!("{}-stream", peer),
                    kind: role.kind(),
                },
            });
        }
        if connect {
            (self.events)(TransportEvent::StateChanged(ConnectionState::Connected));
        }
        Ok(())
    }

    async fn rollback_local_offer(&self) -> Result<(), TransportError> {
        self.log.lock().push(FakeCall::Rollback);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &str) -> Result<(), TransportError> {
        if !self.state.lock().remote_set {
            return Err(TransportError::InvalidCandidate(
                "remote description not set".to_string(),
            ));
        }
        self.log.lock().push(FakeCall::AddCandidate(candidate.to_string()));
        Ok(())
    }

    async fn attach_track(
        &self,
        role: TrackRole,
        source: &MediaSource,
    ) -> Result<(), TransportError> {
        self.log.lock().push(FakeCall::Attach(role, source.id().to_string()));
        self.state.lock().senders.insert(role, Some(source.id().to_string()));
        Ok(())
    }

    async fn replace_track(
        &self,
        role: TrackRole,
        source: Option<&MediaSource>,
    ) -> Result<(), TransportError> {
        let id = source.map(|s| s.id().to_string());
        self.log.lock().push(FakeCall::Replace(role, id.clone()));
        match self.state.lock().senders.get_mut(&role) {
            Some(slot) => {
                *slot = id;
                Ok(())
            }
            None => Err(TransportError::NoSender(role)),
        }
    }

    async fn detach_track(&self, role: TrackRole) -> Result<(), TransportError> {
        self.log.lock().push(FakeCall::Detach(role));
        self.state.lock().senders.remove(&role);
        Ok(())
    }

    async fn close(&self) {
        self.log.lock().push(FakeCall::Close);
    }
}

/// Factory, deren Transports alle in dasselbe Log schreiben
pub(crate) struct FakeTransportFactory {
    name: String,
    log: Arc<Mutex<Vec<FakeCall>>>,
    in_place: bool,
    fail_remote: Arc<AtomicBool>,
}

impl FakeTransportFactory {
    pub(crate) fn new(name: &str, in_place: bool) -> Self {
        Self {
            name: name.to_string(),
            log: Arc::new(Mutex::new(Vec::new())),
            in_place,
            fail_remote: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn log_handle(&self) -> Arc<Mutex<Vec<FakeCall>>> {
        Arc::clone(&self.log)
    }

    pub(crate) fn fail_remote_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.fail_remote)
    }
}

#[async_trait]
impl PeerTransportFactory for FakeTransportFactory {
    async fn create(
        &self,
        events: TransportEventSink,
    ) -> Result<Arc<dyn PeerTransport>, TransportError> {
        Ok(Arc::new(FakeTransport {
            name: self.name.clone(),
            log: Arc::clone(&self.log),
            state: Mutex::new(FakeState::default()),
            events,
            fail_remote: Arc::clone(&self.fail_remote),
        }))
    }

    fn supports_in_place_replacement(&self) -> bool {
        self.in_place
    }
}

/// Signaling-Transport, der alle Envelopes in einen Channel schreibt
pub(crate) struct ChannelSignaling {
    tx: mpsc::UnboundedSender<SignalingEnvelope>,
}

impl ChannelSignaling {
    pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<SignalingEnvelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl SignalingTransport for ChannelSignaling {
    fn send(&self, envelope: SignalingEnvelope) {
        let _ = self.tx.send(envelope);
    }
}
